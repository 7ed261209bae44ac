use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};

use crate::hardware::HardwareMap;

pub const DEFAULT_NETDATA_PORT: u16 = 19999;
pub const DEFAULT_POINTS_PER_DAY: u32 = 144;
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 8;

/// A monitored host and where its Netdata agent listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    pub fn netdata_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Parse `name=host[:port]`.
    pub fn parse(entry: &str) -> Result<Self, String> {
        let (name, addr) = entry
            .trim()
            .split_once('=')
            .ok_or_else(|| format!("invalid node '{entry}', expected name=host[:port]"))?;
        let name = name.trim();
        let addr = addr.trim();
        if name.is_empty() || addr.is_empty() {
            return Err(format!("invalid node '{entry}', expected name=host[:port]"));
        }
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in node '{entry}'"))?;
                (host, port)
            }
            None => (addr, DEFAULT_NETDATA_PORT),
        };
        Ok(Self::new(name, host, port))
    }
}

pub fn default_nodes() -> Vec<NodeConfig> {
    vec![
        NodeConfig::new("colab-gpu1", "192.168.10.103", DEFAULT_NETDATA_PORT),
        NodeConfig::new("colab-gpu2", "192.168.10.104", DEFAULT_NETDATA_PORT),
        NodeConfig::new("colab-gpu3", "192.168.10.105", DEFAULT_NETDATA_PORT),
        NodeConfig::new("colab-gpu4", "192.168.10.106", DEFAULT_NETDATA_PORT),
    ]
}

/// Management API access. No token means attribution is disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementConfig {
    pub url: String,
    pub bearer_token: Option<String>,
}

impl ManagementConfig {
    pub fn enabled(&self) -> bool {
        self.bearer_token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// The single wall-clock convention used for fetch windows, management API
/// query strings and rendered datetimes. The host's local timezone is never
/// consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeConvention {
    offset: FixedOffset,
}

/// Inclusive `[00:00:00, 23:59:59]` window of one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub day: NaiveDate,
    pub after: i64,
    pub before: i64,
}

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl TimeConvention {
    pub fn from_offset_hours(hours: i32) -> Option<Self> {
        FixedOffset::east_opt(hours.checked_mul(3600)?).map(|offset| Self { offset })
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn day_window(&self, day: NaiveDate) -> DayWindow {
        let start = self.at(day, NaiveTime::MIN);
        DayWindow {
            day,
            after: start.timestamp(),
            before: start.timestamp() + 86_399,
        }
    }

    /// `start_t` / `end_t` strings for the management API.
    pub fn query_strings(&self, day: NaiveDate) -> (String, String) {
        let window = self.day_window(day);
        (self.format_timestamp(window.after), self.format_timestamp(window.before))
    }

    pub fn format_timestamp(&self, ts: i64) -> String {
        match DateTime::from_timestamp(ts, 0) {
            Some(dt) => dt.with_timezone(&self.offset).format(DATETIME_FORMAT).to_string(),
            None => String::new(),
        }
    }

    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }

    fn at(&self, day: NaiveDate, time: NaiveTime) -> DateTime<FixedOffset> {
        // A fixed offset has no gaps or folds, so the mapping is always single.
        self.offset
            .from_local_datetime(&day.and_time(time))
            .single()
            .unwrap_or_else(|| day.and_time(time).and_utc().with_timezone(&self.offset))
    }
}

impl Default for TimeConvention {
    fn default() -> Self {
        Self::from_offset_hours(DEFAULT_UTC_OFFSET_HOURS).unwrap_or_else(Self::utc)
    }
}

/// Process-wide configuration, built once at startup and passed by
/// reference to every component.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub nodes: Vec<NodeConfig>,
    pub hardware: HardwareMap,
    pub management: ManagementConfig,
    pub request_timeout: Duration,
    pub data_dir: PathBuf,
    pub plots_dir: PathBuf,
    pub points_per_day: u32,
    pub time: TimeConvention,
}

impl CollectorConfig {
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("no nodes configured".to_string());
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(format!("duplicate node name {}", node.name));
            }
        }
        if self.hardware.is_empty() {
            return Err("no GPU card ids configured".to_string());
        }
        if self.points_per_day == 0 {
            return Err("points per day must be positive".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("request timeout must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            hardware: HardwareMap::default(),
            management: ManagementConfig {
                url: "http://192.168.10.100/api/v2/consumption/task".to_string(),
                bearer_token: None,
            },
            request_timeout: Duration::from_secs(30),
            data_dir: PathBuf::from("./data"),
            plots_dir: PathBuf::from("./plots"),
            points_per_day: DEFAULT_POINTS_PER_DAY,
            time: TimeConvention::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_parse() {
        assert_eq!(
            NodeConfig::parse("colab-gpu1=192.168.10.103").unwrap(),
            NodeConfig::new("colab-gpu1", "192.168.10.103", 19999)
        );
        assert_eq!(
            NodeConfig::parse(" n = 127.0.0.1:8080 ").unwrap(),
            NodeConfig::new("n", "127.0.0.1", 8080)
        );
        assert!(NodeConfig::parse("no-address").is_err());
        assert!(NodeConfig::parse("n=host:notaport").is_err());
        assert_eq!(
            NodeConfig::parse("n=10.0.0.1").unwrap().netdata_url(),
            "http://10.0.0.1:19999"
        );
    }

    #[test]
    fn test_day_window_utc8() {
        let tc = TimeConvention::from_offset_hours(8).unwrap();
        let day = NaiveDate::from_ymd_opt(2025, 9, 15).unwrap();
        let w = tc.day_window(day);
        // 2025-09-15 00:00:00 +08:00 == 2025-09-14 16:00:00 UTC
        assert_eq!(w.after, 1_757_865_600);
        assert_eq!(w.before - w.after, 86_399);
        assert_eq!(tc.format_timestamp(w.after), "2025-09-15 00:00:00");
        assert_eq!(tc.format_timestamp(w.before), "2025-09-15 23:59:59");
    }

    #[test]
    fn test_query_strings() {
        let tc = TimeConvention::utc();
        let day = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        assert_eq!(
            tc.query_strings(day),
            ("2025-01-02 00:00:00".to_string(), "2025-01-02 23:59:59".to_string())
        );
    }

    #[test]
    fn test_offset_bounds() {
        assert!(TimeConvention::from_offset_hours(25).is_none());
        assert!(TimeConvention::from_offset_hours(-5).is_some());
    }

    #[test]
    fn test_validate() {
        let mut cfg = CollectorConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.nodes.push(cfg.nodes[0].clone());
        assert!(cfg.validate().is_err());

        let cfg = CollectorConfig {
            points_per_day: 0,
            ..CollectorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_management_enabled() {
        let mut m = CollectorConfig::default().management;
        assert!(!m.enabled());
        m.bearer_token = Some("  ".into());
        assert!(!m.enabled());
        m.bearer_token = Some("tok".into());
        assert!(m.enabled());
    }
}

//! Reading back stored average files.
//!
//! Files written by older collectors differ from the current layout: some
//! lack the user column, and column names vary. Both are accepted here.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;

use gpulog_common::{mean, UNUSED_USER};

use crate::aggregate::OVERALL_LABEL;
use crate::export::{average_file_name, node_day_dir, NOT_AVAILABLE};

const GPU_ALIASES: &[&str] = &["GPU編號", "gpu", "gpu_id", "GPU"];
const UTIL_ALIASES: &[&str] = &["平均GPU使用率(%)", "usage", "gpu_usage", "GPU使用率", "平均GPU使用率"];
const VRAM_ALIASES: &[&str] = &["平均VRAM使用率(%)", "vram_usage", "vram", "VRAM使用率", "平均VRAM使用率"];
const USER_ALIASES: &[&str] = &["使用者", "user", "username", "使用者名稱"];

/// Utilization above this counts as activity.
pub const ACTIVE_THRESHOLD_PCT: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredAverageRow {
    pub gpu: String,
    pub avg_utilization_pct: Option<f64>,
    pub avg_vram_pct: Option<f64>,
    pub user: String,
}

impl StoredAverageRow {
    pub fn is_active(&self) -> bool {
        self.avg_utilization_pct.is_some_and(|u| u > ACTIVE_THRESHOLD_PCT)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AverageFile {
    pub rows: Vec<StoredAverageRow>,
    pub overall: Option<StoredAverageRow>,
    /// False for files from collectors that did not record users.
    pub has_user_column: bool,
}

#[derive(Debug, Clone, Copy)]
struct Columns {
    gpu: usize,
    util: usize,
    vram: usize,
    user: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        let find = |aliases: &[&str]| {
            aliases
                .iter()
                .find_map(|a| headers.iter().position(|h| h.trim() == *a))
        };
        match (find(GPU_ALIASES), find(UTIL_ALIASES), find(VRAM_ALIASES)) {
            (Some(gpu), Some(util), Some(vram)) => Self {
                gpu,
                util,
                vram,
                user: find(USER_ALIASES),
            },
            // Unknown names: fall back to position.
            _ => Self {
                gpu: 0,
                util: 1,
                vram: 2,
                user: (headers.len() >= 4).then_some(3),
            },
        }
    }
}

fn parse_value(cell: Option<&str>) -> Option<f64> {
    let cell = cell?.trim();
    if cell.is_empty() || cell == NOT_AVAILABLE {
        return None;
    }
    cell.parse().ok()
}

pub fn read_average_file(path: &Path) -> anyhow::Result<AverageFile> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;

    let columns = Columns::from_headers(reader.headers()?);
    let mut file = AverageFile {
        has_user_column: columns.user.is_some(),
        ..AverageFile::default()
    };

    for record in reader.records() {
        let record = record.with_context(|| format!("read {}", path.display()))?;
        let Some(gpu) = record.get(columns.gpu).map(str::trim) else {
            continue;
        };
        if gpu.is_empty() {
            continue;
        }
        let user = columns
            .user
            .and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(UNUSED_USER)
            .to_string();
        let row = StoredAverageRow {
            gpu: gpu.to_string(),
            avg_utilization_pct: parse_value(record.get(columns.util)),
            avg_vram_pct: parse_value(record.get(columns.vram)),
            user,
        };
        if row.gpu.contains(OVERALL_LABEL) {
            file.overall = Some(row);
        } else {
            file.rows.push(row);
        }
    }
    Ok(file)
}

/// Loads the average file of a node-day. A missing file is `None`; an
/// unreadable one is logged and treated the same.
fn load_node_day(data_root: &Path, node: &str, day: NaiveDate) -> Option<AverageFile> {
    let path = node_day_dir(data_root, node, day).join(average_file_name(day));
    if !path.is_file() {
        return None;
    }
    match read_average_file(&path) {
        Ok(file) => {
            if !file.has_user_column {
                tracing::warn!(path=%path.display(), "average file has no user column, rows count as unused");
            }
            Some(file)
        }
        Err(e) => {
            tracing::warn!(path=%path.display(), error=%e, "skipping unreadable average file");
            None
        }
    }
}

/// Inclusive list of days from `from` to `to`.
pub fn days_between(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    from.iter_days().take_while(|d| *d <= to).collect()
}

/// One GPU-day attributed to a user.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEntry {
    pub day: NaiveDate,
    pub node: String,
    pub gpu: String,
    pub utilization_pct: Option<f64>,
    pub vram_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserUsageReport {
    pub username: String,
    pub entries: Vec<UsageEntry>,
}

impl UserUsageReport {
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn active(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.utilization_pct.is_some_and(|u| u > ACTIVE_THRESHOLD_PCT))
            .count()
    }

    pub fn avg_utilization(&self) -> Option<f64> {
        mean(self.entries.iter().filter_map(|e| e.utilization_pct))
    }

    pub fn avg_vram(&self) -> Option<f64> {
        mean(self.entries.iter().filter_map(|e| e.vram_pct))
    }

    pub fn peak_utilization(&self) -> Option<f64> {
        self.entries.iter().filter_map(|e| e.utilization_pct).reduce(f64::max)
    }

    pub fn peak_vram(&self) -> Option<f64> {
        self.entries.iter().filter_map(|e| e.vram_pct).reduce(f64::max)
    }

    pub fn nodes_used(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.node.as_str()).collect()
    }

    /// Distinct `node:gpu` pairs.
    pub fn gpus_used(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .map(|e| format!("{}:{}", e.node, e.gpu))
            .collect()
    }
}

/// Every stored GPU-day attributed to `username` over `days` on `nodes`.
pub fn user_usage(data_root: &Path, username: &str, days: &[NaiveDate], nodes: &[String]) -> UserUsageReport {
    let mut entries = Vec::new();
    for node in nodes {
        for &day in days {
            let Some(file) = load_node_day(data_root, node, day) else {
                continue;
            };
            entries.extend(file.rows.into_iter().filter(|r| r.user == username).map(|r| UsageEntry {
                day,
                node: node.clone(),
                gpu: r.gpu,
                utilization_pct: r.avg_utilization_pct,
                vram_pct: r.avg_vram_pct,
            }));
        }
    }
    entries.sort_by(|a, b| (a.day, &a.node, &a.gpu).cmp(&(b.day, &b.node, &b.gpu)));
    UserUsageReport {
        username: username.to_string(),
        entries,
    }
}

/// Users with an active GPU on `day`, each with the GPUs they held.
/// Files without a user column contribute nothing.
pub fn users_on(data_root: &Path, day: NaiveDate, nodes: &[String]) -> BTreeMap<String, Vec<UsageEntry>> {
    let mut users: BTreeMap<String, Vec<UsageEntry>> = BTreeMap::new();
    for node in nodes {
        let Some(file) = load_node_day(data_root, node, day) else {
            continue;
        };
        if !file.has_user_column {
            continue;
        }
        for row in file.rows {
            if row.user == UNUSED_USER || !row.is_active() {
                continue;
            }
            users.entry(row.user).or_default().push(UsageEntry {
                day,
                node: node.clone(),
                gpu: row.gpu,
                utilization_pct: row.avg_utilization_pct,
                vram_pct: row.avg_vram_pct,
            });
        }
    }
    users
}

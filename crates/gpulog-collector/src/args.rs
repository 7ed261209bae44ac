use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use gpulog_common::config::{default_nodes, DEFAULT_POINTS_PER_DAY, DEFAULT_UTC_OFFSET_HOURS};
use gpulog_common::hardware::DEFAULT_CARD_IDS;
use gpulog_common::{CollectorConfig, HardwareMap, ManagementConfig, NodeConfig, TimeConvention};

#[derive(Debug, Parser)]
#[command(name = "gpulog")]
#[command(about = "Daily GPU utilization collector for Netdata-monitored nodes", long_about = None)]
pub struct Args {
    /// Monitored nodes as name=host[:port], comma separated
    #[arg(long = "node-table", env = "GPULOG_NODES", value_delimiter = ',', global = true)]
    pub node_table: Vec<String>,

    /// Netdata card ids; the position in the list is the logical GPU index
    #[arg(long, env = "GPULOG_CARD_IDS", value_delimiter = ',', global = true)]
    pub card_ids: Vec<u32>,

    #[arg(
        long,
        env = "MANAGEMENT_API_URL",
        default_value = "http://192.168.10.100/api/v2/consumption/task",
        global = true
    )]
    pub management_url: String,

    /// Management API token (Authorization: Bearer). Unset disables attribution.
    #[arg(long, env = "MANAGEMENT_API_TOKEN", hide_env_values = true, global = true)]
    pub management_token: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, env = "API_TIMEOUT", default_value_t = 30, global = true)]
    pub api_timeout: u64,

    #[arg(long, env = "DATA_DIR", default_value = "./data", global = true)]
    pub data_dir: PathBuf,

    #[arg(long, env = "PLOTS_DIR", default_value = "./plots", global = true)]
    pub plots_dir: PathBuf,

    /// Points requested per chart per day
    #[arg(long, env = "DATA_POINTS", default_value_t = DEFAULT_POINTS_PER_DAY, global = true)]
    pub data_points: u32,

    /// Fixed UTC offset used for day windows and rendered datetimes
    #[arg(
        long,
        env = "GPULOG_UTC_OFFSET_HOURS",
        default_value_t = DEFAULT_UTC_OFFSET_HOURS,
        allow_negative_numbers = true,
        global = true
    )]
    pub utc_offset_hours: i32,

    /// OTLP/HTTP endpoint for span export
    #[arg(long, env = "GPULOG_OTLP_ENDPOINT", global = true)]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "GPULOG_OTLP_TOKEN", hide_env_values = true, global = true)]
    pub otlp_token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Collect one day for all (or the selected) nodes and write its CSVs
    Collect {
        /// Day to collect (YYYY-MM-DD); defaults to today
        date: Option<NaiveDate>,
        /// Only these nodes, comma separated
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,
    },
    /// Report one user's GPU usage over a date range from stored averages
    Usage {
        user: String,
        from: NaiveDate,
        /// Last day, inclusive; defaults to FROM
        to: Option<NaiveDate>,
    },
    /// List users with an active GPU on a day
    Users { date: NaiveDate },
}

impl Args {
    /// Build the process configuration. Called once at startup.
    pub fn collector_config(&self) -> anyhow::Result<CollectorConfig> {
        let nodes = if self.node_table.is_empty() {
            default_nodes()
        } else {
            self.node_table
                .iter()
                .map(|s| NodeConfig::parse(s))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| anyhow!(e))?
        };

        let hardware = if self.card_ids.is_empty() {
            HardwareMap::from_ordered_cards(&DEFAULT_CARD_IDS)
        } else {
            HardwareMap::from_ordered_cards(&self.card_ids)
        }
        .map_err(|e| anyhow!("invalid card ids: {e}"))?;

        let time = TimeConvention::from_offset_hours(self.utc_offset_hours)
            .ok_or_else(|| anyhow!("UTC offset out of range: {}", self.utc_offset_hours))?;

        let config = CollectorConfig {
            nodes,
            hardware,
            management: ManagementConfig {
                url: self.management_url.clone(),
                bearer_token: self.management_token.clone(),
            },
            request_timeout: Duration::from_secs(self.api_timeout),
            data_dir: self.data_dir.clone(),
            plots_dir: self.plots_dir.clone(),
            points_per_day: self.data_points,
            time,
        };
        config.validate().map_err(|e| anyhow!(e))?;
        Ok(config)
    }
}

/// Resolve `--nodes` against the configured table. Empty means all.
pub fn select_nodes(config: &CollectorConfig, names: &[String]) -> anyhow::Result<Vec<NodeConfig>> {
    if names.is_empty() {
        return Ok(config.nodes.clone());
    }
    let mut selected: Vec<NodeConfig> = Vec::with_capacity(names.len());
    for name in names {
        if selected.iter().any(|n| &n.name == name) {
            bail!("node '{name}' selected twice");
        }
        match config.node(name) {
            Some(node) => selected.push(node.clone()),
            None => bail!("unknown node '{name}'"),
        }
    }
    Ok(selected)
}

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use futures_util::future::join_all;

use gpulog_common::{
    mean, CollectError, CollectorConfig, DailyAverageRow, GpuDailyRecord, GpuIdentity, NodeConfig,
    Unit, UnitError,
};

use crate::export;
use crate::management::allocate_gpus;
use crate::source::{AttributionOutcome, AttributionSource, MetricSource};

pub const OVERALL_LABEL: &str = "全部平均";
pub const OVERALL_USER: &str = "所有使用者";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionStatus {
    Applied { tasks: usize },
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutcome {
    pub node: String,
    pub attempted: usize,
    pub collected: usize,
    pub written: bool,
}

impl NodeOutcome {
    pub fn fully_failed(&self) -> bool {
        self.collected == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub day: NaiveDate,
    pub nodes: Vec<NodeOutcome>,
    pub attribution: AttributionStatus,
}

impl RunSummary {
    pub fn gpus_collected(&self) -> usize {
        self.nodes.iter().map(|n| n.collected).sum()
    }

    pub fn gpus_failed(&self) -> usize {
        self.nodes.iter().map(|n| n.attempted.saturating_sub(n.collected)).sum()
    }

    pub fn nodes_written(&self) -> usize {
        self.nodes.iter().filter(|n| n.written).count()
    }

    pub fn node(&self, name: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|n| n.node == name)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} nodes written, {} GPUs collected, {} failed",
            self.day,
            self.nodes_written(),
            self.nodes.len(),
            self.gpus_collected(),
            self.gpus_failed()
        )?;
        for n in &self.nodes {
            if n.fully_failed() {
                write!(f, "; {} fully failed", n.node)?;
            } else if !n.written {
                write!(f, "; {} not written", n.node)?;
            }
        }
        Ok(())
    }
}

/// Everything one `collect_day` produced. Failures never abort the run;
/// they are listed in `errors` next to whatever did succeed.
#[derive(Debug)]
pub struct DayResult {
    pub day: NaiveDate,
    pub records: Vec<GpuDailyRecord>,
    pub errors: Vec<UnitError>,
    pub summary: RunSummary,
}

impl DayResult {
    /// Records of `node`, ascending by logical index.
    pub fn node_records(&self, node: &str) -> Vec<&GpuDailyRecord> {
        let mut out: Vec<_> = self.records.iter().filter(|r| r.node == node).collect();
        out.sort_by_key(|r| r.logical_index);
        out
    }
}

/// Per-GPU rows in ascending index order plus the node's overall row.
///
/// The overall value is the mean of the per-GPU means, skipping GPUs whose
/// mean is absent, so a GPU with sparser data carries the same weight as
/// any other.
pub fn daily_averages(records: &[&GpuDailyRecord]) -> (Vec<DailyAverageRow>, DailyAverageRow) {
    let mut sorted: Vec<&GpuDailyRecord> = records.to_vec();
    sorted.sort_by_key(|r| r.logical_index);
    let rows: Vec<DailyAverageRow> = sorted.iter().map(|r| DailyAverageRow::from_record(r)).collect();
    let overall = DailyAverageRow {
        gpu_label: OVERALL_LABEL.to_string(),
        avg_utilization_pct: mean(rows.iter().filter_map(|r| r.avg_utilization_pct)),
        avg_vram_pct: mean(rows.iter().filter_map(|r| r.avg_vram_pct)),
        user: OVERALL_USER.to_string(),
    };
    (rows, overall)
}

/// First occurrence of each node name. A node listed twice would otherwise
/// be fetched, counted and written twice.
fn unique_nodes(nodes: &[NodeConfig]) -> Vec<&NodeConfig> {
    let mut seen = HashSet::new();
    nodes
        .iter()
        .filter(|&n| {
            let first = seen.insert(n.name.as_str());
            if !first {
                tracing::warn!(node=%n.name, "node listed more than once, collecting it once");
            }
            first
        })
        .collect()
}

pub struct Collector<M, A> {
    config: Arc<CollectorConfig>,
    metrics: M,
    attribution: A,
}

impl<M: MetricSource, A: AttributionSource> Collector<M, A> {
    pub fn new(config: Arc<CollectorConfig>, metrics: M, attribution: A) -> Self {
        Self {
            config,
            metrics,
            attribution,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Fetch every GPU of every node in `nodes` for `day`, fetch the day's
    /// attribution once, and join the two. Nothing is written.
    pub async fn collect_day(&self, day: NaiveDate, nodes: &[NodeConfig]) -> DayResult {
        let cfg = &self.config;
        let window = cfg.time.day_window(day);
        let timeout = cfg.request_timeout;
        let mut errors = Vec::new();
        let nodes = unique_nodes(nodes);

        let mut jobs: Vec<(&NodeConfig, GpuIdentity)> = Vec::new();
        let mut attempted: Vec<usize> = vec![0; nodes.len()];
        for (pos, &node) in nodes.iter().enumerate() {
            for card_id in cfg.hardware.all_card_ids() {
                attempted[pos] += 1;
                match cfg.hardware.resolve(card_id) {
                    Ok(logical_index) => jobs.push((
                        node,
                        GpuIdentity {
                            node_name: node.name.clone(),
                            card_id,
                            logical_index,
                        },
                    )),
                    Err(e) => {
                        tracing::warn!(node=%node.name, card_id, error=%e, "skipping unmapped GPU");
                        errors.push(UnitError::new(
                            Unit::Gpu {
                                node: node.name.clone(),
                                logical_index: None,
                                card_id,
                            },
                            e,
                        ));
                    }
                }
            }
        }

        let fetches = jobs.into_iter().map(|(node, gpu)| async move {
            let result =
                match tokio::time::timeout(timeout, self.metrics.fetch_gpu_metrics(node, gpu.card_id, window))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(CollectError::FetchFailed {
                        node: node.name.clone(),
                        card_id: gpu.card_id,
                        chart: "*".to_string(),
                        cause: format!("timed out after {}s", timeout.as_secs_f64()),
                    }),
                };
            (gpu, result)
        });
        let attribution = async {
            match tokio::time::timeout(timeout, self.attribution.fetch_day_attribution(day)).await {
                Ok(r) => r,
                Err(_) => Err(CollectError::AttributionFailed {
                    cause: format!("timed out after {}s", timeout.as_secs_f64()),
                }),
            }
        };

        let (fetched, attribution) = tokio::join!(join_all(fetches), attribution);

        let mut records = Vec::new();
        for (gpu, result) in fetched {
            match result {
                Ok(metrics) => records.push(GpuDailyRecord {
                    node: gpu.node_name,
                    logical_index: gpu.logical_index,
                    card_id: gpu.card_id,
                    series: metrics.merge(),
                    user: None,
                }),
                Err(e) => {
                    tracing::warn!(gpu=%gpu.label(), node=%gpu.node_name, error=%e, "GPU collection failed");
                    errors.push(UnitError::new(
                        Unit::Gpu {
                            node: gpu.node_name,
                            logical_index: Some(gpu.logical_index),
                            card_id: gpu.card_id,
                        },
                        e,
                    ));
                }
            }
        }

        // Join runs only after the attribution fetch has settled.
        let (tasks, attribution_status) = match attribution {
            Ok(AttributionOutcome::Fetched(tasks)) => {
                let n = tasks.len();
                (tasks, AttributionStatus::Applied { tasks: n })
            }
            Ok(AttributionOutcome::Skipped) => (Vec::new(), AttributionStatus::Skipped),
            Err(e) => {
                tracing::warn!(error=%e, "attribution unavailable, users left unattributed");
                errors.push(UnitError::new(Unit::Attribution, e));
                (Vec::new(), AttributionStatus::Failed)
            }
        };

        let indices = cfg.hardware.all_logical_indices();
        for node in &nodes {
            let users = allocate_gpus(&tasks, &node.name, &indices);
            for record in records.iter_mut().filter(|r| r.node == node.name) {
                record.user = users.get(&record.logical_index).cloned();
            }
        }

        records.sort_by(|a, b| (a.node.as_str(), a.logical_index).cmp(&(b.node.as_str(), b.logical_index)));

        let summary = RunSummary {
            day,
            nodes: nodes
                .iter()
                .zip(attempted)
                .map(|(node, attempted)| NodeOutcome {
                    node: node.name.clone(),
                    attempted,
                    collected: records.iter().filter(|r| r.node == node.name).count(),
                    written: false,
                })
                .collect(),
            attribution: attribution_status,
        };

        DayResult {
            day,
            records,
            errors,
            summary,
        }
    }

    /// `collect_day` followed by writing each node-day's artifacts. A node
    /// with no collected GPU gets no files; a write failure on one node is
    /// recorded and the remaining nodes are still written.
    pub async fn run_day(&self, day: NaiveDate, nodes: &[NodeConfig]) -> DayResult {
        tracing::info!(%day, nodes = nodes.len(), "collecting day");
        let mut result = self.collect_day(day, nodes).await;
        let cfg = &self.config;

        for outcome in result.summary.nodes.iter_mut() {
            if outcome.fully_failed() {
                tracing::warn!(node=%outcome.node, %day, "no GPU collected, skipping node-day files");
                continue;
            }
            let records: Vec<&GpuDailyRecord> =
                result.records.iter().filter(|r| r.node == outcome.node).collect();
            match export::write_day(&cfg.data_dir, &outcome.node, day, &records, &cfg.hardware, &cfg.time) {
                Ok(paths) => {
                    tracing::info!(node=%outcome.node, %day, files = paths.len(), "node-day written");
                    outcome.written = true;
                }
                Err(e) => {
                    tracing::error!(node=%outcome.node, %day, error=%e, "failed to write node-day");
                    result
                        .errors
                        .push(UnitError::new(Unit::Node(outcome.node.clone()), e));
                }
            }
        }

        tracing::info!(summary=%result.summary, errors = result.errors.len(), "collection finished");
        result
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::RwLock;

use gpulog_common::{AttributionRecord, CollectError, DayWindow, GpuMetrics, NodeConfig};

/// Result of asking for a day's attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributionOutcome {
    /// No credential configured; attribution was not attempted.
    Skipped,
    Fetched(Vec<AttributionRecord>),
}

/// Per-GPU telemetry reader.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Fetch the utilization and VRAM series of one GPU over `window`.
    /// Both series are returned, possibly empty; any failure on either
    /// chart fails the whole GPU.
    async fn fetch_gpu_metrics(
        &self,
        node: &NodeConfig,
        card_id: u32,
        window: DayWindow,
    ) -> Result<GpuMetrics, CollectError>;
}

/// Day-scoped task listing.
#[async_trait]
pub trait AttributionSource: Send + Sync {
    async fn fetch_day_attribution(&self, day: NaiveDate)
        -> Result<AttributionOutcome, CollectError>;
}

#[derive(Debug, Clone)]
enum MetricReply {
    Metrics(GpuMetrics),
    Fail(String),
    Hang,
}

/// In-memory [`MetricSource`]. Unknown GPUs yield empty series.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetricSource {
    replies: Arc<RwLock<HashMap<(String, u32), MetricReply>>>,
    hung_nodes: Arc<RwLock<Vec<String>>>,
    calls: Arc<AtomicUsize>,
}

impl MemoryMetricSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, node: &str, card_id: u32, metrics: GpuMetrics) {
        self.replies
            .write()
            .await
            .insert((node.to_string(), card_id), MetricReply::Metrics(metrics));
    }

    pub async fn fail(&self, node: &str, card_id: u32, cause: &str) {
        self.replies
            .write()
            .await
            .insert((node.to_string(), card_id), MetricReply::Fail(cause.to_string()));
    }

    pub async fn hang(&self, node: &str, card_id: u32) {
        self.replies
            .write()
            .await
            .insert((node.to_string(), card_id), MetricReply::Hang);
    }

    /// Every GPU of `node` never answers.
    pub async fn hang_node(&self, node: &str) {
        self.hung_nodes.write().await.push(node.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricSource for MemoryMetricSource {
    async fn fetch_gpu_metrics(
        &self,
        node: &NodeConfig,
        card_id: u32,
        _window: DayWindow,
    ) -> Result<GpuMetrics, CollectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let hung = self.hung_nodes.read().await.contains(&node.name);
        let reply = if hung {
            Some(MetricReply::Hang)
        } else {
            self.replies
                .read()
                .await
                .get(&(node.name.clone(), card_id))
                .cloned()
        };

        match reply {
            Some(MetricReply::Metrics(m)) => Ok(m),
            Some(MetricReply::Fail(cause)) => Err(CollectError::FetchFailed {
                node: node.name.clone(),
                card_id,
                chart: crate::netdata::utilization_chart(card_id),
                cause,
            }),
            Some(MetricReply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(GpuMetrics::default())
            }
            None => Ok(GpuMetrics::default()),
        }
    }
}

#[derive(Debug, Clone)]
enum AttributionReply {
    Outcome(AttributionOutcome),
    Malformed(String),
    Unreachable(String),
}

/// In-memory [`AttributionSource`] that counts how often it is asked.
#[derive(Debug, Clone)]
pub struct MemoryAttributionSource {
    reply: Arc<AttributionReply>,
    calls: Arc<AtomicUsize>,
}

impl MemoryAttributionSource {
    pub fn skipped() -> Self {
        Self::with_reply(AttributionReply::Outcome(AttributionOutcome::Skipped))
    }

    pub fn with_tasks(tasks: Vec<AttributionRecord>) -> Self {
        Self::with_reply(AttributionReply::Outcome(AttributionOutcome::Fetched(tasks)))
    }

    pub fn malformed(reason: &str) -> Self {
        Self::with_reply(AttributionReply::Malformed(reason.to_string()))
    }

    pub fn unreachable(cause: &str) -> Self {
        Self::with_reply(AttributionReply::Unreachable(cause.to_string()))
    }

    fn with_reply(reply: AttributionReply) -> Self {
        Self {
            reply: Arc::new(reply),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttributionSource for MemoryAttributionSource {
    async fn fetch_day_attribution(
        &self,
        _day: NaiveDate,
    ) -> Result<AttributionOutcome, CollectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &*self.reply {
            AttributionReply::Outcome(o) => Ok(o.clone()),
            AttributionReply::Malformed(r) => Err(CollectError::MalformedResponse(r.clone())),
            AttributionReply::Unreachable(c) => {
                Err(CollectError::AttributionFailed { cause: c.clone() })
            }
        }
    }
}

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use gpulog_common::{CollectError, DayWindow, GpuMetrics, NodeConfig, RawSeries};

use crate::source::MetricSource;

pub fn utilization_chart(card_id: u32) -> String {
    format!("amdgpu.gpu_utilization_unknown_AMD_GPU_card{card_id}")
}

pub fn vram_chart(card_id: u32) -> String {
    format!("amdgpu.gpu_mem_vram_usage_perc_unknown_AMD_GPU_card{card_id}")
}

/// Reads GPU charts from each node's Netdata `/api/v1/data` endpoint.
#[derive(Debug, Clone)]
pub struct NetdataClient {
    http: reqwest::Client,
    points: u32,
}

impl NetdataClient {
    pub fn new(timeout: Duration, points: u32) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, points })
    }

    pub fn with_client(http: reqwest::Client, points: u32) -> Self {
        Self { http, points }
    }

    /// Fetch one chart. The error is a plain cause string; the caller knows
    /// which node/card/chart it belongs to.
    pub async fn fetch_chart(
        &self,
        base_url: &str,
        chart: &str,
        window: DayWindow,
    ) -> Result<RawSeries, String> {
        let url = format!("{}/api/v1/data", base_url.trim_end_matches('/'));
        let query = [
            ("chart", chart.to_string()),
            ("after", window.after.to_string()),
            ("before", window.before.to_string()),
            ("points", self.points.to_string()),
            ("group", "average".to_string()),
            ("format", "json".to_string()),
        ];

        let resp = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| describe_reqwest_error(&e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| format!("failed to read body: {e}"))?;
        parse_chart_body(&body)
    }
}

#[async_trait]
impl MetricSource for NetdataClient {
    async fn fetch_gpu_metrics(
        &self,
        node: &NodeConfig,
        card_id: u32,
        window: DayWindow,
    ) -> Result<GpuMetrics, CollectError> {
        let base = node.netdata_url();
        let util_chart = utilization_chart(card_id);
        let vram_chart = vram_chart(card_id);

        let (utilization, vram) = tokio::join!(
            self.fetch_chart(&base, &util_chart, window),
            self.fetch_chart(&base, &vram_chart, window),
        );

        let failed = |chart: String, cause: String| CollectError::FetchFailed {
            node: node.name.clone(),
            card_id,
            chart,
            cause,
        };
        let utilization = utilization.map_err(|cause| failed(util_chart, cause))?;
        let vram = vram.map_err(|cause| failed(vram_chart, cause))?;

        tracing::debug!(
            node=%node.name,
            card_id,
            utilization_points = utilization.len(),
            vram_points = vram.len(),
            "fetched gpu charts"
        );
        Ok(GpuMetrics { utilization, vram })
    }
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[allow(dead_code)]
    labels: Value,
    data: Vec<Value>,
}

/// Parse a Netdata `format=json` body into a series.
///
/// `data` and `labels` must be present. Rows are `[timestamp, value, ...]`;
/// rows that are too short or carry a non-numeric timestamp are dropped, and
/// a null value is kept as a null point.
pub fn parse_chart_body(body: &str) -> Result<RawSeries, String> {
    let parsed: ChartBody =
        serde_json::from_str(body).map_err(|e| format!("unparseable body: {e}"))?;

    let mut points = Vec::with_capacity(parsed.data.len());
    let mut dropped = 0usize;
    for row in &parsed.data {
        let Some(cells) = row.as_array() else {
            dropped += 1;
            continue;
        };
        if cells.len() < 2 {
            dropped += 1;
            continue;
        }
        let Some(ts) = cells[0].as_i64().or_else(|| cells[0].as_f64().map(|f| f as i64)) else {
            dropped += 1;
            continue;
        };
        points.push((ts, cells[1].as_f64()));
    }
    if dropped > 0 {
        tracing::debug!(dropped, "dropped malformed chart rows");
    }
    Ok(RawSeries::new(points))
}

fn describe_reqwest_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}

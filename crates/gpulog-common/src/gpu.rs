/// Sentinel user written for a GPU no task was attributed to.
pub const UNUSED_USER: &str = "未使用";

/// One physical GPU on one node, in both numbering schemes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GpuIdentity {
    pub node_name: String,
    pub card_id: u32,
    pub logical_index: u32,
}

impl GpuIdentity {
    /// Label used in reports and the average file, e.g. `GPU[3]`.
    pub fn label(&self) -> String {
        gpu_label(self.logical_index)
    }
}

pub fn gpu_label(logical_index: u32) -> String {
    format!("GPU[{logical_index}]")
}

/// Inverse of [`gpu_label`].
pub fn parse_gpu_label(label: &str) -> Option<u32> {
    label
        .trim()
        .strip_prefix("GPU[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// One aligned sample. A `None` side is a null reported by the telemetry
/// API; a side missing from its series entirely is stored as `Some(0.0)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricPoint {
    pub timestamp: i64,
    pub utilization_pct: Option<f64>,
    pub vram_pct: Option<f64>,
}

/// One series as returned by a single chart query, unaligned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSeries {
    pub points: Vec<(i64, Option<f64>)>,
}

impl RawSeries {
    pub fn new(points: Vec<(i64, Option<f64>)>) -> Self {
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}

/// Both series for one GPU over one day window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuMetrics {
    pub utilization: RawSeries,
    pub vram: RawSeries,
}

impl GpuMetrics {
    /// Join both series on timestamp. The result holds the union of
    /// timestamps in ascending order; a side absent at a timestamp is 0.0.
    pub fn merge(&self) -> Vec<MetricPoint> {
        use std::collections::BTreeMap;

        let mut by_ts: BTreeMap<i64, (Option<Option<f64>>, Option<Option<f64>>)> = BTreeMap::new();
        for &(ts, v) in &self.utilization.points {
            by_ts.entry(ts).or_default().0 = Some(v);
        }
        for &(ts, v) in &self.vram.points {
            by_ts.entry(ts).or_default().1 = Some(v);
        }

        by_ts
            .into_iter()
            .map(|(timestamp, (util, vram))| MetricPoint {
                timestamp,
                utilization_pct: util.unwrap_or(Some(0.0)),
                vram_pct: vram.unwrap_or(Some(0.0)),
            })
            .collect()
    }
}

/// A GPU's collected day. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuDailyRecord {
    pub node: String,
    pub logical_index: u32,
    pub card_id: u32,
    pub series: Vec<MetricPoint>,
    pub user: Option<String>,
}

impl GpuDailyRecord {
    pub fn avg_utilization(&self) -> Option<f64> {
        mean(self.series.iter().filter_map(|p| p.utilization_pct))
    }

    pub fn avg_vram(&self) -> Option<f64> {
        mean(self.series.iter().filter_map(|p| p.vram_pct))
    }

    pub fn user_or_unused(&self) -> &str {
        self.user.as_deref().unwrap_or(UNUSED_USER)
    }
}

/// A persisted row of the per-day average file.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyAverageRow {
    pub gpu_label: String,
    pub avg_utilization_pct: Option<f64>,
    pub avg_vram_pct: Option<f64>,
    pub user: String,
}

impl DailyAverageRow {
    pub fn from_record(record: &GpuDailyRecord) -> Self {
        Self {
            gpu_label: gpu_label(record.logical_index),
            avg_utilization_pct: record.avg_utilization(),
            avg_vram_pct: record.avg_vram(),
            user: record.user_or_unused().to_string(),
        }
    }
}

/// Arithmetic mean, `None` for an empty input.
pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

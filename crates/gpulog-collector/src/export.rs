use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use gpulog_common::{
    gpu_label, parse_gpu_label, CollectError, DailyAverageRow, GpuDailyRecord, HardwareMap, TimeConvention,
};

use crate::aggregate::daily_averages;

pub const RAW_HEADER: [&str; 4] = ["時間戳", "日期時間", "GPU使用率(%)", "VRAM使用率(%)"];
pub const AVERAGE_HEADER: [&str; 4] = ["GPU編號", "平均GPU使用率(%)", "平均VRAM使用率(%)", "使用者"];
pub const NOT_AVAILABLE: &str = "N/A";

const RULE: &str = "================================";

/// `<root>/<node>/<YYYY-MM-DD>`
pub fn node_day_dir(root: &Path, node: &str, day: NaiveDate) -> PathBuf {
    root.join(node).join(day.format("%Y-%m-%d").to_string())
}

pub fn raw_file_name(logical_index: u32, day: NaiveDate) -> String {
    format!("gpu{logical_index}_{}.csv", day.format("%Y-%m-%d"))
}

pub fn average_file_name(day: NaiveDate) -> String {
    format!("average_{}.csv", day.format("%Y-%m-%d"))
}

pub fn summary_file_name(day: NaiveDate) -> String {
    format!("summary_{}.txt", day.format("%Y-%m-%d"))
}

/// Write one node-day: a raw series file per GPU, the average file and the
/// summary. Every file goes through a temporary path and a rename. Raw files
/// left by an earlier run for GPUs missing from `records` are removed. The
/// first I/O error aborts this node-day and is returned as `WriteFailed`.
pub fn write_day(
    root: &Path,
    node: &str,
    day: NaiveDate,
    records: &[&GpuDailyRecord],
    hardware: &HardwareMap,
    time: &TimeConvention,
) -> Result<Vec<PathBuf>, CollectError> {
    let dir = node_day_dir(root, node, day);
    let failed = |path: &Path, source: io::Error| CollectError::WriteFailed {
        node: node.to_string(),
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(&dir).map_err(|e| failed(&dir, e))?;

    let mut sorted = records.to_vec();
    sorted.sort_by_key(|r| r.logical_index);

    let mut written = Vec::with_capacity(sorted.len() + 2);
    for record in &sorted {
        let path = dir.join(raw_file_name(record.logical_index, day));
        let body = render_raw_series(record, time).map_err(|e| failed(&path, e))?;
        write_atomic(&path, &body).map_err(|e| failed(&path, e))?;
        written.push(path);
    }
    let kept: Vec<u32> = sorted.iter().map(|r| r.logical_index).collect();
    remove_stale_raw(&dir, day, &kept).map_err(|(path, e)| failed(&path, e))?;

    let (rows, overall) = daily_averages(&sorted);

    let path = dir.join(average_file_name(day));
    let body = render_averages(&rows, &overall).map_err(|e| failed(&path, e))?;
    write_atomic(&path, &body).map_err(|e| failed(&path, e))?;
    written.push(path);

    let path = dir.join(summary_file_name(day));
    let body = render_summary(node, day, &rows, &overall, hardware);
    write_atomic(&path, body.as_bytes()).map_err(|e| failed(&path, e))?;
    written.push(path);

    Ok(written)
}

/// Delete `gpu<N>_<day>.csv` files in `dir` whose index is not in `kept`.
fn remove_stale_raw(dir: &Path, day: NaiveDate, kept: &[u32]) -> Result<(), (PathBuf, io::Error)> {
    let suffix = format!("_{}.csv", day.format("%Y-%m-%d"));
    let entries = std::fs::read_dir(dir).map_err(|e| (dir.to_path_buf(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| (dir.to_path_buf(), e))?;
        let name = entry.file_name();
        let index = name
            .to_str()
            .and_then(|n| n.strip_prefix("gpu"))
            .and_then(|n| n.strip_suffix(suffix.as_str()))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(index) = index.filter(|i| !kept.contains(i)) {
            let path = entry.path();
            tracing::info!(path=%path.display(), index, "removing raw file of uncollected GPU");
            std::fs::remove_file(&path).map_err(|e| (path, e))?;
        }
    }
    Ok(())
}

/// Raw series CSV. A null sample is rendered as `0.0`, matching what the
/// downstream plots have always read.
pub fn render_raw_series(record: &GpuDailyRecord, time: &TimeConvention) -> io::Result<Vec<u8>> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(RAW_HEADER)?;
    for p in &record.series {
        w.write_record([
            p.timestamp.to_string(),
            time.format_timestamp(p.timestamp),
            format!("{:.1}", p.utilization_pct.unwrap_or(0.0)),
            format!("{:.1}", p.vram_pct.unwrap_or(0.0)),
        ])?;
    }
    w.into_inner().map_err(|e| e.into_error())
}

pub fn render_averages(rows: &[DailyAverageRow], overall: &DailyAverageRow) -> io::Result<Vec<u8>> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(AVERAGE_HEADER)?;
    for row in rows.iter().chain(std::iter::once(overall)) {
        w.write_record([
            row.gpu_label.clone(),
            format_average(row.avg_utilization_pct),
            format_average(row.avg_vram_pct),
            row.user.clone(),
        ])?;
    }
    w.into_inner().map_err(|e| e.into_error())
}

pub fn format_average(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.2}"),
        None => NOT_AVAILABLE.to_string(),
    }
}

pub const COLLECTION_FAILED: &str = "數據收集失敗";

/// Human-readable report built only from the average rows and the hardware
/// table. Every configured GPU is listed; one without a row is marked failed.
pub fn render_summary(
    node: &str,
    day: NaiveDate,
    rows: &[DailyAverageRow],
    overall: &DailyAverageRow,
    hardware: &HardwareMap,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "AMD GPU 與 VRAM 每日使用率統計");
    let _ = writeln!(out, "日期: {}", day.format("%Y-%m-%d"));
    let _ = writeln!(out, "節點: {node}");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out);

    let _ = writeln!(out, "GPU 硬體對應表:");
    for (index, card) in hardware.entries() {
        let _ = writeln!(out, "{} -> Card {card}", gpu_label(index));
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "各 GPU 使用率與 VRAM 使用率:");
    for index in hardware.all_logical_indices() {
        match rows.iter().find(|r| parse_gpu_label(&r.gpu_label) == Some(index)) {
            Some(row) => {
                let _ = writeln!(
                    out,
                    "{}: GPU使用率 = {}, VRAM使用率 = {} (使用者: {})",
                    row.gpu_label,
                    format_percent(row.avg_utilization_pct),
                    format_percent(row.avg_vram_pct),
                    row.user
                );
            }
            None => {
                let _ = writeln!(out, "{}: {COLLECTION_FAILED}", gpu_label(index));
            }
        }
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "整體平均 GPU 使用率: {}", format_percent(overall.avg_utilization_pct));
    let _ = writeln!(out, "整體平均 VRAM 使用率: {}", format_percent(overall.avg_vram_pct));
    let _ = writeln!(out, "{RULE}");
    out
}

fn format_percent(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.2}%"),
        None => NOT_AVAILABLE.to_string(),
    }
}

/// Write `contents` next to `path` under a `.tmp` name, then rename over
/// `path`. Readers see either the old file or the complete new one.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    if let Err(e) = std::fs::write(&tmp, contents).and_then(|_| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

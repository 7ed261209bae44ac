use std::collections::BTreeMap;

use chrono::NaiveDate;

use gpulog_collector::history::{UsageEntry, UserUsageReport};
use gpulog_collector::{AttributionStatus, DayResult};

fn pct(value: Option<f64>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{v:.2}%"))
}

pub fn print_day_result(result: &DayResult) {
    println!("\n=== GPU collection {} ===", result.day);
    println!(
        "  {:<20} {:>9} {:>9} {:>8}",
        "Node", "Attempted", "Collected", "Written"
    );
    for n in &result.summary.nodes {
        println!(
            "  {:<20} {:>9} {:>9} {:>8}",
            n.node,
            n.attempted,
            n.collected,
            if n.written { "yes" } else { "no" }
        );
    }

    let attribution = match result.summary.attribution {
        AttributionStatus::Applied { tasks } => format!("applied ({tasks} tasks)"),
        AttributionStatus::Skipped => "skipped (no token)".to_string(),
        AttributionStatus::Failed => "failed".to_string(),
    };
    println!("\n  Attribution: {attribution}");

    if !result.errors.is_empty() {
        println!("\n[Errors]");
        for e in &result.errors {
            println!("  {e}");
        }
    }
    println!("\n{}", result.summary);
}

pub fn print_user_usage(report: &UserUsageReport, from: NaiveDate, to: NaiveDate) {
    println!("\n=== GPU usage of {} ({from} .. {to}) ===", report.username);
    if report.entries.is_empty() {
        println!("No records found.");
        return;
    }

    println!("  {:<12} {:<16} {:<8} {:>9} {:>9}", "Date", "Node", "GPU", "GPU", "VRAM");
    for e in &report.entries {
        print_entry(e);
    }

    let total = report.total();
    let active = report.active();
    println!("\n  Records:      {total}");
    println!(
        "  Active:       {active} ({:.1}%)",
        active as f64 / total as f64 * 100.0
    );
    println!("  Avg GPU:      {}", pct(report.avg_utilization()));
    println!("  Avg VRAM:     {}", pct(report.avg_vram()));
    println!("  Peak GPU:     {}", pct(report.peak_utilization()));
    println!("  Peak VRAM:    {}", pct(report.peak_vram()));
    let nodes: Vec<&str> = report.nodes_used().into_iter().collect();
    println!("  Nodes used:   {}", nodes.join(", "));
    println!("  GPUs used:    {}", report.gpus_used().len());
    println!();
}

fn print_entry(e: &UsageEntry) {
    println!(
        "  {:<12} {:<16} {:<8} {:>9} {:>9}",
        e.day.to_string(),
        e.node,
        e.gpu,
        pct(e.utilization_pct),
        pct(e.vram_pct)
    );
}

pub fn print_users(day: NaiveDate, users: &BTreeMap<String, Vec<UsageEntry>>) {
    println!("\n=== Active GPU users on {day} ===");
    if users.is_empty() {
        println!("No active users found.");
        return;
    }
    for (user, entries) in users {
        println!("\n  {user} ({} GPU)", entries.len());
        for e in entries {
            println!(
                "    {}:{}  GPU {}  VRAM {}",
                e.node,
                e.gpu,
                pct(e.utilization_pct),
                pct(e.vram_pct)
            );
        }
    }
    println!("\n{} users", users.len());
}

/// One task reported by the management API for a day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionRecord {
    pub task_id: String,
    pub username: String,
    pub hostname: String,
    pub task_type: String,
    pub gpu_count: u32,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

impl AttributionRecord {
    /// Whether this task ran on `node`. Hostnames are compared ASCII
    /// case-insensitively, and an FQDN matches on its first label.
    pub fn runs_on(&self, node: &str) -> bool {
        let host = self.hostname.trim();
        if host.eq_ignore_ascii_case(node) {
            return true;
        }
        match host.split_once('.') {
            Some((short, _)) => short.eq_ignore_ascii_case(node),
            None => false,
        }
    }
}

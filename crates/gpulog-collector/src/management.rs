//! Task attribution from the cluster management API.
//!
//! The API reports which user ran a task on which host and how many GPUs
//! the task asked for, but not which physical GPUs it was bound to. GPUs are
//! therefore attributed with a best-effort heuristic, see [`allocate_gpus`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value};

use gpulog_common::{AttributionRecord, CollectError, ManagementConfig, TimeConvention};

use crate::source::{AttributionOutcome, AttributionSource};

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone)]
pub struct ManagementClient {
    http: reqwest::Client,
    config: ManagementConfig,
    time: TimeConvention,
}

impl ManagementClient {
    pub fn new(
        config: ManagementConfig,
        time: TimeConvention,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, config, time })
    }
}

#[async_trait]
impl AttributionSource for ManagementClient {
    async fn fetch_day_attribution(
        &self,
        day: NaiveDate,
    ) -> Result<AttributionOutcome, CollectError> {
        let Some(token) = self.config.bearer_token.as_deref().filter(|_| self.config.enabled())
        else {
            tracing::info!("no management API token configured, skipping attribution");
            return Ok(AttributionOutcome::Skipped);
        };

        let (start_t, end_t) = self.time.query_strings(day);
        let resp = self
            .http
            .get(&self.config.url)
            .query(&[("start_t", start_t.as_str()), ("end_t", end_t.as_str())])
            .header(reqwest::header::ACCEPT, "application/json")
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CollectError::AttributionFailed { cause: e.to_string() })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CollectError::AttributionFailed {
                cause: format!("HTTP {status}"),
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CollectError::MalformedResponse(format!("body is not JSON: {e}")))?;

        let tasks = parse_response(body)?;
        tracing::info!(%day, tasks = tasks.len(), "fetched task attribution");
        Ok(AttributionOutcome::Fetched(tasks))
    }
}

/// The response layouts the management API has been seen to return.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseShape {
    /// `{"671": {...}, "672": {...}}`
    KeyedById(Map<String, Value>),
    /// `{"data": [{...}, ...]}`
    ListUnderData(Vec<Value>),
    Unrecognized(String),
}

impl ResponseShape {
    pub fn classify(body: Value) -> Self {
        let mut obj = match body {
            Value::Object(obj) => obj,
            other => {
                return Self::Unrecognized(format!("expected a JSON object, got {}", kind(&other)))
            }
        };

        if let Some(data) = obj.get_mut("data") {
            return match data.take() {
                Value::Array(items) => Self::ListUnderData(items),
                other => Self::Unrecognized(format!("\"data\" is {}, not a list", kind(&other))),
            };
        }

        if let Some((key, _)) = obj.iter().find(|(k, _)| !is_task_id(k)) {
            return Self::Unrecognized(format!("unexpected key {key:?}"));
        }
        if let Some((key, value)) = obj.iter().find(|(_, v)| !v.is_object()) {
            return Self::Unrecognized(format!("task {key} is {}, not an object", kind(value)));
        }
        Self::KeyedById(obj)
    }
}

/// Normalise a response body into task records, in a deterministic order.
pub fn parse_response(body: Value) -> Result<Vec<AttributionRecord>, CollectError> {
    match ResponseShape::classify(body) {
        ResponseShape::KeyedById(tasks) => Ok(parse_keyed(tasks)),
        ResponseShape::ListUnderData(items) => Ok(parse_listed(items)),
        ResponseShape::Unrecognized(reason) => Err(CollectError::MalformedResponse(reason)),
    }
}

/// Keyed layout: `username`, `hostname`, `task._type`, `flavor.gpu`.
/// Ordered by numeric task id.
fn parse_keyed(tasks: Map<String, Value>) -> Vec<AttributionRecord> {
    let mut entries: Vec<(u64, String, Value)> = tasks
        .into_iter()
        .map(|(id, v)| (id.parse::<u64>().unwrap_or(u64::MAX), id, v))
        .collect();
    entries.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

    entries
        .into_iter()
        .filter_map(|(_, id, task)| {
            let gpu_count = count_at(&task, &["flavor", "gpu"])
                .or_else(|| count_at(&task, &["gpu_count"]))
                .unwrap_or(0);
            if gpu_count == 0 {
                return None;
            }
            Some(AttributionRecord {
                task_id: id,
                username: str_at(&task, &["username"]).unwrap_or(UNKNOWN).to_string(),
                hostname: str_at(&task, &["hostname"]).unwrap_or(UNKNOWN).to_string(),
                task_type: str_at(&task, &["task", "_type"])
                    .or_else(|| str_at(&task, &["type"]))
                    .unwrap_or(UNKNOWN)
                    .to_string(),
                gpu_count,
                start_time: opt_string(&task, "start_time"),
                end_time: opt_string(&task, "end_time"),
            })
        })
        .collect()
}

/// List layout: `id`, `user.username` (or `username`), `hostname`, `type`,
/// GPUs from `gpuconfig.gpus` (or a plain count). Keeps list order.
fn parse_listed(items: Vec<Value>) -> Vec<AttributionRecord> {
    let mut out = Vec::with_capacity(items.len());
    for (pos, item) in items.into_iter().enumerate() {
        if !item.is_object() {
            tracing::debug!(pos, "skipping non-object task entry");
            continue;
        }
        let gpu_count = item
            .get("gpuconfig")
            .and_then(|g| g.get("gpus"))
            .and_then(Value::as_array)
            .and_then(|gpus| u32::try_from(gpus.len()).ok())
            .or_else(|| count_at(&item, &["gpu_count"]))
            .or_else(|| count_at(&item, &["flavor", "gpu"]))
            .unwrap_or(0);
        if gpu_count == 0 {
            continue;
        }
        let task_id = match item.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => pos.to_string(),
        };
        out.push(AttributionRecord {
            task_id,
            username: str_at(&item, &["user", "username"])
                .or_else(|| str_at(&item, &["username"]))
                .unwrap_or(UNKNOWN)
                .to_string(),
            hostname: str_at(&item, &["hostname"]).unwrap_or(UNKNOWN).to_string(),
            task_type: str_at(&item, &["type"])
                .or_else(|| str_at(&item, &["task", "_type"]))
                .unwrap_or(UNKNOWN)
                .to_string(),
            gpu_count,
            start_time: opt_string(&item, "start_time"),
            end_time: opt_string(&item, "end_time"),
        });
    }
    out
}

/// Attribute GPUs of `node` to users, best effort.
///
/// Tasks are visited in order; a task on this node that asked for N GPUs
/// takes the first N not-yet-assigned indices of `indices` in ascending
/// order. This is wrong whenever the scheduler bound a task to other GPUs
/// than the lowest free ones, which the API gives no way to detect. Indices
/// left over stay unattributed.
pub fn allocate_gpus(
    tasks: &[AttributionRecord],
    node: &str,
    indices: &[u32],
) -> BTreeMap<u32, String> {
    let mut free: Vec<u32> = indices.to_vec();
    free.sort_unstable();
    free.dedup();
    let mut free = free.into_iter();

    let mut assigned = BTreeMap::new();
    for task in tasks.iter().filter(|t| t.runs_on(node)) {
        for _ in 0..task.gpu_count {
            let Some(idx) = free.next() else {
                tracing::debug!(node, task_id=%task.task_id, "more GPUs requested than installed");
                return assigned;
            };
            assigned.insert(idx, task.username.clone());
        }
    }
    assigned
}

fn is_task_id(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

fn str_at<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn count_at(v: &Value, path: &[&str]) -> Option<u32> {
    let mut cur = v;
    for key in path {
        cur = cur.get(key)?;
    }
    match cur {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn opt_string(v: &Value, key: &str) -> Option<String> {
    str_at(v, &[key]).map(str::to_string)
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: &str, user: &str, host: &str, gpus: u32) -> AttributionRecord {
        AttributionRecord {
            task_id: id.to_string(),
            username: user.to_string(),
            hostname: host.to_string(),
            task_type: "LAB".to_string(),
            gpu_count: gpus,
            start_time: None,
            end_time: None,
        }
    }

    #[test]
    fn test_keyed_shape() {
        let body = json!({
            "672": {
                "username": "bob",
                "hostname": "colab-gpu2",
                "task": {"_type": "JOB", "uuid": "t-2"},
                "flavor": {"gpu": 2, "gpu_type": "MI210"},
                "start_time": "2025-09-15 08:00:00"
            },
            "9": {
                "username": "alice",
                "hostname": "colab-gpu1",
                "flavor": {"gpu": 1}
            },
            "700": {
                "username": "carol",
                "hostname": "colab-gpu1",
                "flavor": {"gpu": 0}
            }
        });
        let tasks = parse_response(body).unwrap();
        assert_eq!(tasks.len(), 2);
        // numeric id order, not lexicographic
        assert_eq!(tasks[0].task_id, "9");
        assert_eq!(tasks[0].task_type, UNKNOWN);
        assert_eq!(tasks[1].username, "bob");
        assert_eq!(tasks[1].task_type, "JOB");
        assert_eq!(tasks[1].gpu_count, 2);
        assert_eq!(tasks[1].start_time.as_deref(), Some("2025-09-15 08:00:00"));
        assert_eq!(tasks[1].end_time, None);
    }

    #[test]
    fn test_list_shape() {
        let body = json!({
            "code": 200,
            "message": "success",
            "data": [
                {
                    "id": "task-001",
                    "user": {"username": "test_user", "email": "test@example.com"},
                    "hostname": "test-gpu1",
                    "type": "LAB",
                    "start_time": "2025-09-15 09:00:00",
                    "gpuconfig": {"gpus": ["gpu-uuid-001", "gpu-uuid-002"]}
                },
                {"id": 7, "username": "dave", "hostname": "test-gpu2", "gpu_count": "1"},
                {"id": 8, "username": "idle", "hostname": "test-gpu2"},
                42
            ]
        });
        let tasks = parse_response(body).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].username, "test_user");
        assert_eq!(tasks[0].gpu_count, 2);
        assert_eq!(tasks[0].task_type, "LAB");
        assert_eq!(tasks[1].task_id, "7");
        assert_eq!(tasks[1].gpu_count, 1);
    }

    #[test]
    fn test_oversized_gpu_count_is_not_truncated() {
        // 2^32 + 2 would read as 2 if narrowed
        let body = json!({
            "1": {"username": "mallory", "hostname": "colab-gpu1", "flavor": {"gpu": 4_294_967_298u64}},
            "2": {"username": "alice", "hostname": "colab-gpu1", "flavor": {"gpu": 1}}
        });
        let tasks = parse_response(body).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].username, "alice");

        let body = json!({"data": [{"username": "mallory", "hostname": "h", "gpu_count": 4_294_967_296u64}]});
        assert!(parse_response(body).unwrap().is_empty());
    }

    #[test]
    fn test_empty_object_is_empty_attribution() {
        assert_eq!(parse_response(json!({})).unwrap(), vec![]);
    }

    #[test]
    fn test_unrecognized_shapes() {
        for body in [
            json!([1, 2, 3]),
            json!({"error": "unauthorized"}),
            json!({"data": {"x": 1}}),
            json!({"12": "not an object"}),
            json!(null),
        ] {
            match parse_response(body) {
                Err(CollectError::MalformedResponse(_)) => {}
                other => panic!("expected MalformedResponse, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_allocate_sequential() {
        let tasks = vec![
            task("1", "alice", "colab-gpu1", 2),
            task("2", "bob", "colab-gpu2", 4),
            task("3", "carol", "colab-gpu1.cluster", 1),
        ];
        let indices: Vec<u32> = (0..8).collect();
        let got = allocate_gpus(&tasks, "colab-gpu1", &indices);
        assert_eq!(
            got,
            BTreeMap::from([
                (0, "alice".to_string()),
                (1, "alice".to_string()),
                (2, "carol".to_string()),
            ])
        );
    }

    #[test]
    fn test_allocate_caps_at_installed() {
        let tasks = vec![task("1", "alice", "n", 6), task("2", "bob", "n", 6)];
        let got = allocate_gpus(&tasks, "n", &[3, 1, 2, 0]);
        assert_eq!(got.len(), 4);
        assert!(got.values().all(|u| u == "alice"));
    }

    #[test]
    fn test_allocate_no_tasks_for_node() {
        let tasks = vec![task("1", "alice", "other", 2)];
        assert!(allocate_gpus(&tasks, "n", &[0, 1]).is_empty());
    }
}

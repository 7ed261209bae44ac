use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use serde_json::json;

use gpulog_collector::netdata::{utilization_chart, vram_chart};
use gpulog_collector::{
    AttributionOutcome, AttributionSource, ManagementClient, MetricSource, NetdataClient,
};
use gpulog_common::{CollectError, ManagementConfig, NodeConfig, TimeConvention};

type Seen = Arc<Mutex<Vec<HashMap<String, String>>>>;

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 9, 15).unwrap()
}

async fn netdata_data(
    State(seen): State<Seen>,
    Query(q): Query<HashMap<String, String>>,
) -> axum::response::Response {
    seen.lock().unwrap().push(q.clone());
    let chart = q.get("chart").cloned().unwrap_or_default();
    if chart == utilization_chart(1) {
        Json(json!({"labels": ["time", "utilization"], "data": [[200, 20.0], [100, 10.0]]})).into_response()
    } else if chart == vram_chart(1) {
        Json(json!({"labels": ["time", "usage"], "data": [[100, 40.0]]})).into_response()
    } else if chart == vram_chart(9) {
        (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
    } else if chart == utilization_chart(17) {
        Json(json!({"data": [[100, 1.0]]})).into_response()
    } else {
        Json(json!({"labels": ["time"], "data": []})).into_response()
    }
}

async fn netdata() -> (SocketAddr, Seen) {
    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/api/v1/data", get(netdata_data))
        .with_state(seen.clone());
    (spawn(app).await, seen)
}

fn node_at(addr: SocketAddr) -> NodeConfig {
    NodeConfig::new("colab-gpu1", "127.0.0.1", addr.port())
}

fn client() -> NetdataClient {
    NetdataClient::new(Duration::from_secs(5), 144).unwrap()
}

#[tokio::test]
async fn test_netdata_fetch_and_merge() {
    let (addr, seen) = netdata().await;
    let time = TimeConvention::default();
    let window = time.day_window(day());

    let metrics = client()
        .fetch_gpu_metrics(&node_at(addr), 1, window)
        .await
        .unwrap();
    assert_eq!(metrics.utilization.len(), 2);
    assert_eq!(metrics.vram.len(), 1);

    let merged = metrics.merge();
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].timestamp, 100);
    assert_eq!(merged[0].vram_pct, Some(40.0));
    assert_eq!(merged[1].utilization_pct, Some(20.0));
    assert_eq!(merged[1].vram_pct, Some(0.0));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    let q = &seen[0];
    assert_eq!(q["after"], window.after.to_string());
    assert_eq!(q["before"], window.before.to_string());
    assert_eq!(q["points"], "144");
    assert_eq!(q["group"], "average");
    assert_eq!(q["format"], "json");
}

#[tokio::test]
async fn test_netdata_http_error_names_chart() {
    let (addr, _) = netdata().await;
    let window = TimeConvention::default().day_window(day());
    let err = client()
        .fetch_gpu_metrics(&node_at(addr), 9, window)
        .await
        .unwrap_err();
    match err {
        CollectError::FetchFailed { node, card_id, chart, cause } => {
            assert_eq!(node, "colab-gpu1");
            assert_eq!(card_id, 9);
            assert_eq!(chart, vram_chart(9));
            assert!(cause.contains("500"), "{cause}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_netdata_body_without_labels_fails() {
    let (addr, _) = netdata().await;
    let window = TimeConvention::default().day_window(day());
    let err = client()
        .fetch_gpu_metrics(&node_at(addr), 17, window)
        .await
        .unwrap_err();
    assert!(matches!(err, CollectError::FetchFailed { ref chart, .. } if *chart == utilization_chart(17)));
}

#[tokio::test]
async fn test_netdata_empty_series_is_ok() {
    let (addr, _) = netdata().await;
    let window = TimeConvention::default().day_window(day());
    let metrics = client()
        .fetch_gpu_metrics(&node_at(addr), 57, window)
        .await
        .unwrap();
    assert!(metrics.utilization.is_empty());
    assert!(metrics.vram.is_empty());
}

#[tokio::test]
async fn test_netdata_connection_refused() {
    let port = closed_port().await;
    let node = NodeConfig::new("colab-gpu2", "127.0.0.1", port);
    let window = TimeConvention::default().day_window(day());
    let err = client().fetch_gpu_metrics(&node, 1, window).await.unwrap_err();
    assert!(matches!(err, CollectError::FetchFailed { ref node, .. } if node == "colab-gpu2"));
}

async fn tasks_keyed(
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer tok");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if q.get("start_t").map(String::as_str) != Some("2025-09-15 00:00:00")
        || q.get("end_t").map(String::as_str) != Some("2025-09-15 23:59:59")
    {
        return StatusCode::BAD_REQUEST.into_response();
    }
    Json(json!({
        "672": {"username": "bob", "hostname": "colab-gpu1", "task": {"_type": "LAB"},
                "flavor": {"gpu": 2}, "start_time": "2025-09-15 08:00:00"},
        "671": {"username": "alice", "hostname": "colab-gpu1", "task": {"_type": "JOB"},
                "flavor": {"gpu": 1}, "start_time": "2025-09-15 07:00:00"},
        "680": {"username": "carol", "hostname": "colab-gpu2", "flavor": {"gpu": 0}}
    }))
    .into_response()
}

async fn tasks_listed() -> Json<serde_json::Value> {
    Json(json!({
        "data": [
            {"id": 5, "user": {"username": "dave"}, "hostname": "colab-gpu3.lab",
             "type": "LAB", "gpuconfig": {"gpus": ["a", "b", "c"]}},
            {"id": "6", "username": "erin", "hostname": "colab-gpu3", "gpu_count": 1}
        ]
    }))
}

async fn tasks_bogus() -> Json<serde_json::Value> {
    Json(json!(["not", "an", "object"]))
}

async fn tasks_html() -> &'static str {
    "<html>maintenance</html>"
}

async fn management() -> SocketAddr {
    let app = Router::new()
        .route("/keyed", get(tasks_keyed))
        .route("/listed", get(tasks_listed))
        .route("/bogus", get(tasks_bogus))
        .route("/html", get(tasks_html));
    spawn(app).await
}

fn management_client(url: String, token: Option<&str>) -> ManagementClient {
    ManagementClient::new(
        ManagementConfig {
            url,
            bearer_token: token.map(str::to_string),
        },
        TimeConvention::default(),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn test_management_keyed_shape() {
    let addr = management().await;
    let client = management_client(format!("http://{addr}/keyed"), Some("tok"));
    let AttributionOutcome::Fetched(tasks) = client.fetch_day_attribution(day()).await.unwrap() else {
        panic!("expected fetched tasks");
    };
    // ordered by task id, zero-GPU task dropped
    let users: Vec<&str> = tasks.iter().map(|t| t.username.as_str()).collect();
    assert_eq!(users, vec!["alice", "bob"]);
    assert_eq!(tasks[1].gpu_count, 2);
    assert_eq!(tasks[0].task_type, "JOB");
}

#[tokio::test]
async fn test_management_list_shape() {
    let addr = management().await;
    let client = management_client(format!("http://{addr}/listed"), Some("tok"));
    let AttributionOutcome::Fetched(tasks) = client.fetch_day_attribution(day()).await.unwrap() else {
        panic!("expected fetched tasks");
    };
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].username, "dave");
    assert_eq!(tasks[0].gpu_count, 3);
    assert_eq!(tasks[0].task_id, "5");
    assert!(tasks[0].runs_on("colab-gpu3"));
    assert_eq!(tasks[1].username, "erin");
}

#[tokio::test]
async fn test_management_unrecognized_shapes() {
    let addr = management().await;
    for path in ["bogus", "html"] {
        let client = management_client(format!("http://{addr}/{path}"), Some("tok"));
        let err = client.fetch_day_attribution(day()).await.unwrap_err();
        assert!(matches!(err, CollectError::MalformedResponse(_)), "{path}: {err:?}");
    }
}

#[tokio::test]
async fn test_management_bad_token() {
    let addr = management().await;
    let client = management_client(format!("http://{addr}/keyed"), Some("wrong"));
    let err = client.fetch_day_attribution(day()).await.unwrap_err();
    assert!(matches!(err, CollectError::AttributionFailed { ref cause } if cause.contains("401")));
}

#[tokio::test]
async fn test_management_without_token_is_skipped() {
    // nothing listens here; no request may be made
    let port = closed_port().await;
    let client = management_client(format!("http://127.0.0.1:{port}/keyed"), None);
    assert_eq!(
        client.fetch_day_attribution(day()).await.unwrap(),
        AttributionOutcome::Skipped
    );
}

#[tokio::test]
async fn test_management_connection_refused() {
    let port = closed_port().await;
    let client = management_client(format!("http://127.0.0.1:{port}/keyed"), Some("tok"));
    let err = client.fetch_day_attribution(day()).await.unwrap_err();
    assert!(matches!(err, CollectError::AttributionFailed { .. }));
}

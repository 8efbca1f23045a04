use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use tower::ServiceExt;

use smsfleet::api::router;
use smsfleet::history::{HistoryRecord, HistoryStore, Status};

async fn store_with_five(dir: &std::path::Path) -> HistoryStore {
    let store = HistoryStore::new(dir.join("history.jsonl"), 7);
    let now = Utc::now();
    for i in 0..5 {
        store
            .append(&HistoryRecord {
                timestamp: now - Duration::minutes(10 - i),
                name: format!("R{i}"),
                phone_number: format!("551199999000{i}"),
                message: "Oi".into(),
                flash: false,
                status: if i % 2 == 0 { Status::Sent } else { Status::Failed },
                modem: "/dev/ttyUSB0".into(),
            })
            .await
            .unwrap();
    }
    store
}

async fn get(store: HistoryStore, uri: &str) -> (StatusCode, Option<String>, serde_json::Value) {
    let response = router(store)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let cache = response
        .headers()
        .get("cache-control")
        .map(|v| v.to_str().unwrap().to_string());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, cache, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn limit_returns_the_newest_records() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_with_five(tmp.path()).await;

    let (status, cache, body) = get(store, "/history?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("no-store"));
    let names: Vec<_> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["R3", "R4"]);
    assert_eq!(body[0]["phoneNumber"], "5511999990003");
    assert_eq!(body[0]["status"], "FAILED");
}

#[tokio::test]
async fn bad_parameters_are_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_with_five(tmp.path()).await;

    let (status, _, body) = get(store.clone(), "/history?limit=abc&since=garbage").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 5);

    let since = (Utc::now() - Duration::seconds(450)).to_rfc3339();
    let uri = format!("/history?since={}", since.replace('+', "%2B"));
    let (_, _, body) = get(store, &uri).await;
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn health_and_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let store = HistoryStore::new(tmp.path().join("history.jsonl"), 7);

    let (status, cache, body) = get(store.clone(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("no-store"));
    assert_eq!(body, serde_json::json!({ "status": "ok" }));

    let (status, cache, body) = get(store.clone(), "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(cache.as_deref(), Some("no-store"));
    assert_eq!(body, serde_json::json!({ "error": "not_found" }));

    // empty store
    let (_, _, body) = get(store, "/history").await;
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn expired_records_never_returned() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("history.jsonl");
    let store = HistoryStore::new(&path, 7);
    let old = HistoryRecord {
        timestamp: Utc::now() - Duration::days(7) - Duration::minutes(1),
        name: "Old".into(),
        phone_number: "5511999990000".into(),
        message: "x".into(),
        flash: false,
        status: Status::Sent,
        modem: "/dev/ttyUSB0".into(),
    };
    std::fs::write(&path, serde_json::to_string(&old).unwrap() + "\n").unwrap();

    let (_, _, body) = get(store.clone(), "/history").await;
    assert_eq!(body, serde_json::json!([]));
    // the query purged it physically as well
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.trim().is_empty());
    assert_eq!(store.purge_expired().await.unwrap(), 0);
}

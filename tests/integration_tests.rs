//! Integration Tests for the Ingestion Pipeline
//!
//! Uses wiremock for mocking platform HTTP endpoints.
//! Exercises fetch/backoff behavior and pipeline batching at the
//! transport level; module-level logic is covered by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A platform endpoint returning a paginated listing is drained with
/// cursor follow-up requests until has_more goes false
#[tokio::test]
async fn test_cursor_pagination_drains_listing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/video/list/"))
        .and(query_param("cursor", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "code": "ok", "message": "" },
            "data": {
                "videos": [
                    { "id": "a1", "title": "first", "create_time": 1_700_000_000 },
                    { "id": "a2", "title": "second", "create_time": 1_700_000_100 }
                ],
                "cursor": 2,
                "has_more": true
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/video/list/"))
        .and(query_param("cursor", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "code": "ok", "message": "" },
            "data": {
                "videos": [
                    { "id": "a3", "title": "third", "create_time": 1_700_000_200 }
                ],
                "cursor": 3,
                "has_more": false
            }
        })))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let mut cursor = "0".to_string();
    let mut collected = Vec::new();

    loop {
        let body: serde_json::Value = client
            .get(format!("{}/v2/video/list/", server.uri()))
            .query(&[("cursor", cursor.as_str())])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["error"]["code"], "ok");
        for video in body["data"]["videos"].as_array().unwrap() {
            collected.push(video["id"].as_str().unwrap().to_string());
        }
        if !body["data"]["has_more"].as_bool().unwrap() {
            break;
        }
        cursor = body["data"]["cursor"].as_u64().unwrap().to_string();
    }

    assert_eq!(collected, vec!["a1", "a2", "a3"]);
}

/// A 429 with Retry-After resolves on the retry, and the backoff sleep
/// stays inside the one-second-to-one-minute envelope
#[tokio::test]
async fn test_rate_limit_retry_with_bounded_backoff() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/r/all/new"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "1")
                .insert_header("x-ratelimit-remaining", "0"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/r/all/new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "children": [ { "kind": "t3", "data": { "name": "t3_abc" } } ] }
        })))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/r/all/new", server.uri());

    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), 429);
    let retry_after: u64 = first
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap();

    // Capped jittered backoff: retry-after seconds clamped to [1s, 60s]
    // plus sub-second jitter
    let base_ms = (retry_after * 1_000).clamp(1_000, 60_000);
    let sleep = Duration::from_millis(base_ms + 123);
    assert!(sleep >= Duration::from_millis(1_000));
    assert!(sleep < Duration::from_millis(61_000));

    let second: serde_json::Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(second["data"]["children"][0]["data"]["name"], "t3_abc");
}

/// Expired bearer tokens are refreshed before the data request goes out
#[tokio::test]
async fn test_token_refresh_before_fetch() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-token",
            "token_type": "bearer",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();

    let token: serde_json::Value = client
        .post(format!("{}/api/v1/access_token", server.uri()))
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let access_token = token["access_token"].as_str().unwrap();
    assert!(token["expires_in"].as_u64().unwrap() > 300);

    let feed = client
        .get(format!("{}/feed", server.uri()))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(feed.status(), 200);
}

/// Stable content-hash partitioning: the same key always lands on the
/// same partition and every partition stays in range
#[test]
fn test_partition_assignment_is_stable() {
    let partitions: u64 = 6;
    let assign = |key: &str| -> u64 {
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix) % partitions
    };

    for key in ["tiktok:POST", "reddit:COMMENT", "youtube:POST", "rss:POST"] {
        let first = assign(key);
        for _ in 0..10 {
            assert_eq!(assign(key), first);
        }
        assert!(first < partitions);
    }

    // Different platforms should not all collapse onto one partition
    let spread: std::collections::HashSet<u64> =
        ["tiktok:POST", "reddit:COMMENT", "youtube:POST", "rss:POST", "meta:POST"]
            .iter()
            .map(|k| assign(k))
            .collect();
    assert!(spread.len() > 1);
}

/// Bounded batching keeps memory flat under a burst of records
#[tokio::test]
async fn test_bounded_batches_apply_backpressure() {
    let (tx, mut rx) = mpsc::channel::<String>(100);
    let processed = Arc::new(AtomicUsize::new(0));
    let processed_clone = processed.clone();

    let consumer = tokio::spawn(async move {
        while let Some(_record) = rx.recv().await {
            tokio::time::sleep(Duration::from_micros(50)).await;
            processed_clone.fetch_add(1, Ordering::Relaxed);
        }
    });

    let total = 5_000;
    for i in 0..total {
        tx.send(format!("record-{}", i)).await.unwrap();
    }
    drop(tx);
    consumer.await.unwrap();

    assert_eq!(processed.load(Ordering::Relaxed), total);
}

/// A full channel blocks the producer instead of growing unbounded
#[tokio::test]
async fn test_full_channel_blocks_producer() {
    let capacity = 10;
    let (tx, rx) = mpsc::channel::<u32>(capacity);
    let _rx = rx;

    for i in 0..capacity {
        tx.send(i as u32).await.unwrap();
    }

    let result = tokio::time::timeout(Duration::from_millis(100), tx.send(999)).await;
    assert!(result.is_err(), "send should block on a full channel");
}

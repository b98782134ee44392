//! Back-to-back RPC: two connections over a socketpair, one serving the
//! canned test service.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use dispatcher_core::{CallOptions, ClientError};
use dispatcher_proto::errnos;
use dispatcher_test_utils::back_to_back;

// ---------------------------------------------------------------------------
// Plain request/response
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hello_round_trip() {
    let pair = back_to_back(false).await;
    let result = pair
        .client
        .call("test.hello", json!(["freenas"]))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(result, "Hello World, freenas");
}

/// With streaming disabled on the serving side, generator methods come
/// back as one materialized list.
#[tokio::test]
async fn iterator_compat_returns_full_list() {
    let pair = back_to_back(false).await;
    let result = pair
        .client
        .call("test.iterator", json!([10]))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(result, json!([0, 2, 4, 6, 8, 10, 12, 14, 16, 18]));
}

/// Extension values survive the wire unchanged (echo round-trip).
#[tokio::test]
async fn codec_extensions_round_trip() {
    let pair = back_to_back(false).await;
    let payload = json!([{
        "when": {"$date": "2016-03-01T12:30:00Z"},
        "blob": {"$binary": "AAEC/w=="},
        "mask": {"$regex": "server\\..*"},
        "secret": {"$password": "hunter2"},
    }]);
    let result = pair
        .client
        .call("test.echo", payload.clone())
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(result, payload);
}

// ---------------------------------------------------------------------------
// Timeouts and teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unanswered_call_times_out_with_etimedout() {
    let pair = back_to_back(false).await;

    let kinds: Arc<Mutex<Vec<ClientError>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    pair.client.on_error(Arc::new(move |kind| {
        sink.lock().unwrap().push(kind);
    }));

    let err = pair
        .client
        .call_with(
            "test.never",
            json!([]),
            CallOptions {
                timeout: Some(Duration::from_secs(1)),
                ..CallOptions::default()
            },
        )
        .await
        .err()
        .expect("deadline must expire");
    assert_eq!(err.code, errnos::ETIMEDOUT);
    assert!(
        kinds.lock().unwrap().contains(&ClientError::RpcCallTimeout),
        "error callback must report the timeout"
    );
}

#[tokio::test]
async fn peer_close_drops_pending_calls() {
    let pair = back_to_back(false).await;

    let kinds: Arc<Mutex<Vec<ClientError>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    pair.client.on_error(Arc::new(move |kind| {
        sink.lock().unwrap().push(kind);
    }));

    let client = pair.client.clone();
    let pending = tokio::spawn(async move {
        client
            .call_with(
                "test.never",
                json!([]),
                CallOptions {
                    timeout: Some(Duration::from_secs(30)),
                    ..CallOptions::default()
                },
            )
            .await
    });

    // Let the call land before tearing the server down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    pair.server.disconnect().await;

    let err = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending call must fail promptly")
        .unwrap()
        .err()
        .expect("dropped call fails");
    assert_eq!(err.code, errnos::ECONNABORTED);
    assert!(
        kinds
            .lock()
            .unwrap()
            .contains(&ClientError::ConnectionClosed)
    );
    assert!(!pair.client.connected());
}

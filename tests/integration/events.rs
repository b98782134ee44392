//! Event delivery: subscription filtering, bursts, wait helpers, logout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use dispatcher_core::ClientError;
use dispatcher_test_utils::{BackToBackPair, back_to_back};

/// Completes a request round-trip so every frame the client sent before it
/// (subscriptions included) has been processed by the peer.
async fn settle(pair: &BackToBackPair) {
    pair.client
        .call("test.hello", json!(["sync"]))
        .await
        .unwrap()
        .into_value()
        .unwrap();
}

fn recording_callback(log: &Arc<Mutex<Vec<(String, Value)>>>) -> dispatcher_core::EventCallback {
    let log = Arc::clone(log);
    Arc::new(move |name, args| {
        log.lock().unwrap().push((name.to_owned(), args.clone()));
    })
}

async fn wait_for_events(log: &Arc<Mutex<Vec<(String, Value)>>>, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if log.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("expected events did not arrive");
}

// ---------------------------------------------------------------------------
// Mask filtering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscriber_sees_only_matching_events() {
    let pair = back_to_back(false).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    pair.client.on_event(recording_callback(&log));

    pair.client.subscribe_events(&["server.*"]).await.unwrap();
    settle(&pair).await;

    pair.server
        .emit_event_filtered("server.started", json!({}))
        .await
        .unwrap();
    pair.server
        .emit_event_filtered("client.ping", json!({}))
        .await
        .unwrap();
    // A matching trailer event proves the non-matching one was dropped,
    // not merely delayed.
    pair.server
        .emit_event_filtered("server.done", json!({}))
        .await
        .unwrap();

    wait_for_events(&log, 2).await;
    let names: Vec<String> = log.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, vec!["server.started", "server.done"]);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let pair = back_to_back(false).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    pair.client.on_event(recording_callback(&log));

    pair.client.subscribe_events(&["server.*"]).await.unwrap();
    settle(&pair).await;
    pair.server
        .emit_event_filtered("server.one", json!({}))
        .await
        .unwrap();
    wait_for_events(&log, 1).await;

    pair.client.unsubscribe_events(&["server.*"]).await.unwrap();
    settle(&pair).await;
    pair.server
        .emit_event_filtered("server.two", json!({}))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(log.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Bursts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn burst_preserves_emission_order_across_names() {
    let pair = back_to_back(false).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    pair.client.on_event(recording_callback(&log));

    pair.server.enable_event_burst(100, None);
    pair.server.emit_event("alpha.one", json!({"n": 1})).await.unwrap();
    pair.server.emit_event("beta.two", json!({"n": 2})).await.unwrap();
    pair.server.emit_event("alpha.three", json!({"n": 3})).await.unwrap();
    pair.server.flush_events().await.unwrap();

    wait_for_events(&log, 3).await;
    let names: Vec<String> = log.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, vec!["alpha.one", "beta.two", "alpha.three"]);
}

#[tokio::test]
async fn burst_flushes_at_the_event_cap() {
    let pair = back_to_back(false).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    pair.client.on_event(recording_callback(&log));

    pair.server.enable_event_burst(2, None);
    pair.server.emit_event("cap.one", json!({})).await.unwrap();
    pair.server.emit_event("cap.two", json!({})).await.unwrap();

    // Cap reached: both events arrive without an explicit flush.
    wait_for_events(&log, 2).await;
}

// ---------------------------------------------------------------------------
// Wait helpers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exec_and_wait_catches_the_triggered_event() {
    let pair = back_to_back(false).await;

    let server = pair.server.clone();
    let signalled = pair
        .client
        .exec_and_wait_for_event(
            "job.finished",
            |args| args["id"] == 7,
            move || async move {
                // The operation triggers the event on the peer.
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = server.emit_event("job.finished", json!({"id": 7})).await;
                });
                Ok(())
            },
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert!(signalled);
}

#[tokio::test]
async fn test_or_wait_short_circuits_on_initial_condition() {
    let pair = back_to_back(false).await;
    let signalled = pair
        .client
        .test_or_wait_for_event(
            "job.finished",
            |_| true,
            || true,
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    assert!(signalled);
}

#[tokio::test]
async fn wait_times_out_when_nothing_matches() {
    let pair = back_to_back(false).await;
    let signalled = pair
        .client
        .test_or_wait_for_event(
            "job.finished",
            |_| true,
            || false,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert!(!signalled);
}

// ---------------------------------------------------------------------------
// Logout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn logout_reaches_the_error_callback() {
    let pair = back_to_back(false).await;
    let kinds: Arc<Mutex<Vec<ClientError>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    pair.client.on_error(Arc::new(move |kind| {
        sink.lock().unwrap().push(kind);
    }));

    pair.server.send_logout().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if kinds.lock().unwrap().contains(&ClientError::Logout) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("logout must be surfaced");
}

//! Streaming responses: ordered iteration, random-access views, abort.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use dispatcher_core::{CallOptions, CallbackEvent};
use dispatcher_test_utils::back_to_back;

fn expected_doubles(count: u64) -> Vec<Value> {
    (0..count).map(|i| json!(i * 2)).collect()
}

// ---------------------------------------------------------------------------
// Ordered iteration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn iterator_yields_values_in_order() {
    let pair = back_to_back(true).await;
    let stream = pair
        .client
        .call("test.iterator", json!([10]))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert_eq!(stream.collect().await.unwrap(), expected_doubles(10));
}

#[tokio::test]
async fn iterator_pulls_one_fragment_at_a_time() {
    let pair = back_to_back(true).await;
    let mut stream = pair
        .client
        .call("test.iterator", json!([3]))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert_eq!(stream.next().await.unwrap(), Some(json!(0)));
    assert_eq!(stream.next().await.unwrap(), Some(json!(2)));
    assert_eq!(stream.next().await.unwrap(), Some(json!(4)));
    assert_eq!(stream.next().await.unwrap(), None);
    // Past the end the iterator stays finished
    assert_eq!(stream.next().await.unwrap(), None);
}

#[tokio::test]
async fn empty_iterator_ends_immediately() {
    let pair = back_to_back(true).await;
    let mut stream = pair
        .client
        .call("test.iterator", json!([0]))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert_eq!(stream.next().await.unwrap(), None);
}

// ---------------------------------------------------------------------------
// Random-access views
// ---------------------------------------------------------------------------

#[tokio::test]
async fn view_supports_random_access_and_replay() {
    let pair = back_to_back(true).await;
    let view = pair
        .client
        .call_with(
            "test.iterator",
            json!([16]),
            CallOptions {
                view: true,
                ..CallOptions::default()
            },
        )
        .await
        .unwrap()
        .into_view()
        .unwrap();

    // Jump ahead, then back
    assert_eq!(view.get(9).await.unwrap(), json!(18));
    assert_eq!(view.get(2).await.unwrap(), json!(4));
    // Same index again: answered from the local cache
    assert_eq!(view.get(9).await.unwrap(), json!(18));

    view.close().await.unwrap();
    let err = view.get(0).await.err().expect("closed view fails");
    assert_eq!(err.message, "Call is closed");
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_frees_the_call_and_the_connection_stays_usable() {
    let pair = back_to_back(true).await;
    let mut stream = pair
        .client
        .call("test.iterator", json!([1000]))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert_eq!(stream.next().await.unwrap(), Some(json!(0)));
    assert_eq!(stream.next().await.unwrap(), Some(json!(2)));
    stream.abort().await.unwrap();

    // The connection keeps working after the cancelled stream.
    let result = pair
        .client
        .call("test.hello", json!(["still alive"]))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(result, "Hello World, still alive");
}

/// An in-flight stream observes connection teardown as `ECONNABORTED`,
/// not as an unknown-call lookup failure.
#[tokio::test]
async fn peer_close_fails_in_flight_stream_with_econnaborted() {
    let pair = back_to_back(true).await;
    let mut stream = pair
        .client
        .call("test.iterator", json!([1000]))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert_eq!(stream.next().await.unwrap(), Some(json!(0)));
    assert_eq!(stream.next().await.unwrap(), Some(json!(2)));

    pair.server.disconnect().await;

    // Drain whatever was already buffered; the stream must then fail with
    // the teardown error rather than end cleanly or report ENOENT.
    let err = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("dropped stream must surface an error"),
                Err(err) => break err,
            }
        }
    })
    .await
    .expect("stream must fail promptly after teardown");
    assert_eq!(err.code, dispatcher_proto::errnos::ECONNABORTED);
}

// ---------------------------------------------------------------------------
// Async callback delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn call_async_reports_fragments_and_auto_continues() {
    let pair = back_to_back(true).await;

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));
    let fragments: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fragments);

    pair.client
        .call_async(
            "test.iterator",
            json!([5]),
            Arc::new(move |event| match event {
                CallbackEvent::Fragment(value) => {
                    sink.lock().unwrap().push(value);
                    // Request the next fragment
                    true
                }
                CallbackEvent::End => {
                    if let Some(tx) = done_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    false
                }
                CallbackEvent::Response(_) | CallbackEvent::Error(_) => false,
            }),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .expect("stream must end")
        .unwrap();
    assert_eq!(*fragments.lock().unwrap(), expected_doubles(5));
}

//! Listening endpoints: unix:// and ws:// servers with real clients.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use dispatcher_core::{Connection, ServerBuilder};
use dispatcher_test_utils::test_context;

async fn wait_for_connections(server: &dispatcher_core::Server, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.connection_count() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("clients did not connect");
}

// ---------------------------------------------------------------------------
// unix://
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unix_server_answers_hello() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dispatcher.sock");
    let url = format!("unix://{}", path.display());

    let server = ServerBuilder::new(test_context())
        .streaming(true)
        .bind(&url)
        .await
        .unwrap();
    let accept = server.clone();
    tokio::spawn(async move { accept.serve().await });

    let client = Connection::connect(&url).await.unwrap();
    let result = client
        .call("test.hello", json!(["freenas"]))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(result, "Hello World, freenas");
}

#[tokio::test]
async fn broadcast_respects_per_connection_masks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dispatcher.sock");
    let url = format!("unix://{}", path.display());

    let server = ServerBuilder::new(test_context()).bind(&url).await.unwrap();
    let accept = server.clone();
    tokio::spawn(async move { accept.serve().await });

    let subscriber = Connection::connect(&url).await.unwrap();
    let bystander = Connection::connect(&url).await.unwrap();
    wait_for_connections(&server, 2).await;

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    subscriber.on_event(Arc::new(move |name, _args: &Value| {
        sink.lock().unwrap().push(name.to_owned());
    }));
    let bystander_seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&bystander_seen);
    bystander.on_event(Arc::new(move |name, _args: &Value| {
        sink.lock().unwrap().push(name.to_owned());
    }));

    subscriber.subscribe_events(&["server.*"]).await.unwrap();
    bystander.subscribe_events(&["other.*"]).await.unwrap();
    // Round-trips guarantee the subscriptions were processed.
    subscriber.call("test.hello", json!(["a"])).await.unwrap();
    bystander.call("test.hello", json!(["b"])).await.unwrap();

    server.broadcast_event("server.started", json!({})).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber must receive the broadcast");
    assert_eq!(*seen.lock().unwrap(), vec!["server.started"]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        bystander_seen.lock().unwrap().is_empty(),
        "non-matching connection must not receive the broadcast"
    );
}

#[tokio::test]
async fn unix_server_delivers_client_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dispatcher.sock");
    let url = format!("unix://{}", path.display());

    let server = ServerBuilder::new(test_context()).bind(&url).await.unwrap();
    let accept = server.clone();
    tokio::spawn(async move { accept.serve().await });

    let client = Connection::connect(&url).await.unwrap();
    // A round-trip guarantees the connection is fully open on both sides.
    client.call("test.hello", json!(["creds"])).await.unwrap();

    let creds = client.credentials().expect("unix transport carries creds");
    assert_eq!(creds.pid, std::process::id() as i32);
}

// ---------------------------------------------------------------------------
// ws://
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ws_server_answers_hello() {
    let server = ServerBuilder::new(test_context())
        .streaming(true)
        .bind("ws://127.0.0.1:0")
        .await
        .unwrap();
    let endpoint = server
        .local_description()
        .await
        .expect("listener is bound");
    let accept = server.clone();
    tokio::spawn(async move { accept.serve().await });

    let client = Connection::connect(&format!("{endpoint}/dispatcher/socket"))
        .await
        .unwrap();
    let result = client
        .call("test.hello", json!(["websocket"]))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(result, "Hello World, websocket");

    // Streaming also works over ws (no descriptors involved).
    let stream = client
        .call("test.iterator", json!([4]))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert_eq!(stream.collect().await.unwrap(), json!([0, 2, 4, 6]).as_array().unwrap().clone());
}

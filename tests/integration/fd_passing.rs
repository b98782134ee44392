//! File-descriptor hand-off over a local socketpair, plus peer
//! credentials.

use std::io::Write;
use std::os::fd::AsRawFd;

use serde_json::json;

use dispatcher_test_utils::back_to_back;

/// Scenario: the caller attaches one descriptor to `fs.hand_off`; the
/// serving side receives a live descriptor for the same underlying file,
/// and the caller's descriptor is closed after transmission.
#[tokio::test]
async fn hand_off_passes_a_live_descriptor() {
    let pair = back_to_back(false).await;

    let mut file = tempfile::tempfile().expect("tempfile");
    file.write_all(b"hand-off payload").unwrap();
    let sent_fd = file.as_raw_fd();

    let meta = file.metadata().unwrap();
    let (local_dev, local_ino) = {
        use std::os::unix::fs::MetadataExt;
        (meta.dev(), meta.ino())
    };

    // Ownership moves to the transport, which closes the descriptor
    // after sending it.
    std::mem::forget(file);
    let result = pair
        .client
        .call("fs.hand_off", json!([{"$fd": sent_fd}]))
        .await
        .unwrap()
        .into_value()
        .unwrap();

    // The peer held a valid descriptor referring to the same file.
    assert_eq!(result["dev"].as_u64().unwrap(), local_dev);
    assert_eq!(result["ino"].as_u64().unwrap(), local_ino);

    // close=true semantics: the sender's descriptor number is gone.
    let flags = unsafe { libc::fcntl(sent_fd, libc::F_GETFD) };
    assert_eq!(flags, -1, "sender-side descriptor must be closed");
}

/// Borrowed descriptors stay open on the sender.
#[tokio::test]
async fn borrowed_descriptor_stays_open() {
    let pair = back_to_back(false).await;

    let file = tempfile::tempfile().expect("tempfile");
    let sent_fd = file.as_raw_fd();

    let result = pair
        .client
        .call("fs.hand_off", json!([{"$fd": sent_fd, "$borrow": true}]))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert!(result["ino"].as_u64().unwrap() > 0);

    let flags = unsafe { libc::fcntl(sent_fd, libc::F_GETFD) };
    assert!(flags >= 0, "borrowed descriptor must remain open");
    drop(file);
}

/// Local socket transports surface the peer's credentials.
#[tokio::test]
async fn socketpair_reports_peer_credentials() {
    let pair = back_to_back(false).await;

    // Both ends live in this process.
    let creds = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if let Some(creds) = pair.client.credentials() {
                break creds;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("credentials must be delivered");

    assert_eq!(creds.pid, std::process::id() as i32);
    assert_eq!(creds.uid, unsafe { libc::getuid() });
    assert_eq!(creds.gid, unsafe { libc::getgid() });
}

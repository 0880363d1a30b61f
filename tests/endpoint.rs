use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use ps4_2ndscreen::ddp;
use ps4_2ndscreen::{Console, DdpEndpoint};

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn credential() -> String {
    "ab".repeat(32)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within timeout");
}

fn status_response(code: u16) -> String {
    if code == 200 {
        ddp::response_message(
            200,
            "Ok",
            &[
                ("host-id", "1234567890AB"),
                ("host-name", "Living PS4"),
                ("host-type", "PS4"),
                ("host-request-port", "997"),
                ("system-version", "07020001"),
                ("running-app-titleid", "CUSA00002"),
                ("running-app-name", "Test Game: Remastered"),
            ],
        )
    } else {
        ddp::response_message(
            620,
            "Server Standby",
            &[
                ("host-id", "1234567890AB"),
                ("host-name", "Living PS4"),
                ("host-type", "PS4"),
                ("host-request-port", "997"),
                ("system-version", "07020001"),
            ],
        )
    }
}

/// Loopback console answering SRCH with the current status code.
async fn spawn_responder() -> (u16, Arc<AtomicU16>, mpsc::UnboundedReceiver<String>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let code = Arc::new(AtomicU16::new(200));
    let (tx, rx) = mpsc::unbounded_channel();
    let responder_code = code.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((len, addr)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let text = String::from_utf8_lossy(&buf[..len]).to_string();
            let is_search = text.starts_with("SRCH");
            let _ = tx.send(text);
            if is_search {
                let reply = status_response(responder_code.load(Ordering::SeqCst));
                let _ = socket.send_to(reply.as_bytes(), addr).await;
            }
        }
    });
    (port, code, rx)
}

#[tokio::test]
async fn polls_update_status_and_fire_callback_on_change_only() {
    let (port, code, _requests) = spawn_responder().await;
    let endpoint = DdpEndpoint::bind_to(0, port, 5).await.unwrap();
    let console = Console::new(localhost(), &credential(), None, None);
    console.attach(&endpoint);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    console.set_status_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    console.poll().await.unwrap();
    wait_until(|| console.is_available()).await;
    assert!(console.is_running());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(console.host_name(), Some("Living PS4".to_string()));
    assert_eq!(
        console.running_app_name(),
        Some("Test Game: Remastered".to_string())
    );
    assert_eq!(
        console.running_app_titleid(),
        Some("CUSA00002".to_string())
    );

    // unchanged status keeps the callback quiet
    console.poll().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    code.store(620, Ordering::SeqCst);
    console.poll().await.unwrap();
    wait_until(|| console.is_standby()).await;
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(console.running_app_titleid(), None);
}

#[tokio::test]
async fn unanswered_polls_mark_unreachable_once() {
    // bound but mute: polls land in a socket nobody reads
    let mute = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = mute.local_addr().unwrap().port();

    let endpoint = DdpEndpoint::bind_to(0, port, 2).await.unwrap();
    let console = Console::new(localhost(), &credential(), None, None);
    console.attach(&endpoint);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    console.set_status_callback(move |status| {
        assert!(status.is_none());
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..3 {
        console.poll().await.unwrap();
    }
    assert!(console.is_unreachable());
    assert!(!console.is_available());
    assert_eq!(console.status(), None);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // further dead polls do not refire the callback
    console.poll().await.unwrap();
    console.poll().await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    drop(mute);
}

#[tokio::test]
async fn standby_transition_suppresses_sends_briefly() {
    let (port, code, mut requests) = spawn_responder().await;
    let endpoint = DdpEndpoint::bind_to(0, port, 5).await.unwrap();
    let console = Console::new(localhost(), &credential(), None, None);
    console.attach(&endpoint);

    console.poll().await.unwrap();
    wait_until(|| console.is_running()).await;
    // drain the poll we just made
    while requests.try_recv().is_ok() {}

    code.store(620, Ordering::SeqCst);
    console.poll().await.unwrap();
    wait_until(|| console.is_standby()).await;
    while requests.try_recv().is_ok() {}

    // inside the backoff window the wakeup is dropped on the floor
    console.wakeup().await.unwrap();
    let quiet = timeout(Duration::from_millis(400), requests.recv()).await;
    assert!(quiet.is_err(), "send should be suppressed after standby");
}

#[tokio::test]
async fn observers_prune_with_their_consoles() {
    let (port, _code, _requests) = spawn_responder().await;
    let endpoint = DdpEndpoint::bind_to(0, port, 5).await.unwrap();

    let first = Console::new(localhost(), &credential(), None, None);
    let second = Console::new(localhost(), &credential(), None, None);
    first.attach(&endpoint);
    second.attach(&endpoint);
    assert!(endpoint.has_observers(localhost()));

    first.detach();
    assert!(endpoint.has_observers(localhost()));
    second.detach();
    assert!(!endpoint.has_observers(localhost()));

    // a dropped console prunes lazily through its weak reference
    let third = Console::new(localhost(), &credential(), None, None);
    third.attach(&endpoint);
    assert!(endpoint.has_observers(localhost()));
    drop(third);
    assert!(!endpoint.has_observers(localhost()));
}

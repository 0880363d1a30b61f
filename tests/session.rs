use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

use ps4_2ndscreen::crypto::{self, FrameDecryptor, FrameEncryptor};
use ps4_2ndscreen::ddp;
use ps4_2ndscreen::packets;
use ps4_2ndscreen::{Console, ConsoleError, DdpEndpoint};

const SEED: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn credential() -> String {
    "cd".repeat(32)
}

fn frame_kind(frame: &[u8]) -> u32 {
    u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]])
}

fn rc_op(frame: &[u8]) -> u32 {
    u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]])
}

fn rc_hold(frame: &[u8]) -> u32 {
    u32::from_le_bytes([frame[12], frame[13], frame[14], frame[15]])
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

#[derive(Clone)]
struct MockOptions {
    initial_code: u16,
    login_reply: u8,
    heartbeat_before_standby: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            initial_code: 200,
            login_reply: 0x00,
            heartbeat_before_standby: false,
        }
    }
}

enum Action {
    Heartbeat,
}

struct Mock {
    udp_port: u16,
    tcp_port: u16,
    code: Arc<AtomicU16>,
    udp_requests: mpsc::UnboundedReceiver<String>,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    actions: mpsc::UnboundedSender<Action>,
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

fn hello_ack() -> Vec<u8> {
    let mut msg = Vec::with_capacity(packets::HELLO_ACK_LEN);
    msg.extend_from_slice(&36u32.to_le_bytes());
    msg.extend_from_slice(&0x6f63_6370u32.to_le_bytes());
    msg.extend_from_slice(&[0x00, 0x00, 0x02, 0x00]);
    msg.extend_from_slice(&[0u8; 8]);
    msg.extend_from_slice(&SEED);
    msg
}

fn reply_frame(byte4: u8, byte8: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 16];
    frame[0] = 0x10;
    frame[4] = byte4;
    frame[8] = byte8;
    frame
}

async fn read_mock_frame(stream: &mut TcpStream, dec: &mut FrameDecryptor) -> Option<Vec<u8>> {
    let mut block = [0u8; 16];
    stream.read_exact(&mut block).await.ok()?;
    dec.decrypt(&mut block);
    let declared = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    let total = declared.max(16).div_ceil(16) * 16;
    let mut frame = block.to_vec();
    if total > 16 {
        frame.resize(total, 0);
        stream.read_exact(&mut frame[16..]).await.ok()?;
        dec.decrypt(&mut frame[16..]);
    }
    Some(frame)
}

async fn send_encrypted(stream: &mut TcpStream, enc: &mut FrameEncryptor, frame: Vec<u8>) {
    let mut buf = frame;
    enc.encrypt(&mut buf);
    stream.write_all(&buf).await.unwrap();
}

/// Scripted console: DDP responder plus a single-connection TCP side that
/// answers login/standby/boot and records every decrypted frame.
async fn start_mock(options: MockOptions) -> Mock {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_port = udp.local_addr().unwrap().port();
    let code = Arc::new(AtomicU16::new(options.initial_code));
    let (udp_tx, udp_requests) = mpsc::unbounded_channel();
    let responder_code = code.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((len, addr)) = udp.recv_from(&mut buf).await else {
                break;
            };
            let text = String::from_utf8_lossy(&buf[..len]).to_string();
            let is_search = text.starts_with("SRCH");
            let _ = udp_tx.send(text);
            if is_search {
                let reply = status_response(responder_code.load(Ordering::SeqCst));
                let _ = udp.send_to(reply.as_bytes(), addr).await;
            }
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_port = listener.local_addr().unwrap().port();
    let (frame_tx, frames) = mpsc::unbounded_channel();
    let (actions, mut action_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut hello = [0u8; packets::HELLO_LEN];
        if stream.read_exact(&mut hello).await.is_err() {
            return;
        }
        stream.write_all(&hello_ack()).await.unwrap();
        let mut handshake = [0u8; 280];
        if stream.read_exact(&mut handshake).await.is_err() {
            return;
        }
        let (mut enc, mut dec) = crypto::session_ciphers(&SEED);
        let mut actions_open = true;
        loop {
            tokio::select! {
                frame = read_mock_frame(&mut stream, &mut dec) => {
                    let Some(frame) = frame else { break };
                    let kind = frame_kind(&frame);
                    let _ = frame_tx.send(frame);
                    match kind {
                        0x1e => {
                            send_encrypted(&mut stream, &mut enc, reply_frame(0x07, options.login_reply)).await;
                        }
                        0x1a => {
                            if options.heartbeat_before_standby {
                                send_encrypted(&mut stream, &mut enc, packets::HEARTBEAT.to_vec()).await;
                            }
                            send_encrypted(&mut stream, &mut enc, reply_frame(0x1b, 0)).await;
                        }
                        0x0a => {
                            send_encrypted(&mut stream, &mut enc, reply_frame(0x0b, 0)).await;
                        }
                        _ => {}
                    }
                }
                action = action_rx.recv(), if actions_open => {
                    match action {
                        Some(Action::Heartbeat) => {
                            send_encrypted(&mut stream, &mut enc, packets::HEARTBEAT.to_vec()).await;
                        }
                        None => actions_open = false,
                    }
                }
            }
        }
    });

    Mock {
        udp_port,
        tcp_port,
        code,
        udp_requests,
        frames,
        actions,
    }
}

async fn recv_frame(mock: &mut Mock) -> Vec<u8> {
    timeout(Duration::from_secs(5), mock.frames.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("mock console stopped")
}

async fn connected_console(options: MockOptions) -> (Console, DdpEndpoint, Mock) {
    let mock = start_mock(options).await;
    let endpoint = DdpEndpoint::bind_to(0, mock.udp_port, 5).await.unwrap();
    let console = Console::new(
        localhost(),
        &credential(),
        Some("test-device"),
        Some(mock.tcp_port),
    );
    console.attach(&endpoint);
    console.set_login_delay(Duration::ZERO);
    console.poll().await.unwrap();
    wait_until(|| console.is_available()).await;
    (console, endpoint, mock)
}

/// Logs in and consumes the login frame plus the user-select PS tap.
async fn login_and_drain(console: &Console, mock: &mut Mock) -> Vec<u8> {
    console.login(None).await.unwrap();
    let login = recv_frame(mock).await;
    assert_eq!(frame_kind(&login), 0x1e);
    for expected_op in [1024, 128, 128, 256] {
        let frame = recv_frame(mock).await;
        assert_eq!(frame_kind(&frame), 0x1c);
        assert_eq!(rc_op(&frame), expected_op);
    }
    login
}

#[tokio::test]
async fn handshake_and_login_frame_fields() {
    let (console, _endpoint, mut mock) = connected_console(MockOptions::default()).await;
    let login = login_and_drain(&console, &mut mock).await;
    assert!(console.is_connected());
    assert!(console.is_logged_in());

    // the mock decrypted this with key 10 00*15 and IV equal to the seed,
    // so field assertions double as proof of the cipher setup
    let credential = credential();
    assert_eq!(&login[16..80], credential.as_bytes());
    assert_eq!(&login[80..91], b"test-device");
    assert!(login[91..336].iter().all(|&b| b == 0));
    assert_eq!(&login[336..339], b"4.4");
    assert_eq!(&login[352..363], b"test-device");
    assert!(login[368..384].iter().all(|&b| b == 0));
}

#[tokio::test]
async fn refused_login_closes_the_session() {
    let options = MockOptions {
        login_reply: 0xff,
        ..MockOptions::default()
    };
    let (console, _endpoint, _mock) = connected_console(options).await;
    let err = console.login(None).await.unwrap_err();
    assert!(matches!(err, ConsoleError::LoginFailed));
    wait_until(|| !console.is_connected()).await;
    assert!(!console.is_logged_in());
}

#[tokio::test]
async fn button_press_emits_the_four_frame_sequence() {
    let (console, _endpoint, mut mock) = connected_console(MockOptions::default()).await;
    login_and_drain(&console, &mut mock).await;

    console.remote_control("enter", 0).await.unwrap();
    let expected = [(1024, 0), (16, 0), (256, 0), (2048, 0)];
    for (expected_op, expected_hold) in expected {
        let frame = recv_frame(&mut mock).await;
        assert_eq!(frame_kind(&frame), 0x1c);
        assert_eq!(rc_op(&frame), expected_op);
        assert_eq!(rc_hold(&frame), expected_hold);
    }
}

#[tokio::test]
async fn unknown_button_is_rejected_without_traffic() {
    let (console, _endpoint, mut mock) = connected_console(MockOptions::default()).await;
    login_and_drain(&console, &mut mock).await;
    let err = console.remote_control("triangle", 0).await.unwrap_err();
    assert!(matches!(err, ConsoleError::UnknownButton(name) if name == "triangle"));
    let quiet = timeout(Duration::from_millis(200), mock.frames.recv()).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn ps_hold_delays_the_key_off_a_full_second() {
    let (console, _endpoint, mut mock) = connected_console(MockOptions::default()).await;
    login_and_drain(&console, &mut mock).await;

    let started = Instant::now();
    console.remote_control("ps_hold", 0).await.unwrap();
    let held = started.elapsed();

    let expected = [(1024, 0), (128, 0), (128, 1), (256, 0)];
    for (expected_op, expected_hold) in expected {
        let frame = recv_frame(&mut mock).await;
        assert_eq!(rc_op(&frame), expected_op);
        assert_eq!(rc_hold(&frame), expected_hold);
    }
    // the command holds the task slot until the delayed key-off went out
    assert!(held >= Duration::from_millis(950), "returned after {held:?}");
    // and the PS variant never closes the remote-control surface
    let quiet = timeout(Duration::from_millis(300), mock.frames.recv()).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn start_title_auto_confirms_the_close_prompt() {
    let (console, _endpoint, mut mock) = connected_console(MockOptions::default()).await;
    login_and_drain(&console, &mut mock).await;

    console
        .start_title("CUSA00001", Some("CUSA00002"))
        .await
        .unwrap();
    let boot = recv_frame(&mut mock).await;
    assert_eq!(frame_kind(&boot), 0x0a);
    assert_eq!(&boot[8..17], b"CUSA00001");
    let booted_at = Instant::now();

    let expected = [(1024, 0), (16, 0), (256, 0), (2048, 0)];
    for (index, (expected_op, expected_hold)) in expected.into_iter().enumerate() {
        let frame = recv_frame(&mut mock).await;
        if index == 0 {
            let waited = booted_at.elapsed();
            assert!(waited >= Duration::from_millis(900), "enter after {waited:?}");
        }
        assert_eq!(rc_op(&frame), expected_op);
        assert_eq!(rc_hold(&frame), expected_hold);
    }
}

#[tokio::test]
async fn same_title_skips_the_confirm_press() {
    let (console, _endpoint, mut mock) = connected_console(MockOptions::default()).await;
    login_and_drain(&console, &mut mock).await;

    console
        .start_title("CUSA00002", Some("CUSA00002"))
        .await
        .unwrap();
    let boot = recv_frame(&mut mock).await;
    assert_eq!(frame_kind(&boot), 0x0a);
    let quiet = timeout(Duration::from_millis(1500), mock.frames.recv()).await;
    assert!(quiet.is_err(), "no confirm press for the running title");
}

#[tokio::test]
async fn heartbeat_is_acked_and_never_completes_a_command() {
    let options = MockOptions {
        heartbeat_before_standby: true,
        ..MockOptions::default()
    };
    let (console, _endpoint, mut mock) = connected_console(options).await;
    login_and_drain(&console, &mut mock).await;

    // the mock injects a heartbeat between the standby request and its ack;
    // the command must still succeed and the heartbeat must be acked
    console.standby().await.unwrap();
    let standby = recv_frame(&mut mock).await;
    assert_eq!(frame_kind(&standby), 0x1a);
    let ack = recv_frame(&mut mock).await;
    assert_eq!(frame_kind(&ack), 0x14);
}

#[tokio::test]
async fn idle_heartbeats_are_acked() {
    let (console, _endpoint, mut mock) = connected_console(MockOptions::default()).await;
    login_and_drain(&console, &mut mock).await;

    mock.actions.send(Action::Heartbeat).unwrap();
    let ack = recv_frame(&mut mock).await;
    assert_eq!(frame_kind(&ack), 0x14);
    assert!(console.is_connected());
}

#[tokio::test]
async fn missed_heartbeats_trip_the_watchdog() {
    let (console, _endpoint, mut mock) = connected_console(MockOptions::default()).await;
    console.set_heartbeat_timeout(Duration::from_millis(300));
    login_and_drain(&console, &mut mock).await;

    // first heartbeat arms the watchdog; silence afterwards trips it
    mock.actions.send(Action::Heartbeat).unwrap();
    let ack = recv_frame(&mut mock).await;
    assert_eq!(frame_kind(&ack), 0x14);

    wait_until(|| !console.is_connected()).await;
    assert!(!console.is_logged_in());
}

#[tokio::test]
async fn standby_status_tears_down_the_session() {
    let (console, _endpoint, mut mock) = connected_console(MockOptions::default()).await;
    login_and_drain(&console, &mut mock).await;
    assert!(console.is_connected());

    mock.code.store(620, Ordering::SeqCst);
    console.poll().await.unwrap();
    wait_until(|| console.is_standby()).await;
    wait_until(|| !console.is_connected()).await;
    assert!(!console.is_logged_in());
}

#[tokio::test]
async fn queued_command_survives_the_wake_and_newest_wins() {
    let options = MockOptions {
        initial_code: 620,
        ..MockOptions::default()
    };
    let (console, _endpoint, mut mock) = connected_console(options).await;
    assert!(console.is_standby());
    while mock.udp_requests.try_recv().is_ok() {}

    // parked: the console is asleep, so the command waits on a wakeup
    console.start_title("CUSA00001", None).await.unwrap();
    wait_until_request(&mut mock, "WAKEUP").await;

    // a second command overwrites the parked one
    console.remote_control("enter", 0).await.unwrap();
    wait_until_request(&mut mock, "WAKEUP").await;

    // the console comes up; the endpoint notices on the next poll and the
    // scheduler connects, logs in, and drains the newest command only
    mock.code.store(200, Ordering::SeqCst);
    console.poll().await.unwrap();
    wait_until(|| console.is_running()).await;

    let login = recv_frame(&mut mock).await;
    assert_eq!(frame_kind(&login), 0x1e);
    // woken consoles skip the user-select tap: the next frames are the
    // queued enter press, not a PS sequence and not the overwritten boot
    let expected = [(1024, 0), (16, 0), (256, 0), (2048, 0)];
    for (expected_op, expected_hold) in expected {
        let frame = recv_frame(&mut mock).await;
        assert_eq!(frame_kind(&frame), 0x1c);
        assert_eq!(rc_op(&frame), expected_op);
        assert_eq!(rc_hold(&frame), expected_hold);
    }
    let quiet = timeout(Duration::from_millis(300), mock.frames.recv()).await;
    assert!(quiet.is_err(), "the overwritten boot must never run");
}

async fn wait_until_request(mock: &mut Mock, verb: &str) {
    for _ in 0..100 {
        match timeout(Duration::from_millis(100), mock.udp_requests.recv()).await {
            Ok(Some(request)) if request.starts_with(verb) => return,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("mock responder stopped"),
            Err(_) => continue,
        }
    }
    panic!("no {verb} request observed");
}

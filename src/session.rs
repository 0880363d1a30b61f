//! The authenticated TCP control session.
//!
//! One session per console, opened on demand: hello → seed → RSA handshake,
//! then every frame in either direction rides the session's CBC chain. A
//! single task slot serializes commands so frames hit the wire in cipher
//! order; remote-control micro-sequences hold the slot across their timed
//! writes.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::console::ConsoleShared;
use crate::crypto::{self, FrameDecryptor, FrameEncryptor};
use crate::error::ConsoleError;
use crate::packets::{self, op, Button};

/// Upper bound on a declared frame length; anything larger means the cipher
/// chain desynchronized and the session is unrecoverable.
const MAX_FRAME: usize = 4096;

const PS_TAP_DELAY: Duration = Duration::from_millis(500);
const PS_HOLD_DELAY: Duration = Duration::from_secs(1);

struct FrameWriter {
    half: OwnedWriteHalf,
    cipher: FrameEncryptor,
}

struct PendingReply {
    command: &'static str,
    tx: oneshot::Sender<Vec<u8>>,
}

struct SessionShared {
    console: Weak<ConsoleShared>,
    writer: AsyncMutex<Option<FrameWriter>>,
    slot: Arc<AsyncMutex<()>>,
    pending: Mutex<Option<PendingReply>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to one control session.
#[derive(Clone)]
pub(crate) struct TcpSession {
    shared: Arc<SessionShared>,
}

impl TcpSession {
    /// Readies the console's listener with a LAUNCH, connects, and runs the
    /// hello/handshake exchange. The read loop is live when this returns.
    pub(crate) async fn open(console: Arc<ConsoleShared>) -> Result<TcpSession, ConsoleError> {
        console.send_launch().await?;
        let mut stream = TcpStream::connect((console.host, console.tcp_port)).await?;
        stream.set_nodelay(true)?;

        stream.write_all(&packets::hello()).await?;
        let mut ack = [0u8; packets::HELLO_ACK_LEN];
        stream.read_exact(&mut ack).await?;
        let seed =
            packets::parse_hello_ack(&ack).ok_or(ConsoleError::Handshake("short hello ack"))?;
        let (encryptor, decryptor) = crypto::session_ciphers(&seed);
        let wrapped = crypto::wrap_session_key(&mut rand::thread_rng())
            .map_err(|_| ConsoleError::Handshake("rsa key wrap failed"))?;
        stream.write_all(&packets::handshake(&wrapped, &seed)).await?;

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(SessionShared {
            console: Arc::downgrade(&console),
            writer: AsyncMutex::new(Some(FrameWriter {
                half: write_half,
                cipher: encryptor,
            })),
            slot: Arc::new(AsyncMutex::new(())),
            pending: Mutex::new(None),
            read_task: Mutex::new(None),
        });
        let watchdog = console.heartbeat_timeout();
        let handle = tokio::spawn(read_loop(shared.clone(), read_half, decryptor, watchdog));
        *shared.read_task.lock() = Some(handle);
        info!(host = %console.host, "control session established");
        Ok(TcpSession { shared })
    }

    pub(crate) fn same(&self, other: &TcpSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Logs in; a no-op when already logged in. When no pin is involved and
    /// the console was not just woken, a synthesized PS tap dismisses the
    /// user-selection screen.
    pub(crate) async fn login(&self, pin: Option<&str>) -> Result<(), ConsoleError> {
        let console = self.console()?;
        if console.is_logged_in() {
            return Ok(());
        }
        let slot = self.shared.slot.lock().await;
        if console.is_logged_in() {
            return Ok(());
        }
        let powering_on = console.is_powering_on();
        debug!(host = %console.host, "logging in");
        let frame = packets::login(&console.credential, &console.device_name, pin);
        let reply = self.shared.send_expect("login", frame).await?;
        if !packets::login_succeeded(&reply) {
            warn!(host = %console.host, "console refused the login");
            drop(slot);
            self.close().await;
            return Err(ConsoleError::LoginFailed);
        }
        console.set_logged_in(true);
        info!(host = %console.host, "logged in");
        if pin.unwrap_or("").is_empty() && !powering_on {
            self.shared.ps_press(0).await?;
        }
        sleep(console.login_delay()).await;
        Ok(())
    }

    pub(crate) async fn standby(&self) -> Result<(), ConsoleError> {
        let console = self.console()?;
        self.login(None).await?;
        let _slot = self.shared.slot.lock().await;
        let reply = self.shared.send_expect("standby", packets::standby()).await?;
        if !packets::standby_acknowledged(&reply) {
            warn!(host = %console.host, "standby command refused");
            return Err(ConsoleError::CommandRefused("standby"));
        }
        console.set_powering_off(true);
        Ok(())
    }

    /// Boots a title. When a different title was running, an `enter` press
    /// one second later confirms the close-application prompt.
    pub(crate) async fn start_title(
        &self,
        title_id: &str,
        running_id: Option<&str>,
    ) -> Result<(), ConsoleError> {
        let console = self.console()?;
        self.login(None).await?;
        {
            let _slot = self.shared.slot.lock().await;
            debug!(host = %console.host, title_id, "starting title");
            let reply = self
                .shared
                .send_expect("start-title", packets::boot(title_id))
                .await?;
            if !packets::boot_acknowledged(&reply) {
                warn!(host = %console.host, title_id, "start-title refused");
                return Err(ConsoleError::CommandRefused("start-title"));
            }
        }
        if running_id.is_some_and(|running| running != title_id) {
            let session = self.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(1)).await;
                if let Err(err) = session.remote_control(Button::Enter, 0).await {
                    debug!(%err, "auto-confirm press failed");
                }
            });
        }
        Ok(())
    }

    /// Emits one button's frame sequence. The slot is held across the whole
    /// sequence, including the PS variant's delayed key-off, so no other
    /// command can interleave frames. The sequence runs on its own task:
    /// once frames start flushing it completes even if the caller is
    /// cancelled, otherwise the console is left holding a phantom button.
    pub(crate) async fn remote_control(
        &self,
        button: Button,
        hold_ms: u32,
    ) -> Result<(), ConsoleError> {
        self.login(None).await?;
        let hold_ms = button.forced_hold_ms().unwrap_or(hold_ms);
        let slot = self.shared.slot.clone().lock_owned().await;
        debug!(?button, hold_ms, "remote control");
        let shared = self.shared.clone();
        let sequence = tokio::spawn(async move {
            let _slot = slot;
            if button.is_ps() {
                shared.ps_press(hold_ms).await
            } else {
                shared
                    .write_frames(&[
                        packets::remote_control(op::OPEN_RC, 0),
                        packets::remote_control(button.opcode(), hold_ms),
                        packets::remote_control(op::KEY_OFF, 0),
                        packets::remote_control(op::CLOSE_RC, 0),
                    ])
                    .await
            }
        });
        sequence.await.map_err(|_| ConsoleError::Disconnected)?
    }

    pub(crate) async fn close(&self) {
        if let Some(task) = self.shared.read_task.lock().take() {
            task.abort();
        }
        self.shared.cleanup().await;
    }

    /// Non-async close for callers inside the DDP receive path; the actual
    /// teardown is posted to the scheduler.
    pub(crate) fn trigger_close(&self) {
        if let Some(task) = self.shared.read_task.lock().take() {
            task.abort();
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.cleanup().await;
        });
    }

    fn console(&self) -> Result<Arc<ConsoleShared>, ConsoleError> {
        self.shared.console.upgrade().ok_or(ConsoleError::Disconnected)
    }
}

impl SessionShared {
    /// Encrypts and writes frames back-to-back under one writer guard, so
    /// the cipher chain always matches wire order.
    async fn write_frames(&self, frames: &[Vec<u8>]) -> Result<(), ConsoleError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConsoleError::Disconnected)?;
        for frame in frames {
            let mut buf = frame.clone();
            writer.cipher.encrypt(&mut buf);
            if let Err(err) = writer.half.write_all(&buf).await {
                warn!(%err, "send failed, closing session");
                guard.take();
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn send_expect(
        &self,
        command: &'static str,
        frame: Vec<u8>,
    ) -> Result<Vec<u8>, ConsoleError> {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(PendingReply { command, tx });
        if let Err(err) = self.write_frames(&[frame]).await {
            self.pending.lock().take();
            return Err(err);
        }
        rx.await.map_err(|_| ConsoleError::Disconnected)
    }

    /// PS press: open then two press frames, with the key-off delayed by
    /// the tap or hold interval. Caller holds the task slot.
    async fn ps_press(&self, hold_ms: u32) -> Result<(), ConsoleError> {
        self.write_frames(&[
            packets::remote_control(op::OPEN_RC, 0),
            packets::remote_control(op::PS, 0),
            packets::remote_control(op::PS, 1),
        ])
        .await?;
        let delay = if hold_ms > 0 { PS_HOLD_DELAY } else { PS_TAP_DELAY };
        sleep(delay).await;
        self.write_frames(&[packets::remote_control(op::KEY_OFF, 0)])
            .await
    }

    async fn cleanup(self: &Arc<Self>) {
        self.writer.lock().await.take();
        self.pending.lock().take();
        if let Some(console) = self.console.upgrade() {
            console.drop_session(&TcpSession {
                shared: self.clone(),
            });
        }
    }
}

async fn read_loop(
    shared: Arc<SessionShared>,
    mut reader: OwnedReadHalf,
    mut cipher: FrameDecryptor,
    watchdog: Duration,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        let frame = tokio::select! {
            read = read_frame(&mut reader, &mut cipher) => match read {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("console closed the control connection");
                    break;
                }
                Err(err) => {
                    debug!(%err, "control read failed");
                    break;
                }
            },
            _ = heartbeat_expiry(deadline) => {
                warn!("heartbeat watchdog expired, closing session");
                break;
            }
        };
        if frame.as_slice() == packets::HEARTBEAT {
            deadline = Some(Instant::now() + watchdog);
            if shared.write_frames(&[packets::status_ack()]).await.is_err() {
                break;
            }
            continue;
        }
        match shared.pending.lock().take() {
            Some(reply) => {
                debug!(command = reply.command, len = frame.len(), "RX command reply");
                let _ = reply.tx.send(frame);
            }
            None => debug!(len = frame.len(), "RX unmatched frame"),
        }
    }
    shared.read_task.lock().take();
    shared.cleanup().await;
}

async fn heartbeat_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Reads one block-padded frame, decrypting strictly in arrival order.
async fn read_frame(
    reader: &mut OwnedReadHalf,
    cipher: &mut FrameDecryptor,
) -> io::Result<Option<Vec<u8>>> {
    let mut block = [0u8; crypto::BLOCK];
    match reader.read_exact(&mut block).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    cipher.decrypt(&mut block);
    let declared = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    if declared > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame length out of range",
        ));
    }
    let total = declared.max(crypto::BLOCK).div_ceil(crypto::BLOCK) * crypto::BLOCK;
    let mut frame = block.to_vec();
    if total > crypto::BLOCK {
        frame.resize(total, 0);
        reader.read_exact(&mut frame[crypto::BLOCK..]).await?;
        cipher.decrypt(&mut frame[crypto::BLOCK..]);
    }
    Ok(Some(frame))
}

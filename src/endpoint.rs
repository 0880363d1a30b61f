//! Shared DDP endpoint: one UDP socket polling every known console.
//!
//! Consoles register as observers keyed by IP. Inbound datagrams are parsed
//! once and dispatched to every observer for the source address; polls that
//! go unanswered past the threshold mark the console unreachable.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::console::ConsoleShared;
use crate::ddp::{self, DeviceStatus, DDP_PORT};

/// Unanswered polls tolerated before a console is assumed gone.
pub const DEFAULT_MAX_POLLS: u32 = 5;

/// Window after a standby transition during which sends to that console are
/// silently dropped, so the transition is not disturbed.
const STANDBY_BACKOFF: Duration = Duration::from_secs(3);

const RECV_BUF: usize = 1024;

/// Handle to the shared endpoint; cheap to clone. The receive loop stops
/// when the last handle is dropped.
#[derive(Clone)]
pub struct DdpEndpoint {
    inner: Arc<EndpointInner>,
    _recv_task: Arc<TaskGuard>,
}

struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct EndpointInner {
    socket: UdpSocket,
    remote_port: u16,
    max_polls: u32,
    observers: Mutex<HashMap<IpAddr, HashMap<u64, Weak<ConsoleShared>>>>,
    standby_until: Mutex<HashMap<IpAddr, Instant>>,
    next_id: AtomicU64,
}

impl DdpEndpoint {
    /// Binds an ephemeral local port and talks to consoles on UDP 987.
    pub async fn bind() -> io::Result<Self> {
        Self::bind_to(0, DDP_PORT, DEFAULT_MAX_POLLS).await
    }

    /// Fully parameterized bind; `remote_port` exists for loopback testing.
    pub async fn bind_to(local_port: u16, remote_port: u16, max_polls: u32) -> io::Result<Self> {
        let socket = UdpSocket::from_std(ddp::udp_socket(local_port, false)?)?;
        let inner = Arc::new(EndpointInner {
            socket,
            remote_port,
            max_polls,
            observers: Mutex::new(HashMap::new()),
            standby_until: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });
        let recv_task = tokio::spawn(recv_loop(inner.clone()));
        Ok(Self {
            inner,
            _recv_task: Arc::new(TaskGuard(recv_task)),
        })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.inner.socket.local_addr()?.port())
    }

    pub fn max_polls(&self) -> u32 {
        self.inner.max_polls
    }

    /// True while at least one live observer watches `host`.
    pub fn has_observers(&self, host: IpAddr) -> bool {
        let mut observers = self.inner.observers.lock();
        if let Some(entry) = observers.get_mut(&host) {
            entry.retain(|_, weak| weak.strong_count() > 0);
            if entry.is_empty() {
                observers.remove(&host);
                return false;
            }
            return true;
        }
        false
    }

    pub(crate) fn add_observer(&self, shared: &Arc<ConsoleShared>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .observers
            .lock()
            .entry(shared.host)
            .or_default()
            .insert(id, Arc::downgrade(shared));
        id
    }

    /// Drops one observer; the per-host entry goes with its last observer.
    pub(crate) fn remove_observer(&self, host: IpAddr, id: u64) {
        let mut observers = self.inner.observers.lock();
        if let Some(entry) = observers.get_mut(&host) {
            entry.remove(&id);
            if entry.is_empty() {
                observers.remove(&host);
            }
        }
    }

    /// Sends one datagram to a console, unless its standby backoff is live.
    pub(crate) async fn send_to(&self, host: IpAddr, message: &str) -> io::Result<()> {
        if self.inner.standby_suppressed(host) {
            debug!(%host, "suppressing ddp send during standby backoff");
            return Ok(());
        }
        debug!(%host, port = self.inner.remote_port, "TX ddp");
        self.inner
            .socket
            .send_to(message.as_bytes(), (host, self.inner.remote_port))
            .await?;
        Ok(())
    }

    /// Sends one SRCH poll and charges it against the console's counter.
    pub(crate) async fn poll(&self, shared: &Arc<ConsoleShared>) -> io::Result<()> {
        self.send_to(shared.host, &ddp::search_message()).await?;
        shared.note_poll(self.inner.max_polls);
        Ok(())
    }
}

impl EndpointInner {
    fn standby_suppressed(&self, host: IpAddr) -> bool {
        let mut map = self.standby_until.lock();
        match map.get(&host) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                map.remove(&host);
                false
            }
            None => false,
        }
    }

    fn handle_datagram(&self, data: &[u8], source: IpAddr) {
        let Ok(text) = std::str::from_utf8(data) else {
            debug!(%source, "dropping non-utf8 ddp datagram");
            return;
        };
        let mut status = match DeviceStatus::parse(text) {
            Ok(status) => status,
            Err(err) => {
                debug!(%source, %err, "dropping unparseable ddp datagram");
                return;
            }
        };
        status.host_ip = Some(source);

        let consoles: Vec<Arc<ConsoleShared>> = {
            let mut observers = self.observers.lock();
            let Some(entry) = observers.get_mut(&source) else {
                debug!(%source, "ddp response from unobserved host");
                return;
            };
            entry.retain(|_, weak| weak.strong_count() > 0);
            let consoles = entry.values().filter_map(Weak::upgrade).collect();
            if entry.is_empty() {
                observers.remove(&source);
            }
            consoles
        };

        let mut entered_standby = false;
        for console in consoles {
            entered_standby |= console.handle_status(status.clone());
        }
        if entered_standby {
            self.standby_until
                .lock()
                .insert(source, Instant::now() + STANDBY_BACKOFF);
        }
    }
}

async fn recv_loop(inner: Arc<EndpointInner>) {
    let mut buf = [0u8; RECV_BUF];
    loop {
        match inner.socket.recv_from(&mut buf).await {
            Ok((len, addr)) => inner.handle_datagram(&buf[..len], addr.ip()),
            Err(err) => {
                warn!(%err, "ddp endpoint receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

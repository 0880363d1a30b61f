//! Credential capture: masquerade as a console so the official mobile app
//! hands over the PSN user credential during pairing.
//!
//! The service answers the app's SRCH with a standby-looking identity and
//! pulls `user-credential` out of the WAKEUP that follows.

use std::io;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::ddp::{self, DdpRequest, DdpVerb, DDP_PORT, STATUS_STANDBY};
use crate::error::CredentialError;

/// Name shown in the mobile app's device list.
pub const DEFAULT_DEVICE_NAME: &str = "pyps4-2ndScreen";
/// TCP port advertised in the fabricated identity.
const REQUEST_PORT: &str = "997";
const RECV_BUF: usize = 1024;

/// UDP responder bound to the DDP port, impersonating a standby console.
pub struct CredentialService {
    socket: UdpSocket,
    device_name: String,
    host_id: String,
}

impl CredentialService {
    /// Binds `0.0.0.0:987` with address reuse enabled.
    pub async fn bind(device_name: Option<&str>) -> Result<Self, CredentialError> {
        Self::bind_to(DDP_PORT, device_name).await
    }

    /// [`CredentialService::bind`] against a nonstandard port.
    pub async fn bind_to(port: u16, device_name: Option<&str>) -> Result<Self, CredentialError> {
        let socket = ddp::udp_socket(port, true).map_err(|source| CredentialError::Bind {
            port,
            source,
        })?;
        let socket = UdpSocket::from_std(socket)?;
        let mut rng = rand::thread_rng();
        let host_id = (0..12)
            .map(|_| char::from_digit(rng.gen_range(0..16u32), 16).unwrap_or('0'))
            .collect::<String>()
            .to_ascii_uppercase();
        info!(port, "credential service listening");
        Ok(Self {
            socket,
            device_name: device_name.unwrap_or(DEFAULT_DEVICE_NAME).to_string(),
            host_id,
        })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Answers requests until a WAKEUP arrives or the deadline passes.
    ///
    /// Returns the captured credential and closes the socket. A deadline
    /// without a WAKEUP is [`CredentialError::CredentialTimeout`].
    pub async fn listen(self, wait: Duration) -> Result<String, CredentialError> {
        let deadline = Instant::now() + wait;
        let mut buf = [0u8; RECV_BUF];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CredentialError::CredentialTimeout);
            }
            let (len, addr) = match timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(CredentialError::CredentialTimeout),
            };
            let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                debug!(%addr, "ignoring non-utf8 datagram");
                continue;
            };
            match DdpRequest::parse(text) {
                Ok(request) => match request.verb {
                    DdpVerb::Search => {
                        debug!(%addr, "search from app, replying as standby console");
                        self.socket
                            .send_to(self.standby_response().as_bytes(), addr)
                            .await?;
                    }
                    DdpVerb::Wakeup => match request.fields.get("user-credential") {
                        Some(credential) => {
                            info!(%addr, "captured credential");
                            return Ok(credential.clone());
                        }
                        None => warn!(%addr, "wakeup without a user-credential field"),
                    },
                    DdpVerb::Launch => debug!(%addr, "ignoring launch"),
                },
                Err(err) => debug!(%addr, %err, "ignoring unknown datagram"),
            }
        }
    }

    fn standby_response(&self) -> String {
        ddp::response_message(
            STATUS_STANDBY,
            "Server Standby",
            &[
                ("host-id", &self.host_id),
                ("host-type", "PS4"),
                ("host-name", &self.device_name),
                ("host-request-port", REQUEST_PORT),
            ],
        )
    }
}

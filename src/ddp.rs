//! Device Discovery Protocol codec and one-shot helpers.
//!
//! DDP datagrams look like HTTP/1.1: a verb or status line followed by
//! colon-delimited `key:value` lines, one per `\n`, always terminated by the
//! `device-discovery-protocol-version` line. Consoles listen on UDP 987.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::error::DdpError;

/// UDP port consoles answer discovery on.
pub const DDP_PORT: u16 = 987;
/// Protocol version carried in every request and response.
pub const DDP_VERSION: &str = "00020020";
/// Status code reported while a console is on.
pub const STATUS_OK: u16 = 200;
/// Status code reported while a console is in standby.
pub const STATUS_STANDBY: u16 = 620;

const BROADCAST: Ipv4Addr = Ipv4Addr::BROADCAST;
const RECV_BUF: usize = 1024;

/// The three request verbs the client emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdpVerb {
    Search,
    Wakeup,
    Launch,
}

impl DdpVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            DdpVerb::Search => "SRCH",
            DdpVerb::Wakeup => "WAKEUP",
            DdpVerb::Launch => "LAUNCH",
        }
    }
}

impl FromStr for DdpVerb {
    type Err = DdpError;

    fn from_str(s: &str) -> Result<Self, DdpError> {
        match s {
            "SRCH" => Ok(DdpVerb::Search),
            "WAKEUP" => Ok(DdpVerb::Wakeup),
            "LAUNCH" => Ok(DdpVerb::Launch),
            _ => Err(DdpError::UnknownDdpResponse),
        }
    }
}

/// A request datagram as seen by the credential service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdpRequest {
    pub verb: DdpVerb,
    pub fields: BTreeMap<String, String>,
}

impl DdpRequest {
    /// Parses `<VERB> * HTTP/1.1` plus its key:value lines.
    pub fn parse(raw: &str) -> Result<Self, DdpError> {
        let mut lines = raw.lines().map(str::trim).filter(|l| !l.is_empty());
        let first = lines.next().ok_or(DdpError::UnknownDdpResponse)?;
        let verb = first
            .strip_suffix(" * HTTP/1.1")
            .ok_or(DdpError::UnknownDdpResponse)?
            .parse()?;
        let mut fields = BTreeMap::new();
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Ok(Self { verb, fields })
    }
}

/// A parsed status response plus the address it came from.
///
/// `fields` keeps every key:value line, including the protocol-version
/// trailer, so responses round-trip through [`DeviceStatus::to_message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub code: u16,
    pub status: String,
    pub fields: BTreeMap<String, String>,
    pub host_ip: Option<IpAddr>,
}

impl DeviceStatus {
    /// Parses an `HTTP/1.1 <code> <status>` response.
    ///
    /// Values are split at the first colon only; `running-app-name` in
    /// particular may itself contain colons.
    pub fn parse(raw: &str) -> Result<Self, DdpError> {
        let mut code = None;
        let mut status = String::new();
        let mut fields = BTreeMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("HTTP/1.1 ") {
                let (num, text) = match rest.split_once(' ') {
                    Some((num, text)) => (num, text),
                    None => (rest, ""),
                };
                code = Some(num.parse().map_err(|_| DdpError::UnknownDdpResponse)?);
                status = text.to_string();
            } else if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Ok(Self {
            code: code.ok_or(DdpError::UnknownDdpResponse)?,
            status,
            fields,
            host_ip: None,
        })
    }

    /// Serializes back into response wire form.
    pub fn to_message(&self) -> String {
        let mut msg = format!("HTTP/1.1 {} {}\n", self.code, self.status);
        for (key, value) in &self.fields {
            msg.push_str(key);
            msg.push(':');
            msg.push_str(value);
            msg.push('\n');
        }
        msg
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn is_running(&self) -> bool {
        self.code == STATUS_OK
    }

    pub fn is_standby(&self) -> bool {
        self.code == STATUS_STANDBY
    }

    pub fn host_id(&self) -> Option<&str> {
        self.get("host-id")
    }

    pub fn host_name(&self) -> Option<&str> {
        self.get("host-name")
    }

    pub fn system_version(&self) -> Option<&str> {
        self.get("system-version")
    }

    pub fn running_app_titleid(&self) -> Option<&str> {
        self.get("running-app-titleid")
    }

    pub fn running_app_name(&self) -> Option<&str> {
        self.get("running-app-name")
    }
}

fn request_message(verb: DdpVerb, fields: &[(&str, &str)]) -> String {
    let mut msg = format!("{} * HTTP/1.1\n", verb.as_str());
    for (key, value) in fields {
        msg.push_str(key);
        msg.push(':');
        msg.push_str(value);
        msg.push('\n');
    }
    msg.push_str("device-discovery-protocol-version:");
    msg.push_str(DDP_VERSION);
    msg.push('\n');
    msg
}

/// Discovery request; consoles answer with their status.
pub fn search_message() -> String {
    request_message(DdpVerb::Search, &[])
}

/// Wake request; brings a standby console up.
pub fn wakeup_message(credential: &str) -> String {
    request_message(
        DdpVerb::Wakeup,
        &[
            ("user-credential", credential),
            ("client-type", "a"),
            ("auth-type", "C"),
        ],
    )
}

/// Launch request; readies the console's TCP listener before a connect.
pub fn launch_message(credential: &str) -> String {
    request_message(
        DdpVerb::Launch,
        &[
            ("user-credential", credential),
            ("client-type", "a"),
            ("auth-type", "C"),
        ],
    )
}

/// Response builder used by the credential service.
pub fn response_message(code: u16, status: &str, fields: &[(&str, &str)]) -> String {
    let mut msg = format!("HTTP/1.1 {} {}\n", code, status);
    for (key, value) in fields {
        msg.push_str(key);
        msg.push(':');
        msg.push_str(value);
        msg.push('\n');
    }
    msg.push_str("device-discovery-protocol-version:");
    msg.push_str(DDP_VERSION);
    msg.push('\n');
    msg
}

/// Builds a nonblocking UDP socket with broadcast enabled and, where the
/// platform has it, `SO_REUSEPORT`, so the library can coexist with other
/// DDP speakers on the same host.
pub(crate) fn udp_socket(port: u16, reuse_addr: bool) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if reuse_addr {
        socket.set_reuse_address(true)?;
    }
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    Ok(socket.into())
}

/// Blocking variant of [`udp_socket`] for the sync back-end.
pub(crate) fn blocking_udp_socket(
    port: u16,
    read_timeout: Option<Duration>,
) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    let socket: std::net::UdpSocket = socket.into();
    socket.set_read_timeout(read_timeout)?;
    Ok(socket)
}

/// Fire-and-forget datagram from an ephemeral socket.
pub async fn send_datagram(host: IpAddr, port: u16, message: &str) -> io::Result<()> {
    let socket = UdpSocket::from_std(udp_socket(0, false)?)?;
    debug!(%host, port, "TX ddp datagram");
    socket.send_to(message.as_bytes(), (host, port)).await?;
    Ok(())
}

/// Broadcasts a discovery request and collects replies until the timeout.
///
/// With `host` set the request goes to that address only; without it the
/// request is broadcast and every responding console is returned.
pub async fn search(host: Option<IpAddr>, wait: Duration) -> Result<Vec<DeviceStatus>, DdpError> {
    search_on(DDP_PORT, host, wait).await
}

/// [`search`] against a nonstandard port.
pub async fn search_on(
    port: u16,
    host: Option<IpAddr>,
    wait: Duration,
) -> Result<Vec<DeviceStatus>, DdpError> {
    let socket = UdpSocket::from_std(udp_socket(0, false)?)?;
    let target: SocketAddr = match host {
        Some(ip) => (ip, port).into(),
        None => (IpAddr::V4(BROADCAST), port).into(),
    };
    socket.send_to(search_message().as_bytes(), target).await?;

    let deadline = Instant::now() + wait;
    let mut found: Vec<DeviceStatus> = Vec::new();
    let mut buf = [0u8; RECV_BUF];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                    debug!(%addr, "dropping non-utf8 ddp datagram");
                    continue;
                };
                match DeviceStatus::parse(text) {
                    Ok(mut status) => {
                        status.host_ip = Some(addr.ip());
                        if !found.iter().any(|s| s.host_ip == status.host_ip) {
                            found.push(status);
                        }
                        // a directed query is answered by one console
                        if host.is_some() {
                            break;
                        }
                    }
                    Err(err) => debug!(%addr, %err, "dropping unparseable ddp datagram"),
                }
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => break,
        }
    }
    Ok(found)
}

/// One-shot status query for a single console.
pub async fn get_status(host: IpAddr) -> Result<Option<DeviceStatus>, DdpError> {
    get_status_on(DDP_PORT, host).await
}

/// [`get_status`] against a nonstandard port.
pub async fn get_status_on(port: u16, host: IpAddr) -> Result<Option<DeviceStatus>, DdpError> {
    let mut found = search_on(port, Some(host), Duration::from_millis(1500)).await?;
    Ok(if found.is_empty() {
        None
    } else {
        Some(found.remove(0))
    })
}

/// Sends a WAKEUP datagram.
pub async fn send_wakeup(host: IpAddr, credential: &str) -> io::Result<()> {
    send_datagram(host, DDP_PORT, &wakeup_message(credential)).await
}

/// Sends a LAUNCH datagram.
pub async fn send_launch(host: IpAddr, credential: &str) -> io::Result<()> {
    send_datagram(host, DDP_PORT, &launch_message(credential)).await
}

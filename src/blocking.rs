//! Sync back-end: one fresh control session per command, no heartbeat
//! handling, no pending tasks. Suited to one-shot CLI invocations; the
//! async [`crate::console::Console`] is the primary model.

use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::crypto::{self, FrameDecryptor, FrameEncryptor};
use crate::ddp::{self, DeviceStatus, DDP_PORT};
use crate::error::{ConsoleError, DdpError};
use crate::packets::{self, op, Button, TCP_PORT};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const PREPARE_DELAY: Duration = Duration::from_millis(500);
const MAX_FRAME: usize = 4096;
const RECV_BUF: usize = 1024;

/// Blocking discovery broadcast; same semantics as [`ddp::search`].
pub fn search(host: Option<IpAddr>, wait: Duration) -> Result<Vec<DeviceStatus>, DdpError> {
    search_on(DDP_PORT, host, wait)
}

/// [`search`] against a nonstandard port.
pub fn search_on(
    port: u16,
    host: Option<IpAddr>,
    wait: Duration,
) -> Result<Vec<DeviceStatus>, DdpError> {
    let socket = ddp::blocking_udp_socket(0, Some(Duration::from_millis(250)))?;
    let target: std::net::SocketAddr = match host {
        Some(ip) => (ip, port).into(),
        None => (IpAddr::from([255, 255, 255, 255]), port).into(),
    };
    socket.send_to(ddp::search_message().as_bytes(), target)?;

    let deadline = Instant::now() + wait;
    let mut found: Vec<DeviceStatus> = Vec::new();
    let mut buf = [0u8; RECV_BUF];
    while Instant::now() < deadline {
        let (len, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
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
    Ok(found)
}

/// Blocking one-shot status query.
pub fn get_status(host: IpAddr) -> Result<Option<DeviceStatus>, DdpError> {
    get_status_on(DDP_PORT, host)
}

/// [`get_status`] against a nonstandard port.
pub fn get_status_on(port: u16, host: IpAddr) -> Result<Option<DeviceStatus>, DdpError> {
    let mut found = search_on(port, Some(host), Duration::from_millis(1500))?;
    Ok(if found.is_empty() {
        None
    } else {
        Some(found.remove(0))
    })
}

fn send_datagram(host: IpAddr, port: u16, message: &str) -> Result<(), DdpError> {
    let socket = ddp::blocking_udp_socket(0, None)?;
    socket.send_to(message.as_bytes(), (host, port))?;
    Ok(())
}

/// Sync console: every command runs against a session of its own.
pub struct BlockingConsole {
    host: IpAddr,
    tcp_port: u16,
    ddp_port: u16,
    credential: String,
    device_name: String,
    status: Option<DeviceStatus>,
}

impl BlockingConsole {
    pub fn new(
        host: IpAddr,
        credential: &str,
        device_name: Option<&str>,
        port: Option<u16>,
    ) -> Self {
        Self {
            host,
            tcp_port: port.unwrap_or(TCP_PORT),
            ddp_port: DDP_PORT,
            credential: credential.to_string(),
            device_name: device_name
                .unwrap_or(crate::credential::DEFAULT_DEVICE_NAME)
                .to_string(),
            status: None,
        }
    }

    /// Overrides the discovery port; loopback testing only needs this.
    pub fn with_ddp_port(mut self, port: u16) -> Self {
        self.ddp_port = port;
        self
    }

    pub fn status(&self) -> Option<&DeviceStatus> {
        self.status.as_ref()
    }

    /// Refreshes and returns the console status.
    pub fn get_status(&mut self) -> Result<Option<DeviceStatus>, DdpError> {
        self.status = get_status_on(self.ddp_port, self.host)?;
        Ok(self.status.clone())
    }

    pub fn wakeup(&self) -> Result<(), DdpError> {
        info!(host = %self.host, "sending wakeup");
        send_datagram(
            self.host,
            self.ddp_port,
            &ddp::wakeup_message(&self.credential),
        )
    }

    /// Logs in and disconnects; used for pairing with a pin.
    pub fn login(&mut self, pin: Option<&str>) -> Result<(), ConsoleError> {
        let mut session = self.open()?;
        session.login(&self.credential, &self.device_name, pin)?;
        Ok(())
    }

    pub fn standby(&mut self) -> Result<(), ConsoleError> {
        let mut session = self.open()?;
        session.login(&self.credential, &self.device_name, None)?;
        session.standby()
    }

    pub fn start_title(
        &mut self,
        title_id: &str,
        running_id: Option<&str>,
    ) -> Result<(), ConsoleError> {
        let mut session = self.open()?;
        session.login(&self.credential, &self.device_name, None)?;
        session.start_title(title_id)?;
        if running_id.is_some_and(|running| running != title_id) {
            // confirm the close-application prompt
            thread::sleep(Duration::from_secs(1));
            session.remote_control(Button::Enter, 0)?;
        }
        Ok(())
    }

    pub fn remote_control(&mut self, button_name: &str, hold_ms: u32) -> Result<(), ConsoleError> {
        let button = Button::from_name(button_name)
            .ok_or_else(|| ConsoleError::UnknownButton(button_name.to_string()))?;
        let hold_ms = button.forced_hold_ms().unwrap_or(hold_ms);
        let mut session = self.open()?;
        session.login(&self.credential, &self.device_name, None)?;
        session.remote_control(button, hold_ms)
    }

    fn open(&mut self) -> Result<BlockingSession, ConsoleError> {
        let status = self.get_status()?;
        if !status.as_ref().is_some_and(DeviceStatus::is_running) {
            return Err(ConsoleError::NotReady("console is not on"));
        }
        send_datagram(
            self.host,
            self.ddp_port,
            &ddp::launch_message(&self.credential),
        )?;
        thread::sleep(PREPARE_DELAY);
        BlockingSession::open(self.host, self.tcp_port)
    }
}

struct BlockingSession {
    stream: TcpStream,
    encryptor: FrameEncryptor,
    decryptor: FrameDecryptor,
}

impl BlockingSession {
    fn open(host: IpAddr, port: u16) -> Result<Self, ConsoleError> {
        debug!(%host, port, "connecting");
        let mut stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        stream.write_all(&packets::hello())?;
        let mut ack = [0u8; packets::HELLO_ACK_LEN];
        stream.read_exact(&mut ack)?;
        let seed =
            packets::parse_hello_ack(&ack).ok_or(ConsoleError::Handshake("short hello ack"))?;
        let (encryptor, decryptor) = crypto::session_ciphers(&seed);
        let wrapped = crypto::wrap_session_key(&mut rand::thread_rng())
            .map_err(|_| ConsoleError::Handshake("rsa key wrap failed"))?;
        stream.write_all(&packets::handshake(&wrapped, &seed))?;
        Ok(Self {
            stream,
            encryptor,
            decryptor,
        })
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), ConsoleError> {
        let mut buf = frame.to_vec();
        self.encryptor.encrypt(&mut buf);
        self.stream.write_all(&buf)?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Vec<u8>, ConsoleError> {
        let mut block = [0u8; crypto::BLOCK];
        self.stream.read_exact(&mut block)?;
        self.decryptor.decrypt(&mut block);
        let declared = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
        if declared > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame length out of range",
            )
            .into());
        }
        let total = declared.max(crypto::BLOCK).div_ceil(crypto::BLOCK) * crypto::BLOCK;
        let mut frame = block.to_vec();
        if total > crypto::BLOCK {
            frame.resize(total, 0);
            self.stream.read_exact(&mut frame[crypto::BLOCK..])?;
            self.decryptor.decrypt(&mut frame[crypto::BLOCK..]);
        }
        Ok(frame)
    }

    /// Next non-heartbeat frame; heartbeats are acked inline so the chain
    /// stays aligned.
    fn read_reply(&mut self) -> Result<Vec<u8>, ConsoleError> {
        loop {
            let frame = self.read_frame()?;
            if frame.as_slice() == packets::HEARTBEAT {
                self.write_frame(&packets::status_ack())?;
                continue;
            }
            return Ok(frame);
        }
    }

    fn login(
        &mut self,
        credential: &str,
        device_name: &str,
        pin: Option<&str>,
    ) -> Result<(), ConsoleError> {
        self.write_frame(&packets::login(credential, device_name, pin))?;
        let reply = self.read_reply()?;
        if !packets::login_succeeded(&reply) {
            warn!("console refused the login");
            return Err(ConsoleError::LoginFailed);
        }
        Ok(())
    }

    fn standby(&mut self) -> Result<(), ConsoleError> {
        self.write_frame(&packets::standby())?;
        let reply = self.read_reply()?;
        if !packets::standby_acknowledged(&reply) {
            return Err(ConsoleError::CommandRefused("standby"));
        }
        Ok(())
    }

    fn start_title(&mut self, title_id: &str) -> Result<(), ConsoleError> {
        self.write_frame(&packets::boot(title_id))?;
        let reply = self.read_reply()?;
        if !packets::boot_acknowledged(&reply) {
            return Err(ConsoleError::CommandRefused("start-title"));
        }
        Ok(())
    }

    fn remote_control(&mut self, button: Button, hold_ms: u32) -> Result<(), ConsoleError> {
        if button.is_ps() {
            self.write_frame(&packets::remote_control(op::OPEN_RC, 0))?;
            self.write_frame(&packets::remote_control(op::PS, 0))?;
            self.write_frame(&packets::remote_control(op::PS, 1))?;
            let delay = if hold_ms > 0 {
                Duration::from_secs(1)
            } else {
                Duration::from_millis(500)
            };
            thread::sleep(delay);
            self.write_frame(&packets::remote_control(op::KEY_OFF, 0))?;
        } else {
            self.write_frame(&packets::remote_control(op::OPEN_RC, 0))?;
            self.write_frame(&packets::remote_control(button.opcode(), hold_ms))?;
            self.write_frame(&packets::remote_control(op::KEY_OFF, 0))?;
            self.write_frame(&packets::remote_control(op::CLOSE_RC, 0))?;
        }
        Ok(())
    }
}

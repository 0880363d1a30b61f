//! Wire frames for the TCP control channel on port 997.
//!
//! Every frame starts `[u32 length LE][u32 type LE]`. The length constants
//! are emitted exactly as the console expects them; `standby` and `boot`
//! undercount their trailing padding, which is part of the protocol.

/// TCP port the console's control listener uses.
pub const TCP_PORT: u16 = 997;

/// Hello frames are the only unencrypted exchange besides the handshake.
pub const HELLO_LEN: usize = 28;
/// The hello-ack carries the session seed at offset 20.
pub const HELLO_ACK_LEN: usize = 36;

/// Decrypted heartbeat request the console sends while idle. It must be
/// answered with a status-ack and never completes a command.
pub const HEARTBEAT: [u8; 16] = [
    0x0c, 0x00, 0x00, 0x00, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Remote-control opcodes.
pub mod op {
    pub const UP: u32 = 1;
    pub const DOWN: u32 = 2;
    pub const RIGHT: u32 = 4;
    pub const LEFT: u32 = 8;
    pub const ENTER: u32 = 16;
    pub const BACK: u32 = 32;
    pub const OPTION: u32 = 64;
    pub const PS: u32 = 128;
    pub const KEY_OFF: u32 = 256;
    pub const CANCEL: u32 = 512;
    pub const OPEN_RC: u32 = 1024;
    pub const CLOSE_RC: u32 = 2048;
}

/// Hold time forced for the `ps_hold` button.
pub const PS_HOLD_MS: u32 = 2000;

/// Remote-control buttons accepted by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Up,
    Down,
    Right,
    Left,
    Enter,
    Back,
    Option,
    Ps,
    PsHold,
    KeyOff,
    Cancel,
    OpenRc,
    CloseRc,
}

impl Button {
    /// Looks a button up by its lowercase name; `None` for anything outside
    /// the fixed set.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "up" => Button::Up,
            "down" => Button::Down,
            "right" => Button::Right,
            "left" => Button::Left,
            "enter" => Button::Enter,
            "back" => Button::Back,
            "option" => Button::Option,
            "ps" => Button::Ps,
            "ps_hold" => Button::PsHold,
            "key_off" => Button::KeyOff,
            "cancel" => Button::Cancel,
            "open_rc" => Button::OpenRc,
            "close_rc" => Button::CloseRc,
            _ => return None,
        })
    }

    pub fn opcode(self) -> u32 {
        match self {
            Button::Up => op::UP,
            Button::Down => op::DOWN,
            Button::Right => op::RIGHT,
            Button::Left => op::LEFT,
            Button::Enter => op::ENTER,
            Button::Back => op::BACK,
            Button::Option => op::OPTION,
            Button::Ps | Button::PsHold => op::PS,
            Button::KeyOff => op::KEY_OFF,
            Button::Cancel => op::CANCEL,
            Button::OpenRc => op::OPEN_RC,
            Button::CloseRc => op::CLOSE_RC,
        }
    }

    /// `ps_hold` overrides the caller's hold time.
    pub fn forced_hold_ms(self) -> Option<u32> {
        match self {
            Button::PsHold => Some(PS_HOLD_MS),
            _ => None,
        }
    }

    /// The PS press uses its own frame sequence.
    pub fn is_ps(self) -> bool {
        matches!(self, Button::Ps | Button::PsHold)
    }
}

fn header(length: u32, kind: u32, capacity: usize) -> Vec<u8> {
    let mut msg = Vec::with_capacity(capacity);
    msg.extend_from_slice(&length.to_le_bytes());
    msg.extend_from_slice(&kind.to_le_bytes());
    msg
}

fn pad_field(msg: &mut Vec<u8>, value: &[u8], width: usize) {
    let take = value.len().min(width);
    msg.extend_from_slice(&value[..take]);
    msg.resize(msg.len() + (width - take), 0);
}

/// Client hello: protocol version then 16 bytes of padding.
pub fn hello() -> Vec<u8> {
    let mut msg = header(28, 0x6f63_6370, HELLO_LEN);
    msg.extend_from_slice(&[0x00, 0x00, 0x02, 0x00]);
    msg.resize(HELLO_LEN, 0);
    msg
}

/// Pulls the session seed out of a hello-ack.
pub fn parse_hello_ack(msg: &[u8]) -> Option<[u8; 16]> {
    if msg.len() < HELLO_ACK_LEN {
        return None;
    }
    let mut seed = [0u8; 16];
    seed.copy_from_slice(&msg[20..36]);
    Some(seed)
}

/// Handshake: the 256-byte RSA-wrapped session key plus the echoed seed.
pub fn handshake(wrapped_key: &[u8], seed: &[u8; 16]) -> Vec<u8> {
    let mut msg = header(280, 0x20, 280);
    msg.extend_from_slice(wrapped_key);
    msg.extend_from_slice(seed);
    msg
}

/// Login frame; every field is null-padded to its fixed width.
pub fn login(credential: &str, device_name: &str, pin: Option<&str>) -> Vec<u8> {
    let mut msg = header(384, 0x1e, 384);
    msg.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // passcode
    msg.extend_from_slice(&[0x01, 0x02, 0x00, 0x00]); // magic
    pad_field(&mut msg, credential.as_bytes(), 64);
    pad_field(&mut msg, device_name.as_bytes(), 256);
    pad_field(&mut msg, b"4.4", 16);
    pad_field(&mut msg, device_name.as_bytes(), 16);
    pad_field(&mut msg, pin.unwrap_or("").as_bytes(), 16);
    msg
}

pub fn standby() -> Vec<u8> {
    let mut msg = header(8, 0x1a, 16);
    msg.resize(16, 0);
    msg
}

/// Boot request for a `CUSA#####` title id.
pub fn boot(title_id: &str) -> Vec<u8> {
    let mut msg = header(24, 0x0a, 32);
    pad_field(&mut msg, title_id.as_bytes(), 16);
    msg.resize(32, 0);
    msg
}

pub fn remote_control(opcode: u32, hold_ms: u32) -> Vec<u8> {
    let mut msg = header(16, 0x1c, 16);
    msg.extend_from_slice(&opcode.to_le_bytes());
    msg.extend_from_slice(&hold_ms.to_le_bytes());
    msg
}

/// Ack for the console's heartbeat.
pub fn status_ack() -> Vec<u8> {
    let mut msg = header(12, 0x14, 16);
    msg.resize(16, 0);
    msg
}

/// Login replies carry their result at offset 8; `0x00` and `0x11` are the
/// success set.
pub fn login_succeeded(reply: &[u8]) -> bool {
    matches!(reply.get(8), Some(&(0x00 | 0x11)))
}

pub fn standby_acknowledged(reply: &[u8]) -> bool {
    reply.get(4) == Some(&0x1b)
}

pub fn boot_acknowledged(reply: &[u8]) -> bool {
    matches!(reply.get(4), Some(&(0x0b | 0x12)))
}

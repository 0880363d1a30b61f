//! Error kinds for the crate surface: discovery, pairing, and console
//! commands each get their own enum.

use std::io;

use thiserror::Error;

/// Errors from building, parsing, or exchanging DDP datagrams.
#[derive(Debug, Error)]
pub enum DdpError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("datagram matches no known ddp form")]
    UnknownDdpResponse,
}

/// Errors from the credential service.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Port 987 is privileged; binding commonly fails without elevation.
    #[error("failed to bind udp port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("credential service timed out without receiving a wakeup")]
    CredentialTimeout,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by console commands.
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("console is not ready: {0}")]
    NotReady(&'static str),
    #[error("console refused the login")]
    LoginFailed,
    #[error("unknown remote-control button: {0}")]
    UnknownButton(String),
    #[error("console refused the {0} command")]
    CommandRefused(&'static str),
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
    #[error("control session is not connected")]
    Disconnected,
    #[error(transparent)]
    Ddp(#[from] DdpError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Returned by cover-art collaborators outside this crate; the core
    /// never constructs it.
    #[error("playstation store data is incomplete")]
    PsDataIncomplete,
}

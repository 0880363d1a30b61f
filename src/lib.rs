//! PS4 second-screen control plane.
//!
//! Impersonates the official mobile app to discover consoles over the
//! Device Discovery Protocol (UDP 987), capture a PSN credential during
//! pairing, and drive consoles over the authenticated TCP control channel
//! (port 997): wake, standby, title launch, and remote-control presses.
//!
//! The async [`Console`] plus a shared [`DdpEndpoint`] is the primary
//! model; [`blocking::BlockingConsole`] covers one-shot commands.

pub mod blocking;
pub mod console;
pub mod credential;
pub mod crypto;
pub mod ddp;
pub mod endpoint;
pub mod error;
pub mod files;
pub mod packets;
mod session;

pub use console::{Console, PendingCommand};
pub use credential::{CredentialService, DEFAULT_DEVICE_NAME};
pub use ddp::{DdpRequest, DdpVerb, DeviceStatus, DDP_PORT};
pub use endpoint::{DdpEndpoint, DEFAULT_MAX_POLLS};
pub use error::{ConsoleError, CredentialError, DdpError};
pub use packets::{Button, TCP_PORT};

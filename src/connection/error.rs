use crate::transport::TransportError;
use idm_protocol::commands::CommandError;
use idm_protocol::FramingError;
use thiserror::Error;

/// Errors surfaced by the connection manager
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("No device address set and discovery fallback is disabled")]
    NoAddressSet,

    #[error("No display found during discovery")]
    DeviceNotFound,

    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("Connection failed: {0}")]
    ConnectFailed(#[source] TransportError),

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(#[source] TransportError),

    #[error("Write failed: {0}")]
    WriteFailed(#[source] TransportError),

    #[error("Read failed: {0}")]
    ReadFailed(#[source] TransportError),

    #[error("Link dropped during transfer")]
    Disconnected,

    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type LinkResult<T> = Result<T, LinkError>;

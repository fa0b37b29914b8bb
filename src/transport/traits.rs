//! Transport trait abstraction for pluggable Bluetooth backends

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Opaque platform address of a peripheral (e.g. `AA:BB:CC:DD:EE:01`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for DeviceAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// An open link to one peripheral
///
/// The id is unique per successful `connect` on a transport, so a handle
/// from an earlier link never matches the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandle {
    id: u64,
    address: DeviceAddress,
}

impl LinkHandle {
    pub fn new(id: u64, address: DeviceAddress) -> Self {
        Self { id, address }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }
}

/// Errors reported by a transport backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Operation timed out")]
    Timeout,

    #[error("Peripheral {0} not found")]
    DeviceNotFound(DeviceAddress),

    #[error("Peripheral is busy or connected elsewhere")]
    Busy,

    #[error("Link is not connected")]
    NotConnected,

    #[error("Operation not permitted")]
    NotPermitted,

    #[error("Write of {len} bytes exceeds the link limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Bluetooth error: {0}")]
    Backend(String),
}

/// Invoked when a link drops outside of an explicit `disconnect`
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Minimal capability set the connection manager needs from a backend
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Scan for peripherals whose advertised name starts with `name_prefix`
    async fn discover(&self, name_prefix: &str) -> Result<Vec<DeviceAddress>, TransportError>;

    /// Open a link to `address`
    async fn connect(&self, address: &DeviceAddress) -> Result<LinkHandle, TransportError>;

    /// Close a link. No-op if it is already closed.
    async fn disconnect(&self, handle: &LinkHandle) -> Result<(), TransportError>;

    /// Write at most `max_write_size` bytes to the write characteristic
    ///
    /// `confirm` requests a link-layer acknowledgement (write with response).
    async fn write(
        &self,
        handle: &LinkHandle,
        data: &[u8],
        confirm: bool,
    ) -> Result<(), TransportError>;

    /// Read the current value of the read characteristic
    async fn read(&self, handle: &LinkHandle) -> Result<Vec<u8>, TransportError>;

    /// Negotiated payload limit of a single write; may change over a link's life
    async fn max_write_size(&self, handle: &LinkHandle) -> Result<usize, TransportError>;

    /// Register the callback fired when `handle` drops unsolicited
    fn on_unsolicited_disconnect(&self, handle: &LinkHandle, callback: DisconnectCallback);

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

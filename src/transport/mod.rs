pub mod ble;
pub mod discovery;
#[cfg(test)]
pub mod mock;
pub mod traits;

pub use ble::{BleConfig, BleTransport};
pub use discovery::{matches_prefix, DeviceScanner, DiscoveredDevice, ScanConfig};
pub use traits::{DeviceAddress, DisconnectCallback, LinkHandle, LinkTransport, TransportError};

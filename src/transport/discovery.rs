//! Bluetooth device discovery for finding displays

use bluer::{Adapter, AdapterEvent, Address, Device};
use futures::StreamExt;
use idm_protocol::DEVICE_NAME_PREFIX;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Configuration for Bluetooth discovery
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// How long to scan for devices
    pub scan_duration: Duration,
    /// Advertised name prefix to match
    pub name_prefix: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(5),
            name_prefix: DEVICE_NAME_PREFIX.into(),
        }
    }
}

/// Information about a discovered display
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Bluetooth MAC address
    pub address: Address,
    /// Advertised name
    pub name: String,
    /// Signal strength (if available)
    pub rssi: Option<i16>,
}

/// Bluetooth device discovery service
pub struct DeviceScanner {
    config: ScanConfig,
}

impl DeviceScanner {
    /// Create a new discovery service
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Get the default Bluetooth adapter
    pub async fn get_adapter() -> bluer::Result<Adapter> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        Ok(adapter)
    }

    /// Scan for displays, strongest signal first
    pub async fn scan(&self, adapter: &Adapter) -> bluer::Result<Vec<DiscoveredDevice>> {
        let mut found = Vec::new();
        let mut seen: HashSet<Address> = HashSet::new();

        info!(
            "[BLE] Scanning for devices named {}* ({:?})",
            self.config.name_prefix, self.config.scan_duration
        );

        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);

        // Scan for the configured duration
        let scan_result = timeout(self.config.scan_duration, async {
            while let Some(evt) = discover.next().await {
                if let AdapterEvent::DeviceAdded(addr) = evt {
                    if !seen.insert(addr) {
                        continue;
                    }

                    if let Ok(device) = adapter.device(addr) {
                        if let Some(name) = self.matching_name(&device).await {
                            info!("[BLE] Found device {} with name {}", addr, name);
                            found.push(DiscoveredDevice {
                                address: addr,
                                name,
                                rssi: device.rssi().await.ok().flatten(),
                            });
                        }
                    }
                }
            }
        })
        .await;

        // Timeout is expected, not an error
        if scan_result.is_err() {
            debug!("[BLE] Discovery scan completed, {} match(es)", found.len());
        }

        // Stable sort keeps discovery order among equal signals
        found.sort_by_key(|d| Reverse(d.rssi.unwrap_or(i16::MIN)));

        Ok(found)
    }

    /// Advertised name of `device` if it carries the configured prefix
    async fn matching_name(&self, device: &Device) -> Option<String> {
        match device.name().await {
            Ok(Some(name)) if matches_prefix(&name, &self.config.name_prefix) => Some(name),
            _ => None,
        }
    }
}

/// Whether an advertised name belongs to a display
///
/// Matching is case-sensitive; an empty prefix matches nothing.
pub fn matches_prefix(name: &str, prefix: &str) -> bool {
    !prefix.is_empty() && name.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ScanConfig::default();
        assert_eq!(config.scan_duration, Duration::from_secs(5));
        assert_eq!(config.name_prefix, "IDM-");
    }

    #[test]
    fn test_matches_prefix() {
        assert!(matches_prefix("IDM-4F2A", "IDM-"));
        assert!(matches_prefix("IDM-", "IDM-"));
        assert!(!matches_prefix("idm-4F2A", "IDM-"));
        assert!(!matches_prefix("Phone", "IDM-"));
        assert!(!matches_prefix("X-IDM-4F2A", "IDM-"));
        assert!(!matches_prefix("IDM-4F2A", ""));
    }
}

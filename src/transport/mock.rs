//! In-memory transport for exercising the connection manager

use crate::transport::discovery::matches_prefix;
use crate::transport::traits::{
    DeviceAddress, DisconnectCallback, LinkHandle, LinkTransport, TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

struct MockState {
    /// Advertised `(name, address)` pairs in scan order
    devices: Vec<(String, DeviceAddress)>,
    connect_delay: Duration,
    connect_failures: usize,
    connect_calls: usize,
    disconnect_calls: usize,
    writes: Vec<(Vec<u8>, bool)>,
    read_calls: usize,
    read_result: Result<Vec<u8>, TransportError>,
    max_write: usize,
    write_delay: Duration,
    fail_write_at: Option<usize>,
    live: HashMap<u64, Option<DisconnectCallback>>,
    next_id: u64,
}

/// Records every call and lets tests inject failures and drops
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                devices: Vec::new(),
                connect_delay: Duration::ZERO,
                connect_failures: 0,
                connect_calls: 0,
                disconnect_calls: 0,
                writes: Vec::new(),
                read_calls: 0,
                read_result: Ok(vec![0x01]),
                max_write: 20,
                write_delay: Duration::ZERO,
                fail_write_at: None,
                live: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Peripherals seen by a scan, as `(advertised name, address)`
    pub fn with_devices(self, devices: &[(&str, &str)]) -> Self {
        self.lock().devices = devices
            .iter()
            .map(|(name, address)| (name.to_string(), DeviceAddress::from(*address)))
            .collect();
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.lock().connect_delay = delay;
        self
    }

    pub fn with_max_write(self, max_write: usize) -> Self {
        self.lock().max_write = max_write;
        self
    }

    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.lock().write_delay = delay;
        self
    }

    /// The next `count` connect attempts fail with a timeout
    pub fn fail_connects(&self, count: usize) {
        self.lock().connect_failures = count;
    }

    /// The write with this zero-based index fails
    pub fn fail_write_at(&self, index: usize) {
        self.lock().fail_write_at = Some(index);
    }

    pub fn set_read_result(&self, result: Result<Vec<u8>, TransportError>) {
        self.lock().read_result = result;
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.lock().disconnect_calls
    }

    pub fn read_calls(&self) -> usize {
        self.lock().read_calls
    }

    /// Every successful write as `(bytes, confirm)`
    pub fn writes(&self) -> Vec<(Vec<u8>, bool)> {
        self.lock().writes.clone()
    }

    /// Concatenation of every successful write
    pub fn written_bytes(&self) -> Vec<u8> {
        self.lock()
            .writes
            .iter()
            .flat_map(|(data, _)| data.iter().copied())
            .collect()
    }

    pub fn live_links(&self) -> usize {
        self.lock().live.len()
    }

    /// Simulate the peripheral going away
    pub fn drop_link(&self) {
        // Callbacks run outside the lock; they may call back into the mock
        let callbacks: Vec<DisconnectCallback> = self
            .lock()
            .live
            .drain()
            .filter_map(|(_, callback)| callback)
            .collect();

        for callback in callbacks {
            callback();
        }
    }
}

#[async_trait]
impl LinkTransport for MockTransport {
    async fn discover(&self, name_prefix: &str) -> Result<Vec<DeviceAddress>, TransportError> {
        Ok(self
            .lock()
            .devices
            .iter()
            .filter(|(name, _)| matches_prefix(name, name_prefix))
            .map(|(_, address)| address.clone())
            .collect())
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<LinkHandle, TransportError> {
        let delay = {
            let mut state = self.lock();
            state.connect_calls += 1;
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransportError::Timeout);
        }

        state.next_id += 1;
        let id = state.next_id;
        state.live.insert(id, None);
        Ok(LinkHandle::new(id, address.clone()))
    }

    async fn disconnect(&self, handle: &LinkHandle) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.disconnect_calls += 1;
        state.live.remove(&handle.id());
        Ok(())
    }

    async fn write(
        &self,
        handle: &LinkHandle,
        data: &[u8],
        confirm: bool,
    ) -> Result<(), TransportError> {
        let delay = self.lock().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if !state.live.contains_key(&handle.id()) {
            return Err(TransportError::NotConnected);
        }
        if data.len() > state.max_write {
            return Err(TransportError::PayloadTooLarge {
                len: data.len(),
                max: state.max_write,
            });
        }
        if state.fail_write_at == Some(state.writes.len()) {
            state.fail_write_at = None;
            return Err(TransportError::Backend("injected write failure".into()));
        }

        state.writes.push((data.to_vec(), confirm));
        Ok(())
    }

    async fn read(&self, handle: &LinkHandle) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if !state.live.contains_key(&handle.id()) {
            return Err(TransportError::NotConnected);
        }
        state.read_calls += 1;
        state.read_result.clone()
    }

    async fn max_write_size(&self, handle: &LinkHandle) -> Result<usize, TransportError> {
        let state = self.lock();
        if !state.live.contains_key(&handle.id()) {
            return Err(TransportError::NotConnected);
        }
        Ok(state.max_write)
    }

    fn on_unsolicited_disconnect(&self, handle: &LinkHandle, callback: DisconnectCallback) {
        if let Some(slot) = self.lock().live.get_mut(&handle.id()) {
            *slot = Some(callback);
        }
    }

    fn name(&self) -> &'static str {
        "Mock"
    }
}

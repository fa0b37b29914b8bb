//! Connection manager with a single persistent link and automatic reconnection

use super::error::{LinkError, LinkResult};
use super::listener::{ConnectionListener, ListenerEvent};
use super::reconnect::AutoReconnectPolicy;
use crate::config::LinkConfig;
use crate::transport::{DeviceAddress, LinkHandle, LinkTransport, TransportError};
use idm_protocol::framing::{self, ChunkHeaderLayout, FramedCommand, FramingError, FramingOptions};
use idm_protocol::{
    is_valid_transition, ConnectionState, LinkEvent, LinkStateMachine, TransitionResult,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct LinkSlot {
    address: Option<DeviceAddress>,
    handle: Option<LinkHandle>,
}

struct Shared {
    transport: Arc<dyn LinkTransport>,
    config: LinkConfig,
    fsm: Mutex<LinkStateMachine>,
    state_tx: watch::Sender<ConnectionState>,
    link: RwLock<LinkSlot>,
    /// Serialises connection establishment and teardown
    connect_lock: Mutex<()>,
    listeners: RwLock<Vec<ConnectionListener>>,
    policy: RwLock<AutoReconnectPolicy>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the link to one display
///
/// Cloning is cheap and every clone drives the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager; nothing touches the radio until the first connect or send
    pub fn new(transport: Arc<dyn LinkTransport>, config: LinkConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let address = config.address.clone().map(DeviceAddress::from);
        let policy = AutoReconnectPolicy::new(config.auto_reconnect);

        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                fsm: Mutex::new(LinkStateMachine::new()),
                state_tx,
                link: RwLock::new(LinkSlot {
                    address,
                    handle: None,
                }),
                connect_lock: Mutex::new(()),
                listeners: RwLock::new(Vec::new()),
                policy: RwLock::new(policy),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    pub fn transport_name(&self) -> &'static str {
        self.shared.transport.name()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connectivity changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Currently bound peripheral, if any
    pub async fn address(&self) -> Option<DeviceAddress> {
        self.shared.link.read().await.address.clone()
    }

    pub async fn auto_reconnect(&self) -> AutoReconnectPolicy {
        *self.shared.policy.read().await
    }

    /// Scan for displays, strongest first
    pub async fn discover_devices(&self) -> LinkResult<Vec<DeviceAddress>> {
        let devices = self
            .shared
            .transport
            .discover(&self.shared.config.name_prefix)
            .await
            .map_err(LinkError::DiscoveryFailed)?;

        info!("[LINK] Discovery found {} display(s)", devices.len());
        Ok(devices)
    }

    /// Bind to `address`, closing the link to a previously bound peripheral
    pub async fn set_address(&self, address: impl Into<DeviceAddress>) {
        let address = address.into();
        let _guard = self.shared.connect_lock.lock().await;

        let previous = {
            let mut link = self.shared.link.write().await;
            if link.address.as_ref() == Some(&address) {
                return;
            }
            link.address = Some(address.clone());
            link.handle.take()
        };

        if let Some(handle) = previous {
            info!("[LINK] Rebinding from {} to {}", handle.address(), address);
            self.close_handle(&handle).await;
            if let TransitionResult::Success(_) = self.apply(LinkEvent::DisconnectRequested).await
            {
                self.notify(ListenerEvent::Disconnected).await;
            }
        } else {
            debug!("[LINK] Bound to {}", address);
        }
    }

    /// Bind to `address` and connect to it
    pub async fn connect_by_address(&self, address: impl Into<DeviceAddress>) -> LinkResult<()> {
        self.set_address(address).await;
        self.connect().await
    }

    /// Connect to the first display discovery reports and return its address
    pub async fn connect_by_discovery(&self) -> LinkResult<DeviceAddress> {
        let first = self
            .discover_devices()
            .await?
            .into_iter()
            .next()
            .ok_or(LinkError::DeviceNotFound)?;

        self.connect_by_address(first.clone()).await?;
        Ok(first)
    }

    /// Make sure the link is up
    ///
    /// Returns immediately when already connected; `on_connected` fires only
    /// for a link that was actually established. With no bound address this
    /// falls back to discovery when the configuration allows it.
    pub async fn connect(&self) -> LinkResult<()> {
        let _guard = self.shared.connect_lock.lock().await;

        if self.is_connected() {
            debug!("[LINK] Already connected");
            return Ok(());
        }

        let address = match self.address().await {
            Some(address) => address,
            None if self.shared.config.discovery_fallback => {
                let first = self
                    .discover_devices()
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(LinkError::DeviceNotFound)?;
                self.shared.link.write().await.address = Some(first.clone());
                first
            }
            None => return Err(LinkError::NoAddressSet),
        };

        self.establish(address).await
    }

    /// Tear the link down and keep it down
    ///
    /// Cancels a pending reconnect and suspends auto-reconnect until the next
    /// explicit connect. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        self.shared.policy.write().await.suspend();
        self.cancel_reconnect().await;

        let _guard = self.shared.connect_lock.lock().await;
        let handle = self.shared.link.write().await.handle.take();

        if let Some(handle) = &handle {
            self.close_handle(handle).await;
        }

        match self.apply(LinkEvent::DisconnectRequested).await {
            TransitionResult::Success(_) if handle.is_some() => {
                info!("[LINK] Disconnected");
                self.notify(ListenerEvent::Disconnected).await;
            }
            TransitionResult::Success(_) => debug!("[LINK] Abandoned connection attempt"),
            _ => debug!("[LINK] Already disconnected"),
        }
    }

    /// Send a payload split into consecutive transport-sized packets
    pub async fn send(&self, payload: &[u8], confirm: bool) -> LinkResult<()> {
        if payload.is_empty() {
            return Err(FramingError::EmptyPayload.into());
        }

        let handle = self.ensure_connected().await?;
        let max_write = self
            .write_size(&handle, self.shared.config.transport_chunk_override)
            .await?;
        let packets = framing::frame_simple(payload, max_write)?;

        self.transmit(&handle, FramedCommand::single_group(packets), confirm)
            .await
    }

    /// Send a payload with per-chunk headers
    ///
    /// Packets of one call go out strictly in order. Concurrent sends from
    /// several tasks are not interleave-protected; callers serialise them.
    pub async fn send_framed(
        &self,
        payload: &[u8],
        header: &dyn ChunkHeaderLayout,
        options: FramingOptions,
        confirm: bool,
    ) -> LinkResult<()> {
        if payload.is_empty() {
            return Err(FramingError::EmptyPayload.into());
        }

        let handle = self.ensure_connected().await?;
        let transport_chunk = options
            .transport_chunk
            .or(self.shared.config.transport_chunk_override);
        let max_write = self.write_size(&handle, transport_chunk).await?;
        let framed = framing::frame_structured(
            payload,
            header,
            options.protocol_chunk_size,
            max_write,
        )?;

        debug!(
            "[LINK] Framed {} bytes into {} chunk(s), {} packet(s), {} bytes on the wire",
            payload.len(),
            framed.group_count(),
            framed.packet_count(),
            framed.wire_len()
        );

        self.transmit(&handle, framed, confirm).await
    }

    /// Send packets a caller already framed
    pub async fn send_packets(&self, framed: FramedCommand, confirm: bool) -> LinkResult<()> {
        if framed.is_empty() {
            return Err(FramingError::EmptyPayload.into());
        }

        let handle = self.ensure_connected().await?;
        let max_write = self.write_size(&handle, None).await?;

        let largest = framed.max_packet_len();
        if largest > max_write {
            return Err(LinkError::WriteFailed(TransportError::PayloadTooLarge {
                len: largest,
                max: max_write,
            }));
        }

        self.transmit(&handle, framed, confirm).await
    }

    /// Read the device's response characteristic
    pub async fn read(&self) -> LinkResult<Vec<u8>> {
        let handle = self.ensure_connected().await?;

        timeout(
            self.shared.config.write_timeout,
            self.shared.transport.read(&handle),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout))
        .map_err(|e| match e {
            TransportError::NotConnected => LinkError::Disconnected,
            other => LinkError::ReadFailed(other),
        })
    }

    pub async fn add_connection_listener(&self, listener: ConnectionListener) {
        self.shared.listeners.write().await.push(listener);
    }

    /// Enable or disable auto-reconnect; disabling cancels a pending attempt
    pub async fn set_auto_reconnect(&self, enabled: bool) {
        {
            let mut policy = self.shared.policy.write().await;
            policy.set_enabled(enabled);
            if enabled && self.is_connected() {
                policy.activate();
            }
        }

        if !enabled {
            self.cancel_reconnect().await;
        }
        info!(
            "[RECONNECT] Auto-reconnect {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    async fn establish(&self, address: DeviceAddress) -> LinkResult<()> {
        // The connect lock is held, so nobody else is mid-attempt
        if self.state() == ConnectionState::Connecting {
            warn!("[LINK] Clearing an abandoned connection attempt");
            self.apply(LinkEvent::ConnectFailed).await;
        }

        match self.apply(LinkEvent::ConnectRequested).await {
            TransitionResult::Success(_) => {}
            other => {
                warn!("[LINK] Connect rejected: {:?}", other);
                return Err(LinkError::AlreadyConnecting);
            }
        }

        info!(
            "[LINK] Connecting to {} via {}",
            address,
            self.shared.transport.name()
        );

        let mut pending = PendingConnect::new(&self.shared);

        let result = timeout(
            self.shared.config.connect_timeout,
            self.shared.transport.connect(&address),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                self.apply(LinkEvent::ConnectFailed).await;
                pending.complete();
                warn!("[LINK] Failed to connect to {}: {}", address, e);
                return Err(LinkError::ConnectFailed(e));
            }
        };
        pending.handle = Some(handle.clone());

        self.shared.link.write().await.handle = Some(handle.clone());
        self.apply(LinkEvent::ConnectSucceeded).await;
        pending.complete();
        self.watch_for_drop(&handle);
        self.shared.policy.write().await.activate();

        info!("[LINK] Connected to {}", address);
        self.notify(ListenerEvent::Connected).await;
        Ok(())
    }

    /// Undo what a cancelled `establish` left behind
    async fn abandon_attempt(&self, handle: Option<LinkHandle>) {
        let _guard = self.shared.connect_lock.lock().await;

        if let Some(handle) = handle {
            {
                let mut link = self.shared.link.write().await;
                if link.handle.as_ref().map(LinkHandle::id) == Some(handle.id()) {
                    link.handle = None;
                }
            }
            debug!("[LINK] Closing link of a cancelled attempt to {}", handle.address());
            self.close_handle(&handle).await;
        }

        if self.state() == ConnectionState::Connecting {
            self.apply(LinkEvent::ConnectFailed).await;
        }
    }

    /// Route the transport's drop callback back into this manager
    fn watch_for_drop(&self, handle: &LinkHandle) {
        let weak = Arc::downgrade(&self.shared);
        let runtime = Handle::current();
        let id = handle.id();

        self.shared.transport.on_unsolicited_disconnect(
            handle,
            Box::new(move || {
                let weak = weak.clone();
                runtime.spawn(async move {
                    if let Some(shared) = weak.upgrade() {
                        ConnectionManager { shared }.handle_link_dropped(id).await;
                    }
                });
            }),
        );
    }

    async fn handle_link_dropped(&self, id: u64) {
        let guard = self.shared.connect_lock.lock().await;

        let handle = {
            let mut link = self.shared.link.write().await;
            if link.handle.as_ref().map(LinkHandle::id) != Some(id) {
                debug!("[LINK] Ignoring drop of a stale link");
                return;
            }
            link.handle.take()
        };

        if let Some(handle) = &handle {
            warn!("[LINK] Link to {} dropped", handle.address());
            // Release whatever the transport still holds for the dead link
            self.close_handle(handle).await;
        }

        if let TransitionResult::Success(_) = self.apply(LinkEvent::LinkDropped).await {
            self.notify(ListenerEvent::Disconnected).await;
        }

        drop(guard);
        self.spawn_reconnect().await;
    }

    async fn spawn_reconnect(&self) {
        let policy = *self.shared.policy.read().await;
        if !policy.should_run(self.state()) {
            debug!("[RECONNECT] Not reconnecting ({:?})", policy);
            return;
        }

        let mut task = self.shared.reconnect_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("[RECONNECT] Loop already running");
            return;
        }

        let delay = self.shared.config.reconnect_delay;
        info!("[RECONNECT] Retrying every {:?}", delay);
        *task = Some(tokio::spawn(reconnect_loop(
            Arc::downgrade(&self.shared),
            delay,
        )));
    }

    async fn cancel_reconnect(&self) {
        let task = self.shared.reconnect_task.lock().await.take();

        if let Some(task) = task {
            task.abort();
            // Cancellation is the expected outcome
            let _ = task.await;
            debug!("[RECONNECT] Loop cancelled");
        }
    }

    async fn close_handle(&self, handle: &LinkHandle) {
        if let Err(e) = self.shared.transport.disconnect(handle).await {
            warn!("[LINK] Transport disconnect failed: {}", e);
        }
    }

    async fn ensure_connected(&self) -> LinkResult<LinkHandle> {
        self.connect().await?;
        self.shared
            .link
            .read()
            .await
            .handle
            .clone()
            .ok_or(LinkError::NotConnected)
    }

    async fn write_size(
        &self,
        handle: &LinkHandle,
        transport_chunk: Option<usize>,
    ) -> LinkResult<usize> {
        let negotiated = self
            .shared
            .transport
            .max_write_size(handle)
            .await
            .map_err(write_error)?;

        let options = FramingOptions {
            transport_chunk,
            ..FramingOptions::default()
        };
        Ok(options.effective_write_size(negotiated))
    }

    async fn transmit(
        &self,
        handle: &LinkHandle,
        framed: FramedCommand,
        confirm: bool,
    ) -> LinkResult<()> {
        let mut state_rx = self.subscribe();
        let write_timeout = self.shared.config.write_timeout;
        let group_count = framed.group_count();

        for (group_index, group) in framed.groups().iter().enumerate() {
            let packet_count = group.len();

            for (packet_index, packet) in group.iter().enumerate() {
                debug!(
                    "[LINK] Sending chunk {}.{} of {}.{} ({} bytes)",
                    group_index + 1,
                    packet_index + 1,
                    group_count,
                    packet_count,
                    packet.len()
                );

                let write = timeout(
                    write_timeout,
                    self.shared.transport.write(handle, packet, confirm),
                );

                tokio::select! {
                    biased;
                    _ = state_rx.wait_for(|s| *s != ConnectionState::Connected) => {
                        return Err(LinkError::Disconnected);
                    }
                    result = write => match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(write_error(e)),
                        Err(_) => return Err(LinkError::WriteFailed(TransportError::Timeout)),
                    },
                }
            }

            if confirm {
                self.read_back(handle, &mut state_rx).await?;
            }
        }

        Ok(())
    }

    async fn read_back(
        &self,
        handle: &LinkHandle,
        state_rx: &mut watch::Receiver<ConnectionState>,
    ) -> LinkResult<()> {
        let read = timeout(
            self.shared.config.write_timeout,
            self.shared.transport.read(handle),
        );

        let result = tokio::select! {
            biased;
            _ = state_rx.wait_for(|s| *s != ConnectionState::Connected) => {
                return Err(LinkError::Disconnected);
            }
            result = read => result,
        };

        match result {
            Ok(Ok(data)) if data.is_empty() => warn!("[LINK] Empty read-back, continuing"),
            Ok(Ok(data)) => debug!("[LINK] Read-back {:02x?}", data),
            Ok(Err(TransportError::NotPermitted)) => {
                warn!("[LINK] Read-back not permitted, continuing")
            }
            Ok(Err(TransportError::NotConnected)) => return Err(LinkError::Disconnected),
            Ok(Err(e)) => return Err(LinkError::ReadFailed(e)),
            Err(_) => warn!("[LINK] Read-back timed out, continuing"),
        }

        Ok(())
    }

    async fn apply(&self, event: LinkEvent) -> TransitionResult {
        let mut fsm = self.shared.fsm.lock().await;
        let from = fsm.state();
        let result = fsm.process_event(event);

        match &result {
            TransitionResult::Success(state) => {
                debug_assert!(is_valid_transition(from, *state));
                debug!("[LINK] {:?}: {} -> {}", event, from, state);
                if *state == ConnectionState::Connected {
                    debug!("[LINK] Link #{} established", fsm.connections());
                }
                self.shared.state_tx.send_replace(*state);
            }
            TransitionResult::Invalid { from, event } => {
                debug!("[LINK] Ignoring {:?} while {}", event, from);
            }
            TransitionResult::Unchanged(_) => {}
        }

        result
    }

    async fn notify(&self, event: ListenerEvent) {
        for listener in self.shared.listeners.read().await.iter() {
            listener.dispatch(event);
        }
    }
}

/// Rolls back a connection attempt whose future is dropped before it finishes
///
/// Cleanup runs on a spawned task since it has to take the connect lock.
struct PendingConnect {
    shared: Weak<Shared>,
    /// Link the transport already opened for this attempt
    handle: Option<LinkHandle>,
    done: bool,
}

impl PendingConnect {
    fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            handle: None,
            done: false,
        }
    }

    fn complete(&mut self) {
        self.done = true;
    }
}

impl Drop for PendingConnect {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let weak = self.shared.clone();
        let handle = self.handle.take();

        runtime.spawn(async move {
            if let Some(shared) = weak.upgrade() {
                ConnectionManager { shared }.abandon_attempt(handle).await;
            }
        });
    }
}

fn write_error(err: TransportError) -> LinkError {
    match err {
        TransportError::NotConnected => LinkError::Disconnected,
        other => LinkError::WriteFailed(other),
    }
}

/// Fixed-delay reconnect loop; ends on success or when the policy says stop
async fn reconnect_loop(weak: Weak<Shared>, delay: Duration) {
    let mut attempt: u32 = 0;

    loop {
        sleep(delay).await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let manager = ConnectionManager { shared };

        let policy = *manager.shared.policy.read().await;
        if !policy.should_run(manager.state()) {
            debug!("[RECONNECT] Nothing to do, stopping");
            return;
        }

        attempt += 1;
        info!("[RECONNECT] Attempt {}", attempt);

        match manager.connect().await {
            Ok(()) if manager.is_connected() => {
                info!("[RECONNECT] Link restored after {} attempt(s)", attempt);
                return;
            }
            // Dropped again right after connecting
            Ok(()) => {}
            Err(e) => error!("[RECONNECT] Attempt {} failed: {}", attempt, e),
        }
    }
}

use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type Callback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Connectivity change delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    Connected,
    Disconnected,
}

/// Pair of optional async callbacks fired on connectivity changes
///
/// Callbacks are spawned onto the runtime and never awaited by the manager,
/// so a slow or panicking listener cannot stall the link.
#[derive(Clone, Default)]
pub struct ConnectionListener {
    on_connected: Option<Callback>,
    on_disconnected: Option<Callback>,
}

impl ConnectionListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connected = Some(Arc::new(move || callback().boxed()));
        self
    }

    pub fn on_disconnected<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_disconnected = Some(Arc::new(move || callback().boxed()));
        self
    }

    pub(crate) fn dispatch(&self, event: ListenerEvent) {
        let callback = match event {
            ListenerEvent::Connected => &self.on_connected,
            ListenerEvent::Disconnected => &self.on_disconnected,
        };

        if let Some(callback) = callback {
            tokio::spawn(callback());
        }
    }
}

impl fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .finish()
    }
}

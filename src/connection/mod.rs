//! Connection management for a single display link
//!
//! This module handles:
//! - Discovery and connection establishment, serialised per manager
//! - Packet transmission with optional read-back
//! - Connection listeners
//! - Automatic reconnection after unsolicited drops

mod error;
mod listener;
mod manager;
mod reconnect;

pub use error::{LinkError, LinkResult};
pub use listener::{ConnectionListener, ListenerEvent};
pub use manager::ConnectionManager;
pub use reconnect::AutoReconnectPolicy;

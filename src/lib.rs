//! Bluetooth LE link layer for iDotMatrix LED displays
//!
//! [`connection::ConnectionManager`] keeps one display connected over a
//! [`transport::LinkTransport`] and frames payloads for it. The wire-level
//! pieces live in the `idm-protocol` crate, re-exported as [`protocol`].

pub mod config;
pub mod connection;
pub mod display;
pub mod transport;

pub use idm_protocol as protocol;

//! iDotMatrix Shared Protocol Types
//!
//! This crate provides the wire-level pieces shared by every link to an
//! iDotMatrix LED display: GATT identifiers, packet framing, the link state
//! machine and byte builders for the simple device commands.

pub mod commands;
pub mod framing;
pub mod state_machine;

pub use framing::{
    ChunkContext, ChunkHeaderLayout, DiyImageChunkHeader, FramedCommand, FramingError,
    FramingOptions, GifChunkHeader,
};
pub use state_machine::{
    is_valid_transition, ConnectionState, LinkEvent, LinkStateMachine, TransitionResult,
};

/// Advertised name prefix of every iDotMatrix display
pub const DEVICE_NAME_PREFIX: &str = "IDM-";

/// GATT identifiers observed on the display firmware
pub mod gatt {
    /// Write characteristic (write / write-without-response)
    pub const WRITE_CHARACTERISTIC_UUID: u128 = 0x0000fa02_0000_1000_8000_00805f9b34fb;

    /// Read/notify characteristic for device responses
    pub const READ_CHARACTERISTIC_UUID: u128 = 0x0000fa03_0000_1000_8000_00805f9b34fb;

    /// ATT header bytes subtracted from the MTU to get the usable write size
    pub const ATT_HEADER_SIZE: usize = 3;

    /// Usable write size of a link that never negotiated a larger MTU
    pub const DEFAULT_WRITE_SIZE: usize = 20;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids_share_base() {
        let base_mask: u128 = 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff;
        assert_eq!(
            gatt::WRITE_CHARACTERISTIC_UUID & base_mask,
            gatt::READ_CHARACTERISTIC_UUID & base_mask
        );
        assert_ne!(gatt::WRITE_CHARACTERISTIC_UUID, gatt::READ_CHARACTERISTIC_UUID);
    }

    #[test]
    fn test_name_prefix() {
        assert!("IDM-4F2A".starts_with(DEVICE_NAME_PREFIX));
    }
}

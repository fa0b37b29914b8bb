//! Byte builders for the simple (single-packet) display commands
//!
//! Every command starts with a little-endian length that counts the whole
//! command, length bytes included:
//!
//! ```text
//! [ len_lo ][ len_hi ][ command ][ sub-command ][ args ... ]
//! ```
//!
//! The byte layouts are taken from the vendor app's `BleProtocolN`. Some
//! fields have no known meaning and are passed through unchanged.

use bytes::Bytes;
use chrono::{Datelike, NaiveDateTime, Timelike};
use thiserror::Error;

/// Errors raised for out-of-range command arguments
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Brightness must be between 5 and 100 percent, got {0}")]
    BrightnessOutOfRange(u8),

    #[error("Password must have at most 6 digits, got {0}")]
    PasswordOutOfRange(u32),
}

fn command(bytes: &[u8]) -> Bytes {
    debug_assert_eq!(bytes[0] as usize, bytes.len());
    Bytes::copy_from_slice(bytes)
}

/// Freeze or unfreeze the current screen content (toggle)
pub fn freeze_screen() -> Bytes {
    command(&[4, 0, 3, 0])
}

/// Switch the panel on or off
pub fn screen_state(on: bool) -> Bytes {
    command(&[5, 0, 7, 1, u8::from(on)])
}

/// Rotate the screen by 180 degrees
pub fn screen_flipped(flipped: bool) -> Bytes {
    command(&[5, 0, 6, 128, u8::from(flipped)])
}

/// Set brightness in percent (5..=100)
pub fn brightness(percent: u8) -> Result<Bytes, CommandError> {
    if !(5..=100).contains(&percent) {
        return Err(CommandError::BrightnessOutOfRange(percent));
    }
    Ok(command(&[5, 0, 4, 128, percent]))
}

/// Animation speed. Not referenced by the vendor app.
pub fn speed(speed: u8) -> Bytes {
    command(&[5, 0, 3, 1, speed])
}

/// Set the device clock, second precision
pub fn set_time(time: &NaiveDateTime) -> Bytes {
    command(&[
        11,
        0,
        1,
        128,
        (time.year().rem_euclid(100)) as u8,
        time.month() as u8,
        time.day() as u8,
        time.weekday().number_from_monday() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    ])
}

/// "Joint" mode. Meaning unknown.
pub fn joint(mode: u8) -> Bytes {
    command(&[5, 0, 12, 128, mode])
}

/// Protect the device with a 6-digit password. Only a reset clears it.
pub fn password(password: u32) -> Result<Bytes, CommandError> {
    if password > 999_999 {
        return Err(CommandError::PasswordOutOfRange(password));
    }

    let high = (password / 10_000) as u8;
    let mid = (password / 100 % 100) as u8;
    let low = (password % 100) as u8;

    Ok(command(&[8, 0, 4, 2, 1, high, mid, low]))
}

/// Reset sequence that clears stuck device state
pub fn reset() -> [Bytes; 2] {
    [command(&[4, 0, 3, 128]), command(&[5, 0, 4, 128, 80])]
}

/// Enter (1) or leave (0) DIY drawing mode
pub fn diy_mode(mode: u8) -> Bytes {
    command(&[5, 0, 4, 1, mode])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_screen_commands() {
        assert_eq!(&screen_state(true)[..], &[5, 0, 7, 1, 1]);
        assert_eq!(&screen_state(false)[..], &[5, 0, 7, 1, 0]);
        assert_eq!(&screen_flipped(true)[..], &[5, 0, 6, 128, 1]);
        assert_eq!(&freeze_screen()[..], &[4, 0, 3, 0]);
    }

    #[test]
    fn test_brightness_range() {
        assert_eq!(&brightness(5).unwrap()[..], &[5, 0, 4, 128, 5]);
        assert_eq!(&brightness(100).unwrap()[..], &[5, 0, 4, 128, 100]);
        assert_eq!(brightness(4), Err(CommandError::BrightnessOutOfRange(4)));
        assert_eq!(brightness(101), Err(CommandError::BrightnessOutOfRange(101)));
    }

    #[test]
    fn test_set_time_layout() {
        // 2024-03-14 is a Thursday
        let time = NaiveDate::from_ymd_opt(2024, 3, 14)
            .and_then(|d| d.and_hms_opt(13, 37, 42))
            .expect("valid date");

        assert_eq!(
            &set_time(&time)[..],
            &[11, 0, 1, 128, 24, 3, 14, 4, 13, 37, 42]
        );
    }

    #[test]
    fn test_password_digits() {
        assert_eq!(&password(123_456).unwrap()[..], &[8, 0, 4, 2, 1, 12, 34, 56]);
        assert_eq!(&password(7).unwrap()[..], &[8, 0, 4, 2, 1, 0, 0, 7]);
        assert!(password(1_000_000).is_err());
    }

    #[test]
    fn test_reset_sequence() {
        let [first, second] = reset();
        assert_eq!(&first[..], &[0x04, 0x00, 0x03, 0x80]);
        assert_eq!(&second[..], &[0x05, 0x00, 0x04, 0x80, 0x50]);
    }

    #[test]
    fn test_misc_commands() {
        assert_eq!(&diy_mode(1)[..], &[5, 0, 4, 1, 1]);
        assert_eq!(&joint(3)[..], &[5, 0, 12, 128, 3]);
        assert_eq!(&speed(9)[..], &[5, 0, 3, 1, 9]);
    }
}

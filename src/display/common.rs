use super::send_settled;
use crate::connection::{ConnectionManager, LinkResult};
use chrono::{Local, NaiveDateTime};
use idm_protocol::commands;
use tracing::info;

/// Device-wide commands: power, orientation, brightness, clock, reset
pub struct CommonCommands<'a> {
    link: &'a ConnectionManager,
}

impl<'a> CommonCommands<'a> {
    pub fn new(link: &'a ConnectionManager) -> Self {
        Self { link }
    }

    /// Toggle freezing of the current screen content
    pub async fn freeze_screen(&self) -> LinkResult<()> {
        send_settled(self.link, &commands::freeze_screen(), true).await
    }

    pub async fn screen_on(&self) -> LinkResult<()> {
        send_settled(self.link, &commands::screen_state(true), false).await
    }

    pub async fn screen_off(&self) -> LinkResult<()> {
        send_settled(self.link, &commands::screen_state(false), true).await
    }

    pub async fn flip_screen(&self, flipped: bool) -> LinkResult<()> {
        send_settled(self.link, &commands::screen_flipped(flipped), true).await
    }

    /// Brightness in percent, 5 to 100
    pub async fn set_brightness(&self, percent: u8) -> LinkResult<()> {
        let data = commands::brightness(percent)?;
        send_settled(self.link, &data, true).await
    }

    pub async fn set_speed(&self, speed: u8) -> LinkResult<()> {
        send_settled(self.link, &commands::speed(speed), false).await
    }

    pub async fn set_time(&self, time: &NaiveDateTime) -> LinkResult<()> {
        send_settled(self.link, &commands::set_time(time), true).await
    }

    /// Set the device clock to local time
    pub async fn sync_time(&self) -> LinkResult<()> {
        let now = Local::now().naive_local();
        info!("[LINK] Setting device time to {}", now.format("%Y-%m-%d %H:%M:%S"));
        self.set_time(&now).await
    }

    pub async fn set_joint(&self, mode: u8) -> LinkResult<()> {
        send_settled(self.link, &commands::joint(mode), false).await
    }

    /// Lock the device behind a 6-digit password
    pub async fn set_password(&self, password: u32) -> LinkResult<()> {
        let data = commands::password(password)?;
        send_settled(self.link, &data, false).await
    }

    /// Clear stuck device state
    pub async fn reset(&self) -> LinkResult<()> {
        for data in commands::reset() {
            send_settled(self.link, &data, true).await?;
        }
        Ok(())
    }
}

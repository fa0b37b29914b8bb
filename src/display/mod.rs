//! Display features built on top of the connection manager
//!
//! Each feature borrows the manager for the duration of its calls. Payloads
//! come from [`idm_protocol::commands`] or from already encoded media; nothing
//! here decodes images.

mod common;
mod gif;
mod image;

pub use common::CommonCommands;
pub use gif::GifUpload;
pub use image::ImageUpload;

use crate::connection::{ConnectionManager, LinkResult};
use tokio::time::sleep;

/// Send one command and give the device time to process it
async fn send_settled(link: &ConnectionManager, data: &[u8], confirm: bool) -> LinkResult<()> {
    link.send(data, confirm).await?;
    settle(link).await;
    Ok(())
}

async fn settle(link: &ConnectionManager) {
    let pause = link.config().command_settle;
    if !pause.is_zero() {
        sleep(pause).await;
    }
}

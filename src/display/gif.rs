use super::settle;
use crate::connection::{ConnectionManager, LinkResult};
use idm_protocol::{FramingOptions, GifChunkHeader};
use tracing::info;

/// Uploads encoded GIF animations
pub struct GifUpload<'a> {
    link: &'a ConnectionManager,
}

impl<'a> GifUpload<'a> {
    pub fn new(link: &'a ConnectionManager) -> Self {
        Self { link }
    }

    /// Upload a GIF already sized for the panel
    pub async fn upload(&self, gif: &[u8], time_sign: u8) -> LinkResult<()> {
        self.upload_as(gif, GifChunkHeader::TYPE_NO_TIME_SIGNATURE, time_sign)
            .await
    }

    /// Upload with an explicit content type byte
    pub async fn upload_as(&self, gif: &[u8], gif_type: u8, time_sign: u8) -> LinkResult<()> {
        info!("[LINK] Uploading {} byte GIF (type {})", gif.len(), gif_type);

        let header = GifChunkHeader::new(gif_type, time_sign);
        self.link
            .send_framed(gif, &header, FramingOptions::legacy_upload(), true)
            .await?;

        settle(self.link).await;
        Ok(())
    }
}

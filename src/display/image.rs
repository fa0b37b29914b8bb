use super::{send_settled, settle};
use crate::connection::{ConnectionManager, LinkResult};
use idm_protocol::{commands, DiyImageChunkHeader, FramingOptions};
use tracing::info;

/// Uploads raw RGB frames through DIY mode
pub struct ImageUpload<'a> {
    link: &'a ConnectionManager,
}

impl<'a> ImageUpload<'a> {
    pub fn new(link: &'a ConnectionManager) -> Self {
        Self { link }
    }

    /// Enter (1) or leave (0) DIY mode
    pub async fn set_mode(&self, mode: u8) -> LinkResult<()> {
        send_settled(self.link, &commands::diy_mode(mode), false).await
    }

    /// Upload row-major RGB888 pixels sized for the panel
    pub async fn upload_rgb(&self, rgb: &[u8]) -> LinkResult<()> {
        info!("[LINK] Uploading {} bytes of pixel data", rgb.len());

        self.link
            .send_framed(rgb, &DiyImageChunkHeader, FramingOptions::legacy_upload(), false)
            .await?;

        settle(self.link).await;
        Ok(())
    }

    /// Fill a `width` x `height` frame with one colour
    pub fn solid_frame(width: usize, height: usize, rgb: [u8; 3]) -> Vec<u8> {
        rgb.repeat(width * height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::transport::mock::MockTransport;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_diy_upload() {
        let mock = Arc::new(MockTransport::new().with_max_write(512));
        let config = LinkConfig {
            address: Some("AA:BB:CC:DD:EE:01".into()),
            ..Default::default()
        };
        let link = ConnectionManager::new(mock.clone(), config);
        let images = ImageUpload::new(&link);

        // 32x32 frame: 3072 bytes, one protocol chunk
        let frame = ImageUpload::solid_frame(32, 32, [255, 0, 0]);
        assert_eq!(frame.len(), 3072);

        images.set_mode(1).await.unwrap();
        images.upload_rgb(&frame).await.unwrap();

        let writes = mock.writes();
        assert_eq!(writes[0], (vec![5, 0, 4, 1, 1], false));

        // 3081 bytes on the wire in 509-byte slices
        let upload = &writes[1..];
        assert_eq!(upload.len(), 7);
        assert!(upload.iter().all(|(d, confirm)| d.len() <= 509 && !confirm));
        assert_eq!(&upload[0].0[0..2], &3081u16.to_le_bytes());
        assert_eq!(&upload[0].0[5..9], &3072u32.to_le_bytes());
        assert_eq!(mock.read_calls(), 0);
    }
}

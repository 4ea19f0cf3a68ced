use async_trait::async_trait;
use tokio::sync::broadcast;

/// Tuning passed to the decoder when a live feed starts. A continuous feed
/// re-reads the same physical code on every frame, so backends are asked to
/// rate-limit emission at the source as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderOptions {
    pub preferred_camera: Option<String>,
    pub max_scans_per_second: u32,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            preferred_camera: None,
            max_scans_per_second: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub camera_id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    Decoded { payload: String },
}

/// A running camera feed. Dropping the handle does not stop the backend;
/// callers own the stop() lifecycle.
#[async_trait]
pub trait DecodeSession: Send + Sync {
    async fn stop(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<DecodeEvent>;
}

#[async_trait]
pub trait QrDecoder: Send + Sync {
    async fn list_cameras(&self) -> anyhow::Result<Vec<CameraInfo>>;
    async fn start(
        &self,
        options: DecoderOptions,
    ) -> anyhow::Result<std::sync::Arc<dyn DecodeSession>>;
    /// Decode a single still image. Errors when no QR payload can be read.
    async fn decode_image(&self, image_bytes: &[u8]) -> anyhow::Result<String>;
}

//! Live frame streaming from the browser page to the session channel.
//!
//! Two delivery modes behind one trait, selected at construction:
//! - [`PollingStreamer`] captures a screenshot on a fixed interval.
//! - [`ScreencastStreamer`] subscribes to the browser's native screencast
//!   events and acknowledges every delivered frame (flow control).
//!
//! The sink is an unbounded channel sender, so handing off a frame never
//! blocks the producer; the control loop and the streamer share the page
//! handle and run fully concurrently.

mod poller;
mod screencast;

pub use poller::PollingStreamer;
pub use screencast::ScreencastStreamer;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::browser::BrowserAdapter;

/// Native frame rate of the browser's screencast producer.
const NATIVE_PRODUCER_FPS: u32 = 60;

/// Frame delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Polling,
    Push,
}

impl FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "poll" | "polling" => Ok(StreamMode::Polling),
            "push" | "screencast" => Ok(StreamMode::Push),
            other => Err(format!("unknown stream mode '{}'", other)),
        }
    }
}

/// Streaming parameters. Owned by the streamer; the rest of the system
/// treats the values as read-only.
#[derive(Debug, Clone, Copy)]
pub struct StreamingConfig {
    pub mode: StreamMode,
    pub target_fps: u32,
    pub quality: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl StreamingConfig {
    /// Clamp fps to 1-60 and quality to 1-100.
    pub fn clamped(mut self) -> Self {
        self.target_fps = self.target_fps.clamp(1, 60);
        self.quality = self.quality.clamp(1, 100);
        self
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::Push,
            target_fps: 15,
            quality: 70,
            max_width: 1280,
            max_height: 720,
        }
    }
}

/// Metadata delivered alongside every frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMetadata {
    pub fps: u32,
    pub quality: u32,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

/// One captured frame: base64 JPEG plus metadata.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: String,
    pub metadata: FrameMetadata,
}

/// Where frames go. Unbounded so a slow consumer never stalls capture.
pub type FrameSink = mpsc::UnboundedSender<Frame>;

/// Observability snapshot of a streamer.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub mode: StreamMode,
    pub fps: u32,
    pub quality: u32,
    pub active: bool,
}

/// A frame source that can be started, stopped, reconfigured, and inspected.
///
/// `stop` is idempotent and detaches any event subscription, so repeated
/// start/stop cycles within one session never double-deliver frames.
/// `configure` applies new clamped settings, restarting a running stream so
/// they take effect; the delivery mode is fixed at construction and a
/// conflicting mode in the new settings is ignored with a warning.
#[async_trait]
pub trait FrameStreamer: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self);
    async fn configure(&self, config: StreamingConfig) -> anyhow::Result<()>;
    fn info(&self) -> StreamInfo;
}

/// Build the streamer matching the configured mode.
pub fn build(
    config: StreamingConfig,
    adapter: Arc<BrowserAdapter>,
    sink: FrameSink,
) -> Arc<dyn FrameStreamer> {
    let config = config.clamped();
    match config.mode {
        StreamMode::Polling => Arc::new(PollingStreamer::new(config, adapter, sink)),
        StreamMode::Push => Arc::new(ScreencastStreamer::new(config, adapter, sink)),
    }
}

/// How many producer frames to skip per emitted frame: a ~60fps producer and
/// a 30fps target means every 2nd frame.
pub fn frame_skip(target_fps: u32) -> u32 {
    (NATIVE_PRODUCER_FPS / target_fps.clamp(1, NATIVE_PRODUCER_FPS)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_clamps_fps_and_quality() {
        let config = StreamingConfig {
            mode: StreamMode::Polling,
            target_fps: 0,
            quality: 300,
            max_width: 1280,
            max_height: 720,
        }
        .clamped();
        assert_eq!(config.target_fps, 1);
        assert_eq!(config.quality, 100);

        let config = StreamingConfig {
            target_fps: 144,
            ..StreamingConfig::default()
        }
        .clamped();
        assert_eq!(config.target_fps, 60);
    }

    #[test]
    fn frame_skip_ratio() {
        assert_eq!(frame_skip(30), 2);
        assert_eq!(frame_skip(60), 1);
        assert_eq!(frame_skip(15), 4);
        assert_eq!(frame_skip(1), 60);
        // Targets above the producer rate emit every frame.
        assert_eq!(frame_skip(90), 1);
    }

    #[test]
    fn stream_mode_parsing() {
        assert_eq!("poll".parse::<StreamMode>().unwrap(), StreamMode::Polling);
        assert_eq!("push".parse::<StreamMode>().unwrap(), StreamMode::Push);
        assert_eq!(
            "screencast".parse::<StreamMode>().unwrap(),
            StreamMode::Push
        );
        assert!("mjpeg".parse::<StreamMode>().is_err());
    }
}

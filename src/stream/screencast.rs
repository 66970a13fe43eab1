//! Push streaming over the browser's native screencast events.
//!
//! Subscribes to `Page.screencastFrame`, forwards each frame to the sink, and
//! acknowledges it back to the browser. The browser withholds the next frame
//! until the previous one is acknowledged, so the ack must never be skipped;
//! the sink itself is an unbounded sender and cannot stall the loop.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::{
    EventScreencastFrame, ScreencastFrameAckParams, StartScreencastFormat, StartScreencastParams,
    StopScreencastParams,
};
use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::browser::BrowserAdapter;

use super::{
    frame_skip, Frame, FrameMetadata, FrameSink, FrameStreamer, StreamInfo, StreamMode,
    StreamingConfig,
};

pub struct ScreencastStreamer {
    config: Mutex<StreamingConfig>,
    adapter: Arc<BrowserAdapter>,
    sink: FrameSink,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScreencastStreamer {
    pub fn new(config: StreamingConfig, adapter: Arc<BrowserAdapter>, sink: FrameSink) -> Self {
        Self {
            config: Mutex::new(config.clamped()),
            adapter,
            sink,
            task: Mutex::new(None),
        }
    }

    fn current_config(&self) -> StreamingConfig {
        self.config
            .lock()
            .map(|guard| *guard)
            .unwrap_or_default()
    }

    fn is_active(&self) -> bool {
        self.task
            .lock()
            .map(|guard| guard.as_ref().map(|t| !t.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }
}

#[async_trait]
impl FrameStreamer for ScreencastStreamer {
    async fn start(&self) -> anyhow::Result<()> {
        if self.is_active() {
            return Ok(());
        }

        let config = self.current_config();
        let page = self.adapter.page().await?;
        let sink = self.sink.clone();

        // Subscribe before starting the cast so no frame slips past.
        let mut events = page.event_listener::<EventScreencastFrame>().await?;

        let mut params = StartScreencastParams::default();
        params.format = Some(StartScreencastFormat::Jpeg);
        params.quality = Some(config.quality as i64);
        params.max_width = Some(config.max_width as i64);
        params.max_height = Some(config.max_height as i64);
        params.every_nth_frame = Some(frame_skip(config.target_fps) as i64);
        page.execute(params).await?;

        tracing::info!(
            fps = config.target_fps,
            quality = config.quality,
            skip = frame_skip(config.target_fps),
            "Starting screencast frame stream"
        );

        let ack_page = page.clone();
        let handle = tokio::spawn(async move {
            let mut frame_count: u64 = 0;

            while let Some(event) = events.next().await {
                // Acknowledge first: an unacknowledged frame stalls the cast.
                if let Err(e) = ack_page
                    .execute(ScreencastFrameAckParams::new(event.session_id))
                    .await
                {
                    tracing::warn!("Screencast ack failed: {}", e);
                }

                frame_count += 1;
                let frame = Frame {
                    // Screencast frames arrive base64-encoded already.
                    data: event.data.clone().into(),
                    metadata: FrameMetadata {
                        fps: config.target_fps,
                        quality: config.quality,
                        width: event.metadata.device_width as u32,
                        height: event.metadata.device_height as u32,
                        captured_at: Utc::now(),
                    },
                };
                if sink.send(frame).is_err() {
                    tracing::debug!("Frame sink closed, stopping screencast loop");
                    break;
                }
            }

            tracing::info!(frames = frame_count, "Screencast frame stream ended");
        });

        if let Ok(mut guard) = self.task.lock() {
            *guard = Some(handle);
        }
        Ok(())
    }

    async fn stop(&self) {
        let handle = self.task.lock().ok().and_then(|mut guard| guard.take());
        let Some(handle) = handle else {
            return;
        };
        // Dropping the listener task detaches the event subscription.
        handle.abort();
        if let Ok(page) = self.adapter.page().await {
            if let Err(e) = page.execute(StopScreencastParams::default()).await {
                tracing::debug!("Stop screencast failed (page may be gone): {}", e);
            }
        }
        tracing::debug!("Screencast frame stream stopped");
    }

    async fn configure(&self, config: StreamingConfig) -> anyhow::Result<()> {
        let mut next = config.clamped();
        if next.mode != StreamMode::Push {
            tracing::warn!("Streamer mode is fixed at construction, staying in push mode");
            next.mode = StreamMode::Push;
        }
        if let Ok(mut guard) = self.config.lock() {
            *guard = next;
        }
        // The cast was started with the old parameters; bounce it so the
        // browser picks up the new ones.
        if self.is_active() {
            self.stop().await;
            self.start().await?;
        }
        tracing::debug!(
            fps = next.target_fps,
            quality = next.quality,
            "Screencast frame stream reconfigured"
        );
        Ok(())
    }

    fn info(&self) -> StreamInfo {
        let config = self.current_config();
        StreamInfo {
            mode: StreamMode::Push,
            fps: config.target_fps,
            quality: config.quality,
            active: self.is_active(),
        }
    }
}

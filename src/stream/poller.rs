//! Interval-driven screenshot streaming.
//!
//! Captures a JPEG on a fixed cadence and hands it to the sink. Individual
//! capture failures are logged and the interval keeps running; the page may
//! be mid-navigation or mid-click when a capture lands.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use tokio::task::JoinHandle;

use crate::browser::BrowserAdapter;

use super::{Frame, FrameMetadata, FrameSink, FrameStreamer, StreamInfo, StreamMode, StreamingConfig};

pub struct PollingStreamer {
    config: Mutex<StreamingConfig>,
    adapter: Arc<BrowserAdapter>,
    sink: FrameSink,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingStreamer {
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
impl FrameStreamer for PollingStreamer {
    async fn start(&self) -> anyhow::Result<()> {
        if self.is_active() {
            return Ok(());
        }

        let config = self.current_config();
        let adapter = Arc::clone(&self.adapter);
        let sink = self.sink.clone();
        let interval = Duration::from_millis(1000 / config.target_fps.max(1) as u64);

        tracing::info!(
            fps = config.target_fps,
            quality = config.quality,
            "Starting polling frame stream"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut frame_count: u64 = 0;

            loop {
                ticker.tick().await;
                match adapter.screenshot(config.quality).await {
                    Ok(jpeg) => {
                        frame_count += 1;
                        let frame = Frame {
                            data: BASE64.encode(&jpeg),
                            metadata: FrameMetadata {
                                fps: config.target_fps,
                                quality: config.quality,
                                width: config.max_width,
                                height: config.max_height,
                                captured_at: Utc::now(),
                            },
                        };
                        if sink.send(frame).is_err() {
                            tracing::debug!("Frame sink closed, stopping poll loop");
                            break;
                        }
                    }
                    Err(e) => {
                        // The stream outlives individual capture faults.
                        tracing::warn!("Frame capture failed: {}", e);
                    }
                }
            }

            tracing::info!(frames = frame_count, "Polling frame stream ended");
        });

        if let Ok(mut guard) = self.task.lock() {
            *guard = Some(handle);
        }
        Ok(())
    }

    async fn stop(&self) {
        let handle = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            handle.abort();
            tracing::debug!("Polling frame stream stopped");
        }
    }

    async fn configure(&self, config: StreamingConfig) -> anyhow::Result<()> {
        let mut next = config.clamped();
        if next.mode != StreamMode::Polling {
            tracing::warn!("Streamer mode is fixed at construction, staying in polling mode");
            next.mode = StreamMode::Polling;
        }
        if let Ok(mut guard) = self.config.lock() {
            *guard = next;
        }
        // A running interval loop captured the old settings; bounce it.
        if self.is_active() {
            self.stop().await;
            self.start().await?;
        }
        tracing::debug!(
            fps = next.target_fps,
            quality = next.quality,
            "Polling frame stream reconfigured"
        );
        Ok(())
    }

    fn info(&self) -> StreamInfo {
        let config = self.current_config();
        StreamInfo {
            mode: StreamMode::Polling,
            fps: config.target_fps,
            quality: config.quality,
            active: self.is_active(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn streamer() -> PollingStreamer {
        let (tx, _rx) = mpsc::unbounded_channel();
        PollingStreamer::new(
            StreamingConfig {
                mode: StreamMode::Polling,
                ..StreamingConfig::default()
            },
            Arc::new(BrowserAdapter::new()),
            tx,
        )
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let streamer = streamer();
        streamer.stop().await;
        streamer.stop().await;
        assert!(!streamer.info().active);
    }

    #[tokio::test]
    async fn start_stop_cycles_leave_single_task() {
        let streamer = streamer();
        streamer.start().await.unwrap();
        assert!(streamer.info().active);
        streamer.stop().await;
        assert!(!streamer.info().active);
        streamer.start().await.unwrap();
        streamer.start().await.unwrap(); // second start is a no-op
        assert!(streamer.info().active);
        streamer.stop().await;
        assert!(!streamer.info().active);
    }

    #[tokio::test]
    async fn configure_updates_settings_and_restarts_active_stream() {
        let streamer = streamer();
        streamer.start().await.unwrap();

        streamer
            .configure(StreamingConfig {
                mode: StreamMode::Polling,
                target_fps: 300,
                quality: 20,
                max_width: 640,
                max_height: 480,
            })
            .await
            .unwrap();

        let info = streamer.info();
        assert_eq!(info.fps, 60); // clamped
        assert_eq!(info.quality, 20);
        assert!(info.active, "reconfiguration keeps a running stream running");
        streamer.stop().await;
    }

    #[tokio::test]
    async fn configure_while_stopped_stays_stopped() {
        let streamer = streamer();
        streamer
            .configure(StreamingConfig {
                mode: StreamMode::Polling,
                quality: 30,
                ..StreamingConfig::default()
            })
            .await
            .unwrap();
        let info = streamer.info();
        assert_eq!(info.quality, 30);
        assert!(!info.active);
    }

    #[tokio::test]
    async fn configure_cannot_switch_mode() {
        let streamer = streamer();
        streamer
            .configure(StreamingConfig {
                mode: StreamMode::Push,
                ..StreamingConfig::default()
            })
            .await
            .unwrap();
        assert_eq!(streamer.info().mode, StreamMode::Polling);
    }

    #[test]
    fn info_reports_mode_and_settings() {
        let streamer = streamer();
        let info = streamer.info();
        assert_eq!(info.mode, StreamMode::Polling);
        assert_eq!(info.fps, 15);
        assert_eq!(info.quality, 70);
    }
}

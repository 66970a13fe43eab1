//! Browser adapter: a thin façade over chromiumoxide (Chrome DevTools
//! Protocol).
//!
//! Owns the single browser session per connected observer. Either connects to
//! an already-running Chrome (`BROWSER_CDP_URL`, started with
//! `--remote-debugging-port=9222`) or launches its own headless instance.
//!
//! The adapter hides every CDP detail behind a small surface: navigation,
//! element interaction, page observation (numbered-element harvest plus
//! visible text), screenshots, raw input dispatch, and bounded teardown.

pub mod extract;
pub mod input;

use std::collections::BTreeMap;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub use input::{KeyboardAction, KeyboardActionType, MouseAction, MouseActionType};

/// Delay before re-reading page state after a click or history move.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Delay before the single retry on a destroyed execution context.
const CONTEXT_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Per-resource budget during teardown; a hung resource is abandoned.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// A single interactive element from the latest observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementDescriptor {
    pub name: String,
    pub selector: String,
}

/// Numbered-element map, rebuilt on every observation. Ids from an older
/// observation are invalid: the harvest re-tags the live DOM each time.
pub type ElementMap = BTreeMap<u32, ElementDescriptor>;

/// Result of observing the current page.
#[derive(Debug, Clone)]
pub struct PageObservation {
    pub url: String,
    pub title: String,
    pub text: String,
    pub elements: ElementMap,
}

struct BrowserHandle {
    browser: Browser,
    page: Page,
    event_task: JoinHandle<()>,
}

/// Façade over one live browser session.
pub struct BrowserAdapter {
    inner: Mutex<Option<BrowserHandle>>,
}

impl BrowserAdapter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Start the browser session: connect to `cdp_url` when given, otherwise
    /// launch a headless instance sized to the streaming viewport.
    pub async fn initialize(
        &self,
        cdp_url: Option<&str>,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let (browser, mut handler) = match cdp_url {
            Some(url) => Browser::connect(url).await.map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Chrome at {}. Make sure Chrome is running with --remote-debugging-port. Error: {}",
                    url,
                    e
                )
            })?,
            None => {
                let config = BrowserConfig::builder()
                    .window_size(width, height)
                    .build()
                    .map_err(|e| anyhow::anyhow!("Invalid browser config: {}", e))?;
                Browser::launch(config)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to launch headless Chrome: {}", e))?
            }
        };

        // The handler future must be polled for the CDP connection to make
        // progress.
        let event_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!("Browser event error: {}", e);
                }
            }
        });

        let page = browser.new_page("about:blank").await?;

        *guard = Some(BrowserHandle {
            browser,
            page,
            event_task,
        });
        tracing::info!("Browser session initialized");
        Ok(())
    }

    /// Clone of the live page handle. The page is internally reference
    /// counted, so the frame streamer can hold its own copy.
    pub async fn page(&self) -> anyhow::Result<Page> {
        let guard = self.inner.lock().await;
        guard
            .as_ref()
            .map(|h| h.page.clone())
            .ok_or_else(|| anyhow::anyhow!("Browser session not initialized"))
    }

    /// Navigate to a URL and wait for the load to finish.
    pub async fn navigate(&self, url: &str) -> anyhow::Result<()> {
        let page = self.page().await?;
        page.goto(url).await?;
        page.wait_for_navigation().await.ok();
        Ok(())
    }

    /// Click the element matching `selector`, then let the page settle.
    pub async fn click(&self, selector: &str) -> anyhow::Result<()> {
        let page = self.page().await?;
        let element = page
            .find_element(selector)
            .await
            .map_err(|e| anyhow::anyhow!("Element '{}' not found: {}", selector, e))?;
        element.click().await?;
        tokio::time::sleep(SETTLE_DELAY).await;
        Ok(())
    }

    /// Focus the element matching `selector`, clear it, and type `text`.
    pub async fn type_text(&self, selector: &str, text: &str) -> anyhow::Result<()> {
        let page = self.page().await?;
        let element = page
            .find_element(selector)
            .await
            .map_err(|e| anyhow::anyhow!("Element '{}' not found: {}", selector, e))?;
        element.click().await?;
        page.evaluate("if (document.activeElement && 'value' in document.activeElement) document.activeElement.value = ''")
            .await
            .ok();
        element.type_str(text).await?;
        Ok(())
    }

    /// Press the Enter key in the focused element.
    pub async fn press_enter(&self) -> anyhow::Result<()> {
        let page = self.page().await?;
        input::press_enter(&page).await
    }

    /// Go back one entry in the session history.
    pub async fn go_back(&self) -> anyhow::Result<()> {
        let page = self.page().await?;
        page.evaluate("window.history.back()").await?;
        tokio::time::sleep(SETTLE_DELAY).await;
        page.wait_for_navigation().await.ok();
        Ok(())
    }

    /// Scroll the page by the given pixel deltas.
    pub async fn scroll_by(&self, dx: f64, dy: f64) -> anyhow::Result<()> {
        let page = self.page().await?;
        page.evaluate(format!("window.scrollBy({}, {})", dx, dy))
            .await?;
        Ok(())
    }

    /// URL the page is currently on.
    pub async fn current_url(&self) -> anyhow::Result<String> {
        let page = self.page().await?;
        Ok(page.url().await?.map(|u| u.to_string()).unwrap_or_default())
    }

    /// Observe the page: visible text plus a fresh numbered-element map.
    ///
    /// A navigation racing the harvest destroys the execution context; that
    /// specific failure is retried exactly once after a short delay. Anything
    /// else propagates.
    pub async fn observe(&self) -> anyhow::Result<PageObservation> {
        let page = self.page().await?;
        match extract::harvest(&page).await {
            Ok(observation) => Ok(observation),
            Err(e) if is_destroyed_context(&e) => {
                tracing::debug!("Execution context destroyed during observe, retrying once");
                tokio::time::sleep(CONTEXT_RETRY_DELAY).await;
                extract::harvest(&page).await
            }
            Err(e) => Err(e),
        }
    }

    /// JPEG screenshot of the current viewport.
    pub async fn screenshot(&self, quality: u32) -> anyhow::Result<Vec<u8>> {
        let page = self.page().await?;
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .quality(quality as i64)
            .build();
        Ok(page.screenshot(params).await?)
    }

    /// Dispatch a raw mouse event (observer passthrough).
    pub async fn mouse_action(&self, action: &MouseAction) -> anyhow::Result<()> {
        let page = self.page().await?;
        input::dispatch_mouse(&page, action).await
    }

    /// Dispatch a raw keyboard event (observer passthrough).
    pub async fn keyboard_action(&self, action: &KeyboardAction) -> anyhow::Result<()> {
        let page = self.page().await?;
        input::dispatch_keyboard(&page, action).await
    }

    /// Release every resource with a bounded timeout per resource.
    ///
    /// Tolerates partial initialization. A resource that refuses to close
    /// within its budget is abandoned and teardown moves on; the handle is
    /// dropped either way so nothing keeps the session alive.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        let Some(mut handle) = guard.take() else {
            return;
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, handle.page.close()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("Page close failed: {}", e),
            Err(_) => tracing::warn!("Page close timed out, abandoning handle"),
        }

        match tokio::time::timeout(CLOSE_TIMEOUT, handle.browser.close()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("Browser close failed: {}", e),
            Err(_) => tracing::warn!("Browser close timed out, abandoning handle"),
        }

        handle.event_task.abort();
        tracing::info!("Browser session closed");
    }
}

impl Default for BrowserAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Detect the navigation race where the page's execution context vanished
/// between an action and the next evaluation.
fn is_destroyed_context(err: &anyhow::Error) -> bool {
    let message = err.to_string();
    message.contains("context was destroyed")
        || message.contains("Execution context")
        || message.contains("Cannot find context")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroyed_context_detection() {
        assert!(is_destroyed_context(&anyhow::anyhow!(
            "Execution context was destroyed."
        )));
        assert!(is_destroyed_context(&anyhow::anyhow!(
            "Cannot find context with specified id"
        )));
        assert!(!is_destroyed_context(&anyhow::anyhow!(
            "Element '#login' not found"
        )));
    }

    #[tokio::test]
    async fn uninitialized_adapter_reports_missing_session() {
        let adapter = BrowserAdapter::new();
        let err = adapter.current_url().await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
        // Close on a partially (here: never) initialized adapter is a no-op.
        adapter.close().await;
    }
}

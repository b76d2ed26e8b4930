//! Browser-side portal driving. The orchestrator talks to [`SubsidyPortal`];
//! [`PortalBrowser`] implements it over headless Chrome. Popup windows are
//! acquired through [`PopupSession`], which closes them on every exit path;
//! across hundreds of sequential region visits a leaked popup starves the
//! browser's target pool.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::target::TargetId;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CrawlConfig, DelayRange, PortalConfig};
use crate::extract;
use crate::models::Region;

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("popup window did not appear within {timeout:?}")]
    PopupTimeout { timeout: Duration },

    #[error("category tab '{0}' not found on page")]
    TabNotFound(String),

    #[error("year selector missing or not interactable")]
    YearSelectMissing,

    #[error("script hook failed: {0}")]
    Script(String),

    #[error(transparent)]
    Cdp(#[from] CdpError),
}

/// The orchestrator's view of the remote portal. Implementations own all
/// window/navigation state; extraction sees only HTML snapshots.
#[async_trait]
pub trait SubsidyPortal: Send + Sync {
    /// Select the model year in the page's year dropdown.
    async fn select_year(&self, year: &str) -> Result<(), PortalError>;

    /// Activate a vehicle-category tab and wait for the table to reload.
    async fn select_category(&self, tab_label: &str) -> Result<(), PortalError>;

    /// Snapshot of the current main-page HTML.
    async fn page_html(&self) -> Result<String, PortalError>;

    /// Open the region's detail popup, snapshot it, and close it again. On
    /// failure every secondary window is closed before the error surfaces.
    async fn region_popup_html(&self, year: &str, region: &Region)
        -> Result<String, PortalError>;
}

// ── PortalBrowser ─────────────────────────────────────────────────────────────

pub struct PortalBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Page,
    main_target: TargetId,
    popup_timeout: Duration,
    popup_settle: DelayRange,
    tab_settle: DelayRange,
}

impl PortalBrowser {
    /// Launch headless Chrome and navigate the main page to `url`.
    pub async fn launch(
        portal: &PortalConfig,
        crawl: &CrawlConfig,
        url: &str,
    ) -> Result<Self, PortalError> {
        let browser_cfg = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(Duration::from_secs(portal.nav_timeout_secs))
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg(format!("--user-agent={}", portal.user_agent))
            .build()
            .map_err(PortalError::Script)?;

        let (browser, mut handler) = Browser::launch(browser_cfg).await?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        info!("Navigating to {}", url);
        let page = browser.new_page(url).await?;
        page.wait_for_navigation().await?;
        let main_target = page.target_id().clone();

        Ok(Self {
            browser,
            handler,
            page,
            main_target,
            popup_timeout: crawl.popup_timeout(),
            popup_settle: crawl.popup_settle,
            tab_settle: crawl.tab_settle,
        })
    }

    /// Full-page screenshot of the main page.
    pub async fn save_screenshot(&self, path: &Path) -> Result<(), PortalError> {
        let params = ScreenshotParams::builder().full_page(true).build();
        self.page.save_screenshot(params, path).await?;
        info!("Screenshot saved to {}", path.display());
        Ok(())
    }

    /// Close the browser and stop the event handler.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("browser close: {}", e);
        }
        self.handler.abort();
    }

    async fn eval_bool(&self, js: &str) -> Result<bool, PortalError> {
        self.page
            .evaluate(js)
            .await?
            .into_value::<bool>()
            .map_err(|e| PortalError::Script(e.to_string()))
    }

    async fn table_row_count(&self) -> Result<u64, PortalError> {
        self.page
            .evaluate("document.querySelectorAll('table tbody tr').length")
            .await?
            .into_value::<u64>()
            .map_err(|e| PortalError::Script(e.to_string()))
    }

    /// A tab switch empties the table before new rows stream in. Watch the
    /// drain (up to 5s), then the refill (up to 10s). Discovery retries cover
    /// the case where the refill never comes.
    async fn await_table_reload(&self) -> Result<(), PortalError> {
        for _ in 0..10 {
            if self.table_row_count().await? == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        for _ in 0..20 {
            if self.table_row_count().await? > 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        debug!("table still empty after reload wait");
        Ok(())
    }

    async fn await_secondary_target(&self) -> Result<Page, PortalError> {
        loop {
            for page in self.browser.pages().await? {
                if page.target_id() != &self.main_target {
                    return Ok(page);
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Best-effort sweep of every window except the main page. A malformed
    /// trigger may have opened a window under an unexpected handle, so the
    /// sweep is broader than the one popup we asked for.
    async fn close_secondary_windows(&self) {
        let pages = match self.browser.pages().await {
            Ok(pages) => pages,
            Err(e) => {
                warn!("could not enumerate windows for cleanup: {}", e);
                return;
            }
        };
        for page in pages {
            if page.target_id() != &self.main_target {
                if let Err(e) = page.close().await {
                    debug!("secondary window close: {}", e);
                }
            }
        }
    }

    async fn popup_snapshot(&self, year: &str, region: &Region) -> Result<String, PortalError> {
        let trigger = extract::region_trigger_call(year, region);
        self.page.evaluate(trigger.as_str()).await?;

        let page = tokio::time::timeout(self.popup_timeout, self.await_secondary_target())
            .await
            .map_err(|_| PortalError::PopupTimeout { timeout: self.popup_timeout })??;

        let mut popup = PopupSession::new(page);
        let html = popup.snapshot(self.popup_settle).await;
        popup.close().await;
        html
    }
}

#[async_trait]
impl SubsidyPortal for PortalBrowser {
    async fn select_year(&self, year: &str) -> Result<(), PortalError> {
        let js = format!(
            "(() => {{ const el = document.querySelector('select#year1'); \
             if (!el) return false; el.value = '{}'; \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()",
            year.replace('\'', "\\'")
        );
        if !self.eval_bool(&js).await? {
            return Err(PortalError::YearSelectMissing);
        }
        tokio::time::sleep(self.tab_settle.sample()).await;
        Ok(())
    }

    async fn select_category(&self, tab_label: &str) -> Result<(), PortalError> {
        let js = format!(
            "(() => {{ const links = Array.from(document.querySelectorAll('a')); \
             const tab = links.find(a => a.textContent.trim() === '{}'); \
             if (!tab) return false; tab.click(); return true; }})()",
            tab_label.replace('\'', "\\'")
        );
        if !self.eval_bool(&js).await? {
            return Err(PortalError::TabNotFound(tab_label.to_string()));
        }
        self.await_table_reload().await?;
        tokio::time::sleep(self.tab_settle.sample()).await;
        Ok(())
    }

    async fn page_html(&self) -> Result<String, PortalError> {
        Ok(self.page.content().await?)
    }

    async fn region_popup_html(
        &self,
        year: &str,
        region: &Region,
    ) -> Result<String, PortalError> {
        match self.popup_snapshot(year, region).await {
            Ok(html) => Ok(html),
            Err(e) => {
                self.close_secondary_windows().await;
                Err(e)
            }
        }
    }
}

// ── PopupSession ──────────────────────────────────────────────────────────────

/// Scoped ownership of one popup window. At most one is alive at a time;
/// `close` is idempotent and must run on every exit path.
struct PopupSession {
    page: Option<Page>,
}

impl PopupSession {
    fn new(page: Page) -> Self {
        Self { page: Some(page) }
    }

    /// Wait for the popup to finish loading, let it settle, and snapshot it.
    async fn snapshot(&self, settle: DelayRange) -> Result<String, PortalError> {
        let Some(page) = &self.page else {
            return Err(PortalError::Script("popup already closed".to_string()));
        };
        page.wait_for_navigation().await?;
        tokio::time::sleep(settle.sample()).await;
        Ok(page.content().await?)
    }

    async fn close(&mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("popup close: {}", e);
            }
        }
    }
}

use anyhow::Result;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::CategoryConfig;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub portal: PortalConfig,
    pub crawl: CrawlConfig,
    pub output: OutputConfig,
}

/// Remote portal endpoints and navigation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortalConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-region model-price page (popup variant).
    #[serde(default = "default_price_page_path")]
    pub price_page_path: String,

    /// Payment-status page (main-table variant).
    #[serde(default = "default_status_page_path")]
    pub status_page_path: String,

    /// Model year selected in the page's year dropdown.
    #[serde(default = "default_year")]
    pub year: String,

    #[serde(default = "default_nav_timeout_secs")]
    pub nav_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl PortalConfig {
    pub fn price_page_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.price_page_path)
    }

    pub fn status_page_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.status_page_path)
    }
}

/// Crawl bounds, filters and politeness delays
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlConfig {
    /// Vehicle-category tabs to process, in order.
    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryConfig>,

    /// Accepted manufacturer name variants; popup rows matching none are dropped.
    #[serde(default = "default_manufacturer_variants")]
    pub manufacturer_variants: Vec<String>,

    #[serde(default = "default_discovery_max_attempts")]
    pub discovery_max_attempts: usize,

    #[serde(default = "default_discovery_backoff_ms")]
    pub discovery_backoff_ms: u64,

    #[serde(default = "default_popup_timeout_secs")]
    pub popup_timeout_secs: u64,

    /// Settle delay after a tab or year switch.
    #[serde(default = "default_tab_settle")]
    pub tab_settle: DelayRange,

    /// Settle delay after a popup window materializes.
    #[serde(default = "default_popup_settle")]
    pub popup_settle: DelayRange,

    /// Pause between consecutive region visits.
    #[serde(default = "default_region_delay")]
    pub region_delay: DelayRange,
}

impl CrawlConfig {
    pub fn popup_timeout(&self) -> Duration {
        Duration::from_secs(self.popup_timeout_secs)
    }
}

/// Inclusive jitter window in milliseconds.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn sample(&self) -> Duration {
        let hi = self.max_ms.max(self.min_ms);
        let ms = rand::rng().random_range(self.min_ms..=hi);
        Duration::from_millis(ms)
    }
}

/// Snapshot and report locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,

    #[serde(default = "default_prices_csv")]
    pub prices_csv: String,

    #[serde(default = "default_status_csv")]
    pub status_csv: String,

    #[serde(default = "default_screenshot")]
    pub screenshot: String,

    #[serde(default = "default_run_log")]
    pub run_log: String,

    /// Attribution line written above the schedule CSV header.
    #[serde(default = "default_source_note")]
    pub source_note: String,
}

impl OutputConfig {
    pub fn prices_path(&self) -> PathBuf {
        self.data_dir.join(&self.prices_csv)
    }

    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join(&self.status_csv)
    }

    pub fn screenshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.screenshot)
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.run_log)
    }
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://ev.or.kr".to_string()
}
fn default_price_page_path() -> String {
    "/nportal/buySupprt/initPsLocalCarPirceAction.do".to_string()
}
fn default_status_page_path() -> String {
    "/nportal/buySupprt/initSubsidyPaymentCheckAction.do".to_string()
}
fn default_year() -> String {
    "2026".to_string()
}
fn default_nav_timeout_secs() -> u64 {
    60
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; EVCrawler/1.0)".to_string()
}
fn default_categories() -> Vec<CategoryConfig> {
    vec![
        CategoryConfig::new("전기승용", "전기승용"),
        CategoryConfig::new("전기화물", "전기화물"),
    ]
}
fn default_manufacturer_variants() -> Vec<String> {
    vec!["케이지모빌리티".to_string(), "KG모빌리티".to_string()]
}
fn default_discovery_max_attempts() -> usize {
    3
}
fn default_discovery_backoff_ms() -> u64 {
    5_000
}
fn default_popup_timeout_secs() -> u64 {
    15
}
fn default_tab_settle() -> DelayRange {
    DelayRange::new(1_500, 2_500)
}
fn default_popup_settle() -> DelayRange {
    DelayRange::new(800, 1_500)
}
fn default_region_delay() -> DelayRange {
    DelayRange::new(200, 500)
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}
fn default_prices_csv() -> String {
    "kg_mobility_subsidy.csv".to_string()
}
fn default_status_csv() -> String {
    "ev_subsidy_data.csv".to_string()
}
fn default_screenshot() -> String {
    "ev_page.png".to_string()
}
fn default_run_log() -> String {
    "crawl_run.json".to_string()
}
fn default_source_note() -> String {
    "데이터 출처: 환경부 무공해차 통합누리집(ev.or.kr)".to_string()
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("EVSUB").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize().unwrap_or_else(|_| AppConfig::default());
        Ok(app_cfg)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            portal: PortalConfig {
                base_url: default_base_url(),
                price_page_path: default_price_page_path(),
                status_page_path: default_status_page_path(),
                year: default_year(),
                nav_timeout_secs: default_nav_timeout_secs(),
                user_agent: default_user_agent(),
            },
            crawl: CrawlConfig {
                categories: default_categories(),
                manufacturer_variants: default_manufacturer_variants(),
                discovery_max_attempts: default_discovery_max_attempts(),
                discovery_backoff_ms: default_discovery_backoff_ms(),
                popup_timeout_secs: default_popup_timeout_secs(),
                tab_settle: default_tab_settle(),
                popup_settle: default_popup_settle(),
                region_delay: default_region_delay(),
            },
            output: OutputConfig {
                data_dir: default_data_dir(),
                reports_dir: default_reports_dir(),
                prices_csv: default_prices_csv(),
                status_csv: default_status_csv(),
                screenshot: default_screenshot(),
                run_log: default_run_log(),
                source_note: default_source_note(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_crawl_bounds() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.crawl.discovery_max_attempts, 3);
        assert_eq!(cfg.crawl.discovery_backoff_ms, 5_000);
        assert_eq!(cfg.crawl.popup_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.crawl.categories.len(), 2);
    }

    #[test]
    fn delay_range_sample_stays_in_window() {
        let range = DelayRange::new(200, 500);
        for _ in 0..50 {
            let d = range.sample();
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(500));
        }
    }

    #[test]
    fn page_urls_join_without_double_slash() {
        let cfg = AppConfig::default();
        assert_eq!(
            cfg.portal.price_page_url(),
            "https://ev.or.kr/nportal/buySupprt/initPsLocalCarPirceAction.do"
        );
        assert!(!cfg.portal.status_page_url().contains("kr//"));
    }
}

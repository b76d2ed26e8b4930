//! Crawl orchestrator: drives category tabs, region discovery and the
//! per-region popup loop, and owns the run accumulator.
//!
//! Regions are processed strictly in discovery order, one popup at a time:
//! the portal's trigger mechanism shares script-level global state across
//! windows, so overlapping popups would cross-talk. One region's failure is
//! logged and skipped; exhausting region discovery is fatal for the run.

use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tracing::{info, warn};

use crate::config::CrawlConfig;
use crate::extract;
use crate::models::{CategoryConfig, CrawlRun, Region, ScheduleRow, SubsidyRecord};
use crate::portal::{PortalError, SubsidyPortal};

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("no regions discovered after {attempts} attempts")]
    RegionDiscoveryExhausted { attempts: usize },

    #[error(transparent)]
    Portal(#[from] PortalError),

    #[error(transparent)]
    Extract(#[from] anyhow::Error),
}

pub struct Crawler<P: SubsidyPortal> {
    portal: P,
    crawl: CrawlConfig,
}

impl<P: SubsidyPortal> Crawler<P> {
    pub fn new(portal: P, crawl: CrawlConfig) -> Self {
        Self { portal, crawl }
    }

    /// Hand the portal back, e.g. for shutdown after the run.
    pub fn into_portal(self) -> P {
        self.portal
    }

    // ── Popup variant (per-manufacturer model prices) ─────────────────────────

    /// Crawl every category in the given order, every region in discovery
    /// order within a category. Returns the finished run; fails only on
    /// exhausted region discovery or a broken tab/year interaction.
    pub async fn run(
        &self,
        year: &str,
        categories: &[CategoryConfig],
    ) -> Result<CrawlRun, CrawlError> {
        let mut run = CrawlRun::new(year);
        self.portal.select_year(year).await?;

        for category in categories {
            self.crawl_category(&mut run, year, category).await?;
        }

        run.finish();
        Ok(run)
    }

    async fn crawl_category(
        &self,
        run: &mut CrawlRun,
        year: &str,
        category: &CategoryConfig,
    ) -> Result<(), CrawlError> {
        info!("[{}] selecting category tab", category.name);
        self.portal.select_category(&category.tab_label).await?;

        let regions = self.discover_regions().await?;
        info!("[{}] {} regions discovered", category.name, regions.len());

        for (i, region) in regions.iter().enumerate() {
            info!(
                "[{}] [{}/{}] {} {}",
                category.name,
                i + 1,
                regions.len(),
                region.province,
                region.district
            );

            match self.crawl_region(year, category, region).await {
                Ok(mut records) => {
                    let dropped = retain_active_category(&mut records, &category.name);
                    if dropped > 0 {
                        warn!(
                            "[{}] {} {}: dropped {} records from a stale category",
                            category.name, region.province, region.district, dropped
                        );
                    }
                    info!("    {} records", records.len());
                    run.record_success(&category.name, region, records);
                }
                Err(e @ CrawlError::Portal(PortalError::PopupTimeout { .. })) => {
                    warn!(
                        "[{}] {} {}: {} (skipping region)",
                        category.name, region.province, region.district, e
                    );
                    run.record_skipped(&category.name, region, e.to_string());
                }
                Err(e) => {
                    warn!(
                        "[{}] {} {}: {}",
                        category.name, region.province, region.district, e
                    );
                    run.record_failed(&category.name, region, e.to_string());
                }
            }

            let pause = self.crawl.region_delay.sample();
            tokio::time::sleep(pause).await;
        }

        Ok(())
    }

    /// Region discovery with bounded retry. A partially loaded page can show
    /// a populated table with zero actionable rows, so both a failed snapshot
    /// and an empty scan count as a miss. Exhaustion is fatal, never an
    /// empty list.
    async fn discover_regions(&self) -> Result<Vec<Region>, CrawlError> {
        let attempts = self.crawl.discovery_max_attempts.max(1);
        let strategy = FixedInterval::from_millis(self.crawl.discovery_backoff_ms).take(attempts - 1);

        Retry::spawn(strategy, || self.discovery_attempt())
            .await
            .map_err(|_| CrawlError::RegionDiscoveryExhausted { attempts })
    }

    async fn discovery_attempt(&self) -> Result<Vec<Region>, ()> {
        match self.portal.page_html().await {
            Ok(html) => match extract::discover_regions(&html) {
                Ok(regions) if !regions.is_empty() => Ok(regions),
                Ok(_) => {
                    warn!("region table has no actionable rows yet");
                    Err(())
                }
                Err(e) => {
                    warn!("region scan failed: {:#}", e);
                    Err(())
                }
            },
            Err(e) => {
                warn!("region table snapshot failed: {}", e);
                Err(())
            }
        }
    }

    async fn crawl_region(
        &self,
        year: &str,
        category: &CategoryConfig,
        region: &Region,
    ) -> Result<Vec<SubsidyRecord>, CrawlError> {
        let html = self.portal.region_popup_html(year, region).await?;
        let records =
            extract::popup_records(&html, region, &category.name, &self.crawl.manufacturer_variants)?;
        Ok(records)
    }

    // ── Main-table variant (application-status schedule) ──────────────────────

    /// Crawl the status page's main table for every category, in order.
    pub async fn run_schedule(
        &self,
        categories: &[CategoryConfig],
    ) -> Result<Vec<ScheduleRow>, CrawlError> {
        let mut rows = Vec::new();

        for category in categories {
            info!("[{}] selecting category tab", category.name);
            self.portal.select_category(&category.tab_label).await?;

            let html = self.portal.page_html().await?;
            let mut category_rows = extract::schedule_rows(&html)?;
            info!("[{}] {} schedule rows", category.name, category_rows.len());
            rows.append(&mut category_rows);
        }

        Ok(rows)
    }
}

/// Stale-popup defence: a popup that answers after a tab switch carries rows
/// for the previous category; only records matching the active tab survive.
fn retain_active_category(records: &mut Vec<SubsidyRecord>, category: &str) -> usize {
    let before = records.len();
    records.retain(|r| r.vehicle_category == category);
    before - records.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DelayRange;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_config() -> CrawlConfig {
        CrawlConfig {
            categories: vec![CategoryConfig::new("전기승용", "전기승용")],
            manufacturer_variants: vec!["KG모빌리티".to_string()],
            discovery_max_attempts: 3,
            discovery_backoff_ms: 1,
            popup_timeout_secs: 1,
            tab_settle: DelayRange::new(0, 0),
            popup_settle: DelayRange::new(0, 0),
            region_delay: DelayRange::new(0, 0),
        }
    }

    fn region_table(regions: &[(&str, &str, &str)]) -> String {
        let rows: String = regions
            .iter()
            .map(|(code, province, district)| {
                format!(
                    "<tr><td>{}</td><td>{}</td><td><a onclick=\"psPopupLocalCarModelPrice('2026','{}','{}')\">조회</a></td></tr>",
                    province, district, code, district
                )
            })
            .collect();
        format!("<table><tbody>{}</tbody></table>", rows)
    }

    fn popup_table(model: &str) -> String {
        format!(
            "<table><tbody><tr><td>승용</td><td>KG모빌리티</td><td>{}</td>\
             <td>1,000</td><td>500</td><td>1,500</td></tr></tbody></table>",
            model
        )
    }

    /// In-memory portal: queued page snapshots, per-region popup bodies, and
    /// a set of region codes whose popups never materialize.
    struct FakePortal {
        snapshots: Mutex<VecDeque<String>>,
        popups: HashMap<String, String>,
        timeout_codes: HashSet<String>,
        page_html_calls: AtomicUsize,
        tabs_selected: Mutex<Vec<String>>,
    }

    impl FakePortal {
        fn new(snapshots: Vec<String>) -> Self {
            Self {
                snapshots: Mutex::new(snapshots.into()),
                popups: HashMap::new(),
                timeout_codes: HashSet::new(),
                page_html_calls: AtomicUsize::new(0),
                tabs_selected: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SubsidyPortal for FakePortal {
        async fn select_year(&self, _year: &str) -> Result<(), PortalError> {
            Ok(())
        }

        async fn select_category(&self, tab_label: &str) -> Result<(), PortalError> {
            self.tabs_selected.lock().unwrap().push(tab_label.to_string());
            Ok(())
        }

        async fn page_html(&self) -> Result<String, PortalError> {
            self.page_html_calls.fetch_add(1, Ordering::SeqCst);
            let mut snapshots = self.snapshots.lock().unwrap();
            let html = if snapshots.len() > 1 {
                snapshots.pop_front()
            } else {
                snapshots.front().cloned()
            };
            Ok(html.unwrap_or_else(|| "<html></html>".to_string()))
        }

        async fn region_popup_html(
            &self,
            _year: &str,
            region: &Region,
        ) -> Result<String, PortalError> {
            if self.timeout_codes.contains(&region.code) {
                return Err(PortalError::PopupTimeout { timeout: Duration::from_secs(15) });
            }
            Ok(self.popups.get(&region.code).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn discovery_exhausts_after_bounded_attempts() {
        let portal = FakePortal::new(vec!["<table><tbody></tbody></table>".to_string()]);
        let crawler = Crawler::new(portal, test_config());

        let categories = vec![CategoryConfig::new("전기승용", "전기승용")];
        let result = crawler.run("2026", &categories).await;

        assert!(matches!(
            result,
            Err(CrawlError::RegionDiscoveryExhausted { attempts: 3 })
        ));
        assert_eq!(crawler.portal.page_html_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn discovery_recovers_from_a_transient_empty_table() {
        let empty = "<table><tbody></tbody></table>".to_string();
        let populated = region_table(&[("1100", "서울", "서울특별시")]);
        let mut portal = FakePortal::new(vec![empty, populated]);
        portal.popups.insert("1100".to_string(), popup_table("모델A"));
        let crawler = Crawler::new(portal, test_config());

        let categories = vec![CategoryConfig::new("전기승용", "전기승용")];
        let run = crawler.run("2026", &categories).await.unwrap();

        assert_eq!(run.records.len(), 1);
        assert_eq!(crawler.portal.page_html_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn popup_timeout_skips_region_but_not_the_category() {
        let table = region_table(&[
            ("1100", "서울", "서울특별시"),
            ("4111", "경기", "수원시"),
        ]);
        let mut portal = FakePortal::new(vec![table]);
        portal.timeout_codes.insert("1100".to_string());
        portal.popups.insert("4111".to_string(), popup_table("모델A"));
        let crawler = Crawler::new(portal, test_config());

        let categories = vec![CategoryConfig::new("전기승용", "전기승용")];
        let run = crawler.run("2026", &categories).await.unwrap();

        assert_eq!(run.records.len(), 1);
        assert_eq!(run.records[0].district, "수원시");
        assert_eq!(run.success_count(), 1);
        assert_eq!(run.failure_count(), 1);

        // the timed-out region is in the log, with its identity
        let skipped = &run.outcomes[0];
        assert_eq!(skipped.region.code, "1100");
        assert_eq!(skipped.region.province, "서울");
        assert!(matches!(
            skipped.status,
            crate::models::OutcomeStatus::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn categories_and_regions_stay_in_given_order() {
        let table = region_table(&[
            ("1100", "서울", "서울특별시"),
            ("4111", "경기", "수원시"),
        ]);
        let mut portal = FakePortal::new(vec![table]);
        portal.popups.insert("1100".to_string(), popup_table("모델A"));
        portal.popups.insert("4111".to_string(), popup_table("모델B"));
        let crawler = Crawler::new(portal, test_config());

        let categories = vec![
            CategoryConfig::new("전기승용", "전기승용"),
            CategoryConfig::new("전기화물", "전기화물"),
        ];
        let run = crawler.run("2026", &categories).await.unwrap();

        let order: Vec<(String, String)> = run
            .outcomes
            .iter()
            .map(|o| (o.category.clone(), o.region.code.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("전기승용".to_string(), "1100".to_string()),
                ("전기승용".to_string(), "4111".to_string()),
                ("전기화물".to_string(), "1100".to_string()),
                ("전기화물".to_string(), "4111".to_string()),
            ]
        );
        assert_eq!(
            crawler.portal.tabs_selected.lock().unwrap().as_slice(),
            ["전기승용", "전기화물"]
        );
    }

    #[tokio::test]
    async fn schedule_variant_walks_every_tab() {
        let html = r#"<table><tbody><tr><td>layout</td></tr></tbody></table>
            <table><tbody><tr>
                <td>서울</td><td>서울특별시</td><td>전기승용</td><td>공고.pdf</td><td>온라인</td>
                <td>100 (20) (0) (0) (80)</td><td>80</td><td>50</td><td>30</td><td></td>
            </tr></tbody></table>"#;
        let portal = FakePortal::new(vec![html.to_string()]);
        let crawler = Crawler::new(portal, test_config());

        let categories = vec![
            CategoryConfig::new("전기승용", "전기승용"),
            CategoryConfig::new("전기화물", "전기화물"),
        ];
        let rows = crawler.run_schedule(&categories).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].announced.general, "80");
        assert_eq!(
            crawler.portal.tabs_selected.lock().unwrap().len(),
            2
        );
    }

    #[test]
    fn stale_category_records_are_dropped() {
        let keep = SubsidyRecord {
            province: "서울".into(),
            district: "서울특별시".into(),
            vehicle_category: "전기승용".into(),
            manufacturer: "KG모빌리티".into(),
            model: "모델A".into(),
            national_subsidy: 1000,
            local_subsidy: 500,
            total_subsidy: 1500,
        };
        let mut stale = keep.clone();
        stale.vehicle_category = "전기화물".into();

        let mut records = vec![keep.clone(), stale];
        let dropped = retain_active_category(&mut records, "전기승용");

        assert_eq!(dropped, 1);
        assert_eq!(records, vec![keep]);
    }
}

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Region ────────────────────────────────────────────────────────────────────

/// One addressable administrative region on the portal. `code` is the opaque
/// identifier the page's popup hook expects; immutable once discovered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Region {
    pub code: String,
    pub province: String, // 시도, e.g. 경기
    pub district: String, // 지역구분, e.g. 수원시
}

// ── Subsidy record (per-manufacturer popup variant) ───────────────────────────

/// One model's subsidy amounts for one region, in the portal's native unit
/// (ten-thousand won), thousands separators already stripped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubsidyRecord {
    pub province: String,
    pub district: String,
    pub vehicle_category: String,
    pub manufacturer: String,
    pub model: String,
    pub national_subsidy: u32,
    pub local_subsidy: u32,
    pub total_subsidy: u32,
}

// ── Schedule row (main-table variant, 26 columns) ─────────────────────────────

/// The five sub-counts packed into one compound cell:
/// `"<total> (<priority>) (<corporate>) (<taxi>) (<general>)"`.
/// An empty string means "not reported", distinct from zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountBreakdown {
    pub total: String,
    pub priority: String,
    pub corporate: String,
    pub taxi: String,
    pub general: String,
}

impl CountBreakdown {
    pub fn from_fields(fields: [String; 5]) -> Self {
        let [total, priority, corporate, taxi, general] = fields;
        Self { total, priority, corporate, taxi, general }
    }

    pub fn as_fields(&self) -> [&str; 5] {
        [&self.total, &self.priority, &self.corporate, &self.taxi, &self.general]
    }
}

/// One region's application-status row: five text columns, four count
/// breakdowns (announced / received / delivered / remaining), remarks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleRow {
    pub province: String,
    pub district: String,
    pub vehicle_category: String,
    pub notice_file: String,
    pub intake_method: String,
    pub announced: CountBreakdown,
    pub received: CountBreakdown,
    pub delivered: CountBreakdown,
    pub remaining: CountBreakdown,
    pub remarks: String,
}

// ── Vehicle category ──────────────────────────────────────────────────────────

/// A crawlable vehicle class: the category name stamped into records and the
/// visible text of the tab that activates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryConfig {
    pub name: String,
    pub tab_label: String,
}

impl CategoryConfig {
    pub fn new(name: &str, tab_label: &str) -> Self {
        Self { name: name.to_string(), tab_label: tab_label.to_string() }
    }
}

// ── Crawl run ─────────────────────────────────────────────────────────────────

/// Accumulator for one crawl invocation: all extracted records plus a
/// per-region outcome log. Owned exclusively by the orchestrator while the
/// run is in flight; immutable once finished.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlRun {
    pub year: String,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub records: Vec<SubsidyRecord>,
    pub outcomes: Vec<RegionOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionOutcome {
    pub category: String,
    pub region: Region,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success { records: usize },
    Skipped { reason: String },
    Failed { reason: String },
}

impl CrawlRun {
    pub fn new(year: &str) -> Self {
        Self {
            year: year.to_string(),
            started_at: Utc::now().naive_utc(),
            finished_at: None,
            records: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn record_success(&mut self, category: &str, region: &Region, records: Vec<SubsidyRecord>) {
        self.outcomes.push(RegionOutcome {
            category: category.to_string(),
            region: region.clone(),
            status: OutcomeStatus::Success { records: records.len() },
        });
        self.records.extend(records);
    }

    pub fn record_skipped(&mut self, category: &str, region: &Region, reason: String) {
        self.outcomes.push(RegionOutcome {
            category: category.to_string(),
            region: region.clone(),
            status: OutcomeStatus::Skipped { reason },
        });
    }

    pub fn record_failed(&mut self, category: &str, region: &Region, reason: String) {
        self.outcomes.push(RegionOutcome {
            category: category.to_string(),
            region: region.clone(),
            status: OutcomeStatus::Failed { reason },
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now().naive_utc());
    }

    pub fn success_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Success { .. }))
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region { code: "1100".into(), province: "서울".into(), district: "서울특별시".into() }
    }

    #[test]
    fn run_counts_outcomes_by_kind() {
        let mut run = CrawlRun::new("2026");
        run.record_success("전기승용", &region(), vec![]);
        run.record_skipped("전기승용", &region(), "popup timeout".into());
        run.record_failed("전기화물", &region(), "stale table".into());

        assert_eq!(run.success_count(), 1);
        assert_eq!(run.failure_count(), 2);
        assert!(run.records.is_empty());
    }

    #[test]
    fn finish_stamps_the_run() {
        let mut run = CrawlRun::new("2026");
        assert!(run.finished_at.is_none());
        run.finish();
        assert!(run.finished_at.is_some());
    }
}

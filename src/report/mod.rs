//! Snapshot output and the change report. Snapshots are CSV with a UTF-8
//! byte-order mark so spreadsheet tools pick the encoding up; the schedule
//! snapshot carries the data-source attribution as a `#` comment line above
//! the header. The previous snapshot is kept beside the current one so the
//! report can diff the two.

use anyhow::{Context, Result};
use chrono::Local;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::models::{CrawlRun, ScheduleRow, SubsidyRecord};
use crate::utils::fmt_number;

pub const PRICE_HEADERS: [&str; 8] = [
    "시도",
    "지역구분",
    "세부차종",
    "제조사",
    "모델명",
    "국비(만원)",
    "지방비(만원)",
    "보조금(만원)",
];

const SCHEDULE_GROUPS: [&str; 4] = ["민간공고대수", "접수대수", "출고대수", "출고잔여대수"];
const BREAKDOWN_SUFFIXES: [&str; 5] = ["전체", "우선순위", "법인기관", "택시", "일반"];

fn schedule_headers() -> Vec<String> {
    let mut headers: Vec<String> = ["시도", "지역구분", "차종구분", "공고파일", "접수방법"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for group in SCHEDULE_GROUPS {
        for suffix in BREAKDOWN_SUFFIXES {
            headers.push(format!("{}_{}", group, suffix));
        }
    }
    headers.push("비고".to_string());
    headers
}

// ── Snapshot writers ──────────────────────────────────────────────────────────

fn snapshot_writer(path: &Path) -> Result<csv::Writer<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("could not create dir {:?}", parent))?;
    }
    let mut file =
        File::create(path).with_context(|| format!("could not create {:?}", path))?;
    // UTF-8 BOM for spreadsheet compatibility
    file.write_all("\u{feff}".as_bytes())?;
    Ok(csv::WriterBuilder::new().flexible(true).from_writer(file))
}

pub fn write_price_snapshot(path: &Path, records: &[SubsidyRecord]) -> Result<()> {
    let mut wtr = snapshot_writer(path)?;
    wtr.write_record(PRICE_HEADERS)?;
    for r in records {
        let national = r.national_subsidy.to_string();
        let local = r.local_subsidy.to_string();
        let total = r.total_subsidy.to_string();
        wtr.write_record([
            r.province.as_str(),
            r.district.as_str(),
            r.vehicle_category.as_str(),
            r.manufacturer.as_str(),
            r.model.as_str(),
            national.as_str(),
            local.as_str(),
            total.as_str(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

fn schedule_fields(row: &ScheduleRow) -> Vec<String> {
    let mut fields = vec![
        row.province.clone(),
        row.district.clone(),
        row.vehicle_category.clone(),
        row.notice_file.clone(),
        row.intake_method.clone(),
    ];
    for breakdown in [&row.announced, &row.received, &row.delivered, &row.remaining] {
        fields.extend(breakdown.as_fields().iter().map(|s| s.to_string()));
    }
    fields.push(row.remarks.clone());
    fields
}

pub fn write_schedule_snapshot(
    path: &Path,
    rows: &[ScheduleRow],
    source_note: &str,
) -> Result<()> {
    let mut wtr = snapshot_writer(path)?;
    wtr.write_record([format!("# {}", source_note)])?;
    wtr.write_record(schedule_headers())?;
    for row in rows {
        wtr.write_record(schedule_fields(row))?;
    }
    wtr.flush()?;
    Ok(())
}

// ── Snapshot rotation and reload ──────────────────────────────────────────────

pub fn previous_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("snapshot");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("csv");
    path.with_file_name(format!("{}_prev.{}", stem, ext))
}

/// Keep the outgoing snapshot as `*_prev.csv` so the next report can diff
/// against it. No-op when there is nothing to rotate yet.
pub fn rotate_snapshot(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let prev = previous_path(path);
    fs::copy(path, &prev)
        .with_context(|| format!("could not rotate {:?} to {:?}", path, prev))?;
    Ok(Some(prev))
}

type Row = BTreeMap<String, String>;

/// Reload a snapshot as header-keyed rows, tolerating the BOM and `#`
/// comment lines. A missing file is an empty data set, not an error.
pub fn load_snapshot(path: &Path) -> Result<Vec<Row>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("could not read {:?}", path))?;
    let body: String = raw
        .trim_start_matches('\u{feff}')
        .lines()
        .filter(|line| !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body.as_bytes());
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!("row {} in {:?}: {}", i + 1, path, e);
                continue;
            }
        };
        let row: Row = headers
            .iter()
            .cloned()
            .zip(record.iter().map(str::to_string))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

pub fn write_run_log(path: &Path, run: &CrawlRun) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path).with_context(|| format!("could not create {:?}", path))?;
    serde_json::to_writer_pretty(file, run).context("could not serialize run log")?;
    Ok(())
}

// ── Change detection ──────────────────────────────────────────────────────────

/// Count fields watched for changes between snapshots.
const CHANGE_FIELDS: [&str; 2] = ["민간공고대수_일반", "출고잔여대수_전체"];

/// Reports cap the change table at the largest movements.
const MAX_CHANGES: usize = 20;

fn field<'a>(row: &'a Row, key: &str) -> &'a str {
    row.get(key).map(String::as_str).unwrap_or("")
}

/// Integer value of a count field; empty or malformed text counts as zero
/// for aggregation purposes.
fn int_field(row: &Row, key: &str) -> i64 {
    let v = field(row, key).trim().replace(',', "");
    if v.is_empty() { 0 } else { v.parse().unwrap_or(0) }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ScheduleSummary {
    regions: usize,
    announced_general: i64,
    remaining_total: i64,
}

fn summarize_schedule(rows: &[Row]) -> BTreeMap<(String, String), ScheduleSummary> {
    let mut summary: BTreeMap<(String, String), ScheduleSummary> = BTreeMap::new();
    for row in rows {
        let key = (field(row, "시도").to_string(), field(row, "차종구분").to_string());
        let entry = summary.entry(key).or_default();
        entry.regions += 1;
        entry.announced_general += int_field(row, "민간공고대수_일반");
        entry.remaining_total += int_field(row, "출고잔여대수_전체");
    }
    summary
}

#[derive(Debug, PartialEq, Eq)]
struct CountChange {
    province: String,
    district: String,
    category: String,
    field: String,
    previous: i64,
    current: i64,
    delta: i64,
}

fn schedule_key(row: &Row) -> (String, String, String) {
    (
        field(row, "시도").to_string(),
        field(row, "지역구분").to_string(),
        field(row, "차종구분").to_string(),
    )
}

fn detect_count_changes(current: &[Row], previous: &[Row]) -> Vec<CountChange> {
    let prev_map: BTreeMap<_, _> = previous.iter().map(|r| (schedule_key(r), r)).collect();

    let mut changes = Vec::new();
    for row in current {
        let key = schedule_key(row);
        let Some(prev_row) = prev_map.get(&key) else { continue };
        for name in CHANGE_FIELDS {
            let prev_val = int_field(prev_row, name);
            let cur_val = int_field(row, name);
            if cur_val != prev_val {
                changes.push(CountChange {
                    province: key.0.clone(),
                    district: key.1.clone(),
                    category: key.2.clone(),
                    field: name.to_string(),
                    previous: prev_val,
                    current: cur_val,
                    delta: cur_val - prev_val,
                });
            }
        }
    }
    changes.sort_by_key(|c| std::cmp::Reverse(c.delta.abs()));
    changes
}

fn regions_by_province(rows: &[Row]) -> BTreeMap<String, BTreeSet<String>> {
    let mut regions: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for row in rows {
        let province = field(row, "시도");
        let district = field(row, "지역구분");
        if !province.is_empty() && !district.is_empty() {
            regions.entry(province.to_string()).or_default().insert(district.to_string());
        }
    }
    regions
}

fn new_regions(current: &[Row], previous: &[Row]) -> BTreeMap<String, Vec<String>> {
    let cur = regions_by_province(current);
    let prev = regions_by_province(previous);

    let mut added = BTreeMap::new();
    for (province, districts) in cur {
        let known = prev.get(&province);
        let fresh: Vec<String> = districts
            .into_iter()
            .filter(|d| known.map_or(true, |k| !k.contains(d)))
            .collect();
        if !fresh.is_empty() {
            added.insert(province, fresh);
        }
    }
    added
}

// ── Markdown rendering ────────────────────────────────────────────────────────

fn schedule_section(lines: &mut Vec<String>, current: &[Row], previous: &[Row]) {
    lines.push("## 보조금 지급현황 요약".to_string());
    lines.push(String::new());

    if current.is_empty() {
        lines.push("데이터가 없습니다.".to_string());
        lines.push(String::new());
        return;
    }

    lines.push("### 시도/차종별 현황".to_string());
    lines.push("| 시도 | 차종 | 지역수 | 민간공고대수_일반 합계 | 출고잔여대수_전체 합계 |".to_string());
    lines.push("|------|------|--------|------------------------|------------------------|".to_string());
    for ((province, category), stats) in summarize_schedule(current) {
        lines.push(format!(
            "| {} | {} | {} | {} | {} |",
            province,
            category,
            stats.regions,
            fmt_number(stats.announced_general),
            fmt_number(stats.remaining_total)
        ));
    }
    lines.push(String::new());

    lines.push("### 유의미한 변화".to_string());
    if previous.is_empty() {
        lines.push("이전 데이터가 없어 비교할 수 없습니다.".to_string());
        lines.push(String::new());
        return;
    }

    let changes = detect_count_changes(current, previous);
    if changes.is_empty() {
        lines.push("변화 없음".to_string());
        lines.push(String::new());
        return;
    }

    lines.push("| 시도 | 지역 | 차종 | 항목 | 이전 | 현재 | 변화 |".to_string());
    lines.push("|------|------|------|------|------|------|------|".to_string());
    for change in changes.iter().take(MAX_CHANGES) {
        let direction = if change.delta > 0 {
            format!("+{}대 증가", change.delta)
        } else {
            format!("{}대 감소", change.delta)
        };
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} |",
            change.province,
            change.district,
            change.category,
            change.field,
            fmt_number(change.previous),
            fmt_number(change.current),
            direction
        ));
    }
    lines.push(String::new());
}

fn price_section(lines: &mut Vec<String>, current: &[Row], previous: &[Row]) {
    lines.push("## 모델별 보조금 현황".to_string());
    lines.push(String::new());

    if current.is_empty() {
        lines.push("데이터가 없습니다.".to_string());
        lines.push(String::new());
        return;
    }

    lines.push("### 시도별 지역 현황 (중복제거)".to_string());
    lines.push("| 시도 | 지역 수 | 지역구분 목록 |".to_string());
    lines.push("|------|---------|---------------|".to_string());
    for (province, districts) in regions_by_province(current) {
        let mut listed: Vec<&String> = districts.iter().take(10).collect();
        listed.sort();
        let mut district_list =
            listed.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ");
        if districts.len() > 10 {
            district_list.push_str(&format!(" 외 {}개", districts.len() - 10));
        }
        lines.push(format!("| {} | {} | {} |", province, districts.len(), district_list));
    }
    lines.push(String::new());
    lines.push(format!("**총 데이터 건수**: {}건", current.len()));
    lines.push(String::new());

    lines.push("### 새로 추가된 지역".to_string());
    if previous.is_empty() {
        lines.push("이전 데이터가 없어 비교할 수 없습니다.".to_string());
        lines.push(String::new());
        return;
    }

    let added = new_regions(current, previous);
    if added.is_empty() {
        lines.push("새로 추가된 지역 없음".to_string());
        lines.push(String::new());
        return;
    }

    lines.push("| 시도 | 추가 지역 수 | 추가된 지역구분 |".to_string());
    lines.push("|------|--------------|-----------------|".to_string());
    for (province, districts) in added {
        lines.push(format!("| {} | {} | {} |", province, districts.len(), districts.join(", ")));
    }
    lines.push(String::new());
}

/// Render the full change report against the rotated previous snapshots.
pub fn render_change_report(status_path: &Path, prices_path: &Path) -> Result<String> {
    let now = Local::now();

    let mut lines = Vec::new();
    lines.push("# EV 보조금 데이터 변화 보고서".to_string());
    lines.push(format!("**보고서 생성일시**: {}", now.format("%Y-%m-%d %H:%M:%S")));
    lines.push(String::new());
    lines.push("---".to_string());
    lines.push(String::new());

    schedule_section(
        &mut lines,
        &load_snapshot(status_path)?,
        &load_snapshot(&previous_path(status_path))?,
    );

    lines.push("---".to_string());
    lines.push(String::new());

    price_section(
        &mut lines,
        &load_snapshot(prices_path)?,
        &load_snapshot(&previous_path(prices_path))?,
    );

    Ok(lines.join("\n"))
}

pub fn save_report(reports_dir: &Path, content: &str) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .with_context(|| format!("could not create dir {:?}", reports_dir))?;
    let name = format!("report_{}.md", Local::now().format("%Y%m%d_%H%M%S"));
    let path = reports_dir.join(name);
    fs::write(&path, content).with_context(|| format!("could not write {:?}", path))?;
    Ok(path)
}

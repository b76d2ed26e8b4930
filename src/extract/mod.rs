//! HTML table extraction. Everything here operates on page snapshots
//! (strings), never on live browser handles, so the row semantics stay
//! unit-testable without a browser.

use anyhow::Result;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::models::{CountBreakdown, Region, ScheduleRow, SubsidyRecord};

/// Page-global function the portal binds to each region's action link.
pub const REGION_TRIGGER_HOOK: &str = "psPopupLocalCarModelPrice";

fn sel(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| anyhow::anyhow!("selector `{}`: {}", s, e))
}

/// Cell text with internal whitespace collapsed to single spaces.
fn cell_text(td: ElementRef<'_>) -> String {
    td.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn row_cells(tr: ElementRef<'_>, td_sel: &Selector) -> Vec<String> {
    tr.select(td_sel).map(cell_text).collect()
}

// ── Region trigger adapter ────────────────────────────────────────────────────

/// Pull the region code out of the trigger's embedded call expression, e.g.
/// `javascript:psPopupLocalCarModelPrice('2026','1100','서울특별시');`.
/// The code is the second quoted argument. All knowledge of the portal's
/// trigger markup lives here and in [`region_trigger_call`].
pub fn region_code_from_trigger(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.split('\'').collect();
    match parts.get(3) {
        Some(code) if !code.is_empty() => Some((*code).to_string()),
        _ => None,
    }
}

/// Build the call expression that opens a region's detail popup.
pub fn region_trigger_call(year: &str, region: &Region) -> String {
    format!(
        "{}('{}','{}','{}')",
        REGION_TRIGGER_HOOK,
        year,
        region.code,
        region.district.replace('\'', "\\'")
    )
}

// ── Region directory ──────────────────────────────────────────────────────────

/// Scan the main table for addressable regions, in document order. A usable
/// row has at least 3 cells and an action link carrying the popup trigger;
/// rows without one are informational (closed intake, notes) and skipped
/// silently.
pub fn discover_regions(html: &str) -> Result<Vec<Region>> {
    let doc = Html::parse_document(html);
    let row_sel = sel("table tbody tr")?;
    let td_sel = sel("td")?;
    let link_sel = sel(&format!("a[onclick*='{}']", REGION_TRIGGER_HOOK))?;

    let mut regions = Vec::new();
    for tr in doc.select(&row_sel) {
        let cells = row_cells(tr, &td_sel);
        if cells.len() < 3 {
            continue;
        }

        let Some(onclick) = tr
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("onclick"))
        else {
            continue;
        };

        match region_code_from_trigger(onclick) {
            Some(code) => regions.push(Region {
                code,
                province: cells[0].clone(),
                district: cells[1].clone(),
            }),
            None => debug!("region row without a parseable trigger: {:?}", onclick),
        }
    }

    Ok(regions)
}

// ── Popup table (per-manufacturer model prices) ───────────────────────────────

/// Strip thousands separators and parse a non-negative amount. Returns None
/// for empty or non-numeric text.
fn parse_amount(s: &str) -> Option<u32> {
    let t = s.trim().replace(',', "");
    if t.is_empty() || !t.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    t.parse().ok()
}

/// Extract subsidy records for the manufacturer of interest from a popup
/// table. Rows need at least 6 cells; the manufacturer cell must contain one
/// of the accepted name variants; the three amounts must parse as
/// non-negative integers or the row is rejected. Rows filtered out here are
/// irrelevant, not errors.
pub fn popup_records(
    html: &str,
    region: &Region,
    category: &str,
    variants: &[String],
) -> Result<Vec<SubsidyRecord>> {
    let doc = Html::parse_document(html);
    let row_sel = sel("table tbody tr")?;
    let td_sel = sel("td")?;

    let mut records = Vec::new();
    for tr in doc.select(&row_sel) {
        let cells = row_cells(tr, &td_sel);
        if cells.len() < 6 {
            continue;
        }

        let manufacturer = cells[1].clone();
        if !variants.iter().any(|v| manufacturer.contains(v.as_str())) {
            continue;
        }

        let (Some(national), Some(local), Some(total)) =
            (parse_amount(&cells[3]), parse_amount(&cells[4]), parse_amount(&cells[5]))
        else {
            debug!(
                "{} {}: dropping row with unparseable amounts: {:?}",
                region.province, region.district, &cells[3..6]
            );
            continue;
        };

        records.push(SubsidyRecord {
            province: region.province.clone(),
            district: region.district.clone(),
            vehicle_category: category.to_string(),
            manufacturer,
            model: cells[2].clone(),
            national_subsidy: national,
            local_subsidy: local,
            total_subsidy: total,
        });
    }

    Ok(records)
}

// ── Main table (application-status schedule) ──────────────────────────────────

/// Decompose a compound count cell like `"10500 (1600) (0) (0) (8900)"` into
/// exactly 5 sub-fields: total + priority/corporate/taxi/general. Missing
/// trailing values pad with empty strings (empty means "not reported", never
/// zero); extra values are truncated.
pub fn decompose_counts(text: &str) -> [String; 5] {
    let mut numbers: Vec<String> = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch.is_ascii_digit() || ch == ',' {
            current.push(ch);
        } else if !current.is_empty() {
            numbers.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        numbers.push(current);
    }

    let fields: Vec<String> = numbers
        .into_iter()
        .map(|n| n.replace(',', ""))
        .filter(|n| !n.is_empty())
        .collect();

    // truncate past 5, right-pad missing values with empty
    let mut iter = fields.into_iter();
    std::array::from_fn(|_| iter.next().unwrap_or_default())
}

/// Extract schedule rows from the status page's data table (the second
/// `<table>` on the page). Complete rows carry 10 cells; the four compound
/// count cells decompose into 5 sub-fields each. Rows whose announced-count
/// total is empty carry no committed allocation and are dropped.
pub fn schedule_rows(html: &str) -> Result<Vec<ScheduleRow>> {
    let doc = Html::parse_document(html);
    let table_sel = sel("table")?;
    let row_sel = sel("tbody tr")?;
    let td_sel = sel("td")?;

    let Some(table) = doc.select(&table_sel).nth(1) else {
        debug!("status page has no data table yet");
        return Ok(Vec::new());
    };

    let mut rows = Vec::new();
    for tr in table.select(&row_sel) {
        let cells = row_cells(tr, &td_sel);
        if cells.len() < 10 {
            continue;
        }

        let row = ScheduleRow {
            province: cells[0].clone(),
            district: cells[1].clone(),
            vehicle_category: cells[2].clone(),
            notice_file: cells[3].clone(),
            intake_method: cells[4].clone(),
            announced: CountBreakdown::from_fields(decompose_counts(&cells[5])),
            received: CountBreakdown::from_fields(decompose_counts(&cells[6])),
            delivered: CountBreakdown::from_fields(decompose_counts(&cells[7])),
            remaining: CountBreakdown::from_fields(decompose_counts(&cells[8])),
            remarks: cells[9].clone(),
        };

        if row.announced.total.is_empty() {
            continue;
        }
        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region { code: "4111".into(), province: "경기".into(), district: "수원시".into() }
    }

    fn popup_html(rows: &[[&str; 6]]) -> String {
        let body: String = rows
            .iter()
            .map(|cells| {
                let tds: String = cells.iter().map(|c| format!("<td>{}</td>", c)).collect();
                format!("<tr>{}</tr>", tds)
            })
            .collect();
        format!("<html><body><table><tbody>{}</tbody></table></body></html>", body)
    }

    #[test]
    fn trigger_code_extraction() {
        let raw = "javascript:psPopupLocalCarModelPrice('2026','1100','서울특별시');return false;";
        assert_eq!(region_code_from_trigger(raw), Some("1100".to_string()));
        assert_eq!(region_code_from_trigger("javascript:void(0)"), None);
        assert_eq!(region_code_from_trigger("psPopupLocalCarModelPrice('2026','')"), None);
    }

    #[test]
    fn discovers_regions_in_document_order() {
        let html = r#"<table><tbody>
            <tr><td>서울</td><td>서울특별시</td>
                <td><a onclick="psPopupLocalCarModelPrice('2026','1100','서울특별시')">조회</a></td></tr>
            <tr><td>경기</td><td>수원시</td>
                <td><a onclick="psPopupLocalCarModelPrice('2026','4111','수원시')">조회</a></td></tr>
            <tr><td>비고</td><td>접수마감</td><td>-</td></tr>
            <tr><td>짧은행</td></tr>
        </tbody></table>"#;

        let regions = discover_regions(html).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].code, "1100");
        assert_eq!(regions[0].province, "서울");
        assert_eq!(regions[1].district, "수원시");
    }

    #[test]
    fn popup_keeps_only_matching_manufacturer() {
        let html = popup_html(&[
            ["승용", "케이지모빌리티", "모델A", "1,000", "500", "1,500"],
            ["승용", "현대", "아이오닉", "680", "300", "980"],
        ]);
        let variants = vec!["케이지모빌리티".to_string(), "KG모빌리티".to_string()];

        let records = popup_records(&html, &region(), "전기승용", &variants).unwrap();
        assert_eq!(records.len(), 1);

        let r = &records[0];
        assert_eq!(r.manufacturer, "케이지모빌리티");
        assert_eq!(r.model, "모델A");
        assert_eq!(r.national_subsidy, 1000);
        assert_eq!(r.local_subsidy, 500);
        assert_eq!(r.total_subsidy, 1500);
        assert_eq!(r.vehicle_category, "전기승용");
        assert_eq!(r.province, "경기");
    }

    #[test]
    fn popup_separator_stripping() {
        let html = popup_html(&[["화물", "KG모빌리티", "모델B", "10,500", "2,000", "12,500"]]);
        let variants = vec!["KG모빌리티".to_string()];

        let records = popup_records(&html, &region(), "전기화물", &variants).unwrap();
        assert_eq!(records[0].national_subsidy, 10500);
    }

    #[test]
    fn popup_rejects_unparseable_amounts_and_short_rows() {
        let html = format!(
            "{}<table><tbody><tr><td>승용</td><td>KG모빌리티</td><td>짧은행</td></tr></tbody></table>",
            popup_html(&[["승용", "KG모빌리티", "모델C", "미정", "500", "1,500"]])
        );
        let variants = vec!["KG모빌리티".to_string()];

        let records = popup_records(&html, &region(), "전기승용", &variants).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn decompose_full_and_partial() {
        assert_eq!(
            decompose_counts("10500 (1600) (0) (0) (8900)"),
            ["10500", "1600", "0", "0", "8900"]
        );
        assert_eq!(decompose_counts("120 (30)"), ["120", "30", "", "", ""]);
        assert_eq!(
            decompose_counts("1 (2) (3) (4) (5) (6)"),
            ["1", "2", "3", "4", "5"]
        );
    }

    #[test]
    fn decompose_strips_separators() {
        assert_eq!(
            decompose_counts("10,500 (1,600) (0) (0) (8,900)"),
            ["10500", "1600", "0", "0", "8900"]
        );
    }

    #[test]
    fn decompose_empty_and_digitless() {
        assert_eq!(decompose_counts(""), ["", "", "", "", ""]);
        assert_eq!(decompose_counts("   "), ["", "", "", "", ""]);
        assert_eq!(decompose_counts("미정"), ["", "", "", "", ""]);
    }

    fn schedule_html(count_cell: &str) -> String {
        format!(
            r#"<table><tbody><tr><td>layout</td></tr></tbody></table>
            <table><tbody><tr>
                <td>서울</td><td>서울특별시</td><td>전기승용</td><td>공고.pdf</td><td>온라인</td>
                <td>{}</td><td>80 (10) (0) (0) (70)</td><td>50 (5) (0) (0) (45)</td>
                <td>30 (5) (0) (0) (25)</td><td>비고없음</td>
            </tr></tbody></table>"#,
            count_cell
        )
    }

    #[test]
    fn schedule_row_decomposition() {
        let rows = schedule_rows(&schedule_html("100 (20) (0) (0) (80)")).unwrap();
        assert_eq!(rows.len(), 1);

        let row = &rows[0];
        assert_eq!(row.province, "서울");
        assert_eq!(row.announced.total, "100");
        assert_eq!(row.announced.general, "80");
        assert_eq!(row.received.total, "80");
        assert_eq!(row.remaining.priority, "5");
        assert_eq!(row.remarks, "비고없음");
    }

    #[test]
    fn schedule_drops_rows_without_announced_total() {
        let rows = schedule_rows(&schedule_html("")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn schedule_without_data_table_is_empty() {
        let rows = schedule_rows("<html><body><table></table></body></html>").unwrap();
        assert!(rows.is_empty());
    }
}

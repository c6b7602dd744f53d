use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::extract::anomaly::parse_decimal;
use crate::models::api::ExtractionResult;

/// Prices within this relative tolerance count as unchanged.
pub const PRICE_EQUAL_TOLERANCE: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompareStatus {
    New,
    Removed,
    Up,
    Down,
    Unavail,
    Avail,
    Same,
}

impl CompareStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareStatus::New => "NEW",
            CompareStatus::Removed => "REMOVED",
            CompareStatus::Up => "UP",
            CompareStatus::Down => "DOWN",
            CompareStatus::Unavail => "UNAVAIL",
            CompareStatus::Avail => "AVAIL",
            CompareStatus::Same => "SAME",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ComparisonSummary {
    pub total_base: usize,
    pub total_target: usize,
    pub matched: usize,
    pub added: usize,
    pub removed: usize,
    pub price_increased: usize,
    pub price_decreased: usize,
    pub price_unavailable: usize,
    pub price_available: usize,
    pub unchanged: usize,
    pub base_skipped: usize,
    pub target_skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult {
    pub summary: ComparisonSummary,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

pub const COMPARE_COLUMNS: [&str; 10] = [
    "Status",
    "Reference",
    "Variant",
    "Description",
    "Base Price",
    "Target Price",
    "Change",
    "% Change",
    "Base Page",
    "Target Page",
];

#[derive(Debug, Clone)]
struct Item {
    reference: String,
    variant: String,
    norm_variant: String,
    value: String,
    desc: String,
    page: String,
}

/// Diff two extractions of the same vendor, keyed by reference (and variant
/// when melted), classifying each joined pair.
pub fn compare_extractions(
    base: &ExtractionResult,
    target: &ExtractionResult,
) -> ComparisonResult {
    let (base_items, base_skipped) = collect_items(base);
    let (target_items, target_skipped) = collect_items(target);

    let mut summary = ComparisonSummary {
        total_base: base_items.values().map(Vec::len).sum(),
        total_target: target_items.values().map(Vec::len).sum(),
        base_skipped,
        target_skipped,
        ..Default::default()
    };

    let mut all_refs: BTreeMap<&str, ()> = BTreeMap::new();
    for key in base_items.keys().chain(target_items.keys()) {
        all_refs.insert(key, ());
    }

    let mut rows = Vec::new();
    for (reference, _) in all_refs {
        let empty = Vec::new();
        let base_list = base_items.get(reference).unwrap_or(&empty);
        let target_list = target_items.get(reference).unwrap_or(&empty);

        let mut matched_base = HashSet::new();
        let mut matched_target = HashSet::new();

        // Pass 1: exact variant match.
        for (bi, base_item) in base_list.iter().enumerate() {
            for (ti, target_item) in target_list.iter().enumerate() {
                if matched_target.contains(&ti) {
                    continue;
                }
                if base_item.norm_variant == target_item.norm_variant {
                    rows.push(build_row(Some(base_item), Some(target_item), &mut summary));
                    matched_base.insert(bi);
                    matched_target.insert(ti);
                    break;
                }
            }
        }

        // Pass 2: pair leftovers where one side lacks a variant.
        for (bi, base_item) in base_list.iter().enumerate() {
            if matched_base.contains(&bi) {
                continue;
            }
            for (ti, target_item) in target_list.iter().enumerate() {
                if matched_target.contains(&ti) {
                    continue;
                }
                if base_item.norm_variant.is_empty() || target_item.norm_variant.is_empty() {
                    rows.push(build_row(Some(base_item), Some(target_item), &mut summary));
                    matched_base.insert(bi);
                    matched_target.insert(ti);
                    break;
                }
            }
        }

        for (bi, base_item) in base_list.iter().enumerate() {
            if !matched_base.contains(&bi) {
                rows.push(build_row(Some(base_item), None, &mut summary));
            }
        }
        for (ti, target_item) in target_list.iter().enumerate() {
            if !matched_target.contains(&ti) {
                rows.push(build_row(None, Some(target_item), &mut summary));
            }
        }
    }

    ComparisonResult {
        summary,
        columns: COMPARE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        rows,
    }
}

/// Group extraction rows by normalized reference, skipping flagged rows,
/// duplicate (reference, variant) pairs and values that do not look like
/// product codes.
fn collect_items(result: &ExtractionResult) -> (BTreeMap<String, Vec<Item>>, usize) {
    let col = |name: &str| result.columns.iter().position(|c| c == name);
    let ref_idx = col("reference");
    let value_idx = col("value");
    let variant_idx = col("variant");
    let page_idx = col("page");
    let desc_idx = result
        .columns
        .iter()
        .enumerate()
        .position(|(i, c)| {
            let cl = c.to_lowercase();
            Some(i) != ref_idx
                && Some(i) != value_idx
                && (cl.contains("desc") || cl.contains("product") || cl.contains("name"))
        });

    let flagged_rows: HashSet<usize> = result.flags.iter().map(|f| f.row).collect();
    let mut skipped = flagged_rows.len();

    let mut items: BTreeMap<String, Vec<Item>> = BTreeMap::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for (ri, row) in result.rows.iter().enumerate() {
        if flagged_rows.contains(&ri) {
            continue;
        }
        let (Some(ref_idx), Some(value_idx)) = (ref_idx, value_idx) else {
            continue;
        };
        let Some(reference) = row.get(ref_idx).map(|s| s.trim()) else {
            continue;
        };
        let Some(value) = row.get(value_idx).map(|s| s.trim()) else {
            continue;
        };
        if reference.is_empty() || reference == "-" || value.is_empty() || value == "-" {
            continue;
        }
        if !is_valid_product_reference(reference) {
            skipped += 1;
            continue;
        }

        let variant = variant_idx
            .and_then(|i| row.get(i))
            .map(|v| v.trim())
            .filter(|v| *v != "-")
            .unwrap_or("")
            .to_string();
        let norm_variant = variant.to_lowercase().replace(' ', "");
        let norm_ref = reference.to_lowercase();

        if !seen.insert((norm_ref.clone(), norm_variant.clone())) {
            continue;
        }

        items.entry(norm_ref).or_default().push(Item {
            reference: reference.to_string(),
            variant,
            norm_variant,
            value: value.to_string(),
            desc: desc_idx
                .and_then(|i| row.get(i))
                .cloned()
                .unwrap_or_default(),
            page: page_idx
                .and_then(|i| row.get(i))
                .cloned()
                .unwrap_or_default(),
        });
    }

    (items, skipped)
}

/// Row numbers and stray short codes are not product references.
fn is_valid_product_reference(reference: &str) -> bool {
    let r = reference.trim();
    r.len() >= 3
        && !r.chars().all(|c| c.is_ascii_digit())
        && r.chars().any(|c| c.is_alphabetic())
}

fn classify(
    base: Option<&Item>,
    target: Option<&Item>,
    base_price: Option<f64>,
    target_price: Option<f64>,
) -> CompareStatus {
    if base.is_none() {
        return CompareStatus::New;
    }
    if target.is_none() {
        return CompareStatus::Removed;
    }
    match (base_price, target_price) {
        (Some(b), Some(t)) => {
            let equal = if b == 0.0 {
                t == 0.0
            } else {
                ((t - b) / b).abs() <= PRICE_EQUAL_TOLERANCE
            };
            if equal {
                CompareStatus::Same
            } else if t > b {
                CompareStatus::Up
            } else {
                CompareStatus::Down
            }
        }
        (Some(_), None) => CompareStatus::Unavail,
        (None, Some(_)) => CompareStatus::Avail,
        // Both unparseable (e.g. both "On Request").
        (None, None) => CompareStatus::Same,
    }
}

fn format_change(base: Option<f64>, target: Option<f64>) -> (String, String) {
    let (Some(b), Some(t)) = (base, target) else {
        return ("-".to_string(), "-".to_string());
    };
    let change = t - b;
    if change == 0.0 {
        return ("0.00".to_string(), "0.00%".to_string());
    }
    let pct = if b != 0.0 { change / b * 100.0 } else { 0.0 };
    (format!("{change:+.2}"), format!("{pct:+.2}%"))
}

fn build_row(
    base: Option<&Item>,
    target: Option<&Item>,
    summary: &mut ComparisonSummary,
) -> Vec<String> {
    let pick = |f: fn(&Item) -> &str| {
        target
            .map(f)
            .filter(|v| !v.is_empty())
            .or_else(|| base.map(f).filter(|v| !v.is_empty()))
            .unwrap_or("")
            .to_string()
    };

    let base_price_str = base.map(|i| i.value.clone()).unwrap_or_default();
    let target_price_str = target.map(|i| i.value.clone()).unwrap_or_default();
    let base_price = base.and_then(|i| parse_decimal(&i.value));
    let target_price = target.and_then(|i| parse_decimal(&i.value));

    let status = classify(base, target, base_price, target_price);
    let (change, pct) = format_change(base_price, target_price);

    match status {
        CompareStatus::New => summary.added += 1,
        CompareStatus::Removed => summary.removed += 1,
        CompareStatus::Up => {
            summary.matched += 1;
            summary.price_increased += 1;
        }
        CompareStatus::Down => {
            summary.matched += 1;
            summary.price_decreased += 1;
        }
        CompareStatus::Unavail => {
            summary.matched += 1;
            summary.price_unavailable += 1;
        }
        CompareStatus::Avail => {
            summary.matched += 1;
            summary.price_available += 1;
        }
        CompareStatus::Same => {
            summary.matched += 1;
            summary.unchanged += 1;
        }
    }

    vec![
        status.as_str().to_string(),
        pick(|i| &i.reference),
        pick(|i| &i.variant),
        pick(|i| &i.desc),
        base_price_str,
        target_price_str,
        change,
        pct,
        base.map(|i| i.page.clone()).unwrap_or_default(),
        target.map(|i| i.page.clone()).unwrap_or_default(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::api::{CellFlag, FlagReason};

    fn extraction(rows: Vec<Vec<&str>>) -> ExtractionResult {
        let rows: Vec<Vec<String>> = rows
            .into_iter()
            .map(|r| r.into_iter().map(String::from).collect())
            .collect();
        ExtractionResult {
            columns: vec!["reference".into(), "value".into(), "page".into()],
            row_count: rows.len(),
            page_count: 1,
            flagged_count: 0,
            flags: vec![],
            row_table_indices: rows.iter().map(|_| (1, 0)).collect(),
            rows,
        }
    }

    #[test]
    fn test_up_removed_new_classification() {
        let base = extraction(vec![
            vec!["LC1D09", "120.00", "3"],
            vec!["LC1D12", "150.00", "3"],
        ]);
        let target = extraction(vec![
            vec!["LC1D09", "130.00", "4"],
            vec!["LC1D18", "200.00", "5"],
        ]);

        let result = compare_extractions(&base, &target);
        assert_eq!(result.summary.added, 1);
        assert_eq!(result.summary.removed, 1);
        assert_eq!(result.summary.price_increased, 1);

        let up = result.rows.iter().find(|r| r[1] == "LC1D09").unwrap();
        assert_eq!(up[0], "UP");
        assert_eq!(up[6], "+10.00");
        assert_eq!(up[7], "+8.33%");
        assert_eq!(up[8], "3");
        assert_eq!(up[9], "4");

        let removed = result.rows.iter().find(|r| r[1] == "LC1D12").unwrap();
        assert_eq!(removed[0], "REMOVED");

        let added = result.rows.iter().find(|r| r[1] == "LC1D18").unwrap();
        assert_eq!(added[0], "NEW");
    }

    #[test]
    fn test_same_within_tolerance() {
        let base = extraction(vec![vec!["LC1D09", "1000.00", "1"]]);
        let target = extraction(vec![vec!["LC1D09", "1004.00", "1"]]);
        let result = compare_extractions(&base, &target);
        assert_eq!(result.rows[0][0], "SAME");
        assert_eq!(result.summary.unchanged, 1);

        let target = extraction(vec![vec!["LC1D09", "1006.00", "1"]]);
        let result = compare_extractions(&base, &target);
        assert_eq!(result.rows[0][0], "UP");
    }

    #[test]
    fn test_unavail_and_avail() {
        let base = extraction(vec![
            vec!["LC1D09", "120.00", "1"],
            vec!["LC1D12", "On Request", "1"],
        ]);
        let target = extraction(vec![
            vec!["LC1D09", "On Request", "1"],
            vec!["LC1D12", "150.00", "1"],
        ]);

        let result = compare_extractions(&base, &target);
        let unavail = result.rows.iter().find(|r| r[1] == "LC1D09").unwrap();
        assert_eq!(unavail[0], "UNAVAIL");
        let avail = result.rows.iter().find(|r| r[1] == "LC1D12").unwrap();
        assert_eq!(avail[0], "AVAIL");
    }

    #[test]
    fn test_variant_keyed_join() {
        let melted = |rows: Vec<Vec<&str>>| {
            let rows: Vec<Vec<String>> = rows
                .into_iter()
                .map(|r| r.into_iter().map(String::from).collect())
                .collect();
            ExtractionResult {
                columns: vec!["reference".into(), "variant".into(), "value".into()],
                row_count: rows.len(),
                page_count: 1,
                flagged_count: 0,
                flags: vec![],
                row_table_indices: rows.iter().map(|_| (1, 0)).collect(),
                rows,
            }
        };

        let base = melted(vec![
            vec!["LC1D09", "AC-1", "100"],
            vec!["LC1D09", "AC-3", "120"],
        ]);
        let target = melted(vec![
            vec!["LC1D09", "AC-3", "125"],
            vec!["LC1D09", "AC-1", "100"],
        ]);

        let result = compare_extractions(&base, &target);
        assert_eq!(result.rows.len(), 2);
        let ac3 = result.rows.iter().find(|r| r[2] == "AC-3").unwrap();
        assert_eq!(ac3[0], "UP");
        let ac1 = result.rows.iter().find(|r| r[2] == "AC-1").unwrap();
        assert_eq!(ac1[0], "SAME");
    }

    #[test]
    fn test_flagged_rows_skipped() {
        let mut base = extraction(vec![
            vec!["LC1D09", "120.00", "1"],
            vec!["LC1D12", "garbage", "1"],
        ]);
        base.flags.push(CellFlag {
            row: 1,
            col: 1,
            reason: FlagReason::NonNumericInNumericColumn,
        });
        let target = extraction(vec![vec!["LC1D09", "120.00", "1"]]);

        let result = compare_extractions(&base, &target);
        assert_eq!(result.summary.base_skipped, 1);
        assert!(result.rows.iter().all(|r| r[1] != "LC1D12"));
    }

    #[test]
    fn test_invalid_references_skipped() {
        let base = extraction(vec![
            vec!["12", "100", "1"],
            vec!["ab", "100", "1"],
            vec!["1234", "100", "1"],
            vec!["LC1D09", "100", "1"],
        ]);
        let target = extraction(vec![vec!["LC1D09", "100", "1"]]);

        let result = compare_extractions(&base, &target);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.summary.base_skipped, 3);
    }

    #[test]
    fn test_both_unparseable_is_same() {
        let base = extraction(vec![vec!["LC1D09", "On Request", "1"]]);
        let target = extraction(vec![vec!["LC1D09", "On Request", "1"]]);
        let result = compare_extractions(&base, &target);
        assert_eq!(result.rows[0][0], "SAME");
        assert_eq!(result.rows[0][6], "-");
        assert_eq!(result.rows[0][7], "-");
    }
}

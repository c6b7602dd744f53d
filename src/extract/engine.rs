use std::collections::HashSet;

use crate::models::api::{ExtractionConfig, ExtractionResult};
use crate::tables::{PageTables, Table};

use super::anomaly::detect_anomalies;
use super::resolver::{is_blank, resolve_table, FieldMapping, SynonymTable, ValueMode};

/// Run an extraction config over the parsed tables of an upload.
///
/// Deterministic: identical tables, config and synonyms produce identical
/// rows, columns, flags and row/table indices.
pub fn run_extraction(
    pages: &[PageTables],
    config: &ExtractionConfig,
    syn: &SynonymTable,
) -> ExtractionResult {
    let resolved: Vec<(i32, &Table, FieldMapping)> = pages
        .iter()
        .flat_map(|page| {
            page.tables
                .iter()
                .filter_map(move |table| {
                    resolve_table(table, config, syn).map(|m| (page.page_num, table, m))
                })
        })
        .collect();

    let melted = resolved
        .iter()
        .any(|(_, _, mapping)| mapping.mode == ValueMode::Melt);

    let mut columns: Vec<String> = vec!["reference".to_string()];
    if melted {
        columns.push("variant".to_string());
    }
    columns.extend(config.extras.iter().cloned());
    columns.push("value".to_string());
    if config.include_heading {
        columns.push("heading".to_string());
    }
    if config.include_page {
        columns.push("page".to_string());
    }

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row_table_indices: Vec<(i32, usize)> = Vec::new();
    let mut pages_used: HashSet<i32> = HashSet::new();

    for (page_num, table, mapping) in &resolved {
        emit_table_rows(
            *page_num,
            table,
            mapping,
            config,
            melted,
            &mut rows,
            &mut row_table_indices,
            &mut pages_used,
        );
    }

    let flags = detect_anomalies(&columns, &rows);
    let flagged_count = flags.iter().map(|f| f.row).collect::<HashSet<_>>().len();

    ExtractionResult {
        row_count: rows.len(),
        page_count: pages_used.len(),
        flagged_count,
        columns,
        rows,
        flags,
        row_table_indices,
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_table_rows(
    page_num: i32,
    table: &Table,
    mapping: &FieldMapping,
    config: &ExtractionConfig,
    melted: bool,
    rows: &mut Vec<Vec<String>>,
    row_table_indices: &mut Vec<(i32, usize)>,
    pages_used: &mut HashSet<i32>,
) {
    let fill_value = config.fill_down_value.unwrap_or(false) && mapping.mode == ValueMode::Flat;

    let mut last_ref: Option<String> = None;
    let mut last_value: Option<String> = None;

    for row in &table.rows {
        if is_section_header_row(table, row) {
            continue;
        }

        let ref_text = row
            .get(mapping.row_col)
            .map(|c| c.text.as_str())
            .unwrap_or("");
        let Some(reference) = effective_reference(ref_text, &mut last_ref) else {
            continue;
        };

        for &vc in &mapping.value_cols {
            let mut value = row.get(vc).map(|c| c.text.clone()).unwrap_or_default();

            if fill_value {
                if is_blank(&value) {
                    value = last_value.clone().unwrap_or_default();
                } else {
                    last_value = Some(value.clone());
                }
            }
            if is_blank(&value) {
                continue;
            }

            let mut out = vec![reference.clone()];
            if melted {
                // The child display form names the variant; a column without
                // real children (parent == child) has none.
                let col = &table.columns[vc];
                let variant = if mapping.mode == ValueMode::Melt && col.child != col.parent {
                    col.child.clone()
                } else {
                    String::new()
                };
                out.push(variant);
            }
            for extra in &mapping.extra_cols {
                out.push(
                    extra
                        .and_then(|ec| row.get(ec))
                        .map(|c| c.text.clone())
                        .unwrap_or_default(),
                );
            }
            out.push(value);
            if config.include_heading {
                out.push(table.heading.clone().unwrap_or_default());
            }
            if config.include_page {
                out.push(page_num.to_string());
            }

            rows.push(out);
            row_table_indices.push((page_num, table.index));
            pages_used.insert(page_num);
        }
    }
}

/// Section-title rows repeat one value across the row (usually a colspan
/// banner); they carry no data. A row with a single non-blank cell is a
/// continuation row, not a banner.
fn is_section_header_row(table: &Table, row: &[crate::tables::Cell]) -> bool {
    if table.columns.len() < 2 {
        return false;
    }
    let non_blank: Vec<&str> = row
        .iter()
        .map(|c| c.text.as_str())
        .filter(|t| !is_blank(t))
        .collect();
    non_blank.len() >= 2 && non_blank.iter().all(|t| *t == non_blank[0])
}

/// Fill-down of the row anchor: blank cells and sub-row annotations carry
/// the last seen reference forward.
fn effective_reference(text: &str, last_ref: &mut Option<String>) -> Option<String> {
    let cleaned: String = text.chars().filter(|c| !matches!(c, '✓' | '✗')).collect();
    let cleaned = cleaned.trim();

    if is_blank(cleaned) {
        return last_ref.clone();
    }
    if last_ref.is_some() && is_subrow_annotation(cleaned) {
        return last_ref.clone();
    }

    *last_ref = Some(cleaned.to_string());
    last_ref.clone()
}

/// Continuation-row markers: a leading lowercase letter or a digits-only
/// suffix under a known reference.
fn is_subrow_annotation(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => true,
        Some(_) => text.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::parser::parse_page;

    fn config(row: &str, value: &str) -> ExtractionConfig {
        ExtractionConfig {
            row_anchor: row.to_string(),
            value_anchor: value.to_string(),
            extras: vec![],
            include_page: false,
            include_heading: false,
            melt: false,
            match_child: None,
            fill_down_value: None,
        }
    }

    const MELT_PAGE: &str = r#"# Contactors

<table>
<thead>
<tr><th rowspan="2">Reference</th><th colspan="3">Unit MRP</th></tr>
<tr><th>AC-1</th><th>AC-3</th><th>AC-4</th></tr>
</thead>
<tbody>
<tr><td>LC1D09</td><td>1,200</td><td>1,350</td><td>1,500</td></tr>
<tr><td>LC1D12</td><td>1,400</td><td>1,550</td><td>1,700</td></tr>
</tbody>
</table>
"#;

    #[test]
    fn test_melt_extraction() {
        let pages = vec![parse_page(1, MELT_PAGE)];
        let mut cfg = config("Reference", "Unit MRP");
        cfg.melt = true;
        cfg.include_page = true;

        let result = run_extraction(&pages, &cfg, &SynonymTable::default());

        assert_eq!(result.columns, vec!["reference", "variant", "value", "page"]);
        assert_eq!(result.row_count, 6);
        assert_eq!(result.rows[0], vec!["LC1D09", "AC-1", "1,200", "1"]);
        assert_eq!(result.rows[1], vec!["LC1D09", "AC-3", "1,350", "1"]);
        assert_eq!(result.rows[2], vec!["LC1D09", "AC-4", "1,500", "1"]);
        for row in &result.rows {
            assert!(["AC-1", "AC-3", "AC-4"].contains(&row[1].as_str()));
        }
        assert_eq!(result.page_count, 1);
        assert!(result.row_table_indices.iter().all(|&(p, t)| p == 1 && t == 0));
    }

    #[test]
    fn test_fill_down_row_anchor() {
        let md = r#"<table>
<tr><th>Reference</th><th>Price</th></tr>
<tr><td>LC1D09</td><td>120</td></tr>
<tr><td></td><td>130</td></tr>
<tr><td></td><td>140</td></tr>
<tr><td>LC1D12</td><td>150</td></tr>
</table>"#;
        let pages = vec![parse_page(1, md)];
        let result = run_extraction(&pages, &config("Reference", "Price"), &SynonymTable::default());

        assert_eq!(result.row_count, 4);
        assert_eq!(result.rows[0][0], "LC1D09");
        assert_eq!(result.rows[1][0], "LC1D09");
        assert_eq!(result.rows[2][0], "LC1D09");
        assert_eq!(result.rows[3][0], "LC1D12");
    }

    #[test]
    fn test_subrow_annotation_carries_reference() {
        let md = r#"<table>
<tr><th>Reference</th><th>Price</th></tr>
<tr><td>LC1D09</td><td>120</td></tr>
<tr><td>a</td><td>130</td></tr>
<tr><td>25</td><td>140</td></tr>
</table>"#;
        let pages = vec![parse_page(1, md)];
        let result = run_extraction(&pages, &config("Reference", "Price"), &SynonymTable::default());

        assert_eq!(result.row_count, 3);
        assert!(result.rows.iter().all(|r| r[0] == "LC1D09"));
    }

    #[test]
    fn test_fill_down_value_flat() {
        let md = r#"<table>
<tr><th>Reference</th><th>Price</th></tr>
<tr><td>A1</td><td>100</td></tr>
<tr><td>A2</td><td></td></tr>
</table>"#;
        let pages = vec![parse_page(1, md)];

        let mut cfg = config("Reference", "Price");
        let result = run_extraction(&pages, &cfg, &SynonymTable::default());
        assert_eq!(result.row_count, 1);

        cfg.fill_down_value = Some(true);
        let result = run_extraction(&pages, &cfg, &SynonymTable::default());
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[1], vec!["A2", "100"]);
    }

    #[test]
    fn test_heading_and_page_injection() {
        let pages = vec![parse_page(4, MELT_PAGE)];
        let mut cfg = config("Reference", "Unit MRP");
        cfg.melt = true;
        cfg.include_heading = true;
        cfg.include_page = true;

        let result = run_extraction(&pages, &cfg, &SynonymTable::default());
        assert_eq!(
            result.columns,
            vec!["reference", "variant", "value", "heading", "page"]
        );
        assert_eq!(result.rows[0][3], "Contactors");
        assert_eq!(result.rows[0][4], "4");
    }

    #[test]
    fn test_extras_blank_when_unmatched() {
        let md = r#"<table>
<tr><th>Reference</th><th>Description</th><th>Price</th></tr>
<tr><td>A1</td><td>Widget</td><td>10</td></tr>
</table>"#;
        let pages = vec![parse_page(1, md)];
        let mut cfg = config("Reference", "Price");
        cfg.extras = vec!["Description".to_string(), "Pack Qty".to_string()];

        let result = run_extraction(&pages, &cfg, &SynonymTable::default());
        assert_eq!(
            result.columns,
            vec!["reference", "Description", "Pack Qty", "value"]
        );
        assert_eq!(result.rows[0], vec!["A1", "Widget", "", "10"]);
    }

    #[test]
    fn test_section_header_rows_skipped() {
        let md = r#"<table>
<tr><th>Reference</th><th>Price</th></tr>
<tr><td colspan="2">Motor Starters</td></tr>
<tr><td>A1</td><td>10</td></tr>
</table>"#;
        let pages = vec![parse_page(1, md)];
        let result = run_extraction(&pages, &config("Reference", "Price"), &SynonymTable::default());
        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows[0][0], "A1");
    }

    #[test]
    fn test_anomaly_flag_on_value_column() {
        let mut body = String::new();
        for i in 0..19 {
            body.push_str(&format!("<tr><td>R{i:02}</td><td>1{i:02}0</td></tr>\n"));
        }
        body.push_str("<tr><td>R19</td><td>N/A</td></tr>\n");
        let md = format!("<table>\n<tr><th>Reference</th><th>Price</th></tr>\n{body}</table>");

        let pages = vec![parse_page(1, &md)];
        let result = run_extraction(&pages, &config("Reference", "Price"), &SynonymTable::default());

        assert_eq!(result.row_count, 20);
        assert_eq!(result.flags.len(), 1);
        assert_eq!(result.flags[0].row, 19);
        assert_eq!(result.columns[result.flags[0].col], "value");
        assert_eq!(
            result.flags[0].reason,
            crate::models::api::FlagReason::NonNumericInNumericColumn
        );
        assert_eq!(result.flagged_count, 1);
    }

    #[test]
    fn test_deterministic_output() {
        let pages = vec![parse_page(1, MELT_PAGE)];
        let mut cfg = config("Reference", "Unit MRP");
        cfg.melt = true;

        let a = run_extraction(&pages, &cfg, &SynonymTable::default());
        let b = run_extraction(&pages, &cfg, &SynonymTable::default());
        assert_eq!(a.rows, b.rows);
        assert_eq!(a.columns, b.columns);
        assert_eq!(a.flags, b.flags);
        assert_eq!(a.row_table_indices, b.row_table_indices);
    }

    #[test]
    fn test_multi_page_table_indices() {
        let md2 = r#"<table>
<tr><th>Reference</th><th>Unit MRP</th></tr>
<tr><td>B1</td><td>20</td></tr>
</table>

<table>
<tr><th>Reference</th><th>Unit MRP</th></tr>
<tr><td>B2</td><td>30</td></tr>
</table>"#;
        let pages = vec![parse_page(1, MELT_PAGE), parse_page(2, md2)];
        let mut cfg = config("Reference", "Unit MRP");
        cfg.melt = true;

        let result = run_extraction(&pages, &cfg, &SynonymTable::default());
        assert_eq!(result.page_count, 2);
        // Page 2's flat tables keep their own table indices.
        assert!(result.row_table_indices.contains(&(2, 0)));
        assert!(result.row_table_indices.contains(&(2, 1)));
        // Flat tables in a melted run emit an empty variant.
        let b1 = result.rows.iter().find(|r| r[0] == "B1").unwrap();
        assert_eq!(b1[1], "");
    }
}

use crate::models::api::{ExtractionConfig, ScanResponse};
use crate::tables::{normalize, Column, PageTables, Table};

/// Synonym groups used by anchor matching. The table is a resolver input so
/// vendor deployments can swap it without touching call sites.
#[derive(Debug, Clone)]
pub struct SynonymTable {
    groups: Vec<Vec<String>>,
}

impl Default for SynonymTable {
    fn default() -> Self {
        Self::new(&[
            &["ref", "reference", "cat no", "catalog number", "part number"],
            &["mrp", "list price", "price", "unit price"],
            &["desc", "description"],
            &["qty", "quantity", "pack qty"],
        ])
    }
}

impl SynonymTable {
    pub fn new(groups: &[&[&str]]) -> Self {
        Self {
            groups: groups
                .iter()
                .map(|g| g.iter().map(|s| normalize(s)).collect())
                .collect(),
        }
    }

    /// Substring containment both ways, widened by the synonym groups.
    pub fn matches(&self, query_norm: &str, candidate_norm: &str) -> bool {
        if substring_match(query_norm, candidate_norm) {
            return true;
        }
        self.groups.iter().any(|group| {
            group.iter().any(|e| substring_match(e, query_norm))
                && group.iter().any(|e| substring_match(e, candidate_norm))
        })
    }
}

fn substring_match(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a))
}

/// Which header level an anchor matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLevel {
    Parent,
    Child,
}

fn match_column(query_norm: &str, col: &Column, syn: &SynonymTable) -> Option<MatchLevel> {
    if syn.matches(query_norm, &col.norm_parent) {
        Some(MatchLevel::Parent)
    } else if syn.matches(query_norm, &col.norm_child) {
        Some(MatchLevel::Child)
    } else {
        None
    }
}

/// How the value anchor resolved for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMode {
    Flat,
    Pin,
    Melt,
}

/// Concrete column assignment of an `ExtractionConfig` for one table.
#[derive(Debug, Clone)]
pub struct FieldMapping {
    pub row_col: usize,
    pub value_cols: Vec<usize>,
    pub mode: ValueMode,
    /// One slot per configured extra; `None` emits a blank output column.
    pub extra_cols: Vec<Option<usize>>,
}

/// Resolve a config against one table. `None` when the table is unusable
/// (no row anchor or no value column).
pub fn resolve_table(
    table: &Table,
    config: &ExtractionConfig,
    syn: &SynonymTable,
) -> Option<FieldMapping> {
    if table.columns.is_empty() || table.rows.is_empty() {
        return None;
    }

    let ra = normalize(&config.row_anchor);
    let va = normalize(&config.value_anchor);

    let row_col = resolve_row_anchor(table, &ra, syn)?;

    let (value_cols, mode) = resolve_value_anchor(table, config, &va, row_col, syn);
    if value_cols.is_empty() {
        return None;
    }

    let extra_cols = config
        .extras
        .iter()
        .map(|extra| {
            let en = normalize(extra);
            table
                .columns
                .iter()
                .enumerate()
                .position(|(i, col)| {
                    i != row_col && !value_cols.contains(&i) && match_column(&en, col, syn).is_some()
                })
        })
        .collect();

    Some(FieldMapping {
        row_col,
        value_cols,
        mode,
        extra_cols,
    })
}

fn resolve_row_anchor(table: &Table, ra: &str, syn: &SynonymTable) -> Option<usize> {
    let (first, level) = table
        .columns
        .iter()
        .enumerate()
        .find_map(|(i, col)| match_column(ra, col, syn).map(|lvl| (i, lvl)))?;

    if level != MatchLevel::Parent {
        return Some(first);
    }

    // A parent-level match may span several children: prefer the child
    // column with the most data in it.
    let parent_norm = &table.columns[first].norm_parent;
    let candidates: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, col)| &col.norm_parent == parent_norm)
        .map(|(i, _)| i)
        .collect();

    if candidates.len() <= 1 {
        return Some(first);
    }

    candidates
        .into_iter()
        .max_by(|&a, &b| {
            non_empty_ratio(table, a)
                .partial_cmp(&non_empty_ratio(table, b))
                .unwrap_or(std::cmp::Ordering::Equal)
                // max_by keeps the later element on ties; invert the index
                // comparison so the leftmost candidate wins.
                .then(b.cmp(&a))
        })
        .or(Some(first))
}

fn non_empty_ratio(table: &Table, col: usize) -> f64 {
    if table.rows.is_empty() {
        return 0.0;
    }
    let filled = table
        .rows
        .iter()
        .filter(|row| row.get(col).map(|c| !is_blank(&c.text)).unwrap_or(false))
        .count();
    filled as f64 / table.rows.len() as f64
}

fn resolve_value_anchor(
    table: &Table,
    config: &ExtractionConfig,
    va: &str,
    row_col: usize,
    syn: &SynonymTable,
) -> (Vec<usize>, ValueMode) {
    // Pin mode: the one column matching both the anchor and the child.
    if let Some(match_child) = &config.match_child {
        let mc = normalize(match_child);
        let pinned = table.columns.iter().enumerate().find(|(i, col)| {
            *i != row_col
                && match_column(va, col, syn).is_some()
                && syn.matches(&mc, &col.norm_child)
        });
        return (pinned.map(|(i, _)| i).into_iter().collect(), ValueMode::Pin);
    }

    // Melt mode: every child column under the matching parent.
    if config.melt {
        let melted: Vec<usize> = table
            .columns
            .iter()
            .enumerate()
            .filter(|(i, col)| *i != row_col && syn.matches(va, &col.norm_parent))
            .map(|(i, _)| i)
            .collect();
        if !melted.is_empty() {
            return (melted, ValueMode::Melt);
        }
        // No parent-level match: the table degrades to flat resolution.
    }

    let flat = table
        .columns
        .iter()
        .enumerate()
        .find(|(i, col)| *i != row_col && match_column(va, col, syn).is_some());
    (flat.map(|(i, _)| i).into_iter().collect(), ValueMode::Flat)
}

/// How many tables across the upload resolve both anchors.
pub fn count_usable_tables(
    pages: &[PageTables],
    config: &ExtractionConfig,
    syn: &SynonymTable,
) -> usize {
    pages
        .iter()
        .flat_map(|p| p.tables.iter())
        .filter(|t| resolve_table(t, config, syn).is_some())
        .count()
}

pub fn is_blank(text: &str) -> bool {
    let t = text.trim();
    t.is_empty() || t == "-" || t == "—"
}

/// Column discovery for the scan endpoint: which tables match a pair of
/// anchors and which value/extra columns they expose.
pub fn scan_columns(
    pages: &[PageTables],
    row_anchor: &str,
    value_anchor: &str,
    syn: &SynonymTable,
) -> ScanResponse {
    let ra = normalize(row_anchor);
    let va = normalize(value_anchor);

    let mut tables_found = 0;
    let mut pages_found = std::collections::HashSet::new();
    let mut value_columns: Vec<String> = Vec::new();
    let mut extra_columns: Vec<String> = Vec::new();

    for page in pages {
        for table in &page.tables {
            let has_ref = table
                .columns
                .iter()
                .any(|c| match_column(&ra, c, syn).is_some());
            let value_matches: Vec<&Column> = table
                .columns
                .iter()
                .filter(|c| match_column(&va, c, syn).is_some())
                .collect();
            if !has_ref || value_matches.is_empty() {
                continue;
            }

            tables_found += 1;
            pages_found.insert(page.page_num);

            for col in &table.columns {
                let display = col.display();
                if match_column(&va, col, syn).is_some() {
                    if !value_columns.contains(&display) {
                        value_columns.push(display);
                    }
                } else if match_column(&ra, col, syn).is_none()
                    && !extra_columns.contains(&display)
                {
                    extra_columns.push(display);
                }
            }
        }
    }

    ScanResponse {
        tables_found,
        pages_found: pages_found.len(),
        value_columns,
        extra_columns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::parser::parse_table_html;

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

    const MELT_TABLE: &str = r#"<table>
<thead>
<tr><th rowspan="2">Reference</th><th rowspan="2">Description</th><th colspan="3">Unit MRP</th></tr>
<tr><th>AC-1</th><th>AC-3</th><th>AC-4</th></tr>
</thead>
<tbody>
<tr><td>LC1D09</td><td>Contactor 9A</td><td>1,200</td><td>1,350</td><td>1,500</td></tr>
</tbody>
</table>"#;

    #[test]
    fn test_synonym_matching() {
        let syn = SynonymTable::default();
        assert!(syn.matches("reference", "reference"));
        assert!(syn.matches("reference", "cat no"));
        assert!(syn.matches("mrp", "list price"));
        assert!(syn.matches("unit mrp", "unit mrp"));
        assert!(!syn.matches("reference", "unit mrp"));
    }

    #[test]
    fn test_substring_both_ways() {
        let syn = SynonymTable::default();
        // query ⊆ candidate
        assert!(syn.matches("mrp", "unit mrp"));
        // candidate ⊆ query
        assert!(syn.matches("unit mrp in inr", "unit mrp"));
    }

    #[test]
    fn test_flat_resolution() {
        let table = parse_table_html(
            "<table><tr><th>Cat. No.</th><th>List Price</th></tr><tr><td>A1</td><td>10</td></tr></table>",
        );
        let syn = SynonymTable::default();
        let mapping = resolve_table(&table, &config("Reference", "MRP"), &syn).unwrap();
        assert_eq!(mapping.row_col, 0);
        assert_eq!(mapping.value_cols, vec![1]);
        assert_eq!(mapping.mode, ValueMode::Flat);
    }

    #[test]
    fn test_melt_resolution() {
        let table = parse_table_html(MELT_TABLE);
        let syn = SynonymTable::default();
        let mut cfg = config("Reference", "Unit MRP");
        cfg.melt = true;
        let mapping = resolve_table(&table, &cfg, &syn).unwrap();
        assert_eq!(mapping.mode, ValueMode::Melt);
        assert_eq!(mapping.value_cols, vec![2, 3, 4]);
    }

    #[test]
    fn test_melt_falls_back_to_flat() {
        let table = parse_table_html(
            "<table><tr><th>Ref</th><th>Price</th></tr><tr><td>A1</td><td>10</td></tr></table>",
        );
        let syn = SynonymTable::default();
        let mut cfg = config("Ref", "Price");
        cfg.melt = true;
        let mapping = resolve_table(&table, &cfg, &syn).unwrap();
        assert_eq!(mapping.mode, ValueMode::Flat);
        assert_eq!(mapping.value_cols, vec![1]);
    }

    #[test]
    fn test_pin_resolution() {
        let table = parse_table_html(MELT_TABLE);
        let syn = SynonymTable::default();
        let mut cfg = config("Reference", "Unit MRP");
        cfg.match_child = Some("AC-3".to_string());
        let mapping = resolve_table(&table, &cfg, &syn).unwrap();
        assert_eq!(mapping.mode, ValueMode::Pin);
        assert_eq!(mapping.value_cols, vec![3]);
    }

    #[test]
    fn test_parent_level_row_anchor_picks_fullest_child() {
        let html = r#"<table>
<thead>
<tr><th colspan="2">Product</th><th rowspan="2">Price</th></tr>
<tr><th>Code</th><th>Note</th></tr>
</thead>
<tbody>
<tr><td>A1</td><td></td><td>10</td></tr>
<tr><td>A2</td><td></td><td>20</td></tr>
<tr><td>A3</td><td>special</td><td>30</td></tr>
</tbody>
</table>"#;
        let table = parse_table_html(html);
        let syn = SynonymTable::default();
        let mapping = resolve_table(&table, &config("Product", "Price"), &syn).unwrap();
        // "Code" is fuller than "Note" (3/3 vs 1/3).
        assert_eq!(mapping.row_col, 0);
    }

    #[test]
    fn test_unusable_table() {
        let table = parse_table_html(
            "<table><tr><th>Voltage</th><th>Current</th></tr><tr><td>230</td><td>9</td></tr></table>",
        );
        let syn = SynonymTable::default();
        assert!(resolve_table(&table, &config("Reference", "Price"), &syn).is_none());
    }

    #[test]
    fn test_unmatched_extra_is_none() {
        let table = parse_table_html(
            "<table><tr><th>Ref</th><th>Price</th></tr><tr><td>A1</td><td>10</td></tr></table>",
        );
        let syn = SynonymTable::default();
        let mut cfg = config("Ref", "Price");
        cfg.extras = vec!["Pack Qty".to_string()];
        let mapping = resolve_table(&table, &cfg, &syn).unwrap();
        assert_eq!(mapping.extra_cols, vec![None]);
    }

    #[test]
    fn test_scan_columns() {
        let md = format!("# Section\n\n{MELT_TABLE}\n");
        let pages = vec![crate::tables::parser::parse_page(1, &md)];
        let syn = SynonymTable::default();
        let scan = scan_columns(&pages, "Reference", "Unit MRP", &syn);
        assert_eq!(scan.tables_found, 1);
        assert_eq!(scan.pages_found, 1);
        assert_eq!(
            scan.value_columns,
            vec!["Unit MRP · AC-1", "Unit MRP · AC-3", "Unit MRP · AC-4"]
        );
        assert_eq!(scan.extra_columns, vec!["Description"]);
    }
}

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use super::{Cell, Column, PageTables, Table};

static TABLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<table[^>]*>.*?</table>").unwrap());
static ATX_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#+[ \t]+(.+?)[ \t]*$").unwrap());

/// Byte ranges of every `<table>…</table>` block in source order. The index
/// of a block within this list is its stable table index.
pub fn table_blocks(markdown: &str) -> Vec<(usize, usize)> {
    TABLE_BLOCK
        .find_iter(markdown)
        .map(|m| (m.start(), m.end()))
        .collect()
}

/// Replace the `index`-th table block, leaving the rest of the markdown
/// byte-identical. Returns `None` when the index is out of range.
pub fn replace_table_block(markdown: &str, index: usize, replacement: &str) -> Option<String> {
    let blocks = table_blocks(markdown);
    let &(start, end) = blocks.get(index)?;
    let mut out = String::with_capacity(markdown.len() + replacement.len());
    out.push_str(&markdown[..start]);
    out.push_str(replacement);
    out.push_str(&markdown[end..]);
    Some(out)
}

/// Markdown headings (ATX and setext) with their byte offsets, skipping
/// anything inside a table block.
pub fn collect_headings(markdown: &str) -> Vec<(usize, String)> {
    let blocks = table_blocks(markdown);
    let in_table = |pos: usize| blocks.iter().any(|&(s, e)| pos >= s && pos < e);

    let mut headings: Vec<(usize, String)> = ATX_HEADING
        .captures_iter(markdown)
        .filter_map(|c| {
            let m = c.get(0)?;
            if in_table(m.start()) {
                return None;
            }
            Some((m.start(), c.get(1)?.as_str().to_string()))
        })
        .collect();

    // Setext: a non-empty line underlined with = or - .
    let mut offset = 0;
    let mut prev: Option<(usize, &str)> = None;
    for line in markdown.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if let Some((prev_off, prev_text)) = prev {
            let t = trimmed.trim();
            let is_underline = t.len() >= 2
                && (t.chars().all(|c| c == '=') || t.chars().all(|c| c == '-'));
            if is_underline
                && !prev_text.trim().is_empty()
                && !prev_text.contains('|')
                && !prev_text.trim_start().starts_with('#')
                && !prev_text.trim_start().starts_with('<')
                && !in_table(prev_off)
            {
                headings.push((prev_off, prev_text.trim().to_string()));
            }
        }
        prev = Some((offset, trimmed));
        offset += line.len();
    }

    headings.sort_by_key(|&(pos, _)| pos);
    headings
}

/// Parse every HTML table on a page into normalized grids.
///
/// Parsing never fails: a malformed block becomes an empty `Table` and a log
/// diagnostic. Output is deterministic for identical input.
pub fn parse_page(page_num: i32, markdown: &str) -> PageTables {
    let blocks = table_blocks(markdown);
    let headings = collect_headings(markdown);

    let tables = blocks
        .iter()
        .enumerate()
        .map(|(index, &(start, end))| {
            let heading = headings
                .iter()
                .rev()
                .find(|&&(pos, _)| pos < start)
                .map(|(_, text)| text.clone());
            let mut table = parse_table_html(&markdown[start..end]);
            if table.is_empty() {
                warn!("page {page_num}: table {index} is malformed or empty");
            }
            table.index = index;
            table.heading = heading;
            table
        })
        .collect();

    PageTables {
        page_num,
        headings: headings.into_iter().map(|(_, t)| t).collect(),
        tables,
    }
}

/// Parse a single `<table>` block into a `Table` (index/heading unset).
pub fn parse_table_html(html: &str) -> Table {
    let raw_rows = tokenize_rows(html);
    build_table(&raw_rows)
}

/// Effective column count of each physical row after rowspan carry-over and
/// colspan expansion. Used by the correction loop's structural diagnosis.
pub fn row_effective_widths(html: &str) -> Vec<usize> {
    let rows = tokenize_rows(html);
    let n_cols = rows
        .iter()
        .map(|r| r.cells.iter().map(|c| c.col_span).sum::<usize>())
        .max()
        .unwrap_or(0);
    build_grid(&rows, n_cols)
        .iter()
        .map(|row| row.iter().filter(|slot| slot.is_some()).count())
        .collect()
}

// ──────────────────────────── Lenient tokenizer ────────────────────────────

#[derive(Debug, Clone)]
struct RawCell {
    text: String,
    col_span: usize,
    row_span: usize,
    is_header: bool,
}

#[derive(Debug, Clone)]
struct RawRow {
    cells: Vec<RawCell>,
    in_thead: bool,
}

/// Tokenize the tags and text of one table block. Unknown tags are ignored;
/// unclosed rows and cells are closed implicitly.
fn tokenize_rows(html: &str) -> Vec<RawRow> {
    let mut rows: Vec<RawRow> = Vec::new();
    let mut in_thead = false;
    let mut current_row: Option<Vec<RawCell>> = None;
    let mut current_cell: Option<RawCell> = None;

    let bytes = html.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] == b'<' {
            if html[pos..].starts_with("<!--") {
                pos = html[pos..]
                    .find("-->")
                    .map(|i| pos + i + 3)
                    .unwrap_or(bytes.len());
                continue;
            }
            let Some(close) = html[pos..].find('>') else {
                break;
            };
            let tag_src = &html[pos + 1..pos + close];
            pos += close + 1;

            let closing = tag_src.starts_with('/');
            let body = tag_src.trim_start_matches('/').trim_end_matches('/');
            let name = body
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_lowercase();

            match (name.as_str(), closing) {
                ("thead", false) => in_thead = true,
                ("thead", true) => {
                    finish_cell(&mut current_cell, &mut current_row);
                    finish_row(&mut current_row, in_thead, &mut rows);
                    in_thead = false;
                }
                ("table" | "tbody", true) => {
                    finish_cell(&mut current_cell, &mut current_row);
                    finish_row(&mut current_row, in_thead, &mut rows);
                }
                ("tr", false) => {
                    finish_cell(&mut current_cell, &mut current_row);
                    finish_row(&mut current_row, in_thead, &mut rows);
                    current_row = Some(Vec::new());
                }
                ("tr", true) => {
                    finish_cell(&mut current_cell, &mut current_row);
                    finish_row(&mut current_row, in_thead, &mut rows);
                }
                ("th" | "td", false) => {
                    finish_cell(&mut current_cell, &mut current_row);
                    if current_row.is_none() {
                        current_row = Some(Vec::new());
                    }
                    current_cell = Some(RawCell {
                        text: String::new(),
                        col_span: parse_span_attr(body, "colspan"),
                        row_span: parse_span_attr(body, "rowspan"),
                        is_header: name == "th",
                    });
                }
                ("th" | "td", true) => finish_cell(&mut current_cell, &mut current_row),
                ("br", false) => {
                    if let Some(cell) = current_cell.as_mut() {
                        cell.text.push(' ');
                    }
                }
                _ => {}
            }
        } else {
            let next_tag = html[pos..].find('<').map(|i| pos + i).unwrap_or(bytes.len());
            if let Some(cell) = current_cell.as_mut() {
                cell.text.push_str(&html[pos..next_tag]);
            }
            pos = next_tag;
        }
    }

    finish_cell(&mut current_cell, &mut current_row);
    finish_row(&mut current_row, in_thead, &mut rows);
    rows
}

fn finish_cell(cell: &mut Option<RawCell>, row: &mut Option<Vec<RawCell>>) {
    if let Some(mut cell) = cell.take() {
        cell.text = collapse_text(&decode_entities(&cell.text));
        row.get_or_insert_with(Vec::new).push(cell);
    }
}

fn finish_row(row: &mut Option<Vec<RawCell>>, in_thead: bool, rows: &mut Vec<RawRow>) {
    if let Some(cells) = row.take() {
        rows.push(RawRow { cells, in_thead });
    }
}

fn parse_span_attr(tag_body: &str, attr: &str) -> usize {
    let lower = tag_body.to_ascii_lowercase();
    let Some(idx) = lower.find(attr) else {
        return 1;
    };
    let rest = &tag_body[idx + attr.len()..];
    let rest = rest.trim_start();
    let Some(rest) = rest.strip_prefix('=') else {
        return 1;
    };
    let rest = rest.trim_start().trim_start_matches(['"', '\'']);
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().filter(|&n| n >= 1).unwrap_or(1)
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest[..rest.len().min(10)].find(';') else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix('#')
                .and_then(|num| {
                    if let Some(hex) = num.strip_prefix(['x', 'X']) {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        num.parse().ok()
                    }
                })
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn collapse_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ──────────────────────────── Grid construction ────────────────────────────

#[derive(Debug, Clone)]
struct GridCell {
    text: String,
    row_span: usize,
    col_span: usize,
}

/// Expand raw rows into a physical grid: a spanning cell occupies every
/// covered slot, carrying its source span dimensions. Missing trailing cells
/// stay `None` and are padded later.
fn build_grid(rows: &[RawRow], n_cols: usize) -> Vec<Vec<Option<GridCell>>> {
    let n_rows = rows.len();
    let mut grid: Vec<Vec<Option<GridCell>>> = vec![vec![None; n_cols]; n_rows];

    for (ri, row) in rows.iter().enumerate() {
        let mut ci = 0;
        for cell in &row.cells {
            while ci < n_cols && grid[ri][ci].is_some() {
                ci += 1;
            }
            if ci >= n_cols {
                break;
            }
            for dr in 0..cell.row_span {
                for dc in 0..cell.col_span {
                    let (r, c) = (ri + dr, ci + dc);
                    if r < n_rows && c < n_cols && grid[r][c].is_none() {
                        grid[r][c] = Some(GridCell {
                            text: cell.text.clone(),
                            row_span: cell.row_span,
                            col_span: cell.col_span,
                        });
                    }
                }
            }
            ci += cell.col_span;
        }
    }

    grid
}

fn build_table(rows: &[RawRow]) -> Table {
    let empty = Table {
        index: 0,
        columns: Vec::new(),
        rows: Vec::new(),
        heading: None,
    };
    if rows.is_empty() {
        return empty;
    }

    let n_cols = rows
        .iter()
        .map(|r| r.cells.iter().map(|c| c.col_span).sum::<usize>())
        .max()
        .unwrap_or(0);
    if n_cols == 0 {
        return empty;
    }

    let grid = build_grid(rows, n_cols);

    // The first up-to-two physical rows are header rows: explicit <thead>
    // rows, or leading all-<th> rows; plain tables get a single header row.
    let header_count = rows
        .iter()
        .take(2)
        .take_while(|r| r.in_thead || (!r.cells.is_empty() && r.cells.iter().all(|c| c.is_header)))
        .count()
        .max(1)
        .min(rows.len());

    let columns = (0..n_cols)
        .map(|c| {
            let parent = grid[0][c]
                .as_ref()
                .map(|g| g.text.clone())
                .unwrap_or_default();
            let child = if header_count >= 2 {
                grid[1][c]
                    .as_ref()
                    .map(|g| g.text.clone())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| parent.clone())
            } else {
                parent.clone()
            };
            Column::new(parent, child)
        })
        .collect();

    let data_rows = grid[header_count..]
        .iter()
        .enumerate()
        .map(|(ri, grid_row)| {
            grid_row
                .iter()
                .enumerate()
                .map(|(ci, slot)| match slot {
                    Some(g) => Cell {
                        row: ri,
                        col: ci,
                        text: g.text.clone(),
                        row_span: g.row_span as u32,
                        col_span: g.col_span as u32,
                    },
                    None => Cell {
                        row: ri,
                        col: ci,
                        text: String::new(),
                        row_span: 1,
                        col_span: 1,
                    },
                })
                .collect()
        })
        .collect();

    Table {
        index: 0,
        columns,
        rows: data_rows,
        heading: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MELT_TABLE: &str = r#"<table>
<thead>
<tr><th rowspan="2">Reference</th><th rowspan="2">Description</th><th colspan="3">Unit MRP</th></tr>
<tr><th>AC-1</th><th>AC-3</th><th>AC-4</th></tr>
</thead>
<tbody>
<tr><td>LC1D09</td><td>Contactor 9A</td><td>1,200</td><td>1,350</td><td>1,500</td></tr>
<tr><td>LC1D12</td><td>Contactor 12A</td><td>1,400</td><td>1,550</td><td>1,700</td></tr>
</tbody>
</table>"#;

    #[test]
    fn test_two_row_header_parent_child() {
        let table = parse_table_html(MELT_TABLE);
        assert_eq!(table.columns.len(), 5);

        assert_eq!(table.columns[0].parent, "Reference");
        assert_eq!(table.columns[0].child, "Reference");
        assert_eq!(table.columns[0].display(), "Reference");

        assert_eq!(table.columns[2].parent, "Unit MRP");
        assert_eq!(table.columns[2].child, "AC-1");
        assert_eq!(table.columns[4].display(), "Unit MRP · AC-4");

        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][0].text, "LC1D09");
        assert_eq!(table.rows[0][3].text, "1,350");
    }

    #[test]
    fn test_single_header_row_parent_equals_child() {
        let html = "<table><tr><th>Ref</th><th>Price</th></tr><tr><td>A1</td><td>10</td></tr></table>";
        let table = parse_table_html(html);
        assert_eq!(table.columns[0].parent, "Ref");
        assert_eq!(table.columns[0].child, "Ref");
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn test_body_rowspan_fills_covered_slots() {
        let html = r#"<table>
<tr><th>Frame</th><th>Ref</th><th>Price</th></tr>
<tr><td rowspan="2">F1</td><td>A1</td><td>10</td></tr>
<tr><td>A2</td><td>20</td></tr>
</table>"#;
        let table = parse_table_html(html);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][0].text, "F1");
        assert_eq!(table.rows[1][0].text, "F1");
        assert_eq!(table.rows[1][0].row_span, 2);
        assert_eq!(table.rows[1][1].text, "A2");
        assert_eq!(table.rows[1][2].text, "20");
    }

    #[test]
    fn test_missing_trailing_cells_padded() {
        let html = "<table><tr><th>A</th><th>B</th><th>C</th></tr><tr><td>1</td></tr></table>";
        let table = parse_table_html(html);
        assert_eq!(table.rows[0].len(), 3);
        assert_eq!(table.rows[0][1].text, "");
        assert_eq!(table.rows[0][2].text, "");
    }

    #[test]
    fn test_colspan_in_body() {
        let html = r#"<table>
<tr><th>A</th><th>B</th><th>C</th></tr>
<tr><td colspan="2">wide</td><td>x</td></tr>
</table>"#;
        let table = parse_table_html(html);
        assert_eq!(table.rows[0][0].text, "wide");
        assert_eq!(table.rows[0][1].text, "wide");
        assert_eq!(table.rows[0][1].col_span, 2);
        assert_eq!(table.rows[0][2].text, "x");
    }

    #[test]
    fn test_entities_and_whitespace() {
        let html = "<table><tr><th>P &amp; Q</th></tr><tr><td>  a\n  b&nbsp;c </td></tr></table>";
        let table = parse_table_html(html);
        assert_eq!(table.columns[0].parent, "P & Q");
        assert_eq!(table.rows[0][0].text, "a b c");
    }

    #[test]
    fn test_malformed_is_empty_not_panic() {
        let table = parse_table_html("<table><tr><td>unclosed");
        // Implicit close still yields the one cell.
        assert_eq!(table.columns.len(), 1);

        let table = parse_table_html("<table></table>");
        assert!(table.is_empty());
    }

    #[test]
    fn test_deterministic() {
        let a = parse_table_html(MELT_TABLE);
        let b = parse_table_html(MELT_TABLE);
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }

    #[test]
    fn test_table_blocks_order_and_offsets() {
        let md = "intro\n<table><tr><td>1</td></tr></table>\nmiddle\n<TABLE><tr><td>2</td></tr></TABLE>\n";
        let blocks = table_blocks(md);
        assert_eq!(blocks.len(), 2);
        assert!(md[blocks[0].0..blocks[0].1].contains('1'));
        assert!(md[blocks[1].0..blocks[1].1].contains('2'));
    }

    #[test]
    fn test_replace_table_block_is_surgical() {
        let md = "before\n<table><tr><td>1</td></tr></table>\nbetween\n<table><tr><td>2</td></tr></table>\nafter";
        let out = replace_table_block(md, 1, "<table><tr><td>X</td></tr></table>").unwrap();
        assert!(out.starts_with("before\n<table><tr><td>1</td></tr></table>\nbetween\n"));
        assert!(out.ends_with("\nafter"));
        assert!(out.contains("<td>X</td>"));
        assert!(!out.contains("<td>2</td>"));
        assert!(replace_table_block(md, 5, "<table></table>").is_none());
    }

    #[test]
    fn test_headings_atx_and_setext() {
        let md = "# Contactors\n\nText\n\nMotor Starters\n---\n\n<table><tr><td>|</td></tr></table>\n";
        let headings = collect_headings(md);
        let texts: Vec<&str> = headings.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["Contactors", "Motor Starters"]);
    }

    #[test]
    fn test_parse_page_attaches_nearest_heading() {
        let md = "# Section A\n\n<table><tr><th>R</th></tr><tr><td>x</td></tr></table>\n\n## Section B\n\n<table><tr><th>R</th></tr><tr><td>y</td></tr></table>\n";
        let page = parse_page(3, md);
        assert_eq!(page.page_num, 3);
        assert_eq!(page.tables.len(), 2);
        assert_eq!(page.tables[0].index, 0);
        assert_eq!(page.tables[0].heading.as_deref(), Some("Section A"));
        assert_eq!(page.tables[1].heading.as_deref(), Some("Section B"));
        assert_eq!(page.headings, vec!["Section A", "Section B"]);
    }

    #[test]
    fn test_thead_three_rows_caps_at_two() {
        let html = r#"<table><thead>
<tr><th>P</th></tr>
<tr><th>C</th></tr>
<tr><th>extra</th></tr>
</thead><tbody><tr><td>v</td></tr></tbody></table>"#;
        let table = parse_table_html(html);
        assert_eq!(table.columns[0].parent, "P");
        assert_eq!(table.columns[0].child, "C");
        // Third thead row falls through to the data grid.
        assert_eq!(table.rows.len(), 2);
    }
}

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::ApiError;
use crate::ocr::client::{ChatClient, CORRECTION_TIMEOUT};
use crate::ocr::{image_data_url, ChatMessage};
use crate::tables::parser::{collect_headings, row_effective_widths, table_blocks};

const CORRECTION_MAX_TOKENS: u32 = 8192;

static TABLE_IN_RESPONSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<table[^>]*>.*?</table>").unwrap());

/// System prompt for the vision re-OCR. Enumerates the allowed constructs and
/// forbids prose; the original HTML is deliberately not sent to avoid
/// anchoring the model on the bad read.
const VLM_SYSTEM_PROMPT: &str = "You transcribe pricelist tables from page images. \
Output exactly one HTML table and nothing else: no prose, no markdown fences, no commentary. \
Allowed tags: <table>, <thead>, <tbody>, <tr>, <th>, <td>. \
Use rowspan and colspan attributes where the image shows merged cells. \
Read every cell value exactly as printed.";

/// Outcome of a validation round-trip.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionOutcome {
    pub original: String,
    pub corrected: String,
    pub changed: bool,
}

/// Structural health report of one table, sent to the text LLM as context.
#[derive(Debug, Clone, Serialize)]
pub struct TableDiagnosis {
    pub row_widths: Vec<usize>,
    pub modal_width: usize,
    /// Rows whose effective width differs from the mode.
    pub flagged_rows: Vec<usize>,
}

pub fn diagnose_table(html: &str) -> TableDiagnosis {
    let row_widths = row_effective_widths(html);

    let mut counts: HashMap<usize, usize> = HashMap::new();
    for &w in &row_widths {
        *counts.entry(w).or_insert(0) += 1;
    }
    let modal_width = counts
        .iter()
        .max_by_key(|&(width, count)| (*count, *width))
        .map(|(&width, _)| width)
        .unwrap_or(0);

    let flagged_rows = row_widths
        .iter()
        .enumerate()
        .filter(|&(_, &w)| w != modal_width)
        .map(|(i, _)| i)
        .collect();

    TableDiagnosis {
        row_widths,
        modal_width,
        flagged_rows,
    }
}

/// Cell-text equivalence: lowercased, whitespace-normalized text content.
/// Equivalent tables mean the correction changed nothing worth applying.
pub fn tables_equivalent(a: &str, b: &str) -> bool {
    cell_text_signature(a) == cell_text_signature(b)
}

fn cell_text_signature(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn extract_table_html(response: &str) -> Option<String> {
    TABLE_IN_RESPONSE
        .find(response)
        .map(|m| m.as_str().to_string())
}

fn table_block_at(markdown: &str, table_index: usize) -> Result<(usize, String), ApiError> {
    let blocks = table_blocks(markdown);
    let &(start, end) = blocks
        .get(table_index)
        .ok_or_else(|| ApiError::NotFound(format!("table index {table_index} out of range")))?;
    Ok((start, markdown[start..end].to_string()))
}

/// Re-OCR one table from the page image with a vision model.
pub async fn validate_vlm(
    vlm: &ChatClient,
    page_png: &[u8],
    markdown: &str,
    table_index: usize,
) -> Result<CorrectionOutcome, ApiError> {
    let (start, original) = table_block_at(markdown, table_index)?;

    let heading = collect_headings(markdown)
        .into_iter()
        .rev()
        .find(|&(pos, _)| pos < start)
        .map(|(_, text)| text);

    let hint = match heading {
        Some(h) => format!("The table sits under the heading/section: \"{h}\"."),
        None => "Transcribe the main table on the page.".to_string(),
    };
    let prompt = format!(
        "{hint}\nRead that table directly from the image and output it as one clean HTML table."
    );

    let messages = vec![
        ChatMessage::system(VLM_SYSTEM_PROMPT),
        ChatMessage::user_with_image(&prompt, image_data_url(page_png, "image/png")),
    ];

    let response = vlm
        .complete(messages, CORRECTION_MAX_TOKENS, 0.0, CORRECTION_TIMEOUT)
        .await
        .map_err(|e| ApiError::Upstream(format!("VLM error: {e}")))?;

    let corrected = extract_table_html(&response)
        .ok_or_else(|| ApiError::Upstream("VLM response contains no table".to_string()))?;

    let changed = !tables_equivalent(&original, &corrected);
    Ok(CorrectionOutcome {
        original,
        corrected,
        changed,
    })
}

/// Repair one table with a text LLM, guided by a structural diagnosis and
/// the surrounding page markdown.
pub async fn validate_llm(
    llm: &ChatClient,
    markdown: &str,
    table_index: usize,
) -> Result<CorrectionOutcome, ApiError> {
    let (_, original) = table_block_at(markdown, table_index)?;
    let diagnosis = diagnose_table(&original);

    let diagnosis_text = if diagnosis.flagged_rows.is_empty() {
        "Every row has the modal column count; check cell contents and merged-cell attributes."
            .to_string()
    } else {
        format!(
            "Modal column count is {}. Rows with a different effective width (0-based): {:?}. Row widths: {:?}.",
            diagnosis.modal_width, diagnosis.flagged_rows, diagnosis.row_widths
        )
    };

    let prompt = format!(
        "This HTML table was produced by OCR of a pricelist page and may have structural defects.\n\n\
         Structural diagnosis: {diagnosis_text}\n\n\
         Table:\n{original}\n\n\
         Full page markdown for context:\n{markdown}\n\n\
         Output the corrected table as one HTML <table> and nothing else. \
         Use only <table>, <thead>, <tbody>, <tr>, <th>, <td> with rowspan/colspan. \
         Preserve every cell value that is already correct."
    );

    let response = llm
        .complete(
            vec![ChatMessage::user(prompt)],
            CORRECTION_MAX_TOKENS,
            0.0,
            CORRECTION_TIMEOUT,
        )
        .await
        .map_err(|e| ApiError::Upstream(format!("LLM error: {e}")))?;

    let corrected = extract_table_html(&response)
        .ok_or_else(|| ApiError::Upstream("LLM response contains no table".to_string()))?;

    let changed = !tables_equivalent(&original, &corrected);
    Ok(CorrectionOutcome {
        original,
        corrected,
        changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnosis_flags_short_row() {
        let html = r#"<table>
<tr><th>A</th><th>B</th><th>C</th></tr>
<tr><td>1</td><td>2</td><td>3</td></tr>
<tr><td>1</td><td>2</td></tr>
<tr><td>1</td><td>2</td><td>3</td></tr>
</table>"#;
        let d = diagnose_table(html);
        assert_eq!(d.modal_width, 3);
        assert_eq!(d.flagged_rows, vec![2]);
    }

    #[test]
    fn test_diagnosis_rowspan_carry_over_counts() {
        // Row 2 has only two cells but the rowspan from row 1 completes it.
        let html = r#"<table>
<tr><th>A</th><th>B</th><th>C</th></tr>
<tr><td rowspan="2">x</td><td>2</td><td>3</td></tr>
<tr><td>2</td><td>3</td></tr>
</table>"#;
        let d = diagnose_table(html);
        assert_eq!(d.row_widths, vec![3, 3, 3]);
        assert!(d.flagged_rows.is_empty());
    }

    #[test]
    fn test_equivalence_ignores_markup_and_case() {
        let a = "<table><tr><td>LC1D09</td><td>1,200</td></tr></table>";
        let b = "<table>\n<tbody>\n<tr>\n<td> lc1d09 </td>\n<td>1,200</td>\n</tr>\n</tbody>\n</table>";
        assert!(tables_equivalent(a, b));
    }

    #[test]
    fn test_equivalence_detects_cell_change() {
        let a = "<table><tr><td>LC1D09</td><td>1,200</td></tr></table>";
        let b = "<table><tr><td>LC1D09</td><td>1,300</td></tr></table>";
        assert!(!tables_equivalent(a, b));
    }

    #[test]
    fn test_extract_table_html_from_prose() {
        let response = "Here is the corrected table:\n\n<table><tr><td>x</td></tr></table>\n\nDone.";
        assert_eq!(
            extract_table_html(response).unwrap(),
            "<table><tr><td>x</td></tr></table>"
        );
        assert!(extract_table_html("no table here").is_none());
    }

    #[test]
    fn test_table_block_at_out_of_range() {
        let md = "<table><tr><td>1</td></tr></table>";
        assert!(table_block_at(md, 0).is_ok());
        assert!(matches!(table_block_at(md, 1), Err(ApiError::NotFound(_))));
    }
}

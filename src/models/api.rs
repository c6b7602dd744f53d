use serde::{Deserialize, Serialize};

use crate::models::upload::PageState;

// ──────────────────────────── Auth ────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    pub workspace_id: String,
}

// ──────────────────────────── Uploads ────────────────────────────

#[derive(Debug, Serialize)]
pub struct UploadCreated {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUploadRequest {
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub month: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct PageStateEntry {
    pub page_num: i32,
    pub state: PageState,
}

// ──────────────────────────── Extraction config ────────────────────────────

/// A closed extraction configuration record. Unknown fields are rejected so a
/// stale client cannot silently send settings the server ignores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractionConfig {
    pub row_anchor: String,
    pub value_anchor: String,
    #[serde(default)]
    pub extras: Vec<String>,
    #[serde(default)]
    pub include_page: bool,
    #[serde(default)]
    pub include_heading: bool,
    /// Unpivot all child columns under the matching value parent.
    #[serde(default)]
    pub melt: bool,
    /// Pin the value column to one specific child header.
    #[serde(default)]
    pub match_child: Option<String>,
    /// Fill the value column down over empty cells (flat mode only).
    #[serde(default)]
    pub fill_down_value: Option<bool>,
}

impl ExtractionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.row_anchor.trim().is_empty() {
            return Err("row_anchor must not be empty".to_string());
        }
        if self.value_anchor.trim().is_empty() {
            return Err("value_anchor must not be empty".to_string());
        }
        Ok(())
    }
}

// ──────────────────────────── Extraction result ────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    NonNumericInNumericColumn,
    OutlierLength,
    RarePattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellFlag {
    pub row: usize,
    pub col: usize,
    pub reason: FlagReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub flags: Vec<CellFlag>,
    pub row_count: usize,
    pub page_count: usize,
    pub flagged_count: usize,
    /// For each output row, the source (page_num, table_index).
    pub row_table_indices: Vec<(i32, usize)>,
}

// ──────────────────────────── Scan ────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub row_anchor: String,
    pub value_anchor: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ScanResponse {
    pub tables_found: usize,
    pub pages_found: usize,
    pub value_columns: Vec<String>,
    pub extra_columns: Vec<String>,
}

// ──────────────────────────── Table correction ────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionMethod {
    Vlm,
    Llm,
}

#[derive(Debug, Deserialize)]
pub struct ValidateTableRequest {
    pub table_index: usize,
    pub method: CorrectionMethod,
}

#[derive(Debug, Serialize)]
pub struct ValidateTableResponse {
    pub original: String,
    pub corrected: String,
    /// False when the re-OCR'd table is cell-equivalent to the original.
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct ApplyCorrectionRequest {
    pub table_index: usize,
    pub corrected_table: String,
}

// ──────────────────────────── Schemas ────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSchemaRequest {
    pub company: String,
    pub name: String,
    pub config: ExtractionConfig,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSchemaRequest {
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Option<ExtractionConfig>,
}

// ──────────────────────────── Compare ────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CompareRequest {
    pub base_upload_id: String,
    pub target_upload_id: String,
    #[serde(default)]
    pub config: Option<ExtractionConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_minimal() {
        let cfg: ExtractionConfig =
            serde_json::from_str(r#"{"row_anchor": "Reference", "value_anchor": "Unit MRP"}"#)
                .unwrap();
        assert_eq!(cfg.row_anchor, "Reference");
        assert!(cfg.extras.is_empty());
        assert!(!cfg.melt);
        assert!(cfg.match_child.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_unknown_fields() {
        let result: Result<ExtractionConfig, _> = serde_json::from_str(
            r#"{"row_anchor": "Ref", "value_anchor": "Price", "bogus": true}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_config_validate_empty_anchor() {
        let cfg = ExtractionConfig {
            row_anchor: "  ".to_string(),
            value_anchor: "Price".to_string(),
            extras: vec![],
            include_page: false,
            include_heading: false,
            melt: false,
            match_child: None,
            fill_down_value: None,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_flag_reason_serialization() {
        let json = serde_json::to_string(&FlagReason::NonNumericInNumericColumn).unwrap();
        assert_eq!(json, "\"non_numeric_in_numeric_column\"");
        let json = serde_json::to_string(&FlagReason::OutlierLength).unwrap();
        assert_eq!(json, "\"outlier_length\"");
    }

    #[test]
    fn test_correction_method_lowercase() {
        let m: CorrectionMethod = serde_json::from_str("\"vlm\"").unwrap();
        assert_eq!(m, CorrectionMethod::Vlm);
        let m: CorrectionMethod = serde_json::from_str("\"llm\"").unwrap();
        assert_eq!(m, CorrectionMethod::Llm);
    }
}

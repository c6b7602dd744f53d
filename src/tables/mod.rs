pub mod parser;

use serde::Serialize;

/// One slot of the physical cell grid. Spanning source cells occupy every
/// covered slot with the same text but remember their originating spans.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    pub row: usize,
    pub col: usize,
    pub text: String,
    pub row_span: u32,
    pub col_span: u32,
}

/// Column identity over a two-level header grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub parent: String,
    pub child: String,
    pub norm_parent: String,
    pub norm_child: String,
}

impl Column {
    pub fn new(parent: String, child: String) -> Self {
        let norm_parent = normalize(&parent);
        let norm_child = normalize(&child);
        Self {
            parent,
            child,
            norm_parent,
            norm_child,
        }
    }

    pub fn display(&self) -> String {
        if self.parent == self.child {
            self.parent.clone()
        } else {
            format!("{} · {}", self.parent, self.child)
        }
    }
}

/// A parsed HTML table: data rows over a (parent, child) column grid.
#[derive(Debug, Clone, Serialize)]
pub struct Table {
    /// Position of the source `<table>` block within the page markdown.
    pub index: usize,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Cell>>,
    /// Nearest preceding heading on the page, if any.
    pub heading: Option<String>,
}

impl Table {
    /// A table with headers but no usable body still participates in column
    /// discovery; a fully empty one does not.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty()
    }
}

/// All tables of one page plus its heading context.
#[derive(Debug, Clone, Serialize)]
pub struct PageTables {
    pub page_num: i32,
    pub headings: Vec<String>,
    pub tables: Vec<Table>,
}

/// Normalize a header fragment for matching: lowercase, drop
/// non-alphanumeric, collapse whitespace.
pub fn normalize(name: &str) -> String {
    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Unit MRP [₹]"), "unit mrp");
        assert_eq!(normalize("  Cat. No. "), "cat no");
        assert_eq!(normalize("Reference"), "reference");
        assert_eq!(normalize("AC-3"), "ac 3");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_column_display() {
        let flat = Column::new("Reference".into(), "Reference".into());
        assert_eq!(flat.display(), "Reference");

        let nested = Column::new("Unit MRP".into(), "AC-3".into());
        assert_eq!(nested.display(), "Unit MRP · AC-3");
    }
}

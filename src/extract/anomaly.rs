use std::collections::HashMap;

use crate::models::api::{CellFlag, FlagReason};

use super::resolver::is_blank;

/// Fraction of parseable cells above which a column counts as numeric.
pub const NUMERIC_COLUMN_RATIO: f64 = 0.8;
/// Length outlier threshold in standard deviations.
pub const OUTLIER_SIGMA: f64 = 3.0;
/// Below this length stdev the outlier check is off (uniform columns).
pub const STDEV_FLOOR: f64 = 2.0;
/// The top value must cover this share of a column for rare-pattern flags.
pub const TOP_VALUE_DOMINANCE: f64 = 0.5;
/// Frequency profiling needs a minimum sample to be meaningful.
const MIN_FREQ_SAMPLE: usize = 5;

/// Metadata columns are not profiled.
const SKIP_COLUMNS: [&str; 3] = ["page", "heading", "variant"];

/// Parse a decimal number with comma or dot as the decimal separator and
/// optional currency symbols or spaces.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let mut s: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '₹' | '$' | '€' | '£'))
        .collect();
    if s.is_empty() || s == "-" {
        return None;
    }

    match (s.rfind(','), s.rfind('.')) {
        (Some(comma), Some(dot)) => {
            if comma > dot {
                // 1.234,56 — dot thousands, comma decimal
                s = s.replace('.', "").replace(',', ".");
            } else {
                // 1,234.56 — comma thousands
                s = s.replace(',', "");
            }
        }
        (Some(_), None) => {
            let parts: Vec<&str> = s.split(',').collect();
            if parts.len() == 2 && parts[1].len() != 3 {
                // 123,45 — comma decimal
                s = s.replace(',', ".");
            } else {
                // 1,200 or 1,200,000 — comma thousands
                s = s.replace(',', "");
            }
        }
        _ => {}
    }

    s.parse::<f64>().ok()
}

struct ColumnProfile {
    numeric_fraction: f64,
    len_mean: f64,
    len_stdev: f64,
    freq: HashMap<String, usize>,
    top_dominates: bool,
    sample: usize,
}

fn profile_column(values: &[&str]) -> Option<ColumnProfile> {
    if values.is_empty() {
        return None;
    }

    let n = values.len() as f64;
    let numeric = values.iter().filter(|v| parse_decimal(v).is_some()).count();

    let lengths: Vec<f64> = values.iter().map(|v| v.chars().count() as f64).collect();
    let len_mean = lengths.iter().sum::<f64>() / n;
    let variance = lengths.iter().map(|l| (l - len_mean).powi(2)).sum::<f64>() / n;

    let mut freq: HashMap<String, usize> = HashMap::new();
    for v in values {
        *freq.entry(v.to_lowercase()).or_insert(0) += 1;
    }
    let top = freq.values().copied().max().unwrap_or(0);

    Some(ColumnProfile {
        numeric_fraction: numeric as f64 / n,
        len_mean,
        len_stdev: variance.sqrt(),
        top_dominates: top as f64 / n >= TOP_VALUE_DOMINANCE,
        freq,
        sample: values.len(),
    })
}

fn check_cell(value: &str, profile: &ColumnProfile) -> Option<FlagReason> {
    if profile.numeric_fraction >= NUMERIC_COLUMN_RATIO && parse_decimal(value).is_none() {
        return Some(FlagReason::NonNumericInNumericColumn);
    }

    let len = value.chars().count() as f64;
    if profile.len_stdev >= STDEV_FLOOR
        && (len - profile.len_mean).abs() > OUTLIER_SIGMA * profile.len_stdev
    {
        return Some(FlagReason::OutlierLength);
    }

    if profile.sample >= MIN_FREQ_SAMPLE
        && profile.top_dominates
        && profile.freq.get(&value.to_lowercase()).copied() == Some(1)
    {
        return Some(FlagReason::RarePattern);
    }

    None
}

/// Profile each data column of an extraction and flag anomalous cells.
/// Flags are advisory; rows are never dropped.
pub fn detect_anomalies(columns: &[String], rows: &[Vec<String>]) -> Vec<CellFlag> {
    if rows.is_empty() || columns.is_empty() {
        return Vec::new();
    }

    let profiles: Vec<Option<ColumnProfile>> = columns
        .iter()
        .enumerate()
        .map(|(ci, name)| {
            if SKIP_COLUMNS.contains(&name.to_lowercase().as_str()) {
                return None;
            }
            let values: Vec<&str> = rows
                .iter()
                .filter_map(|r| r.get(ci).map(|v| v.as_str()))
                .filter(|v| !is_blank(v))
                .collect();
            profile_column(&values)
        })
        .collect();

    let mut flags = Vec::new();
    for (ri, row) in rows.iter().enumerate() {
        for (ci, profile) in profiles.iter().enumerate() {
            let (Some(profile), Some(value)) = (profile, row.get(ci)) else {
                continue;
            };
            if is_blank(value) {
                continue;
            }
            if let Some(reason) = check_cell(value, profile) {
                flags.push(CellFlag {
                    row: ri,
                    col: ci,
                    reason,
                });
            }
        }
    }

    flags
}

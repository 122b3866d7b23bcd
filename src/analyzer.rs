use std::collections::HashMap;

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    // Guards against numeric-only values being read as epoch dates: a date
    // must carry a 4-digit year or a d/d fragment.
    static ref DATE_SHAPE: Regex = Regex::new(r"\d{4}|\d{1,2}/\d{1,2}").unwrap();
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%m/%d/%y",
    "%d-%m-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
];

/// Fraction of well-formed values a column needs before it is typed as
/// date or numeric. The comparison is strict: exactly 70% is not enough.
const TYPE_THRESHOLD: f64 = 0.7;

/// Inferred semantic type of a spreadsheet column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Empty,
    Date,
    Numeric,
    Categorical,
}

/// Descriptive statistics for a numeric column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

/// Per-column profile of one spreadsheet snapshot
///
/// Derived fresh on every ingestion and never persisted on its own; the
/// ordered column lists preserve the original header order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub types: HashMap<String, ColumnType>,
    pub numeric: Vec<String>,
    pub categorical: Vec<String>,
    pub dates: Vec<String>,
    /// Percentage of missing cells per column, rounded.
    pub missing_values: HashMap<String, u32>,
    pub descriptive_stats: HashMap<String, ColumnStats>,
    /// Business domain guessed from header keywords.
    pub domain: String,
    pub domain_confidence: u32,
    pub total_rows: usize,
    pub total_columns: usize,
}

const DOMAIN_KEYWORDS: &[(&str, &[&str])] = &[
    ("sales", &["sales", "revenue", "profit", "order", "customer", "price", "amount", "total"]),
    ("hr", &["employee", "hire_date", "salary", "department", "attrition", "staff", "worker"]),
    ("finance", &["expense", "budget", "cost", "account", "financial", "income", "expenditure"]),
    ("operations", &["inventory", "shipment", "delivery", "stock", "supplier", "logistics"]),
    ("marketing", &["campaign", "impressions", "clicks", "leads", "conversion", "ads", "ctr"]),
];

/// Profile every column of a parsed spreadsheet
///
/// Classification per column, over its non-empty values:
/// - `empty` when the column has no values at all;
/// - `date` when more than 70% parse as calendar dates and look date-shaped;
/// - `numeric` when more than 70% parse as finite numbers;
/// - `categorical` otherwise.
pub fn analyze(headers: &[String], rows: &[Vec<String>]) -> ColumnProfile {
    let mut profile = ColumnProfile {
        types: HashMap::new(),
        numeric: Vec::new(),
        categorical: Vec::new(),
        dates: Vec::new(),
        missing_values: HashMap::new(),
        descriptive_stats: HashMap::new(),
        domain: "general".to_string(),
        domain_confidence: 0,
        total_rows: rows.len(),
        total_columns: headers.len(),
    };

    let mut domain_scores: HashMap<&str, u32> = HashMap::new();

    for (col_index, header) in headers.iter().enumerate() {
        let header_lower = header.to_lowercase();
        for (domain, keywords) in DOMAIN_KEYWORDS {
            for keyword in *keywords {
                if header_lower.contains(keyword) {
                    *domain_scores.entry(domain).or_insert(0) += 1;
                }
            }
        }

        let values: Vec<&str> = rows
            .iter()
            .filter_map(|row| row.get(col_index))
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
            .collect();

        let missing = rows.len().saturating_sub(values.len());
        let missing_pct = if rows.is_empty() {
            0
        } else {
            ((missing as f64 / rows.len() as f64) * 100.0).round() as u32
        };
        profile.missing_values.insert(header.clone(), missing_pct);

        if values.is_empty() {
            profile.types.insert(header.clone(), ColumnType::Empty);
            continue;
        }

        let total = values.len() as f64;
        let date_count = values.iter().filter(|v| looks_like_date(v)).count();
        let numeric_values: Vec<f64> = values
            .iter()
            .filter_map(|v| parse_number(v))
            .collect();

        if date_count as f64 / total > TYPE_THRESHOLD {
            profile.types.insert(header.clone(), ColumnType::Date);
            profile.dates.push(header.clone());
        } else if numeric_values.len() as f64 / total > TYPE_THRESHOLD {
            profile.types.insert(header.clone(), ColumnType::Numeric);
            profile.numeric.push(header.clone());
            if let Some(stats) = descriptive_stats(&numeric_values) {
                profile.descriptive_stats.insert(header.clone(), stats);
            }
        } else {
            profile.types.insert(header.clone(), ColumnType::Categorical);
            profile.categorical.push(header.clone());
        }
    }

    let mut best: Option<(&str, u32)> = None;
    for (&domain, &score) in &domain_scores {
        let better = match best {
            None => true,
            // Ties resolve alphabetically so the guess is deterministic.
            Some((d, s)) => score > s || (score == s && domain < d),
        };
        if better {
            best = Some((domain, score));
        }
    }
    if let Some((domain, score)) = best {
        if score > 0 && !headers.is_empty() {
            profile.domain = domain.to_string();
            profile.domain_confidence =
                ((score as f64 / headers.len() as f64) * 100.0).round() as u32;
        }
    }

    profile
}

/// True when the value parses as a calendar date and matches the date shape.
fn looks_like_date(value: &str) -> bool {
    if !DATE_SHAPE.is_match(value) {
        return false;
    }
    if chrono::DateTime::parse_from_rfc3339(value).is_ok() {
        return true;
    }
    DATE_FORMATS
        .iter()
        .any(|fmt| NaiveDate::parse_from_str(value, fmt).is_ok())
}

/// Parse a cell as a finite number.
pub fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn descriptive_stats(values: &[f64]) -> Option<ColumnStats> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));

    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    let mean = sum / count as f64;
    let median = sorted[count / 2];
    let variance = sorted.iter().map(|n| (n - mean).powi(2)).sum::<f64>() / count as f64;

    Some(ColumnStats {
        count,
        mean: round2(mean),
        median: round2(median),
        std: round2(variance.sqrt()),
        min: sorted[0],
        max: sorted[count - 1],
        sum: round2(sum),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(values: &[&str]) -> (Vec<String>, Vec<Vec<String>>) {
        let headers = vec!["Col".to_string()];
        let rows = values.iter().map(|v| vec![v.to_string()]).collect();
        (headers, rows)
    }

    #[test]
    fn classifies_dates_with_year_or_slash_fragments() {
        let (headers, rows) = column(&[
            "2024-01-01",
            "2024-02-01",
            "2024-03-01",
            "03/04/2024",
            "not a date",
        ]);
        let profile = analyze(&headers, &rows);
        assert_eq!(profile.types["Col"], ColumnType::Date);
        assert_eq!(profile.dates, vec!["Col"]);
    }

    #[test]
    fn numeric_strings_do_not_count_as_dates() {
        let (headers, rows) = column(&["12", "48", "300", "17", "93"]);
        let profile = analyze(&headers, &rows);
        assert_eq!(profile.types["Col"], ColumnType::Numeric);
    }

    #[test]
    fn exactly_seventy_percent_is_not_enough() {
        // 7 numeric out of 10: the threshold is strict.
        let (headers, rows) = column(&["1", "2", "3", "4", "5", "6", "7", "a", "b", "c"]);
        let profile = analyze(&headers, &rows);
        assert_eq!(profile.types["Col"], ColumnType::Categorical);
    }

    #[test]
    fn just_above_seventy_percent_is_numeric() {
        let (headers, rows) = column(&["1", "2", "3", "4", "5", "6", "7", "8", "b", "c"]);
        let profile = analyze(&headers, &rows);
        assert_eq!(profile.types["Col"], ColumnType::Numeric);
    }

    #[test]
    fn all_empty_column_is_empty() {
        let headers = vec!["A".to_string(), "B".to_string()];
        let rows = vec![
            vec!["".to_string(), "x".to_string()],
            vec!["  ".to_string(), "y".to_string()],
        ];
        let profile = analyze(&headers, &rows);
        assert_eq!(profile.types["A"], ColumnType::Empty);
        assert_eq!(profile.types["B"], ColumnType::Categorical);
        assert_eq!(profile.missing_values["A"], 100);
    }

    #[test]
    fn descriptive_stats_are_rounded() {
        let (headers, rows) = column(&["1", "2", "2", "3"]);
        let profile = analyze(&headers, &rows);
        let stats = &profile.descriptive_stats["Col"];
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean, 2.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.sum, 8.0);
    }

    #[test]
    fn detects_sales_domain_from_headers() {
        let headers = vec!["Revenue".to_string(), "Order Id".to_string(), "Region".to_string()];
        let rows = vec![vec!["10".to_string(), "1".to_string(), "EU".to_string()]];
        let profile = analyze(&headers, &rows);
        assert_eq!(profile.domain, "sales");
        assert!(profile.domain_confidence > 0);
    }
}

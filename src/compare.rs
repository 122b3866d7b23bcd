use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::store::Report;
use crate::summary::Kpi;

/// Change above which a KPI is displayed as trending.
const TREND_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Neutral,
}

/// One KPI label compared across the two reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiChange {
    pub label: String,
    pub old: Option<f64>,
    pub new: Option<f64>,
    pub change_pct: f64,
    pub trend: Trend,
}

/// Set difference of the two reports' finding lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindingsDiff {
    pub new: Vec<String>,
    pub removed: Vec<String>,
    pub common: Vec<String>,
}

/// Narrative fields shown side by side without any diffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideBySide {
    pub older: Option<String>,
    pub newer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRef {
    pub id: uuid::Uuid,
    pub title: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Full comparison document for two completed reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    pub older: ReportRef,
    pub newer: ReportRef,
    pub kpi_changes: Vec<KpiChange>,
    pub findings: FindingsDiff,
    pub summary: SideBySide,
    pub recommendations: SideBySide,
}

/// Percentage change between two KPI values
///
/// Defined as 0 when either side is missing or the old value is 0. The old
/// value's magnitude is used as the base, so a negative old value does not
/// flip the sign of the result.
pub fn calculate_change(old: Option<f64>, new: Option<f64>) -> f64 {
    match (old, new) {
        (Some(old), Some(new)) if old != 0.0 => ((new - old) / old.abs()) * 100.0,
        _ => 0.0,
    }
}

pub fn trend_direction(change: f64) -> Trend {
    if change > TREND_THRESHOLD {
        Trend::Up
    } else if change < -TREND_THRESHOLD {
        Trend::Down
    } else {
        Trend::Neutral
    }
}

/// Coerce a displayed KPI value into a number by stripping everything but
/// digits, the decimal point and the minus sign. `"$1,234.50"` becomes
/// `1234.5`; values with no numeric residue are excluded from comparison.
pub fn coerce_numeric(value: &str) -> Option<f64> {
    let stripped: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    stripped.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Set difference of two string lists, preserving input order.
pub fn compare_findings(old_items: &[String], new_items: &[String]) -> FindingsDiff {
    let old_set: HashSet<&String> = old_items.iter().collect();
    let new_set: HashSet<&String> = new_items.iter().collect();

    FindingsDiff {
        new: new_items
            .iter()
            .filter(|item| !old_set.contains(item))
            .cloned()
            .collect(),
        removed: old_items
            .iter()
            .filter(|item| !new_set.contains(item))
            .cloned()
            .collect(),
        common: old_items
            .iter()
            .filter(|item| new_set.contains(item))
            .cloned()
            .collect(),
    }
}

fn kpi_values(kpis: &[Kpi]) -> Vec<(String, f64)> {
    kpis.iter()
        .filter_map(|kpi| coerce_numeric(&kpi.value).map(|v| (kpi.label.clone(), v)))
        .collect()
}

/// Compare two completed reports
///
/// Chronological order is taken from `created_at`; the argument order does
/// not matter. KPI rows are the union of both reports' labels; a label
/// whose value is non-numeric on one side simply has that side missing.
pub fn compare(a: &Report, b: &Report) -> Comparison {
    let (older, newer) = if a.created_at <= b.created_at {
        (a, b)
    } else {
        (b, a)
    };

    // BTreeMap keeps the KPI rows in a stable label order.
    let mut rows: BTreeMap<String, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for (label, value) in kpi_values(&older.kpis) {
        rows.insert(label, (Some(value), None));
    }
    for (label, value) in kpi_values(&newer.kpis) {
        rows.entry(label).or_insert((None, None)).1 = Some(value);
    }

    let kpi_changes = rows
        .into_iter()
        .map(|(label, (old, new))| {
            let change_pct = calculate_change(old, new);
            KpiChange {
                label,
                old,
                new,
                change_pct,
                trend: trend_direction(change_pct),
            }
        })
        .collect();

    let empty = Vec::new();
    let older_findings = older
        .text_summary
        .as_ref()
        .map(|s| &s.key_findings)
        .unwrap_or(&empty);
    let newer_findings = newer
        .text_summary
        .as_ref()
        .map(|s| &s.key_findings)
        .unwrap_or(&empty);

    Comparison {
        older: ReportRef {
            id: older.id,
            title: older.title.clone(),
            created_at: older.created_at,
        },
        newer: ReportRef {
            id: newer.id,
            title: newer.title.clone(),
            created_at: newer.created_at,
        },
        kpi_changes,
        findings: compare_findings(older_findings, newer_findings),
        summary: SideBySide {
            older: older.text_summary.as_ref().map(|s| s.summary.clone()),
            newer: newer.text_summary.as_ref().map(|s| s.summary.clone()),
        },
        recommendations: SideBySide {
            older: older
                .text_summary
                .as_ref()
                .map(|s| s.recommendations.join("\n")),
            newer: newer
                .text_summary
                .as_ref()
                .map(|s| s.recommendations.join("\n")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_is_zero_for_missing_or_zero_old() {
        assert_eq!(calculate_change(None, Some(10.0)), 0.0);
        assert_eq!(calculate_change(Some(10.0), None), 0.0);
        assert_eq!(calculate_change(Some(0.0), Some(10.0)), 0.0);
    }

    #[test]
    fn change_uses_absolute_base_for_negative_old_values() {
        // -10 -> -5 is an improvement of +50%.
        let change = calculate_change(Some(-10.0), Some(-5.0));
        assert!((change - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn revenue_growth_scenario() {
        let change = calculate_change(Some(100.0), Some(150.0));
        assert!((change - 50.0).abs() < f64::EPSILON);
        assert_eq!(trend_direction(change), Trend::Up);
    }

    #[test]
    fn trend_thresholds() {
        assert_eq!(trend_direction(0.4), Trend::Neutral);
        assert_eq!(trend_direction(0.6), Trend::Up);
        assert_eq!(trend_direction(-0.6), Trend::Down);
    }

    #[test]
    fn coercion_strips_currency_and_separators() {
        assert_eq!(coerce_numeric("$1,234.50"), Some(1234.5));
        assert_eq!(coerce_numeric("-42 units"), Some(-42.0));
        assert_eq!(coerce_numeric("n/a"), None);
    }

    #[test]
    fn findings_diff_partitions_items() {
        let old = vec!["a".to_string(), "b".to_string()];
        let new = vec!["b".to_string(), "c".to_string()];
        let diff = compare_findings(&old, &new);
        assert_eq!(diff.new, vec!["c"]);
        assert_eq!(diff.removed, vec!["a"]);
        assert_eq!(diff.common, vec!["b"]);
    }
}

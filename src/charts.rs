use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::analyzer::{parse_number, round2, ColumnProfile};

const TREND_POINT_LIMIT: usize = 20;
const CATEGORY_LIMIT: usize = 10;
const SUMMARY_COLUMN_LIMIT: usize = 5;
const OVERVIEW_HEADER_LIMIT: usize = 10;

/// Kind of visualisation a descriptor asks the client to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Line,
    Bar,
    Statistics,
}

/// A renderable chart attached to a completed report
///
/// Immutable once attached; the data points are free-form JSON objects
/// whose shape depends on the kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartDescriptor {
    #[serde(rename = "type")]
    pub kind: ChartKind,
    pub title: String,
    pub data: Vec<Value>,
}

/// Build chart descriptors for analysed spreadsheet data
///
/// Produces up to three descriptors (trend line, category distribution,
/// numeric summary). When none of them yields data, a placeholder overview
/// chart over the headers is returned instead, so the result is never empty
/// as long as at least one header exists.
pub fn synthesize(
    headers: &[String],
    rows: &[Vec<String>],
    profile: &ColumnProfile,
) -> Vec<ChartDescriptor> {
    let mut charts = Vec::new();

    if let Some(chart) = trend_line(headers, rows, profile) {
        charts.push(chart);
    }
    if let Some(chart) = category_distribution(headers, rows, profile) {
        charts.push(chart);
    }
    if let Some(chart) = numeric_summary(profile) {
        charts.push(chart);
    }

    if charts.is_empty() && !headers.is_empty() {
        charts.push(overview(headers, rows.len()));
    }

    charts
}

/// Trend over the first numeric column: first 20 finite values in row order.
fn trend_line(
    headers: &[String],
    rows: &[Vec<String>],
    profile: &ColumnProfile,
) -> Option<ChartDescriptor> {
    let column = profile.numeric.first()?;
    let col_index = headers.iter().position(|h| h == column)?;

    let data: Vec<Value> = rows
        .iter()
        .filter_map(|row| row.get(col_index))
        .filter_map(|cell| parse_number(cell))
        .take(TREND_POINT_LIMIT)
        .enumerate()
        .map(|(i, value)| {
            json!({
                "index": i + 1,
                "value": value,
                "label": format!("Row {}", i + 1),
            })
        })
        .collect();

    if data.is_empty() {
        return None;
    }
    Some(ChartDescriptor {
        kind: ChartKind::Line,
        title: format!("{column} Trend"),
        data,
    })
}

/// Occurrence counts of the first categorical column, top 10 descending.
fn category_distribution(
    headers: &[String],
    rows: &[Vec<String>],
    profile: &ColumnProfile,
) -> Option<ChartDescriptor> {
    let column = profile.categorical.first()?;
    let col_index = headers.iter().position(|h| h == column)?;

    let mut counts: HashMap<String, u64> = HashMap::new();
    for row in rows {
        let Some(cell) = row.get(col_index) else { continue };
        let value = cell.trim();
        if value.is_empty() {
            continue;
        }
        // Long labels group under their first 20 chars.
        *counts.entry(truncate_chars(value, 20)).or_insert(0) += 1;
    }

    if counts.is_empty() {
        return None;
    }

    let mut entries: Vec<(String, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(CATEGORY_LIMIT);

    let data = entries
        .into_iter()
        .map(|(name, count)| json!({ "name": name, "count": count, "value": count }))
        .collect();

    Some(ChartDescriptor {
        kind: ChartKind::Bar,
        title: format!("{column} Distribution"),
        data,
    })
}

/// Per-column stats table, present only when two or more numeric columns exist.
fn numeric_summary(profile: &ColumnProfile) -> Option<ChartDescriptor> {
    if profile.numeric.len() < 2 {
        return None;
    }

    let data: Vec<Value> = profile
        .numeric
        .iter()
        .take(SUMMARY_COLUMN_LIMIT)
        .filter_map(|column| {
            let stats = profile.descriptive_stats.get(column)?;
            Some(json!({
                "name": column,
                "count": stats.count,
                "mean": round2(stats.mean),
                "max": stats.max,
                "min": stats.min,
            }))
        })
        .collect();

    if data.is_empty() {
        return None;
    }
    Some(ChartDescriptor {
        kind: ChartKind::Statistics,
        title: "Statistical Summary".to_string(),
        data,
    })
}

/// Placeholder chart listing the headers when nothing else can be drawn.
fn overview(headers: &[String], row_count: usize) -> ChartDescriptor {
    let data = headers
        .iter()
        .take(OVERVIEW_HEADER_LIMIT)
        .map(|header| {
            json!({
                "name": truncate_chars(header, 15),
                "count": row_count,
                "value": row_count,
            })
        })
        .collect();

    ChartDescriptor {
        kind: ChartKind::Bar,
        title: "Data Overview".to_string(),
        data,
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;

    fn sheet(headers: &[&str], rows: &[&[&str]]) -> (Vec<String>, Vec<Vec<String>>) {
        let headers: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        let rows: Vec<Vec<String>> = rows
            .iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect();
        (headers, rows)
    }

    #[test]
    fn trend_line_is_capped_at_twenty_points() {
        let rows: Vec<Vec<String>> = (0..50).map(|i| vec![i.to_string()]).collect();
        let headers = vec!["Sales".to_string()];
        let profile = analyze(&headers, &rows);
        let charts = synthesize(&headers, &rows, &profile);

        let trend = charts.iter().find(|c| c.kind == ChartKind::Line).unwrap();
        assert_eq!(trend.data.len(), 20);
        assert_eq!(trend.data[0]["label"], "Row 1");
        assert_eq!(trend.data[19]["index"], 20);
    }

    #[test]
    fn category_distribution_is_sorted_and_capped() {
        let mut raw: Vec<Vec<String>> = Vec::new();
        for i in 0..15 {
            for _ in 0..=i {
                raw.push(vec![format!("cat-{i}")]);
            }
        }
        let headers = vec!["Segment".to_string()];
        let profile = analyze(&headers, &raw);
        let charts = synthesize(&headers, &raw, &profile);

        let bar = charts.iter().find(|c| c.kind == ChartKind::Bar).unwrap();
        assert_eq!(bar.data.len(), 10);
        let counts: Vec<u64> = bar
            .data
            .iter()
            .map(|p| p["count"].as_u64().unwrap())
            .collect();
        let mut sorted = counts.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(counts, sorted);
        assert_eq!(counts[0], 15);
    }

    #[test]
    fn statistics_need_two_numeric_columns() {
        let (headers, rows) = sheet(&["A", "B"], &[&["1", "x"], &["2", "y"], &["3", "z"]]);
        let profile = analyze(&headers, &rows);
        let charts = synthesize(&headers, &rows, &profile);
        assert!(charts.iter().all(|c| c.kind != ChartKind::Statistics));

        let (headers, rows) = sheet(&["A", "B"], &[&["1", "4"], &["2", "5"], &["3", "6"]]);
        let profile = analyze(&headers, &rows);
        let charts = synthesize(&headers, &rows, &profile);
        let stats = charts
            .iter()
            .find(|c| c.kind == ChartKind::Statistics)
            .unwrap();
        assert_eq!(stats.data.len(), 2);
    }

    #[test]
    fn fallback_overview_guarantees_a_chart() {
        // Headers but no data rows: nothing else can be drawn.
        let (headers, rows) = sheet(&["A", "B", "C"], &[]);
        let profile = analyze(&headers, &rows);
        let charts = synthesize(&headers, &rows, &profile);
        assert_eq!(charts.len(), 1);
        assert_eq!(charts[0].title, "Data Overview");
        assert_eq!(charts[0].data.len(), 3);
    }
}

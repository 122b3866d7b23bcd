use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::analyzer::ColumnProfile;
use crate::config::Config;

/// Narrative analysis attached to a completed report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextSummary {
    pub summary: String,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// A headline metric displayed on the dashboard and used by the
/// comparison engine. Values are kept as display strings; comparison
/// coerces them back to numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kpi {
    pub label: String,
    pub value: String,
}

const SYSTEM_PROMPT: &str = "You are a data analyst. Analyze the provided spreadsheet data and \
generate a clear, business-focused summary with key insights and recommendations. Respond with a \
JSON object of the shape {\"summary\": string, \"keyFindings\": [string], \"recommendations\": \
[string]}. Include exact numbers from the data and keep the language simple and direct.";

#[derive(Debug, Deserialize)]
struct AiSummary {
    summary: String,
    #[serde(rename = "keyFindings", default)]
    key_findings: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

/// Client for the AI summarization step of the ingestion pipeline
///
/// When no API key is configured, or whenever the gateway call fails, the
/// summarizer falls back to a deterministic templated summary; AI failure
/// is never a hard failure of the report.
pub struct Summarizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl Summarizer {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: config.ai_gateway_url.clone(),
            api_key: config.ai_api_key.clone(),
            model: config.ai_model.clone(),
        }
    }

    /// Produce a narrative summary for one analysed spreadsheet.
    pub async fn summarize(
        &self,
        filename: &str,
        headers: &[String],
        rows: &[Vec<String>],
        profile: &ColumnProfile,
    ) -> TextSummary {
        let Some(api_key) = &self.api_key else {
            log::info!("no AI key configured, using templated summary");
            return fallback_summary(headers, rows, profile);
        };

        match self
            .request_summary(api_key, filename, headers, rows, profile)
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                log::warn!("AI summarization failed, falling back: {err}");
                fallback_summary(headers, rows, profile)
            }
        }
    }

    async fn request_summary(
        &self,
        api_key: &str,
        filename: &str,
        headers: &[String],
        rows: &[Vec<String>],
        profile: &ColumnProfile,
    ) -> Result<TextSummary, String> {
        let sample: Vec<&Vec<String>> = rows.iter().take(3).collect();
        let user_prompt = format!(
            "Analyze this spreadsheet data:\n\nFilename: {}\nRow Count: {}\nColumn Count: {}\n\
             Columns: {}\nDomain: {} ({}% confidence)\nKey Statistics: {}\n\
             Sample Data (first 3 rows): {}",
            filename,
            profile.total_rows,
            profile.total_columns,
            headers.join(", "),
            profile.domain,
            profile.domain_confidence,
            serde_json::to_string(&profile.descriptive_stats).unwrap_or_default(),
            serde_json::to_string(&sample).unwrap_or_default(),
        );

        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt },
            ],
            "temperature": 0.1,
            "max_tokens": 2000,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("gateway request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("gateway returned {status}"));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| format!("invalid gateway payload: {e}"))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or("gateway payload had no content")?;
        let parsed: AiSummary = serde_json::from_str(content)
            .map_err(|e| format!("could not parse AI response: {e}"))?;

        Ok(TextSummary {
            summary: parsed.summary,
            key_findings: parsed.key_findings,
            recommendations: parsed.recommendations,
        })
    }
}

/// Deterministic summary used when the AI gateway is unavailable.
pub fn fallback_summary(
    headers: &[String],
    rows: &[Vec<String>],
    profile: &ColumnProfile,
) -> TextSummary {
    let summary = format!(
        "This spreadsheet contains {} rows and {} columns ({}). The dataset appears to hold {} \
         data with {} numeric, {} categorical and {} date column(s).",
        profile.total_rows,
        profile.total_columns,
        headers.join(", "),
        profile.domain,
        profile.numeric.len(),
        profile.categorical.len(),
        profile.dates.len(),
    );

    let mut key_findings = Vec::new();
    if let Some((name, count, pct)) = top_category(headers, rows, profile) {
        key_findings.push(format!(
            "{name} is the leading {} with {count} records ({pct}% of the dataset)",
            profile.categorical[0]
        ));
    }
    if let Some(column) = profile.numeric.first() {
        if let Some(stats) = profile.descriptive_stats.get(column) {
            key_findings.push(format!(
                "Average {column}: {}, total: {}",
                stats.mean, stats.sum
            ));
        }
    }
    key_findings.push(format!(
        "Data completeness: {}% of columns have at most 20% missing values",
        completeness_pct(&profile.missing_values, profile.total_columns),
    ));

    let mut recommendations = Vec::new();
    if let Some((name, _, pct)) = top_category(headers, rows, profile) {
        recommendations.push(format!(
            "Focus on the {name} segment which drives {pct}% of activity"
        ));
    }
    if let Some(column) = profile.numeric.first() {
        if let Some(stats) = profile.descriptive_stats.get(column) {
            recommendations.push(format!(
                "Optimize around the {} average {} value",
                stats.mean,
                column.to_lowercase()
            ));
        }
    }
    recommendations.push(format!(
        "Leverage {}-specific insights for strategic decisions",
        profile.domain
    ));

    TextSummary {
        summary,
        key_findings,
        recommendations,
    }
}

/// Headline KPIs persisted with the report.
pub fn build_kpis(profile: &ColumnProfile) -> Vec<Kpi> {
    let mut kpis = vec![
        Kpi {
            label: "Total Records".to_string(),
            value: profile.total_rows.to_string(),
        },
        Kpi {
            label: "Columns".to_string(),
            value: profile.total_columns.to_string(),
        },
    ];

    for column in profile.numeric.iter().take(3) {
        if let Some(stats) = profile.descriptive_stats.get(column) {
            kpis.push(Kpi {
                label: format!("Average {column}"),
                value: stats.mean.to_string(),
            });
            kpis.push(Kpi {
                label: format!("Total {column}"),
                value: stats.sum.to_string(),
            });
        }
    }

    kpis
}

fn top_category(
    headers: &[String],
    rows: &[Vec<String>],
    profile: &ColumnProfile,
) -> Option<(String, usize, u32)> {
    let column = profile.categorical.first()?;
    let col_index = headers.iter().position(|h| h == column)?;

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for row in rows {
        let Some(cell) = row.get(col_index) else { continue };
        let value = cell.trim();
        if !value.is_empty() {
            *counts.entry(value).or_insert(0) += 1;
        }
    }

    let (name, count) = counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))?;
    let pct = ((count as f64 / rows.len().max(1) as f64) * 100.0).round() as u32;
    Some((name.to_string(), count, pct))
}

fn completeness_pct(missing: &HashMap<String, u32>, total_columns: usize) -> u32 {
    if total_columns == 0 {
        return 100;
    }
    let sparse = missing.values().filter(|pct| **pct > 20).count();
    (100.0 - (sparse as f64 / total_columns as f64) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;

    fn sample() -> (Vec<String>, Vec<Vec<String>>) {
        let headers = vec!["Region".to_string(), "Sales".to_string()];
        let rows = vec![
            vec!["EU".to_string(), "10".to_string()],
            vec!["EU".to_string(), "20".to_string()],
            vec!["US".to_string(), "30".to_string()],
        ];
        (headers, rows)
    }

    #[test]
    fn fallback_summary_describes_counts() {
        let (headers, rows) = sample();
        let profile = analyze(&headers, &rows);
        let summary = fallback_summary(&headers, &rows, &profile);
        assert!(summary.summary.contains("3 rows"));
        assert!(summary.summary.contains("2 columns"));
        assert!(!summary.key_findings.is_empty());
        assert!(!summary.recommendations.is_empty());
    }

    #[test]
    fn kpis_include_record_count_and_numeric_aggregates() {
        let (headers, rows) = sample();
        let profile = analyze(&headers, &rows);
        let kpis = build_kpis(&profile);
        assert_eq!(kpis[0].label, "Total Records");
        assert_eq!(kpis[0].value, "3");
        assert!(kpis.iter().any(|k| k.label == "Average Sales" && k.value == "20"));
        assert!(kpis.iter().any(|k| k.label == "Total Sales" && k.value == "60"));
    }

    #[test]
    fn fallback_finds_the_top_category() {
        let (headers, rows) = sample();
        let profile = analyze(&headers, &rows);
        let summary = fallback_summary(&headers, &rows, &profile);
        assert!(summary.key_findings[0].contains("EU"));
        assert!(summary.key_findings[0].contains("67%"));
    }
}

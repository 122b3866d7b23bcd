use std::time::Duration;

use serde_json::json;

use crate::config::Config;
use crate::error::{truncate_message, AppError};
use crate::store::{Report, Store};

/// Client for the optional external analysis service
///
/// When configured, every ingestion is offered to this service with a
/// short-lived signed URL to the raw blob before the report completes. A
/// non-success response marks the report failed with the upstream body,
/// truncated.
pub struct AnalysisDelegate {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl AnalysisDelegate {
    pub fn from_config(config: &Config) -> Option<Self> {
        let base_url = config.analysis_service_url.clone()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Some(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: config.analysis_service_token.clone(),
        })
    }

    /// Hand one report to the analysis service, returning its response body.
    pub async fn dispatch(
        &self,
        store: &Store,
        report: &Report,
        signed_url: &str,
        question: Option<&str>,
    ) -> Result<serde_json::Value, AppError> {
        let body = json!({
            "userId": report.owner_id,
            "reportId": report.id,
            "signedUrl": signed_url,
            "question": question,
        });

        let response = self
            .client
            .post(format!("{}/analyze", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let message = format!("analysis service unreachable: {e}");
                store.fail_report(report.id, &message);
                AppError::Upstream(message)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!(
                "analysis service returned {status}: {}",
                truncate_message(&body, 500)
            );
            store.fail_report(report.id, &message);
            return Err(AppError::Upstream(message));
        }

        log::info!("report {} dispatched to analysis service", report.id);
        response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("invalid analysis service payload: {e}")))
    }
}

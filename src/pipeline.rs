use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::analyzer;
use crate::charts;
use crate::config::Config;
use crate::delegate::AnalysisDelegate;
use crate::error::AppError;
use crate::loader;
use crate::store::{Report, Store};
use crate::summary::{self, Summarizer};

const JOB_QUEUE_DEPTH: usize = 64;
const SIGNED_URL_TTL_SECS: i64 = 60;

const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "text/csv",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

/// One queued ingestion unit.
#[derive(Debug)]
pub struct Job {
    pub report_id: Uuid,
    pub question: Option<String>,
}

/// Upload-to-report pipeline
///
/// `submit_upload` validates and stores the raw file, inserts a
/// `processing` report row and enqueues a job; the response returns as soon
/// as the row exists. A background worker drains the queue and runs the
/// parse/analyze/summarize steps, moving each report to exactly one
/// terminal state.
pub struct Pipeline {
    store: Arc<Store>,
    summarizer: Summarizer,
    delegate: Option<AnalysisDelegate>,
    config: Arc<Config>,
    tx: mpsc::Sender<Job>,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        summarizer: Summarizer,
        delegate: Option<AnalysisDelegate>,
        config: Arc<Config>,
    ) -> (Arc<Self>, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(JOB_QUEUE_DEPTH);
        let pipeline = Arc::new(Self {
            store,
            summarizer,
            delegate,
            config,
            tx,
        });
        (pipeline, rx)
    }

    /// Accept an upload: validate, persist the blob, create the report row
    /// and enqueue processing. Returns the new report id.
    pub async fn submit_upload(
        &self,
        owner_id: &str,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
        question: Option<String>,
    ) -> Result<Uuid, AppError> {
        let filename = sanitize_filename(filename)?;
        if !is_supported(content_type, &filename) {
            return Err(AppError::BadRequest(
                "Unsupported file type. Upload a CSV or Excel spreadsheet.".to_string(),
            ));
        }
        if bytes.is_empty() {
            return Err(AppError::BadRequest("Uploaded file is empty".to_string()));
        }

        let storage_path = format!("{owner_id}/{}_{filename}", Utc::now().timestamp_millis());
        self.store.put_blob(&storage_path, &bytes)?;

        let report = Report::new(owner_id, &filename, &filename, &storage_path, None);
        let report_id = report.id;
        self.store.insert_report(report);

        if self
            .tx
            .send(Job { report_id, question })
            .await
            .is_err()
        {
            self.store.fail_report(report_id, "processing queue is shut down");
            return Err(AppError::Internal("processing queue is shut down".to_string()));
        }

        log::info!("report {report_id} queued for processing ({storage_path})");
        Ok(report_id)
    }

    /// Run the full processing chain for one queued report. Any error moves
    /// the report to `failed` with the message, truncated.
    pub async fn process_report(&self, report_id: Uuid, question: Option<&str>) {
        if let Err(err) = self.process_inner(report_id, question).await {
            log::warn!("report {report_id} failed: {err}");
            self.store.fail_report(report_id, &err.to_string());
        }
    }

    async fn process_inner(&self, report_id: Uuid, question: Option<&str>) -> Result<(), AppError> {
        let report = self
            .store
            .get_report_any(report_id)
            .ok_or_else(|| AppError::NotFound(format!("report {report_id} vanished")))?;

        let bytes = self.store.get_blob(&report.storage_path)?;
        let (headers, rows) = loader::parse_spreadsheet(&report.original_filename, &bytes)?;
        if rows.is_empty() {
            return Err(AppError::BadRequest("No data found in spreadsheet".to_string()));
        }

        let profile = analyzer::analyze(&headers, &rows);
        let chart_data = charts::synthesize(&headers, &rows, &profile);
        let text_summary = self
            .summarizer
            .summarize(&report.original_filename, &headers, &rows, &profile)
            .await;
        let kpis = summary::build_kpis(&profile);

        // The delegate verdict gates completion: a rejected dispatch has
        // already moved the report to `failed` with the upstream body.
        if let Some(delegate) = &self.delegate {
            let token = self
                .store
                .mint_signed_token(&report.storage_path, Duration::seconds(SIGNED_URL_TTL_SECS));
            let signed_url = format!("{}/storage/signed/{token}", self.config.public_base_url);
            delegate
                .dispatch(&self.store, &report, &signed_url, question)
                .await?;
        }

        self.store.complete_report(
            report_id,
            rows.len(),
            headers.len(),
            Some(text_summary),
            kpis,
            chart_data,
        );
        log::info!("report {report_id} completed: {} rows, {} columns", rows.len(), headers.len());

        Ok(())
    }
}

/// Drain the job queue until every sender is dropped.
pub fn spawn_worker(pipeline: Arc<Pipeline>, mut rx: mpsc::Receiver<Job>) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            pipeline.process_report(job.report_id, job.question.as_deref()).await;
        }
        log::info!("processing worker shut down");
    });
}

fn sanitize_filename(filename: &str) -> Result<String, AppError> {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim();
    if name.is_empty() || name == ".." {
        return Err(AppError::BadRequest("Invalid filename".to_string()));
    }
    Ok(name.to_string())
}

fn is_supported(content_type: &str, filename: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    if ALLOWED_CONTENT_TYPES.contains(&essence) {
        return true;
    }
    // Browsers sometimes send a generic type; fall back to the extension.
    if essence.is_empty() || essence == "application/octet-stream" {
        let extension = filename.rsplit('.').next().unwrap_or("").to_lowercase();
        return matches!(extension.as_str(), "csv" | "xls" | "xlsx");
    }
    false
}

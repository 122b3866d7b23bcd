use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;
use crate::mailer::Mailer;
use crate::pipeline::Pipeline;
use crate::store::{Connection, Report, ScheduleFrequency, SheetType, Store};

lazy_static! {
    static ref GOOGLE_DOC_ID: Regex = Regex::new(r"/d/([a-zA-Z0-9-_]+)").unwrap();
}

/// Reports stuck in `processing` longer than this are failed by the sweep.
const STALE_AFTER_HOURS: i64 = 1;

/// Classify a pasted URL as one of the supported live sheet providers.
pub fn detect_sheet_type(url: &str) -> Option<SheetType> {
    if url.contains("docs.google.com/spreadsheets") || url.contains("sheets.google.com") {
        return Some(SheetType::GoogleSheets);
    }
    if url.contains("onedrive.live.com") || url.contains("sharepoint.com") || url.contains("1drv.ms")
    {
        return Some(SheetType::ExcelOnline);
    }
    None
}

/// Rewrite a Google Sheets URL into its CSV export endpoint. A URL without
/// a recognizable document id is fetched as-is.
pub fn google_export_url(url: &str) -> String {
    match GOOGLE_DOC_ID.captures(url).and_then(|c| c.get(1)) {
        Some(id) => format!(
            "https://docs.google.com/spreadsheets/d/{}/export?format=csv",
            id.as_str()
        ),
        None => url.to_string(),
    }
}

/// Next scheduled run: now plus one period, aligned to 06:00 UTC.
pub fn next_run_after(now: DateTime<Utc>, frequency: ScheduleFrequency) -> DateTime<Utc> {
    let next = match frequency {
        ScheduleFrequency::Daily => now + Duration::days(1),
        ScheduleFrequency::Weekly => now + Duration::days(7),
        ScheduleFrequency::Monthly => now + Months::new(1),
    };
    next.date_naive()
        .and_hms_opt(6, 0, 0)
        .expect("06:00:00 is a valid time")
        .and_utc()
}

/// Fetches the current contents of a remote sheet as CSV bytes. The HTTP
/// implementation is swapped out in tests.
#[async_trait]
pub trait SheetSource: Send + Sync {
    async fn fetch_csv(&self, url: &str, sheet_type: SheetType) -> Result<Vec<u8>, AppError>;
}

pub struct HttpSheetSource {
    client: reqwest::Client,
}

impl HttpSheetSource {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpSheetSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SheetSource for HttpSheetSource {
    async fn fetch_csv(&self, url: &str, sheet_type: SheetType) -> Result<Vec<u8>, AppError> {
        let csv_url = match sheet_type {
            SheetType::GoogleSheets => google_export_url(url),
            SheetType::ExcelOnline if url.contains("1drv.ms") => {
                // Short links redirect to an embed URL; the download variant
                // of that URL serves the raw file.
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| AppError::Upstream(format!("failed to resolve share link: {e}")))?;
                response.url().as_str().replace("embed", "download")
            }
            SheetType::ExcelOnline => url.to_string(),
        };

        log::info!("fetching live sheet from {csv_url}");
        let response = self
            .client
            .get(&csv_url)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("failed to fetch sheet: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "Failed to fetch sheet: {status}. Make sure the sheet is publicly accessible."
            )));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| AppError::Upstream(format!("failed to read sheet body: {e}")))
    }
}

/// Outcome of one connection run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RunOutcome {
    ReportGenerated { report_id: Uuid },
    SkippedNoChanges,
}

#[derive(Debug, Serialize)]
pub struct ConnectionResult {
    pub connection_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SweepSummary {
    pub timed_out_reports: usize,
    pub results: Vec<ConnectionResult>,
}

/// Live sheet scheduler
///
/// Owns the recurring fetch cycle: pull the sheet, skip unchanged data on
/// scheduled runs, otherwise ingest a snapshot through the same pipeline
/// uploads use. Connections are independent; one failing run records its
/// error on that connection and never stops the sweep.
pub struct Scheduler {
    store: Arc<Store>,
    source: Arc<dyn SheetSource>,
    pipeline: Arc<Pipeline>,
    mailer: Option<Mailer>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        source: Arc<dyn SheetSource>,
        pipeline: Arc<Pipeline>,
        mailer: Option<Mailer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            source,
            pipeline,
            mailer,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Create a connection and trigger its first run in the background.
    pub fn connect(
        self: &Arc<Self>,
        owner_id: &str,
        sheet_url: &str,
        sheet_name: &str,
        frequency: ScheduleFrequency,
        notify_email: Option<String>,
    ) -> Result<Connection, AppError> {
        let sheet_url = sheet_url.trim();
        let sheet_name = sheet_name.trim();
        if sheet_url.is_empty() || sheet_name.is_empty() {
            return Err(AppError::BadRequest(
                "Both a sheet URL and a connection name are required".to_string(),
            ));
        }
        let sheet_type = detect_sheet_type(sheet_url).ok_or_else(|| {
            AppError::BadRequest(
                "Invalid URL. Please paste a Google Sheets or Excel Online URL".to_string(),
            )
        })?;

        let now = Utc::now();
        let connection = Connection {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            sheet_url: sheet_url.to_string(),
            sheet_type,
            sheet_name: sheet_name.to_string(),
            schedule_frequency: frequency,
            next_run_at: next_run_after(now, frequency),
            last_run_at: None,
            last_checked_at: None,
            is_active: true,
            error_message: None,
            last_report_id: None,
            last_data_hash: None,
            notify_email,
            created_at: now,
        };
        self.store.insert_connection(connection.clone());

        // First analysis runs immediately; the schedule covers later runs.
        let scheduler = Arc::clone(self);
        let id = connection.id;
        tokio::spawn(async move {
            if let Err(err) = scheduler.run_connection(id, true).await {
                log::warn!("initial run of connection {id} failed: {err}");
            }
        });

        Ok(connection)
    }

    /// Run one connection now. `manual` runs ingest even when the sheet is
    /// unchanged; scheduled runs skip unchanged data.
    pub async fn run_connection(&self, id: Uuid, manual: bool) -> Result<RunOutcome, AppError> {
        let connection = self
            .store
            .get_connection_any(id)
            .ok_or_else(|| AppError::NotFound("Connection not found".to_string()))?;

        let _guard = InFlightGuard::acquire(&self.in_flight, id).ok_or_else(|| {
            AppError::BadRequest("Connection is already being processed".to_string())
        })?;

        match self.run_cycle(&connection, manual).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.store.record_connection_error(id, &err.to_string());
                Err(err)
            }
        }
    }

    async fn run_cycle(&self, connection: &Connection, manual: bool) -> Result<RunOutcome, AppError> {
        let bytes = self
            .source
            .fetch_csv(&connection.sheet_url, connection.sheet_type)
            .await?;

        let data_hash = hex::encode(Sha256::digest(&bytes));
        if !manual && connection.last_data_hash.as_deref() == Some(data_hash.as_str()) {
            log::info!(
                "no changes detected for {}, skipping report generation",
                connection.sheet_name
            );
            let next = next_run_after(Utc::now(), connection.schedule_frequency);
            self.store.record_connection_skip(connection.id, next);
            return Ok(RunOutcome::SkippedNoChanges);
        }

        let now = Utc::now();
        let storage_path = format!(
            "{}/live-sheet-{}-{}.csv",
            connection.owner_id,
            connection.id,
            now.timestamp_millis()
        );
        self.store.put_blob(&storage_path, &bytes)?;

        let report = Report::new(
            &connection.owner_id,
            &format!("{} - {}", connection.sheet_name, now.format("%Y-%m-%d")),
            &format!("{}.csv", connection.sheet_name),
            &storage_path,
            Some(connection.id),
        );
        let report_id = report.id;
        self.store.insert_report(report);

        self.pipeline.process_report(report_id, None).await;

        let report = self
            .store
            .get_report_any(report_id)
            .ok_or_else(|| AppError::Internal("report vanished during processing".to_string()))?;
        if let Some(message) = &report.error_message {
            return Err(AppError::Internal(message.clone()));
        }

        let next = next_run_after(Utc::now(), connection.schedule_frequency);
        self.store
            .record_connection_success(connection.id, next, report_id, &data_hash);

        if let (Some(mailer), Some(to)) = (&self.mailer, &connection.notify_email) {
            mailer
                .send_report_ready(to, &connection.sheet_name, &report.title)
                .await;
        } else if connection.notify_email.is_none() {
            log::debug!("connection {} has no notification address", connection.id);
        }

        Ok(RunOutcome::ReportGenerated { report_id })
    }

    /// One maintenance pass: fail timed-out reports, then run every due
    /// connection in turn.
    pub async fn sweep(&self) -> SweepSummary {
        let cutoff = Utc::now() - Duration::hours(STALE_AFTER_HOURS);
        let stale = self.store.stale_processing_reports(cutoff);
        for report_id in &stale {
            log::warn!("report {report_id} timed out in processing");
            self.store.fail_report(*report_id, "Analysis timed out");
        }

        let due = self.store.due_connections(Utc::now());
        log::info!("sweep: {} timed-out report(s), {} due connection(s)", stale.len(), due.len());

        let mut results = Vec::with_capacity(due.len());
        for connection in due {
            let result = match self.run_connection(connection.id, false).await {
                Ok(outcome) => ConnectionResult {
                    connection_id: connection.id,
                    success: true,
                    outcome: Some(outcome),
                    error: None,
                },
                Err(err) => ConnectionResult {
                    connection_id: connection.id,
                    success: false,
                    outcome: None,
                    error: Some(err.to_string()),
                },
            };
            results.push(result);
        }

        SweepSummary {
            timed_out_reports: stale.len(),
            results,
        }
    }
}

/// Periodic background sweep driving the schedule.
pub fn spawn_sweeper(scheduler: Arc<Scheduler>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            scheduler.sweep().await;
        }
    });
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<Uuid>>, id: Uuid) -> Option<Self> {
        let mut in_flight = set.lock().expect("in-flight lock");
        if !in_flight.insert(id) {
            return None;
        }
        Some(Self { set, id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().expect("in-flight lock").remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::ProcessingStatus;
    use crate::summary::Summarizer;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct StubSource {
        responses: HashMap<String, Result<Vec<u8>, String>>,
    }

    #[async_trait]
    impl SheetSource for StubSource {
        async fn fetch_csv(&self, url: &str, _sheet_type: SheetType) -> Result<Vec<u8>, AppError> {
            match self.responses.get(url) {
                Some(Ok(bytes)) => Ok(bytes.clone()),
                Some(Err(message)) => Err(AppError::Upstream(message.clone())),
                None => Err(AppError::Upstream("unexpected URL".to_string())),
            }
        }
    }

    fn harness(source: StubSource) -> (tempfile::TempDir, Arc<Scheduler>, Arc<Store>) {
        let dir = tempdir().unwrap();
        let config = Arc::new(Config::for_tests(dir.path().to_path_buf()));
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let summarizer = Summarizer::new(&config);
        let (pipeline, _rx) = Pipeline::new(store.clone(), summarizer, None, config);
        let scheduler = Scheduler::new(store.clone(), Arc::new(source), pipeline, None);
        (dir, scheduler, store)
    }

    fn due_connection(store: &Store, url: &str, name: &str) -> Uuid {
        let now = Utc::now();
        let connection = Connection {
            id: Uuid::new_v4(),
            owner_id: "u1".to_string(),
            sheet_url: url.to_string(),
            sheet_type: detect_sheet_type(url).unwrap(),
            sheet_name: name.to_string(),
            schedule_frequency: ScheduleFrequency::Daily,
            next_run_at: now - Duration::minutes(1),
            last_run_at: None,
            last_checked_at: None,
            is_active: true,
            error_message: None,
            last_report_id: None,
            last_data_hash: None,
            notify_email: None,
            created_at: now,
        };
        let id = connection.id;
        store.insert_connection(connection);
        id
    }

    #[test]
    fn sheet_type_detection() {
        assert_eq!(
            detect_sheet_type("https://docs.google.com/spreadsheets/d/abc/edit"),
            Some(SheetType::GoogleSheets)
        );
        assert_eq!(
            detect_sheet_type("https://1drv.ms/x/s!Abc"),
            Some(SheetType::ExcelOnline)
        );
        assert_eq!(
            detect_sheet_type("https://contoso.sharepoint.com/sheet"),
            Some(SheetType::ExcelOnline)
        );
        assert_eq!(detect_sheet_type("https://example.com/data.csv"), None);
    }

    #[test]
    fn google_urls_rewrite_to_the_csv_export() {
        let url = "https://docs.google.com/spreadsheets/d/1AbC-d_9/edit#gid=0";
        assert_eq!(
            google_export_url(url),
            "https://docs.google.com/spreadsheets/d/1AbC-d_9/export?format=csv"
        );
        // No document id: fetched unchanged.
        let plain = "https://docs.google.com/spreadsheets/export";
        assert_eq!(google_export_url(plain), plain);
    }

    #[test]
    fn next_run_is_aligned_to_six_utc() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 14, 30, 45).unwrap();

        let daily = next_run_after(now, ScheduleFrequency::Daily);
        assert_eq!(daily, Utc.with_ymd_and_hms(2024, 3, 11, 6, 0, 0).unwrap());

        let weekly = next_run_after(now, ScheduleFrequency::Weekly);
        assert_eq!(weekly, Utc.with_ymd_and_hms(2024, 3, 17, 6, 0, 0).unwrap());

        let monthly = next_run_after(now, ScheduleFrequency::Monthly);
        assert_eq!(monthly, Utc.with_ymd_and_hms(2024, 4, 10, 6, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn manual_run_generates_a_completed_report() {
        let url = "https://docs.google.com/spreadsheets/d/ok/edit";
        let mut responses = HashMap::new();
        responses.insert(
            url.to_string(),
            Ok(b"Region,Sales\nEU,10\nUS,30\n".to_vec()),
        );
        let (_dir, scheduler, store) = harness(StubSource { responses });
        let id = due_connection(&store, url, "Sales");

        let outcome = scheduler.run_connection(id, true).await.unwrap();
        let RunOutcome::ReportGenerated { report_id } = outcome else {
            panic!("expected a generated report");
        };

        let report = store.get_report("u1", report_id).unwrap();
        assert_eq!(report.processing_status, ProcessingStatus::Completed);
        assert_eq!(report.connection_id, Some(id));
        assert!(report.title.starts_with("Sales - "));

        let connection = store.get_connection("u1", id).unwrap();
        assert_eq!(connection.last_report_id, Some(report_id));
        assert!(connection.last_data_hash.is_some());
        assert!(connection.error_message.is_none());
        assert!(connection.next_run_at > Utc::now());
    }

    #[tokio::test]
    async fn scheduled_run_skips_unchanged_data_but_manual_does_not() {
        let url = "https://docs.google.com/spreadsheets/d/same/edit";
        let mut responses = HashMap::new();
        responses.insert(url.to_string(), Ok(b"A,B\n1,2\n".to_vec()));
        let (_dir, scheduler, store) = harness(StubSource { responses });
        let id = due_connection(&store, url, "Static");

        scheduler.run_connection(id, true).await.unwrap();
        assert_eq!(store.list_reports("u1").len(), 1);

        let outcome = scheduler.run_connection(id, false).await.unwrap();
        assert_eq!(outcome, RunOutcome::SkippedNoChanges);
        assert_eq!(store.list_reports("u1").len(), 1);

        let outcome = scheduler.run_connection(id, true).await.unwrap();
        assert!(matches!(outcome, RunOutcome::ReportGenerated { .. }));
        assert_eq!(store.list_reports("u1").len(), 2);
    }

    #[tokio::test]
    async fn one_failing_connection_does_not_stop_the_sweep() {
        let good = "https://docs.google.com/spreadsheets/d/good/edit";
        let bad = "https://docs.google.com/spreadsheets/d/bad/edit";
        let mut responses = HashMap::new();
        responses.insert(good.to_string(), Ok(b"A,B\n1,2\n".to_vec()));
        responses.insert(bad.to_string(), Err("403 Forbidden".to_string()));
        let (_dir, scheduler, store) = harness(StubSource { responses });
        let good_id = due_connection(&store, good, "Good");
        let bad_id = due_connection(&store, bad, "Bad");

        let summary = scheduler.sweep().await;
        assert_eq!(summary.results.len(), 2);

        let good_conn = store.get_connection("u1", good_id).unwrap();
        assert!(good_conn.error_message.is_none());
        assert!(good_conn.last_report_id.is_some());
        assert!(good_conn.next_run_at > Utc::now());

        let bad_conn = store.get_connection("u1", bad_id).unwrap();
        assert!(bad_conn.error_message.as_deref().unwrap().contains("403"));
        assert!(bad_conn.last_report_id.is_none());
        // A failed run stays due for the next sweep.
        assert!(bad_conn.next_run_at <= Utc::now());
    }

    #[tokio::test]
    async fn sweep_times_out_stuck_reports() {
        let (_dir, scheduler, store) = harness(StubSource {
            responses: HashMap::new(),
        });

        let mut stuck = Report::new("u1", "Stuck", "stuck.csv", "u1/stuck.csv", None);
        stuck.updated_at = Utc::now() - Duration::hours(2);
        let stuck_id = stuck.id;
        store.insert_report(stuck);

        let fresh = Report::new("u1", "Fresh", "fresh.csv", "u1/fresh.csv", None);
        let fresh_id = fresh.id;
        store.insert_report(fresh);

        let summary = scheduler.sweep().await;
        assert_eq!(summary.timed_out_reports, 1);

        let stuck = store.get_report("u1", stuck_id).unwrap();
        assert_eq!(stuck.processing_status, ProcessingStatus::Failed);
        assert_eq!(stuck.error_message.as_deref(), Some("Analysis timed out"));

        let fresh = store.get_report("u1", fresh_id).unwrap();
        assert_eq!(fresh.processing_status, ProcessingStatus::Processing);
    }

    #[tokio::test]
    async fn connect_rejects_unrecognized_urls() {
        let (_dir, scheduler, _store) = harness(StubSource {
            responses: HashMap::new(),
        });
        let result = scheduler.connect(
            "u1",
            "https://example.com/data.csv",
            "Mystery",
            ScheduleFrequency::Daily,
            None,
        );
        assert!(result.is_err());
    }
}

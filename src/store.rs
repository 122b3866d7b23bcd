use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::charts::ChartDescriptor;
use crate::error::AppError;
use crate::summary::{Kpi, TextSummary};

const SNAPSHOT_FILE: &str = "state.json.gz";
const BLOB_DIR: &str = "blobs";

/// Processing state of a report. Transitions only `processing → completed`
/// and `processing → failed`; terminal states are never left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Processing,
    Completed,
    Failed,
}

/// One unit of analysis output, derived from a single spreadsheet snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub owner_id: String,
    pub title: String,
    pub original_filename: String,
    pub storage_path: String,
    pub processing_status: ProcessingStatus,
    pub row_count: Option<usize>,
    pub column_count: Option<usize>,
    pub text_summary: Option<TextSummary>,
    pub kpis: Vec<Kpi>,
    pub chart_data: Vec<ChartDescriptor>,
    pub connection_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    pub fn new(
        owner_id: &str,
        title: &str,
        original_filename: &str,
        storage_path: &str,
        connection_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            original_filename: original_filename.to_string(),
            storage_path: storage_path.to_string(),
            processing_status: ProcessingStatus::Processing,
            row_count: None,
            column_count: None,
            text_summary: None,
            kpis: Vec::new(),
            chart_data: Vec::new(),
            connection_id,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetType {
    GoogleSheets,
    ExcelOnline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleFrequency {
    Daily,
    Weekly,
    Monthly,
}

/// A recurring binding to a remote spreadsheet URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub owner_id: String,
    pub sheet_url: String,
    pub sheet_type: SheetType,
    pub sheet_name: String,
    pub schedule_frequency: ScheduleFrequency,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub error_message: Option<String>,
    pub last_report_id: Option<Uuid>,
    pub last_data_hash: Option<String>,
    /// Optional address notified when a scheduled report completes.
    pub notify_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    reports: HashMap<Uuid, Report>,
    connections: HashMap<Uuid, Connection>,
}

struct SignedUrl {
    blob_path: String,
    expires_at: DateTime<Utc>,
}

/// Durable state gateway: report rows, connection rows and the blob store
///
/// Stands in for the hosted BaaS: the rest of the service only ever asks
/// for row insert/query/update, blob put/get, and time-limited signed
/// URLs. Rows live in memory and are snapshot to a gzip-compressed JSON
/// file after every mutation; blobs are plain files under the data
/// directory, scoped by owner id.
pub struct Store {
    data_dir: PathBuf,
    state: RwLock<StoreState>,
    signed: Mutex<HashMap<String, SignedUrl>>,
}

impl Store {
    /// Open the store rooted at `data_dir`, loading any previous snapshot.
    pub fn open(data_dir: &Path) -> Result<Self, AppError> {
        fs::create_dir_all(data_dir.join(BLOB_DIR))?;

        let snapshot = data_dir.join(SNAPSHOT_FILE);
        let state = if snapshot.exists() {
            let file = File::open(&snapshot)?;
            let decoder = GzDecoder::new(file);
            let reader = std::io::BufReader::new(decoder);
            serde_json::from_reader(reader).map_err(|e| {
                AppError::Internal(format!("corrupt state snapshot: {e}"))
            })?
        } else {
            StoreState::default()
        };

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            state: RwLock::new(state),
            signed: Mutex::new(HashMap::new()),
        })
    }

    fn persist(&self, state: &StoreState) {
        let path = self.data_dir.join(SNAPSHOT_FILE);
        let result = File::create(&path).and_then(|file| {
            let encoder = GzEncoder::new(file, Compression::default());
            let mut writer = std::io::BufWriter::new(encoder);
            serde_json::to_writer(&mut writer, state)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            writer
                .into_inner()
                .map_err(|e| e.into_error())?
                .finish()?;
            Ok(())
        });
        if let Err(e) = result {
            log::error!("failed to write state snapshot: {e}");
        }
    }

    // ---- reports ----

    pub fn insert_report(&self, report: Report) {
        let mut state = self.state.write().expect("store lock");
        state.reports.insert(report.id, report);
        self.persist(&state);
    }

    pub fn get_report(&self, owner_id: &str, id: Uuid) -> Option<Report> {
        let state = self.state.read().expect("store lock");
        state
            .reports
            .get(&id)
            .filter(|r| r.owner_id == owner_id)
            .cloned()
    }

    pub fn get_report_any(&self, id: Uuid) -> Option<Report> {
        let state = self.state.read().expect("store lock");
        state.reports.get(&id).cloned()
    }

    /// All reports for one owner, newest first.
    pub fn list_reports(&self, owner_id: &str) -> Vec<Report> {
        let state = self.state.read().expect("store lock");
        let mut reports: Vec<Report> = state
            .reports
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        reports
    }

    /// Move a report from `processing` to `completed`, attaching results.
    /// A report already in a terminal state is left untouched.
    pub fn complete_report(
        &self,
        id: Uuid,
        row_count: usize,
        column_count: usize,
        text_summary: Option<TextSummary>,
        kpis: Vec<Kpi>,
        chart_data: Vec<ChartDescriptor>,
    ) -> bool {
        let mut state = self.state.write().expect("store lock");
        let Some(report) = state.reports.get_mut(&id) else {
            return false;
        };
        if report.processing_status != ProcessingStatus::Processing {
            log::warn!("ignoring completion of report {id} in terminal state");
            return false;
        }
        report.processing_status = ProcessingStatus::Completed;
        report.row_count = Some(row_count);
        report.column_count = Some(column_count);
        report.text_summary = text_summary;
        report.kpis = kpis;
        report.chart_data = chart_data;
        report.error_message = None;
        report.updated_at = Utc::now();
        self.persist(&state);
        true
    }

    /// Move a report from `processing` to `failed` with an error message.
    /// A report already in a terminal state is left untouched.
    pub fn fail_report(&self, id: Uuid, message: &str) -> bool {
        let mut state = self.state.write().expect("store lock");
        let Some(report) = state.reports.get_mut(&id) else {
            return false;
        };
        if report.processing_status != ProcessingStatus::Processing {
            log::warn!("ignoring failure of report {id} in terminal state");
            return false;
        }
        report.processing_status = ProcessingStatus::Failed;
        report.error_message = Some(crate::error::truncate_message(message, 500));
        report.updated_at = Utc::now();
        self.persist(&state);
        true
    }

    /// Delete a report: blob first, then the row.
    pub fn delete_report(&self, owner_id: &str, id: Uuid) -> Result<(), AppError> {
        let report = self
            .get_report(owner_id, id)
            .ok_or_else(|| AppError::NotFound("Report not found or access denied".to_string()))?;

        if let Err(e) = self.delete_blob(&report.storage_path) {
            // The row still goes away; an orphan blob is preferable to a
            // row pointing at nothing.
            log::error!("failed to delete blob {}: {e}", report.storage_path);
        }

        let mut state = self.state.write().expect("store lock");
        state.reports.remove(&id);
        self.persist(&state);
        Ok(())
    }

    /// Reports stuck in `processing` since before `cutoff`.
    pub fn stale_processing_reports(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let state = self.state.read().expect("store lock");
        state
            .reports
            .values()
            .filter(|r| r.processing_status == ProcessingStatus::Processing && r.updated_at < cutoff)
            .map(|r| r.id)
            .collect()
    }

    // ---- connections ----

    pub fn insert_connection(&self, connection: Connection) {
        let mut state = self.state.write().expect("store lock");
        state.connections.insert(connection.id, connection);
        self.persist(&state);
    }

    pub fn get_connection(&self, owner_id: &str, id: Uuid) -> Option<Connection> {
        let state = self.state.read().expect("store lock");
        state
            .connections
            .get(&id)
            .filter(|c| c.owner_id == owner_id)
            .cloned()
    }

    pub fn get_connection_any(&self, id: Uuid) -> Option<Connection> {
        let state = self.state.read().expect("store lock");
        state.connections.get(&id).cloned()
    }

    pub fn list_connections(&self, owner_id: &str) -> Vec<Connection> {
        let state = self.state.read().expect("store lock");
        let mut connections: Vec<Connection> = state
            .connections
            .values()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect();
        connections.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        connections
    }

    /// Active connections whose next run is due at or before `now`.
    pub fn due_connections(&self, now: DateTime<Utc>) -> Vec<Connection> {
        let state = self.state.read().expect("store lock");
        let mut due: Vec<Connection> = state
            .connections
            .values()
            .filter(|c| c.is_active && c.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
        due
    }

    pub fn set_connection_active(&self, owner_id: &str, id: Uuid, active: bool) -> Option<bool> {
        let mut state = self.state.write().expect("store lock");
        let connection = state
            .connections
            .get_mut(&id)
            .filter(|c| c.owner_id == owner_id)?;
        connection.is_active = active;
        self.persist(&state);
        Some(active)
    }

    pub fn delete_connection(&self, owner_id: &str, id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.write().expect("store lock");
        let found = state
            .connections
            .get(&id)
            .map(|c| c.owner_id == owner_id)
            .unwrap_or(false);
        if !found {
            return Err(AppError::NotFound("Connection not found".to_string()));
        }
        state.connections.remove(&id);
        self.persist(&state);
        Ok(())
    }

    /// Record a successful fetch+ingest cycle on a connection.
    pub fn record_connection_success(
        &self,
        id: Uuid,
        next_run_at: DateTime<Utc>,
        report_id: Uuid,
        data_hash: &str,
    ) {
        let now = Utc::now();
        let mut state = self.state.write().expect("store lock");
        if let Some(connection) = state.connections.get_mut(&id) {
            connection.last_run_at = Some(now);
            connection.last_checked_at = Some(now);
            connection.next_run_at = next_run_at;
            connection.last_report_id = Some(report_id);
            connection.last_data_hash = Some(data_hash.to_string());
            connection.error_message = None;
            self.persist(&state);
        }
    }

    /// Record a scheduled run that found no changes in the sheet.
    pub fn record_connection_skip(&self, id: Uuid, next_run_at: DateTime<Utc>) {
        let mut state = self.state.write().expect("store lock");
        if let Some(connection) = state.connections.get_mut(&id) {
            connection.last_checked_at = Some(Utc::now());
            connection.next_run_at = next_run_at;
            connection.error_message = None;
            self.persist(&state);
        }
    }

    /// Record a failed cycle. `next_run_at` is deliberately left unchanged
    /// so the connection is retried at the next scheduled sweep.
    pub fn record_connection_error(&self, id: Uuid, message: &str) {
        let mut state = self.state.write().expect("store lock");
        if let Some(connection) = state.connections.get_mut(&id) {
            connection.error_message =
                Some(crate::error::truncate_message(message, 500));
            connection.last_checked_at = Some(Utc::now());
            self.persist(&state);
        }
    }

    // ---- blobs ----

    fn blob_path(&self, rel: &str) -> Result<PathBuf, AppError> {
        let clean = rel.trim_start_matches('/');
        if clean.is_empty() || clean.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(AppError::BadRequest("Invalid storage path".to_string()));
        }
        Ok(self.data_dir.join(BLOB_DIR).join(clean))
    }

    pub fn put_blob(&self, rel: &str, bytes: &[u8]) -> Result<(), AppError> {
        let path = self.blob_path(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn get_blob(&self, rel: &str) -> Result<Vec<u8>, AppError> {
        let path = self.blob_path(rel)?;
        fs::read(path).map_err(AppError::from)
    }

    pub fn delete_blob(&self, rel: &str) -> Result<(), AppError> {
        let path = self.blob_path(rel)?;
        fs::remove_file(path).map_err(AppError::from)
    }

    // ---- signed URLs ----

    /// Mint a capability token granting read access to one blob for `ttl`.
    pub fn mint_signed_token(&self, rel: &str, ttl: Duration) -> String {
        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        let token: String = (0..32)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect();

        let mut signed = self.signed.lock().expect("signed url lock");
        let now = Utc::now();
        signed.retain(|_, entry| entry.expires_at > now);
        signed.insert(
            token.clone(),
            SignedUrl {
                blob_path: rel.to_string(),
                expires_at: now + ttl,
            },
        );
        token
    }

    /// Resolve a signed token to its blob path and bytes while it is live.
    pub fn resolve_signed_token(&self, token: &str) -> Option<(String, Vec<u8>)> {
        let blob_path = {
            let signed = self.signed.lock().expect("signed url lock");
            let entry = signed.get(token)?;
            if entry.expires_at <= Utc::now() {
                return None;
            }
            entry.blob_path.clone()
        };
        let bytes = self.get_blob(&blob_path).ok()?;
        Some((blob_path, bytes))
    }
}

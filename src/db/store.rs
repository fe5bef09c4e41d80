//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Export error: {0}")]
    Export(#[from] rust_xlsxwriter::XlsxError),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Connection lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Thread-safe persistence for sample series, reports and the job manifest.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    export_dir: PathBuf,
}

impl Store {
    /// Open (or create) the database at `path`. Spreadsheet exports are
    /// written under `export_dir`.
    pub fn new<P: AsRef<Path>, E: Into<PathBuf>>(path: P, export_dir: E) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            export_dir: export_dir.into(),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    // --- Manifest ---

    /// Record a job in the manifest. Returns false, leaving the existing row
    /// untouched, when the id is already taken.
    pub fn register_job(&self, job_id: &str, target: &str, started_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let started = db_time(&started_at);
        let inserted = conn.execute(
            "INSERT INTO jobs (job_id, target, started_at, last_modified) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(job_id) DO NOTHING",
            params![job_id, target, started],
        )?;
        Ok(inserted == 1)
    }

    /// Drop a manifest row that never received samples.
    pub fn release_job(&self, job_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM jobs WHERE job_id = ?1
             AND NOT EXISTS (SELECT 1 FROM samples WHERE samples.job_id = ?1)",
            params![job_id],
        )?;
        Ok(())
    }

    /// List every job that has persisted samples, newest first.
    pub fn list_known_jobs(&self) -> Result<Vec<KnownJob>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT j.job_id, j.target, j.started_at, COUNT(s.id),
                    SUM(LENGTH(s.timestamp) + LENGTH(s.target) + LENGTH(s.status)
                        + COALESCE(LENGTH(s.error), 0) + 8)
             FROM jobs j
             JOIN samples s ON s.job_id = j.job_id
             GROUP BY j.job_id
             ORDER BY j.started_at DESC",
        )?;

        let jobs = stmt
            .query_map([], |row| {
                let started: String = row.get(2)?;
                Ok(KnownJob {
                    job_id: row.get(0)?,
                    target: row.get(1)?,
                    started_at: parse_db_time(&started).unwrap_or_else(Utc::now),
                    sample_count: row.get(3)?,
                    size_bytes: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(jobs)
    }

    // --- Samples ---

    /// Append samples to a job's series in one transaction.
    pub fn append_samples(&self, job_id: &str, samples: &[Sample]) -> Result<(), StoreError> {
        let Some(first) = samples.first() else {
            return Ok(());
        };

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO samples (job_id, timestamp, target, response_time, status, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for s in samples {
                stmt.execute(params![
                    job_id,
                    db_time(&s.timestamp),
                    s.target,
                    s.response_time(),
                    s.status().as_str(),
                    s.error_message(),
                ])?;
            }
        }

        tx.execute(
            "INSERT INTO jobs (job_id, target, started_at, last_modified) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_id) DO UPDATE SET last_modified = excluded.last_modified",
            params![job_id, first.target, db_time(&first.timestamp), db_time(&Utc::now())],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Load a job's full series in append order.
    pub fn load_samples(&self, job_id: &str) -> Result<Vec<Sample>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, target, response_time, status, error FROM samples
             WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], read_sample_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        if rows.is_empty() {
            return Err(StoreError::NotFound);
        }
        rows.into_iter().map(sample_from_row).collect()
    }

    /// Load at most `limit` of the newest samples, oldest first.
    pub fn load_recent_samples(&self, job_id: &str, limit: usize) -> Result<Vec<Sample>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, target, response_time, status, error FROM samples
             WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![job_id, limit as i64], read_sample_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        if rows.is_empty() {
            return Err(StoreError::NotFound);
        }
        rows.reverse();
        rows.into_iter().map(sample_from_row).collect()
    }

    // --- Reports ---

    pub fn save_report(&self, job_id: &str, report: &Report) -> Result<(), StoreError> {
        let doc = serde_json::to_string(report)?;
        let now = db_time(&Utc::now());

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO reports (job_id, report, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(job_id) DO UPDATE SET report = excluded.report, created_at = excluded.created_at",
            params![job_id, doc, now],
        )?;
        tx.execute(
            "UPDATE jobs SET last_modified = ?2 WHERE job_id = ?1",
            params![job_id, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_report(&self, job_id: &str) -> Result<Report, StoreError> {
        let conn = self.conn()?;
        let doc: Option<String> = conn
            .query_row(
                "SELECT report FROM reports WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;

        let doc = doc.ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_str(&doc)?)
    }

    // --- Retention ---

    /// Delete every series, report and manifest row last written before
    /// `cutoff`, plus export artifacts whose file mtime precedes it. Jobs in
    /// `active` and their exports are never touched.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>, active: &[String]) -> Result<PurgeSummary, StoreError> {
        let cutoff_str = db_time(&cutoff);
        let mut summary = PurgeSummary::default();

        {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let stale: Vec<String> = {
                let mut stmt = tx.prepare("SELECT job_id FROM jobs WHERE last_modified < ?1")?;
                let ids = stmt
                    .query_map(params![cutoff_str], |row| row.get(0))?
                    .collect::<SqlResult<Vec<String>>>()?;
                ids.into_iter().filter(|id| !active.contains(id)).collect()
            };

            for job_id in &stale {
                summary.samples += tx.execute("DELETE FROM samples WHERE job_id = ?1", params![job_id])?;
                summary.reports += tx.execute("DELETE FROM reports WHERE job_id = ?1", params![job_id])?;
                summary.jobs += tx.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
            }
            tx.commit()?;
        }

        let protected: Vec<String> = active.iter().map(|id| export_file_name(id)).collect();
        summary.artifacts = self.purge_artifacts(cutoff, &protected)?;
        Ok(summary)
    }

    fn purge_artifacts(&self, cutoff: DateTime<Utc>, protected: &[String]) -> Result<usize, StoreError> {
        let entries = match std::fs::read_dir(&self.export_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() || protected.iter().any(|name| entry.file_name() == name.as_str()) {
                continue;
            }
            let modified: DateTime<Utc> = meta.modified()?.into();
            if modified < cutoff {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!("Failed to remove {}: {}", entry.path().display(), e),
                }
            }
        }
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) fn set_last_modified(&self, job_id: &str, when: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET last_modified = ?2 WHERE job_id = ?1",
            params![job_id, db_time(&when)],
        )?;
        Ok(())
    }
}

/// File name of a job's spreadsheet export.
pub(crate) fn export_file_name(job_id: &str) -> String {
    format!("export_{}.xlsx", job_id)
}

type SampleRow = (String, String, Option<f64>, String, Option<String>);

fn read_sample_row(row: &rusqlite::Row<'_>) -> SqlResult<SampleRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn sample_from_row((timestamp, target, response_time, status, error): SampleRow) -> Result<Sample, StoreError> {
    let timestamp = parse_db_time(&timestamp)
        .ok_or_else(|| StoreError::InvalidData(format!("bad timestamp: {}", timestamp)))?;
    let status: SampleStatus = status.parse().map_err(StoreError::InvalidData)?;

    let sample = match status {
        SampleStatus::Success => {
            let latency = response_time
                .ok_or_else(|| StoreError::InvalidData("success sample without latency".to_string()))?;
            Sample::success(timestamp, &target, latency)
        }
        SampleStatus::Timeout => Sample::timeout(timestamp, &target),
        SampleStatus::Error => Sample::error(timestamp, &target, error.unwrap_or_default()),
    };
    Ok(sample)
}

fn db_time(dt: &DateTime<Utc>) -> String {
    dt.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, DB_TIME_FORMAT) {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

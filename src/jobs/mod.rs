//! Persistent job records.
//!
//! A job record is a flat map of attributes keyed by `jobId`. Stages only
//! ever set whole attributes; nothing here deletes a record.

pub mod tracker;

pub use tracker::StatusTracker;

use crate::models::{InsuranceType, JobStatus, Language};
use crate::store::{safe_identifier, StoreError};
use chrono::Utc;
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Attributes of one job.
pub type JobRecord = Map<String, Value>;

/// Storage for job records.
pub trait JobStore: Send + Sync {
    /// Fetch a record, `None` when the job does not exist.
    fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Set `fields` on the record in one write, creating it when absent.
    fn update(&self, job_id: &str, fields: JobRecord) -> Result<(), StoreError>;

    /// All job ids, sorted.
    fn list_ids(&self) -> Result<Vec<String>, StoreError>;
}

fn validate_job_id(job_id: &str) -> Result<(), StoreError> {
    if job_id.is_empty() || safe_identifier(job_id) != job_id {
        return Err(StoreError::InvalidKey(job_id.to_string()));
    }
    Ok(())
}

/// SQLite-backed job store holding one row per `(job_id, field)`.
///
/// An update upserts only the fields it names inside one transaction, so
/// concurrent writers touching different fields never overwrite each other.
/// Values are stored as JSON text.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

impl SqliteJobStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let key = path.display().to_string();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                key: key.clone(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(|source| StoreError::Database {
            key: key.clone(),
            source,
        })?;
        Self::init(conn, &key)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Database {
            key: ":memory:".to_string(),
            source,
        })?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, key: &str) -> Result<Self, StoreError> {
        let db_err = |source| StoreError::Database {
            key: key.to_string(),
            source,
        };
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS job_fields (
                job_id TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (job_id, field)
            )",
            [],
        )
        .map_err(db_err)?;
        debug!(db = key, "Opened job store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobStore for SqliteJobStore {
    fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        validate_job_id(job_id)?;
        let db_err = |source| StoreError::Database {
            key: job_id.to_string(),
            source,
        };

        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT field, value FROM job_fields WHERE job_id = ?1 ORDER BY rowid",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;

        let mut record = JobRecord::new();
        for row in rows {
            let (field, raw) = row.map_err(db_err)?;
            let value = serde_json::from_str(&raw).map_err(|source| StoreError::Json {
                key: format!("{}/{}", job_id, field),
                source,
            })?;
            record.insert(field, value);
        }
        Ok((!record.is_empty()).then_some(record))
    }

    fn update(&self, job_id: &str, fields: JobRecord) -> Result<(), StoreError> {
        validate_job_id(job_id)?;
        let db_err = |source| StoreError::Database {
            key: job_id.to_string(),
            source,
        };

        let mut rows = Vec::with_capacity(fields.len() + 1);
        rows.push(("jobId".to_string(), Value::String(job_id.to_string()).to_string()));
        for (field, value) in fields {
            let raw = serde_json::to_string(&value).map_err(|source| StoreError::Json {
                key: format!("{}/{}", job_id, field),
                source,
            })?;
            rows.push((field, raw));
        }

        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO job_fields (job_id, field, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT (job_id, field) DO UPDATE SET value = excluded.value",
                )
                .map_err(db_err)?;
            for (field, raw) in &rows {
                stmt.execute(params![job_id, field, raw]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;

        debug!(job_id, fields = rows.len() - 1, "Updated job record");
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let db_err = |source| StoreError::Database {
            key: "job_fields".to_string(),
            source,
        };
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached("SELECT DISTINCT job_id FROM job_fields ORDER BY job_id")
            .map_err(db_err)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(ids)
    }
}

/// In-memory job store.
#[derive(Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(job_id).cloned())
    }

    fn update(&self, job_id: &str, fields: JobRecord) -> Result<(), StoreError> {
        validate_job_id(job_id)?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(job_id.to_string()).or_default();
        record.insert("jobId".to_string(), Value::String(job_id.to_string()));
        record.extend(fields);
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Parameters for a new upload.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub filename: String,
    pub insurance_type: String,
    pub language: String,
    /// Shared by jobs uploaded together; a fresh id when `None`.
    pub batch_id: Option<String>,
}

/// Identifiers of a freshly created job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedJob {
    pub job_id: String,
    pub batch_id: String,
    pub s3_key: String,
    pub status: JobStatus,
    pub insurance_type: InsuranceType,
}

/// Create the initial CREATED record for an uploaded document.
pub fn create_job(store: &dyn JobStore, request: &NewJob) -> Result<CreatedJob, StoreError> {
    let filename = request.filename.trim();
    if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
        return Err(StoreError::InvalidKey(request.filename.clone()));
    }

    let job_id = Uuid::new_v4().to_string();
    let batch_id = request
        .batch_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let s3_key = format!("uploads/{}/{}", job_id, filename);
    let insurance_type = InsuranceType::from_label(&request.insurance_type);
    let language = Language::from_code(&request.language);

    let mut fields = JobRecord::new();
    fields.insert("batchId".into(), Value::String(batch_id.clone()));
    fields.insert("status".into(), Value::String(JobStatus::Created.to_string()));
    fields.insert("uploadTimestamp".into(), Value::String(Utc::now().to_rfc3339()));
    fields.insert("originalFilename".into(), Value::String(filename.to_string()));
    fields.insert("s3Key".into(), Value::String(s3_key.clone()));
    fields.insert("insuranceType".into(), Value::String(insurance_type.to_string()));
    fields.insert("userLanguage".into(), Value::String(language.code().to_string()));
    store.update(&job_id, fields)?;

    info!(job_id = %job_id, filename, "Created job");
    Ok(CreatedJob {
        job_id,
        batch_id,
        s3_key,
        status: JobStatus::Created,
        insurance_type,
    })
}

/// Summaries of all jobs, newest upload first.
pub fn list_jobs(store: &dyn JobStore) -> Result<Vec<JobRecord>, StoreError> {
    const SUMMARY_FIELDS: &[&str] = &[
        "jobId",
        "status",
        "uploadTimestamp",
        "originalFilename",
        "documentType",
        "insuranceType",
        "batchId",
    ];

    let mut jobs = Vec::new();
    for id in store.list_ids()? {
        let Some(record) = store.get(&id)? else {
            continue;
        };
        let summary: JobRecord = SUMMARY_FIELDS
            .iter()
            .map(|field| {
                let value = record
                    .get(*field)
                    .cloned()
                    .unwrap_or_else(|| Value::String(String::new()));
                (field.to_string(), value)
            })
            .collect();
        jobs.push(summary);
    }

    let upload = |job: &JobRecord| {
        job.get("uploadTimestamp")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    jobs.sort_by_key(|job| std::cmp::Reverse(upload(job)));
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn fields(value: Value) -> JobRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_sqlite_store_update_merges_fields() {
        let dir = TempDir::new().unwrap();
        let store = SqliteJobStore::open(dir.path().join("jobs.db")).unwrap();

        store.update("job-1", fields(json!({"status": "CREATED"}))).unwrap();
        store
            .update("job-1", fields(json!({"status": "SCORING", "x": 1, "nested": {"a": [1]}})))
            .unwrap();

        let record = store.get("job-1").unwrap().unwrap();
        assert_eq!(record["jobId"], json!("job-1"));
        assert_eq!(record["status"], json!("SCORING"));
        assert_eq!(record["x"], json!(1));
        assert_eq!(record["nested"], json!({"a": [1]}));
        let order: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(order, vec!["jobId", "status", "x", "nested"]);
        assert!(store.get("job-2").unwrap().is_none());
        assert_eq!(store.list_ids().unwrap(), vec!["job-1"]);

        // Records survive reopening the database.
        drop(store);
        let reopened = SqliteJobStore::open(dir.path().join("jobs.db")).unwrap();
        assert_eq!(reopened.get("job-1").unwrap().unwrap()["x"], json!(1));
    }

    #[test]
    fn test_concurrent_writers_keep_distinct_fields() {
        const ROUNDS: usize = 200;
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("jobs.db");
        SqliteJobStore::open(&db).unwrap();

        let writers: Vec<_> = ["analysisTimestamp", "detectionTimestamp"]
            .into_iter()
            .map(|field| {
                let db = db.clone();
                std::thread::spawn(move || {
                    // Each writer has its own connection, like separate unit processes.
                    let store = SqliteJobStore::open(&db).unwrap();
                    for round in 0..ROUNDS {
                        let mut update = JobRecord::new();
                        update.insert(field.to_string(), json!(round));
                        store.update(&format!("job-{}", round), update).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let store = SqliteJobStore::open(&db).unwrap();
        for round in 0..ROUNDS {
            let record = store.get(&format!("job-{}", round)).unwrap().unwrap();
            assert_eq!(record["analysisTimestamp"], json!(round), "round {}", round);
            assert_eq!(record["detectionTimestamp"], json!(round), "round {}", round);
        }
        assert_eq!(store.list_ids().unwrap().len(), ROUNDS);
    }

    #[test]
    fn test_sqlite_store_rejects_path_like_job_ids() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        assert!(matches!(
            store.update("../x", JobRecord::new()),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(store.get("a/b").is_err());
    }

    #[test]
    fn test_rejects_path_like_job_ids() {
        let store = MemoryJobStore::new();
        assert!(store.update("../x", JobRecord::new()).is_err());
        assert!(store.update("", JobRecord::new()).is_err());
    }

    #[test]
    fn test_create_job_record() {
        let store = MemoryJobStore::new();
        let created = create_job(
            &store,
            &NewJob {
                filename: "application.pdf".to_string(),
                insurance_type: "auto".to_string(),
                language: "de-DE".to_string(),
                batch_id: None,
            },
        )
        .unwrap();

        assert_eq!(created.insurance_type, InsuranceType::PropertyCasualty);
        assert_eq!(
            created.s3_key,
            format!("uploads/{}/application.pdf", created.job_id)
        );

        let record = store.get(&created.job_id).unwrap().unwrap();
        assert_eq!(record["status"], json!("CREATED"));
        assert_eq!(record["insuranceType"], json!("property_casualty"));
        assert_eq!(record["userLanguage"], json!("de-DE"));
        assert_eq!(record["batchId"], json!(created.batch_id));
        assert!(record["uploadTimestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_create_job_rejects_bad_filename() {
        let store = MemoryJobStore::new();
        let request = NewJob {
            filename: "../etc/passwd".to_string(),
            insurance_type: "life".to_string(),
            language: "en-US".to_string(),
            batch_id: None,
        };
        assert!(create_job(&store, &request).is_err());
    }

    #[test]
    fn test_list_jobs_newest_first() {
        let store = MemoryJobStore::new();
        store
            .update("a", fields(json!({"uploadTimestamp": "2024-01-01T00:00:00+00:00"})))
            .unwrap();
        store
            .update("b", fields(json!({"uploadTimestamp": "2024-03-01T00:00:00+00:00"})))
            .unwrap();

        let jobs = list_jobs(&store).unwrap();
        assert_eq!(jobs[0]["jobId"], json!("b"));
        assert_eq!(jobs[1]["jobId"], json!("a"));
        assert_eq!(jobs[1]["status"], json!(""));
    }
}

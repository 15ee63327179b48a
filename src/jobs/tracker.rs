//! Job status transitions and stage-output persistence.

use super::{JobRecord, JobStore};
use crate::models::JobStatus;
use crate::store::StoreError;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Records lifecycle stages and milestone timestamps on job records.
///
/// Status updates are best effort: a failed write is logged and swallowed so
/// that a storage hiccup never aborts the stage doing the real work.
#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn JobStore>,
    strict: bool,
}

impl StatusTracker {
    /// Permissive tracker: any status may follow any status.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            strict: false,
        }
    }

    /// Tracker that refuses transitions outside the normal progression.
    pub fn strict(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            strict: true,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Set `status` with its milestone timestamp, `lastUpdated` and `extra`
    /// in one update.
    pub fn set_status(&self, job_id: &str, status: JobStatus, extra: JobRecord) {
        if self.strict && !self.transition_allowed(job_id, status) {
            return;
        }

        let now = Utc::now().to_rfc3339();
        let mut fields = JobRecord::new();
        fields.insert("status".into(), Value::String(status.to_string()));
        fields.insert(status.timestamp_field().into(), Value::String(now.clone()));
        fields.insert("lastUpdated".into(), Value::String(now));
        fields.extend(extra);

        match self.store.update(job_id, fields) {
            Ok(()) => debug!(job_id, status = %status, "Job status updated"),
            Err(e) => error!(job_id, status = %status, "Failed to update job status: {}", e),
        }
    }

    /// Mark the job FAILED with an error message.
    pub fn fail(&self, job_id: &str, message: &str) {
        let mut extra = JobRecord::new();
        extra.insert("errorMessage".into(), Value::String(message.to_string()));
        self.set_status(job_id, JobStatus::Failed, extra);
    }

    /// Replace a stage-output field with serialized `value` and stamp it.
    pub fn write_output(
        &self,
        job_id: &str,
        field: &str,
        timestamp_field: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(value).map_err(|source| StoreError::Json {
            key: format!("{}/{}", job_id, field),
            source,
        })?;
        let mut fields = JobRecord::new();
        fields.insert(field.to_string(), Value::String(serialized));
        fields.insert(
            timestamp_field.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        self.store.update(job_id, fields)
    }

    /// Set plain fields without touching the status.
    pub fn set_fields(&self, job_id: &str, fields: JobRecord) -> Result<(), StoreError> {
        self.store.update(job_id, fields)
    }

    /// Read a string field, `default` when the field or the record is missing.
    pub fn get_field(&self, job_id: &str, field: &str, default: &str) -> String {
        match self.get_value(job_id, field) {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => default.to_string(),
        }
    }

    /// Read a raw field value.
    pub fn get_value(&self, job_id: &str, field: &str) -> Option<Value> {
        match self.store.get(job_id) {
            Ok(Some(record)) => record.get(field).cloned(),
            Ok(None) => None,
            Err(e) => {
                warn!(job_id, field, "Failed to read job record: {}", e);
                None
            }
        }
    }

    /// Current status, if the record exists and holds a known value.
    pub fn current_status(&self, job_id: &str) -> Option<JobStatus> {
        self.get_value(job_id, "status")
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()))
    }

    fn transition_allowed(&self, job_id: &str, next: JobStatus) -> bool {
        let Some(current) = self.current_status(job_id) else {
            return true;
        };
        if current.can_transition_to(next) {
            return true;
        }
        warn!(
            job_id,
            from = %current,
            to = %next,
            "Refusing status transition outside the progression"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MemoryJobStore;
    use serde_json::json;

    fn tracker(strict: bool) -> StatusTracker {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        if strict {
            StatusTracker::strict(store)
        } else {
            StatusTracker::new(store)
        }
    }

    fn extra(value: Value) -> JobRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_set_status_writes_timestamps_and_extras() {
        let t = tracker(false);
        t.set_status("j1", JobStatus::Scoring, extra(json!({"note": "x"})));

        let record = t.store().get("j1").unwrap().unwrap();
        assert_eq!(record["status"], json!("SCORING"));
        assert_eq!(record["note"], json!("x"));
        assert_eq!(record["scoringStartTimestamp"], record["lastUpdated"]);
    }

    #[test]
    fn test_permissive_allows_any_order() {
        let t = tracker(false);
        t.set_status("j1", JobStatus::Complete, JobRecord::new());
        t.set_status("j1", JobStatus::Extracting, JobRecord::new());
        assert_eq!(t.current_status("j1"), Some(JobStatus::Extracting));
    }

    #[test]
    fn test_strict_refuses_backwards() {
        let t = tracker(true);
        t.set_status("j1", JobStatus::Scoring, JobRecord::new());
        t.set_status("j1", JobStatus::Extracting, JobRecord::new());
        assert_eq!(t.current_status("j1"), Some(JobStatus::Scoring));

        t.fail("j1", "boom");
        assert_eq!(t.current_status("j1"), Some(JobStatus::Failed));
        assert_eq!(t.get_field("j1", "errorMessage", ""), "boom");
    }

    #[test]
    fn test_get_field_defaults() {
        let t = tracker(false);
        assert_eq!(t.get_field("missing", "userLanguage", "en-US"), "en-US");
        t.set_status("j1", JobStatus::Created, JobRecord::new());
        assert_eq!(t.get_field("j1", "insuranceType", "property_casualty"), "property_casualty");
    }

    #[test]
    fn test_write_output_replaces_whole_field() {
        let t = tracker(false);
        t.write_output("j1", "analysisOutputJsonStr", "analysisTimestamp", &json!({"a": 1}))
            .unwrap();
        t.write_output("j1", "analysisOutputJsonStr", "analysisTimestamp", &json!({"b": 2}))
            .unwrap();

        let stored = t.get_field("j1", "analysisOutputJsonStr", "");
        assert_eq!(serde_json::from_str::<Value>(&stored).unwrap(), json!({"b": 2}));
        assert!(t.get_value("j1", "analysisTimestamp").is_some());
    }

    #[test]
    fn test_invalid_job_id_is_swallowed() {
        let t = tracker(false);
        t.set_status("../bad", JobStatus::Scoring, JobRecord::new());
        assert!(t.store().list_ids().unwrap().is_empty());
    }
}

/*!
Durable session records.

A record is created when a session is started and no active record exists for the
(project, operator) pair. It is mutated on container recreation (container id only) and on
termination (status and end time), and never deleted.

Implementations:
- `MemorySessionStore`: process-local, for tests and one-off tools.
- `FileSessionStore`: JSON document with atomic replace and an exclusive lock file.
*/

pub mod file;
pub mod memory;
pub mod project;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub project_id: String,
    pub operator_id: String,
    pub container_id: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new_active(
        id: String,
        project_id: &str,
        operator_id: &str,
        container_id: String,
    ) -> Self {
        SessionRecord {
            id,
            project_id: project_id.to_string(),
            operator_id: operator_id.to_string(),
            container_id,
            status: SessionStatus::Active,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub container_id: Option<String>,
    pub status: Option<SessionStatus>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RecordUpdate {
    pub fn container(id: impl Into<String>) -> Self {
        RecordUpdate {
            container_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn terminated(at: DateTime<Utc>) -> Self {
        RecordUpdate {
            status: Some(SessionStatus::Terminated),
            end_time: Some(at),
            ..Default::default()
        }
    }

    fn apply(&self, rec: &mut SessionRecord) {
        if let Some(c) = &self.container_id {
            rec.container_id = c.clone();
        }
        if let Some(s) = self.status {
            rec.status = s;
        }
        if let Some(t) = self.end_time {
            rec.end_time = Some(t);
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("an active session already exists for this project: {0}")]
    DuplicateActive(String),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store is corrupt: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn find_active(
        &self,
        project_id: &str,
        operator_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Insert a new active record. Fails with `DuplicateActive` when the pair already has one.
    async fn create(&self, record: SessionRecord) -> Result<(), StoreError>;

    async fn update(&self, id: &str, update: RecordUpdate) -> Result<SessionRecord, StoreError>;

    /// Active records owned by `operator_id`, oldest first.
    async fn list_active_for(&self, operator_id: &str) -> Result<Vec<SessionRecord>, StoreError>;
}

/// Shared insert rule for map-backed stores.
pub(crate) fn insert_record(
    records: &mut Vec<SessionRecord>,
    record: SessionRecord,
) -> Result<(), StoreError> {
    if let Some(existing) = records.iter().find(|r| {
        r.is_active() && r.project_id == record.project_id && r.operator_id == record.operator_id
    }) {
        return Err(StoreError::DuplicateActive(existing.id.clone()));
    }
    if records.iter().any(|r| r.id == record.id) {
        return Err(StoreError::Corrupt(format!("duplicate id {}", record.id)));
    }
    records.push(record);
    Ok(())
}

pub(crate) fn update_record(
    records: &mut [SessionRecord],
    id: &str,
    update: &RecordUpdate,
) -> Result<SessionRecord, StoreError> {
    let rec = records
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    update.apply(rec);
    Ok(rec.clone())
}

pub(crate) fn active_for(records: &[SessionRecord], operator_id: &str) -> Vec<SessionRecord> {
    let mut v: Vec<SessionRecord> = records
        .iter()
        .filter(|r| r.is_active() && r.operator_id == operator_id)
        .cloned()
        .collect();
    v.sort_by_key(|r| r.start_time);
    v
}

use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    active_for, insert_record, update_record, RecordUpdate, SessionRecord, SessionStore,
    StoreError,
};

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<Vec<SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Vec<SessionRecord>) -> T) -> T {
        let mut g = self.records.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut g)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn find(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.with(|r| r.iter().find(|x| x.id == id).cloned()))
    }

    async fn find_active(
        &self,
        project_id: &str,
        operator_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.with(|r| {
            r.iter()
                .find(|x| x.is_active() && x.project_id == project_id && x.operator_id == operator_id)
                .cloned()
        }))
    }

    async fn create(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.with(|r| insert_record(r, record))
    }

    async fn update(&self, id: &str, update: RecordUpdate) -> Result<SessionRecord, StoreError> {
        self.with(|r| update_record(r, id, &update))
    }

    async fn list_active_for(&self, operator_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.with(|r| active_for(r, operator_id)))
    }
}

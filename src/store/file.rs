use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    active_for, insert_record, update_record, RecordUpdate, SessionRecord, SessionStore,
    StoreError,
};
use crate::lock::{acquire_lock_at, lock_path_for, StoreLock};

const DOC_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    version: u32,
    sessions: Vec<SessionRecord>,
}

/// JSON-file session store. One process owns a store at a time (exclusive lock file);
/// every mutation rewrites the document through a temp file and an atomic rename.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    records: tokio::sync::Mutex<Vec<SessionRecord>>,
    _lock: StoreLock,
}

impl FileSessionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let lock = acquire_lock_at(&lock_path_for(&path))?;
        let records = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => Vec::new(),
            Ok(bytes) => {
                let doc: Document = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
                if doc.version > DOC_VERSION {
                    return Err(StoreError::Corrupt(format!(
                        "{}: unsupported version {}",
                        path.display(),
                        doc.version
                    )));
                }
                doc.sessions
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), records = records.len(), "session store opened");
        Ok(FileSessionStore {
            path,
            records: tokio::sync::Mutex::new(records),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` to a copy of the records; commit in memory only after the document is on disk.
    /// The write runs on the blocking pool; the records lock serializes writers.
    async fn mutate<T: Send>(
        &self,
        f: impl FnOnce(&mut Vec<SessionRecord>) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let mut guard = self.records.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        let path = self.path.clone();
        let next = tokio::task::spawn_blocking(move || persist(&path, &next).map(|()| next))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        *guard = next;
        Ok(out)
    }

    async fn read<T>(&self, f: impl FnOnce(&[SessionRecord]) -> T + Send) -> T {
        let guard = self.records.lock().await;
        f(&guard)
    }
}

fn persist(path: &Path, records: &[SessionRecord]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let doc = Document {
        version: DOC_VERSION,
        sessions: records.to_vec(),
    };
    let body = serde_json::to_vec_pretty(&doc)
        .map_err(|e| StoreError::Corrupt(format!("encode: {e}")))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn find(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.read(|r| r.iter().find(|x| x.id == id).cloned()).await)
    }

    async fn find_active(
        &self,
        project_id: &str,
        operator_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.read(|r| {
            r.iter()
                .find(|x| x.is_active() && x.project_id == project_id && x.operator_id == operator_id)
                .cloned()
        })
        .await)
    }

    async fn create(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.mutate(|r| insert_record(r, record)).await
    }

    async fn update(&self, id: &str, update: RecordUpdate) -> Result<SessionRecord, StoreError> {
        self.mutate(|r| update_record(r, id, &update)).await
    }

    async fn list_active_for(&self, operator_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.read(|r| active_for(r, operator_id)).await)
    }
}

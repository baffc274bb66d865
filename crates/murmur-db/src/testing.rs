//! Throwaway databases for tests, removed from disk on drop.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::Database;
use crate::error::StoreError;

/// A UUID-named database in the system temp dir. Dropping it deletes the
/// database file and its WAL and shared-memory files.
pub struct TempDatabase {
    path: PathBuf,
    db: Arc<Database>,
}

impl TempDatabase {
    pub fn new(label: &str) -> Result<Self, StoreError> {
        let path = std::env::temp_dir().join(format!("murmur_{}_{}.db", label, Uuid::new_v4()));
        let db = Arc::new(Database::open(&path)?);
        Ok(Self { path, db })
    }

    pub fn db(&self) -> Arc<Database> {
        self.db.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Deref for TempDatabase {
    type Target = Database;

    fn deref(&self) -> &Database {
        &self.db
    }
}

impl Drop for TempDatabase {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}

//! The run status record and its on-disk mirror.
//!
//! One [`StatusStore`] owns the [`RunStatus`] of a run. Every mutation goes
//! through [`StatusStore::update`], which bumps the version and rewrites
//! `status.json` atomically, so outside readers only ever see whole records.

use std::path::{Path, PathBuf};

use chrono::Utc;
use forgeline_common::RunStatus;

use crate::errors::StatusError;
use crate::util::write_atomic;

pub struct StatusStore {
    path: PathBuf,
    record: RunStatus,
}

impl StatusStore {
    /// Start a new record and write it immediately.
    pub fn create(path: &Path, record: RunStatus) -> Result<Self, StatusError> {
        let mut store = Self {
            path: path.to_path_buf(),
            record,
        };
        store.update(|_| {})?;
        Ok(store)
    }

    /// Load the record of a previous run.
    pub fn load(path: &Path) -> Result<Self, StatusError> {
        let record = Self::read(path)?.ok_or_else(|| StatusError::NoPreviousRun {
            path: path.to_path_buf(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            record,
        })
    }

    /// Read a status file without taking ownership of it.
    pub fn read(path: &Path) -> Result<Option<RunStatus>, StatusError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StatusError::ReadFailed {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StatusError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &RunStatus {
        &self.record
    }

    pub fn update<F>(&mut self, f: F) -> Result<(), StatusError>
    where
        F: FnOnce(&mut RunStatus),
    {
        f(&mut self.record);
        self.record.version += 1;
        self.record.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(&self.record)?;
        write_atomic(&self.path, &json).map_err(|source| StatusError::WriteFailed {
            path: self.path.clone(),
            source,
        })
    }
}

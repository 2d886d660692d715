//! Persistent record of downloaded item ids, used to skip items that were
//! saved by an earlier run.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::ArchiveError;
use crate::resolver::PlayableKind;

#[derive(Clone)]
pub struct DownloadArchive {
    path: PathBuf,
}

impl DownloadArchive {
    pub fn open(path: PathBuf) -> Result<Self, ArchiveError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ArchiveError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let archive = Self { path };
        archive.initialize()?;
        Ok(archive)
    }

    fn initialize(&self) -> Result<(), ArchiveError> {
        let connection = self.connection()?;
        connection
            .execute_batch(
                "PRAGMA journal_mode=WAL;
                 CREATE TABLE IF NOT EXISTS archive (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     item_id TEXT NOT NULL UNIQUE,
                     kind TEXT NOT NULL,
                     name TEXT NOT NULL,
                     file_path TEXT,
                     downloaded_at TEXT NOT NULL
                 );",
            )
            .map_err(|source| ArchiveError::Initialize {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }

    pub fn record(
        &self,
        item_id: &str,
        kind: &PlayableKind,
        name: &str,
        file_path: Option<&std::path::Path>,
    ) -> Result<(), ArchiveError> {
        let connection = self.connection()?;
        connection
            .execute(
                "INSERT INTO archive (item_id, kind, name, file_path, downloaded_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(item_id) DO UPDATE SET
                     name = excluded.name,
                     file_path = excluded.file_path,
                     downloaded_at = excluded.downloaded_at",
                params![
                    item_id,
                    kind.as_str(),
                    name,
                    file_path.map(|p| p.to_string_lossy().to_string()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|source| ArchiveError::Query { source })?;
        Ok(())
    }

    pub fn contains(&self, item_id: &str) -> Result<bool, ArchiveError> {
        let connection = self.connection()?;
        let found: Option<i64> = connection
            .query_row(
                "SELECT id FROM archive WHERE item_id = ?",
                params![item_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| ArchiveError::Query { source })?;
        Ok(found.is_some())
    }

    fn connection(&self) -> Result<Connection, ArchiveError> {
        Connection::open(&self.path).map_err(|source| ArchiveError::Initialize {
            path: self.path.clone(),
            source,
        })
    }
}

impl std::fmt::Debug for DownloadArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadArchive")
            .field("path", &self.path)
            .finish()
    }
}

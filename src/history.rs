use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Column separator of the history table
const SEPARATOR: char = '|';

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access history at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Watch progress of one piece of content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRecord {
    /// Magnet URI (or any other stable identifier) of the content
    pub content_id: String,
    /// Index of the file being watched within the torrent
    pub file_index: usize,
    /// Last known playback position in seconds
    pub playback_time: u64,
    /// Display name of the file being watched
    pub title: String,
}

impl WatchRecord {
    fn to_row(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.content_id,
            self.file_index,
            self.playback_time,
            self.title.replace(['\n', '\r'], " ")
        )
    }

    fn from_row(row: &str) -> Option<Self> {
        let fields: Vec<&str> = row.splitn(4, SEPARATOR).collect();
        if fields.len() < 4 {
            return None;
        }

        Some(Self {
            content_id: fields[0].to_string(),
            file_index: fields[1].trim().parse().ok()?,
            playback_time: fields[2].trim().parse().ok()?,
            title: fields[3].to_string(),
        })
    }
}

/// Flat-file table of watch records, one row per content id
#[derive(Debug, Clone)]
pub struct WatchStore {
    path: PathBuf,
}

impl WatchStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Read every record, creating an empty table if none exists.
    /// Rows that cannot be parsed are skipped.
    pub fn get_all(&self) -> Result<Vec<WatchRecord>, StoreError> {
        if !self.path.exists() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
            std::fs::File::create(&self.path).map_err(|e| self.io_error(e))?;
            debug!(path = %self.path.display(), "created empty history");
            return Ok(Vec::new());
        }

        let contents = std::fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;

        let records = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(lineno, line)| {
                let record = WatchRecord::from_row(line);
                if record.is_none() {
                    warn!(line = lineno + 1, row = %line, "skipping malformed history row");
                }
                record
            })
            .collect();

        Ok(records)
    }

    pub fn find(&self, content_id: &str) -> Result<Option<WatchRecord>, StoreError> {
        Ok(self
            .get_all()?
            .into_iter()
            .find(|r| r.content_id == content_id))
    }

    /// Replace the record for `content_id`, or append one, then rewrite the table
    pub fn upsert(
        &self,
        content_id: &str,
        file_index: usize,
        playback_time: u64,
        title: &str,
    ) -> Result<(), StoreError> {
        let mut records = self.get_all()?;

        match records.iter_mut().find(|r| r.content_id == content_id) {
            Some(existing) => {
                existing.file_index = file_index;
                existing.playback_time = playback_time;
                existing.title = title.to_string();
            }
            None => records.push(WatchRecord {
                content_id: content_id.to_string(),
                file_index,
                playback_time,
                title: title.to_string(),
            }),
        }

        self.write_all(&records)
    }

    /// Write to a sibling temp file and rename it over the table
    fn write_all(&self, records: &[WatchRecord]) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("tmp");

        let mut file = std::fs::File::create(&tmp_path).map_err(|e| self.io_error(e))?;
        for record in records {
            writeln!(file, "{}", record.to_row()).map_err(|e| self.io_error(e))?;
        }
        file.sync_all().map_err(|e| self.io_error(e))?;
        drop(file);

        std::fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }
}

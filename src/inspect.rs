use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, Session, SessionOptions};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum InspectError {
    #[error("failed to create torrent session: {0}")]
    SessionError(String),

    #[error("{0}")]
    TorrentError(String),

    #[error("no video files found in torrent - this might be a game, software, or audio release")]
    NoVideoFiles,

    #[error("timeout waiting for torrent metadata - the torrent may be dead or have no seeders")]
    MetadataTimeout,
}

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "3gp",
];

const METADATA_TIMEOUT: Duration = Duration::from_secs(120);

/// Check if a file is a video file based on extension
pub fn is_video_file(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    VIDEO_EXTENSIONS
        .iter()
        .any(|ext| lower.rsplit_once('.').is_some_and(|(_, e)| e == *ext))
}

pub fn size_human(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFileEntry {
    pub index: usize,
    /// Path inside the torrent, `/`-separated
    pub path: String,
    pub size: u64,
}

/// A playable file of the content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFile {
    /// File path with its human-readable size
    pub display_name: String,
    /// Index into the torrent's full file list
    pub actual_index: usize,
}

#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    pub info_hash: String,
    pub name: String,
    pub files: Vec<TorrentFileEntry>,
}

impl TorrentMetadata {
    pub fn file(&self, index: usize) -> Option<&TorrentFileEntry> {
        self.files.iter().find(|f| f.index == index)
    }

    pub fn video_files(&self) -> Vec<ContentFile> {
        self.files
            .iter()
            .filter(|f| is_video_file(&f.path))
            .map(|f| ContentFile {
                display_name: format!("{} ({})", f.path, size_human(f.size)),
                actual_index: f.index,
            })
            .collect()
    }
}

/// Resolves magnet links to their file listing without downloading content
#[derive(Clone)]
pub struct ContentInspector {
    session: Arc<Session>,
}

impl ContentInspector {
    pub async fn new(temp_dir: PathBuf) -> Result<Self, InspectError> {
        tokio::fs::create_dir_all(&temp_dir)
            .await
            .map_err(|e| InspectError::SessionError(e.to_string()))?;

        debug!("creating librqbit session");
        let session_future = Session::new_with_opts(
            temp_dir,
            SessionOptions {
                // DHT is needed for magnet resolution
                disable_dht: false,
                disable_dht_persistence: true,
                ..Default::default()
            },
        );

        let session = timeout(Duration::from_secs(30), session_future)
            .await
            .map_err(|_| InspectError::SessionError("timeout creating session (30s)".to_string()))?
            .map_err(|e| InspectError::SessionError(e.to_string()))?;

        Ok(Self { session })
    }

    pub fn session(&self) -> Arc<Session> {
        self.session.clone()
    }

    /// Fetch the info dictionary for a magnet link
    pub async fn inspect(&self, magnet: &str) -> Result<TorrentMetadata, InspectError> {
        info!("waiting for torrent metadata");

        let add_future = self.session.add_torrent(
            AddTorrent::from_url(magnet),
            Some(AddTorrentOptions {
                list_only: true,
                ..Default::default()
            }),
        );

        let response = timeout(METADATA_TIMEOUT, add_future)
            .await
            .map_err(|_| InspectError::MetadataTimeout)?
            .map_err(|e| InspectError::TorrentError(e.to_string()))?;

        let AddTorrentResponse::ListOnly(list) = response else {
            return Err(InspectError::TorrentError(
                "session returned a managed torrent for a list-only request".to_string(),
            ));
        };

        let files: Vec<TorrentFileEntry> = list
            .info
            .iter_file_details()
            .map_err(|e| InspectError::TorrentError(e.to_string()))?
            .enumerate()
            .filter_map(|(index, details)| {
                let path = details.filename.to_string().ok()?;
                Some(TorrentFileEntry {
                    index,
                    path,
                    size: details.len,
                })
            })
            .collect();

        let name = files
            .first()
            .and_then(|f| f.path.split('/').next())
            .unwrap_or("unknown")
            .to_string();

        let metadata = TorrentMetadata {
            info_hash: list.info_hash.as_string(),
            name,
            files,
        };

        let videos = metadata.video_files().len();
        if videos == 0 {
            return Err(InspectError::NoVideoFiles);
        }

        info!(files = metadata.files.len(), videos, name = %metadata.name, "metadata received");
        Ok(metadata)
    }
}

use std::path::Path;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::Bridge;
use crate::config::Config;
use crate::history::{StoreError, WatchStore};
use crate::indexer::{self, IndexerClient, IndexerError};
use crate::inspect::{ContentInspector, InspectError, TorrentMetadata};
use crate::player::MpvLauncher;
use crate::selector::{SelectError, Selector};
use crate::session::{EndReason, SessionController, SessionError, SessionSettings};
use crate::setup::{self, SetupError, SetupOutcome};

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error("search failed: {0}")]
    Indexer(#[from] IndexerError),
    #[error("could not read torrent: {0}")]
    Inspect(#[from] InspectError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

const MAIN_MENU: [&str; 2] = ["Start New Show", "Continue Watching"];

/// `h:mm:ss` or `m:ss`
pub fn format_position(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, seconds / 60 % 60, seconds % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

/// What the user asked to watch
struct Pick {
    magnet: String,
    metadata: TorrentMetadata,
    file_index: usize,
    resume_at: Option<u64>,
}

/// The whole interactive flow: setup, menu, pick something, watch it
pub async fn run(
    mut config: Config,
    config_path: &Path,
    selector: &mut dyn Selector,
    cancel: CancellationToken,
) -> Result<(), AppError> {
    let server_config = indexer::server_config_path();
    if setup::ensure_indexer(&mut config, selector, config_path, server_config.as_deref()).await?
        == SetupOutcome::Quit
    {
        return Ok(());
    }

    let store = WatchStore::new(config.history_path());
    let inspector = ContentInspector::new(config.storage_path.join("metadata")).await?;

    let menu: Vec<String> = MAIN_MENU.iter().map(|s| s.to_string()).collect();
    let pick = match selector.select("torrentwatch", &menu)? {
        Some(0) => start_new(&config, &store, &inspector, selector, &cancel).await?,
        Some(1) => continue_watching(&store, &inspector, selector, &cancel).await?,
        _ => None,
    };

    let Some(pick) = pick else {
        return Ok(());
    };

    let bridge = Bridge::from_config(&config, inspector.session(), &pick.metadata);
    let launcher = MpvLauncher::new(&config.player_command, &config.player_args);
    let mut controller = SessionController::new(
        bridge,
        launcher,
        store,
        SessionSettings::from_config(&config),
        &pick.magnet,
        pick.metadata,
    );

    let end = controller.run(pick.file_index, pick.resume_at, cancel).await?;
    info!(?end, "session finished");

    match end.reason {
        EndReason::Stopped => println!(
            "Stopped at {}. Progress saved.",
            format_position(end.playback_time)
        ),
        EndReason::NoMoreEpisodes => println!("No more episodes."),
        EndReason::PlayerExitedEarly => println!("Player closed before playback started."),
        EndReason::Cancelled => println!("Interrupted."),
    }
    Ok(())
}

async fn fetch_metadata(
    inspector: &ContentInspector,
    magnet: &str,
    cancel: &CancellationToken,
) -> Result<Option<TorrentMetadata>, AppError> {
    println!("Fetching torrent metadata...");
    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        metadata = inspector.inspect(magnet) => Ok(Some(metadata?)),
    }
}

async fn start_new(
    config: &Config,
    store: &WatchStore,
    inspector: &ContentInspector,
    selector: &mut dyn Selector,
    cancel: &CancellationToken,
) -> Result<Option<Pick>, AppError> {
    let Some(query) = selector.input("Search")? else {
        return Ok(None);
    };

    let client = IndexerClient::new(config);
    let candidates = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        results = client.search(&query) => results?,
    };
    if candidates.is_empty() {
        println!("No results for '{}'.", query);
        return Ok(None);
    }

    let labels: Vec<String> = candidates.iter().map(|c| c.label()).collect();
    let Some(candidate) = selector
        .select("Release", &labels)?
        .and_then(|i| candidates.get(i))
    else {
        return Ok(None);
    };

    let magnet = client.resolve_magnet(candidate).await?;
    let Some(metadata) = fetch_metadata(inspector, &magnet, cancel).await? else {
        return Ok(None);
    };

    let files = metadata.video_files();
    let file = if files.len() == 1 {
        &files[0]
    } else {
        let names: Vec<String> = files.iter().map(|f| f.display_name.clone()).collect();
        match selector.select("File", &names)?.and_then(|i| files.get(i)) {
            Some(file) => file,
            None => return Ok(None),
        }
    };

    store.upsert(&magnet, file.actual_index, 0, &file.display_name)?;
    let file_index = file.actual_index;

    Ok(Some(Pick {
        magnet,
        metadata,
        file_index,
        resume_at: None,
    }))
}

async fn continue_watching(
    store: &WatchStore,
    inspector: &ContentInspector,
    selector: &mut dyn Selector,
    cancel: &CancellationToken,
) -> Result<Option<Pick>, AppError> {
    let records = store.get_all()?;
    if records.is_empty() {
        println!("Nothing to continue yet.");
        return Ok(None);
    }

    let labels: Vec<String> = records
        .iter()
        .map(|r| format!("{} [{}]", r.title, format_position(r.playback_time)))
        .collect();
    let Some(record) = selector
        .select("Continue", &labels)?
        .and_then(|i| records.get(i).cloned())
    else {
        return Ok(None);
    };

    let Some(metadata) = fetch_metadata(inspector, &record.content_id, cancel).await? else {
        return Ok(None);
    };

    Ok(Some(Pick {
        magnet: record.content_id,
        metadata,
        file_index: record.file_index,
        resume_at: Some(record.playback_time),
    }))
}

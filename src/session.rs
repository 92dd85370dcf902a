//! Playback session: keeps one bridge and one player alive per episode,
//! records progress and moves on to the next episode when one is finished.

use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, StreamBackend};
use crate::config::Config;
use crate::episodes::{next_after, sort_episodes};
use crate::history::{StoreError, WatchStore};
use crate::inspect::{ContentFile, TorrentMetadata};
use crate::player::{PlayerControl, PlayerError, PlayerLauncher, PlayerProcess};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("streaming bridge failed: {0}")]
    Bridge(#[from] BridgeError),
    #[error("player failed: {0}")]
    Player(#[from] PlayerError),
    #[error("history unavailable: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Percentage watched at which an episode counts as finished
    pub completion_percentage: u8,
    pub save_player_speed: bool,
    /// How often progress is read and saved while playing
    pub tick_interval: Duration,
    /// How often the start and duration pollers ask the player
    pub poll_interval: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            completion_percentage: config.completion_percentage,
            save_player_speed: config.save_player_speed,
            tick_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Sent by the bootstrap pollers to the controller loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerEvent {
    /// Duration in whole seconds, sent once it is non-zero
    Duration(u64),
    /// The player reported a position for the first time
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Player closed before the completion threshold
    Stopped,
    /// Last episode was finished
    NoMoreEpisodes,
    /// Player went away before it ever started playing
    PlayerExitedEarly,
    /// Interrupted by the user
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
    pub reason: EndReason,
    pub file_index: usize,
    pub playback_time: u64,
}

/// What to do once a player has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Advance(usize),
    NoMoreEpisodes,
    NotComplete,
}

/// Round a player-reported number of seconds to whole seconds
pub fn round_secs(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        (seconds + 0.5) as u64
    } else {
        0
    }
}

/// Decide whether the episode at `current_index` is finished and which file follows it.
///
/// `sorted` holds display names in episode order. Files whose display name is
/// missing from it never advance.
pub fn evaluate_completion(
    playback_time: u64,
    duration: u64,
    threshold: u8,
    sorted: &[String],
    files: &[ContentFile],
    current_index: usize,
) -> Completion {
    if duration == 0 {
        return Completion::NotComplete;
    }

    // time / duration * 100 >= threshold, kept in integers so the boundary is exact
    if u128::from(playback_time) * 100 < u128::from(threshold) * u128::from(duration) {
        return Completion::NotComplete;
    }

    let next = files
        .iter()
        .find(|f| f.actual_index == current_index)
        .and_then(|current| next_after(sorted, &current.display_name))
        .and_then(|next_name| files.iter().find(|f| f.display_name == next_name));

    match next {
        Some(file) => Completion::Advance(file.actual_index),
        None => Completion::NoMoreEpisodes,
    }
}

#[derive(Debug, Default)]
struct PlaybackState {
    playback_time: u64,
    started: bool,
    duration: u64,
}

enum EpisodeOutcome {
    /// Player went away after it started playing
    Terminated { playback_time: u64, duration: u64 },
    ExitedEarly,
    Cancelled,
}

async fn watch_duration<C: PlayerControl>(
    control: C,
    events: mpsc::Sender<PlayerEvent>,
    token: CancellationToken,
    interval: Duration,
) {
    loop {
        let reply = tokio::select! {
            _ = token.cancelled() => return,
            reply = control.get_number("duration") => reply,
        };

        match reply {
            Ok(Some(duration)) if round_secs(duration) > 0 => {
                debug!(duration, "duration known");
                let _ = events.send(PlayerEvent::Duration(round_secs(duration))).await;
                return;
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "duration not available yet"),
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn detect_start<C: PlayerControl>(
    control: C,
    events: mpsc::Sender<PlayerEvent>,
    token: CancellationToken,
    interval: Duration,
) {
    loop {
        let reply = tokio::select! {
            _ = token.cancelled() => return,
            reply = control.get_number("time-pos") => reply,
        };

        match reply {
            Ok(Some(_)) => {
                let _ = events.send(PlayerEvent::Started).await;
                return;
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "player not playing yet"),
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Runs episodes of one torrent back to back
pub struct SessionController<B: StreamBackend, L: PlayerLauncher> {
    backend: B,
    launcher: L,
    store: WatchStore,
    settings: SessionSettings,
    content_id: String,
    files: Vec<ContentFile>,
    metadata: TorrentMetadata,
    sorted_episodes: Option<Vec<String>>,
    speed: Option<f64>,
}

impl<B: StreamBackend, L: PlayerLauncher> SessionController<B, L> {
    pub fn new(
        backend: B,
        launcher: L,
        store: WatchStore,
        settings: SessionSettings,
        content_id: &str,
        metadata: TorrentMetadata,
    ) -> Self {
        Self {
            backend,
            launcher,
            store,
            settings,
            content_id: content_id.to_string(),
            files: metadata.video_files(),
            metadata,
            sorted_episodes: None,
            speed: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Display name stored alongside the progress of `file_index`
    pub fn title_of(&self, file_index: usize) -> String {
        if let Some(file) = self.files.iter().find(|f| f.actual_index == file_index) {
            return file.display_name.clone();
        }
        match self.metadata.file(file_index) {
            Some(entry) => entry.path.clone(),
            None => format!("file {}", file_index),
        }
    }

    fn sorted_episodes(&mut self) -> &[String] {
        let files = &self.files;
        self.sorted_episodes.get_or_insert_with(|| {
            let names: Vec<&str> = files.iter().map(|f| f.display_name.as_str()).collect();
            sort_episodes(&names)
        })
    }

    fn persist(&self, file_index: usize, playback_time: u64) {
        let title = self.title_of(file_index);
        if let Err(e) = self
            .store
            .upsert(&self.content_id, file_index, playback_time, &title)
        {
            warn!(error = %e, "failed to save progress");
        }
    }

    /// Play from `file_index` until the user stops, the series runs out or `cancel` fires.
    ///
    /// With `resume_at` set, the first episode seeks there once playback has started.
    pub async fn run(
        &mut self,
        file_index: usize,
        resume_at: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<SessionEnd, SessionError> {
        let mut file_index = file_index;
        let mut resume_at = resume_at;

        loop {
            let outcome = self.play_episode(file_index, &mut resume_at, &cancel).await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.backend.stop().await;
                    return Err(e);
                }
            };

            let (playback_time, duration) = match outcome {
                EpisodeOutcome::Cancelled => {
                    info!(file_index, "session cancelled");
                    self.backend.stop().await;
                    return Ok(self.end(EndReason::Cancelled, file_index, 0));
                }
                EpisodeOutcome::ExitedEarly => {
                    warn!(file_index, "player exited before playback started");
                    self.backend.stop().await;
                    return Ok(self.end(EndReason::PlayerExitedEarly, file_index, 0));
                }
                EpisodeOutcome::Terminated {
                    playback_time,
                    duration,
                } => (playback_time, duration),
            };

            let threshold = self.settings.completion_percentage;
            let sorted = self.sorted_episodes().to_vec();
            let decision = evaluate_completion(
                playback_time,
                duration,
                threshold,
                &sorted,
                &self.files,
                file_index,
            );
            info!(file_index, playback_time, duration, ?decision, "episode ended");

            match decision {
                Completion::Advance(next) => {
                    self.backend.stop().await;
                    self.persist(next, 0);
                    println!("Up next: {}", self.title_of(next));
                    file_index = next;
                }
                Completion::NoMoreEpisodes => {
                    self.backend.stop().await;
                    return Ok(self.end(EndReason::NoMoreEpisodes, file_index, playback_time));
                }
                Completion::NotComplete => {
                    self.backend.stop().await;
                    return Ok(self.end(EndReason::Stopped, file_index, playback_time));
                }
            }
        }
    }

    fn end(&self, reason: EndReason, file_index: usize, playback_time: u64) -> SessionEnd {
        SessionEnd {
            reason,
            file_index,
            playback_time,
        }
    }

    async fn play_episode(
        &mut self,
        file_index: usize,
        resume_at: &mut Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<EpisodeOutcome, SessionError> {
        let title = self.title_of(file_index);
        info!(file_index, title = %title, "starting episode");
        println!("Loading: {}", title);

        let content_id = self.content_id.clone();
        let url = tokio::select! {
            _ = cancel.cancelled() => return Ok(EpisodeOutcome::Cancelled),
            url = async {
                self.backend.start(&content_id, file_index).await?;
                self.backend.stream_url(&content_id, file_index).await
            } => url?,
        };

        let (control, mut process) = self.launcher.launch(&url)?;
        println!("Playing: {}", title);

        let token = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(8);
        let pollers: Vec<JoinHandle<()>> = vec![
            tokio::spawn(watch_duration(
                control.clone(),
                tx.clone(),
                token.clone(),
                self.settings.poll_interval,
            )),
            tokio::spawn(detect_start(
                control.clone(),
                tx,
                token.clone(),
                self.settings.poll_interval,
            )),
        ];

        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut state = PlaybackState::default();
        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    if let Err(e) = control.quit().await {
                        debug!(error = %e, "quit not delivered");
                    }
                    break EpisodeOutcome::Cancelled;
                }
                Some(event) = rx.recv() => match event {
                    PlayerEvent::Duration(duration) => state.duration = duration,
                    PlayerEvent::Started => {
                        state.started = true;
                        self.on_started(&control, resume_at).await;
                    }
                },
                _ = process.wait() => {
                    if !state.started {
                        break EpisodeOutcome::ExitedEarly;
                    }
                    break EpisodeOutcome::Terminated {
                        playback_time: state.playback_time,
                        duration: state.duration,
                    };
                }
                _ = ticker.tick(), if state.started => {
                    match control.get_number("time-pos").await {
                        Ok(Some(position)) => {
                            state.playback_time = round_secs(position);
                            if let Ok(Some(speed)) = control.get_number("speed").await {
                                self.speed = Some(speed);
                            }
                            self.persist(file_index, state.playback_time);
                        }
                        Ok(None) => {}
                        Err(e) if !e.is_disconnect() => {
                            debug!(error = %e, "position poll rejected, skipping tick");
                        }
                        Err(e) => {
                            debug!(error = %e, "player unreachable, treating as terminated");
                            break EpisodeOutcome::Terminated {
                                playback_time: state.playback_time,
                                duration: state.duration,
                            };
                        }
                    }
                }
            }
        };

        token.cancel();
        for poller in pollers {
            let _ = poller.await;
        }
        process.kill().await;

        Ok(outcome)
    }

    /// Resume position first, then the carried-over speed
    async fn on_started<C: PlayerControl>(&self, control: &C, resume_at: &mut Option<u64>) {
        info!("playback started");

        if let Some(position) = resume_at.take() {
            info!(position, "resuming");
            if let Err(e) = control.seek(position).await {
                warn!(error = %e, position, "resume seek failed");
            }
        }

        if self.settings.save_player_speed
            && let Some(speed) = self.speed
        {
            debug!(speed, "restoring playback speed");
            if let Err(e) = control.set_property("speed", json!(speed)).await {
                warn!(error = %e, "failed to restore speed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> Vec<ContentFile> {
        vec![
            ContentFile {
                display_name: "Show S01E02.mkv (1.0 GB)".to_string(),
                actual_index: 4,
            },
            ContentFile {
                display_name: "Show S01E01.mkv (1.0 GB)".to_string(),
                actual_index: 1,
            },
            ContentFile {
                display_name: "Extras.mkv (100.0 MB)".to_string(),
                actual_index: 7,
            },
        ]
    }

    fn sorted() -> Vec<String> {
        let names: Vec<String> = files().into_iter().map(|f| f.display_name).collect();
        sort_episodes(&names)
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert_eq!(
            evaluate_completion(92, 100, 92, &sorted(), &files(), 1),
            Completion::Advance(4)
        );
        assert_eq!(
            evaluate_completion(92, 100, 93, &sorted(), &files(), 1),
            Completion::NotComplete
        );

        for percent in [29, 57, 58] {
            assert_eq!(
                evaluate_completion(percent, 100, percent as u8, &sorted(), &files(), 1),
                Completion::Advance(4),
                "{percent}% of 100s should reach a {percent}% threshold"
            );
        }
        assert_eq!(
            evaluate_completion(1288, 1400, 92, &sorted(), &files(), 1),
            Completion::Advance(4)
        );
        assert_eq!(
            evaluate_completion(1287, 1400, 92, &sorted(), &files(), 1),
            Completion::NotComplete
        );
    }

    #[test]
    fn test_last_episode_has_no_successor() {
        assert_eq!(
            evaluate_completion(1400, 1400, 92, &sorted(), &files(), 4),
            Completion::NoMoreEpisodes
        );
    }

    #[test]
    fn test_zero_duration_never_completes() {
        assert_eq!(
            evaluate_completion(500, 0, 0, &sorted(), &files(), 1),
            Completion::NotComplete
        );
    }

    #[test]
    fn test_unordered_file_does_not_advance() {
        assert_eq!(
            evaluate_completion(100, 100, 92, &sorted(), &files(), 7),
            Completion::NoMoreEpisodes
        );
    }

    #[test]
    fn test_round_secs() {
        assert_eq!(round_secs(91.5), 92);
        assert_eq!(round_secs(91.49), 91);
        assert_eq!(round_secs(-3.0), 0);
        assert_eq!(round_secs(f64::NAN), 0);
    }
}

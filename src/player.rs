use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("player control endpoint unavailable: {0}")]
    Unavailable(#[source] std::io::Error),

    #[error("timed out waiting for the player")]
    Timeout,

    #[error("malformed reply from player: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("player rejected command: {0}")]
    Rejected(String),

    #[error("failed to launch player '{0}': {1}. Is the player installed and in your PATH?")]
    Launch(String, String),
}

impl PlayerError {
    /// True when the failure means the player is gone or not listening yet,
    /// as opposed to the player answering with an error
    pub fn is_disconnect(&self) -> bool {
        !matches!(self, PlayerError::Rejected(_) | PlayerError::Launch(..))
    }
}

/// Request/response access to a running player
pub trait PlayerControl: Clone + Send + Sync + 'static {
    /// Send `{"command": args}` and return the reply's `data` (null when absent)
    fn send_command(&self, args: Vec<Value>) -> impl Future<Output = Result<Value, PlayerError>> + Send;

    fn get_property(&self, name: &str) -> impl Future<Output = Result<Value, PlayerError>> + Send {
        self.send_command(vec![json!("get_property"), json!(name)])
    }

    fn set_property(
        &self,
        name: &str,
        value: Value,
    ) -> impl Future<Output = Result<Value, PlayerError>> + Send {
        self.send_command(vec![json!("set_property"), json!(name), value])
    }

    fn seek(&self, seconds: u64) -> impl Future<Output = Result<Value, PlayerError>> + Send {
        self.send_command(vec![json!("seek"), json!(seconds), json!("absolute")])
    }

    fn quit(&self) -> impl Future<Output = Result<Value, PlayerError>> + Send {
        self.send_command(vec![json!("quit")])
    }

    /// Numeric property, `None` while the player has no value for it
    fn get_number(&self, name: &str) -> impl Future<Output = Result<Option<f64>, PlayerError>> + Send {
        let request = self.get_property(name);
        async move { Ok(request.await?.as_f64()) }
    }
}

/// mpv JSON IPC over a unix domain socket. Each call is one connection.
#[derive(Debug, Clone)]
pub struct MpvIpc {
    socket_path: PathBuf,
    connect_timeout: Duration,
    reply_timeout: Duration,
}

impl MpvIpc {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout: Duration::from_secs(2),
            reply_timeout: Duration::from_secs(3),
        }
    }
}

/// Pull the result out of a reply object
fn interpret_reply(reply: Value) -> Result<Value, PlayerError> {
    if let Some(error) = reply.get("error").and_then(Value::as_str)
        && error != "success"
    {
        return Err(PlayerError::Rejected(error.to_string()));
    }

    Ok(reply.get("data").cloned().unwrap_or(Value::Null))
}

#[cfg(unix)]
impl MpvIpc {
    async fn round_trip(&self, args: Vec<Value>) -> Result<Value, PlayerError> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::UnixStream;

        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| PlayerError::Timeout)?
            .map_err(PlayerError::Unavailable)?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut request = serde_json::to_vec(&json!({ "command": args }))?;
        request.push(b'\n');

        let exchange = async {
            writer
                .write_all(&request)
                .await
                .map_err(PlayerError::Unavailable)?;

            loop {
                let mut line = String::new();
                let read = reader
                    .read_line(&mut line)
                    .await
                    .map_err(PlayerError::Unavailable)?;
                if read == 0 {
                    return Err(PlayerError::Unavailable(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "player closed the connection",
                    )));
                }

                let reply: Value = serde_json::from_str(line.trim())?;
                // mpv interleaves property-change and lifecycle events with replies
                if reply.get("event").is_some() && reply.get("error").is_none() {
                    continue;
                }
                return interpret_reply(reply);
            }
        };

        tokio::time::timeout(self.reply_timeout, exchange)
            .await
            .map_err(|_| PlayerError::Timeout)?
    }
}

#[cfg(not(unix))]
impl MpvIpc {
    async fn round_trip(&self, _args: Vec<Value>) -> Result<Value, PlayerError> {
        Err(PlayerError::Unavailable(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "player control is only supported on unix",
        )))
    }
}

impl PlayerControl for MpvIpc {
    async fn send_command(&self, args: Vec<Value>) -> Result<Value, PlayerError> {
        self.round_trip(args).await
    }
}

/// Handle on a spawned player process
pub trait PlayerProcess: Send {
    /// Resolve once the process has exited
    fn wait(&mut self) -> impl Future<Output = ()> + Send;

    fn kill(&mut self) -> impl Future<Output = ()> + Send;
}

/// Starts a player for a stream URL with a fresh control endpoint
pub trait PlayerLauncher {
    type Control: PlayerControl;
    type Process: PlayerProcess;

    fn launch(&self, stream_url: &str) -> Result<(Self::Control, Self::Process), PlayerError>;
}

pub struct MpvProcess {
    child: Child,
}

impl PlayerProcess for MpvProcess {
    async fn wait(&mut self) {
        match self.child.wait().await {
            Ok(status) => debug!(%status, "player exited"),
            Err(e) => debug!(error = %e, "failed to wait for player"),
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "failed to kill player (may have exited)");
        }
    }
}

#[derive(Debug, Clone)]
pub struct MpvLauncher {
    command: String,
    args: Vec<String>,
}

impl MpvLauncher {
    pub fn new(command: &str, args: &[String]) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
        }
    }
}

/// Random per-launch socket path so a previous, still exiting player
/// never collides with the new one
pub fn fresh_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("torrentwatch-{:016x}.sock", rand::random::<u64>()))
}

impl PlayerLauncher for MpvLauncher {
    type Control = MpvIpc;
    type Process = MpvProcess;

    fn launch(&self, stream_url: &str) -> Result<(MpvIpc, MpvProcess), PlayerError> {
        which::which(&self.command)
            .map_err(|e| PlayerError::Launch(self.command.clone(), e.to_string()))?;

        let socket_path = fresh_socket_path();

        let mut cmd = Command::new(&self.command);
        cmd.args([
            "--force-seekable=yes",
            "--cache=yes",
            "--cache-secs=10",
            "--demuxer-max-bytes=50M",
            "--demuxer-readahead-secs=5",
            "--really-quiet",
        ]);
        cmd.arg(format!("--input-ipc-server={}", socket_path.display()));
        cmd.args(&self.args);
        cmd.arg(stream_url);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| PlayerError::Launch(self.command.clone(), e.to_string()))?;

        info!(player = %self.command, socket = %socket_path.display(), "player launched");
        Ok((MpvIpc::new(socket_path), MpvProcess { child }))
    }
}

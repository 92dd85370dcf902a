use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use librqbit::api::Api;
use librqbit::http_api::{HttpApi, HttpApiOptions};
use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, Session};
use reqwest::Client;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{BridgeKind, Config};
use crate::inspect::TorrentMetadata;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to prepare storage directory {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch bridge '{0}': {1}. Is it installed and in your PATH?")]
    Launch(String, String),

    #[error("stream at {url} not ready after {attempts} attempts - the torrent may be dead or have no seeders")]
    NotReady { url: String, attempts: u32 },

    #[error("{0}")]
    TorrentError(String),

    #[error("bridge has not been started")]
    NotStarted,

    #[error("torrent has no file with index {0}")]
    UnknownFile(usize),
}

/// Serves one file of a torrent over local HTTP
pub trait StreamBackend {
    /// Begin serving `file_index` of `content_id`, replacing any previous instance
    fn start(
        &mut self,
        content_id: &str,
        file_index: usize,
    ) -> impl Future<Output = Result<(), BridgeError>>;

    /// Playable URL, available once the bridge answers for it
    fn stream_url(
        &mut self,
        content_id: &str,
        file_index: usize,
    ) -> impl Future<Output = Result<String, BridgeError>>;

    /// Tear down whatever is running. Safe to call repeatedly.
    fn stop(&mut self) -> impl Future<Output = ()>;
}

/// Bounded polling of a stream URL until it serves bytes
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            attempts: 120,
            interval: Duration::from_secs(1),
        }
    }
}

impl ReadinessProbe {
    pub async fn wait(&self, client: &Client, url: &str) -> Result<(), BridgeError> {
        for attempt in 1..=self.attempts {
            // A small range request also makes the bridge prioritise the start of the file
            match client
                .get(url)
                .header("Range", "bytes=0-1023")
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!(attempt, "stream ready");
                    return Ok(());
                }
                Ok(resp) => debug!(attempt, status = %resp.status(), "stream not ready yet"),
                Err(e) => debug!(attempt, error = %e, "stream not reachable yet"),
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(BridgeError::NotReady {
            url: url.to_string(),
            attempts: self.attempts,
        })
    }
}

async fn run_quietly(program: &str, args: &[&str]) {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) => debug!(program, ?args, %status, "cleanup command finished"),
        Err(e) => debug!(program, error = %e, "cleanup command unavailable"),
    }
}

/// External `webtorrent` process bound to a fixed local port
pub struct WebtorrentBridge {
    command: String,
    port: u16,
    storage_dir: PathBuf,
    metadata: TorrentMetadata,
    child: Option<Child>,
    http_client: Client,
    probe: ReadinessProbe,
    grace: Duration,
}

impl WebtorrentBridge {
    pub fn new(command: &str, port: u16, storage_dir: PathBuf, metadata: TorrentMetadata) -> Self {
        Self {
            command: command.to_string(),
            port,
            storage_dir,
            metadata,
            child: None,
            http_client: Client::new(),
            probe: ReadinessProbe::default(),
            grace: Duration::from_millis(500),
        }
    }

    pub fn with_probe(mut self, probe: ReadinessProbe) -> Self {
        self.probe = probe;
        self
    }

    /// `http://localhost:P/webtorrent/<infohash>/<path>`, each path component escaped
    pub fn url_for(&self, file_index: usize) -> Result<String, BridgeError> {
        let file = self
            .metadata
            .file(file_index)
            .ok_or(BridgeError::UnknownFile(file_index))?;

        let path = file
            .path
            .split('/')
            .map(|component| urlencoding::encode(component).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        Ok(format!(
            "http://localhost:{}/webtorrent/{}/{}",
            self.port,
            self.metadata.info_hash.to_lowercase(),
            path
        ))
    }

    /// Kill any bridge left over from this or a previous run.
    /// There is nothing to kill most of the time, so failures are ignored.
    async fn cleanup(&self) {
        run_quietly("pkill", &["-f", &self.command]).await;
        run_quietly("fuser", &["-k", &format!("{}/tcp", self.port)]).await;
    }
}

impl StreamBackend for WebtorrentBridge {
    async fn start(&mut self, content_id: &str, file_index: usize) -> Result<(), BridgeError> {
        self.stop().await;

        tokio::fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|source| BridgeError::Storage {
                path: self.storage_dir.clone(),
                source,
            })?;

        which::which(&self.command)
            .map_err(|e| BridgeError::Launch(self.command.clone(), e.to_string()))?;

        let child = Command::new(&self.command)
            .arg(content_id)
            .args(["--select", &file_index.to_string()])
            .args(["--keep-seeding", "--no-quit", "--quiet"])
            .args(["--port", &self.port.to_string()])
            .arg("--out")
            .arg(&self.storage_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Launch(self.command.clone(), e.to_string()))?;

        info!(
            pid = child.id(),
            file_index,
            storage = %self.storage_dir.display(),
            "bridge started"
        );
        self.child = Some(child);
        Ok(())
    }

    async fn stream_url(&mut self, _content_id: &str, file_index: usize) -> Result<String, BridgeError> {
        if self.child.is_none() {
            return Err(BridgeError::NotStarted);
        }

        let url = self.url_for(file_index)?;
        self.probe.wait(&self.http_client, &url).await?;
        Ok(url)
    }

    async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "failed to kill bridge (may have exited)");
            }
        }
        self.cleanup().await;
        tokio::time::sleep(self.grace).await;
    }
}

/// librqbit's HTTP API running inside this process
pub struct EmbeddedBridge {
    session: Arc<Session>,
    port: u16,
    storage_dir: PathBuf,
    http_addr: Option<SocketAddr>,
    server: Option<JoinHandle<()>>,
    torrent_id: Option<usize>,
    http_client: Client,
    probe: ReadinessProbe,
    grace: Duration,
}

impl EmbeddedBridge {
    pub fn new(session: Arc<Session>, port: u16, storage_dir: PathBuf) -> Self {
        Self {
            session,
            port,
            storage_dir,
            http_addr: None,
            server: None,
            torrent_id: None,
            http_client: Client::new(),
            probe: ReadinessProbe::default(),
            grace: Duration::from_millis(500),
        }
    }

    async fn ensure_server(&mut self) -> Result<SocketAddr, BridgeError> {
        if let Some(addr) = self.http_addr {
            return Ok(addr);
        }

        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .map_err(|e| BridgeError::TorrentError(format!("cannot bind port {}: {}", self.port, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| BridgeError::TorrentError(e.to_string()))?;

        let api = Api::new(self.session.clone(), None, None);
        let http_api = HttpApi::new(
            api,
            Some(HttpApiOptions {
                read_only: false,
                ..Default::default()
            }),
        );

        self.server = Some(tokio::spawn(async move {
            if let Err(e) = http_api.make_http_api_and_run(listener, None).await {
                warn!(error = %e, "embedded bridge http server stopped");
            }
        }));
        self.http_addr = Some(addr);
        Ok(addr)
    }
}

impl StreamBackend for EmbeddedBridge {
    async fn start(&mut self, content_id: &str, file_index: usize) -> Result<(), BridgeError> {
        self.stop().await;
        self.ensure_server().await?;

        tokio::fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|source| BridgeError::Storage {
                path: self.storage_dir.clone(),
                source,
            })?;

        let add_future = self.session.add_torrent(
            AddTorrent::from_url(content_id),
            Some(AddTorrentOptions {
                overwrite: true,
                only_files: Some(vec![file_index]),
                output_folder: Some(self.storage_dir.to_string_lossy().to_string()),
                ..Default::default()
            }),
        );

        let response = timeout(Duration::from_secs(120), add_future)
            .await
            .map_err(|_| BridgeError::TorrentError("timeout adding torrent (120s)".to_string()))?
            .map_err(|e| BridgeError::TorrentError(e.to_string()))?;

        let (id, handle) = match response {
            AddTorrentResponse::Added(id, handle) => (id, handle),
            AddTorrentResponse::AlreadyManaged(id, handle) => (id, handle),
            AddTorrentResponse::ListOnly(_) => {
                return Err(BridgeError::TorrentError("list only response".to_string()));
            }
        };

        timeout(Duration::from_secs(120), handle.wait_until_initialized())
            .await
            .map_err(|_| BridgeError::TorrentError("timeout initializing torrent".to_string()))?
            .map_err(|e| BridgeError::TorrentError(e.to_string()))?;

        info!(id, file_index, "embedded bridge serving torrent");
        self.torrent_id = Some(id);
        Ok(())
    }

    async fn stream_url(&mut self, _content_id: &str, file_index: usize) -> Result<String, BridgeError> {
        let (Some(addr), Some(id)) = (self.http_addr, self.torrent_id) else {
            return Err(BridgeError::NotStarted);
        };

        let url = format!("http://{}/torrents/{}/stream/{}", addr, id, file_index);
        self.probe.wait(&self.http_client, &url).await?;
        Ok(url)
    }

    async fn stop(&mut self) {
        let Some(id) = self.torrent_id.take() else {
            return;
        };
        if let Err(e) = self.session.delete(id.into(), false).await {
            debug!(id, error = %e, "failed to remove torrent from session");
        }
        tokio::time::sleep(self.grace).await;
    }
}

impl Drop for EmbeddedBridge {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

/// The backend chosen by configuration
pub enum Bridge {
    Webtorrent(WebtorrentBridge),
    Embedded(EmbeddedBridge),
}

impl Bridge {
    pub fn from_config(config: &Config, session: Arc<Session>, metadata: &TorrentMetadata) -> Self {
        let storage_dir = config.storage_path.join("downloads");
        match config.bridge {
            BridgeKind::Webtorrent => Bridge::Webtorrent(WebtorrentBridge::new(
                &config.bridge_command,
                config.bridge_port,
                storage_dir,
                metadata.clone(),
            )),
            BridgeKind::Embedded => {
                Bridge::Embedded(EmbeddedBridge::new(session, config.bridge_port, storage_dir))
            }
        }
    }
}

impl StreamBackend for Bridge {
    async fn start(&mut self, content_id: &str, file_index: usize) -> Result<(), BridgeError> {
        match self {
            Bridge::Webtorrent(b) => b.start(content_id, file_index).await,
            Bridge::Embedded(b) => b.start(content_id, file_index).await,
        }
    }

    async fn stream_url(&mut self, content_id: &str, file_index: usize) -> Result<String, BridgeError> {
        match self {
            Bridge::Webtorrent(b) => b.stream_url(content_id, file_index).await,
            Bridge::Embedded(b) => b.stream_url(content_id, file_index).await,
        }
    }

    async fn stop(&mut self) {
        match self {
            Bridge::Webtorrent(b) => b.stop().await,
            Bridge::Embedded(b) => b.stop().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::TorrentFileEntry;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_probe(attempts: u32) -> ReadinessProbe {
        ReadinessProbe {
            attempts,
            interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_probe_succeeds_on_partial_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/3"))
            .and(header("Range", "bytes=0-1023"))
            .respond_with(ResponseTemplate::new(206))
            .mount(&server)
            .await;

        let url = format!("{}/3", server.uri());
        fast_probe(3).wait(&Client::new(), &url).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_retries_until_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/0"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/0"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let url = format!("{}/0", server.uri());
        fast_probe(5).wait(&Client::new(), &url).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = format!("{}/1", server.uri());
        let err = fast_probe(3).wait(&Client::new(), &url).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotReady { attempts: 3, .. }));
        assert!(err.to_string().contains("not ready after 3 attempts"));
    }

    fn metadata() -> TorrentMetadata {
        TorrentMetadata {
            info_hash: "0123456789ABCDEF0123456789abcdef01234567".to_string(),
            name: "Show".to_string(),
            files: vec![
                TorrentFileEntry {
                    index: 0,
                    path: "Show/Show S01E01.mkv".to_string(),
                    size: 1024,
                },
                TorrentFileEntry {
                    index: 4,
                    path: "Show/Season 1/Show S01E02 (1080p).mkv".to_string(),
                    size: 1024,
                },
            ],
        }
    }

    #[test]
    fn test_webtorrent_url_uses_infohash_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let bridge =
            WebtorrentBridge::new("webtorrent", 8000, dir.path().to_path_buf(), metadata());

        assert_eq!(
            bridge.url_for(0).unwrap(),
            "http://localhost:8000/webtorrent/0123456789abcdef0123456789abcdef01234567/Show/Show%20S01E01.mkv"
        );
        assert_eq!(
            bridge.url_for(4).unwrap(),
            "http://localhost:8000/webtorrent/0123456789abcdef0123456789abcdef01234567/Show/Season%201/Show%20S01E02%20%281080p%29.mkv"
        );
        assert!(matches!(bridge.url_for(9), Err(BridgeError::UnknownFile(9))));
    }

    #[tokio::test]
    async fn test_probe_on_webtorrent_route() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/webtorrent/abc/Show/Show%20S01E01.mkv"))
            .respond_with(ResponseTemplate::new(206))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/0"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = Client::new();
        let url = format!("{}/webtorrent/abc/Show/Show%20S01E01.mkv", server.uri());
        fast_probe(2).wait(&client, &url).await.unwrap();

        let per_index = format!("{}/0", server.uri());
        assert!(fast_probe(2).wait(&client, &per_index).await.is_err());
    }

    #[tokio::test]
    async fn test_webtorrent_url_requires_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut bridge =
            WebtorrentBridge::new("webtorrent", 8000, dir.path().to_path_buf(), metadata())
                .with_probe(fast_probe(1));

        assert!(matches!(
            bridge.stream_url("magnet:?xt=urn:btih:abc", 4).await,
            Err(BridgeError::NotStarted)
        ));
    }
}

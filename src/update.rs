use std::path::{Path, PathBuf};

use reqwest::Client;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("download failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("release download returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("failed to replace {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Location of the newest release asset named `binary`
pub fn release_url(repository: &str, binary: &str) -> String {
    format!(
        "{}/releases/latest/download/{}",
        repository.trim_end_matches('/'),
        binary
    )
}

/// Download `url` and atomically put it in place of `target`
pub async fn replace_with_download(client: &Client, url: &str, target: &Path) -> Result<(), UpdateError> {
    let io_error = |source| UpdateError::Io {
        path: target.to_path_buf(),
        source,
    };

    info!(url, "downloading release");
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(UpdateError::Status(response.status()));
    }
    let bytes = response.bytes().await?;

    let tmp_path = target.with_extension("tmp");
    tokio::fs::write(&tmp_path, &bytes).await.map_err(io_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(io_error)?;
    }

    tokio::fs::rename(&tmp_path, target).await.map_err(io_error)?;
    info!(target = %target.display(), bytes = bytes.len(), "release installed");
    Ok(())
}

/// Replace the running executable with the latest release
pub async fn self_update() -> Result<(), UpdateError> {
    let exe = std::env::current_exe().map_err(|source| UpdateError::Io {
        path: PathBuf::from(env!("CARGO_PKG_NAME")),
        source,
    })?;
    let url = release_url(env!("CARGO_PKG_REPOSITORY"), env!("CARGO_PKG_NAME"));

    replace_with_download(&Client::new(), &url, &exe).await
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::inspect::size_human;

const RESULTS_PATH: &str = "/api/v2.0/indexers/all/results";

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("indexer returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("no magnet link found for '{0}'")]
    MagnetNotFound(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SearchResponse {
    #[serde(default)]
    results: Vec<RawResult>,
}

/// One entry of `Results[]` as the indexer sends it; most fields may be null
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawResult {
    title: Option<String>,
    guid: Option<String>,
    size: Option<u64>,
    magnet_uri: Option<String>,
    info_hash: Option<String>,
    seeders: Option<u32>,
    tracker: Option<String>,
}

/// A search result the user can pick from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseCandidate {
    pub title: String,
    pub guid: String,
    /// Empty when the indexer only knows a details page
    pub magnet_uri: String,
    pub info_hash: Option<String>,
    pub size: u64,
    pub seeders: u32,
    pub tracker: String,
}

impl From<RawResult> for ReleaseCandidate {
    fn from(raw: RawResult) -> Self {
        Self {
            title: raw.title.unwrap_or_default(),
            guid: raw.guid.unwrap_or_default(),
            magnet_uri: raw.magnet_uri.unwrap_or_default(),
            info_hash: raw.info_hash.filter(|h| !h.is_empty()),
            size: raw.size.unwrap_or(0),
            seeders: raw.seeders.unwrap_or(0),
            tracker: raw.tracker.unwrap_or_default(),
        }
    }
}

impl ReleaseCandidate {
    /// Label shown in selection lists
    pub fn label(&self) -> String {
        format!(
            "{} [{}] (seeders: {}, {})",
            self.title,
            size_human(self.size),
            self.seeders,
            self.tracker
        )
    }
}

/// Trim, lowercase and collapse runs of whitespace
pub fn sanitize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pull the first magnet link out of a release details page
pub fn extract_magnet(html: &str) -> Option<String> {
    let document = scraper::Html::parse_document(html);
    let selector = scraper::Selector::parse(r#"a[href^="magnet:?xt="]"#).ok()?;

    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .map(str::to_string)
        .next()
}

pub struct IndexerClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl IndexerClient {
    pub fn new(config: &Config) -> Self {
        Self::with_base_url(&config.indexer_base_url(), &config.indexer_api_key)
    }

    pub fn with_base_url(base_url: &str, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn results_url(&self) -> String {
        format!("{}{}", self.base_url, RESULTS_PATH)
    }

    /// Search every configured indexer, best seeded first
    pub async fn search(&self, query: &str) -> Result<Vec<ReleaseCandidate>, IndexerError> {
        let query = sanitize_query(query);
        debug!(query = %query, "searching indexer");

        let response = self
            .client
            .get(self.results_url())
            .query(&[("apikey", self.api_key.as_str()), ("Query", query.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IndexerError::Status(response.status()));
        }

        let body = response.text().await?;
        let parsed: SearchResponse = serde_json::from_str(&body)
            .map_err(|e| IndexerError::InvalidResponse(e.to_string()))?;

        let mut results: Vec<ReleaseCandidate> =
            parsed.results.into_iter().map(ReleaseCandidate::from).collect();
        results.sort_by(|a, b| b.seeders.cmp(&a.seeders));

        info!(query = %query, results = results.len(), "search finished");
        Ok(results)
    }

    /// Any HTTP answer counts, only a connection failure means the indexer is down
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(self.results_url())
            .query(&[("apikey", self.api_key.as_str())])
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => {
                debug!(status = %resp.status(), "indexer reachable");
                true
            }
            Err(e) => {
                debug!(error = %e, "indexer unreachable");
                false
            }
        }
    }

    /// Magnet link for a candidate, falling back to its info hash and then
    /// to scraping the release details page
    pub async fn resolve_magnet(&self, candidate: &ReleaseCandidate) -> Result<String, IndexerError> {
        if !candidate.magnet_uri.is_empty() {
            return Ok(candidate.magnet_uri.clone());
        }

        if let Some(ref hash) = candidate.info_hash {
            let encoded_name = urlencoding::encode(&candidate.title);
            return Ok(format!("magnet:?xt=urn:btih:{}&dn={}", hash, encoded_name));
        }

        // Some indexers put an opaque id in the GUID instead of a details page
        let details_page = match Url::parse(&candidate.guid) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => return Err(IndexerError::MagnetNotFound(candidate.title.clone())),
        };

        debug!(guid = %details_page, "scraping details page for magnet");
        let response = self.client.get(details_page).send().await?;
        if !response.status().is_success() {
            return Err(IndexerError::Status(response.status()));
        }

        let html = response.text().await?;
        extract_magnet(&html).ok_or_else(|| IndexerError::MagnetNotFound(candidate.title.clone()))
    }
}

/// Where a local Jackett install keeps its API key
pub fn server_config_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| {
        dirs.home_dir()
            .join(".config")
            .join("Jackett")
            .join("ServerConfig.json")
    })
}

pub fn discover_api_key() -> Option<String> {
    discover_api_key_from(&server_config_path()?)
}

pub fn discover_api_key_from(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = match serde_json::from_str(&contents) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable indexer server config");
            return None;
        }
    };

    value
        .get("APIKey")
        .and_then(|k| k.as_str())
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

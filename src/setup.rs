use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::indexer::{IndexerClient, discover_api_key_from};
use crate::selector::{SelectError, Selector};

#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Select(#[from] SelectError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    Ready,
    Quit,
}

const MENU: [&str; 2] = ["Configure indexer manually", "Quit"];

/// Make sure the indexer is reachable with an API key before anything is searched.
///
/// A missing key is first looked up in the indexer's own `server_config`; after that
/// the user may enter connection details by hand. Changes are written to `config_path`.
pub async fn ensure_indexer(
    config: &mut Config,
    selector: &mut dyn Selector,
    config_path: &Path,
    server_config: Option<&Path>,
) -> Result<SetupOutcome, SetupError> {
    let mut changed = false;

    if config.indexer_api_key.is_empty()
        && let Some(key) = server_config.and_then(discover_api_key_from)
    {
        info!("found indexer API key in local server config");
        config.indexer_api_key = key;
        changed = true;
    }

    loop {
        let available = IndexerClient::new(config).is_available().await;
        if available && !config.indexer_api_key.is_empty() {
            if changed {
                config.save_to(config_path)?;
            }
            return Ok(SetupOutcome::Ready);
        }

        if available {
            println!("Indexer is running but no API key is configured.");
        } else {
            println!("Indexer is not reachable at {}.", config.indexer_base_url());
        }

        let options: Vec<String> = MENU.iter().map(|s| s.to_string()).collect();
        match selector.select("Indexer setup", &options)? {
            Some(0) => {
                configure_manually(config, selector)?;
                config.save_to(config_path)?;
                changed = false;
            }
            _ => return Ok(SetupOutcome::Quit),
        }
    }
}

fn configure_manually(config: &mut Config, selector: &mut dyn Selector) -> Result<(), SetupError> {
    if let Some(host) = selector.input(&format!("Indexer host [{}]", config.indexer_host))? {
        config.indexer_host = host;
    }

    if let Some(port) = selector.input(&format!("Indexer port [{}]", config.indexer_port))? {
        match port.parse::<u16>() {
            Ok(port) if port != 0 => config.indexer_port = port,
            _ => {
                warn!(port = %port, "ignoring invalid indexer port");
                println!("Invalid port '{}', keeping {}", port, config.indexer_port);
            }
        }
    }

    if let Some(key) = selector.input("Indexer API key")? {
        config.indexer_api_key = key;
    }

    Ok(())
}

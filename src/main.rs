use std::fs::File;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use torrentwatch::app;
use torrentwatch::cli::Cli;
use torrentwatch::config::Config;
use torrentwatch::selector;
use torrentwatch::update;

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    // librqbit prints to the console and corrupts the list UI
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{level},librqbit=off,rqbit=off")))
    };

    // Log to a file so the list UI stays readable
    let log_path = std::env::temp_dir().join("torrentwatch.log");
    match File::create(&log_path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(file)
                .init();
            if debug {
                eprintln!("Logging to {}", log_path.display());
            }
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

fn edit_config() -> ExitCode {
    let path = match Config::config_path() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Failed to locate config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    // Make sure there is something to edit
    if let Err(e) = Config::load_from(&path) {
        eprintln!("Warning: {}", e);
    }

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vim".to_string());
    match std::process::Command::new(&editor).arg(&path).status() {
        Ok(status) if status.success() => ExitCode::SUCCESS,
        Ok(status) => {
            eprintln!("{} exited with {}", editor, status);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Failed to run {}: {}", editor, e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if cli.edit {
        return edit_config();
    }

    if cli.update {
        return match update::self_update().await {
            Ok(()) => {
                println!("Updated to the latest release.");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Update failed: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let (mut config, config_path) = match Config::config_path().and_then(|path| {
        let config = Config::load_from(&path)?;
        Ok((config, path))
    }) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
        // Blocking prompts cannot observe the token, a second interrupt forces the exit
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    let mut selector = selector::from_config(&config);
    if let Err(e) = app::run(config, &config_path, selector.as_mut(), cancel).await {
        error!(error = %e, "fatal error");
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

pub mod app;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod episodes;
pub mod history;
pub mod indexer;
pub mod inspect;
pub mod player;
pub mod selector;
pub mod session;
pub mod setup;
pub mod update;

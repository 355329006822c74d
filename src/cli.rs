//! Command-line interface for the crawler daemon.
//!
//! ```sh
//! # one fetch-and-save pass over every source, then exit
//! crawl-daemon once
//!
//! # continuous scheduled mode with the status API
//! crawl-daemon --config config/crawlers.toml start
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to crawlers.toml / crawlers.json (overrides discovery)
    #[arg(short, long, global = true, env = "CRAWLER_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run a single fetch-and-save cycle for every source and exit
    Once,
    /// Run every source on its own interval and serve the status API
    Start,
}

impl Cli {
    /// No subcommand means `once`.
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Once)
    }
}

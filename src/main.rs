#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

use anyhow::Result;
use ciris::app::dispatch;
use ciris::cli::Cli;
use ciris::config::Config;
use ciris::observability::init_logging;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => Config::load_or_init_at(path)?,
        None => Config::load_or_init()?,
    };

    init_logging(&config.observability)?;
    dispatch(cli, config).await
}

mod cli;
mod commands;
mod config;

use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use engine_logging::{engine_debug, LogDestination};

use crate::cli::{Cli, Command};
use crate::commands::App;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let destination = match &cli.log_file {
        Some(path) => LogDestination::Both(path.clone()),
        None => LogDestination::Terminal,
    };
    engine_logging::initialize(destination, engine_logging::parse_level(&cli.log_level));
    engine_debug!("parsed cli: {:?}", cli);

    let config = config::load_config(&cli.config)?;
    let app = App::new(&config, cli.sources.as_deref(), cli.group.clone()).context("start engine")?;

    match cli.command {
        Command::Search(args) => app.search(args).await.context("search")?,
        Command::Refresh(args) => app.refresh(args).await.context("refresh")?,
        Command::Explore(args) => app.explore(args).await.context("explore")?,
        Command::Info(args) => app.info(args).await.context("info")?,
        Command::Toc(args) => app.toc(args).await.context("toc")?,
        Command::Content(args) => app.content(args).await.context("content")?,
        Command::Cache(args) => app.cache(args).await.context("cache")?,
    }

    Ok(())
}

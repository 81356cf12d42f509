//! Shadowplug CLI - interactive host shell for shadow-copied plugins

mod cli;
mod console;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, OutputFormat};
use shadowplug_host::{HostConfig, PluginHost};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

/// `debug` with --verbose, otherwise `RUST_LOG` or `info`; always to stderr
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config =
        HostConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(base_dir) = cli.base_dir {
        config = config.with_base_dir(base_dir);
    }

    let host = PluginHost::new(config);
    let report = host.start().await.context("failed to start plugin host")?;
    info!(
        "{} plugins loaded, {} candidates skipped",
        report.loaded.len(),
        report.failures.len()
    );

    if cli.list {
        let listing = host.list().await;
        match cli.output {
            OutputFormat::Text => {
                for line in listing.lines() {
                    println!("{line}");
                }
            }
            OutputFormat::Json => println!("{}", listing.to_json()?),
        }
    } else {
        console::run(&host).await?;
    }

    let reaped = host.shutdown().await?;
    if !reaped.is_clean() {
        warn!(
            "{} shadow copies could not be deleted and were left in place",
            reaped.left_behind()
        );
    }
    Ok(())
}

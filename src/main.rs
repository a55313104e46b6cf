#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use relay_gateway::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relay-gateway", about = "API reverse proxy with transformation pipelines")]
struct Cli {
    /// Path to the gateway config file
    #[arg(short = 'c')]
    config: Option<PathBuf>,

    /// Path to the logger config file
    #[arg(short = 'l')]
    logger_config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // No config is not an error: print usage and leave quietly.
    let Some(config_path) = cli.config else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path,
        logger_config_path: cli.logger_config,
    }))
}

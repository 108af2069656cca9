use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use vcache_config::logging::init_logging;
use vcache_config::{log_server_info, log_server_warn, Config};
use vcache_server::Server;

#[derive(Parser)]
#[command(name = "vcached")]
#[command(version, about = "Velo Cache in-memory file server", long_about = None)]
struct Cli {
    /// Config file (default: ~/.vcache/config.toml merged with .vcache/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Listening socket path
    #[arg(short, long, global = true, env = "VCACHE_SOCKET")]
    socket: Option<PathBuf>,

    /// Worker threads
    #[arg(short = 'w', long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default)
    Start,
    /// Print the default configuration as TOML
    DefaultConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            let config = load_config(cli.config, cli.socket, cli.workers)?;
            start_server(config)?
        }
        Commands::DefaultConfig => print!("{}", Config::default_toml()),
    }

    Ok(())
}

fn load_config(
    path: Option<PathBuf>,
    socket: Option<PathBuf>,
    workers: Option<usize>,
) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    if let Some(socket) = socket {
        config.server.socket_path = socket;
    }
    if let Some(workers) = workers {
        config.server.num_workers = workers;
    }
    Ok(config)
}

fn start_server(mut config: Config) -> Result<()> {
    let warnings = config.validate();
    init_logging(&config.logging)?;
    for warning in warnings {
        log_server_warn!("Config value replaced", detail = warning.as_str());
    }

    let server = Server::bind(config)
        .context("failed to start server")?
        .with_signals();
    let report = server.run()?;

    log_server_info!(
        "Exit",
        mode = format!("{:?}", report.mode),
        files = report.files.len(),
        bytes = report.store.bytes_used,
    );
    Ok(())
}

//! # vcache CLI
//!
//! Command-line client for the Velo Cache file server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use vcache_cli::{Options, Runner};
use vcache_config::logging::{init_logging, LogLevel};
use vcache_config::{log_client_info, LoggingConfig};
use vcache_ipc::Compression;

/// Velo Cache - in-memory file server client
#[derive(Parser)]
#[command(name = "vcache")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server socket
    #[arg(short = 'f', long, global = true, env = "VCACHE_SOCKET", default_value = vcache_ipc::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Milliseconds to wait after each request
    #[arg(short = 't', long, global = true, default_value_t = 0)]
    delay_ms: u64,

    /// Save files evicted by the server here
    #[arg(short = 'D', long, global = true)]
    evicted_dir: Option<PathBuf>,

    /// Save files read from the server here
    #[arg(short = 'd', long, global = true)]
    read_dir: Option<PathBuf>,

    /// Compress file content on the wire
    #[arg(long, global = true)]
    compress: bool,

    /// Give up connecting after this many milliseconds
    #[arg(long, global = true, default_value_t = 2000)]
    connect_timeout_ms: u64,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload local files
    Write {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },

    /// Upload the files below a directory
    WriteDir {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Upload at most this many files (0 = all)
        #[arg(short, long, default_value_t = 0)]
        n: usize,
    },

    /// Append a local file to a stored one
    Append {
        /// Stored file name
        name: String,
        /// Local file with the bytes to append
        source: PathBuf,
    },

    /// Read stored files
    Read {
        #[arg(value_name = "NAME", required = true)]
        names: Vec<String>,
    },

    /// Read up to N stored files (0 = all)
    ReadN {
        #[arg(default_value_t = 0)]
        n: u32,
    },

    /// Lock stored files (held until the session ends)
    Lock {
        #[arg(value_name = "NAME", required = true)]
        names: Vec<String>,
    },

    /// Unlock stored files
    Unlock {
        #[arg(value_name = "NAME", required = true)]
        names: Vec<String>,
    },

    /// Remove stored files
    Remove {
        #[arg(value_name = "NAME", required = true)]
        names: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LogLevel::Info,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };
    init_logging(&LoggingConfig { level, file: None })?;

    let options = Options {
        socket: cli.socket,
        delay: Duration::from_millis(cli.delay_ms),
        evicted_dir: cli.evicted_dir,
        read_dir: cli.read_dir,
        compression: Compression::from(cli.compress),
        retry_interval: Duration::from_millis(200),
        connect_timeout: Duration::from_millis(cli.connect_timeout_ms),
    };
    let mut runner = Runner::connect(options)?;

    match cli.command {
        Commands::Write { files } => runner.write_files(&files)?,
        Commands::WriteDir { dir, n } => {
            let count = runner.write_dir(&dir, n)?;
            println!("Uploaded {} files from {}", count, dir.display());
        }
        Commands::Append { name, source } => runner.append(&name, &source)?,
        Commands::Read { names } => {
            for file in runner.read_files(&names)? {
                println!("{}  {} bytes", file.path.relative(), file.content.len());
            }
        }
        Commands::ReadN { n } => {
            for file in runner.read_n(n)? {
                println!("{}  {} bytes", file.path.relative(), file.content.len());
            }
        }
        Commands::Lock { names } => runner.lock(&names)?,
        Commands::Unlock { names } => runner.unlock(&names)?,
        Commands::Remove { names } => runner.remove(&names)?,
    }

    let bytes = runner.finish()?;
    log_client_info!("Done", written = bytes.written, read = bytes.read);
    Ok(())
}

pub mod commands;
pub mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sensor2store")]
#[command(about = "Upload sensor measurements and store them for querying")]
#[command(version)]
pub struct Cli {
    /// Path to config file (defaults to ./sensor2store.toml if present)
    #[arg(long, global = true, env = "SENSOR2STORE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the receiver: accept published measurements and serve queries
    Serve(ServeArgs),
    /// Publish one measurement, queueing it if the receiver is unreachable
    Upload(UploadArgs),
    /// Replay queued measurements
    Flush(FlushArgs),
    /// List queued measurements
    Pending,
}

#[derive(clap::Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "SENSOR2STORE_LISTEN")]
    pub listen: Option<String>,

    /// SQLite database file
    #[arg(long, env = "SENSOR2STORE_DATABASE")]
    pub database: Option<PathBuf>,

    /// Serve without the latest-value cache
    #[arg(long)]
    pub no_cache: bool,
}

#[derive(clap::Args)]
pub struct UploadArgs {
    /// Temperature in degrees Celsius
    #[arg(long, allow_negative_numbers = true)]
    pub temp: f32,

    /// Device ID (overrides config)
    #[arg(long, env = "SENSOR2STORE_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Receiver base URL (overrides config)
    #[arg(long, env = "SENSOR2STORE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Don't replay queued measurements before uploading
    #[arg(long)]
    pub no_flush: bool,
}

#[derive(clap::Args)]
pub struct FlushArgs {
    /// Receiver base URL (overrides config)
    #[arg(long, env = "SENSOR2STORE_ENDPOINT")]
    pub endpoint: Option<String>,
}

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "tilecache", about = "Caching HTTP gateway that mirrors origin paths on disk")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./tilecache.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration file.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Cache root directory, overriding the configuration file.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Log output format, overriding the configuration file.
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

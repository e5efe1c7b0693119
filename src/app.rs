//! Command-line arguments and configuration file.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`--config`, else `./config.toml` if present)
//! - Merging CLI with file config (CLI takes precedence)
//!
//! Top-level keys of the file mirror the CLI flags; the `[transport]` table
//! feeds [`TransportConfig`].

use crate::core::config::TransportConfig;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";

/// peerlink - peer-to-peer chat over a signaling server.
#[derive(Parser, Deserialize, Clone, Debug, Default, PartialEq)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// Path to a config file (TOML).
    #[clap(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// WebSocket URL of the signaling server.
    #[clap(long)]
    pub signaling_url: Option<String>,

    /// Peer id to register under. Random if omitted.
    #[clap(long)]
    pub peer_id: Option<String>,

    /// Directory for logs and local state. Defaults to ~/.peerlink/
    #[clap(long)]
    pub data_dir: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Peer to connect to at startup. Repeatable.
    #[clap(long = "connect", value_name = "PEER_ID")]
    pub connect: Vec<String>,
}

/// Everything the node needs to start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub args: Args,
    pub transport: TransportConfig,
}

impl Args {
    /// Load Args from CLI + TOML file (if any). CLI values override the file.
    pub fn load() -> Result<Settings> {
        let mut cli = Args::parse();
        cli.data_dir = cli.data_dir.map(Self::resolve_path);

        let (path, required) = match &cli.config {
            Some(p) => (p.clone(), true),
            None => (PathBuf::from("config.toml"), false),
        };
        if !required && !path.exists() {
            return Ok(Settings {
                args: cli,
                transport: TransportConfig::default(),
            });
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let (file, transport) = Self::from_toml(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(Settings {
            args: Self::merge(file, cli),
            transport,
        })
    }

    /// Parse the flag-level keys and the `[transport]` table of one file.
    pub fn from_toml(content: &str) -> Result<(Args, TransportConfig)> {
        let args: Args = toml::from_str(content)?;
        let transport = TransportConfig::from_toml_str(content)?;
        Ok((args, transport))
    }

    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Merge file args with CLI args (CLI takes precedence).
    pub fn merge(mut file: Args, cli: Args) -> Args {
        if cli.signaling_url.is_some() {
            file.signaling_url = cli.signaling_url;
        }
        if cli.peer_id.is_some() {
            file.peer_id = cli.peer_id;
        }
        if cli.data_dir.is_some() {
            file.data_dir = cli.data_dir;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if !cli.connect.is_empty() {
            file.connect = cli.connect;
        }
        file.config = cli.config;
        file
    }

    pub fn signaling_url(&self) -> &str {
        self.signaling_url.as_deref().unwrap_or(DEFAULT_SIGNALING_URL)
    }

    /// The configured peer id, or a fresh `peer-xxxxxxxx`.
    pub fn peer_id_or_random(&self) -> String {
        match &self.peer_id {
            Some(id) => id.clone(),
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                format!("peer-{}", &id[..8])
            }
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

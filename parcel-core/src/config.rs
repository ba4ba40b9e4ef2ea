//! Configuration management for Parcel
//!
//! Handles CLI argument parsing, config file loading, and defaults.
//! Values from `--config <FILE>` are overridden by explicit flags.

use clap::{Args, Parser, Subcommand};
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::chunker::DEFAULT_CHUNK_SIZE;
use crate::engine::ExportMode;
use crate::p2p::NetworkConfig;
use crate::publish::{PublishMode, PublishOptions};
use crate::retrieve::{MaterializeMode, RetrieveOptions};
use crate::storage::StoreBacking;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Cli(#[from] clap::Error),
}

#[derive(Parser, Debug)]
#[command(name = "parcel")]
#[command(about = "Share files and directories peer to peer with a single ticket", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// TOML file with node settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish a file or directory and print its ticket
    Share(ShareCommand),
    /// Fetch the content behind a ticket
    Receive(ReceiveCommand),
}

#[derive(Args, Debug, Clone, Default)]
struct NodeArgs {
    /// Keep blocks in a database under the data directory
    #[arg(long, global = true)]
    persistent: bool,

    /// Data directory for persistent storage
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// TCP and UDP port for P2P transport (0 picks a free port)
    #[arg(long, global = true)]
    listen_port: Option<u16>,

    /// Relay multiaddr to hold a reservation on (can be specified multiple times)
    #[arg(long = "relay", global = true)]
    relays: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ShareCommand {
    /// File or directory to publish
    pub path: PathBuf,

    /// Read the file into memory and add it in one shot
    #[arg(long, conflicts_with = "stream")]
    pub in_memory: bool,

    /// Stream through ingestion even for a single file
    #[arg(long)]
    pub stream: bool,

    /// Copy content into the store instead of referencing it in place
    #[arg(long)]
    pub copy: bool,

    /// Do not wrap streamed content in a collection named after it
    #[arg(long)]
    pub no_wrap: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ReceiveCommand {
    /// Ticket printed by `parcel share`
    pub ticket: String,

    /// Where to write the content
    pub destination: PathBuf,

    /// How to write the content out
    #[arg(long, value_enum, default_value_t = MaterializeMode::Auto)]
    pub materialize: MaterializeMode,

    /// Hard-link exported files from local sources when possible
    #[arg(long)]
    pub reference: bool,
}

impl From<&ShareCommand> for PublishOptions {
    fn from(cmd: &ShareCommand) -> Self {
        let mode = if cmd.in_memory {
            PublishMode::InMemory
        } else if cmd.stream {
            PublishMode::Stream
        } else {
            PublishMode::Auto
        };

        PublishOptions {
            mode,
            in_place: !cmd.copy,
            wrap: !cmd.no_wrap,
        }
    }
}

impl From<&ReceiveCommand> for RetrieveOptions {
    fn from(cmd: &ReceiveCommand) -> Self {
        RetrieveOptions {
            materialize: cmd.materialize,
            export_mode: if cmd.reference {
                ExportMode::TryReference
            } else {
                ExportMode::Copy
            },
        }
    }
}

/// What the process was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Share {
        path: PathBuf,
        options: PublishOptions,
    },
    Receive {
        ticket: String,
        destination: PathBuf,
        options: RetrieveOptions,
    },
}

/// Settings for one node session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Durable storage under `data_dir` instead of process memory
    pub persistent: bool,
    pub data_dir: PathBuf,
    pub listen_addr: Ipv4Addr,
    pub listen_port: u16,
    pub relays: Vec<String>,
    pub chunk_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            persistent: false,
            data_dir: PathBuf::from("./parcel-data"),
            listen_addr: Ipv4Addr::UNSPECIFIED,
            listen_port: 0,
            relays: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl NodeConfig {
    pub fn backing(&self) -> StoreBacking {
        if self.persistent {
            StoreBacking::Durable(self.data_dir.join("blobs"))
        } else {
            StoreBacking::Memory
        }
    }

    pub fn network_config(&self) -> Result<NetworkConfig, ConfigError> {
        let relays = self
            .relays
            .iter()
            .map(|relay| {
                relay
                    .parse::<Multiaddr>()
                    .map_err(|e| ConfigError::Invalid(format!("relay {:?}: {}", relay, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NetworkConfig {
            listen_ip: self.listen_addr,
            listen_port: self.listen_port,
            relays,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be non-zero".into()));
        }
        if self.chunk_size > u32::MAX as usize {
            return Err(ConfigError::Invalid("chunk_size does not fit in 32 bits".into()));
        }
        Ok(())
    }

    fn apply_overrides(&mut self, args: &NodeArgs) {
        if args.persistent {
            self.persistent = true;
        }
        if let Some(data_dir) = &args.data_dir {
            self.data_dir = data_dir.clone();
        }
        if let Some(port) = args.listen_port {
            self.listen_port = port;
        }
        if !args.relays.is_empty() {
            self.relays = args.relays.clone();
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub log_level: String,
    pub command: Command,
}

impl Config {
    /// Create config from process arguments
    pub fn from_cli() -> Result<Self, ConfigError> {
        Self::from_cli_parsed(Cli::parse())
    }

    /// Create config from an explicit argument list
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::from_cli_parsed(Cli::try_parse_from(args)?)
    }

    fn from_cli_parsed(cli: Cli) -> Result<Self, ConfigError> {
        let mut node = match &cli.config {
            Some(path) => Self::load_node_config(path)?,
            None => NodeConfig::default(),
        };
        node.apply_overrides(&cli.node);
        node.validate()?;

        let command = match cli.command {
            Commands::Share(cmd) => Command::Share {
                options: PublishOptions::from(&cmd),
                path: cmd.path,
            },
            Commands::Receive(cmd) => Command::Receive {
                options: RetrieveOptions::from(&cmd),
                ticket: cmd.ticket,
                destination: cmd.destination,
            },
        };

        Ok(Config {
            node,
            log_level: cli.log_level,
            command,
        })
    }

    /// Load node settings from a TOML file
    pub fn load_node_config(path: &Path) -> Result<NodeConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

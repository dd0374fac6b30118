use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::config::Firmware;
use crate::resolver::Overrides;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision the resource described by the given profile
    Apply(ApplyArgs),

    /// Validate the given YAML profile
    Validate(ValidateArgs),

    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

impl Commands {
    /// Log level requested by the subcommand, if it takes one.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Commands::Apply(opts) => opts.log_level,
            Commands::Validate(opts) => opts.log_level,
            Commands::Completions(_) => LogLevel::Warn,
        }
    }
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Path to the YAML file defining the profile
    #[arg(short, long, default_value = "profile.yaml", env = "PVESTRAP_PROFILE")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,

    /// Resolve and log every host command without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Never prompt; take every value from the profile and overrides
    #[arg(long, env = "PVESTRAP_NON_INTERACTIVE")]
    pub non_interactive: bool,

    #[command(flatten)]
    pub overrides: OverrideArgs,
}

/// Per-run overrides of profile values.
#[derive(Args, Debug, Default)]
pub struct OverrideArgs {
    /// VM/container identifier (default: next free)
    #[arg(long, env = "PVESTRAP_VMID")]
    pub vmid: Option<u32>,

    /// Resource name
    #[arg(long, env = "PVESTRAP_NAME")]
    pub name: Option<String>,

    /// Number of CPU cores
    #[arg(long, env = "PVESTRAP_CORES")]
    pub cores: Option<u32>,

    /// Memory in MiB
    #[arg(long, env = "PVESTRAP_MEMORY")]
    pub memory: Option<u32>,

    /// Disk size in GiB
    #[arg(long, env = "PVESTRAP_DISK")]
    pub disk: Option<u32>,

    /// Network bridge
    #[arg(long, env = "PVESTRAP_BRIDGE")]
    pub bridge: Option<String>,

    /// VLAN tag (0 for none)
    #[arg(long, env = "PVESTRAP_VLAN")]
    pub vlan: Option<u16>,

    /// Interface MTU (0 for the bridge default)
    #[arg(long, env = "PVESTRAP_MTU")]
    pub mtu: Option<u16>,

    /// Storage backend for the disk
    #[arg(long, env = "PVESTRAP_STORAGE")]
    pub storage: Option<String>,

    /// Talos release tag, or `latest`
    #[arg(long = "talos-version", env = "PVESTRAP_TALOS_VERSION")]
    pub version: Option<String>,

    /// Known image factory schematic id
    #[arg(long, env = "PVESTRAP_SCHEMATIC")]
    pub schematic: Option<String>,

    /// VM firmware (ovmf or seabios)
    #[arg(long, env = "PVESTRAP_FIRMWARE")]
    pub firmware: Option<Firmware>,

    /// Include the QEMU guest agent
    #[arg(long, env = "PVESTRAP_GUEST_AGENT")]
    pub guest_agent: Option<bool>,

    /// Start the resource after provisioning
    #[arg(long, env = "PVESTRAP_START")]
    pub start: Option<bool>,
}

impl From<&OverrideArgs> for Overrides {
    fn from(args: &OverrideArgs) -> Self {
        Self {
            vmid: args.vmid,
            name: args.name.clone(),
            cores: args.cores,
            memory: args.memory,
            disk: args.disk,
            bridge: args.bridge.clone(),
            vlan: args.vlan,
            mtu: args.mtu,
            storage: args.storage.clone(),
            version: args.version.clone(),
            schematic: args.schematic.clone(),
            firmware: args.firmware,
            guest_agent: args.guest_agent,
            start: args.start,
        }
    }
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the YAML file to validate
    #[arg(short, long, default_value = "profile.yaml", env = "PVESTRAP_PROFILE")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: Shell,
}

/// Represents log levels for controlling the verbosity of logging output.
///
/// Maps directly to the `tracing` levels; `--log-level debug` also shows
/// the output of read-only host queries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}

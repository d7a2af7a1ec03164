//! Clap derive structures for the `hubsync` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// hubsync -- keep a device network's logical model and its devices in step
#[derive(Debug, Parser)]
#[command(
    name = "hubsync",
    version,
    about = "Reconcile Insteon-style link tables, scenes and device settings",
    long_about = "Operator tool for the hubsync engine.\n\n\
        `simulate` runs the full read / expand / write / replay cycle against\n\
        in-memory devices; `config` manages hub profiles.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "HUBSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Hub profile to use
    #[arg(long, short = 'p', env = "HUBSYNC_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "HUBSYNC_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a read / scene / write / replay cycle against simulated devices
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Manage hub profiles and settings
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Number of dimmers responding to the demo scene
    #[arg(long, default_value = "3", value_parser = clap::value_parser!(u8).range(1..=32))]
    pub dimmers: u8,

    /// Make dimmer N (1-based) unreachable before the write pass
    #[arg(long, value_name = "N")]
    pub unreachable: Option<u8>,

    /// Fail the first K writes to dimmer 1
    #[arg(long, value_name = "K", default_value = "0")]
    pub fail_writes: usize,

    /// Override the profile's retry count
    #[arg(long)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,

    /// Display the resolved configuration
    Show,

    /// Write a config file with one hub profile
    Init {
        /// Hub address, e.g. 44.85.11
        #[arg(long)]
        hub: String,

        /// Profile name
        #[arg(long, default_value = "default")]
        name: String,

        /// Overwrite an existing profile of the same name
        #[arg(long)]
        force: bool,
    },
}

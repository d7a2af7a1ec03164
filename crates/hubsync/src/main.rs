mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, GlobalOpts};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(&cli.global);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// Log level comes from `-q`/`-v` and applies to this workspace's crates
/// only; dependencies stay at `warn`. `HUBSYNC_LOG`, then `RUST_LOG`,
/// replace it with a full filter directive.
fn init_tracing(global: &GlobalOpts) {
    let filter = ["HUBSYNC_LOG", "RUST_LOG"]
        .into_iter()
        .find_map(|var| EnvFilter::try_from_env(var).ok())
        .unwrap_or_else(|| default_filter(global));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn default_filter(global: &GlobalOpts) -> EnvFilter {
    if global.quiet {
        return EnvFilter::new("error");
    }
    let level = match global.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::new(format!(
        "warn,hubsync={level},hubsync_core={level},hubsync_config={level}"
    ))
}

async fn run(cli: Cli) -> Result<(), CliError> {
    tracing::debug!(command = ?cli.command, "dispatching command");
    match cli.command {
        Command::Config(args) => commands::config_cmd::handle(args, &cli.global),
        Command::Simulate(args) => commands::simulate::handle(args, &cli.global).await,
    }
}

pub mod config_cmd;
pub mod simulate;

use hubsync_config::{Config, load_config, load_config_from};

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load the configuration named by `--config`, or the canonical one.
pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    let config = match &global.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

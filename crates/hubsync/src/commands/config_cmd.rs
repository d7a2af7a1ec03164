//! Config subcommand handlers.

use std::path::PathBuf;

use hubsync_config::{Profile, config_path, save_config_to};
use hubsync_core::DeviceId;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&target_path(global).display().to_string(), global.quiet);
            Ok(())
        }
        ConfigCommand::Show => show(global),
        ConfigCommand::Init { hub, name, force } => init(global, &hub, name, force),
    }
}

fn target_path(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(config_path)
}

fn show(global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = super::load(global)?;
    let toml = toml::to_string_pretty(&cfg)?;
    let rendered = output::render_single(
        global.output,
        &cfg,
        |_| toml.trim_end().to_owned(),
        |c| {
            let mut names: Vec<_> = c.profiles.keys().cloned().collect();
            names.sort();
            names.join("\n")
        },
    );
    output::print_output(&rendered, global.quiet);
    Ok(())
}

fn init(global: &GlobalOpts, hub: &str, name: String, force: bool) -> Result<(), CliError> {
    let hub: DeviceId = hub.parse()?;
    let path = target_path(global);
    let mut cfg = super::load(global)?;

    if cfg.profiles.contains_key(&name) && !force {
        return Err(CliError::Conflict {
            resource_type: "profile".into(),
            identifier: name,
            hint: "Pass --force to overwrite it.".into(),
        });
    }

    let has_default = cfg
        .default_profile
        .as_ref()
        .is_some_and(|d| cfg.profiles.contains_key(d) && *d != name);
    if !has_default {
        cfg.default_profile = Some(name.clone());
    }
    cfg.profiles.insert(name.clone(), Profile::for_hub(hub));
    save_config_to(&cfg, &path)?;

    tracing::info!(profile = %name, %hub, path = %path.display(), "config written");
    output::print_output(
        &format!("Profile '{name}' (hub {hub}) written to {}", path.display()),
        global.quiet,
    );
    Ok(())
}

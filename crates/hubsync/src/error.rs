//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with help text.

use miette::Diagnostic;
use thiserror::Error;

use hubsync_config::ConfigError;
use hubsync_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(code(hubsync::not_found))]
    NotFound {
        resource_type: String,
        identifier: String,
    },

    #[error("{resource_type} '{identifier}' already exists")]
    #[diagnostic(code(hubsync::conflict), help("{hint}"))]
    Conflict {
        resource_type: String,
        identifier: String,
        hint: String,
    },

    #[error("Operation rejected: {message}")]
    #[diagnostic(code(hubsync::rejected))]
    Rejected { message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(hubsync::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(hubsync::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: hubsync config init --hub <ADDRESS> --name {name}"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error(transparent)]
    #[diagnostic(code(hubsync::config))]
    Config(ConfigError),

    // ── Engine ───────────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(hubsync::engine))]
    Core(CoreError),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not render TOML: {0}")]
    #[diagnostic(code(hubsync::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } | Self::ProfileNotFound { .. } => exit_code::NOT_FOUND,
            Self::Conflict { .. } => exit_code::CONFLICT,
            Self::Validation { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── Conversions ──────────────────────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DeviceNotFound { id } => Self::NotFound {
                resource_type: "device".into(),
                identifier: id.to_string(),
            },
            CoreError::SceneNotFound { id } => Self::NotFound {
                resource_type: "scene".into(),
                identifier: id.to_string(),
            },
            CoreError::DuplicateDevice { id } => Self::Conflict {
                resource_type: "device".into(),
                identifier: id.to_string(),
                hint: "Device addresses are unique within a network.".into(),
            },
            CoreError::InvalidAddress { input, reason } => Self::Validation {
                field: format!("address '{input}'"),
                reason,
            },
            CoreError::ValidationFailed { message } => Self::Validation {
                field: "input".into(),
                reason: message,
            },
            CoreError::Rejected { message } => Self::Rejected { message },
            other => Self::Core(other),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}

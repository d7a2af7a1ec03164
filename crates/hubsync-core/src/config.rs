// ── Runtime engine configuration ──
//
// Settings an `Engine` is built with. Callers (the CLI, a service, tests)
// construct an `EngineConfig` and hand it in; core never reads files.

use serde::{Deserialize, Serialize};

use crate::model::DeviceId;

/// Configuration of one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Address of the network's hub.
    pub hub: DeviceId,
    /// Retries for a sync job whose pass did not complete.
    pub max_retries: u32,
    /// Records acquired per link-table read step.
    pub read_batch_size: usize,
    /// Start with change recording enabled.
    pub record_changes: bool,
    /// Schedule a write whenever a device turns Changed.
    pub auto_sync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hub: DeviceId::ZERO,
            max_retries: 2,
            read_batch_size: 8,
            record_changes: true,
            auto_sync: false,
        }
    }
}

impl EngineConfig {
    pub fn for_hub(hub: DeviceId) -> Self {
        Self {
            hub,
            ..Self::default()
        }
    }
}

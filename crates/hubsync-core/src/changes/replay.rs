use serde::Serialize;
use tracing::{debug, info};

use super::entry::ChangeLog;
use crate::network::Network;

/// Outcome of replaying a log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub applied: usize,
    /// Entries whose target was missing or already in the logged state.
    pub skipped: usize,
}

/// Applies a recorded log to another copy of the model.
#[derive(Debug, Default)]
pub struct ChangeReplayer;

impl ChangeReplayer {
    /// Apply `log` entry by entry, in order. Replayed mutations are tagged
    /// as merge-originated, so a recorder on `network` ignores them while
    /// statuses and other subscribers still react normally.
    pub fn replay(log: &ChangeLog, network: &mut Network) -> ReplaySummary {
        let bus = network.bus().clone();
        let _merge = bus.merge_scope();

        let mut summary = ReplaySummary::default();
        for entry in log.iter() {
            if entry.apply(network) {
                summary.applied += 1;
            } else {
                debug!(?entry, "replay skipped entry");
                summary.skipped += 1;
            }
        }
        info!(
            applied = summary.applied,
            skipped = summary.skipped,
            "change log replayed"
        );
        summary
    }
}

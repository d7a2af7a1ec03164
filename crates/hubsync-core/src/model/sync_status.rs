// ── Sync status tracking ──
//
// Tri-state freshness marker shared by link records, tracked properties,
// channels, devices and link tables, plus the aggregation rule that rolls
// child statuses up into their container.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Whether a logical value is known to match its physical counterpart.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
pub enum SyncStatus {
    /// The physical value has not been read (or the last read failed).
    #[default]
    Unknown,
    /// Logical and physical values agree.
    Synced,
    /// The logical value was edited and still has to be written.
    Changed,
}

impl SyncStatus {
    pub fn is_synced(self) -> bool {
        matches!(self, Self::Synced)
    }

    /// Unknown and Changed both mean another physical pass is needed.
    pub fn needs_sync(self) -> bool {
        !self.is_synced()
    }
}

/// Aggregate child statuses: any Changed wins, then any Unknown, else Synced.
pub fn aggregate<I>(statuses: I) -> SyncStatus
where
    I: IntoIterator<Item = SyncStatus>,
{
    let mut any_unknown = false;
    for status in statuses {
        match status {
            SyncStatus::Changed => return SyncStatus::Changed,
            SyncStatus::Unknown => any_unknown = true,
            SyncStatus::Synced => {}
        }
    }
    if any_unknown {
        SyncStatus::Unknown
    } else {
        SyncStatus::Synced
    }
}

// ── Tracked values ──────────────────────────────────────────────────

/// Which copy of a tracked value a change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ValueSide {
    Logical,
    Physical,
}

/// A logical/physical value pair with a derived status.
///
/// `logical == None` means nobody expressed an intent yet: the value
/// follows whatever the device reports. `physical == None` means the
/// device has not been read (or the last read failed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracked<T> {
    #[serde(default = "Option::default")]
    logical: Option<T>,
    #[serde(default = "Option::default")]
    physical: Option<T>,
}

impl<T> Default for Tracked<T> {
    fn default() -> Self {
        Self {
            logical: None,
            physical: None,
        }
    }
}

impl<T: Copy + PartialEq> Tracked<T> {
    pub fn with_logical(value: T) -> Self {
        Self {
            logical: Some(value),
            physical: None,
        }
    }

    pub fn logical(&self) -> Option<T> {
        self.logical
    }

    pub fn physical(&self) -> Option<T> {
        self.physical
    }

    /// The value the model presents: the logical intent, else the device's.
    pub fn effective(&self) -> Option<T> {
        self.logical.or(self.physical)
    }

    pub fn get(&self, side: ValueSide) -> Option<T> {
        match side {
            ValueSide::Logical => self.logical,
            ValueSide::Physical => self.physical,
        }
    }

    pub fn status(&self) -> SyncStatus {
        match (self.logical, self.physical) {
            (_, None) => SyncStatus::Unknown,
            (None, Some(_)) => SyncStatus::Synced,
            (Some(l), Some(p)) if l == p => SyncStatus::Synced,
            (Some(_), Some(_)) => SyncStatus::Changed,
        }
    }

    /// Set one side. Returns the previous value when it actually changed.
    pub fn set(&mut self, side: ValueSide, value: Option<T>) -> Option<Option<T>> {
        let slot = match side {
            ValueSide::Logical => &mut self.logical,
            ValueSide::Physical => &mut self.physical,
        };
        if *slot == value {
            return None;
        }
        Some(std::mem::replace(slot, value))
    }

    /// Fold a fresh physical read into the pair.
    ///
    /// A value that was in sync adopts the device's new value; an edited or
    /// never-confirmed logical value is kept so the next write wins.
    /// Returns the previous logical value when adoption changed it.
    pub fn absorb_read(&mut self, value: T) -> Option<Option<T>> {
        let was_synced = self.status().is_synced();
        self.physical = Some(value);
        if was_synced && self.logical.is_some() && self.logical != Some(value) {
            return Some(std::mem::replace(&mut self.logical, Some(value)));
        }
        None
    }
}

// ── Container status ────────────────────────────────────────────────

/// Aggregate status cell of a container (device, channel).
///
/// Recomputation is suppressed until the container goes live (initial
/// load finished) and while a deferred batch is open.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCell {
    status: SyncStatus,
    #[serde(skip)]
    live: bool,
    #[serde(skip)]
    defer_depth: u32,
}

impl StatusCell {
    pub fn get(&self) -> SyncStatus {
        self.status
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn go_live(&mut self) {
        self.live = true;
    }

    pub fn defer(&mut self) {
        self.defer_depth += 1;
    }

    /// Close one deferred scope. Returns `true` when the last one closed.
    pub fn resume(&mut self) -> bool {
        debug_assert!(self.defer_depth > 0, "resume without matching defer");
        self.defer_depth = self.defer_depth.saturating_sub(1);
        self.defer_depth == 0
    }

    pub fn can_recompute(&self) -> bool {
        self.live && self.defer_depth == 0
    }

    /// Store a new status. Returns the old one when it differs.
    pub fn update(&mut self, status: SyncStatus) -> Option<SyncStatus> {
        if self.status == status {
            return None;
        }
        Some(std::mem::replace(&mut self.status, status))
    }
}

// ── Link table ──
//
// Ordered records of one device, exactly as they sit in device memory.
// Non-hub tables end with a high-water-mark sentinel; the hub's table is an
// unordered set keyed by (peer, group, role) and carries no sentinel.
//
// Every mutation funnels through `insert_at` / `replace_at` / `drop_at`,
// which bump the revision, publish one change event and recompute the
// aggregate status.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::address::DeviceId;
use super::link_record::{LinkRecord, LinkRole, RecordUid};
use super::sync_status::{SyncStatus, aggregate};
use crate::changes::ChangeEntry;
use crate::event::{Notifier, StatusTarget};

/// The link table of one device (or a detached physical copy of it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkTable {
    hub: bool,
    records: Vec<LinkRecord>,
    #[serde(default)]
    revision: u32,
    #[serde(default)]
    next_record_to_read: usize,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    last_status: SyncStatus,
    #[serde(default)]
    last_update: Option<DateTime<Utc>>,
    #[serde(skip)]
    owner: Option<DeviceId>,
    #[serde(skip)]
    notifier: Notifier,
}

impl LinkTable {
    /// An empty logical table. Non-hub tables start with their sentinel.
    pub fn new(hub: bool) -> Self {
        let records = if hub {
            Vec::new()
        } else {
            vec![LinkRecord::high_water_mark()]
        };
        Self {
            records,
            ..Self::mirror(hub)
        }
    }

    /// An empty table to be filled from a device by a driver.
    pub fn mirror(hub: bool) -> Self {
        Self {
            hub,
            records: Vec::new(),
            revision: 0,
            next_record_to_read: 0,
            is_read: false,
            last_status: SyncStatus::Unknown,
            last_update: None,
            owner: None,
            notifier: Notifier::default(),
        }
    }

    pub(crate) fn attach(&mut self, owner: DeviceId, notifier: Notifier) {
        self.owner = Some(owner);
        self.notifier = notifier;
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn owner(&self) -> Option<DeviceId> {
        self.owner
    }

    pub fn is_hub(&self) -> bool {
        self.hub
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[LinkRecord] {
        &self.records
    }

    pub fn get(&self, seq: usize) -> Option<&LinkRecord> {
        self.records.get(seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinkRecord> {
        self.records.iter()
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn next_record_to_read(&self) -> usize {
        self.next_record_to_read
    }

    pub fn is_read(&self) -> bool {
        self.is_read
    }

    /// Aggregate status of the records (Unknown until the table was read).
    pub fn status(&self) -> SyncStatus {
        self.last_status
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Position of the high-water-mark sentinel, if any.
    pub fn high_water_mark(&self) -> Option<usize> {
        if self.hub {
            return None;
        }
        self.records.iter().position(LinkRecord::is_high_water_mark)
    }

    /// Number of slots before the sentinel.
    pub fn stored_len(&self) -> usize {
        self.high_water_mark().unwrap_or(self.records.len())
    }

    /// Records before the sentinel.
    pub fn stored_records(&self) -> &[LinkRecord] {
        &self.records[..self.stored_len()]
    }

    /// In-use records, sentinel excluded.
    pub fn active_records(&self) -> impl Iterator<Item = &LinkRecord> {
        self.records
            .iter()
            .filter(|r| r.is_in_use() && !r.is_high_water_mark())
    }

    /// In-use records pointing at `dest`.
    pub fn records_for(&self, dest: DeviceId) -> impl Iterator<Item = &LinkRecord> {
        self.active_records().filter(move |r| r.dest() == dest)
    }

    /// First in-use record with this (peer, group, role).
    pub fn find(&self, dest: DeviceId, group: u8, role: LinkRole) -> Option<(usize, &LinkRecord)> {
        self.records.iter().enumerate().find(|(_, r)| {
            r.is_in_use() && !r.is_high_water_mark() && r.hub_key() == (dest, group, role)
        })
    }

    pub fn position_of(&self, uid: RecordUid) -> Option<usize> {
        if uid.is_none() {
            return self.records.iter().position(|r| r.uid().is_none());
        }
        self.records.iter().position(|r| r.uid() == uid)
    }

    pub fn record(&self, uid: RecordUid) -> Option<&LinkRecord> {
        self.position_of(uid).and_then(|seq| self.records.get(seq))
    }

    // ── Public mutations ─────────────────────────────────────────────

    /// Add a record in the first reusable slot, else at the logical tail.
    ///
    /// On a device table the tail insert pushes the sentinel one slot
    /// further; the sentinel keeps its uid. Sentinels themselves are
    /// rejected.
    pub fn add_record(&mut self, record: LinkRecord) -> bool {
        if record.is_high_water_mark() {
            warn!(owner = ?self.owner, "refusing to add a high-water mark");
            return false;
        }

        let limit = self.stored_len();
        // Hub slots holding a pending delete must survive until written.
        let reusable = self.records[..limit]
            .iter()
            .position(|r| !r.is_in_use() && (!self.hub || r.status().is_synced()));

        match reusable {
            Some(seq) => {
                self.replace_at(seq, record);
            }
            None => self.insert_at(limit, record),
        }
        true
    }

    /// Positional write used while acquiring records from a device.
    /// Pads with placeholders when `seq` is past the end. No sentinel
    /// maintenance: the caller places the sentinel.
    pub fn set_record_at(&mut self, seq: usize, record: LinkRecord) {
        while self.records.len() < seq {
            self.insert_at(self.records.len(), LinkRecord::placeholder());
        }
        if seq == self.records.len() {
            self.insert_at(seq, record);
        } else {
            self.replace_at(seq, record);
        }
    }

    /// Replace `old` with `new`.
    ///
    /// The exact record (by uid) is preferred; otherwise the first identity
    /// match, or the last one when `new` is not in use so unused slots drift
    /// toward the tail. Replacing the sentinel adds `new`. A vanished
    /// not-in-use `old` means its slot was already reused, so `new` is added.
    pub fn replace_record(&mut self, old: &LinkRecord, new: LinkRecord) -> bool {
        if old.is_high_water_mark() {
            return self.add_record(new);
        }

        let seq = self.position_of(old.uid()).or_else(|| {
            let mut candidates = self.records.iter().enumerate().filter(|(_, r)| {
                !r.is_high_water_mark() && r.is_in_use() == old.is_in_use() && r.matches(old)
            });
            let found = if new.is_in_use() {
                candidates.next()
            } else {
                candidates.last()
            };
            found.map(|(seq, _)| seq)
        });

        match seq {
            Some(seq) => {
                self.replace_at(seq, new);
                true
            }
            None if !old.is_in_use() => self.add_record(new),
            None => false,
        }
    }

    /// Logical delete: the match is replaced by a copy with in-use cleared.
    /// The table never shrinks.
    pub fn remove_record(&mut self, record: &LinkRecord) -> bool {
        let seq = self.position_of(record.uid()).or_else(|| {
            self.records
                .iter()
                .rposition(|r| !r.is_high_water_mark() && r.is_in_use() && r.matches(record))
        });
        let Some(seq) = seq else {
            return false;
        };
        let current = &self.records[seq];
        if current.is_high_water_mark() {
            return false;
        }
        if !current.is_in_use() {
            return true;
        }
        let deleted = current.with_in_use(false).with_status(SyncStatus::Changed);
        self.replace_at(seq, deleted);
        true
    }

    /// Exchange two non-sentinel records.
    ///
    /// Runs as three uid-addressed replacements (one side parked under
    /// `RecordUid::NONE` in between) so that no two records ever share a
    /// uid and replaying the recorded replacements reproduces the swap.
    pub fn swap_records(&mut self, i: usize, j: usize) -> bool {
        let (Some(a), Some(b)) = (self.records.get(i), self.records.get(j)) else {
            return false;
        };
        if i == j || a.is_high_water_mark() || b.is_high_water_mark() {
            return false;
        }

        let (mut a, mut b) = (a.clone(), b.clone());
        if !a.same_content(&b) {
            a = a.with_status(SyncStatus::Changed);
            b = b.with_status(SyncStatus::Changed);
        }

        self.replace_at(i, b.with_uid(RecordUid::NONE));
        self.replace_at(j, a);
        self.replace_at(i, b);
        true
    }

    /// Forget every record (the table must be read again).
    pub fn clear(&mut self) {
        let fresh = Self::new(self.hub);
        self.records = fresh.records;
        self.is_read = false;
        self.next_record_to_read = 0;
        self.revision = self.revision.wrapping_add(1);
        if let Some(device) = self.owner {
            self.notifier.change(|| ChangeEntry::TableCleared { device });
        }
        self.recompute_status();
    }

    // ── Driver-facing acquisition bookkeeping ────────────────────────

    /// Start a fresh acquisition.
    pub fn begin_read(&mut self) {
        self.records.clear();
        self.next_record_to_read = 0;
        self.is_read = false;
        self.revision = self.revision.wrapping_add(1);
    }

    pub fn set_next_record_to_read(&mut self, seq: usize) {
        self.next_record_to_read = seq;
    }

    /// Mark acquisition complete.
    pub fn finish_read(&mut self) {
        self.is_read = true;
        self.last_update = Some(Utc::now());
        self.recompute_status();
    }

    /// Mirror a successful physical write into this copy.
    /// `seq` is `None` for the hub, whose records are placed by identity.
    pub fn record_physical_write(&mut self, seq: Option<usize>, record: &LinkRecord) {
        let stored = LinkRecord::from_physical(record);
        if let Some(seq) = seq {
            let limit = self.stored_len();
            if seq < limit {
                self.replace_at(seq, stored);
            } else {
                self.insert_at(limit.min(self.records.len()), stored);
                if !self.hub && self.high_water_mark().is_none() {
                    self.insert_at(self.records.len(), LinkRecord::high_water_mark());
                }
            }
            return;
        }

        let existing = self
            .records
            .iter()
            .position(|r| r.is_in_use() && r.hub_key() == record.hub_key());
        match (existing, record.is_in_use()) {
            (Some(seq), true) => {
                self.replace_at(seq, stored);
            }
            (None, true) => self.insert_at(self.records.len(), stored),
            (Some(seq), false) => {
                self.drop_at(seq);
            }
            (None, false) => {}
        }
    }

    // ── Low-level positional operations ──────────────────────────────

    pub(crate) fn insert_at(&mut self, seq: usize, record: LinkRecord) {
        let seq = seq.min(self.records.len());
        trace!(owner = ?self.owner, seq, record = %record, "insert link record");
        self.records.insert(seq, record.clone());
        self.revision = self.revision.wrapping_add(1);
        if let Some(device) = self.owner {
            self.notifier
                .change(|| ChangeEntry::RecordAdded { device, seq, record });
        }
        self.recompute_status();
    }

    pub(crate) fn replace_at(&mut self, seq: usize, record: LinkRecord) -> Option<LinkRecord> {
        let slot = self.records.get_mut(seq)?;
        if *slot == record {
            return None;
        }
        trace!(owner = ?self.owner, seq, record = %record, "replace link record");
        let old = std::mem::replace(slot, record.clone());
        self.revision = self.revision.wrapping_add(1);
        if let Some(device) = self.owner {
            self.notifier.change(|| ChangeEntry::RecordReplaced {
                device,
                seq,
                old: old.clone(),
                record,
            });
        }
        self.recompute_status();
        Some(old)
    }

    pub(crate) fn drop_at(&mut self, seq: usize) -> Option<LinkRecord> {
        if seq >= self.records.len() {
            return None;
        }
        let removed = self.records.remove(seq);
        trace!(owner = ?self.owner, seq, record = %removed, "drop link record");
        self.revision = self.revision.wrapping_add(1);
        if let Some(device) = self.owner {
            let uid = removed.uid();
            self.notifier
                .change(|| ChangeEntry::RecordDropped { device, seq, uid });
        }
        self.recompute_status();
        Some(removed)
    }

    /// Replace the record carrying `old_uid`, wherever it is now.
    pub(crate) fn replace_uid(&mut self, old_uid: RecordUid, record: LinkRecord) -> bool {
        match self.position_of(old_uid) {
            Some(seq) => {
                self.replace_at(seq, record);
                true
            }
            None => false,
        }
    }

    /// Re-insert a record added by another session. Device tables never
    /// grow past their sentinel.
    pub(crate) fn restore_added(&mut self, seq: usize, record: &LinkRecord) -> bool {
        if !record.uid().is_none() && self.position_of(record.uid()).is_some() {
            return false;
        }
        if record.is_high_water_mark() {
            if self.hub || self.high_water_mark().is_some() {
                return false;
            }
            self.insert_at(self.records.len(), record.clone());
            return true;
        }
        let at = if self.hub {
            self.records.len()
        } else {
            seq.min(self.stored_len())
        };
        self.insert_at(at, record.clone());
        true
    }

    pub(crate) fn drop_uid(&mut self, uid: RecordUid) -> bool {
        match self.position_of(uid) {
            Some(seq) => self.drop_at(seq).is_some(),
            None => false,
        }
    }

    /// Mark the record carrying `uid` as matching the device.
    pub(crate) fn confirm(&mut self, uid: RecordUid) -> bool {
        let Some(seq) = self.position_of(uid) else {
            return false;
        };
        let synced = self.records[seq].with_status(SyncStatus::Synced);
        self.replace_at(seq, synced);
        true
    }

    /// Make sure a device table ends with exactly one sentinel.
    pub(crate) fn ensure_high_water_mark(&mut self) {
        if self.hub {
            return;
        }
        match self.high_water_mark() {
            None => self.insert_at(self.records.len(), LinkRecord::high_water_mark()),
            Some(seq) => {
                while self.records.len() > seq + 1 {
                    self.drop_at(self.records.len() - 1);
                }
            }
        }
    }

    /// Repair a table that was just deserialized: duplicate or missing
    /// uids get fresh ones and the sentinel is put back in place.
    pub(crate) fn repair_after_load(&mut self, seen: &mut HashSet<RecordUid>) {
        for seq in 0..self.records.len() {
            let uid = self.records[seq].uid();
            if uid.is_none() || !seen.insert(uid) {
                let fresh = self.records[seq].with_uid(RecordUid::next());
                seen.insert(fresh.uid());
                self.replace_at(seq, fresh);
            }
        }
        if self.hub {
            while let Some(seq) = self.records.iter().position(LinkRecord::is_high_water_mark) {
                self.drop_at(seq);
            }
        }
        self.ensure_high_water_mark();
        self.recompute_status();
    }

    pub(crate) fn max_uid(&self) -> RecordUid {
        self.records
            .iter()
            .map(LinkRecord::uid)
            .max()
            .unwrap_or(RecordUid::NONE)
    }

    /// A read failed: the table has to be read again.
    pub(crate) fn mark_unread(&mut self) {
        self.is_read = false;
        self.recompute_status();
    }

    pub(crate) fn mark_read(&mut self, next_record_to_read: usize) {
        self.is_read = true;
        self.next_record_to_read = next_record_to_read;
        self.last_update = Some(Utc::now());
        self.recompute_status();
    }

    pub(crate) fn stamp(&mut self) {
        self.last_update = Some(Utc::now());
    }

    pub(crate) fn recompute_status(&mut self) {
        let unread = (!self.is_read).then_some(SyncStatus::Unknown);
        let status = aggregate(
            self.records
                .iter()
                .filter(|r| !r.is_high_water_mark())
                .map(LinkRecord::status)
                .chain(unread),
        );
        if status == self.last_status {
            return;
        }
        let old = std::mem::replace(&mut self.last_status, status);
        if let Some(device) = self.owner {
            self.notifier
                .status(StatusTarget::LinkTable(device), old, status);
        }
    }
}

// ── Link table reconciliation ──
//
// Merges a physical copy of a link table (as acquired by a driver) into the
// logical table, and plans the writes that bring the device in line with
// the logical table afterwards. Device tables correspond slot by slot; the
// hub's table is matched by (peer, group, role) because its physical order
// carries no meaning.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::link_record::{LinkRecord, RecordUid};
use super::link_table::LinkTable;
use super::sync_status::SyncStatus;

/// One step of a write pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteAction {
    /// Write `record` to the device. `seq` is the slot for device tables and
    /// `None` for the hub.
    Write {
        seq: Option<usize>,
        record: LinkRecord,
    },
    /// The device already holds this content; just mark it Synced.
    Confirm { uid: RecordUid },
    /// A Synced record the device never stored; forget it.
    Drop { uid: RecordUid },
}

#[derive(Debug, Clone, Copy)]
enum Decision {
    Adopt(usize),
    Confirm,
    Drop,
}

/// Counts reported by a merge, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub adopted: usize,
    pub confirmed: usize,
    pub dropped: usize,
    pub appended: usize,
    pub kept: usize,
}

impl LinkTable {
    /// Fold a completely read physical table into this logical table.
    pub fn merge_on_read(&mut self, physical: &LinkTable) -> MergeSummary {
        let summary = if self.is_hub() {
            self.merge_hub(physical)
        } else {
            self.merge_positional(physical)
        };
        debug!(
            owner = ?self.owner(),
            adopted = summary.adopted,
            confirmed = summary.confirmed,
            dropped = summary.dropped,
            appended = summary.appended,
            kept = summary.kept,
            "merged physical link table"
        );
        summary
    }

    fn merge_positional(&mut self, physical: &LinkTable) -> MergeSummary {
        let mut summary = MergeSummary::default();
        let phys = physical.stored_records();
        let common = phys.len().min(self.stored_len());

        for (seq, physical_rec) in phys.iter().enumerate().take(common) {
            let logical = &self.records()[seq];
            let uid = logical.uid();
            let decision = match logical.status() {
                SyncStatus::Synced if !logical.same_content(physical_rec) => {
                    Some(Decision::Adopt(seq))
                }
                SyncStatus::Unknown if logical.same_content(physical_rec) => {
                    Some(Decision::Confirm)
                }
                SyncStatus::Synced => None,
                SyncStatus::Unknown | SyncStatus::Changed => {
                    summary.kept += 1;
                    None
                }
            };
            trace!(seq, logical = %logical, physical = %physical_rec, ?decision, "positional merge");
            match decision {
                Some(Decision::Adopt(_)) => {
                    self.replace_at(seq, LinkRecord::from_physical(physical_rec));
                    summary.adopted += 1;
                }
                Some(Decision::Confirm) => {
                    self.confirm(uid);
                    summary.confirmed += 1;
                }
                Some(Decision::Drop) | None => {}
            }
        }

        // Logical slots past the physical end: a Synced record there never
        // existed on the device, anything else still has to be written.
        for seq in (common..self.stored_len()).rev() {
            if self.records()[seq].status().is_synced() {
                self.drop_at(seq);
                summary.dropped += 1;
            } else {
                summary.kept += 1;
            }
        }

        for physical_rec in phys.iter().skip(common) {
            self.insert_at(self.stored_len(), LinkRecord::from_physical(physical_rec));
            summary.appended += 1;
        }

        self.ensure_high_water_mark();
        self.mark_read(phys.len());
        summary
    }

    fn merge_hub(&mut self, physical: &LinkTable) -> MergeSummary {
        let mut summary = MergeSummary::default();
        let phys: Vec<&LinkRecord> = physical.active_records().collect();
        let mut matched: HashSet<usize> = HashSet::new();
        let mut decisions: Vec<(RecordUid, Decision)> = Vec::new();

        for logical in self.records() {
            // Prefer a physical entry with identical content, then any entry
            // with the same key.
            let candidate = phys
                .iter()
                .enumerate()
                .filter(|(i, p)| !matched.contains(i) && p.hub_key() == logical.hub_key())
                .min_by_key(|(_, p)| !p.same_content(logical))
                .map(|(i, _)| i);
            if let Some(i) = candidate {
                matched.insert(i);
            }

            let decision = match (logical.status(), candidate) {
                (SyncStatus::Synced, Some(i)) if !logical.same_content(phys[i]) => {
                    Some(Decision::Adopt(i))
                }
                (SyncStatus::Synced, Some(_)) => None,
                (SyncStatus::Synced, None) => Some(Decision::Drop),
                (SyncStatus::Unknown, Some(i)) if logical.same_content(phys[i]) => {
                    Some(Decision::Confirm)
                }
                // Pending edits and pending deletes survive a read, even when
                // nothing on the hub corresponds to them.
                (SyncStatus::Unknown | SyncStatus::Changed, _) => {
                    summary.kept += 1;
                    None
                }
            };
            trace!(logical = %logical, ?candidate, ?decision, "hub merge");
            if let Some(decision) = decision {
                decisions.push((logical.uid(), decision));
            }
        }

        for (uid, decision) in decisions {
            match decision {
                Decision::Adopt(i) => {
                    self.replace_uid(uid, LinkRecord::from_physical(phys[i]));
                    summary.adopted += 1;
                }
                Decision::Confirm => {
                    self.confirm(uid);
                    summary.confirmed += 1;
                }
                Decision::Drop => {
                    self.drop_uid(uid);
                    summary.dropped += 1;
                }
            }
        }

        for (i, physical_rec) in phys.iter().enumerate() {
            if !matched.contains(&i) {
                self.insert_at(self.len(), LinkRecord::from_physical(physical_rec));
                summary.appended += 1;
            }
        }

        self.mark_read(physical.len());
        summary
    }

    /// Plan the writes that make the device match this table. Run after
    /// [`LinkTable::merge_on_read`] against the same physical copy.
    pub fn plan_writes(&self, physical: &LinkTable) -> Vec<WriteAction> {
        if self.is_hub() {
            return self.plan_hub_writes(physical);
        }

        let phys = physical.stored_records();
        let mut actions = Vec::new();
        for (seq, rec) in self.stored_records().iter().enumerate() {
            let on_device = phys.get(seq);
            match (rec.status(), on_device) {
                (SyncStatus::Synced, None) => actions.push(WriteAction::Drop { uid: rec.uid() }),
                (SyncStatus::Synced, Some(_)) => {}
                (_, Some(p)) if p.same_content(rec) => {
                    actions.push(WriteAction::Confirm { uid: rec.uid() });
                }
                _ => actions.push(WriteAction::Write {
                    seq: Some(seq),
                    record: rec.clone(),
                }),
            }
        }
        actions
    }

    fn plan_hub_writes(&self, physical: &LinkTable) -> Vec<WriteAction> {
        let mut actions = Vec::new();
        for rec in self.records() {
            if rec.status().is_synced() {
                continue;
            }
            let on_device = physical
                .active_records()
                .find(|p| p.hub_key() == rec.hub_key());
            let action = match (rec.is_in_use(), on_device) {
                (true, Some(p)) if p.same_content(rec) => WriteAction::Confirm { uid: rec.uid() },
                (true, _) | (false, Some(_)) => WriteAction::Write {
                    seq: None,
                    record: rec.clone(),
                },
                // Nothing to clear on the hub.
                (false, None) => WriteAction::Confirm { uid: rec.uid() },
            };
            actions.push(action);
        }
        actions
    }

    /// Record that `record` was written: mirror it into `physical` and mark
    /// the logical record Synced.
    pub fn commit_write(&mut self, physical: &mut LinkTable, seq: Option<usize>, record: &LinkRecord) {
        physical.record_physical_write(seq, record);
        self.confirm(record.uid());
    }

    /// Apply the bookkeeping-only actions of a plan (no device I/O).
    pub fn apply_local_action(&mut self, action: &WriteAction) -> bool {
        match action {
            WriteAction::Confirm { uid } => self.confirm(*uid),
            WriteAction::Drop { uid } => self.drop_uid(*uid),
            WriteAction::Write { .. } => false,
        }
    }

    /// Close a write pass. Hub deletes that reached the device leave no
    /// trace in the table, since the hub keeps no slot for them.
    pub fn finish_write(&mut self) {
        if self.is_hub() {
            let cleared: Vec<RecordUid> = self
                .records()
                .iter()
                .filter(|r| !r.is_in_use() && r.status().is_synced())
                .map(LinkRecord::uid)
                .collect();
            for uid in cleared {
                trace!(owner = ?self.owner(), ?uid, "hub delete completed");
                self.drop_uid(uid);
            }
        }
        self.ensure_high_water_mark();
        self.stamp();
        self.recompute_status();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::DeviceId;

    fn id(n: u8) -> DeviceId {
        DeviceId::new([0x33, 0x44, n])
    }

    fn physical(records: &[LinkRecord], hub: bool) -> LinkTable {
        let mut table = LinkTable::mirror(hub);
        for (seq, rec) in records.iter().enumerate() {
            table.set_record_at(seq, LinkRecord::from_physical(rec));
        }
        if !hub {
            table.set_record_at(records.len(), LinkRecord::high_water_mark());
        }
        table.finish_read();
        table
    }

    fn logical(records: Vec<LinkRecord>, hub: bool) -> LinkTable {
        let mut table = LinkTable::new(hub);
        for rec in records {
            table.add_record(rec);
        }
        table
    }

    /// Run the write plan without a device.
    fn write_through(table: &mut LinkTable, phys: &mut LinkTable) -> usize {
        let plan = table.plan_writes(phys);
        let mut writes = 0;
        for action in &plan {
            match action {
                WriteAction::Write { seq, record } => {
                    table.commit_write(phys, *seq, record);
                    writes += 1;
                }
                other => {
                    table.apply_local_action(other);
                }
            }
        }
        table.finish_write();
        writes
    }

    fn contents(table: &LinkTable) -> Vec<[u8; 8]> {
        table.stored_records().iter().map(LinkRecord::to_bytes).collect()
    }

    #[test]
    fn changed_record_is_kept_then_written() {
        let a = LinkRecord::controller(id(1), 1, [3, 0, 1]);
        let b = LinkRecord::controller(id(2), 2, [3, 0, 2]).with_status(SyncStatus::Synced);
        let a_prime = a.with_data([9, 9, 9]);
        let mut table = logical(vec![a.clone(), b.clone()], false);
        let mut phys = physical(&[a_prime, b.clone()], false);

        table.merge_on_read(&phys);
        assert_eq!(table.records()[0].uid(), a.uid());
        assert_eq!(table.records()[0].status(), SyncStatus::Changed);

        assert_eq!(write_through(&mut table, &mut phys), 1);
        assert!(table.stored_records().iter().all(|r| r.status().is_synced()));
        assert_eq!(contents(&table), contents(&phys));
        assert_eq!(table.status(), SyncStatus::Synced);
    }

    #[test]
    fn synced_record_yields_to_device() {
        let a = LinkRecord::controller(id(1), 1, [3, 0, 1]).with_status(SyncStatus::Synced);
        let device_copy = a.with_data([1, 2, 3]);
        let mut table = logical(vec![a], false);
        let phys = physical(&[device_copy.clone()], false);

        let summary = table.merge_on_read(&phys);
        assert_eq!(summary.adopted, 1);
        assert!(table.records()[0].same_content(&device_copy));
        assert!(table.plan_writes(&phys).is_empty());
    }

    #[test]
    fn unknown_matching_record_is_confirmed() {
        let a = LinkRecord::controller(id(1), 1, [3, 0, 1]).with_status(SyncStatus::Unknown);
        let mut table = logical(vec![a.clone()], false);
        let phys = physical(&[a.clone()], false);
        let summary = table.merge_on_read(&phys);
        assert_eq!(summary.confirmed, 1);
        assert_eq!(table.records()[0].uid(), a.uid());
        assert_eq!(table.status(), SyncStatus::Synced);
    }

    #[test]
    fn pending_delete_survives_read_and_clears_device() {
        let a = LinkRecord::controller(id(1), 1, [3, 0, 1]);
        let mut table = logical(vec![a.clone()], false);
        let mut phys = physical(&[a.clone()], false);
        table.merge_on_read(&phys);
        write_through(&mut table, &mut phys);
        let current = table.records()[0].clone();
        table.remove_record(&current);

        table.merge_on_read(&phys);
        assert!(!table.records()[0].is_in_use());
        assert_eq!(table.records()[0].status(), SyncStatus::Changed);

        write_through(&mut table, &mut phys);
        assert!(!phys.records()[0].is_in_use());
        assert_eq!(table.records()[0].status(), SyncStatus::Synced);
    }

    #[test]
    fn tails_are_resolved_by_status() {
        let kept = LinkRecord::controller(id(1), 1, [3, 0, 1]);
        let stale = LinkRecord::controller(id(2), 1, [3, 0, 1]).with_status(SyncStatus::Synced);
        let mut table = logical(vec![kept.clone(), stale], false);
        let phys = physical(&[], false);

        table.merge_on_read(&phys);
        assert_eq!(table.stored_len(), 1);
        assert_eq!(table.records()[0].uid(), kept.uid());
        assert!(table.records().last().unwrap().is_high_water_mark());

        let extra = LinkRecord::responder(id(3), 4, [0xFF, 0x1C, 1]);
        let mut fresh = LinkTable::new(false);
        fresh.merge_on_read(&physical(&[extra.clone()], false));
        assert_eq!(fresh.stored_len(), 1);
        assert!(fresh.records()[0].same_content(&extra));
        assert_eq!(fresh.records()[0].status(), SyncStatus::Synced);
        assert!(fresh.records()[1].is_high_water_mark());
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let mut table = logical(
            vec![
                LinkRecord::controller(id(1), 1, [3, 0, 1]),
                LinkRecord::responder(id(2), 1, [0xFF, 0x1C, 1]),
            ],
            false,
        );
        let mut phys = physical(&[LinkRecord::controller(id(9), 9, [0; 3])], false);
        table.merge_on_read(&phys);
        write_through(&mut table, &mut phys);

        let revision = table.revision();
        let summary = table.merge_on_read(&phys);
        assert_eq!(summary, MergeSummary::default());
        assert!(table.plan_writes(&phys).is_empty());
        assert_eq!(table.revision(), revision);
    }

    #[test]
    fn hub_matches_by_key_not_position() {
        let a = LinkRecord::controller(id(1), 0, [0; 3]).with_status(SyncStatus::Synced);
        let b = LinkRecord::controller(id(2), 0, [0; 3]).with_status(SyncStatus::Synced);
        let mut table = logical(vec![a.clone(), b.clone()], true);
        let phys = physical(&[b.clone(), a.clone()], true);

        let summary = table.merge_on_read(&phys);
        assert_eq!(summary, MergeSummary::default());
        assert_eq!(table.records()[0].uid(), a.uid());
    }

    #[test]
    fn hub_appends_new_entries_and_writes_pending() {
        let pending = LinkRecord::controller(id(1), 0, [0; 3]);
        let mut table = logical(vec![pending.clone()], true);
        let on_hub = LinkRecord::responder(id(5), 1, [0; 3]);
        let mut phys = physical(&[on_hub.clone()], true);

        let summary = table.merge_on_read(&phys);
        assert_eq!(summary.appended, 1);
        assert_eq!(table.len(), 2);

        let writes = write_through(&mut table, &mut phys);
        assert_eq!(writes, 1);
        assert_eq!(phys.active_records().count(), 2);
        assert_eq!(table.status(), SyncStatus::Synced);
    }

    #[test]
    fn hub_pending_delete_without_match_stays_changed_on_read() {
        let ghost = LinkRecord::controller(id(1), 0, [0; 3]);
        let mut table = logical(vec![ghost.clone()], true);
        table.remove_record(&ghost);
        let mut phys = physical(&[], true);

        table.merge_on_read(&phys);
        assert_eq!(table.records()[0].status(), SyncStatus::Changed);

        assert_eq!(write_through(&mut table, &mut phys), 0);
        assert!(table.is_empty());
        assert_eq!(table.status(), SyncStatus::Synced);
    }

    #[test]
    fn hub_second_pass_after_delete_is_a_no_op() {
        let a = LinkRecord::controller(id(1), 0, [0; 3]).with_status(SyncStatus::Synced);
        let mut table = logical(vec![a.clone()], true);
        let mut phys = physical(&[a.clone()], true);
        table.remove_record(&a);

        table.merge_on_read(&phys);
        assert_eq!(write_through(&mut table, &mut phys), 1);
        assert_eq!(phys.active_records().count(), 0);
        assert!(table.is_empty());
        assert_eq!(table.status(), SyncStatus::Synced);

        let revision = table.revision();
        let summary = table.merge_on_read(&phys);
        assert_eq!(summary, MergeSummary::default());
        assert!(table.plan_writes(&phys).is_empty());
        table.finish_write();
        assert_eq!(table.revision(), revision);
    }

    #[test]
    fn hub_synced_entry_missing_on_device_is_dropped() {
        let gone = LinkRecord::controller(id(1), 0, [0; 3]).with_status(SyncStatus::Synced);
        let mut table = logical(vec![gone], true);
        table.merge_on_read(&physical(&[], true));
        assert!(table.is_empty());
    }
}

// ── Scene expansion ──
//
// Derives the link records (and same-device follow-mask bits) a scene
// implies and brings the device tables in line with them. Every membership
// edit re-runs the same diff, so the set of record changes is always the
// minimal one between the old and the new desired state.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, trace};

use crate::error::CoreError;
use crate::model::{
    Device, DeviceId, FollowLink, LinkRecord, LinkRole, LinkTable, SceneId, SceneMember,
};
use crate::network::Network;

/// Identity of a derived record within one device table.
type RecordKey = (DeviceId, u8, LinkRole, u8);

fn record_key(record: &LinkRecord) -> RecordKey {
    // Responders can hold one record per local button for the same
    // controller group; data byte 3 names the button.
    let button = if record.is_responder() {
        record.data()[2]
    } else {
        0
    };
    (record.dest(), record.group(), record.role(), button)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    /// Also delete unowned duplicates of derived records.
    Dedupe,
    /// Desired state is empty: remove everything the scene owns.
    Retract,
}

/// What one expansion changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpandSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub follows_set: usize,
    pub follows_cleared: usize,
}

impl ExpandSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Default)]
struct Desired {
    records: Vec<(DeviceId, LinkRecord)>,
    follows: BTreeSet<FollowLink>,
}

impl Network {
    /// Make the device tables reflect the scene's membership.
    pub fn expand_scene(&mut self, scene: SceneId) -> Result<ExpandSummary, CoreError> {
        self.reconcile_scene(scene, Mode::Normal)
    }

    pub fn add_scene_member(&mut self, scene: SceneId, member: SceneMember) -> Result<ExpandSummary, CoreError> {
        if !member.controller && !member.responder {
            return Err(CoreError::ValidationFailed {
                message: format!("member {} g{} has no role", member.device, member.group),
            });
        }
        self.require_device(member.device)?;
        self.scene_mut(scene)
            .ok_or(CoreError::SceneNotFound { id: scene })?
            .push_member(member);
        self.reconcile_scene(scene, Mode::Normal)
    }

    pub fn remove_scene_member(&mut self, scene: SceneId, member: &SceneMember) -> Result<ExpandSummary, CoreError> {
        let target = self.scene_mut(scene).ok_or(CoreError::SceneNotFound { id: scene })?;
        let index = target
            .position_of(member)
            .ok_or(CoreError::MemberNotFound { scene })?;
        target.remove_member_at(index);
        self.reconcile_scene(scene, Mode::Normal)
    }

    pub fn replace_scene_member(
        &mut self,
        scene: SceneId,
        old: &SceneMember,
        new: SceneMember,
    ) -> Result<ExpandSummary, CoreError> {
        self.require_device(new.device)?;
        let target = self.scene_mut(scene).ok_or(CoreError::SceneNotFound { id: scene })?;
        let index = target
            .position_of(old)
            .ok_or(CoreError::MemberNotFound { scene })?;
        target.replace_member_at(index, new);
        self.reconcile_scene(scene, Mode::Normal)
    }

    /// Drop members occupying the same slot as an earlier one, then keep
    /// exactly one record per derived link, owned by this scene.
    pub fn remove_duplicate_members(&mut self, scene: SceneId) -> Result<ExpandSummary, CoreError> {
        let target = self.scene_mut(scene).ok_or(CoreError::SceneNotFound { id: scene })?;
        let members = target.members().to_vec();
        let duplicates: Vec<usize> = members
            .iter()
            .enumerate()
            .filter(|(i, m)| members[..*i].iter().any(|earlier| earlier.same_slot(m)))
            .map(|(i, _)| i)
            .collect();
        for index in duplicates.into_iter().rev() {
            target.remove_member_at(index);
        }
        self.reconcile_scene(scene, Mode::Dedupe)
    }

    pub(crate) fn remove_device_members(&mut self, scene: SceneId, device: DeviceId) -> Result<ExpandSummary, CoreError> {
        let target = self.scene_mut(scene).ok_or(CoreError::SceneNotFound { id: scene })?;
        let indices: Vec<usize> = target
            .members()
            .iter()
            .enumerate()
            .filter(|(_, m)| m.device == device)
            .map(|(i, _)| i)
            .collect();
        for index in indices.into_iter().rev() {
            target.remove_member_at(index);
        }
        self.reconcile_scene(scene, Mode::Normal)
    }

    pub(crate) fn retract_scene(&mut self, scene: SceneId) -> Result<ExpandSummary, CoreError> {
        self.reconcile_scene(scene, Mode::Retract)
    }

    // ── Diff engine ──────────────────────────────────────────────────

    fn desired_links(&self, scene: SceneId, members: &[SceneMember]) -> Desired {
        let mut desired = Desired::default();
        let mut seen: HashSet<(DeviceId, RecordKey)> = HashSet::new();

        let controllers = members.iter().filter(|m| m.controller);
        for c in controllers {
            for r in members.iter().filter(|m| m.responder) {
                if c.device == r.device {
                    let multi = self.device(c.device).is_some_and(Device::is_multi_channel);
                    if multi && c.group != r.group {
                        desired.follows.insert(FollowLink {
                            device: c.device,
                            controller_group: c.group,
                            responder_group: r.group,
                            off: r.data[0] == 0,
                        });
                    }
                    continue;
                }
                if self.device(c.device).is_none() || self.device(r.device).is_none() {
                    continue;
                }

                let controller_side =
                    LinkRecord::controller(r.device, c.group, c.data).with_scene(Some(scene));
                let responder_side =
                    LinkRecord::responder(c.device, c.group, r.data).with_scene(Some(scene));
                for (host, record) in [(c.device, controller_side), (r.device, responder_side)] {
                    if seen.insert((host, record_key(&record))) {
                        desired.records.push((host, record));
                    }
                }
            }
        }
        desired
    }

    fn reconcile_scene(&mut self, scene: SceneId, mode: Mode) -> Result<ExpandSummary, CoreError> {
        let target = self.require_scene(scene)?;
        let applied = target.applied_follows().clone();
        let desired = if mode == Mode::Retract {
            Desired::default()
        } else {
            self.desired_links(scene, target.members())
        };

        let mut summary = ExpandSummary::default();
        let mut wanted: HashMap<DeviceId, HashSet<RecordKey>> = HashMap::new();

        for (host, template) in &desired.records {
            wanted.entry(*host).or_default().insert(record_key(template));
            let Some(device) = self.device_mut(*host) else {
                continue;
            };
            device.with_links(|table| {
                ensure_record(table, scene, template, mode == Mode::Dedupe, &mut summary);
            });
        }

        for device in self.devices_mut().iter_mut() {
            let keep = wanted.get(&device.id());
            let stale: Vec<LinkRecord> = device
                .links()
                .active_records()
                .filter(|r| r.scene() == Some(scene))
                .filter(|r| !keep.is_some_and(|k| k.contains(&record_key(r))))
                .cloned()
                .collect();
            if stale.is_empty() {
                continue;
            }
            device.with_links(|table| {
                for record in &stale {
                    trace!(%scene, record = %record, "deleting stale scene record");
                    if table.remove_record(record) {
                        summary.deleted += 1;
                    }
                }
            });
        }

        self.apply_follows(scene, &applied, &desired.follows, &mut summary);
        if let Some(target) = self.scene_mut(scene) {
            target.set_applied_follows(desired.follows);
        }

        debug!(
            %scene,
            added = summary.added,
            updated = summary.updated,
            deleted = summary.deleted,
            follows_set = summary.follows_set,
            follows_cleared = summary.follows_cleared,
            "scene expanded"
        );
        Ok(summary)
    }

    fn apply_follows(
        &mut self,
        scene: SceneId,
        applied: &BTreeSet<FollowLink>,
        desired: &BTreeSet<FollowLink>,
        summary: &mut ExpandSummary,
    ) {
        let held_elsewhere: HashSet<(DeviceId, u8, u8)> = self
            .scenes()
            .iter()
            .filter(|s| s.id() != scene)
            .flat_map(|s| s.applied_follows().iter())
            .map(|f| (f.device, f.controller_group, f.responder_group))
            .collect();

        for link in applied.difference(desired) {
            if held_elsewhere.contains(&(link.device, link.controller_group, link.responder_group)) {
                continue;
            }
            let cleared = self
                .device_mut(link.device)
                .and_then(|d| {
                    d.with_channel(link.controller_group, |c| {
                        c.set_follow(link.responder_group, false, false)
                    })
                })
                .unwrap_or(false);
            if cleared {
                summary.follows_cleared += 1;
            }
        }

        for link in desired.difference(applied) {
            let set = self
                .device_mut(link.device)
                .and_then(|d| {
                    d.with_channel(link.controller_group, |c| {
                        c.set_follow(link.responder_group, true, link.off)
                    })
                })
                .unwrap_or(false);
            if set {
                summary.follows_set += 1;
            }
        }
    }
}

/// Make `table` hold exactly one in-use record for `template`'s key that
/// this scene owns. Records of other scenes are left alone.
fn ensure_record(
    table: &mut LinkTable,
    scene: SceneId,
    template: &LinkRecord,
    dedupe: bool,
    summary: &mut ExpandSummary,
) {
    let key = record_key(template);
    let candidates: Vec<LinkRecord> = table
        .active_records()
        .filter(|r| record_key(r) == key)
        .filter(|r| r.scene().is_none() || r.scene() == Some(scene))
        .cloned()
        .collect();

    let keep = candidates
        .iter()
        .position(|r| r.scene() == Some(scene))
        .unwrap_or(0);
    let Some(existing) = candidates.get(keep) else {
        trace!(%scene, record = %template, "adding scene record");
        table.add_record(template.clone());
        summary.added += 1;
        return;
    };

    if !existing.same_content(template) {
        trace!(%scene, old = %existing, new = %template, "updating scene record");
        table.replace_record(existing, template.clone());
        summary.updated += 1;
    } else if existing.scene() != Some(scene) {
        // Same bytes on the device; only ownership changes.
        table.replace_record(existing, existing.with_scene(Some(scene)));
        summary.updated += 1;
    }

    for (i, extra) in candidates.iter().enumerate() {
        if i != keep && (dedupe || extra.scene() == Some(scene)) && table.remove_record(extra) {
            summary.deleted += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DeviceKind, SyncStatus};

    fn id(n: u8) -> DeviceId {
        DeviceId::new([0x30, 0x00, n])
    }

    fn setup() -> (Network, SceneId) {
        let mut net = Network::new(id(0));
        net.add_device(id(1), DeviceKind::Keypad).unwrap();
        net.add_device(id(2), DeviceKind::Dimmer).unwrap();
        net.add_device(id(3), DeviceKind::Relay).unwrap();
        let scene = net.add_scene("Evening");
        (net, scene)
    }

    fn active(net: &Network, device: u8) -> Vec<LinkRecord> {
        net.device(id(device))
            .unwrap()
            .links()
            .active_records()
            .cloned()
            .collect()
    }

    #[test]
    fn controller_and_responder_records_are_created() {
        let (mut net, scene) = setup();
        net.add_scene_member(scene, SceneMember::controller(id(1), 1)).unwrap();
        let summary = net
            .add_scene_member(scene, SceneMember::responder(id(2), 1, 0xFF, 0x1C))
            .unwrap();
        assert_eq!(summary.added, 2);

        let keypad = active(&net, 1);
        assert_eq!(keypad.len(), 1);
        assert!(keypad[0].is_controller());
        assert_eq!(keypad[0].dest(), id(2));
        assert_eq!(keypad[0].scene(), Some(scene));

        let dimmer = active(&net, 2);
        assert!(dimmer[0].is_responder());
        assert_eq!(dimmer[0].dest(), id(1));
        assert_eq!(dimmer[0].data(), [0xFF, 0x1C, 1]);
    }

    #[test]
    fn expansion_is_idempotent() {
        let (mut net, scene) = setup();
        net.add_scene_member(scene, SceneMember::controller(id(1), 1)).unwrap();
        net.add_scene_member(scene, SceneMember::responder(id(2), 1, 0xFF, 0)).unwrap();
        let before: Vec<_> = active(&net, 1).iter().map(LinkRecord::uid).collect();

        assert!(net.expand_scene(scene).unwrap().is_empty());
        let after: Vec<_> = active(&net, 1).iter().map(LinkRecord::uid).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn same_device_pairs_use_follow_masks() {
        let (mut net, scene) = setup();
        net.add_scene_member(scene, SceneMember::controller(id(1), 1)).unwrap();
        let summary = net
            .add_scene_member(scene, SceneMember::responder(id(1), 3, 0, 0))
            .unwrap();
        assert_eq!(summary.follows_set, 1);
        assert_eq!(summary.added, 0);

        let channel = net.device(id(1)).unwrap().channel(1).unwrap();
        assert_eq!(channel.follow_mask(), 0b100);
        assert_eq!(channel.follow_off_mask(), 0b100);

        let member = SceneMember::responder(id(1), 3, 0, 0);
        let summary = net.remove_scene_member(scene, &member).unwrap();
        assert_eq!(summary.follows_cleared, 1);
        assert_eq!(net.device(id(1)).unwrap().channel(1).unwrap().follow_mask(), 0);
    }

    #[test]
    fn removing_one_responder_keeps_shared_controller_record() {
        let (mut net, scene) = setup();
        net.add_scene_member(scene, SceneMember::controller(id(2), 1)).unwrap();
        net.add_scene_member(scene, SceneMember::responder(id(1), 3, 0xFF, 0)).unwrap();
        net.add_scene_member(scene, SceneMember::responder(id(1), 4, 0xFF, 0)).unwrap();
        assert_eq!(active(&net, 2).len(), 1);
        assert_eq!(active(&net, 1).len(), 2);

        let member = SceneMember::responder(id(1), 4, 0xFF, 0);
        let summary = net.remove_scene_member(scene, &member).unwrap();
        assert_eq!(summary.deleted, 1);
        assert_eq!(active(&net, 2).len(), 1);
        assert_eq!(active(&net, 1).len(), 1);
    }

    #[test]
    fn remove_then_re_add_restores_without_duplicates() {
        let (mut net, scene) = setup();
        let responder = SceneMember::responder(id(3), 1, 0xFF, 0);
        net.add_scene_member(scene, SceneMember::controller(id(1), 1)).unwrap();
        net.add_scene_member(scene, responder).unwrap();
        let len_before = net.device(id(3)).unwrap().links().len();

        net.remove_scene_member(scene, &responder).unwrap();
        assert!(active(&net, 3).is_empty());
        net.add_scene_member(scene, responder).unwrap();

        assert_eq!(active(&net, 3).len(), 1);
        assert_eq!(active(&net, 1).len(), 1);
        assert_eq!(net.device(id(3)).unwrap().links().len(), len_before);
    }

    #[test]
    fn unowned_record_is_adopted_not_duplicated() {
        let (mut net, scene) = setup();
        let manual = LinkRecord::responder(id(1), 1, [0xFF, 0x1C, 1]).with_status(SyncStatus::Synced);
        net.device_mut(id(2))
            .unwrap()
            .with_links(|t| t.add_record(manual.clone()));

        net.add_scene_member(scene, SceneMember::controller(id(1), 1)).unwrap();
        net.add_scene_member(scene, SceneMember::responder(id(2), 1, 0xFF, 0x1C)).unwrap();

        let dimmer = active(&net, 2);
        assert_eq!(dimmer.len(), 1);
        assert_eq!(dimmer[0].scene(), Some(scene));
        assert_eq!(dimmer[0].status(), SyncStatus::Synced);
    }

    #[test]
    fn records_of_other_scenes_are_not_touched() {
        let (mut net, first) = setup();
        let second = net.add_scene("Night");
        for scene in [first, second] {
            net.add_scene_member(scene, SceneMember::controller(id(1), 1)).unwrap();
            net.add_scene_member(scene, SceneMember::responder(id(2), 1, 0xFF, 0)).unwrap();
        }
        assert_eq!(active(&net, 2).len(), 2);

        net.remove_scene(first).unwrap();
        let left = active(&net, 2);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].scene(), Some(second));
    }

    #[test]
    fn duplicate_members_collapse_to_one_owned_record() {
        let (mut net, scene) = setup();
        let stray = LinkRecord::controller(id(2), 1, [0x03, 0x00, 1]);
        net.device_mut(id(1)).unwrap().with_links(|t| {
            t.add_record(stray.clone());
            t.add_record(stray.with_data(stray.data()));
        });

        let controller = SceneMember::controller(id(1), 1);
        net.add_scene_member(scene, controller).unwrap();
        net.add_scene_member(scene, controller).unwrap();
        net.add_scene_member(scene, SceneMember::responder(id(2), 1, 0xFF, 0)).unwrap();
        assert_eq!(active(&net, 1).len(), 2);

        net.remove_duplicate_members(scene).unwrap();
        assert_eq!(net.scene(scene).unwrap().members().len(), 2);
        let keypad = active(&net, 1);
        assert_eq!(keypad.len(), 1);
        assert_eq!(keypad[0].scene(), Some(scene));
    }

    #[test]
    fn member_validation() {
        let (mut net, scene) = setup();
        let mut nobody = SceneMember::controller(id(1), 1);
        nobody.controller = false;
        assert!(matches!(
            net.add_scene_member(scene, nobody),
            Err(CoreError::ValidationFailed { .. })
        ));
        assert!(matches!(
            net.add_scene_member(scene, SceneMember::controller(id(9), 1)),
            Err(CoreError::DeviceNotFound { .. })
        ));
        assert!(matches!(
            net.remove_scene_member(scene, &SceneMember::controller(id(1), 5)),
            Err(CoreError::MemberNotFound { .. })
        ));
    }
}

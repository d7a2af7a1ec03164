// ── Scene domain types ──
//
// A scene is a named set of members. Its link records are derived by
// expansion (see `crate::expand`); the scene itself only stores the
// membership and the follow-mask links it applied to multi-channel devices.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::address::{DeviceId, SceneId};
use crate::changes::ChangeEntry;
use crate::event::{EventBus, Notifier};

/// One device/group taking part in a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SceneMember {
    pub device: DeviceId,
    pub group: u8,
    pub controller: bool,
    pub responder: bool,
    /// Record data bytes: for a responder, on-level, ramp rate and channel.
    pub data: [u8; 3],
}

impl SceneMember {
    pub fn controller(device: DeviceId, group: u8) -> Self {
        Self {
            device,
            group,
            controller: true,
            responder: false,
            data: [0x03, 0x00, group],
        }
    }

    pub fn responder(device: DeviceId, group: u8, on_level: u8, ramp_rate: u8) -> Self {
        Self {
            device,
            group,
            controller: false,
            responder: true,
            data: [on_level, ramp_rate, group],
        }
    }

    /// Same device, group and roles; the data bytes may differ.
    pub fn same_slot(&self, other: &Self) -> bool {
        self.device == other.device
            && self.group == other.group
            && self.controller == other.controller
            && self.responder == other.responder
    }
}

/// A controller channel driving another channel of the same device
/// through its follow masks instead of a link record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FollowLink {
    pub device: DeviceId,
    pub controller_group: u8,
    pub responder_group: u8,
    /// Drive the responder off rather than on.
    pub off: bool,
}

// ── Scene ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    id: SceneId,
    name: String,
    #[serde(default)]
    members: Vec<SceneMember>,
    #[serde(default)]
    applied_follows: BTreeSet<FollowLink>,
    #[serde(skip)]
    notifier: Notifier,
}

impl Scene {
    pub fn new(id: SceneId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            members: Vec::new(),
            applied_follows: BTreeSet::new(),
            notifier: Notifier::default(),
        }
    }

    pub(crate) fn attach(&mut self, bus: &EventBus) {
        self.notifier = Notifier::attached(bus);
    }

    pub fn id(&self) -> SceneId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[SceneMember] {
        &self.members
    }

    pub fn applied_follows(&self) -> &BTreeSet<FollowLink> {
        &self.applied_follows
    }

    pub fn references(&self, device: DeviceId) -> bool {
        self.members.iter().any(|m| m.device == device)
    }

    pub(crate) fn rename(&mut self, name: String) -> bool {
        if self.name == name {
            return false;
        }
        let old = std::mem::replace(&mut self.name, name.clone());
        let scene = self.id;
        self.notifier
            .change(|| ChangeEntry::SceneRenamed { scene, old, new: name });
        true
    }

    pub(crate) fn push_member(&mut self, member: SceneMember) {
        self.members.push(member);
        let scene = self.id;
        self.notifier
            .change(|| ChangeEntry::SceneMemberAdded { scene, member });
    }

    pub(crate) fn remove_member_at(&mut self, index: usize) -> Option<SceneMember> {
        if index >= self.members.len() {
            return None;
        }
        let member = self.members.remove(index);
        let scene = self.id;
        self.notifier
            .change(|| ChangeEntry::SceneMemberRemoved { scene, member });
        Some(member)
    }

    pub(crate) fn replace_member_at(&mut self, index: usize, new: SceneMember) -> Option<SceneMember> {
        let slot = self.members.get_mut(index)?;
        if *slot == new {
            return Some(new);
        }
        let old = std::mem::replace(slot, new);
        let scene = self.id;
        self.notifier
            .change(|| ChangeEntry::SceneMemberReplaced { scene, old, new });
        Some(old)
    }

    pub(crate) fn set_applied_follows(&mut self, follows: BTreeSet<FollowLink>) {
        if self.applied_follows == follows {
            return;
        }
        self.applied_follows = follows.clone();
        let scene = self.id;
        self.notifier
            .change(|| ChangeEntry::SceneFollowsChanged { scene, follows });
    }

    pub(crate) fn position_of(&self, member: &SceneMember) -> Option<usize> {
        self.members.iter().position(|m| m == member)
    }
}

// ── SceneSet ────────────────────────────────────────────────────────

/// Scenes keyed by id; ids are handed out monotonically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneSet {
    #[serde(default)]
    scenes: BTreeMap<SceneId, Scene>,
    #[serde(default)]
    next_id: u32,
}

impl SceneSet {
    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn get(&self, id: SceneId) -> Option<&Scene> {
        self.scenes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SceneId) -> Option<&mut Scene> {
        self.scenes.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scene> {
        self.scenes.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Scene> {
        self.scenes.values_mut()
    }

    pub fn ids(&self) -> Vec<SceneId> {
        self.scenes.keys().copied().collect()
    }

    pub(crate) fn allocate_id(&mut self) -> SceneId {
        self.next_id = self.next_id.max(1);
        let id = SceneId::new(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, scene: Scene) {
        self.next_id = self.next_id.max(scene.id().get().saturating_add(1));
        self.scenes.insert(scene.id(), scene);
    }

    pub(crate) fn remove(&mut self, id: SceneId) -> Option<Scene> {
        self.scenes.remove(&id)
    }

    /// Keep the id counter ahead of every loaded scene.
    pub(crate) fn repair_after_load(&mut self) {
        let past = self
            .scenes
            .keys()
            .last()
            .map_or(1, |id| id.get().saturating_add(1));
        self.next_id = self.next_id.max(past);
    }
}

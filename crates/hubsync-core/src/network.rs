// ── Network (model root) ──
//
// Owns every device and scene plus the event bus they publish on. Device
// and scene lifecycles go through here so removals can cascade to the
// records and memberships that depend on them.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::changes::ChangeEntry;
use crate::error::CoreError;
use crate::event::EventBus;
use crate::model::{
    Device, DeviceId, DeviceKind, LinkRecord, RecordUid, Scene, SceneId, SceneSet, SyncStatus,
    aggregate,
};

// ── DeviceSet ───────────────────────────────────────────────────────

/// Devices in insertion order, keyed by address.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceSet(IndexMap<DeviceId, Device>);

impl DeviceSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.0.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.0.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.0.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.0.values_mut()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.0.keys().copied().collect()
    }

    fn insert(&mut self, device: Device) {
        self.0.insert(device.id(), device);
    }

    fn remove(&mut self, id: DeviceId) -> Option<Device> {
        self.0.shift_remove(&id)
    }
}

// ── Network ─────────────────────────────────────────────────────────

/// The whole logical model of one installation.
#[derive(Debug, Serialize, Deserialize)]
pub struct Network {
    hub: DeviceId,
    devices: DeviceSet,
    #[serde(default)]
    scenes: SceneSet,
    #[serde(skip)]
    bus: EventBus,
}

impl Network {
    /// An empty network holding only its hub.
    pub fn new(hub: DeviceId) -> Self {
        let mut network = Self {
            hub,
            devices: DeviceSet::default(),
            scenes: SceneSet::default(),
            bus: EventBus::new(),
        };
        let mut device = Device::new(hub, DeviceKind::Hub);
        device.attach(&network.bus);
        device.go_live();
        network.devices.insert(device);
        network
    }

    /// Finish a load: wire observers, repair uids, sentinels and channel
    /// sets, then let statuses start tracking. Nothing done here is
    /// recorded as an edit.
    pub fn on_deserialized(&mut self) {
        let max_uid = self
            .devices
            .iter()
            .map(|d| d.links().max_uid())
            .max()
            .unwrap_or(RecordUid::NONE);
        RecordUid::reserve_past(max_uid);

        if !self.devices.contains(self.hub) {
            self.devices.insert(Device::new(self.hub, DeviceKind::Hub));
        }

        let mut seen = HashSet::new();
        for device in self.devices.iter_mut() {
            device.repair_after_load(&mut seen);
        }
        self.scenes.repair_after_load();

        for device in self.devices.iter_mut() {
            device.attach(&self.bus);
        }
        for scene in self.scenes.iter_mut() {
            scene.attach(&self.bus);
        }
        for device in self.devices.iter_mut() {
            device.go_live();
        }
        info!(
            devices = self.devices.len(),
            scenes = self.scenes.len(),
            "network loaded"
        );
    }

    /// Load a network from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let mut network: Self = serde_json::from_str(json)?;
        network.on_deserialized();
        Ok(network)
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn hub_id(&self) -> DeviceId {
        self.hub
    }

    pub fn hub(&self) -> Option<&Device> {
        self.devices.get(self.hub)
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    pub(crate) fn devices_mut(&mut self) -> &mut DeviceSet {
        &mut self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    pub fn require_device(&self, id: DeviceId) -> Result<&Device, CoreError> {
        self.device(id).ok_or(CoreError::DeviceNotFound { id })
    }

    pub fn require_device_mut(&mut self, id: DeviceId) -> Result<&mut Device, CoreError> {
        self.device_mut(id).ok_or(CoreError::DeviceNotFound { id })
    }

    pub fn scenes(&self) -> &SceneSet {
        &self.scenes
    }

    pub fn scene(&self, id: SceneId) -> Option<&Scene> {
        self.scenes.get(id)
    }

    pub(crate) fn scene_mut(&mut self, id: SceneId) -> Option<&mut Scene> {
        self.scenes.get_mut(id)
    }

    pub fn require_scene(&self, id: SceneId) -> Result<&Scene, CoreError> {
        self.scene(id).ok_or(CoreError::SceneNotFound { id })
    }

    /// Aggregate status of every device.
    pub fn status(&self) -> SyncStatus {
        aggregate(self.devices.iter().map(Device::status))
    }

    /// Devices whose status says another physical pass is needed.
    pub fn devices_needing_sync(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|d| d.status().needs_sync())
            .map(Device::id)
            .collect()
    }

    // ── Devices ──────────────────────────────────────────────────────

    pub fn add_device(&mut self, id: DeviceId, kind: DeviceKind) -> Result<&mut Device, CoreError> {
        if self.devices.contains(id) {
            return Err(CoreError::DuplicateDevice { id });
        }
        if kind.is_hub() {
            return Err(CoreError::Rejected {
                message: format!("{id}: a network has exactly one hub ({})", self.hub),
            });
        }

        let mut device = Device::new(id, kind);
        device.attach(&self.bus);
        device.go_live();
        let snapshot = device.clone();
        self.devices.insert(device);
        self.publish(ChangeEntry::DeviceAdded {
            device: Box::new(snapshot),
        });
        debug!(device = %id, %kind, "device added");
        self.require_device_mut(id)
    }

    /// Remove a device and everything that depends on it: scene members
    /// referencing it (scenes are re-expanded) and records on other
    /// devices pointing at it (logically deleted).
    pub fn remove_device(&mut self, id: DeviceId) -> Result<Device, CoreError> {
        if id == self.hub {
            return Err(CoreError::Rejected {
                message: format!("{id}: the hub cannot be removed"),
            });
        }
        if !self.devices.contains(id) {
            return Err(CoreError::DeviceNotFound { id });
        }

        let scenes: Vec<SceneId> = self
            .scenes
            .iter()
            .filter(|s| s.references(id))
            .map(Scene::id)
            .collect();
        for scene in scenes {
            self.remove_device_members(scene, id)?;
        }

        for other in self.devices.iter_mut().filter(|d| d.id() != id) {
            let dangling: Vec<LinkRecord> = other.links().records_for(id).cloned().collect();
            if dangling.is_empty() {
                continue;
            }
            other.with_links(|table| {
                for record in &dangling {
                    table.remove_record(record);
                }
            });
        }

        let removed = self
            .devices
            .remove(id)
            .ok_or(CoreError::DeviceNotFound { id })?;
        self.publish(ChangeEntry::DeviceRemoved { device: id });
        debug!(device = %id, "device removed");
        Ok(removed)
    }

    /// Insert a device captured elsewhere. No-op if the id is taken.
    pub(crate) fn restore_device(&mut self, mut device: Device) -> bool {
        let id = device.id();
        if self.devices.contains(id) {
            return false;
        }
        RecordUid::reserve_past(device.links().max_uid());
        device.clear_physical_links();
        device.attach(&self.bus);
        device.go_live();
        let snapshot = device.clone();
        self.devices.insert(device);
        self.publish(ChangeEntry::DeviceAdded {
            device: Box::new(snapshot),
        });
        true
    }

    /// Remove a device without cascading.
    pub(crate) fn forget_device(&mut self, id: DeviceId) -> bool {
        if id == self.hub || self.devices.remove(id).is_none() {
            return false;
        }
        self.publish(ChangeEntry::DeviceRemoved { device: id });
        true
    }

    // ── Scenes ───────────────────────────────────────────────────────

    pub fn add_scene(&mut self, name: impl Into<String>) -> SceneId {
        let id = self.scenes.allocate_id();
        let mut scene = Scene::new(id, name);
        scene.attach(&self.bus);
        let snapshot = scene.clone();
        self.scenes.insert(scene);
        self.publish(ChangeEntry::SceneAdded {
            scene: Box::new(snapshot),
        });
        id
    }

    pub fn rename_scene(&mut self, id: SceneId, name: impl Into<String>) -> Result<bool, CoreError> {
        let scene = self
            .scene_mut(id)
            .ok_or(CoreError::SceneNotFound { id })?;
        Ok(scene.rename(name.into()))
    }

    /// Remove a scene together with every record and follow bit it owns.
    pub fn remove_scene(&mut self, id: SceneId) -> Result<Scene, CoreError> {
        self.require_scene(id)?;
        self.retract_scene(id)?;
        let scene = self
            .scenes
            .remove(id)
            .ok_or(CoreError::SceneNotFound { id })?;
        self.publish(ChangeEntry::SceneRemoved { scene: id });
        Ok(scene)
    }

    pub(crate) fn restore_scene(&mut self, mut scene: Scene) -> bool {
        if self.scenes.get(scene.id()).is_some() {
            return false;
        }
        scene.attach(&self.bus);
        let snapshot = scene.clone();
        self.scenes.insert(scene);
        self.publish(ChangeEntry::SceneAdded {
            scene: Box::new(snapshot),
        });
        true
    }

    pub(crate) fn forget_scene(&mut self, id: SceneId) -> bool {
        if self.scenes.remove(id).is_none() {
            return false;
        }
        self.publish(ChangeEntry::SceneRemoved { scene: id });
        true
    }

    fn publish(&self, entry: ChangeEntry) {
        self.bus.publish(crate::event::ModelEvent::Change(entry));
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{
    Channel, ChannelChange, Device, DeviceChange, DeviceId, FollowLink, LinkRecord, LinkTable,
    RecordUid, Scene, SceneId, SceneMember,
};
use crate::network::Network;

/// One observed mutation, carrying everything needed to apply it to
/// another copy of the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEntry {
    // ── Devices ──
    DeviceAdded {
        device: Box<Device>,
    },
    DeviceRemoved {
        device: DeviceId,
    },
    DeviceChanged {
        device: DeviceId,
        change: DeviceChange,
    },

    // ── Channels ──
    ChannelAdded {
        device: DeviceId,
        channel: Box<Channel>,
    },
    ChannelRemoved {
        device: DeviceId,
        number: u8,
    },
    ChannelChanged {
        device: DeviceId,
        channel: u8,
        change: ChannelChange,
    },

    // ── Link tables ──
    RecordAdded {
        device: DeviceId,
        seq: usize,
        record: LinkRecord,
    },
    RecordReplaced {
        device: DeviceId,
        seq: usize,
        old: LinkRecord,
        record: LinkRecord,
    },
    RecordDropped {
        device: DeviceId,
        seq: usize,
        uid: RecordUid,
    },
    TableCleared {
        device: DeviceId,
    },

    // ── Scenes ──
    SceneAdded {
        scene: Box<Scene>,
    },
    SceneRemoved {
        scene: SceneId,
    },
    SceneRenamed {
        scene: SceneId,
        old: String,
        new: String,
    },
    SceneMemberAdded {
        scene: SceneId,
        member: SceneMember,
    },
    SceneMemberRemoved {
        scene: SceneId,
        member: SceneMember,
    },
    SceneMemberReplaced {
        scene: SceneId,
        old: SceneMember,
        new: SceneMember,
    },
    SceneFollowsChanged {
        scene: SceneId,
        follows: BTreeSet<FollowLink>,
    },
}

impl ChangeEntry {
    /// Device the entry targets, if any.
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Self::DeviceAdded { device } => Some(device.id()),
            Self::DeviceRemoved { device }
            | Self::DeviceChanged { device, .. }
            | Self::ChannelAdded { device, .. }
            | Self::ChannelRemoved { device, .. }
            | Self::ChannelChanged { device, .. }
            | Self::RecordAdded { device, .. }
            | Self::RecordReplaced { device, .. }
            | Self::RecordDropped { device, .. }
            | Self::TableCleared { device } => Some(*device),
            _ => None,
        }
    }

    /// Scene the entry targets, if any.
    pub fn scene(&self) -> Option<SceneId> {
        match self {
            Self::SceneAdded { scene } => Some(scene.id()),
            Self::SceneRemoved { scene }
            | Self::SceneRenamed { scene, .. }
            | Self::SceneMemberAdded { scene, .. }
            | Self::SceneMemberRemoved { scene, .. }
            | Self::SceneMemberReplaced { scene, .. }
            | Self::SceneFollowsChanged { scene, .. } => Some(*scene),
            _ => None,
        }
    }

    /// Apply to `network`. Returns `false` when the target no longer exists
    /// or the entry had nothing left to change. Removals do not cascade:
    /// the cascade was recorded as entries of its own.
    pub fn apply(&self, network: &mut Network) -> bool {
        match self {
            Self::DeviceAdded { device } => network.restore_device((**device).clone()),
            Self::DeviceRemoved { device } => network.forget_device(*device),
            Self::DeviceChanged { device, change } => network
                .device_mut(*device)
                .is_some_and(|d| d.apply_change(change)),

            Self::ChannelAdded { device, channel } => network
                .device_mut(*device)
                .is_some_and(|d| d.restore_channel((**channel).clone())),
            Self::ChannelRemoved { device, number } => network
                .device_mut(*device)
                .is_some_and(|d| d.drop_channel(*number)),
            Self::ChannelChanged {
                device,
                channel,
                change,
            } => network
                .device_mut(*device)
                .and_then(|d| d.with_channel(*channel, |c| c.apply_change(change)))
                .unwrap_or(false),

            Self::RecordAdded {
                device,
                seq,
                record,
            } => network
                .device_mut(*device)
                .is_some_and(|d| d.with_links(|t| t.restore_added(*seq, record))),
            Self::RecordReplaced {
                device,
                old,
                record,
                ..
            } => network
                .device_mut(*device)
                .is_some_and(|d| d.with_links(|t| t.replace_record(old, record.clone()))),
            Self::RecordDropped { device, uid, .. } => network
                .device_mut(*device)
                .is_some_and(|d| d.with_links(|t| t.drop_uid(*uid))),
            Self::TableCleared { device } => network.device_mut(*device).is_some_and(|d| {
                d.with_links(LinkTable::clear);
                true
            }),

            Self::SceneAdded { scene } => network.restore_scene((**scene).clone()),
            Self::SceneRemoved { scene } => network.forget_scene(*scene),
            Self::SceneRenamed { scene, new, .. } => network
                .scene_mut(*scene)
                .is_some_and(|s| s.rename(new.clone())),
            Self::SceneMemberAdded { scene, member } => {
                network.scene_mut(*scene).is_some_and(|s| {
                    s.push_member(*member);
                    true
                })
            }
            Self::SceneMemberRemoved { scene, member } => {
                network.scene_mut(*scene).is_some_and(|s| {
                    s.position_of(member)
                        .and_then(|i| s.remove_member_at(i))
                        .is_some()
                })
            }
            Self::SceneMemberReplaced { scene, old, new } => {
                network.scene_mut(*scene).is_some_and(|s| {
                    s.position_of(old)
                        .and_then(|i| s.replace_member_at(i, *new))
                        .is_some()
                })
            }
            Self::SceneFollowsChanged { scene, follows } => {
                network.scene_mut(*scene).is_some_and(|s| {
                    let changed = s.applied_follows() != follows;
                    s.set_applied_follows(follows.clone());
                    changed
                })
            }
        }
    }
}

// ── ChangeLog ───────────────────────────────────────────────────────

/// Ordered, serializable sequence of change entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeLog {
    entries: Vec<ChangeEntry>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ChangeEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn extend(&mut self, other: ChangeLog) {
        self.entries.extend(other.entries);
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl IntoIterator for ChangeLog {
    type Item = ChangeEntry;
    type IntoIter = std::vec::IntoIter<ChangeEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

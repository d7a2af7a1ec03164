// ── Channel domain types ──
//
// A channel is one button or load of a multi-channel device. Its tracked
// properties carry their own logical/physical pair; the channel rolls them
// up into one aggregate status that feeds the owning device.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use super::address::DeviceId;
use super::sync_status::{StatusCell, SyncStatus, Tracked, ValueSide, aggregate};
use super::LoadControl;
use crate::changes::ChangeEntry;
use crate::event::{Notifier, StatusTarget};

/// Tracked per-channel property.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ChannelProperty {
    FollowMask,
    FollowOffMask,
    OnLevel,
    RampRate,
    ToggleMode,
}

/// Button behaviour, stored on the device as one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum ToggleMode {
    Toggle,
    NonToggleOn,
    NonToggleOff,
}

impl ToggleMode {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Toggle => 0,
            Self::NonToggleOn => 1,
            Self::NonToggleOff => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Toggle),
            1 => Some(Self::NonToggleOn),
            2 => Some(Self::NonToggleOff),
            _ => None,
        }
    }
}

/// One recordable edit of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum ChannelChange {
    Name {
        old: Option<String>,
        new: Option<String>,
    },
    Property {
        property: ChannelProperty,
        side: ValueSide,
        old: Option<u8>,
        new: Option<u8>,
    },
}

// ── Channel ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    number: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    follow_mask: Tracked<u8>,
    #[serde(default)]
    follow_off_mask: Tracked<u8>,
    #[serde(default)]
    on_level: Tracked<u8>,
    #[serde(default)]
    ramp_rate: Tracked<u8>,
    #[serde(default)]
    toggle_mode: Tracked<u8>,
    #[serde(default)]
    status: StatusCell,
    #[serde(skip)]
    owner: Option<DeviceId>,
    #[serde(skip)]
    notifier: Notifier,
}

impl Channel {
    /// Channels are numbered from 1, matching the device's button groups.
    pub fn new(number: u8) -> Self {
        Self {
            number,
            name: None,
            follow_mask: Tracked::default(),
            follow_off_mask: Tracked::default(),
            on_level: Tracked::default(),
            ramp_rate: Tracked::default(),
            toggle_mode: Tracked::default(),
            status: StatusCell::default(),
            owner: None,
            notifier: Notifier::default(),
        }
    }

    pub(crate) fn attach(&mut self, owner: DeviceId, notifier: Notifier) {
        self.owner = Some(owner);
        self.notifier = notifier;
    }

    pub(crate) fn go_live(&mut self) {
        self.status.go_live();
        self.recompute_status();
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.get()
    }

    pub fn property(&self, property: ChannelProperty) -> &Tracked<u8> {
        match property {
            ChannelProperty::FollowMask => &self.follow_mask,
            ChannelProperty::FollowOffMask => &self.follow_off_mask,
            ChannelProperty::OnLevel => &self.on_level,
            ChannelProperty::RampRate => &self.ramp_rate,
            ChannelProperty::ToggleMode => &self.toggle_mode,
        }
    }

    fn property_mut(&mut self, property: ChannelProperty) -> &mut Tracked<u8> {
        match property {
            ChannelProperty::FollowMask => &mut self.follow_mask,
            ChannelProperty::FollowOffMask => &mut self.follow_off_mask,
            ChannelProperty::OnLevel => &mut self.on_level,
            ChannelProperty::RampRate => &mut self.ramp_rate,
            ChannelProperty::ToggleMode => &mut self.toggle_mode,
        }
    }

    /// Effective value: the logical intent, else the last value read.
    pub fn value(&self, property: ChannelProperty) -> Option<u8> {
        self.property(property).effective()
    }

    pub fn follow_mask(&self) -> u8 {
        self.value(ChannelProperty::FollowMask).unwrap_or(0)
    }

    pub fn follow_off_mask(&self) -> u8 {
        self.value(ChannelProperty::FollowOffMask).unwrap_or(0)
    }

    pub fn toggle_mode(&self) -> Option<ToggleMode> {
        self.value(ChannelProperty::ToggleMode)
            .and_then(ToggleMode::from_byte)
    }

    pub fn set_toggle_mode(&mut self, mode: ToggleMode) {
        self.set_property(ChannelProperty::ToggleMode, ValueSide::Logical, Some(mode.to_byte()));
    }

    pub fn set_name(&mut self, name: Option<String>) {
        if self.name == name {
            return;
        }
        let old = std::mem::replace(&mut self.name, name.clone());
        self.publish(ChannelChange::Name { old, new: name });
    }

    /// Set one side of a tracked property. Returns `false` when nothing
    /// changed.
    pub fn set_property(&mut self, property: ChannelProperty, side: ValueSide, value: Option<u8>) -> bool {
        let Some(old) = self.property_mut(property).set(side, value) else {
            return false;
        };
        self.publish(ChannelChange::Property {
            property,
            side,
            old,
            new: value,
        });
        self.recompute_status();
        true
    }

    /// Fold a value read from the device.
    pub fn absorb_read(&mut self, property: ChannelProperty, value: u8) {
        let tracked = self.property_mut(property);
        let old_physical = tracked.physical();
        let adopted = tracked.absorb_read(value);
        if old_physical != Some(value) {
            self.publish(ChannelChange::Property {
                property,
                side: ValueSide::Physical,
                old: old_physical,
                new: Some(value),
            });
        }
        if let Some(old) = adopted {
            self.publish(ChannelChange::Property {
                property,
                side: ValueSide::Logical,
                old,
                new: Some(value),
            });
        }
        self.recompute_status();
    }

    /// A read of `property` failed.
    pub fn mark_unknown(&mut self, property: ChannelProperty) {
        self.set_property(property, ValueSide::Physical, None);
    }

    /// Drive (or stop driving) channel `target` whenever this one turns on.
    /// `off` additionally turns `target` off instead of on.
    pub fn set_follow(&mut self, target: u8, follow: bool, off: bool) -> bool {
        let Some(bit) = target.checked_sub(1).filter(|b| *b < 8).map(|b| 1u8 << b) else {
            return false;
        };
        let mask = if follow {
            self.follow_mask() | bit
        } else {
            self.follow_mask() & !bit
        };
        let off_mask = if follow && off {
            self.follow_off_mask() | bit
        } else {
            self.follow_off_mask() & !bit
        };

        self.status.defer();
        let a = self.set_property(ChannelProperty::FollowMask, ValueSide::Logical, Some(mask));
        let b = self.set_property(ChannelProperty::FollowOffMask, ValueSide::Logical, Some(off_mask));
        if self.status.resume() {
            self.recompute_status();
        }
        a || b
    }

    /// Replay a recorded edit.
    pub fn apply_change(&mut self, change: &ChannelChange) -> bool {
        match change {
            ChannelChange::Name { new, .. } => {
                let changed = self.name != *new;
                self.set_name(new.clone());
                changed
            }
            ChannelChange::Property {
                property,
                side,
                new,
                ..
            } => self.set_property(*property, *side, *new),
        }
    }

    /// Aggregate of the tracked properties.
    pub fn properties_status(&self) -> SyncStatus {
        aggregate([
            self.follow_mask.status(),
            self.follow_off_mask.status(),
            self.on_level.status(),
            self.ramp_rate.status(),
            self.toggle_mode.status(),
        ])
    }

    pub(crate) fn recompute_status(&mut self) {
        if !self.status.can_recompute() {
            return;
        }
        let new = self.properties_status();
        if let Some(old) = self.status.update(new) {
            if let Some(device) = self.owner {
                let target = StatusTarget::Channel {
                    device,
                    channel: self.number,
                };
                self.notifier.status(target, old, new);
            }
        }
    }

    fn publish(&self, change: ChannelChange) {
        if let Some(device) = self.owner {
            let channel = self.number;
            self.notifier.change(|| ChangeEntry::ChannelChanged {
                device,
                channel,
                change,
            });
        }
    }
}

impl LoadControl for Channel {
    fn on_level(&self) -> Option<u8> {
        self.value(ChannelProperty::OnLevel)
    }

    fn set_on_level(&mut self, level: u8) {
        self.set_property(ChannelProperty::OnLevel, ValueSide::Logical, Some(level));
    }

    fn ramp_rate(&self) -> Option<u8> {
        self.value(ChannelProperty::RampRate)
    }

    fn set_ramp_rate(&mut self, rate: u8) {
        self.set_property(ChannelProperty::RampRate, ValueSide::Logical, Some(rate));
    }

    fn properties_status(&self) -> SyncStatus {
        Channel::properties_status(self)
    }
}

// ── ChannelSet ──────────────────────────────────────────────────────

/// Channels of one device, numbered 1..=len.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelSet(Vec<Channel>);

impl ChannelSet {
    pub fn with_count(count: u8) -> Self {
        Self((1..=count).map(Channel::new).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, number: u8) -> Option<&Channel> {
        self.0.get(usize::from(number).checked_sub(1)?)
    }

    pub(crate) fn get_mut(&mut self, number: u8) -> Option<&mut Channel> {
        self.0.get_mut(usize::from(number).checked_sub(1)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.0.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.0.iter_mut()
    }

    pub fn statuses(&self) -> impl Iterator<Item = SyncStatus> + '_ {
        self.0.iter().map(Channel::status)
    }

    pub(crate) fn push(&mut self, channel: Channel) {
        self.0.push(channel);
    }

    pub(crate) fn pop(&mut self) -> Option<Channel> {
        self.0.pop()
    }

    /// Put channel numbers back in order after a load.
    pub(crate) fn renumber(&mut self) {
        for (i, channel) in self.0.iter_mut().enumerate() {
            channel.number = u8::try_from(i + 1).unwrap_or(u8::MAX);
        }
    }
}

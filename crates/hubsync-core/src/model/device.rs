// ── Device domain types ──
//
// A device owns its tracked properties, its channels and its link table.
// Its aggregate status is derived from all three and is only recomputed
// once the device is live (initial load finished) and outside of a batch.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use super::address::DeviceId;
use super::channel::{Channel, ChannelSet};
use super::link_record::RecordUid;
use super::link_table::LinkTable;
use super::sync_status::{StatusCell, SyncStatus, Tracked, ValueSide, aggregate};
use super::LoadControl;
use crate::changes::ChangeEntry;
use crate::event::{EventBus, Notifier, StatusTarget};

/// Operating-flag bit that switches a keypad into 8-button mode.
pub const EIGHT_BUTTON_FLAG: u8 = 0x08;

/// Device category, which decides the number of channels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum DeviceKind {
    Hub,
    Dimmer,
    Relay,
    Keypad,
    Outlet,
    FanController,
    Sensor,
    Other,
}

impl DeviceKind {
    pub fn is_hub(self) -> bool {
        matches!(self, Self::Hub)
    }

    /// Channels the device exposes given its operating flags.
    pub fn channel_count(self, operating_flags: Option<u8>) -> u8 {
        match self {
            Self::Hub | Self::Other => 0,
            Self::Dimmer | Self::Relay => 1,
            Self::Keypad => {
                if operating_flags.is_some_and(|f| f & EIGHT_BUTTON_FLAG != 0) {
                    8
                } else {
                    6
                }
            }
            Self::Outlet | Self::FanController => 2,
            Self::Sensor => 3,
        }
    }
}

/// Tracked device-level property.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceProperty {
    OperatingFlags,
    OnLevel,
    RampRate,
    LedBrightness,
}

/// One recordable edit of a device's own fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum DeviceChange {
    DisplayName {
        old: Option<String>,
        new: Option<String>,
    },
    Room {
        old: Option<String>,
        new: Option<String>,
    },
    Property {
        property: DeviceProperty,
        side: ValueSide,
        old: Option<u8>,
        new: Option<u8>,
    },
}

// ── Device ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    id: DeviceId,
    kind: DeviceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    room: Option<String>,
    #[serde(default)]
    operating_flags: Tracked<u8>,
    #[serde(default)]
    on_level: Tracked<u8>,
    #[serde(default)]
    ramp_rate: Tracked<u8>,
    #[serde(default)]
    led_brightness: Tracked<u8>,
    #[serde(default)]
    channels: ChannelSet,
    links: LinkTable,
    /// Last physical copy of the link table; kept between passes so an
    /// interrupted read can resume.
    #[serde(skip)]
    physical_links: Option<LinkTable>,
    #[serde(default)]
    status: StatusCell,
    #[serde(skip)]
    notifier: Notifier,
}

impl Device {
    pub fn new(id: DeviceId, kind: DeviceKind) -> Self {
        Self {
            id,
            kind,
            display_name: None,
            room: None,
            operating_flags: Tracked::default(),
            on_level: Tracked::default(),
            ramp_rate: Tracked::default(),
            led_brightness: Tracked::default(),
            channels: ChannelSet::with_count(kind.channel_count(None)),
            links: LinkTable::new(kind.is_hub()),
            physical_links: None,
            status: StatusCell::default(),
            notifier: Notifier::default(),
        }
    }

    /// Wire this device and its children to `bus`.
    pub(crate) fn attach(&mut self, bus: &EventBus) {
        self.notifier = Notifier::attached(bus);
        for channel in self.channels.iter_mut() {
            channel.attach(self.id, self.notifier.clone());
        }
        self.links.attach(self.id, self.notifier.clone());
    }

    pub(crate) fn go_live(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.go_live();
        }
        self.links.recompute_status();
        self.status.go_live();
        self.recompute_status();
    }

    /// Repair a freshly deserialized device before it is attached.
    pub(crate) fn repair_after_load(&mut self, seen: &mut HashSet<RecordUid>) {
        self.channels.renumber();
        self.ensure_channels();
        self.links.repair_after_load(seen);
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_hub(&self) -> bool {
        self.kind.is_hub()
    }

    pub fn is_multi_channel(&self) -> bool {
        self.channels.len() > 1
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.get()
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn channel(&self, number: u8) -> Option<&Channel> {
        self.channels.get(number)
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn physical_links(&self) -> Option<&LinkTable> {
        self.physical_links.as_ref()
    }

    pub fn property(&self, property: DeviceProperty) -> &Tracked<u8> {
        match property {
            DeviceProperty::OperatingFlags => &self.operating_flags,
            DeviceProperty::OnLevel => &self.on_level,
            DeviceProperty::RampRate => &self.ramp_rate,
            DeviceProperty::LedBrightness => &self.led_brightness,
        }
    }

    fn property_mut(&mut self, property: DeviceProperty) -> &mut Tracked<u8> {
        match property {
            DeviceProperty::OperatingFlags => &mut self.operating_flags,
            DeviceProperty::OnLevel => &mut self.on_level,
            DeviceProperty::RampRate => &mut self.ramp_rate,
            DeviceProperty::LedBrightness => &mut self.led_brightness,
        }
    }

    pub fn value(&self, property: DeviceProperty) -> Option<u8> {
        self.property(property).effective()
    }

    // ── Untracked fields ─────────────────────────────────────────────

    pub fn set_display_name(&mut self, name: Option<String>) {
        if self.display_name == name {
            return;
        }
        let old = std::mem::replace(&mut self.display_name, name.clone());
        self.publish(DeviceChange::DisplayName { old, new: name });
    }

    pub fn set_room(&mut self, room: Option<String>) {
        if self.room == room {
            return;
        }
        let old = std::mem::replace(&mut self.room, room.clone());
        self.publish(DeviceChange::Room { old, new: room });
    }

    // ── Tracked properties ───────────────────────────────────────────

    /// Set one side of a tracked property. Operating-flag changes may
    /// change the channel count.
    pub fn set_property(&mut self, property: DeviceProperty, side: ValueSide, value: Option<u8>) -> bool {
        let Some(old) = self.property_mut(property).set(side, value) else {
            return false;
        };
        self.publish(DeviceChange::Property {
            property,
            side,
            old,
            new: value,
        });
        if property == DeviceProperty::OperatingFlags {
            self.ensure_channels();
        }
        self.recompute_status();
        true
    }

    pub fn set_operating_flags(&mut self, flags: u8) {
        self.set_property(DeviceProperty::OperatingFlags, ValueSide::Logical, Some(flags));
    }

    pub fn set_led_brightness(&mut self, level: u8) {
        self.set_property(DeviceProperty::LedBrightness, ValueSide::Logical, Some(level));
    }

    /// Fold a value read from the device.
    pub fn absorb_read(&mut self, property: DeviceProperty, value: u8) {
        let tracked = self.property_mut(property);
        let old_physical = tracked.physical();
        let adopted = tracked.absorb_read(value);
        if old_physical != Some(value) {
            self.publish(DeviceChange::Property {
                property,
                side: ValueSide::Physical,
                old: old_physical,
                new: Some(value),
            });
        }
        if let Some(old) = adopted {
            self.publish(DeviceChange::Property {
                property,
                side: ValueSide::Logical,
                old,
                new: Some(value),
            });
        }
        if property == DeviceProperty::OperatingFlags {
            self.ensure_channels();
        }
        self.recompute_status();
    }

    /// A read of `property` failed.
    pub fn mark_property_unknown(&mut self, property: DeviceProperty) {
        self.set_property(property, ValueSide::Physical, None);
    }

    pub fn properties_status(&self) -> SyncStatus {
        aggregate([
            self.operating_flags.status(),
            self.on_level.status(),
            self.ramp_rate.status(),
            self.led_brightness.status(),
        ])
    }

    // ── Children ─────────────────────────────────────────────────────

    /// Edit one channel; the device status is recomputed afterwards.
    pub fn with_channel<R>(&mut self, number: u8, edit: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        let result = edit(self.channels.get_mut(number)?);
        self.recompute_status();
        Some(result)
    }

    /// Edit the link table; the device status is recomputed afterwards.
    pub fn with_links<R>(&mut self, edit: impl FnOnce(&mut LinkTable) -> R) -> R {
        let result = edit(&mut self.links);
        self.recompute_status();
        result
    }

    /// Match the channel set to what kind and operating flags call for.
    pub fn ensure_channels(&mut self) {
        let wanted = usize::from(self.kind.channel_count(self.operating_flags.effective()));
        let id = self.id;

        while self.channels.len() > wanted {
            let Some(removed) = self.channels.pop() else {
                break;
            };
            let number = removed.number();
            self.notifier
                .change(|| ChangeEntry::ChannelRemoved { device: id, number });
        }

        while self.channels.len() < wanted {
            let number = u8::try_from(self.channels.len() + 1).unwrap_or(u8::MAX);
            let mut channel = Channel::new(number);
            channel.attach(id, self.notifier.clone());
            if self.status.is_live() {
                channel.go_live();
            }
            let snapshot = channel.clone();
            self.channels.push(channel);
            self.notifier.change(|| ChangeEntry::ChannelAdded {
                device: id,
                channel: Box::new(snapshot),
            });
        }
        self.recompute_status();
    }

    /// Run several edits and recompute the status once at the end.
    pub fn batch<R>(&mut self, edit: impl FnOnce(&mut Self) -> R) -> R {
        self.status.defer();
        let result = edit(self);
        if self.status.resume() {
            self.recompute_status();
        }
        result
    }

    pub(crate) fn take_physical_links(&mut self) -> LinkTable {
        self.physical_links
            .take()
            .unwrap_or_else(|| LinkTable::mirror(self.is_hub()))
    }

    pub(crate) fn restore_physical_links(&mut self, table: LinkTable) {
        self.physical_links = Some(table);
    }

    pub(crate) fn clear_physical_links(&mut self) {
        self.physical_links = None;
    }

    // ── Replay ───────────────────────────────────────────────────────

    pub fn apply_change(&mut self, change: &DeviceChange) -> bool {
        match change {
            DeviceChange::DisplayName { new, .. } => {
                let changed = self.display_name != *new;
                self.set_display_name(new.clone());
                changed
            }
            DeviceChange::Room { new, .. } => {
                let changed = self.room != *new;
                self.set_room(new.clone());
                changed
            }
            DeviceChange::Property {
                property,
                side,
                new,
                ..
            } => self.set_property(*property, *side, *new),
        }
    }

    /// Re-add a channel removed by another session. Only the next number
    /// in sequence can be added.
    pub(crate) fn restore_channel(&mut self, mut channel: Channel) -> bool {
        if usize::from(channel.number()) != self.channels.len() + 1 {
            return false;
        }
        channel.attach(self.id, self.notifier.clone());
        if self.status.is_live() {
            channel.go_live();
        }
        let snapshot = channel.clone();
        self.channels.push(channel);
        let id = self.id;
        self.notifier.change(|| ChangeEntry::ChannelAdded {
            device: id,
            channel: Box::new(snapshot),
        });
        self.recompute_status();
        true
    }

    /// Drop the last channel if it carries `number`.
    pub(crate) fn drop_channel(&mut self, number: u8) -> bool {
        if usize::from(number) != self.channels.len() || number == 0 {
            return false;
        }
        self.channels.pop();
        let id = self.id;
        self.notifier
            .change(|| ChangeEntry::ChannelRemoved { device: id, number });
        self.recompute_status();
        true
    }

    // ── Status ───────────────────────────────────────────────────────

    pub(crate) fn recompute_status(&mut self) {
        if !self.status.can_recompute() {
            return;
        }
        let new = aggregate(
            [self.properties_status(), self.links.status()]
                .into_iter()
                .chain(self.channels.statuses()),
        );
        if let Some(old) = self.status.update(new) {
            self.notifier.status(StatusTarget::Device(self.id), old, new);
        }
    }

    fn publish(&self, change: DeviceChange) {
        let device = self.id;
        self.notifier
            .change(|| ChangeEntry::DeviceChanged { device, change });
    }
}

impl LoadControl for Device {
    fn on_level(&self) -> Option<u8> {
        self.value(DeviceProperty::OnLevel)
    }

    fn set_on_level(&mut self, level: u8) {
        self.set_property(DeviceProperty::OnLevel, ValueSide::Logical, Some(level));
    }

    fn ramp_rate(&self) -> Option<u8> {
        self.value(DeviceProperty::RampRate)
    }

    fn set_ramp_rate(&mut self, rate: u8) {
        self.set_property(DeviceProperty::RampRate, ValueSide::Logical, Some(rate));
    }

    fn properties_status(&self) -> SyncStatus {
        Device::properties_status(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::event::{EventEnvelope, ModelEvent};
    use crate::model::{ChannelProperty, LinkRecord};

    fn id(n: u8) -> DeviceId {
        DeviceId::new([0x0A, 0x0B, n])
    }

    fn live(kind: DeviceKind, bus: &EventBus) -> Device {
        let mut device = Device::new(id(1), kind);
        device.attach(bus);
        device.go_live();
        device
    }

    fn capture(bus: &EventBus) -> Arc<Mutex<Vec<EventEnvelope>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |env| sink.lock().unwrap().push(env.clone()));
        seen
    }

    fn read_everything(device: &mut Device) {
        for property in [
            DeviceProperty::OperatingFlags,
            DeviceProperty::OnLevel,
            DeviceProperty::RampRate,
            DeviceProperty::LedBrightness,
        ] {
            device.absorb_read(property, 0);
        }
        let numbers: Vec<u8> = device.channels().iter().map(Channel::number).collect();
        for number in numbers {
            device.with_channel(number, |c| {
                for property in [
                    ChannelProperty::FollowMask,
                    ChannelProperty::FollowOffMask,
                    ChannelProperty::OnLevel,
                    ChannelProperty::RampRate,
                    ChannelProperty::ToggleMode,
                ] {
                    c.absorb_read(property, 0);
                }
            });
        }
        device.with_links(|t| t.mark_read(0));
    }

    #[test]
    fn channel_count_follows_kind_and_flags() {
        assert_eq!(DeviceKind::Keypad.channel_count(None), 6);
        assert_eq!(DeviceKind::Keypad.channel_count(Some(EIGHT_BUTTON_FLAG)), 8);
        assert_eq!(DeviceKind::Outlet.channel_count(Some(0xFF)), 2);
        assert_eq!(DeviceKind::Hub.channel_count(None), 0);
    }

    #[test]
    fn operating_flags_resize_channels_with_events() {
        let bus = EventBus::new();
        let mut keypad = live(DeviceKind::Keypad, &bus);
        let seen = capture(&bus);

        keypad.set_operating_flags(EIGHT_BUTTON_FLAG);
        assert_eq!(keypad.channels().len(), 8);
        keypad.set_operating_flags(0);
        assert_eq!(keypad.channels().len(), 6);

        let seen = seen.lock().unwrap();
        let added = seen
            .iter()
            .filter(|e| matches!(e.event, ModelEvent::Change(ChangeEntry::ChannelAdded { .. })))
            .count();
        let removed = seen
            .iter()
            .filter(|e| matches!(e.event, ModelEvent::Change(ChangeEntry::ChannelRemoved { .. })))
            .count();
        assert_eq!((added, removed), (2, 2));
    }

    #[test]
    fn status_aggregates_properties_channels_and_table() {
        let bus = EventBus::new();
        let mut dimmer = live(DeviceKind::Dimmer, &bus);
        assert_eq!(dimmer.status(), SyncStatus::Unknown);

        read_everything(&mut dimmer);
        assert_eq!(dimmer.status(), SyncStatus::Synced);

        dimmer.with_channel(1, |c| c.set_on_level(0x40));
        assert_eq!(dimmer.status(), SyncStatus::Changed);
        dimmer.with_channel(1, |c| c.set_on_level(0));
        assert_eq!(dimmer.status(), SyncStatus::Synced);

        dimmer.with_links(|t| t.add_record(LinkRecord::responder(id(2), 1, [0xFF, 0x1C, 1])));
        assert_eq!(dimmer.status(), SyncStatus::Changed);
    }

    #[test]
    fn batch_emits_a_single_status_change() {
        let bus = EventBus::new();
        let mut dimmer = live(DeviceKind::Dimmer, &bus);
        read_everything(&mut dimmer);
        let seen = capture(&bus);

        dimmer.batch(|d| {
            d.set_on_level(0x10);
            d.set_ramp_rate(0x1C);
            d.set_on_level(0);
            d.set_ramp_rate(0);
        });

        let statuses = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                matches!(
                    e.event,
                    ModelEvent::StatusChanged {
                        target: StatusTarget::Device(_),
                        ..
                    }
                )
            })
            .count();
        assert_eq!(statuses, 0);
        assert_eq!(dimmer.status(), SyncStatus::Synced);
    }

    #[test]
    fn detached_device_records_nothing() {
        let bus = EventBus::new();
        let seen = capture(&bus);
        let mut device = Device::new(id(3), DeviceKind::Relay);
        device.set_display_name(Some("Porch".into()));
        device.set_on_level(0xFF);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(device.status(), SyncStatus::Unknown);
    }

    #[test]
    fn replayed_change_sets_the_new_value() {
        let bus = EventBus::new();
        let mut device = live(DeviceKind::Dimmer, &bus);
        let change = DeviceChange::Property {
            property: DeviceProperty::LedBrightness,
            side: ValueSide::Logical,
            old: None,
            new: Some(0x7F),
        };
        assert!(device.apply_change(&change));
        assert!(!device.apply_change(&change));
        assert_eq!(device.value(DeviceProperty::LedBrightness), Some(0x7F));
    }
}

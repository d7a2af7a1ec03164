// ── Device sync passes ──
//
// Read and write passes that reconcile one device with its physical
// counterpart through a `PhysicalDevice`. Passes stop early, reporting
// failure, when the device drops off or the caller cancels; whatever was
// done so far stays committed and the next pass resumes from there.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoEnumIterator};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::driver::PhysicalDevice;
use crate::error::CoreError;
use crate::model::{
    ChannelProperty, Device, DeviceId, DeviceProperty, LinkTable, SyncStatus, WriteAction,
};
use crate::network::Network;

/// What a sync pass does.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum SyncKind {
    /// Acquire the device's state and merge it into the model.
    Read,
    /// Read (when needed) then push pending edits to the device.
    Write,
    /// Read everything, then write.
    Full,
}

fn live<D: PhysicalDevice>(driver: &D, cancel: &CancellationToken, id: DeviceId) -> bool {
    !cancel.is_cancelled() && driver.is_reachable(id)
}

impl Device {
    /// Acquire the link table and merge it. Skipped when the model already
    /// holds a complete read, unless `force`.
    pub async fn read_links<D: PhysicalDevice>(
        &mut self,
        driver: &D,
        cancel: &CancellationToken,
        force: bool,
    ) -> bool {
        let id = self.id();
        let mirror_complete = self.physical_links().is_some_and(LinkTable::is_read);
        if !force && self.links().is_read() && mirror_complete {
            return true;
        }

        let mut mirror = self.take_physical_links();
        let mut restart = force || mirror.is_read();
        loop {
            if !live(driver, cancel, id) {
                warn!(device = %id, read = mirror.len(), "link read interrupted");
                self.restore_physical_links(mirror);
                self.with_links(LinkTable::mark_unread);
                return false;
            }
            let step = driver
                .read_link_table_step(id, &mut mirror, restart, force)
                .await;
            restart = false;
            if !step.success {
                warn!(device = %id, next = mirror.next_record_to_read(), "link read failed");
                self.restore_physical_links(mirror);
                self.with_links(LinkTable::mark_unread);
                return false;
            }
            if step.done {
                break;
            }
        }

        self.with_links(|table| table.merge_on_read(&mirror));
        self.restore_physical_links(mirror);
        true
    }

    /// Push every pending record to the device, reading first when the
    /// model has no complete physical copy (or `force_read`).
    pub async fn write_links<D: PhysicalDevice>(
        &mut self,
        driver: &D,
        cancel: &CancellationToken,
        force_read: bool,
    ) -> bool {
        if !self.read_links(driver, cancel, force_read).await {
            return false;
        }

        let id = self.id();
        let hub = self.is_hub();
        let mut mirror = self.take_physical_links();
        let plan = self.links().plan_writes(&mirror);
        let mut ok = true;
        let mut written = 0usize;

        for action in plan {
            let WriteAction::Write { seq, record } = action else {
                self.with_links(|table| table.apply_local_action(&action));
                continue;
            };
            if !live(driver, cancel, id) {
                warn!(device = %id, "link write interrupted");
                ok = false;
                break;
            }
            // Earlier drops may have moved the record.
            let seq = if hub {
                None
            } else {
                self.links().position_of(record.uid()).or(seq)
            };
            if driver.write_link_record(id, seq, &record).await {
                self.with_links(|table| table.commit_write(&mut mirror, seq, &record));
                written += 1;
            } else {
                warn!(device = %id, ?seq, record = %record, "link write failed");
                ok = false;
            }
        }

        self.with_links(LinkTable::finish_write);
        self.restore_physical_links(mirror);
        debug!(device = %id, written, ok, "link write pass finished");
        ok
    }

    /// Read tracked properties the model has no physical value for, or
    /// all of them with `force`.
    pub async fn read_properties<D: PhysicalDevice>(
        &mut self,
        driver: &D,
        cancel: &CancellationToken,
        force: bool,
    ) -> bool {
        if self.is_hub() {
            return true;
        }
        let id = self.id();
        let mut ok = true;

        for property in DeviceProperty::iter() {
            if !force && self.property(property).physical().is_some() {
                continue;
            }
            if !live(driver, cancel, id) {
                return false;
            }
            match driver.read_device_property(id, property).await {
                Some(value) => self.absorb_read(property, value),
                None => {
                    warn!(device = %id, %property, "property read failed");
                    self.mark_property_unknown(property);
                    ok = false;
                }
            }
        }

        // Operating flags may just have changed the channel count.
        let channels: Vec<u8> = self.channels().iter().map(|c| c.number()).collect();
        for number in channels {
            for property in ChannelProperty::iter() {
                let known = self
                    .channel(number)
                    .is_some_and(|c| c.property(property).physical().is_some());
                if !force && known {
                    continue;
                }
                if !live(driver, cancel, id) {
                    return false;
                }
                let read = driver.read_channel_property(id, number, property).await;
                self.with_channel(number, |channel| match read {
                    Some(value) => channel.absorb_read(property, value),
                    None => channel.mark_unknown(property),
                });
                if read.is_none() {
                    warn!(device = %id, channel = number, %property, "channel property read failed");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Write every property whose logical value the device does not hold.
    pub async fn write_properties<D: PhysicalDevice>(
        &mut self,
        driver: &D,
        cancel: &CancellationToken,
    ) -> bool {
        if self.is_hub() {
            return true;
        }
        let id = self.id();
        let mut ok = true;

        for property in DeviceProperty::iter() {
            let tracked = self.property(property);
            let Some(value) = tracked.logical() else {
                continue;
            };
            if tracked.status() == SyncStatus::Synced {
                continue;
            }
            if !live(driver, cancel, id) {
                return false;
            }
            if driver.write_device_property(id, property, value).await {
                self.absorb_read(property, value);
            } else {
                warn!(device = %id, %property, "property write failed");
                ok = false;
            }
        }

        let channels: Vec<u8> = self.channels().iter().map(|c| c.number()).collect();
        for number in channels {
            for property in ChannelProperty::iter() {
                let pending = self.channel(number).and_then(|c| {
                    let tracked = c.property(property);
                    (tracked.status() != SyncStatus::Synced)
                        .then(|| tracked.logical())
                        .flatten()
                });
                let Some(value) = pending else {
                    continue;
                };
                if !live(driver, cancel, id) {
                    return false;
                }
                if driver.write_channel_property(id, number, property, value).await {
                    self.with_channel(number, |channel| channel.absorb_read(property, value));
                } else {
                    warn!(device = %id, channel = number, %property, "channel property write failed");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Run one pass of `kind`. Returns whether everything it attempted
    /// succeeded.
    pub async fn sync<D: PhysicalDevice>(
        &mut self,
        kind: SyncKind,
        driver: &D,
        cancel: &CancellationToken,
        force: bool,
    ) -> bool {
        let ok = match kind {
            SyncKind::Read => {
                let props = self.read_properties(driver, cancel, force).await;
                let links = self.read_links(driver, cancel, force).await;
                props && links
            }
            SyncKind::Write => {
                let links = self.write_links(driver, cancel, force).await;
                let props = self.write_properties(driver, cancel).await;
                links && props
            }
            SyncKind::Full => {
                let props = self.read_properties(driver, cancel, force).await;
                let links = self.write_links(driver, cancel, force).await;
                let written = self.write_properties(driver, cancel).await;
                props && links && written
            }
        };
        debug!(device = %self.id(), %kind, ok, status = ?self.status(), "sync pass finished");
        ok
    }
}

impl Network {
    pub async fn read_device<D: PhysicalDevice>(
        &mut self,
        id: DeviceId,
        driver: &D,
        cancel: &CancellationToken,
        force: bool,
    ) -> Result<bool, CoreError> {
        self.sync_device(id, SyncKind::Read, driver, cancel, force).await
    }

    pub async fn write_device<D: PhysicalDevice>(
        &mut self,
        id: DeviceId,
        driver: &D,
        cancel: &CancellationToken,
        force_read: bool,
    ) -> Result<bool, CoreError> {
        self.sync_device(id, SyncKind::Write, driver, cancel, force_read)
            .await
    }

    /// Run one pass on device `id`. `Ok(false)` means the pass ran but did
    /// not complete; statuses say what is left.
    pub async fn sync_device<D: PhysicalDevice>(
        &mut self,
        id: DeviceId,
        kind: SyncKind,
        driver: &D,
        cancel: &CancellationToken,
        force: bool,
    ) -> Result<bool, CoreError> {
        let device = self.require_device_mut(id)?;
        Ok(device.sync(kind, driver, cancel, force).await)
    }
}

// ── Simulated devices ──
//
// In-memory stand-ins for physical devices, implementing `PhysicalDevice`.
// Records travel through the real wire codecs so the engine sees exactly
// what a transport would hand it. Faults can be injected per device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::driver::{PhysicalDevice, StepOutcome};
use crate::model::{
    ChannelProperty, DeviceId, DeviceProperty, LinkRecord, LinkTable, address_for_seq,
};

const DEFAULT_BATCH_SIZE: usize = 8;

/// Memory and settings of one simulated device.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    hub: bool,
    /// Stored records, in memory order. The sentinel is implied after the
    /// last one.
    links: Vec<LinkRecord>,
    properties: HashMap<DeviceProperty, u8>,
    channel_properties: HashMap<(u8, ChannelProperty), u8>,
    unreachable: bool,
    failing_reads: usize,
    failing_writes: usize,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hub() -> Self {
        Self {
            hub: true,
            ..Self::default()
        }
    }

    pub fn with_links(mut self, links: impl IntoIterator<Item = LinkRecord>) -> Self {
        self.links = links.into_iter().collect();
        self
    }

    pub fn with_property(mut self, property: DeviceProperty, value: u8) -> Self {
        self.properties.insert(property, value);
        self
    }

    pub fn with_channel_property(mut self, channel: u8, property: ChannelProperty, value: u8) -> Self {
        self.channel_properties.insert((channel, property), value);
        self
    }

    fn take_read_fault(&mut self) -> bool {
        if self.unreachable {
            return true;
        }
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return true;
        }
        false
    }

    fn take_write_fault(&mut self) -> bool {
        if self.unreachable {
            return true;
        }
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return true;
        }
        false
    }
}

/// A set of simulated devices shared by reference with the engine.
#[derive(Debug)]
pub struct SimulatedNetwork {
    devices: DashMap<DeviceId, SimulatedDevice>,
    batch_size: usize,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl SimulatedNetwork {
    /// `batch_size` is the number of records one read step acquires.
    pub fn new(batch_size: usize) -> Self {
        Self {
            devices: DashMap::new(),
            batch_size: batch_size.max(1),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, id: DeviceId, device: SimulatedDevice) {
        self.devices.insert(id, device);
    }

    pub fn remove(&self, id: DeviceId) -> bool {
        self.devices.remove(&id).is_some()
    }

    /// Records currently stored on the device.
    pub fn links(&self, id: DeviceId) -> Vec<LinkRecord> {
        self.devices
            .get(&id)
            .map(|d| d.links.clone())
            .unwrap_or_default()
    }

    /// Overwrite the device's memory, as if another tool had edited it.
    pub fn set_links(&self, id: DeviceId, links: Vec<LinkRecord>) {
        if let Some(mut device) = self.devices.get_mut(&id) {
            device.links = links;
        }
    }

    pub fn property(&self, id: DeviceId, property: DeviceProperty) -> Option<u8> {
        self.devices
            .get(&id)
            .and_then(|d| d.properties.get(&property).copied())
    }

    pub fn set_property(&self, id: DeviceId, property: DeviceProperty, value: u8) {
        if let Some(mut device) = self.devices.get_mut(&id) {
            device.properties.insert(property, value);
        }
    }

    pub fn channel_property(&self, id: DeviceId, channel: u8, property: ChannelProperty) -> Option<u8> {
        self.devices
            .get(&id)
            .and_then(|d| d.channel_properties.get(&(channel, property)).copied())
    }

    pub fn set_reachable(&self, id: DeviceId, reachable: bool) {
        if let Some(mut device) = self.devices.get_mut(&id) {
            device.unreachable = !reachable;
        }
    }

    /// Make the next `count` read operations on the device fail.
    pub fn fail_reads(&self, id: DeviceId, count: usize) {
        if let Some(mut device) = self.devices.get_mut(&id) {
            device.failing_reads = count;
        }
    }

    /// Make the next `count` write operations on the device fail.
    pub fn fail_writes(&self, id: DeviceId, count: usize) {
        if let Some(mut device) = self.devices.get_mut(&id) {
            device.failing_writes = count;
        }
    }

    /// Read operations served so far (steps and property reads).
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Write operations served so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    fn read_step(&self, id: DeviceId, table: &mut LinkTable, restart: bool, force: bool) -> StepOutcome {
        let Some(mut device) = self.devices.get_mut(&id) else {
            return StepOutcome::FAILED;
        };
        if device.take_read_fault() {
            debug!(device = %id, "simulated link read failed");
            return StepOutcome::FAILED;
        }
        self.reads.fetch_add(1, Ordering::Relaxed);

        if table.is_read() && !restart && !force {
            return StepOutcome::progressed(true);
        }
        if restart || table.is_read() {
            table.begin_read();
        }

        let start = table.next_record_to_read();
        let end = start + self.batch_size;
        for seq in start..end {
            if device.hub {
                let Some(stored) = device.links.get(seq) else {
                    table.set_next_record_to_read(seq);
                    table.finish_read();
                    return StepOutcome::progressed(true);
                };
                match LinkRecord::decode_im_record(&stored.to_bytes()) {
                    Ok(record) => table.set_record_at(seq, record),
                    Err(_) => return StepOutcome::FAILED,
                }
                continue;
            }

            let Some(address) = address_for_seq(seq) else {
                return StepOutcome::FAILED;
            };
            let stored = device
                .links
                .get(seq)
                .cloned()
                .unwrap_or_else(LinkRecord::high_water_mark);
            let record = match LinkRecord::decode_aldb_response(&stored.encode_aldb_response(address)) {
                Ok((_, record)) => record,
                Err(_) => return StepOutcome::FAILED,
            };
            trace!(device = %id, seq, record = %record, "simulated record read");
            let last = record.is_high_water_mark();
            table.set_record_at(seq, record);
            if last {
                table.set_next_record_to_read(seq + 1);
                table.finish_read();
                return StepOutcome::progressed(true);
            }
        }
        table.set_next_record_to_read(end);
        StepOutcome::progressed(false)
    }

    fn write_record(&self, id: DeviceId, seq: Option<usize>, record: &LinkRecord) -> bool {
        let Some(mut device) = self.devices.get_mut(&id) else {
            return false;
        };
        if device.take_write_fault() {
            debug!(device = %id, "simulated link write failed");
            return false;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);

        match seq {
            Some(seq) => {
                let Some(address) = address_for_seq(seq) else {
                    return false;
                };
                let Ok((_, stored)) = LinkRecord::decode_aldb_write(&record.encode_aldb_write(address))
                else {
                    return false;
                };
                while device.links.len() < seq {
                    device.links.push(LinkRecord::placeholder());
                }
                if seq == device.links.len() {
                    device.links.push(stored);
                } else {
                    device.links[seq] = stored;
                }
            }
            None => {
                let Ok(stored) = LinkRecord::decode_im_record(&record.to_bytes()) else {
                    return false;
                };
                let key = stored.hub_key();
                let existing = device.links.iter().position(|r| r.hub_key() == key);
                match (existing, stored.is_in_use()) {
                    (Some(at), true) => device.links[at] = stored,
                    (None, true) => device.links.push(stored),
                    (Some(at), false) => {
                        device.links.remove(at);
                    }
                    (None, false) => {}
                }
            }
        }
        true
    }
}

impl PhysicalDevice for SimulatedNetwork {
    fn is_reachable(&self, id: DeviceId) -> bool {
        self.devices.get(&id).is_some_and(|d| !d.unreachable)
    }

    async fn read_link_table_step(
        &self,
        id: DeviceId,
        table: &mut LinkTable,
        restart: bool,
        force: bool,
    ) -> StepOutcome {
        tokio::task::yield_now().await;
        self.read_step(id, table, restart, force)
    }

    async fn write_link_record(&self, id: DeviceId, seq: Option<usize>, record: &LinkRecord) -> bool {
        tokio::task::yield_now().await;
        self.write_record(id, seq, record)
    }

    async fn read_device_property(&self, id: DeviceId, property: DeviceProperty) -> Option<u8> {
        tokio::task::yield_now().await;
        let mut device = self.devices.get_mut(&id)?;
        if device.take_read_fault() {
            return None;
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Some(device.properties.get(&property).copied().unwrap_or_default())
    }

    async fn write_device_property(&self, id: DeviceId, property: DeviceProperty, value: u8) -> bool {
        tokio::task::yield_now().await;
        let Some(mut device) = self.devices.get_mut(&id) else {
            return false;
        };
        if device.take_write_fault() {
            return false;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        device.properties.insert(property, value);
        true
    }

    async fn read_channel_property(
        &self,
        id: DeviceId,
        channel: u8,
        property: ChannelProperty,
    ) -> Option<u8> {
        tokio::task::yield_now().await;
        let mut device = self.devices.get_mut(&id)?;
        if device.take_read_fault() {
            return None;
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Some(
            device
                .channel_properties
                .get(&(channel, property))
                .copied()
                .unwrap_or_default(),
        )
    }

    async fn write_channel_property(
        &self,
        id: DeviceId,
        channel: u8,
        property: ChannelProperty,
        value: u8,
    ) -> bool {
        tokio::task::yield_now().await;
        let Some(mut device) = self.devices.get_mut(&id) else {
            return false;
        };
        if device.take_write_fault() {
            return false;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        device.channel_properties.insert((channel, property), value);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn id(n: u8) -> DeviceId {
        DeviceId::new([0x51, 0x00, n])
    }

    #[tokio::test]
    async fn reads_in_batches_and_ends_with_sentinel() {
        let sim = SimulatedNetwork::new(2);
        sim.insert(
            id(1),
            SimulatedDevice::new().with_links([
                LinkRecord::controller(id(2), 1, [3, 0, 1]),
                LinkRecord::responder(id(3), 1, [0xFF, 0, 1]),
                LinkRecord::responder(id(4), 2, [0xFF, 0, 1]),
            ]),
        );

        let mut table = LinkTable::mirror(false);
        let first = sim.read_link_table_step(id(1), &mut table, true, false).await;
        assert_eq!(first, StepOutcome::progressed(false));
        assert_eq!(table.len(), 2);

        assert!(sim.read_link_table(id(1), &mut table, false).await);
        assert!(table.is_read());
        assert_eq!(table.stored_len(), 3);
        assert!(table.records().last().unwrap().is_high_water_mark());
        assert_eq!(sim.read_count(), 2);
    }

    #[tokio::test]
    async fn interrupted_read_resumes() {
        let sim = SimulatedNetwork::new(1);
        sim.insert(
            id(1),
            SimulatedDevice::new().with_links([
                LinkRecord::controller(id(2), 1, [3, 0, 1]),
                LinkRecord::controller(id(3), 1, [3, 0, 1]),
            ]),
        );
        let mut table = LinkTable::mirror(false);
        sim.read_link_table_step(id(1), &mut table, true, false).await;
        sim.fail_reads(id(1), 1);
        assert!(!sim.read_link_table(id(1), &mut table, false).await);
        assert_eq!(table.next_record_to_read(), 1);

        assert!(sim.read_link_table(id(1), &mut table, false).await);
        assert_eq!(table.stored_len(), 2);
    }

    #[tokio::test]
    async fn hub_writes_upsert_and_delete_by_key() {
        let sim = SimulatedNetwork::default();
        sim.insert(id(0), SimulatedDevice::hub());
        let rec = LinkRecord::controller(id(2), 1, [1, 2, 3]);

        assert!(sim.write_link_record(id(0), None, &rec).await);
        assert!(sim.write_link_record(id(0), None, &rec.with_data([4, 5, 6])).await);
        assert_eq!(sim.links(id(0)).len(), 1);
        assert_eq!(sim.links(id(0))[0].data(), [4, 5, 6]);

        assert!(sim.write_link_record(id(0), None, &rec.with_in_use(false)).await);
        assert!(sim.links(id(0)).is_empty());
    }

    #[tokio::test]
    async fn unreachable_devices_fail_everything() {
        let sim = SimulatedNetwork::default();
        sim.insert(id(1), SimulatedDevice::new().with_property(DeviceProperty::OnLevel, 7));
        assert_eq!(sim.read_device_property(id(1), DeviceProperty::OnLevel).await, Some(7));

        sim.set_reachable(id(1), false);
        assert!(!sim.is_reachable(id(1)));
        assert_eq!(sim.read_device_property(id(1), DeviceProperty::OnLevel).await, None);
        assert!(!sim.write_device_property(id(1), DeviceProperty::OnLevel, 1).await);
        let mut table = LinkTable::mirror(false);
        assert!(!sim.read_link_table(id(1), &mut table, true).await);
    }
}

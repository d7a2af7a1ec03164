// ── Physical device collaborator ──
//
// The engine never speaks the wire protocol itself. A `PhysicalDevice`
// implementation owns transport, framing and packet-level retries; every
// operation reports plain success or failure, never an error.

use std::future::Future;

use serde::Serialize;

use crate::model::{ChannelProperty, DeviceId, DeviceProperty, LinkRecord, LinkTable};

/// Result of one incremental link-table read step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    /// The step's I/O went through.
    pub success: bool,
    /// The table is now completely read.
    pub done: bool,
}

impl StepOutcome {
    pub const FAILED: Self = Self {
        success: false,
        done: false,
    };

    pub fn progressed(done: bool) -> Self {
        Self {
            success: true,
            done,
        }
    }
}

/// Access to the devices themselves.
///
/// Implementations append acquired records to the supplied table with
/// [`LinkTable::set_record_at`], advance
/// [`LinkTable::set_next_record_to_read`] and call
/// [`LinkTable::finish_read`] once the whole table is in.
pub trait PhysicalDevice: Send + Sync {
    /// Whether the device currently answers. Checked between I/O steps.
    fn is_reachable(&self, id: DeviceId) -> bool;

    /// Acquire the next batch of records into `table`. `restart` discards
    /// what was acquired so far; `force` re-reads a table that is already
    /// complete.
    fn read_link_table_step(
        &self,
        id: DeviceId,
        table: &mut LinkTable,
        restart: bool,
        force: bool,
    ) -> impl Future<Output = StepOutcome> + Send;

    /// Read the whole table, step by step.
    fn read_link_table(
        &self,
        id: DeviceId,
        table: &mut LinkTable,
        force: bool,
    ) -> impl Future<Output = bool> + Send {
        async move {
            let mut restart = force || table.is_read();
            loop {
                let step = self.read_link_table_step(id, table, restart, force).await;
                if !step.success {
                    return false;
                }
                if step.done {
                    return true;
                }
                restart = false;
            }
        }
    }

    /// Store one record. `seq` is the slot on a device and `None` for the
    /// hub, where an in-use record is added or updated and a not-in-use one
    /// deletes the entry with the same (peer, group, role).
    fn write_link_record(
        &self,
        id: DeviceId,
        seq: Option<usize>,
        record: &LinkRecord,
    ) -> impl Future<Output = bool> + Send;

    fn read_device_property(
        &self,
        id: DeviceId,
        property: DeviceProperty,
    ) -> impl Future<Output = Option<u8>> + Send;

    fn write_device_property(
        &self,
        id: DeviceId,
        property: DeviceProperty,
        value: u8,
    ) -> impl Future<Output = bool> + Send;

    fn read_channel_property(
        &self,
        id: DeviceId,
        channel: u8,
        property: ChannelProperty,
    ) -> impl Future<Output = Option<u8>> + Send;

    fn write_channel_property(
        &self,
        id: DeviceId,
        channel: u8,
        property: ChannelProperty,
        value: u8,
    ) -> impl Future<Output = bool> + Send;
}

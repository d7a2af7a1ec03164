// ── Domain model ──
//
// Identity types, sync-status bookkeeping, link records and tables, and the
// device / channel / scene entities built on top of them.

pub mod address;
pub mod channel;
pub mod device;
pub mod link_record;
pub mod link_table;
pub mod reconcile;
pub mod scene;
pub mod sync_status;

pub use address::{DeviceId, SceneId};
pub use channel::{Channel, ChannelChange, ChannelProperty, ChannelSet, ToggleMode};
pub use device::{Device, DeviceChange, DeviceKind, DeviceProperty, EIGHT_BUTTON_FLAG};
pub use link_record::{
    LinkRecord, LinkRole, RECORD_SIZE, RecordFlags, RecordUid, TABLE_BASE_ADDRESS,
    address_for_seq, extended_checksum, seq_for_address,
};
pub use link_table::LinkTable;
pub use reconcile::{MergeSummary, WriteAction};
pub use scene::{FollowLink, Scene, SceneMember, SceneSet};
pub use sync_status::{StatusCell, SyncStatus, Tracked, ValueSide, aggregate};

/// Load settings shared by devices and their channels.
pub trait LoadControl {
    fn on_level(&self) -> Option<u8>;
    fn set_on_level(&mut self, level: u8);
    fn ramp_rate(&self) -> Option<u8>;
    fn set_ramp_rate(&mut self, rate: u8);
    /// Aggregate status of the tracked properties alone.
    fn properties_status(&self) -> SyncStatus;
}

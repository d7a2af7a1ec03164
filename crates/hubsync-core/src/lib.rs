//! Device-state reconciliation engine for Insteon-style device networks.
//!
//! This crate keeps a logical model of a network of addressable devices in
//! step with the state stored inside each physical device, and lets several
//! controller instances merge their edits:
//!
//! - **Link tables** ([`LinkTable`]): per-device ALL-Link databases with a
//!   high-water-mark sentinel. [`LinkTable::merge_on_read`] folds a physical
//!   copy into the logical one and [`LinkTable::plan_writes`] decides what has
//!   to be written back. The hub's table is matched by identity, device
//!   tables slot by slot.
//!
//! - **Sync status** ([`SyncStatus`]): tri-state freshness tracked on every
//!   record, property, channel, table and device, rolled up with
//!   [`aggregate`](model::aggregate).
//!
//! - **Scenes** ([`Scene`]): named controller/responder memberships that
//!   [`Network::expand_scene`] turns into concrete link records and channel
//!   follow masks, idempotently.
//!
//! - **Change replay** ([`ChangeRecorder`], [`ChangeReplayer`]): every
//!   mutation is published on the [`EventBus`] as a typed [`ChangeEntry`];
//!   a recorded [`ChangeLog`] can be replayed onto another copy of the model.
//!
//! - **Sync passes** ([`sync`]): device read/write passes driven through a
//!   [`PhysicalDevice`] implementation and scheduled through a
//!   [`JobScheduler`] such as [`SyncQueue`]. [`sim::SimulatedNetwork`]
//!   provides in-memory devices for tests and demos.
//!
//! [`Engine`] bundles a network with its recorder, queue and sync trigger.

pub mod changes;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod event;
pub mod expand;
pub mod model;
pub mod network;
pub mod scheduler;
pub mod sim;
pub mod sync;

// ── Primary re-exports ──────────────────────────────────────────────
pub use changes::{ChangeEntry, ChangeLog, ChangeRecorder, ChangeReplayer, ReplaySummary};
pub use config::EngineConfig;
pub use driver::{PhysicalDevice, StepOutcome};
pub use engine::Engine;
pub use error::{CoreError, MalformedRecordError};
pub use event::{EventBus, EventEnvelope, EventOrigin, ModelEvent, StatusTarget, SubscriptionId};
pub use expand::ExpandSummary;
pub use network::{DeviceSet, Network};
pub use scheduler::{
    JobHandle, JobOutcome, JobPriority, JobRequest, JobScheduler, PendingJob, RunSummary,
    SyncQueue, SyncTrigger,
};
pub use sync::SyncKind;

// Re-export model types at the crate root for ergonomics.
pub use model::{
    Channel, ChannelChange, ChannelProperty, ChannelSet, Device, DeviceChange, DeviceId,
    DeviceKind, DeviceProperty, FollowLink, LinkRecord, LinkRole, LinkTable, LoadControl,
    MergeSummary, RecordFlags, RecordUid, Scene, SceneId, SceneMember, SceneSet, SyncStatus,
    Tracked, ValueSide, WriteAction,
};

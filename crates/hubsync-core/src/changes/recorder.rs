use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::entry::ChangeLog;
use crate::event::{EventBus, EventOrigin, ModelEvent, SubscriptionId};

/// Subscribes to a network's bus and appends every local change to a log.
///
/// Merge-originated events are ignored so that replaying another session's
/// log never records it a second time.
pub struct ChangeRecorder {
    bus: EventBus,
    subscription: SubscriptionId,
    state: Arc<RecorderState>,
}

struct RecorderState {
    recording: AtomicBool,
    log: Mutex<ChangeLog>,
}

impl RecorderState {
    fn log(&self) -> MutexGuard<'_, ChangeLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChangeRecorder {
    /// Start recording changes published on `bus`.
    pub fn attach(bus: &EventBus) -> Self {
        let state = Arc::new(RecorderState {
            recording: AtomicBool::new(true),
            log: Mutex::new(ChangeLog::new()),
        });
        let sink = Arc::clone(&state);
        let subscription = bus.subscribe(move |envelope| {
            if envelope.origin == EventOrigin::Merge || !sink.recording.load(Ordering::Acquire) {
                return;
            }
            if let ModelEvent::Change(entry) = &envelope.event {
                sink.log().push(entry.clone());
            }
        });
        debug!("change recorder attached");
        Self {
            bus: bus.clone(),
            subscription,
            state,
        }
    }

    pub fn pause(&self) {
        self.state.recording.store(false, Ordering::Release);
    }

    pub fn resume(&self) {
        self.state.recording.store(true, Ordering::Release);
    }

    pub fn is_recording(&self) -> bool {
        self.state.recording.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.state.log().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.log().is_empty()
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> ChangeLog {
        self.state.log().clone()
    }

    /// Hand over the recorded log and start a fresh one.
    pub fn take(&self) -> ChangeLog {
        std::mem::take(&mut *self.state.log())
    }
}

impl Drop for ChangeRecorder {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription);
    }
}

impl std::fmt::Debug for ChangeRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeRecorder")
            .field("recording", &self.is_recording())
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::changes::ChangeEntry;
    use crate::model::{DeviceId, DeviceKind, SyncStatus};
    use crate::network::Network;

    fn id(n: u8) -> DeviceId {
        DeviceId::new([0x40, 0x00, n])
    }

    #[test]
    fn records_local_changes_only() {
        let mut net = Network::new(id(0));
        let recorder = ChangeRecorder::attach(net.bus());

        net.add_device(id(1), DeviceKind::Relay).unwrap();
        {
            let _merge = net.bus().merge_scope();
            net.add_device(id(2), DeviceKind::Relay).unwrap();
        }

        let log = recorder.snapshot();
        assert_eq!(log.len(), 1);
        assert!(matches!(
            &log.entries()[0],
            ChangeEntry::DeviceAdded { device } if device.id() == id(1)
        ));
    }

    #[test]
    fn status_events_are_not_recorded() {
        let net = Network::new(id(0));
        let recorder = ChangeRecorder::attach(net.bus());
        net.bus().publish(ModelEvent::StatusChanged {
            target: crate::event::StatusTarget::Device(id(0)),
            old: SyncStatus::Synced,
            new: SyncStatus::Changed,
        });
        assert!(recorder.is_empty());
    }

    #[test]
    fn pause_and_take() {
        let mut net = Network::new(id(0));
        let recorder = ChangeRecorder::attach(net.bus());

        recorder.pause();
        net.add_scene("Ignored");
        assert!(recorder.is_empty());

        recorder.resume();
        net.add_scene("Kept");
        let taken = recorder.take();
        assert_eq!(taken.len(), 1);
        assert!(recorder.is_empty());
    }

    #[test]
    fn dropping_the_recorder_unsubscribes() {
        let mut net = Network::new(id(0));
        let recorder = ChangeRecorder::attach(net.bus());
        drop(recorder);
        net.add_scene("Nobody listens");
        assert!(format!("{:?}", net.bus()).contains("subscribers: 0"));
    }
}

// ── Engine facade ──
//
// Bundles one `Network` with the collaborators that usually travel with
// it: a change recorder, a sync queue and (optionally) the trigger that
// feeds edits into that queue.

use std::sync::Arc;

use tracing::info;

use crate::changes::{ChangeLog, ChangeRecorder, ChangeReplayer, ReplaySummary};
use crate::config::EngineConfig;
use crate::driver::PhysicalDevice;
use crate::error::CoreError;
use crate::model::DeviceId;
use crate::network::Network;
use crate::scheduler::{JobHandle, JobRequest, JobScheduler, RunSummary, SyncQueue, SyncTrigger};
use crate::sync::SyncKind;

pub struct Engine {
    config: EngineConfig,
    network: Network,
    recorder: ChangeRecorder,
    queue: Arc<SyncQueue>,
    trigger: Option<SyncTrigger>,
}

impl Engine {
    /// A fresh network holding only the configured hub.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_network(config.clone(), Network::new(config.hub))
    }

    /// Load a saved network.
    pub fn load(config: EngineConfig, json: &str) -> Result<Self, CoreError> {
        let network = Network::from_json(json)?;
        if network.hub_id() != config.hub {
            return Err(CoreError::ValidationFailed {
                message: format!(
                    "saved network belongs to hub {}, configuration says {}",
                    network.hub_id(),
                    config.hub
                ),
            });
        }
        Ok(Self::with_network(config, network))
    }

    fn with_network(config: EngineConfig, network: Network) -> Self {
        let recorder = ChangeRecorder::attach(network.bus());
        if !config.record_changes {
            recorder.pause();
        }
        let queue = Arc::new(SyncQueue::new(config.max_retries));
        let trigger = config
            .auto_sync
            .then(|| SyncTrigger::attach(network.bus(), Arc::clone(&queue)));
        info!(
            hub = %config.hub,
            devices = network.devices().len(),
            auto_sync = config.auto_sync,
            "engine ready"
        );
        Self {
            config,
            network,
            recorder,
            queue,
            trigger,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn recorder(&self) -> &ChangeRecorder {
        &self.recorder
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn auto_sync(&self) -> bool {
        self.trigger.is_some()
    }

    pub fn schedule_sync(&self, device: DeviceId, kind: SyncKind) -> JobHandle {
        self.queue.schedule(JobRequest::new(device, kind))
    }

    /// Queue a pass of `kind` for every device that needs one.
    pub fn schedule_all(&self, kind: SyncKind) -> Vec<JobHandle> {
        self.network
            .devices_needing_sync()
            .into_iter()
            .map(|device| self.schedule_sync(device, kind))
            .collect()
    }

    /// Drain the queue against `driver`.
    pub async fn run_pending<D: PhysicalDevice>(&mut self, driver: &D) -> RunSummary {
        self.queue.run_pending(&mut self.network, driver).await
    }

    /// Everything recorded since the last call.
    pub fn take_changes(&self) -> ChangeLog {
        self.recorder.take()
    }

    /// Merge another session's edits into this network.
    pub fn merge(&mut self, log: &ChangeLog) -> ReplaySummary {
        ChangeReplayer::replay(log, &mut self.network)
    }

    /// JSON form of the network, for persistence.
    pub fn snapshot(&self) -> Result<String, CoreError> {
        self.network.to_json()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("devices", &self.network.devices().len())
            .field("recorder", &self.recorder)
            .field("queue", &self.queue)
            .field("auto_sync", &self.auto_sync())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DeviceKind, LinkRecord, SyncStatus};
    use crate::sim::{SimulatedDevice, SimulatedNetwork};

    fn id(n: u8) -> DeviceId {
        DeviceId::new([0x80, 0x00, n])
    }

    #[test]
    fn load_rejects_a_foreign_hub() {
        let json = Network::new(id(0)).to_json().unwrap();
        assert!(Engine::load(EngineConfig::for_hub(id(0)), &json).is_ok());
        assert!(matches!(
            Engine::load(EngineConfig::for_hub(id(9)), &json),
            Err(CoreError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn recording_can_start_paused() {
        let config = EngineConfig {
            record_changes: false,
            ..EngineConfig::for_hub(id(0))
        };
        let mut engine = Engine::new(config);
        engine.network_mut().add_scene("Quiet");
        assert!(engine.take_changes().is_empty());
    }

    #[tokio::test]
    async fn auto_sync_writes_edits() {
        let config = EngineConfig {
            auto_sync: true,
            ..EngineConfig::for_hub(id(0))
        };
        let mut engine = Engine::new(config);
        let sim = SimulatedNetwork::default();
        sim.insert(id(0), SimulatedDevice::hub());
        sim.insert(id(1), SimulatedDevice::new());

        engine
            .network_mut()
            .add_device(id(1), DeviceKind::Relay)
            .unwrap()
            .with_links(|t| t.add_record(LinkRecord::controller(id(0), 1, [3, 0, 1])));
        assert_eq!(engine.queue().len(), 1);

        let summary = engine.run_pending(&sim).await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(sim.links(id(1)).len(), 1);
        assert_eq!(
            engine.network().device(id(1)).unwrap().links().status(),
            SyncStatus::Synced
        );
    }

    #[test]
    fn changes_flow_between_engines() {
        let config = EngineConfig::for_hub(id(0));
        let mut a = Engine::new(config.clone());
        let mut b = Engine::load(config, &a.snapshot().unwrap()).unwrap();

        a.network_mut().add_device(id(1), DeviceKind::Dimmer).unwrap();
        let log = a.take_changes();
        let summary = b.merge(&log);
        assert_eq!(summary.skipped, 0);
        assert!(b.network().device(id(1)).is_some());
        // Merged edits are not recorded again.
        assert!(b.take_changes().is_empty());
    }
}

#![allow(clippy::unwrap_used)]
// Read/write passes against simulated devices, end to end through the
// public `Network` API.

use hubsync_core::sim::{SimulatedDevice, SimulatedNetwork};
use hubsync_core::{DeviceId, DeviceKind, LinkRecord, Network, SyncKind, SyncStatus};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

// ── Helpers ─────────────────────────────────────────────────────────

fn id(n: u8) -> DeviceId {
    DeviceId::new([0x3A, 0x10, n])
}

const HUB: u8 = 0;
const DIMMER: u8 = 1;

fn network_with(physical: Vec<LinkRecord>) -> (Network, SimulatedNetwork) {
    let mut net = Network::new(id(HUB));
    net.add_device(id(DIMMER), DeviceKind::Dimmer).unwrap();
    let sim = SimulatedNetwork::new(3);
    sim.insert(id(HUB), SimulatedDevice::hub());
    sim.insert(id(DIMMER), SimulatedDevice::new().with_links(physical));
    (net, sim)
}

fn content(records: &[LinkRecord]) -> Vec<(DeviceId, u8, [u8; 3], bool)> {
    records
        .iter()
        .map(|r| (r.dest(), r.group(), r.data(), r.is_in_use()))
        .collect()
}

// ── Device tables ───────────────────────────────────────────────────

#[tokio::test]
async fn edited_slot_is_written_and_untouched_slot_is_left_alone() {
    let stale = LinkRecord::controller(id(HUB), 1, [3, 0, 1]);
    let kept = LinkRecord::responder(id(HUB), 1, [0xFF, 0x1F, 1]);
    let (mut net, sim) = network_with(vec![stale.clone(), kept.clone()]);
    let cancel = CancellationToken::new();

    assert!(net.read_device(id(DIMMER), &sim, &cancel, false).await.unwrap());
    let edited = LinkRecord::controller(id(HUB), 2, [3, 0, 2]);
    let device = net.device_mut(id(DIMMER)).unwrap();
    let old = device.links().get(0).unwrap().clone();
    assert!(device.with_links(|t| t.replace_record(&old, edited.clone())));
    let edited_uid = device.links().get(0).unwrap().uid();
    assert_eq!(device.links().status(), SyncStatus::Changed);

    let writes = sim.write_count();
    assert!(net.write_device(id(DIMMER), &sim, &cancel, false).await.unwrap());
    assert_eq!(sim.write_count(), writes + 1);
    assert_eq!(content(&sim.links(id(DIMMER))), content(&[edited, kept]));

    let links = net.device(id(DIMMER)).unwrap().links();
    assert_eq!(links.status(), SyncStatus::Synced);
    assert_eq!(links.get(0).unwrap().uid(), edited_uid);
    assert!(links.stored_records().iter().all(|r| r.status().is_synced()));
}

#[tokio::test]
async fn second_write_pass_is_a_no_op() {
    let (mut net, sim) = network_with(Vec::new());
    let cancel = CancellationToken::new();
    net.device_mut(id(DIMMER)).unwrap().with_links(|t| {
        t.add_record(LinkRecord::responder(id(HUB), 1, [0xFF, 0, 1]));
        t.add_record(LinkRecord::responder(id(HUB), 2, [0x80, 0, 2]));
    });

    assert!(net.write_device(id(DIMMER), &sim, &cancel, false).await.unwrap());
    assert_eq!(sim.links(id(DIMMER)).len(), 2);

    let (reads, writes) = (sim.read_count(), sim.write_count());
    assert!(net.write_device(id(DIMMER), &sim, &cancel, false).await.unwrap());
    assert_eq!((sim.read_count(), sim.write_count()), (reads, writes));
}

#[tokio::test]
async fn forced_read_adopts_external_edits() {
    let original = LinkRecord::responder(id(HUB), 1, [0xFF, 0, 1]);
    let (mut net, sim) = network_with(vec![original.clone()]);
    let cancel = CancellationToken::new();
    assert!(net.read_device(id(DIMMER), &sim, &cancel, false).await.unwrap());

    // Someone reprogrammed the device behind our back.
    let external = original.with_data([0x40, 0, 1]);
    sim.set_links(id(DIMMER), vec![external.clone()]);

    assert!(net.read_device(id(DIMMER), &sim, &cancel, true).await.unwrap());
    let links = net.device(id(DIMMER)).unwrap().links();
    assert_eq!(content(links.stored_records()), content(&[external]));
    assert_eq!(links.status(), SyncStatus::Synced);
}

#[tokio::test]
async fn unreachable_device_keeps_pending_edits() {
    let (mut net, sim) = network_with(Vec::new());
    let cancel = CancellationToken::new();
    net.device_mut(id(DIMMER))
        .unwrap()
        .with_links(|t| t.add_record(LinkRecord::responder(id(HUB), 1, [0xFF, 0, 1])));
    sim.set_reachable(id(DIMMER), false);

    assert!(!net.write_device(id(DIMMER), &sim, &cancel, false).await.unwrap());
    assert_eq!(sim.write_count(), 0);
    assert_eq!(
        net.device(id(DIMMER)).unwrap().links().active_records().count(),
        1
    );

    sim.set_reachable(id(DIMMER), true);
    assert!(net.write_device(id(DIMMER), &sim, &cancel, false).await.unwrap());
    assert_eq!(sim.links(id(DIMMER)).len(), 1);
}

// ── Hub table ───────────────────────────────────────────────────────

#[tokio::test]
async fn hub_records_are_added_and_deleted_by_identity() {
    let (mut net, sim) = network_with(Vec::new());
    let cancel = CancellationToken::new();
    let link = LinkRecord::controller(id(DIMMER), 1, [0, 0, 0]);
    net.device_mut(id(HUB))
        .unwrap()
        .with_links(|t| t.add_record(link.clone()));

    assert!(net.write_device(id(HUB), &sim, &cancel, false).await.unwrap());
    assert_eq!(content(&sim.links(id(HUB))), content(std::slice::from_ref(&link)));

    let hub = net.device_mut(id(HUB)).unwrap();
    let current = hub.links().active_records().next().unwrap().clone();
    assert!(hub.with_links(|t| t.remove_record(&current)));
    assert_eq!(hub.links().status(), SyncStatus::Changed);

    assert!(net.write_device(id(HUB), &sim, &cancel, false).await.unwrap());
    assert!(sim.links(id(HUB)).iter().all(|r| !r.is_in_use()));
    let hub = net.device(id(HUB)).unwrap();
    assert!(hub.links().is_empty());
    assert_eq!(hub.links().status(), SyncStatus::Synced);

    let revision = hub.links().revision();
    let (reads, writes) = (sim.read_count(), sim.write_count());
    assert!(net.sync_device(id(HUB), SyncKind::Full, &sim, &cancel, true).await.unwrap());
    assert_eq!(sim.write_count(), writes);
    assert!(sim.read_count() > reads);
    assert_eq!(net.device(id(HUB)).unwrap().links().revision(), revision);
}

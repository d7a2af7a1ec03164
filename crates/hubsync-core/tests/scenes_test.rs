#![allow(clippy::unwrap_used)]
// Scene expansion through the public API, and a full sync of the
// expanded records to simulated devices.

use hubsync_core::sim::{SimulatedDevice, SimulatedNetwork};
use hubsync_core::{
    DeviceId, DeviceKind, Engine, EngineConfig, ExpandSummary, LinkRecord, LinkRole, Network,
    SceneId, SceneMember, SyncKind,
};
use pretty_assertions::assert_eq;

// ── Helpers ─────────────────────────────────────────────────────────

fn id(n: u8) -> DeviceId {
    DeviceId::new([0x1F, 0x2E, n])
}

const KEYPAD: u8 = 2;
const DIMMER: u8 = 3;

fn network() -> Network {
    let mut net = Network::new(id(0));
    net.add_device(id(KEYPAD), DeviceKind::Keypad).unwrap();
    net.add_device(id(DIMMER), DeviceKind::Dimmer).unwrap();
    net
}

fn active(net: &Network, device: u8) -> Vec<LinkRecord> {
    net.device(id(device))
        .unwrap()
        .links()
        .active_records()
        .cloned()
        .collect()
}

fn evening(net: &mut Network) -> (SceneId, SceneMember) {
    let scene = net.add_scene("Evening");
    net.add_scene_member(scene, SceneMember::controller(id(KEYPAD), 1))
        .unwrap();
    let responder = SceneMember::responder(id(DIMMER), 1, 0xC0, 0x1C);
    net.add_scene_member(scene, responder).unwrap();
    (scene, responder)
}

// ── Expansion ───────────────────────────────────────────────────────

#[test]
fn members_become_paired_link_records() {
    let mut net = network();
    let (scene, _) = evening(&mut net);

    let keypad = active(&net, KEYPAD);
    assert_eq!(keypad.len(), 1);
    assert_eq!(keypad[0].role(), LinkRole::Controller);
    assert_eq!(keypad[0].dest(), id(DIMMER));
    assert_eq!(keypad[0].scene(), Some(scene));

    let dimmer = active(&net, DIMMER);
    assert_eq!(dimmer.len(), 1);
    assert_eq!(dimmer[0].role(), LinkRole::Responder);
    assert_eq!(dimmer[0].dest(), id(KEYPAD));
    assert_eq!(dimmer[0].data(), [0xC0, 0x1C, 1]);
}

#[test]
fn expanding_again_changes_nothing() {
    let mut net = network();
    let (scene, _) = evening(&mut net);
    let before = (active(&net, KEYPAD), active(&net, DIMMER));

    assert_eq!(net.expand_scene(scene).unwrap(), ExpandSummary::default());
    assert_eq!((active(&net, KEYPAD), active(&net, DIMMER)), before);
}

#[test]
fn removed_member_takes_its_records_along() {
    let mut net = network();
    let (scene, responder) = evening(&mut net);

    let summary = net.remove_scene_member(scene, &responder).unwrap();
    assert_eq!(summary.deleted, 2);
    assert!(active(&net, KEYPAD).is_empty());
    assert!(active(&net, DIMMER).is_empty());

    // Re-adding reuses the freed slots.
    let summary = net.add_scene_member(scene, responder).unwrap();
    assert_eq!(summary.added, 2);
    assert_eq!(active(&net, DIMMER).len(), 1);
    assert_eq!(net.device(id(DIMMER)).unwrap().links().stored_len(), 1);
}

#[test]
fn changed_level_updates_in_place() {
    let mut net = network();
    let (scene, responder) = evening(&mut net);
    let before = active(&net, DIMMER)[0].uid();

    let brighter = SceneMember::responder(id(DIMMER), 1, 0xFF, 0x1C);
    let summary = net.replace_scene_member(scene, &responder, brighter).unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.added, 0);

    let dimmer = active(&net, DIMMER);
    assert_eq!(dimmer.len(), 1);
    assert_eq!(dimmer[0].data(), [0xFF, 0x1C, 1]);
    assert_ne!(dimmer[0].uid(), before);
}

#[test]
fn same_device_members_use_follow_masks() {
    let mut net = network();
    let scene = net.add_scene("All off");
    net.add_scene_member(scene, SceneMember::controller(id(KEYPAD), 1))
        .unwrap();
    let summary = net
        .add_scene_member(scene, SceneMember::responder(id(KEYPAD), 3, 0x00, 0x00))
        .unwrap();
    assert_eq!(summary.follows_set, 1);
    assert!(active(&net, KEYPAD).is_empty());

    let channel = net.device(id(KEYPAD)).unwrap().channel(1).unwrap();
    assert_eq!(channel.follow_mask(), 0b100);
    assert_eq!(channel.follow_off_mask(), 0b100);

    net.remove_scene(scene).unwrap();
    let channel = net.device(id(KEYPAD)).unwrap().channel(1).unwrap();
    assert_eq!(channel.follow_mask(), 0);
}

#[test]
fn duplicate_members_collapse_to_one_record() {
    let mut net = network();
    let (scene, _) = evening(&mut net);
    net.add_scene_member(scene, SceneMember::responder(id(DIMMER), 1, 0x80, 0x1C))
        .unwrap();

    net.remove_duplicate_members(scene).unwrap();
    assert_eq!(net.scene(scene).unwrap().members().len(), 2);
    assert_eq!(active(&net, DIMMER).len(), 1);
    assert_eq!(active(&net, DIMMER)[0].data(), [0xC0, 0x1C, 1]);
}

// ── Sync ────────────────────────────────────────────────────────────

#[tokio::test]
async fn expanded_scene_reaches_the_devices() {
    let mut engine = Engine::new(EngineConfig::for_hub(id(0)));
    let sim = SimulatedNetwork::default();
    sim.insert(id(0), SimulatedDevice::hub());
    sim.insert(id(KEYPAD), SimulatedDevice::new());
    sim.insert(id(DIMMER), SimulatedDevice::new());

    let net = engine.network_mut();
    net.add_device(id(KEYPAD), DeviceKind::Keypad).unwrap();
    net.add_device(id(DIMMER), DeviceKind::Dimmer).unwrap();
    evening(net);

    engine.schedule_all(SyncKind::Write);
    let summary = engine.run_pending(&sim).await;
    assert_eq!(summary.failed, 0);

    let on_keypad = sim.links(id(KEYPAD));
    assert_eq!(on_keypad.len(), 1);
    assert_eq!(on_keypad[0].dest(), id(DIMMER));
    let on_dimmer = sim.links(id(DIMMER));
    assert_eq!(on_dimmer.len(), 1);
    assert_eq!(on_dimmer[0].data(), [0xC0, 0x1C, 1]);
}

//! `hubsync simulate`: one full cycle of the engine against in-memory
//! devices.
//!
//! Reads every device, builds a keypad scene over the dimmers, writes the
//! result back (with optional fault injection), then replays the recorded
//! edits onto a second engine loaded from the pre-edit snapshot.

use serde::Serialize;
use tabled::Tabled;

use hubsync_config::{ConfigError, Profile, profile_to_engine_config};
use hubsync_core::sim::{SimulatedDevice, SimulatedNetwork};
use hubsync_core::{
    DeviceId, DeviceKind, DeviceProperty, Engine, EngineConfig, LinkRecord, LoadControl, Network,
    ReplaySummary, RunSummary, SceneMember, SyncKind, SyncStatus,
};

use crate::cli::{GlobalOpts, SimulateArgs};
use crate::error::CliError;
use crate::output;

/// Hub used when no profile is configured.
const DEMO_HUB: DeviceId = DeviceId::new([0x44, 0x85, 0x11]);
const KEYPAD: DeviceId = DeviceId::new([0x1A, 0x2B, 0x01]);
const SCENE_GROUP: u8 = 1;
const PRESET_LEVEL: u8 = 0xC0;
const PRESET_RAMP: u8 = 0x1F;

fn dimmer(index: u8) -> DeviceId {
    DeviceId::new([0x1A, 0x2B, 0x10 + index])
}

// ── Report ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Report {
    hub: DeviceId,
    scene: String,
    members: usize,
    read: RunSummary,
    write: RunSummary,
    changes: usize,
    replay: ReplaySummary,
    replica_matches: bool,
    status: SyncStatus,
    devices: Vec<DeviceReport>,
}

#[derive(Debug, Serialize, Tabled)]
struct DeviceReport {
    #[tabled(rename = "Address")]
    address: DeviceId,
    #[tabled(rename = "Kind")]
    kind: DeviceKind,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Status")]
    status: SyncStatus,
    #[tabled(rename = "On level")]
    on_level: String,
    #[tabled(rename = "Links")]
    links: usize,
    #[tabled(rename = "On device")]
    on_device: usize,
}

// ── Handler ──────────────────────────────────────────────────────────

pub async fn handle(args: SimulateArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let mut config = engine_config(global)?;
    if let Some(retries) = args.max_retries {
        config.max_retries = retries;
    }
    if let Some(n) = args.unreachable {
        if n == 0 || n > args.dimmers {
            return Err(CliError::Validation {
                field: "--unreachable".into(),
                reason: format!("expected a dimmer between 1 and {}", args.dimmers),
            });
        }
    }

    let hub = config.hub;
    let sim = SimulatedNetwork::new(config.read_batch_size);
    let mut engine = Engine::new(config);
    populate(&mut engine, &sim, args.dimmers)?;

    // Learn what the devices already hold.
    engine.schedule_all(SyncKind::Read);
    let read = engine.run_pending(&sim).await;
    let baseline = engine.snapshot()?;
    engine.take_changes();

    let scene_name = "Evening";
    let net = engine.network_mut();
    let scene = net.add_scene(scene_name);
    net.add_scene_member(scene, SceneMember::controller(KEYPAD, SCENE_GROUP))?;
    for i in 1..=args.dimmers {
        let level = 0xFF_u8.saturating_sub(i.saturating_mul(0x20));
        net.add_scene_member(scene, SceneMember::responder(dimmer(i), SCENE_GROUP, level, 0x1C))?;
    }
    apply_preset(net.require_device_mut(dimmer(1))?);
    net.require_device_mut(KEYPAD)?
        .with_channel(SCENE_GROUP, |button| apply_preset(button));

    if let Some(n) = args.unreachable {
        sim.set_reachable(dimmer(n), false);
    }
    if args.fail_writes > 0 {
        sim.fail_writes(dimmer(1), args.fail_writes);
    }

    engine.schedule_all(SyncKind::Write);
    let write = engine.run_pending(&sim).await;

    // A second controller instance catches up from the recorded log.
    let log = engine.take_changes();
    let mut replica = Engine::load(engine.config().clone(), &baseline)?;
    let replay = replica.merge(&log);

    let members = engine
        .network()
        .scene(scene)
        .map_or(0, |s| s.members().len());
    let report = Report {
        hub,
        scene: scene_name.to_owned(),
        members,
        read,
        write,
        changes: log.len(),
        replay,
        replica_matches: same_links(engine.network(), replica.network()),
        status: engine.network().status(),
        devices: device_reports(engine.network(), &sim),
    };

    let color = output::should_color(global.color);
    let rendered = output::render_single(
        global.output,
        &report,
        |r| render_text(r, color),
        |r| {
            r.devices
                .iter()
                .map(|d| format!("{} {}", d.address, d.status))
                .collect::<Vec<_>>()
                .join("\n")
        },
    );
    output::print_output(&rendered, global.quiet);
    Ok(())
}

/// Engine settings from the selected profile. Without any profile the
/// demo hub is used with the `[engine]` defaults.
fn engine_config(global: &GlobalOpts) -> Result<EngineConfig, CliError> {
    let cfg = super::load(global)?;
    match cfg.engine_config(global.profile.as_deref()) {
        Ok(config) => Ok(config),
        Err(ConfigError::UnknownProfile { .. }) if global.profile.is_none() => {
            tracing::info!(hub = %DEMO_HUB, "no profile configured, using the demo hub");
            Ok(profile_to_engine_config(&Profile::for_hub(DEMO_HUB), &cfg.engine)?)
        }
        Err(ConfigError::UnknownProfile { name }) => {
            let mut available: Vec<_> = cfg.profiles.keys().cloned().collect();
            available.sort();
            Err(CliError::ProfileNotFound {
                name,
                available: if available.is_empty() {
                    "(none)".into()
                } else {
                    available.join(", ")
                },
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Physical devices with some pre-existing links, and their logical
/// counterparts (still unread).
fn populate(engine: &mut Engine, sim: &SimulatedNetwork, dimmers: u8) -> Result<(), CliError> {
    let hub = engine.config().hub;
    let hub_links = (1..=dimmers).map(|i| LinkRecord::controller(dimmer(i), 0, [0; 3]));
    sim.insert(hub, SimulatedDevice::hub().with_links(hub_links));
    sim.insert(
        KEYPAD,
        SimulatedDevice::new().with_property(DeviceProperty::OperatingFlags, 0),
    );

    let net = engine.network_mut();
    net.add_device(KEYPAD, DeviceKind::Keypad)?
        .set_display_name(Some("Hall keypad".into()));
    for i in 1..=dimmers {
        sim.insert(
            dimmer(i),
            SimulatedDevice::new()
                .with_links([LinkRecord::responder(hub, 0, [0xFF, 0x1C, 1])])
                .with_property(DeviceProperty::OnLevel, 0xFF)
                .with_property(DeviceProperty::RampRate, 0x1C),
        );
        net.add_device(dimmer(i), DeviceKind::Dimmer)?
            .set_display_name(Some(format!("Dimmer {i}")));
    }
    Ok(())
}

/// Dimmed level with a slow ramp, for a whole load or one keypad button.
fn apply_preset(target: &mut impl LoadControl) {
    target.set_on_level(PRESET_LEVEL);
    target.set_ramp_rate(PRESET_RAMP);
}

fn device_reports(network: &Network, sim: &SimulatedNetwork) -> Vec<DeviceReport> {
    network
        .devices()
        .iter()
        .map(|d| DeviceReport {
            address: d.id(),
            kind: d.kind(),
            name: d.display_name().unwrap_or("-").to_owned(),
            status: d.status(),
            on_level: d
                .on_level()
                .map_or_else(|| "-".to_owned(), |level| format!("{level:#04X}")),
            links: d.links().active_records().count(),
            on_device: sim.links(d.id()).iter().filter(|r| r.is_in_use()).count(),
        })
        .collect()
}

/// Both networks hold the same in-use link content on every device.
fn same_links(a: &Network, b: &Network) -> bool {
    let content = |net: &Network, id: DeviceId| -> Option<Vec<LinkRecord>> {
        net.device(id)
            .map(|d| d.links().active_records().cloned().collect())
    };
    a.scenes().len() == b.scenes().len()
        && a.devices().ids().into_iter().all(|id| {
            match (content(a, id), content(b, id)) {
                (Some(x), Some(y)) => {
                    x.len() == y.len() && x.iter().zip(&y).all(|(l, r)| l.same_content(r))
                }
                _ => false,
            }
        })
}

fn render_text(report: &Report, color: bool) -> String {
    use std::fmt::Write;

    let mut out = output::render_table(&report.devices);
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Scene \"{}\": {} members",
        report.scene, report.members
    );
    for (label, run) in [("Read pass", &report.read), ("Write pass", &report.write)] {
        let _ = writeln!(
            out,
            "{label}: {} succeeded, {} failed, {} retried",
            run.succeeded, run.failed, run.retried
        );
    }
    let _ = writeln!(
        out,
        "Replay: {} changes, {} applied, {} skipped, replica {}",
        report.changes,
        report.replay.applied,
        report.replay.skipped,
        if report.replica_matches {
            "in step"
        } else {
            "diverged"
        }
    );
    let _ = write!(
        out,
        "Network status: {}",
        output::status_label(report.status, color)
    );
    out
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Machine and BMP controller operations against the simulated machine

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use spinn_chip::app::AppState;
use spinn_chip::scp::Command;
use spinn_chip::{Route, RouteSet};
use spinn_driver::{
    BmpConfig, BmpController, ChipConstants, CoreTargets, MachineConfig, MachineController,
    ScpConfig, SimulatedMachine, SpinnError,
};
use spinn_routing::RoutingTableEntry;

const APP: u8 = 30;

fn config() -> MachineConfig {
    MachineConfig::default()
        .with_scp(ScpConfig::default().with_timeout(Duration::from_millis(20)))
        .with_app_start_delay(Duration::ZERO)
        .with_poll_interval(Duration::from_millis(1))
}

fn controller(sim: SimulatedMachine) -> MachineController<SimulatedMachine> {
    MachineController::with_transport(sim, config())
}

fn table(n: u32) -> Vec<RoutingTableEntry> {
    (0..n)
        .map(|i| {
            let route = if i % 2 == 0 { Route::NORTH } else { Route::core(1 + i as u8 % 16).unwrap() };
            RoutingTableEntry::new(RouteSet::single(route), i << 4, 0xFFFF_FFF0)
        })
        .collect()
}

fn targets() -> CoreTargets {
    BTreeMap::from([
        ((0, 0), BTreeSet::from([1, 2])),
        ((1, 0), BTreeSet::from([3])),
        ((1, 1), BTreeSet::from([1, 2])),
    ])
}

// ── Routing tables ───────────────────────────────────────────────────────────

#[test]
fn routing_table_round_trip() {
    let mut mc = controller(SimulatedMachine::new(2, 2));
    let entries = table(10);
    mc.load_routing_table_entries(1, 1, &entries, APP).unwrap();

    let live: Vec<_> = mc
        .get_routing_table_entries(1, 1)
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(live.len(), 10);
    for (loaded, expected) in live.iter().zip(&entries) {
        assert_eq!(loaded.entry, *expected);
        assert_eq!(loaded.app_id, APP);
    }

    // Other chips are untouched.
    assert!(mc.get_routing_table_entries(0, 0).unwrap().iter().all(Option::is_none));

    mc.clear_routing_table_entries(1, 1, APP).unwrap();
    assert!(mc.transport().router_entries(1, 1).is_empty());
}

#[test]
fn routing_tables_for_many_chips() {
    let mut mc = controller(SimulatedMachine::new(2, 2));
    let tables = BTreeMap::from([((0, 0), table(3)), ((1, 0), table(5)), ((0, 1), Vec::new())]);
    mc.load_routing_tables(&tables, APP).unwrap();

    assert_eq!(mc.transport().router_entries(0, 0).len(), 3);
    assert_eq!(mc.transport().router_entries(1, 0).len(), 5);
    assert!(mc.transport().router_entries(0, 1).is_empty());
    // Nothing is sent for an empty table.
    assert_eq!(mc.transport().count_commands(Command::Router), 2);
}

#[test]
fn full_router_is_a_capacity_error() {
    let small = ChipConstants {
        router_entries: 8,
        ..ChipConstants::default()
    };
    let sim = SimulatedMachine::new(1, 1).with_chip_constants(small);
    let mut mc = MachineController::with_transport(sim, config().with_chip_constants(small));

    mc.load_routing_table_entries(0, 0, &table(4), APP).unwrap();
    let err = mc.load_routing_table_entries(0, 0, &table(4), APP + 1).unwrap_err();
    assert!(matches!(err, SpinnError::RouterAllocation { count: 4, .. }), "{err}");
    assert!(err.is_capacity());

    let err = mc.load_routing_table_entries(0, 0, &table(9), APP).unwrap_err();
    assert!(matches!(err, SpinnError::RouterAllocation { count: 9, .. }));
}

// ── Application loading ──────────────────────────────────────────────────────

#[test]
fn load_application_starts_cores() {
    let mut mc = controller(SimulatedMachine::new(2, 2));
    let aplx = vec![0xA5u8; 1000];
    mc.load_application(&targets(), &aplx, APP, false).unwrap();

    let sim = mc.transport();
    assert_eq!(sim.core_state(0, 0, 1), Some((APP, AppState::Run)));
    assert_eq!(sim.core_state(0, 0, 2), Some((APP, AppState::Run)));
    assert_eq!(sim.core_state(1, 0, 3), Some((APP, AppState::Run)));
    assert_eq!(sim.core_state(1, 1, 2), Some((APP, AppState::Run)));
    assert_eq!(sim.core_state(0, 1, 1), None);
    assert_eq!(sim.core_state(1, 0, 1), None);
    // 1000 bytes in 256-byte blocks.
    assert_eq!(sim.count_commands(Command::FloodFillData), 4);
}

#[test]
fn load_application_can_leave_cores_waiting() {
    let mut mc = controller(SimulatedMachine::new(2, 2));
    mc.load_application(&targets(), &[1, 2, 3], APP, true).unwrap();
    assert_eq!(mc.count_cores_in_state(AppState::Wait, APP).unwrap(), 5);
    assert_eq!(mc.count_cores_in_state(AppState::Run, APP).unwrap(), 0);

    mc.send_signal(spinn_chip::app::AppSignal::Start, APP).unwrap();
    let running = mc
        .wait_for_cores_to_reach_state(AppState::Run, 5, APP, Some(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(running, 5);
}

#[test]
fn load_application_retries_failed_fills() {
    let mut mc = controller(SimulatedMachine::new(2, 2).with_failed_loads(2));
    mc.load_application(&targets(), &[0; 64], APP, false).unwrap();
    assert_eq!(mc.transport().count_commands(Command::FloodFillData), 3);
    assert_eq!(mc.count_cores_in_state(AppState::Run, APP).unwrap(), 5);
}

#[test]
fn load_application_gives_up() {
    let mut mc = controller(SimulatedMachine::new(2, 2).with_failed_loads(10));
    let err = mc.load_application(&targets(), &[0; 64], APP, false).unwrap_err();
    assert!(
        matches!(err, SpinnError::LoadingFailed { loaded: 0, expected: 5, attempts: 3 }),
        "{err}"
    );
    assert_eq!(mc.transport().count_commands(Command::Signal), 3);
}

// ── Scoped applications ──────────────────────────────────────────────────────

#[test]
fn with_application_tears_down_on_error() {
    let mut mc = controller(SimulatedMachine::new(2, 2));
    let result: spinn_driver::Result<()> = mc.with_application(APP, |mc| {
        mc.load_routing_table_entries(0, 0, &table(3), APP)?;
        mc.load_routing_table_entries(1, 1, &table(2), APP)?;
        mc.load_application(&targets(), &[0; 64], APP, false)?;
        Err(SpinnError::invalid_argument("simulation diverged"))
    });

    assert!(matches!(result, Err(SpinnError::InvalidArgument { .. })));
    let sim = mc.transport();
    assert!(sim.router_entries(0, 0).is_empty());
    assert!(sim.router_entries(1, 1).is_empty());
    assert_eq!(sim.core_state(0, 0, 1), None);
}

#[test]
fn with_application_returns_value_and_stops() {
    let mut mc = controller(SimulatedMachine::new(1, 1));
    let value = mc
        .with_application(APP, |mc| {
            mc.load_routing_table_entries(0, 0, &table(2), APP)?;
            Ok(42)
        })
        .unwrap();
    assert_eq!(value, 42);
    assert!(mc.transport().router_entries(0, 0).is_empty());
    assert_eq!(mc.transport().count_commands(Command::Signal), 1);
}

#[test]
fn with_application_tears_down_on_panic() {
    let mut mc = controller(SimulatedMachine::new(2, 2));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        mc.with_application(APP, |mc| -> spinn_driver::Result<()> {
            mc.load_routing_table_entries(1, 0, &table(4), APP)?;
            mc.load_application(&targets(), &[0; 64], APP, false)?;
            panic!("host model crashed");
        })
    }));

    assert!(outcome.is_err());
    let sim = mc.transport();
    assert!(sim.router_entries(1, 0).is_empty());
    assert_eq!(sim.core_state(1, 1, 2), None);
}

#[test]
fn with_application_leaves_other_apps_alone() {
    let mut mc = controller(SimulatedMachine::new(1, 1));
    mc.load_routing_table_entries(0, 0, &table(2), APP + 1).unwrap();
    mc.with_application(APP, |mc| mc.load_routing_table_entries(0, 0, &table(3), APP))
        .unwrap();
    let left = mc.transport().router_entries(0, 0);
    assert_eq!(left.len(), 2);
    assert!(left.iter().all(|(_, r)| r.app_id() == APP + 1));
}

// ── BMP ──────────────────────────────────────────────────────────────────────

fn bmp() -> BmpController<SimulatedMachine> {
    let mut bmp = BmpController::new(BmpConfig {
        scp: ScpConfig::default().with_timeout(Duration::from_millis(20)),
        post_power_on_delay: Duration::ZERO,
    });
    bmp.add_transport((0, 0, None), SimulatedMachine::bmp());
    bmp
}

#[test]
fn bmp_power() {
    let mut bmp = bmp();
    bmp.set_power(true, 0, 0, &[0, 1, 2], Duration::ZERO).unwrap();
    assert_eq!(bmp.transport(0, 0, 0).unwrap().powered_boards(), 0b111);

    bmp.set_power(false, 0, 0, &[1], Duration::from_millis(100)).unwrap();
    assert_eq!(bmp.transport(0, 0, 0).unwrap().powered_boards(), 0b101);
}

#[test]
fn bmp_leds() {
    let mut bmp = bmp();
    bmp.set_led(&[0, 1], Some(true), 0, 0, &[0]).unwrap();
    assert_eq!(bmp.transport(0, 0, 0).unwrap().bmp_leds(), 0b1111);
    bmp.set_led(&[2], Some(false), 0, 0, &[0]).unwrap();
    assert_eq!(bmp.transport(0, 0, 0).unwrap().bmp_leds(), 0b10_0000);
}

//! Scenario: a long-running `SERVICE` goes HALTED -> READY -> RUNNING,
//! asserts its provided condition, then a manual stop drives it back down
//! through STOPPING to HALTED with the condition cleared.

#[path = "common/mod.rs"]
mod common;

use std::thread;
use std::time::Duration;

use systemg_core::cond::CondState;
use systemg_core::service::{Service, ServiceKind, ServiceState};

use common::{is_alive, Harness};

#[test]
fn daemon_starts_provides_condition_and_stops_cleanly() {
    let mut harness = Harness::new();

    let mut svc = Service::new("sleep", "", ServiceKind::Service);
    svc.argv = vec!["5".to_string()];
    svc.runlevels = svc.runlevels.with_level(2);
    svc.provides = Some(svc.default_provided_key());
    let provided = svc.provides.clone().unwrap();
    let key = harness.registry.register(svc);

    harness.step(&key);

    let running = harness.registry.get(&key).unwrap();
    assert_eq!(running.runtime.state, ServiceState::Running);
    let pid = running.runtime.pid.expect("daemon should have a live pid");
    assert!(pid.as_raw() > 1);
    assert!(is_alive(pid));
    assert_eq!(harness.cond_store.get(&provided), CondState::On);

    // Manual stop: an admin-equivalent action disables `enabled` without
    // touching runlevels or conditions.
    harness.registry.get_mut(&key).unwrap().runtime.manual_stop = true;
    harness.step(&key);
    assert_eq!(harness.registry.get(&key).unwrap().runtime.state, ServiceState::Stopping);

    // The child was sent SIGTERM by `step`'s stop request; give it a moment
    // to actually exit before reaping.
    thread::sleep(Duration::from_millis(200));
    harness.pump();

    let halted = harness.registry.get(&key).unwrap();
    assert_eq!(halted.runtime.state, ServiceState::Halted);
    assert!(halted.runtime.pid.is_none());
    assert_eq!(harness.cond_store.get(&provided), CondState::Off);
    assert!(!is_alive(pid));
}

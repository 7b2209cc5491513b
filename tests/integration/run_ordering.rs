//! Scenario: `RUN` services block inside `start()` until the child exits,
//! so a single `step` call carries them all the way to `DONE`; `TASK`
//! services start and complete asynchronously, reaped on the next
//! `monitor()` pass (spec.md section 3, service kinds).

#[path = "common/mod.rs"]
mod common;

use std::thread;
use std::time::Duration;

use systemg_core::service::{Service, ServiceKind, ServiceState};

use common::Harness;

#[test]
fn run_kind_completes_synchronously_within_one_step() {
    let mut harness = Harness::new();

    let mut svc = Service::new("true", "", ServiceKind::Run);
    svc.runlevels = svc.runlevels.with_level(2);
    let key = harness.registry.register(svc);

    // A single `step` call should drive RUN all the way to DONE: start()
    // blocks on waitpid internally, so there's no intermediate RUNNING
    // state visible to the caller.
    harness.step(&key);

    let done = harness.registry.get(&key).unwrap();
    assert_eq!(done.runtime.state, ServiceState::Done);
    assert_eq!(done.runtime.once, 1);
    assert!(done.runtime.started);
    assert!(done.runtime.pid.is_none());
}

#[test]
fn task_kind_completes_asynchronously() {
    let mut harness = Harness::new();
    let marker = harness.runtime_dir().join("task-ran");

    let mut svc = Service::new("touch", "", ServiceKind::Task);
    svc.argv = vec![marker.to_string_lossy().into_owned()];
    svc.runlevels = svc.runlevels.with_level(2);
    let key = harness.registry.register(svc);

    harness.step(&key);
    // Unlike RUN, TASK's start() does not block: the child may still be
    // mid-exec right after step() returns.
    common::wait_for_path(&marker);

    // Give the short-lived `touch` a moment to actually exit, then reap.
    thread::sleep(Duration::from_millis(100));
    harness.pump();

    let done = harness.registry.get(&key).unwrap();
    assert_eq!(done.runtime.state, ServiceState::Done);
    assert_eq!(done.runtime.once, 1);
}

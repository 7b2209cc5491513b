//! Scenario: a condition flipping to FLUX pauses a running service in place
//! (`SIGSTOP`) and flipping back to ON resumes the *same* process, no new
//! fork (spec.md section 4.3, `WAITING` state).

#[path = "common/mod.rs"]
mod common;

use std::fs;

use systemg_core::cond::{CondExpr, CondKey, CondState};
use systemg_core::service::{Service, ServiceKind, ServiceState};

use common::{is_alive, Harness};

#[test]
fn flux_pauses_then_resumes_same_pid() {
    let mut harness = Harness::new();
    let cond_key = CondKey::parse("net/eth0/up").unwrap();

    let mut svc = Service::new("sleep", "", ServiceKind::Service);
    svc.argv = vec!["5".to_string()];
    svc.runlevels = svc.runlevels.with_level(2);
    svc.cond_expr = CondExpr::parse("net/eth0/up").unwrap();
    let key = harness.registry.register(svc);

    // Not yet satisfied: stays in READY.
    harness.step(&key);
    assert_eq!(harness.registry.get(&key).unwrap().runtime.state, ServiceState::Ready);

    harness.cond_store.set(&cond_key, CondState::On).unwrap();
    harness.step(&key);
    let running = harness.registry.get(&key).unwrap();
    assert_eq!(running.runtime.state, ServiceState::Running);
    let pid = running.runtime.pid.expect("running service has a pid");
    assert!(is_alive(pid));

    harness.cond_store.set(&cond_key, CondState::Flux).unwrap();
    harness.step(&key);
    let waiting = harness.registry.get(&key).unwrap();
    assert_eq!(waiting.runtime.state, ServiceState::Waiting);
    assert_eq!(waiting.runtime.pid, Some(pid), "pausing never forks a new child");
    assert!(is_alive(pid), "a stopped process is still alive, just not scheduled");
    assert_eq!(proc_state(pid.as_raw()), 'T', "SIGSTOP should land the process in stopped state");

    harness.cond_store.set(&cond_key, CondState::On).unwrap();
    harness.step(&key);
    let resumed = harness.registry.get(&key).unwrap();
    assert_eq!(resumed.runtime.state, ServiceState::Running);
    assert_eq!(resumed.runtime.pid, Some(pid), "resuming never forks a new child");
    assert_ne!(proc_state(pid.as_raw()), 'T');

    // Clean up: drop the condition to stop it rather than leaking a sleep.
    harness.cond_store.set(&cond_key, CondState::Off).unwrap();
    harness.step(&key);
    std::thread::sleep(std::time::Duration::from_millis(200));
    harness.pump();
}

/// Read the single-character process state field out of `/proc/<pid>/stat`.
fn proc_state(pid: i32) -> char {
    let contents = fs::read_to_string(format!("/proc/{pid}/stat")).expect("read /proc/<pid>/stat");
    // Fields after the parenthesized comm name are space separated; state is
    // the first one, but comm itself may contain spaces, so split on the
    // closing paren instead of by whitespace from the start.
    let after_comm = contents.rsplit_once(')').expect("stat has a comm field").1;
    after_comm.trim_start().chars().next().expect("state char")
}

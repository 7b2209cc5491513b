//! Scenario: a child that ignores `SIGTERM` survives the graceful stop
//! request, so the kill-timer fires and escalates to `SIGKILL` on the
//! whole process group (spec.md section 4.3 / 7, "Kill escalation").

#[path = "common/mod.rs"]
mod common;

use std::thread;
use std::time::Duration;

use systemg_core::service::{Service, ServiceKind, ServiceState};

use common::{is_alive, Harness};

#[test]
fn sigterm_ignoring_child_is_escalated_to_sigkill() {
    let mut harness = Harness::new();

    let mut svc = Service::new("sh", "", ServiceKind::Service);
    svc.argv = vec!["-c".to_string(), "trap '' TERM; sleep 30".to_string()];
    svc.runlevels = svc.runlevels.with_level(2);
    svc.kill_delay = Duration::from_secs(3);
    let key = harness.registry.register(svc);

    harness.step(&key);
    let running = harness.registry.get(&key).unwrap();
    assert_eq!(running.runtime.state, ServiceState::Running);
    let pid = running.runtime.pid.expect("running service has a pid");
    // Let the trap actually install before we send SIGTERM.
    thread::sleep(Duration::from_millis(100));

    harness.registry.get_mut(&key).unwrap().runtime.manual_stop = true;
    harness.step(&key);
    assert_eq!(harness.registry.get(&key).unwrap().runtime.state, ServiceState::Stopping);

    // The child ignores SIGTERM, so it's still alive; a real loop would wait
    // out the kill delay, but tests force-expire the timer instead.
    thread::sleep(Duration::from_millis(100));
    assert!(is_alive(pid), "child should still be alive, having ignored SIGTERM");
    harness.fire_timers();

    // SIGKILL cannot be caught; give the kernel a moment to actually reap it.
    thread::sleep(Duration::from_millis(150));
    harness.pump();

    let halted = harness.registry.get(&key).unwrap();
    assert_eq!(halted.runtime.state, ServiceState::Halted);
    assert!(halted.runtime.pid.is_none());
    assert!(!is_alive(pid));
}

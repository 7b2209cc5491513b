//! Black-box end-to-end test of the `sysg-core` binary: a real process,
//! fed a real directive file, driving a task and a service through the
//! real event loop, torn down with a real `SIGTERM`.

#[path = "common/mod.rs"]
mod common;

use std::process::{Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

#[test]
fn binary_runs_services_and_shuts_down_on_sigterm() {
    let home = tempfile::tempdir().expect("tempdir");
    let config_dir = tempfile::tempdir().expect("tempdir");
    let marker = home.path().join("task-ran");

    let directive = format!(
        "service [2] sleep 5 :daemon\ntask [2] touch {} :marker\n",
        marker.display()
    );
    let config_path = config_dir.path().join("services.conf");
    std::fs::write(&config_path, directive).expect("write directive file");

    let bin = env!("CARGO_BIN_EXE_sysg-core");
    let mut child = Command::new(bin)
        .arg(&config_path)
        .env("HOME", home.path())
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn sysg-core");

    common::wait_for_path(&marker);

    let pid = Pid::from_raw(child.id() as i32);
    kill(pid, Signal::SIGTERM).expect("send SIGTERM");

    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    assert!(status.success(), "sysg-core should exit cleanly on SIGTERM, got {status:?}");
}

fn wait_with_timeout(child: &mut std::process::Child, timeout: Duration) -> std::process::ExitStatus {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        if std::time::Instant::now() >= deadline {
            let _ = child.kill();
            panic!("sysg-core did not exit within {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(30));
    }
}


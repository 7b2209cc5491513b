#![allow(dead_code)]

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tempfile::TempDir;

use systemg_core::cond::CondStore;
use systemg_core::collab::Collaborators;
use systemg_core::event_loop::{Reactor, Scheduler, TimerEvent, WorkItem};
use systemg_core::registry::{Registry, ServiceKey};
use systemg_core::service::Runlevel;
use systemg_core::sm::{self, StepCtx};
use systemg_core::supervisor::{self, ForkExecSupervisor};

/// Bundles the pieces a real loop turn would otherwise hold inside
/// `main.rs`'s closures, so scenario tests can drive `sm::step`/`monitor`
/// against real forked children without building a whole `EventLoop`.
pub struct Harness {
    pub registry: Registry,
    pub cond_store: CondStore,
    pub reactor: Reactor,
    pub supervisor: ForkExecSupervisor,
    monitor_collab: Collaborators,
    pub runlevel: Runlevel,
    pub teardown: bool,
    tempdir: TempDir,
}

impl Harness {
    /// A fresh harness rooted at its own tempdir; `runlevel` defaults to 2.
    pub fn new() -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let runtime_dir = tempdir.path().join("run");
        std::fs::create_dir_all(&runtime_dir).expect("create runtime dir");
        Harness {
            registry: Registry::new(),
            cond_store: CondStore::new(&runtime_dir),
            reactor: Reactor::new(),
            supervisor: ForkExecSupervisor::new(Collaborators::defaults(&runtime_dir)),
            monitor_collab: Collaborators::defaults(&runtime_dir),
            runlevel: Runlevel::Numeric(2),
            teardown: false,
            tempdir,
        }
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.tempdir.path().join("run")
    }

    fn ctx(&mut self) -> StepCtx<'_> {
        StepCtx {
            registry: &mut self.registry,
            cond_store: &mut self.cond_store,
            scheduler: &mut self.reactor,
            supervisor: &mut self.supervisor,
            runlevel: self.runlevel,
            teardown: self.teardown,
        }
    }

    /// Drive one service to its fixed point.
    pub fn step(&mut self, key: &ServiceKey) {
        let mut ctx = self.ctx();
        sm::step(key, &mut ctx).expect("step");
    }

    /// Reap any exited children and re-step whatever they belonged to,
    /// exactly as `main.rs` does on `SIGCHLD`.
    pub fn monitor(&mut self) {
        let mut ctx = self.ctx();
        supervisor::monitor(&mut ctx, &*self.monitor_collab.tty, &*self.monitor_collab.pid_files).expect("monitor");
    }

    /// Force-expire every pending timer as if an hour had passed, running
    /// its handler. Lets tests exercise crash-backoff/kill-timer delays
    /// without actually waiting for them.
    pub fn fire_timers(&mut self) {
        let fired = self.reactor.expire(Instant::now() + Duration::from_secs(3600));
        for ev in fired {
            match ev {
                TimerEvent::Retry(key) => {
                    let mut ctx = self.ctx();
                    sm::on_retry_timer(&key, &mut ctx).expect("on_retry_timer");
                }
                TimerEvent::KillTimeout(key) => {
                    let mut ctx = self.ctx();
                    sm::on_kill_timeout(&key, &mut ctx).expect("on_kill_timeout");
                }
            }
        }
    }

    /// Drain every pending `Step`/`StepAll` work item (hook dispatch
    /// schedules these rather than stepping inline).
    pub fn drain_work(&mut self) {
        loop {
            let items = self.reactor.drain_work();
            if items.is_empty() {
                return;
            }
            for item in items {
                match item {
                    WorkItem::Step(key) => self.step(&key),
                    WorkItem::StepAll => {
                        let keys: Vec<_> = self.registry.keys().cloned().collect();
                        for key in &keys {
                            self.step(key);
                        }
                    }
                    WorkItem::RunHook(_) => {}
                }
            }
        }
    }

    /// One "loop turn" worth of work: reap, drain deferred steps, then
    /// force-fire any timer that was armed along the way.
    pub fn pump(&mut self) {
        self.monitor();
        self.drain_work();
        self.fire_timers();
        self.drain_work();
    }
}

/// True if `pid` still names a live process (`kill(pid, None)` probe).
pub fn is_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

/// Poll `path` until it exists, panicking after 5s.
pub fn wait_for_path(path: &std::path::Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {path:?} to exist");
}

/// Poll an arbitrary predicate until it's true, panicking after 5s with
/// `what` in the message.
pub fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if predicate() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

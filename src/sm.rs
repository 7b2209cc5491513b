//! Service State Machine: the `step` driver (spec.md section 4.3).
//!
//! `step` is the single transition function for one service. It recomputes
//! `enabled`/`cond` from scratch on every iteration and applies the state
//! table in the spec, looping to a fixed point before returning. Cascading
//! effects on *other* services (a condition this service provides flipping)
//! are never applied inline — they go through [`crate::registry::Registry::mark_dirty_for_condition`]
//! and a [`crate::event_loop::WorkItem::Step`] queued on the scheduler, so
//! they are observed on the next loop turn (spec section 5, "Ordering
//! guarantees").

use std::time::Instant;

use tracing::{info, trace, warn};

use crate::cond::{CondKey, CondState};
use crate::constants::SVC_RESPAWN_MAX;
use crate::error::{CoreError, SupervisorError};
use crate::event_loop::{Scheduler, TimerEvent, WorkItem};
use crate::registry::{Registry, ServiceKey};
use crate::service::{Runlevel, Service, ServiceKind, ServiceState};
use crate::supervisor::{ProcessSupervisor, StartOutcome};

/// Safety cap on `step`'s intra-call fixed-point loop. Every real
/// transition chain settles in a handful of iterations; this bound exists
/// only to turn a logic bug into a loud failure instead of a hang (spec
/// section 8, "`step(svc)` reaches a fixed point in finite iterations").
const MAX_STEP_ITERATIONS: u32 = 64;

/// Everything `step` needs, bundled so call sites pass one argument instead
/// of five. Borrowed only for the duration of a single `step` call.
pub struct StepCtx<'a> {
    /// The service registry (and pid index).
    pub registry: &'a mut Registry,
    /// The condition store.
    pub cond_store: &'a mut crate::cond::CondStore,
    /// Timer/deferred-work scheduler.
    pub scheduler: &'a mut dyn Scheduler,
    /// Fork/exec/wait supervisor.
    pub supervisor: &'a mut dyn ProcessSupervisor,
    /// The currently active runlevel.
    pub runlevel: Runlevel,
    /// True while the scheduler façade is in a teardown pass (no new starts).
    pub teardown: bool,
}

/// Drive `key`'s service to a fixed point, applying every transition the
/// current (enabled, cond, liveness, dirty) tuple warrants.
pub fn step(key: &ServiceKey, ctx: &mut StepCtx<'_>) -> Result<(), CoreError> {
    let mut iterations = 0;
    loop {
        iterations += 1;
        if iterations > MAX_STEP_ITERATIONS {
            warn!(cmd = %key.0, id = %key.1, "step did not reach a fixed point within the iteration cap");
            break;
        }
        if !step_once(key, ctx)? {
            break;
        }
    }
    Ok(())
}

fn compute_enabled(svc: &Service, runlevel: Runlevel) -> bool {
    svc.runlevels.contains(runlevel)
        && !svc.runtime.manual_stop
        && !svc.runtime.missing
        && !svc.runtime.crashing
}

fn set_state(ctx: &mut StepCtx<'_>, key: &ServiceKey, state: ServiceState) -> Result<(), CoreError> {
    let svc = ctx.registry.require_mut(key)?;
    trace!(cmd = %key.0, id = %key.1, from = %svc.runtime.state, to = %state, "state transition");
    svc.runtime.state = state;
    Ok(())
}

/// Mark every dependent of `changed_key` dirty and schedule a `Step` for
/// each (spec section 4.2's mutation side effect).
fn schedule_dependents(ctx: &mut StepCtx<'_>, changed_key: &CondKey) {
    let touched = ctx.registry.mark_dirty_for_condition(changed_key);
    for touched_key in touched {
        ctx.scheduler.schedule_work(WorkItem::Step(touched_key));
    }
}

fn assert_provided(ctx: &mut StepCtx<'_>, key: &ServiceKey) -> Result<(), CoreError> {
    let provided = match ctx.registry.require(key)?.provides.clone() {
        Some(k) => k,
        None => return Ok(()),
    };
    if ctx.cond_store.set(&provided, CondState::On)? {
        schedule_dependents(ctx, &provided);
    }
    Ok(())
}

fn clear_provided(ctx: &mut StepCtx<'_>, key: &ServiceKey) -> Result<(), CoreError> {
    let provided = match ctx.registry.require(key)?.provides.clone() {
        Some(k) => k,
        None => return Ok(()),
    };
    if ctx.cond_store.clear(&provided)? {
        schedule_dependents(ctx, &provided);
    }
    Ok(())
}

fn cancel_kill_timer(ctx: &mut StepCtx<'_>, key: &ServiceKey) -> Result<(), CoreError> {
    let svc = ctx.registry.require_mut(key)?;
    let prior = svc.runtime.timer_cb.take();
    ctx.scheduler.cancel_timer(prior);
    Ok(())
}

/// Entry into `STOPPING` always cancels a prior timer then arms a fresh
/// kill-timer (spec section 4.3).
fn arm_kill_timer(ctx: &mut StepCtx<'_>, key: &ServiceKey) -> Result<(), CoreError> {
    cancel_kill_timer(ctx, key)?;
    let delay = ctx.registry.require(key)?.kill_delay;
    let id = ctx.scheduler.arm_timer(delay, TimerEvent::KillTimeout(key.clone()));
    ctx.registry.require_mut(key)?.runtime.timer_cb = Some(id);
    Ok(())
}

/// Crash-backoff retry timer (spec section 4.3, "Crash policy"). The first
/// retry after a clean `RUNNING` daemon dies fires almost immediately; any
/// retry after that follows the fast/slow schedule keyed off how many
/// consecutive attempts have already failed.
fn schedule_retry(ctx: &mut StepCtx<'_>, key: &ServiceKey) -> Result<(), CoreError> {
    cancel_kill_timer(ctx, key)?;
    let svc = ctx.registry.require(key)?;
    let half = svc.respawn_max.max(1) / 2;
    let delay = if svc.runtime.restart_cnt == 0 {
        crate::constants::RETRY_DELAY_IMMEDIATE
    } else if svc.runtime.restart_cnt < half {
        crate::constants::RETRY_DELAY_FAST
    } else {
        crate::constants::RETRY_DELAY_SLOW
    };
    let id = ctx.scheduler.arm_timer(delay, TimerEvent::Retry(key.clone()));
    ctx.registry.require_mut(key)?.runtime.timer_cb = Some(id);
    Ok(())
}

/// Handler for an expired [`TimerEvent::Retry`]: bump `restart_cnt`, latch
/// `crashing` at the cap (resetting the counter, per the invariant in
/// spec.md section 3), and otherwise re-drive `step`.
pub fn on_retry_timer(key: &ServiceKey, ctx: &mut StepCtx<'_>) -> Result<(), CoreError> {
    let svc = ctx.registry.require_mut(key)?;
    svc.runtime.timer_cb = None;
    svc.runtime.restart_cnt += 1;
    if svc.runtime.restart_cnt >= svc.respawn_max {
        svc.runtime.crashing = true;
        svc.runtime.restart_cnt = 0;
        warn!(cmd = %key.0, id = %key.1, "service keeps crashing, disabling respawn until reload");
        return Ok(());
    }
    step(key, ctx)
}

/// Handler for an expired [`TimerEvent::KillTimeout`]: the child ignored the
/// graceful signal within `killdelay`; escalate to `SIGKILL` on the whole
/// process group (spec section 4.3 / 7, "Kill escalation").
pub fn on_kill_timeout(key: &ServiceKey, ctx: &mut StepCtx<'_>) -> Result<(), CoreError> {
    let svc = ctx.registry.require_mut(key)?;
    svc.runtime.timer_cb = None;
    if svc.runtime.pid.is_some() {
        warn!(cmd = %key.0, id = %key.1, "kill delay expired, escalating to SIGKILL");
        if let Err(e) = ctx.supervisor.kill_now(svc) {
            warn!(cmd = %key.0, id = %key.1, error = %e, "SIGKILL escalation failed");
        }
    }
    Ok(())
}

fn stopping_target(kind: ServiceKind) -> ServiceState {
    if kind.is_oneshot() || kind == ServiceKind::Sysv {
        ServiceState::Done
    } else {
        ServiceState::Halted
    }
}

/// One iteration of the transition table. Returns `true` if anything
/// changed (state, a timer, a condition), in which case the caller loops
/// again to re-evaluate from the new snapshot.
fn step_once(key: &ServiceKey, ctx: &mut StepCtx<'_>) -> Result<bool, CoreError> {
    let (state, enabled, cond, kind, pid_is_live) = {
        let svc = ctx.registry.require(key)?;
        let enabled = compute_enabled(svc, ctx.runlevel);
        let cond = ctx.cond_store.aggregate(&svc.cond_expr);
        (svc.runtime.state, enabled, cond, svc.kind, svc.runtime.pid.is_some())
    };

    match state {
        ServiceState::Halted => {
            if enabled {
                set_state(ctx, key, ServiceState::Ready)?;
                return Ok(true);
            }
            Ok(false)
        }

        ServiceState::Ready => {
            if !enabled {
                set_state(ctx, key, ServiceState::Halted)?;
                return Ok(true);
            }
            if cond != CondState::On || ctx.teardown {
                return Ok(false);
            }
            let outcome = {
                let svc = ctx.registry.require_mut(key)?;
                ctx.supervisor.start(svc)
            };
            match outcome {
                Ok(StartOutcome::Started) => {
                    let svc = ctx.registry.require_mut(key)?;
                    svc.runtime.dirty = false;
                    svc.runtime.start_time = Some(Instant::now());
                    svc.runtime.state = ServiceState::Running;
                    let pid = svc.runtime.pid;
                    if let Some(pid) = pid {
                        ctx.registry.bind_pid(key, pid)?;
                    }
                    info!(cmd = %key.0, id = %key.1, "service started");
                    assert_provided(ctx, key)?;
                    Ok(true)
                }
                Ok(StartOutcome::RanToCompletion) => {
                    let svc = ctx.registry.require_mut(key)?;
                    svc.runtime.state = ServiceState::Stopping;
                    Ok(true)
                }
                Err(SupervisorError::CmdMissing(_)) | Err(SupervisorError::EnvFileMissing(..)) => {
                    let svc = ctx.registry.require_mut(key)?;
                    svc.runtime.missing = true;
                    svc.runtime.state = ServiceState::Halted;
                    warn!(cmd = %key.0, id = %key.1, "service command or env-file missing, latched");
                    Ok(true)
                }
                Err(e) => {
                    warn!(cmd = %key.0, id = %key.1, error = %e, "start failed, scheduling retry");
                    schedule_retry(ctx, key)?;
                    Ok(false)
                }
            }
        }

        ServiceState::Running => {
            if !enabled {
                let svc = ctx.registry.require_mut(key)?;
                ctx.supervisor.stop(svc)?;
                svc_after_stop_request(ctx, key)?;
                return Ok(true);
            }
            if !pid_is_live {
                // The child died; `monitor()` already cleared `svc.runtime.pid`
                // and recorded `status` before calling us.
                match kind {
                    ServiceKind::Service | ServiceKind::Inetd | ServiceKind::Tty => {
                        clear_provided(ctx, key)?;
                        set_state(ctx, key, ServiceState::Halted)?;
                        schedule_retry(ctx, key)?;
                        // Stop the fixed-point loop here: the crash-backoff
                        // retry timer governs the next start attempt. Letting
                        // the loop continue would fall straight through
                        // HALTED -> READY -> start() again in this same call,
                        // bypassing the backoff delay entirely.
                        return Ok(false);
                    }
                    ServiceKind::Task => {
                        set_state(ctx, key, ServiceState::Stopping)?;
                    }
                    ServiceKind::Sysv => {
                        let started = ctx.registry.require(key)?.runtime.started;
                        if !started {
                            set_state(ctx, key, ServiceState::Stopping)?;
                        }
                    }
                    ServiceKind::Run => {
                        set_state(ctx, key, ServiceState::Stopping)?;
                    }
                }
                return Ok(true);
            }
            match cond {
                CondState::Off => {
                    let svc = ctx.registry.require_mut(key)?;
                    ctx.supervisor.stop(svc)?;
                    svc_after_stop_request(ctx, key)?;
                    Ok(true)
                }
                CondState::Flux => {
                    let svc = ctx.registry.require_mut(key)?;
                    ctx.supervisor.pause(svc)?;
                    set_state(ctx, key, ServiceState::Waiting)?;
                    Ok(true)
                }
                CondState::On => {
                    let dirty = ctx.registry.require(key)?.runtime.dirty;
                    if !dirty {
                        return Ok(false);
                    }
                    let restart_on_reload = ctx.registry.require(key)?.restart_on_reload;
                    if restart_on_reload {
                        let svc = ctx.registry.require_mut(key)?;
                        ctx.supervisor.stop(svc)?;
                        svc_after_stop_request(ctx, key)?;
                    } else {
                        let svc = ctx.registry.require_mut(key)?;
                        ctx.supervisor.restart(svc)?;
                        svc.runtime.dirty = false;
                    }
                    Ok(true)
                }
            }
        }

        ServiceState::Stopping => {
            if pid_is_live {
                return Ok(false);
            }
            cancel_kill_timer(ctx, key)?;
            clear_provided(ctx, key)?;
            let target = stopping_target(kind);
            if target == ServiceState::Done {
                ctx.registry.require_mut(key)?.runtime.once += 1;
            }
            set_state(ctx, key, target)?;
            Ok(true)
        }

        ServiceState::Waiting => {
            if !enabled {
                let svc = ctx.registry.require_mut(key)?;
                ctx.supervisor.resume(svc)?;
                ctx.supervisor.stop(svc)?;
                svc_after_stop_request(ctx, key)?;
                return Ok(true);
            }
            if !pid_is_live {
                let svc = ctx.registry.require_mut(key)?;
                svc.runtime.restart_cnt += 1;
                svc.runtime.state = ServiceState::Ready;
                return Ok(true);
            }
            match cond {
                CondState::On => {
                    let dirty = ctx.registry.require(key)?.runtime.dirty;
                    let svc = ctx.registry.require_mut(key)?;
                    ctx.supervisor.resume(svc)?;
                    set_state(ctx, key, ServiceState::Running)?;
                    if !dirty {
                        assert_provided(ctx, key)?;
                    }
                    Ok(true)
                }
                CondState::Off => {
                    let svc = ctx.registry.require_mut(key)?;
                    ctx.supervisor.resume(svc)?;
                    ctx.supervisor.stop(svc)?;
                    svc_after_stop_request(ctx, key)?;
                    Ok(true)
                }
                CondState::Flux => Ok(false),
            }
        }

        ServiceState::Done => {
            let dirty = ctx.registry.require(key)?.runtime.dirty;
            if dirty {
                set_state(ctx, key, ServiceState::Halted)?;
                return Ok(true);
            }
            Ok(false)
        }
    }
}

/// Shared tail of every transition that requests a stop: move to
/// `STOPPING` and arm the kill-timer.
fn svc_after_stop_request(ctx: &mut StepCtx<'_>, key: &ServiceKey) -> Result<(), CoreError> {
    set_state(ctx, key, ServiceState::Stopping)?;
    arm_kill_timer(ctx, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::{CondExpr, CondStore};
    use crate::event_loop::Reactor;
    use crate::service::ServiceKind;
    use crate::supervisor::test_support::ScriptedSupervisor;
    use nix::unistd::Pid;

    fn ctx<'a>(
        registry: &'a mut Registry,
        cond_store: &'a mut CondStore,
        reactor: &'a mut Reactor,
        supervisor: &'a mut dyn ProcessSupervisor,
    ) -> StepCtx<'a> {
        StepCtx {
            registry,
            cond_store,
            scheduler: reactor,
            supervisor,
            runlevel: Runlevel::Numeric(2),
            teardown: false,
        }
    }

    #[test]
    fn halted_to_ready_to_running_happy_path() {
        let mut registry = Registry::new();
        let dir = tempfile::tempdir().unwrap();
        let mut cond_store = CondStore::new(dir.path());
        let mut reactor = Reactor::new();
        let mut sup = ScriptedSupervisor::always_succeeds(Pid::from_raw(4242));

        let mut svc = Service::new("/bin/sleep", "", ServiceKind::Service);
        svc.runlevels = svc.runlevels.with_level(2);
        svc.provides = Some(svc.default_provided_key());
        let key = registry.register(svc);

        let mut c = ctx(&mut registry, &mut cond_store, &mut reactor, &mut sup);
        step(&key, &mut c).unwrap();

        let svc = registry.get(&key).unwrap();
        assert_eq!(svc.runtime.state, ServiceState::Running);
        assert_eq!(svc.runtime.pid, Some(Pid::from_raw(4242)));
        assert_eq!(cond_store.get(&svc.provides.clone().unwrap()), CondState::On);
    }

    #[test]
    fn disabled_service_stays_halted() {
        let mut registry = Registry::new();
        let dir = tempfile::tempdir().unwrap();
        let mut cond_store = CondStore::new(dir.path());
        let mut reactor = Reactor::new();
        let mut sup = ScriptedSupervisor::always_succeeds(Pid::from_raw(1));

        let svc = Service::new("/bin/sleep", "", ServiceKind::Service);
        let key = registry.register(svc);
        let mut c = ctx(&mut registry, &mut cond_store, &mut reactor, &mut sup);
        step(&key, &mut c).unwrap();
        assert_eq!(registry.get(&key).unwrap().runtime.state, ServiceState::Halted);
    }

    #[test]
    fn condition_gated_service_waits_in_ready() {
        let mut registry = Registry::new();
        let dir = tempfile::tempdir().unwrap();
        let mut cond_store = CondStore::new(dir.path());
        let mut reactor = Reactor::new();
        let mut sup = ScriptedSupervisor::always_succeeds(Pid::from_raw(99));

        let mut svc = Service::new("/bin/a", "", ServiceKind::Service);
        svc.runlevels = svc.runlevels.with_level(2);
        svc.cond_expr = CondExpr::parse("net/eth0/up").unwrap();
        let key = registry.register(svc);

        let mut c = ctx(&mut registry, &mut cond_store, &mut reactor, &mut sup);
        step(&key, &mut c).unwrap();
        assert_eq!(registry.get(&key).unwrap().runtime.state, ServiceState::Ready);

        cond_store.set(&CondKey::parse("net/eth0/up").unwrap(), CondState::On).unwrap();
        let mut c = ctx(&mut registry, &mut cond_store, &mut reactor, &mut sup);
        step(&key, &mut c).unwrap();
        assert_eq!(registry.get(&key).unwrap().runtime.state, ServiceState::Running);
    }

    #[test]
    fn flux_pauses_running_service() {
        let mut registry = Registry::new();
        let dir = tempfile::tempdir().unwrap();
        let mut cond_store = CondStore::new(dir.path());
        let mut reactor = Reactor::new();
        let mut sup = ScriptedSupervisor::always_succeeds(Pid::from_raw(55));

        let mut svc = Service::new("/bin/a", "", ServiceKind::Service);
        svc.runlevels = svc.runlevels.with_level(2);
        svc.cond_expr = CondExpr::parse("net/eth0/up").unwrap();
        let key = registry.register(svc);
        let cond_key = CondKey::parse("net/eth0/up").unwrap();
        cond_store.set(&cond_key, CondState::On).unwrap();

        let mut c = ctx(&mut registry, &mut cond_store, &mut reactor, &mut sup);
        step(&key, &mut c).unwrap();
        assert_eq!(registry.get(&key).unwrap().runtime.state, ServiceState::Running);

        cond_store.set(&cond_key, CondState::Flux).unwrap();
        let mut c = ctx(&mut registry, &mut cond_store, &mut reactor, &mut sup);
        step(&key, &mut c).unwrap();
        assert_eq!(registry.get(&key).unwrap().runtime.state, ServiceState::Waiting);
        assert!(sup.paused.contains(&Pid::from_raw(55)));

        cond_store.set(&cond_key, CondState::On).unwrap();
        let mut c = ctx(&mut registry, &mut cond_store, &mut reactor, &mut sup);
        step(&key, &mut c).unwrap();
        assert_eq!(registry.get(&key).unwrap().runtime.state, ServiceState::Running);
        // No new pid: WAITING -> RUNNING never restarts the child.
        assert_eq!(registry.get(&key).unwrap().runtime.pid, Some(Pid::from_raw(55)));
    }

    #[test]
    fn crash_latches_after_respawn_cap() {
        let mut registry = Registry::new();
        let dir = tempfile::tempdir().unwrap();
        let mut cond_store = CondStore::new(dir.path());
        let mut reactor = Reactor::new();
        let mut sup = ScriptedSupervisor::always_fails();

        let mut svc = Service::new("/bin/false", "", ServiceKind::Service);
        svc.runlevels = svc.runlevels.with_level(2);
        svc.respawn_max = 3;
        let key = registry.register(svc);

        let mut c = ctx(&mut registry, &mut cond_store, &mut reactor, &mut sup);
        step(&key, &mut c).unwrap();
        // Start failed with a generic (non-missing) error: a retry timer was armed.
        for _ in 0..3 {
            let fired = reactor.expire(Instant::now() + Duration::from_secs(10));
            for ev in fired {
                if let TimerEvent::Retry(k) = ev {
                    let mut c = ctx(&mut registry, &mut cond_store, &mut reactor, &mut sup);
                    on_retry_timer(&k, &mut c).unwrap();
                }
            }
        }
        assert!(registry.get(&key).unwrap().runtime.crashing);
        assert_eq!(registry.get(&key).unwrap().runtime.restart_cnt, 0);
    }

    use std::time::Duration;
}

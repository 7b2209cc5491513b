//! Scheduler Façade: the single entry point the event loop drives into
//! (spec.md section 4.7). Wraps the per-service [`crate::sm::step`] driver
//! with runlevel transition handling and dynamic-reload bookkeeping so
//! `main.rs` has exactly one call to make per loop turn.

use tracing::info;

use crate::cond::CondStore;
use crate::collab::Collaborators;
use crate::event_loop::Scheduler;
use crate::hooks::{HookCallback, HookPoint, HookScriptConfig, run_hook};
use crate::registry::Registry;
use crate::service::Runlevel;
use crate::sm::{self, StepCtx};
use crate::supervisor::ProcessSupervisor;

/// Everything [`sm_step`]/[`service_runlevel`] need, bundled the same way
/// [`StepCtx`] bundles `step`'s dependencies.
pub struct Facade<'a> {
    /// The service registry.
    pub registry: &'a mut Registry,
    /// The condition store.
    pub cond_store: &'a mut CondStore,
    /// Timer/deferred-work scheduler.
    pub scheduler: &'a mut dyn Scheduler,
    /// Fork/exec/wait supervisor.
    pub supervisor: &'a mut dyn ProcessSupervisor,
    /// Narrow collaborators (networking, cgroups, logging, pid files, tty).
    pub collab: &'a Collaborators,
    /// The currently active runlevel.
    pub runlevel: Runlevel,
    /// True while a runlevel transition's teardown pass is in progress: no
    /// service is allowed to start, only stop (spec section 4.7).
    pub teardown: bool,
    /// Set when a config mutation (new directive file, plugin reload) needs
    /// every service re-evaluated on the next `sm_step` (spec section 4.7,
    /// `reload_dynamic`).
    pub reload_pending: bool,
}

impl<'a> Facade<'a> {
    fn step_ctx(&mut self) -> StepCtx<'_> {
        StepCtx {
            registry: self.registry,
            cond_store: self.cond_store,
            scheduler: self.scheduler,
            supervisor: self.supervisor,
            runlevel: self.runlevel,
            teardown: self.teardown,
        }
    }
}

/// Idempotent outer driver (spec section 4.7, `sm_step`): if a reload is
/// pending, mark every service dirty first, then step every registered
/// service to a fixed point. Safe to call repeatedly with no pending
/// work — every `step` call is itself idempotent once its service has
/// settled.
pub fn sm_step(facade: &mut Facade<'_>) -> Result<(), crate::error::CoreError> {
    if facade.reload_pending {
        let keys: Vec<_> = facade.registry.keys().cloned().collect();
        for key in &keys {
            if let Some(svc) = facade.registry.get_mut(key) {
                svc.runtime.dirty = true;
            }
        }
        facade.reload_pending = false;
    }

    let keys: Vec<_> = facade.registry.keys().cloned().collect();
    for key in &keys {
        let mut ctx = facade.step_ctx();
        sm::step(key, &mut ctx)?;
    }
    Ok(())
}

/// Transition the active runlevel (spec section 4.7, `service_runlevel`).
///
/// Crossing the network-less ceiling (`constants::RUNLEVEL_NETLESS_CEILING`)
/// upward brings networking up *before* stepping services into the new
/// level; crossing it downward tears networking down *after* every service
/// has been stopped. A same-level call (or one that doesn't cross the
/// boundary) skips the networking collaborator entirely.
pub fn service_runlevel(facade: &mut Facade<'_>, new: Runlevel) -> Result<(), crate::error::CoreError> {
    let old = facade.runlevel;
    if old.is_netless() && !new.is_netless() {
        if let Err(e) = facade.collab.network.up() {
            tracing::warn!(error = %e, "network up collaborator failed");
        }
        facade.runlevel = new;
        sm_step(facade)?;
    } else if !old.is_netless() && new.is_netless() {
        facade.teardown = true;
        facade.runlevel = new;
        sm_step(facade)?;
        facade.teardown = false;
        if let Err(e) = facade.collab.network.down() {
            tracing::warn!(error = %e, "network down collaborator failed");
        }
    } else {
        facade.runlevel = new;
        sm_step(facade)?;
    }
    info!(?new, "runlevel transition complete");
    Ok(())
}

/// Mark the state machine as needing a full rescan on the next [`sm_step`]
/// (spec section 4.7, `reload_dynamic`): every service is marked dirty so
/// its `step` re-evaluates `enabled`/`cond` against whatever a directive
/// reload just changed, then the façade is stepped once immediately so the
/// caller observes the effect before returning.
pub fn reload_dynamic(facade: &mut Facade<'_>) -> Result<(), crate::error::CoreError> {
    facade.reload_pending = true;
    sm_step(facade)
}

/// Run a hook point through the dispatcher and immediately re-step every
/// `RUN`/`TASK` service it names, rather than merely returning their keys
/// for the caller to schedule later (spec section 4.5's contract leaves the
/// scheduling decision to the caller; the façade is that caller).
pub fn dispatch_hook(
    facade: &mut Facade<'_>,
    callbacks: &mut [HookCallback],
    point: HookPoint,
    script_cfg: Option<&HookScriptConfig>,
) -> Result<(), crate::error::CoreError> {
    let restep = run_hook(callbacks, point, None, facade.cond_store, facade.registry, script_cfg);
    for key in restep {
        let mut ctx = facade.step_ctx();
        sm::step(&key, &mut ctx)?;
    }
    Ok(())
}

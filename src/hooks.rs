//! Hook Dispatcher: named lifecycle points where registered callbacks fire
//! (spec.md section 4.5).

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use crate::cond::{CondKey, CondStore};
use crate::constants::{HOOK_SCRIPT_NAME_VAR, HOOK_SCRIPT_SHUTDOWN_VAR};
use crate::registry::{Registry, ServiceKey};
use crate::service::ServiceKind;

/// Compile-time-fixed lifecycle points a plugin or built-in collaborator may
/// register a callback for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Very first hook, before any filesystem is assumed mounted.
    Banner,
    /// Root filesystem is mounted (possibly read-only).
    RootfsUp,
    /// All of `/etc/fstab` (or equivalent) is mounted.
    BasefsUp,
    /// Networking is configured and reachable.
    NetworkUp,
    /// A service has transitioned to `RUNNING`.
    SvcUp,
    /// All runlevel-S bootstrap services have completed.
    SystemUp,
    /// The active runlevel changed.
    RunlevelChange,
    /// Shutdown sequence has begun.
    Shutdown,
    /// Halt variant of shutdown.
    Halt,
    /// Reboot variant of shutdown.
    Reboot,
}

impl HookPoint {
    /// Every hook point that is eligible to set a `hook/…` one-shot
    /// condition: `BASEFS_UP` through `SHUTDOWN` inclusive (spec section
    /// 4.5). `BANNER`/`ROOTFS_UP` fire before the condition store is
    /// necessarily available; `SVC_UP`/`SYSTEM_UP`/`RUNLEVEL_CHANGE` are
    /// per-service/per-transition events, not one-shot boot milestones.
    fn sets_condition(self) -> bool {
        matches!(self, HookPoint::BasefsUp | HookPoint::NetworkUp | HookPoint::Shutdown)
    }

    /// The condition key this hook point asserts, if any (`sets_condition`).
    pub fn cond_key(self) -> Option<CondKey> {
        self.sets_condition().then(|| {
            CondKey::new_trusted(format!("{}/{}", crate::constants::HOOK_COND_PREFIX, self.slug()))
        })
    }

    /// Lowercase, hyphenated name used both in condition keys
    /// (`hook/basefs-up`) and hook-script directory names.
    pub fn slug(self) -> &'static str {
        match self {
            HookPoint::Banner => "banner",
            HookPoint::RootfsUp => "rootfs-up",
            HookPoint::BasefsUp => "basefs-up",
            HookPoint::NetworkUp => "network-up",
            HookPoint::SvcUp => "svc-up",
            HookPoint::SystemUp => "system-up",
            HookPoint::RunlevelChange => "runlevel-change",
            HookPoint::Shutdown => "shutdown",
            HookPoint::Halt => "halt",
            HookPoint::Reboot => "reboot",
        }
    }

    /// `FINIT_SHUTDOWN` value for shutdown-family hooks, if applicable.
    fn shutdown_kind(self) -> Option<&'static str> {
        match self {
            HookPoint::Shutdown => Some("poweroff"),
            HookPoint::Halt => Some("halt"),
            HookPoint::Reboot => Some("reboot"),
            _ => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Opaque argument passed to a hook callback: either the caller-supplied
/// value or the plugin's own stored argument (spec section 4.5).
#[derive(Debug, Clone, Default)]
pub struct HookArg(pub Option<String>);

/// A single registered callback: owner name (for logging) plus the closure.
pub struct HookCallback {
    /// Name of the plugin (or built-in) that registered this callback, used
    /// for logging and for the no-op-duplicate check in the plugin manager.
    pub owner: String,
    /// The point this callback fires at.
    pub point: HookPoint,
    /// The callback itself. Stored argument used when `run_hook` is called
    /// without an explicit one.
    pub stored_arg: HookArg,
    callback: Box<dyn FnMut(&HookArg) + Send>,
}

impl HookCallback {
    /// Register a new callback for `point`, owned by `owner`.
    pub fn new(
        owner: impl Into<String>,
        point: HookPoint,
        stored_arg: HookArg,
        callback: impl FnMut(&HookArg) + Send + 'static,
    ) -> Self {
        HookCallback {
            owner: owner.into(),
            point,
            stored_arg,
            callback: Box::new(callback),
        }
    }

    fn invoke(&mut self, arg: Option<&HookArg>) {
        let effective = arg.unwrap_or(&self.stored_arg);
        (self.callback)(effective);
    }
}

/// Directory root hook scripts are scanned from, gated behind the
/// `hook_scripts` feature (spec section 4.5 "Optional behaviour").
#[derive(Debug, Clone)]
pub struct HookScriptConfig {
    /// Base directory; each hook point's scripts live under
    /// `<base>/<hook-suffix>/`.
    pub base_dir: PathBuf,
}

/// Runs every registered callback for `point`, in registration order, then
/// (if the point sets a condition and the store is available) asserts the
/// corresponding `hook/…` condition ON exactly once, then re-steps every
/// `RUN`/`TASK` service (spec section 4.5).
///
/// Returns the set of service keys that should be re-stepped as a result
/// (the caller enqueues these as deferred work rather than stepping
/// synchronously, keeping this function free of a `Scheduler` dependency).
pub fn run_hook(
    callbacks: &mut [HookCallback],
    point: HookPoint,
    arg: Option<&HookArg>,
    cond_store: &mut CondStore,
    registry: &Registry,
    script_cfg: Option<&HookScriptConfig>,
) -> Vec<ServiceKey> {
    for cb in callbacks.iter_mut().filter(|c| c.point == point) {
        debug!(owner = %cb.owner, hook = %point, "running hook callback");
        cb.invoke(arg);
    }

    if let Some(key) = point.cond_key() {
        if cond_store.is_available() {
            match cond_store.set_oneshot(&key) {
                Ok(_changed) => debug!(%key, "hook condition asserted"),
                Err(e) => warn!(%key, error = %e, "failed to assert hook condition"),
            }
        }
    }

    #[cfg(feature = "hook_scripts")]
    if let Some(cfg) = script_cfg {
        run_hook_scripts(cfg, point);
    }
    #[cfg(not(feature = "hook_scripts"))]
    let _ = script_cfg;

    registry
        .iter()
        .filter(|svc| svc.kind.is_oneshot())
        .map(|svc| (svc.cmd.clone(), svc.id.clone()))
        .collect()
}

#[cfg(feature = "hook_scripts")]
fn run_hook_scripts(cfg: &HookScriptConfig, point: HookPoint) {
    let dir = cfg.base_dir.join(point.slug());
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };
    let mut scripts: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    scripts.sort();
    for script in scripts {
        run_parts_entry(&script, point);
    }
}

#[cfg(feature = "hook_scripts")]
fn run_parts_entry(script: &Path, point: HookPoint) {
    debug!(script = %script.display(), "running hook script");
    let mut cmd = Command::new(script);
    cmd.env(HOOK_SCRIPT_NAME_VAR, point.slug());
    if let Some(kind) = point.shutdown_kind() {
        cmd.env(HOOK_SCRIPT_SHUTDOWN_VAR, kind);
    }
    match cmd.status() {
        Ok(status) if !status.success() => {
            warn!(script = %script.display(), ?status, "hook script exited non-zero")
        }
        Err(e) => warn!(script = %script.display(), error = %e, "failed to run hook script"),
        _ => {}
    }
}

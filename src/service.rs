//! Service data model: identity, execution parameters, policy, and the
//! runtime state every service carries between `step` invocations.

use std::path::PathBuf;
use std::time::Instant;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use strum_macros::{Display, EnumString};

use crate::cond::{CondExpr, CondKey};
use crate::constants::{DEFAULT_KILL_DELAY, SVC_RESPAWN_MAX};

/// Service taxonomy (spec's `Kind`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ServiceKind {
    /// Long-running daemon, restarted on unexpected exit.
    Service,
    /// One-shot, may run in parallel with other tasks.
    Task,
    /// One-shot, serial — blocks runlevel progression until exit.
    Run,
    /// Invoked with literal arguments `start`/`stop`.
    Sysv,
    /// Login terminal; owned by the TTY collaborator.
    Tty,
    /// Listening socket handoff.
    Inetd,
}

impl ServiceKind {
    /// `RUN`/`TASK` are the one-shot kinds the hook dispatcher re-steps
    /// after every hook point fires.
    pub fn is_oneshot(self) -> bool {
        matches!(self, ServiceKind::Run | ServiceKind::Task)
    }
}

/// The six states of the per-service state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ServiceState {
    /// Not running; may become ready when enabled.
    Halted,
    /// Enabled and waiting for conditions to be ON.
    Ready,
    /// Child process alive.
    Running,
    /// Termination requested; awaiting reap (kill-timer armed).
    Stopping,
    /// Child alive but paused (`SIGSTOP`'d) because conditions went FLUX.
    Waiting,
    /// One-shot has completed for this runlevel.
    Done,
}

/// A resource limit value: either a fixed numeric limit or explicitly
/// unlimited (`RLIM_INFINITY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitValue {
    /// A concrete soft/hard limit.
    Fixed(u64),
    /// No limit.
    Unlimited,
}

/// One rlimit entry to apply to the child before `execvp`.
#[derive(Debug, Clone)]
pub struct RLimit {
    /// The resource this limit governs (e.g. `RLIMIT_NOFILE`).
    pub resource: nix::sys::resource::Resource,
    /// Soft limit.
    pub soft: LimitValue,
    /// Hard limit.
    pub hard: LimitValue,
}

/// Cgroup placement for a service.
#[derive(Debug, Clone, Default)]
pub struct CgroupSpec {
    /// Group name; defaults to the originating config file's basename with
    /// `.conf` stripped when left unset.
    pub group: Option<String>,
    /// Raw `key value` settings applied to the group, one per line, bounded
    /// to `MAX_COND_LEN` bytes (spec section 9 Open Questions).
    pub settings: String,
}

/// Pid-file policy for a service (directive-line `pid:` keyword).
#[derive(Debug, Clone)]
pub enum PidFilePolicy {
    /// No `pid:` directive given; the default per-kind behaviour applies
    /// (daemons get one under the runtime directory, named after the
    /// service).
    Default,
    /// `pid:!` — the service writes its own pid file; the core must not.
    SelfManaged,
    /// `pid:/explicit/path` — the core writes to this path instead of the
    /// default location.
    Explicit(PathBuf),
}

impl Default for PidFilePolicy {
    fn default() -> Self {
        PidFilePolicy::Default
    }
}

/// Output redirection policy for a service's stdout/stderr.
#[derive(Debug, Clone)]
pub enum OutputPolicy {
    /// Redirect to `/dev/null`.
    Null,
    /// Redirect to the system console.
    Console,
    /// Pipe through an external logger process (or fall back to `syslog`).
    Logger(LoggerSpec),
}

impl Default for OutputPolicy {
    fn default() -> Self {
        OutputPolicy::Null
    }
}

/// Logger configuration when `OutputPolicy::Logger` is selected.
#[derive(Debug, Clone, Default)]
pub struct LoggerSpec {
    /// Log file path; `None` lets the logger pick its own default.
    pub file: Option<PathBuf>,
    /// Rotation size threshold in bytes.
    pub size: Option<u64>,
    /// Number of rotated files to retain.
    pub rotate: Option<u32>,
    /// Tag attached to each line.
    pub tag: Option<String>,
    /// Syslog priority (`facility.level`) used for the fallback path.
    pub priority: Option<String>,
}

/// The currently active runlevel: a numeric level `0..=9` or the bootstrap
/// pseudo-level `S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runlevel {
    /// Bootstrap pseudo-level, active before the first numeric runlevel.
    Bootstrap,
    /// Numeric runlevel `0..=9`.
    Numeric(u8),
}

impl Runlevel {
    /// True if this runlevel is at or below the network-less ceiling
    /// (spec section 4.7, `service_runlevel`); `Bootstrap` counts as
    /// network-less.
    pub fn is_netless(self) -> bool {
        match self {
            Runlevel::Bootstrap => true,
            Runlevel::Numeric(n) => n <= crate::constants::RUNLEVEL_NETLESS_CEILING,
        }
    }
}

/// A bitmask over runlevels `0..=9` plus the bootstrap pseudo-level `S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunlevelMask(u16);

/// `S` is stored in bit 10; numeric levels `0..=9` occupy bits `0..=9`.
const BOOTSTRAP_BIT: u16 = 1 << 10;

impl RunlevelMask {
    /// An empty mask (service never eligible to run).
    pub fn empty() -> Self {
        RunlevelMask(0)
    }

    /// Set numeric level `n` (`0..=9`) in the mask. Out-of-range levels are
    /// ignored, matching the lenient directive-line parser.
    pub fn with_level(mut self, n: u8) -> Self {
        if n <= 9 {
            self.0 |= 1 << n;
        }
        self
    }

    /// Include the bootstrap pseudo-level `S`.
    pub fn with_bootstrap(mut self) -> Self {
        self.0 |= BOOTSTRAP_BIT;
        self
    }

    /// True if numeric level `n` is included.
    pub fn contains_level(&self, n: u8) -> bool {
        n <= 9 && (self.0 & (1 << n)) != 0
    }

    /// True if the bootstrap pseudo-level is included.
    pub fn contains_bootstrap(&self) -> bool {
        self.0 & BOOTSTRAP_BIT != 0
    }

    /// True if `rl` is included in this mask.
    pub fn contains(&self, rl: Runlevel) -> bool {
        match rl {
            Runlevel::Bootstrap => self.contains_bootstrap(),
            Runlevel::Numeric(n) => self.contains_level(n),
        }
    }
}

/// Mutable runtime state carried by a service between `step` invocations.
/// Separated from the static configuration fields so reload can replace the
/// latter without disturbing the former.
#[derive(Debug)]
pub struct RuntimeState {
    /// Current state-machine state.
    pub state: ServiceState,
    /// Live child pid, if any.
    pub pid: Option<Pid>,
    /// Previous child pid (retained across a restart for diagnostics).
    pub oldpid: Option<Pid>,
    /// When the current (or most recent) child was started.
    pub start_time: Option<Instant>,
    /// Last `waitpid` status observed for this service's child.
    pub status: Option<WaitStatus>,
    /// Number of times this service has completed in the current runlevel;
    /// used to suppress re-running a `RUN`/`TASK` that already finished.
    pub once: u32,
    /// Consecutive restart attempts since the last clean run or reload.
    pub restart_cnt: u32,
    /// Handle of this service's currently armed timer, if any. Opaque to
    /// the data model; interpreted by the event loop.
    pub timer_cb: Option<u64>,
    /// Set when a dependency or config mutation requires re-evaluation.
    pub dirty: bool,
    /// Set by an explicit manual stop (`initctl stop`-equivalent); blocks
    /// `enabled` until a matching manual start.
    pub manual_stop: bool,
    /// Latched when `cmd` was not found on `$PATH` or its env-file is
    /// missing; cleared only by a config reload.
    pub missing: bool,
    /// Latched once `restart_cnt` reaches `SVC_RESPAWN_MAX`.
    pub crashing: bool,
    /// For one-shots: whether the most recent run exited successfully.
    pub started: bool,
    /// Set when the service's argv was changed by a reload but the running
    /// instance hasn't picked it up yet.
    pub args_dirty: bool,
}

impl Default for RuntimeState {
    fn default() -> Self {
        RuntimeState {
            state: ServiceState::Halted,
            pid: None,
            oldpid: None,
            start_time: None,
            status: None,
            once: 0,
            restart_cnt: 0,
            timer_cb: None,
            dirty: false,
            manual_stop: false,
            missing: false,
            crashing: false,
            started: false,
            args_dirty: false,
        }
    }
}

/// A fully configured service: the fundamental unit the registry tracks.
#[derive(Debug)]
pub struct Service {
    /// Program path; part of the `(cmd, id)` identity.
    pub cmd: String,
    /// Instance discriminator; part of the `(cmd, id)` identity. Defaults
    /// to the empty string.
    pub id: String,
    /// Service taxonomy.
    pub kind: ServiceKind,
    /// Argument vector, already word-expanded and capped at
    /// `MAX_NUM_SVC_ARGS`.
    pub argv: Vec<String>,
    /// `$HOME`-resolved working directory for `chdir`, if resolvable.
    pub home: Option<PathBuf>,
    /// Configured user (resolved to uid at fork time).
    pub user: Option<String>,
    /// Configured group (resolved to gid at fork time).
    pub group: Option<String>,
    /// Resource limits applied before `execvp`.
    pub rlimits: Vec<RLimit>,
    /// Cgroup placement, if any.
    pub cgroup: Option<CgroupSpec>,
    /// Path to an env-file read line-by-line before `execvp`.
    pub env_file: Option<PathBuf>,
    /// Runlevels in which this service is eligible to run.
    pub runlevels: RunlevelMask,
    /// Signal sent on graceful stop.
    pub halt_signal: Signal,
    /// Graceful-to-forceful termination window.
    pub kill_delay: std::time::Duration,
    /// Respawn attempt cap before latching `crashing`.
    pub respawn_max: u32,
    /// `nohup`: if true, a dirty `RUNNING` service is `SIGHUP`'d in place
    /// instead of being stopped and restarted.
    pub restart_on_reload: bool,
    /// Output redirection policy.
    pub output: OutputPolicy,
    /// Dependency expression gating `RUNNING`.
    pub cond_expr: CondExpr,
    /// Condition key this service asserts ON while running, if any.
    pub provides: Option<CondKey>,
    /// Optional human-readable description (follows `--` in the directive
    /// line).
    pub description: Option<String>,
    /// Path to the config file that registered this service, used to
    /// derive a default cgroup name and to scope dynamic unregistration.
    pub origin_file: Option<PathBuf>,
    /// Pid-file policy (directive-line `pid:` keyword).
    pub pid_file: PidFilePolicy,
    /// Mutable runtime state.
    pub runtime: RuntimeState,
}

impl Service {
    /// Construct a new service in its initial `Halted` state with default
    /// policy values (`SIGTERM`, 3s kill delay, `SVC_RESPAWN_MAX`).
    pub fn new(cmd: impl Into<String>, id: impl Into<String>, kind: ServiceKind) -> Self {
        Service {
            cmd: cmd.into(),
            id: id.into(),
            kind,
            argv: Vec::new(),
            home: None,
            user: None,
            group: None,
            rlimits: Vec::new(),
            cgroup: None,
            env_file: None,
            runlevels: RunlevelMask::empty(),
            halt_signal: Signal::SIGTERM,
            kill_delay: DEFAULT_KILL_DELAY,
            respawn_max: SVC_RESPAWN_MAX,
            restart_on_reload: false,
            output: OutputPolicy::Null,
            cond_expr: CondExpr::default(),
            provides: None,
            description: None,
            origin_file: None,
            pid_file: PidFilePolicy::default(),
            runtime: RuntimeState::default(),
        }
    }

    /// The `(cmd, id)` identity tuple used as the registry's primary key.
    pub fn identity(&self) -> (&str, &str) {
        (&self.cmd, &self.id)
    }

    /// The `pid/<id-or-cmd>` condition key this service provides by
    /// default when none is explicitly configured.
    pub fn default_provided_key(&self) -> CondKey {
        let name = if self.id.is_empty() {
            self.cmd.rsplit('/').next().unwrap_or(&self.cmd).to_string()
        } else {
            self.id.clone()
        };
        CondKey::new_trusted(format!("{}/{}", crate::constants::PID_COND_PREFIX, name))
    }
}

//! Error handling for systemg-core.
use thiserror::Error;

use crate::cond::CondKey;

/// Top-level error taxonomy for the supervisor core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration line failed to parse or referenced an unknown signal,
    /// runlevel, or oversized argument list.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error from the condition store.
    #[error(transparent)]
    Cond(#[from] CondError),

    /// Error from the service registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Error from fork/exec/wait handling.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// Error loading or running a plugin.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Error from the event loop itself (epoll/timerfd/signal setup).
    #[error("event loop error: {0}")]
    EventLoop(String),

    /// Generic I/O error not otherwise classified.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced while registering or parsing a service directive line.
///
/// These correspond to spec.md section 7's "Validation" error kind: the
/// service is not created (or is created but blocked) and the problem is
/// logged at warning, never aborting the event loop.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The directive line had no command token at all.
    #[error("incomplete service directive, cannot register: '{0}'")]
    Incomplete(String),

    /// An unknown signal name was given to `halt:`.
    #[error("unknown signal name '{0}' in halt: directive")]
    UnknownSignal(String),

    /// `kill:` seconds fell outside the allowed 1..60 range.
    #[error("killdelay {0}s out of range (1-60), default retained")]
    KillDelayOutOfRange(u64),

    /// Expansion of argv exceeded `MAX_NUM_SVC_ARGS` or a per-arg length cap.
    #[error("argument expansion overflow for '{0}': {1}")]
    ArgExpansionOverflow(String, String),

    /// The cgroup settings string exceeded the fixed bound.
    #[error("cgroup settings for '{0}' too long (> {1} chars)")]
    CgroupSettingsTooLong(String, usize),

    /// A condition expression referenced a key with disallowed syntax
    /// (path traversal, empty segment).
    #[error("invalid condition key '{0}': {1}")]
    InvalidCondKey(String, &'static str),

    /// `env:` or `pid:` named a path the parser rejected outright (e.g. a
    /// bare `-` with nothing following the optional `!`/`-` prefix).
    #[error("invalid path in '{directive}' directive: '{path}'")]
    InvalidPath {
        /// Directive keyword that carried the bad path (`env`, `pid`, ...).
        directive: &'static str,
        /// The offending raw path token.
        path: String,
    },
}

/// Errors from the condition store.
#[derive(Debug, Error)]
pub enum CondError {
    /// The condition store is not yet available (run directory not mounted).
    #[error("condition store not available yet")]
    NotAvailable,

    /// A malformed expression was given to the aggregator.
    #[error("malformed condition expression '{0}'")]
    MalformedExpression(String),

    /// I/O error manipulating a marker file.
    #[error("condition marker I/O error for '{key}': {source}")]
    MarkerIo {
        /// The condition key whose marker file failed.
        key: CondKey,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the service registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Attempted to look up a service that is not registered.
    #[error("service '{cmd}' (id '{id}') not found")]
    NotFound {
        /// Command path of the missing service.
        cmd: String,
        /// Instance id of the missing service.
        id: String,
    },

    /// A live pid was claimed by more than one service (invariant
    /// violation; should be unreachable, surfaced defensively).
    #[error("pid {0} already tracked by another service")]
    PidCollision(u32),
}

/// Errors from fork/exec/wait handling (spec.md section 4.4 / 7).
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `cmd` did not resolve on `$PATH`.
    #[error("'{0}' missing or not in $PATH")]
    CmdMissing(String),

    /// The configured env-file does not exist.
    #[error("missing env file '{0}' for service '{1}'")]
    EnvFileMissing(String, String),

    /// `fork()` failed.
    #[error("fork failed: {0}")]
    ForkFailed(#[source] nix::Error),

    /// `waitpid()` failed.
    #[error("waitpid failed: {0}")]
    WaitFailed(#[source] nix::Error),

    /// Sending a signal to a process group failed for a reason other than
    /// "already gone" (`ESRCH`, which is handled by synthesizing a reap).
    #[error("failed to signal pid group {pid}: {source}")]
    SignalFailed {
        /// Target pid (process group leader).
        pid: i32,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// A global `norespawn` sentinel is present, or the supervisor itself
    /// was `SIGSTOP`'d.
    #[error("respawning is currently disabled")]
    NoRespawn,
}

/// Errors from plugin discovery and loading (spec.md section 4.6 / 7).
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin directory could not be read.
    #[error("failed to read plugin directory '{0}': {1}")]
    DirectoryUnreadable(String, #[source] std::io::Error),

    /// Dynamic loading of a plugin file failed; that plugin is omitted and
    /// the rest continue loading (spec.md section 7).
    #[cfg(feature = "dynamic_plugins")]
    #[error("failed to load plugin '{0}': {1}")]
    LoadFailed(String, String),

    /// A plugin declared an I/O watcher with an invalid fd.
    #[error("plugin '{0}' declared invalid io fd {1}")]
    InvalidIoFd(String, i32),
}

//! Constants and configuration values for the supervisor core.
//!
//! This module centralizes the magic numbers and well-known paths referenced
//! throughout the state machine, supervisor, and condition store.

use std::time::Duration;

// ============================================================================
// Runlevels
// ============================================================================

/// Lowest numeric runlevel. Runlevel `S` (bootstrap) is modeled separately.
pub const RUNLEVEL_MIN: u8 = 0;

/// Highest numeric runlevel.
pub const RUNLEVEL_MAX: u8 = 9;

/// Runlevels at or below this value are considered network-less; crossing
/// this boundary upward brings networking up, crossing it downward tears
/// networking down (see `facade::service_runlevel`).
pub const RUNLEVEL_NETLESS_CEILING: u8 = 1;

// ============================================================================
// Respawn / crash policy
// ============================================================================

/// Maximum number of consecutive respawn attempts before a service is marked
/// `crashing` and stops being auto-restarted until the next config reload.
pub const SVC_RESPAWN_MAX: u32 = 10;

/// Backoff delay used for the first `SVC_RESPAWN_MAX / 2` retry attempts.
pub const RETRY_DELAY_FAST: Duration = Duration::from_secs(2);

/// Backoff delay used once the fast-retry budget is exhausted.
pub const RETRY_DELAY_SLOW: Duration = Duration::from_secs(5);

/// Delay before the very first retry after a `RUNNING` daemon's child dies;
/// short enough that a quick crash-loop is visible immediately, long enough
/// not to re-enter `start()` from inside the reap callback itself.
pub const RETRY_DELAY_IMMEDIATE: Duration = Duration::from_millis(1);

// ============================================================================
// Kill delay (graceful-then-forceful termination)
// ============================================================================

/// Default kill delay applied when a service does not configure one.
pub const DEFAULT_KILL_DELAY: Duration = Duration::from_secs(3);

/// Minimum allowed kill delay, in whole seconds.
pub const KILL_DELAY_MIN_SECS: u64 = 1;

/// Maximum allowed kill delay, in whole seconds.
pub const KILL_DELAY_MAX_SECS: u64 = 60;

// ============================================================================
// Argument expansion
// ============================================================================

/// Hard cap on the number of argv entries produced by word-expansion.
pub const MAX_NUM_SVC_ARGS: usize = 32;

/// Hard cap on the length, in bytes, of a single expanded argument.
pub const MAX_ARG_LEN: usize = 4096;

/// Leading characters that must be escaped when present at the start of a
/// raw (unexpanded) argument token, matching the shell metacharacters the
/// original word-expansion routine refuses to interpret.
pub const ARG_METACHAR_LEADERS: &[char] = &['|', '<', '>', '&', ':'];

// ============================================================================
// Condition store
// ============================================================================

/// Maximum length, in bytes, of a single condition key or settings string
/// (e.g. `cgroup:` settings) accepted by the core.
pub const MAX_COND_LEN: usize = 256;

/// Directory name, under the runtime directory, holding condition marker
/// files.
pub const COND_DIR: &str = "cond";

/// Subdirectory, under `COND_DIR`, holding staged (FLUX) markers.
pub const COND_FLUX_DIR: &str = "flux";

/// Prefix applied to hook-point condition keys, e.g. `hook/basefs-up`.
pub const HOOK_COND_PREFIX: &str = "hook";

/// Prefix applied to a service's own liveness condition, e.g. `pid/foo`.
pub const PID_COND_PREFIX: &str = "pid";

// ============================================================================
// Well-known paths
// ============================================================================

/// Candidate paths checked for the global no-respawn sentinel file; if
/// either exists, `start()` refuses to launch anything.
pub const NORESPAWN_SENTINELS: &[&str] = &["/mnt/norespawn", "/tmp/norespawn"];

/// Default runtime directory root (mirrors finit's use of `/run`).
pub const DEFAULT_RUNTIME_DIR: &str = "/run/systemg-core";

/// Suffix appended to a service's identity to name its pid file.
pub const PID_FILE_SUFFIX: &str = ".pid";

// ============================================================================
// Shell / exec
// ============================================================================

/// Shell used to run a hook script when the file is not itself executable
/// but the hook-scripts feature still wants to try it.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing a command string.
pub const SHELL_COMMAND_FLAG: &str = "-c";

/// Environment variable passed to hook scripts naming the firing hook.
pub const HOOK_SCRIPT_NAME_VAR: &str = "FINIT_HOOK_NAME";

/// Environment variable passed to shutdown-family hook scripts.
pub const HOOK_SCRIPT_SHUTDOWN_VAR: &str = "FINIT_SHUTDOWN";

// ============================================================================
// Event loop
// ============================================================================

/// Max number of epoll events drained per loop turn before yielding back to
/// the reactor, bounding worst-case per-turn latency under an event storm.
pub const MAX_EPOLL_EVENTS_PER_TURN: usize = 64;

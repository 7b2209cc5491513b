//! Narrow collaborator interfaces (spec.md section 6).
//!
//! The core treats cgroup setup, output logging, TTY ownership, and pid-file
//! bookkeeping as external collaborators it only reaches through a small
//! trait per concern. Default, in-crate implementations are supplied so the
//! core is independently testable; a real init system linking this crate is
//! free to swap any of them for the genuine article (systemd-style cgroup
//! managers, a getty manager, a syslog bridge, ...).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::service::{CgroupSpec, LoggerSpec};

/// Attaches a freshly forked child to a cgroup (spec section 6, `cgroup_service`).
pub trait CgroupAttach: Send + Sync {
    /// Place `pid` into the cgroup named by `spec`. Failure is logged by the
    /// caller and never aborts the supervisor (spec section 7).
    fn attach(&self, group: &str, pid: Pid, spec: &CgroupSpec) -> io::Result<()>;
}

/// No-op cgroup attachment; used when the crate is linked without a real
/// cgroup manager (e.g. in unit tests, or on a kernel without cgroups).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCgroup;

impl CgroupAttach for NullCgroup {
    fn attach(&self, _group: &str, _pid: Pid, _spec: &CgroupSpec) -> io::Result<()> {
        Ok(())
    }
}

/// Writes `pid` into `cgroup.procs` under a root directory, the minimal
/// cgroups-v2 analogue of finit's `cgroup_service()`.
#[derive(Debug, Clone)]
pub struct FsCgroup {
    /// Root directory cgroup sub-trees are created under.
    pub root: PathBuf,
}

impl CgroupAttach for FsCgroup {
    fn attach(&self, group: &str, pid: Pid, _spec: &CgroupSpec) -> io::Result<()> {
        let dir = self.root.join(group);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("cgroup.procs"), pid.as_raw().to_string())
    }
}

/// A handle to an output sink a service's stdout/stderr may be redirected
/// into (spec section 4.4's `logger` output policy / section 6's `logit`).
pub trait LogSink: Send + Sync {
    /// Spawn (or otherwise obtain) the sink for `svc_name`, returning the fd
    /// the child should `dup2` onto stdout/stderr. `None` means the sink
    /// binary is unavailable and the caller should fall back to direct
    /// syslog framing.
    fn open(&self, svc_name: &str, spec: &LoggerSpec) -> io::Result<Option<std::os::fd::OwnedFd>>;
}

/// Looks for an external `logit`-equivalent binary on `$PATH`; returns
/// `Ok(None)` rather than erroring when it's missing, so callers fall back
/// to syslog (spec section 4.4).
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalLogger;

impl LogSink for ExternalLogger {
    fn open(&self, _svc_name: &str, _spec: &LoggerSpec) -> io::Result<Option<std::os::fd::OwnedFd>> {
        // The real logger is an out-of-scope collaborator (spec section 1);
        // the core only needs to detect its absence, which it always is in
        // the default build.
        Ok(None)
    }
}

/// Offers a reaped pid to the TTY subsystem before the core's own registry
/// lookup (spec section 4.4's `monitor()`, grounded in
/// `examples/original_source/src/tty.c`'s `tty_respawn()`).
pub trait TtyRespawn: Send + Sync {
    /// Returns `true` if the TTY subsystem claimed `pid` (it was one of its
    /// getty processes), in which case the core's `monitor()` must not look
    /// it up in its own registry.
    fn try_claim(&self, pid: Pid) -> bool;
}

/// No TTY subsystem linked; every pid is the core's own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTty;

impl TtyRespawn for NoTty {
    fn try_claim(&self, _pid: Pid) -> bool {
        false
    }
}

/// Pid-file creation/removal/parsing (spec section 6).
pub trait PidFileHelper: Send + Sync {
    /// Path the service's pid file would live at.
    fn path(&self, svc_name: &str) -> PathBuf;

    /// Create (or refresh the timestamp of) the pid file.
    fn create(&self, svc_name: &str, pid: Pid) -> io::Result<()>;

    /// Remove the pid file on reap.
    fn remove(&self, svc_name: &str) -> io::Result<()>;

    /// Parse a pid out of an existing pid file, if present and well-formed.
    fn parse(&self, svc_name: &str) -> Option<Pid>;
}

/// Pid files stored flat under a runtime directory, named `<svc>.pid`.
#[derive(Debug, Clone)]
pub struct FsPidFiles {
    /// Directory pid files are written to.
    pub dir: PathBuf,
}

impl FsPidFiles {
    fn file(&self, svc_name: &str) -> PathBuf {
        self.dir.join(format!("{svc_name}{}", crate::constants::PID_FILE_SUFFIX))
    }
}

impl PidFileHelper for FsPidFiles {
    fn path(&self, svc_name: &str) -> PathBuf {
        self.file(svc_name)
    }

    fn create(&self, svc_name: &str, pid: Pid) -> io::Result<()> {
        if let Some(parent) = self.file(svc_name).parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(self.file(svc_name), format!("{}\n", pid.as_raw()))
    }

    fn remove(&self, svc_name: &str) -> io::Result<()> {
        match fs::remove_file(self.file(svc_name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn parse(&self, svc_name: &str) -> Option<Pid> {
        let raw = fs::read_to_string(self.file(svc_name)).ok()?;
        let pid: i32 = raw.trim().parse().ok()?;
        if pid > 0 { Some(Pid::from_raw(pid)) } else { None }
    }
}

/// Brings networking up or down across a runlevel boundary (spec section
/// 4.7, `service_runlevel`). Out of scope for the core itself (Non-goals:
/// "does not... perform network configuration"); this is the narrow seam
/// the façade calls through.
pub trait NetworkControl: Send + Sync {
    /// Bring networking up when leaving a network-less runlevel (`<= 1`).
    fn up(&self) -> io::Result<()>;

    /// Tear networking down when entering a network-less runlevel.
    fn down(&self) -> io::Result<()>;
}

/// No network subsystem linked; both directions are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNetwork;

impl NetworkControl for NullNetwork {
    fn up(&self) -> io::Result<()> {
        Ok(())
    }

    fn down(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Bundle of collaborator implementations a running core is wired against.
/// Grouped into one struct so `supervisor`/`sm`/`facade` take a single
/// argument instead of five.
pub struct Collaborators {
    /// Cgroup attachment.
    pub cgroup: Box<dyn CgroupAttach>,
    /// Output logger sink.
    pub logger: Box<dyn LogSink>,
    /// TTY subsystem first-offer.
    pub tty: Box<dyn TtyRespawn>,
    /// Pid-file helper.
    pub pid_files: Box<dyn PidFileHelper>,
    /// Networking up/down across runlevel boundaries.
    pub network: Box<dyn NetworkControl>,
}

impl Collaborators {
    /// All-default set: no cgroups, no external logger, no TTY subsystem, no
    /// network subsystem, pid files under `runtime_dir`.
    pub fn defaults(runtime_dir: impl AsRef<Path>) -> Self {
        Collaborators {
            cgroup: Box::new(NullCgroup),
            logger: Box::new(ExternalLogger),
            tty: Box::new(NoTty),
            pid_files: Box::new(FsPidFiles {
                dir: runtime_dir.as_ref().to_path_buf(),
            }),
            network: Box::new(NullNetwork),
        }
    }
}

//! Fork/exec/wait supervision (spec.md section 4.4), grounded in
//! `examples/noverby-noverby/projects/rustysd`'s `start_service`/
//! `fork_os_specific` fork pattern.

use std::ffi::CString;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::resource::setrlimit;
use nix::sys::signal::{killpg, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execvp, fork, setsid, ForkResult, Gid, Group, Pid, Uid, User};
use tracing::{debug, warn};

use crate::collab::Collaborators;
use crate::constants::NORESPAWN_SENTINELS;
use crate::error::SupervisorError;
use crate::service::{LimitValue, OutputPolicy, PidFilePolicy, Service, ServiceKind};

/// What `start` did with the forked child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The child is alive; `svc.runtime.pid` is set.
    Started,
    /// The child was a `RUN` kind and was waited on synchronously before
    /// `start` returned; `svc.runtime.pid` is left unset.
    RanToCompletion,
}

/// Everything `sm::step` needs from the process layer, kept as a trait so
/// unit tests can drive the state machine against a scripted double instead
/// of forking real processes.
pub trait ProcessSupervisor {
    /// Launch `svc`'s child. `SYSV` services are invoked once with `start`
    /// appended to argv; `RUN` services are waited on synchronously.
    fn start(&mut self, svc: &mut Service) -> Result<StartOutcome, SupervisorError>;

    /// Send `svc.halt_signal` to the child's process group (graceful stop).
    fn stop(&mut self, svc: &mut Service) -> Result<(), SupervisorError>;

    /// Reload a running child in place with `SIGHUP`, used when
    /// `restart_on_reload` is false (spec section 3).
    fn restart(&mut self, svc: &mut Service) -> Result<(), SupervisorError>;

    /// `SIGSTOP` the child's process group (a condition went `FLUX`).
    fn pause(&mut self, svc: &mut Service) -> Result<(), SupervisorError>;

    /// `SIGCONT` the child's process group.
    fn resume(&mut self, svc: &mut Service) -> Result<(), SupervisorError>;

    /// `SIGKILL` the child's process group immediately (kill-timer expiry).
    fn kill_now(&mut self, svc: &mut Service) -> Result<(), SupervisorError>;
}

/// Real `ProcessSupervisor`: forks, applies privilege/resource settings,
/// `execvp`s.
pub struct ForkExecSupervisor {
    collab: Collaborators,
}

impl ForkExecSupervisor {
    /// Build a supervisor wired against the given collaborator set.
    pub fn new(collab: Collaborators) -> Self {
        ForkExecSupervisor { collab }
    }

    fn signal_group(pid: Pid, sig: Signal) -> Result<(), SupervisorError> {
        match killpg(pid, sig) {
            Ok(()) => Ok(()),
            Err(nix::Error::ESRCH) => Ok(()),
            Err(source) => Err(SupervisorError::SignalFailed {
                pid: pid.as_raw(),
                source,
            }),
        }
    }

    fn with_live_pid(svc: &Service, sig: Signal) -> Result<(), SupervisorError> {
        match svc.runtime.pid {
            Some(pid) => Self::signal_group(pid, sig),
            None => Ok(()),
        }
    }
}

impl ProcessSupervisor for ForkExecSupervisor {
    fn start(&mut self, svc: &mut Service) -> Result<StartOutcome, SupervisorError> {
        if NORESPAWN_SENTINELS.iter().any(|p| Path::new(p).exists()) {
            return Err(SupervisorError::NoRespawn);
        }

        let resolved = resolve_cmd(&svc.cmd).ok_or_else(|| SupervisorError::CmdMissing(svc.cmd.clone()))?;

        let env_vars = match &svc.env_file {
            Some(path) => {
                if !path.exists() {
                    return Err(SupervisorError::EnvFileMissing(
                        path.display().to_string(),
                        svc.identity().0.to_string(),
                    ));
                }
                parse_env_file(path)
            }
            None => Vec::new(),
        };

        let log_fd = self
            .collab
            .logger
            .open(&service_display_name(svc), logger_spec(&svc.output))
            .ok()
            .flatten();

        // Block SIGCHLD across the fork so `monitor()` can never observe the
        // reap before the parent has recorded the pid.
        let mut block = SigSet::empty();
        block.add(Signal::SIGCHLD);
        let mut old = SigSet::empty();
        let _ = nix::sys::signal::pthread_sigmask(nix::sys::signal::SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut old));

        let argv = build_argv(svc, &resolved);
        let result = unsafe { fork() };
        let restore_mask = || {
            let _ = nix::sys::signal::pthread_sigmask(nix::sys::signal::SigmaskHow::SIG_SETMASK, Some(&old), None);
        };

        match result {
            Ok(ForkResult::Child) => {
                exec_child(svc, &resolved, &argv, &env_vars, log_fd);
                // exec_child never returns on success.
                unsafe { libc::_exit(127) };
            }
            Ok(ForkResult::Parent { child }) => {
                restore_mask();
                if let Some(cgroup) = &svc.cgroup {
                    let group = cgroup
                        .group
                        .clone()
                        .unwrap_or_else(|| default_cgroup_name(svc));
                    if let Err(e) = self.collab.cgroup.attach(&group, child, cgroup) {
                        warn!(cmd = %svc.cmd, error = %e, "cgroup attach failed");
                    }
                }

                if matches!(svc.kind, ServiceKind::Run) {
                    let status = waitpid(child, None).map_err(SupervisorError::WaitFailed)?;
                    svc.runtime.status = Some(status);
                    svc.runtime.started = matches!(status, WaitStatus::Exited(_, 0));
                    debug!(cmd = %svc.cmd, ?status, "RUN service completed synchronously");
                    return Ok(StartOutcome::RanToCompletion);
                }

                svc.runtime.pid = Some(child);
                match &svc.pid_file {
                    PidFilePolicy::SelfManaged => {}
                    PidFilePolicy::Default => {
                        if let Err(e) = self.collab.pid_files.create(&service_display_name(svc), child) {
                            warn!(cmd = %svc.cmd, error = %e, "failed to write pid file");
                        }
                    }
                    PidFilePolicy::Explicit(path) => {
                        if let Err(e) = write_explicit_pid_file(path, child) {
                            warn!(cmd = %svc.cmd, error = %e, "failed to write explicit pid file");
                        }
                    }
                }
                debug!(cmd = %svc.cmd, pid = child.as_raw(), "service started");
                Ok(StartOutcome::Started)
            }
            Err(source) => {
                restore_mask();
                Err(SupervisorError::ForkFailed(source))
            }
        }
    }

    fn stop(&mut self, svc: &mut Service) -> Result<(), SupervisorError> {
        Self::with_live_pid(svc, svc.halt_signal)
    }

    fn restart(&mut self, svc: &mut Service) -> Result<(), SupervisorError> {
        Self::with_live_pid(svc, Signal::SIGHUP)
    }

    fn pause(&mut self, svc: &mut Service) -> Result<(), SupervisorError> {
        Self::with_live_pid(svc, Signal::SIGSTOP)
    }

    fn resume(&mut self, svc: &mut Service) -> Result<(), SupervisorError> {
        Self::with_live_pid(svc, Signal::SIGCONT)
    }

    fn kill_now(&mut self, svc: &mut Service) -> Result<(), SupervisorError> {
        Self::with_live_pid(svc, Signal::SIGKILL)
    }
}

fn write_explicit_pid_file(path: &Path, pid: Pid) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", pid.as_raw()))
}

fn service_display_name(svc: &Service) -> String {
    if svc.id.is_empty() {
        svc.cmd.rsplit('/').next().unwrap_or(&svc.cmd).to_string()
    } else {
        svc.id.clone()
    }
}

fn default_cgroup_name(svc: &Service) -> String {
    svc.origin_file
        .as_ref()
        .and_then(|p| p.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| service_display_name(svc))
}

fn logger_spec(policy: &OutputPolicy) -> &crate::service::LoggerSpec {
    static EMPTY: std::sync::OnceLock<crate::service::LoggerSpec> = std::sync::OnceLock::new();
    match policy {
        OutputPolicy::Logger(spec) => spec,
        _ => EMPTY.get_or_init(Default::default),
    }
}

fn build_argv(svc: &Service, resolved: &Path) -> Vec<String> {
    let mut argv = if svc.argv.is_empty() {
        vec![resolved.display().to_string()]
    } else {
        svc.argv.clone()
    };
    if matches!(svc.kind, ServiceKind::Sysv) {
        argv.push("start".to_string());
    }
    argv
}

/// Resolve `cmd` against `$PATH` if it contains no `/`; otherwise treat it
/// as a literal path. Returns `None` if no executable, regular file is
/// found.
fn resolve_cmd(cmd: &str) -> Option<PathBuf> {
    if cmd.contains('/') {
        return is_executable_file(Path::new(cmd)).then(|| PathBuf::from(cmd));
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(cmd);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Parse an env-file line-by-line: `KEY=VALUE`, blank lines and `#`/`;`
/// comments ignored, surrounding whitespace and matching quotes stripped
/// from the value.
fn parse_env_file(path: &Path) -> Vec<(String, String)> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = &value[1..value.len() - 1];
        }
        if !key.is_empty() {
            out.push((key.to_string(), value.to_string()));
        }
    }
    out
}

/// Runs entirely in the forked child: apply privilege, resource, and I/O
/// settings, then `execvp`. Never returns on success.
fn exec_child(svc: &Service, resolved: &Path, argv: &[String], env: &[(String, String)], log_fd: Option<OwnedFd>) {
    let _ = setsid();

    if let Some(home) = &svc.home {
        let _ = chdir(home);
    }

    for rlimit in &svc.rlimits {
        let soft = limit_to_raw(rlimit.soft);
        let hard = limit_to_raw(rlimit.hard);
        if setrlimit(rlimit.resource, soft, hard).is_err() {
            warn!(resource = ?rlimit.resource, "setrlimit failed in child, continuing");
        }
    }

    if let Some(group) = &svc.group {
        if let Ok(Some(g)) = Group::from_name(group) {
            let _ = nix::unistd::setgid(g.gid);
        } else if let Ok(gid) = group.parse::<u32>() {
            let _ = nix::unistd::setgid(Gid::from_raw(gid));
        }
    }
    if let Some(user) = &svc.user {
        if let Ok(Some(u)) = User::from_name(user) {
            let _ = nix::unistd::initgroups(&CString::new(user.as_str()).unwrap_or_default(), u.gid);
            let _ = nix::unistd::setuid(u.uid);
        } else if let Ok(uid) = user.parse::<u32>() {
            let _ = nix::unistd::setuid(Uid::from_raw(uid));
        }
    }

    for (key, value) in env {
        std::env::set_var(key, value);
    }

    redirect_stdio(svc, log_fd);

    // SIGCHLD was blocked in the parent for the fork window; the child must
    // not inherit that mask into the exec'd program.
    let _ = SigSet::empty().thread_set_mask();

    let Ok(path_c) = CString::new(resolved.as_os_str().as_bytes()) else {
        return;
    };
    let argv_c: Vec<CString> = argv.iter().filter_map(|a| CString::new(a.as_str()).ok()).collect();
    let _ = execvp(&path_c, &argv_c);
}

fn limit_to_raw(v: LimitValue) -> u64 {
    match v {
        LimitValue::Fixed(n) => n,
        LimitValue::Unlimited => libc::RLIM_INFINITY as u64,
    }
}

fn redirect_stdio(svc: &Service, log_fd: Option<OwnedFd>) {
    use std::os::fd::RawFd;
    const STDOUT: RawFd = 1;
    const STDERR: RawFd = 2;

    match (&svc.output, log_fd) {
        (OutputPolicy::Logger(_), Some(fd)) => {
            let raw = fd.as_raw_fd();
            unsafe {
                libc::dup2(raw, STDOUT);
                libc::dup2(raw, STDERR);
            }
        }
        (OutputPolicy::Null, _) => {
            if let Ok(null) = fs::File::options().write(true).open("/dev/null") {
                let raw = null.as_raw_fd();
                unsafe {
                    libc::dup2(raw, STDOUT);
                    libc::dup2(raw, STDERR);
                }
            }
        }
        // Console / logger-unavailable: inherit the supervisor's own stdio,
        // matching the spec's syslog-framing fallback being out of scope
        // for the forked child itself.
        _ => {}
    }
}

/// Drains every reapable child (`waitpid(-1, WNOHANG)`), routes pids the
/// TTY collaborator doesn't claim to their owning service, and re-steps it
/// (spec section 4.4, `monitor()`).
pub fn monitor(
    ctx: &mut crate::sm::StepCtx<'_>,
    tty: &dyn crate::collab::TtyRespawn,
    pid_files: &dyn crate::collab::PidFileHelper,
) -> Result<(), crate::error::CoreError> {
    loop {
        let wait_result = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG));
        let (pid, status) = match wait_result {
            Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
            Ok(other) => match other.pid() {
                Some(pid) => (pid, other),
                None => continue,
            },
            Err(e) => {
                warn!(error = %e, "waitpid failed in monitor");
                break;
            }
        };

        if tty.try_claim(pid) {
            continue;
        }
        let Some(key) = ctx.registry.find_key_by_pid(pid) else {
            debug!(pid = pid.as_raw(), "reaped pid not tracked by any service");
            continue;
        };

        {
            let svc = ctx.registry.require_mut(&key)?;
            if matches!(svc.kind, ServiceKind::Service | ServiceKind::Inetd | ServiceKind::Tty) {
                match &svc.pid_file {
                    PidFilePolicy::SelfManaged => {}
                    PidFilePolicy::Default => {
                        if let Err(e) = pid_files.remove(&service_display_name(svc)) {
                            warn!(cmd = %key.0, error = %e, "failed to remove pid file");
                        }
                    }
                    PidFilePolicy::Explicit(path) => {
                        let _ = fs::remove_file(path);
                    }
                }
            }
            svc.runtime.status = Some(status);
            svc.runtime.started = matches!(status, WaitStatus::Exited(_, 0));
        }
        ctx.registry.unbind_pid(&key);
        let _ = killpg(pid, Signal::SIGKILL);

        crate::sm::step(&key, ctx)?;
    }
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use std::collections::HashSet;

    use nix::unistd::Pid;

    use super::{ProcessSupervisor, StartOutcome};
    use crate::error::SupervisorError;
    use crate::service::Service;

    /// A scripted [`ProcessSupervisor`] double for `sm` unit tests: never
    /// forks, just flips `svc.runtime.pid` and records calls.
    pub struct ScriptedSupervisor {
        succeed: bool,
        pid: Pid,
        pub paused: HashSet<Pid>,
        pub resumed: HashSet<Pid>,
        pub stopped: HashSet<Pid>,
    }

    impl ScriptedSupervisor {
        /// Every `start` succeeds, assigning `pid`.
        pub fn always_succeeds(pid: Pid) -> Self {
            ScriptedSupervisor {
                succeed: true,
                pid,
                paused: HashSet::new(),
                resumed: HashSet::new(),
                stopped: HashSet::new(),
            }
        }

        /// Every `start` fails with a generic (non-missing) error.
        pub fn always_fails() -> Self {
            ScriptedSupervisor {
                succeed: false,
                pid: Pid::from_raw(0),
                paused: HashSet::new(),
                resumed: HashSet::new(),
                stopped: HashSet::new(),
            }
        }
    }

    impl ProcessSupervisor for ScriptedSupervisor {
        fn start(&mut self, svc: &mut Service) -> Result<StartOutcome, SupervisorError> {
            if !self.succeed {
                return Err(SupervisorError::ForkFailed(nix::Error::UnknownErrno));
            }
            svc.runtime.pid = Some(self.pid);
            Ok(StartOutcome::Started)
        }

        fn stop(&mut self, svc: &mut Service) -> Result<(), SupervisorError> {
            if let Some(pid) = svc.runtime.pid {
                self.stopped.insert(pid);
            }
            Ok(())
        }

        fn restart(&mut self, _svc: &mut Service) -> Result<(), SupervisorError> {
            Ok(())
        }

        fn pause(&mut self, svc: &mut Service) -> Result<(), SupervisorError> {
            if let Some(pid) = svc.runtime.pid {
                self.paused.insert(pid);
            }
            Ok(())
        }

        fn resume(&mut self, svc: &mut Service) -> Result<(), SupervisorError> {
            if let Some(pid) = svc.runtime.pid {
                self.resumed.insert(pid);
            }
            Ok(())
        }

        fn kill_now(&mut self, svc: &mut Service) -> Result<(), SupervisorError> {
            if let Some(pid) = svc.runtime.pid {
                self.stopped.insert(pid);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_cmd_finds_path_binary() {
        let resolved = resolve_cmd("sh");
        assert!(resolved.is_some(), "expected `sh` to resolve via $PATH");
    }

    #[test]
    fn resolve_cmd_rejects_missing_absolute_path() {
        assert!(resolve_cmd("/definitely/not/a/real/binary").is_none());
    }

    #[test]
    fn parse_env_file_strips_quotes_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env");
        fs::write(&path, "# comment\nFOO=\"bar\"\n; also a comment\nBAZ=qux\n\nEMPTY=\n").unwrap();
        let parsed = parse_env_file(&path);
        assert_eq!(
            parsed,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("BAZ".to_string(), "qux".to_string()),
                ("EMPTY".to_string(), "".to_string()),
            ]
        );
    }
}

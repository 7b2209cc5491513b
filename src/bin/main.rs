//! Minimal driver binary: wires the event loop, façade, registry, and
//! condition store together against real directive files on disk.

use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use systemg_core::cond::CondStore;
use systemg_core::collab::Collaborators;
use systemg_core::directive;
use systemg_core::error::CoreError;
use systemg_core::event_loop::{EventLoop, LoopEvent, TimerEvent, WorkItem};
use systemg_core::facade::{self, Facade};
use systemg_core::hooks::{HookCallback, HookPoint, HookScriptConfig};
use systemg_core::plugin::PluginManager;
use systemg_core::registry::Registry;
use systemg_core::runtime::{self, RuntimeMode};
use systemg_core::service::Runlevel;
use systemg_core::sm::{self, StepCtx};
use systemg_core::supervisor::{self, ForkExecSupervisor};

#[derive(Parser, Debug)]
#[command(name = "sysg-core", about = "Process-1-style service supervisor core")]
struct Cli {
    /// Directive files or directories (scanned for non-hidden files) to
    /// load services from.
    #[arg(required = true)]
    config: Vec<PathBuf>,

    /// Initial active runlevel: a digit 0-9, or "S" for the bootstrap
    /// pseudo-level.
    #[arg(long, default_value = "2")]
    runlevel: String,

    /// Run in system mode (state under /var/lib, /var/log, /etc) rather
    /// than the invoking user's home directory.
    #[arg(long)]
    sys: bool,

    /// Drop privileges after binding any privileged resources.
    #[arg(long)]
    drop_privileges: bool,

    /// Directory plugins are discovered from.
    #[arg(long, default_value = "/usr/libexec/systemg-core/plugins")]
    plugin_dir: PathBuf,

    /// Run hook scripts from this base directory (feature `hook_scripts`).
    #[arg(long)]
    hook_scripts_dir: Option<PathBuf>,
}

fn parse_runlevel(raw: &str) -> Option<Runlevel> {
    if raw.eq_ignore_ascii_case("s") {
        return Some(Runlevel::Bootstrap);
    }
    raw.parse::<u8>().ok().filter(|n| *n <= 9).map(Runlevel::Numeric)
}

fn load_directives(registry: &mut Registry, paths: &[PathBuf]) {
    for path in paths {
        let files = if path.is_dir() {
            let mut entries: Vec<PathBuf> = fs::read_dir(path)
                .into_iter()
                .flatten()
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            entries.sort();
            entries
        } else {
            vec![path.clone()]
        };

        for file in files {
            let Ok(contents) = fs::read_to_string(&file) else {
                warn!(file = %file.display(), "could not read config file, skipping");
                continue;
            };
            for line in contents.lines() {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                match directive::parse_line(trimmed, Some(file.clone())) {
                    Ok(svc) => {
                        info!(cmd = %svc.cmd, kind = %svc.kind, "service registered");
                        registry.register(svc);
                    }
                    Err(e) => {
                        warn!(file = %file.display(), line = %trimmed, error = %e, "failed to parse directive")
                    }
                }
            }
        }
    }
}

/// Reborrow a façade's fields into a fresh [`StepCtx`], without moving any
/// field out of it — needed because a single loop turn may drive several
/// step calls in sequence (several pending signals, several dirty
/// services) off the same `Facade`.
fn step_ctx<'a>(f: &'a mut Facade<'_>) -> StepCtx<'a> {
    StepCtx {
        registry: &mut *f.registry,
        cond_store: &mut *f.cond_store,
        scheduler: &mut *f.scheduler,
        supervisor: &mut *f.supervisor,
        runlevel: f.runlevel,
        teardown: f.teardown,
    }
}

fn main() -> Result<(), CoreError> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    runtime::init(if cli.sys { RuntimeMode::System } else { RuntimeMode::User });
    runtime::set_drop_privileges(cli.drop_privileges);
    runtime::capture_socket_activation();

    let runlevel = parse_runlevel(&cli.runlevel).unwrap_or(Runlevel::Numeric(2));
    let runtime_dir = runtime::cond_and_pid_dir();
    fs::create_dir_all(&runtime_dir).ok();

    let mut registry = Registry::new();
    load_directives(&mut registry, &cli.config);

    let mut cond_store = CondStore::new(runtime_dir.as_path());

    // Two independently constructed collaborator sets: one consumed by the
    // supervisor, one held by the façade for networking control. Every
    // default implementation is stateless or keyed off the same runtime
    // directory, so this never observes divergent state.
    let supervisor_collab = Collaborators::defaults(&runtime_dir);
    let facade_collab = Collaborators::defaults(&runtime_dir);
    let mut process_supervisor = ForkExecSupervisor::new(supervisor_collab);

    let mut plugin_mgr = PluginManager::new(cli.plugin_dir);
    if let Err(e) = plugin_mgr.discover(&Default::default()) {
        warn!(error = %e, "plugin discovery failed, continuing without plugins");
    }
    let mut hook_callbacks: Vec<HookCallback> = plugin_mgr.hook_callbacks();
    let script_cfg = cli.hook_scripts_dir.map(|base_dir| HookScriptConfig { base_dir });

    let mut signals = signal_hook::iterator::Signals::new([
        libc::SIGCHLD,
        libc::SIGHUP,
        libc::SIGINT,
        libc::SIGTERM,
        libc::SIGUSR1,
        libc::SIGUSR2,
        libc::SIGPWR,
    ])
    .map_err(|e| CoreError::EventLoop(format!("signal_hook setup failed: {e}")))?;

    let mut event_loop = EventLoop::new(signals.as_raw_fd())?;
    if let Err(e) = plugin_mgr.attach_io(&mut event_loop) {
        warn!(error = %e, "plugin io watcher attach failed");
    }

    {
        let mut f = Facade {
            registry: &mut registry,
            cond_store: &mut cond_store,
            scheduler: event_loop.reactor_mut(),
            supervisor: &mut process_supervisor,
            collab: &facade_collab,
            runlevel,
            teardown: false,
            reload_pending: false,
        };
        for point in [HookPoint::Banner, HookPoint::RootfsUp, HookPoint::BasefsUp, HookPoint::NetworkUp] {
            facade::dispatch_hook(&mut f, &mut hook_callbacks, point, script_cfg.as_ref())?;
        }
        facade::sm_step(&mut f)?;
    }

    let mut shutting_down = false;
    loop {
        let mut pending_io: Vec<u64> = Vec::new();

        event_loop.turn(|reactor, ev| {
            let mut f = Facade {
                registry: &mut registry,
                cond_store: &mut cond_store,
                scheduler: reactor,
                supervisor: &mut process_supervisor,
                collab: &facade_collab,
                runlevel,
                teardown: shutting_down,
                reload_pending: false,
            };

            match ev {
                LoopEvent::Signal => {
                    for signal in signals.pending() {
                        if signal == libc::SIGCHLD {
                            let mut ctx = step_ctx(&mut f);
                            if let Err(e) =
                                supervisor::monitor(&mut ctx, &*facade_collab.tty, &*facade_collab.pid_files)
                            {
                                warn!(error = %e, "monitor() failed");
                            }
                        } else if signal == libc::SIGHUP || signal == libc::SIGUSR1 {
                            if let Err(e) = facade::reload_dynamic(&mut f) {
                                warn!(error = %e, "reload_dynamic failed");
                            }
                        } else if signal == libc::SIGINT || signal == libc::SIGTERM || signal == libc::SIGPWR {
                            shutting_down = true;
                            f.teardown = true;
                            if let Err(e) = facade::dispatch_hook(
                                &mut f,
                                &mut hook_callbacks,
                                HookPoint::Shutdown,
                                script_cfg.as_ref(),
                            ) {
                                warn!(error = %e, "shutdown hook failed");
                            }
                        }
                    }
                }
                LoopEvent::Timer(TimerEvent::Retry(key)) => {
                    let mut ctx = step_ctx(&mut f);
                    if let Err(e) = sm::on_retry_timer(&key, &mut ctx) {
                        warn!(error = %e, "retry timer handler failed");
                    }
                }
                LoopEvent::Timer(TimerEvent::KillTimeout(key)) => {
                    let mut ctx = step_ctx(&mut f);
                    if let Err(e) = sm::on_kill_timeout(&key, &mut ctx) {
                        warn!(error = %e, "kill timeout handler failed");
                    }
                }
                LoopEvent::Io(tag) => {
                    // The loop instance is mutably borrowed by `turn` itself;
                    // the watcher rearm against `plugin_mgr` happens once
                    // this turn has fully returned (see below).
                    pending_io.push(tag);
                }
                LoopEvent::Work(WorkItem::Step(key)) => {
                    let mut ctx = step_ctx(&mut f);
                    if let Err(e) = sm::step(&key, &mut ctx) {
                        warn!(error = %e, "step failed");
                    }
                }
                LoopEvent::Work(WorkItem::StepAll) => {
                    if let Err(e) = facade::sm_step(&mut f) {
                        warn!(error = %e, "sm_step failed");
                    }
                }
                LoopEvent::Work(WorkItem::RunHook(point)) => {
                    if let Err(e) =
                        facade::dispatch_hook(&mut f, &mut hook_callbacks, point, script_cfg.as_ref())
                    {
                        warn!(error = %e, "hook re-dispatch failed");
                    }
                }
            }
        })?;

        for tag in pending_io {
            if let Err(e) = plugin_mgr.dispatch_io(tag, &mut event_loop) {
                warn!(error = %e, "plugin io dispatch failed");
            }
        }

        if shutting_down && registry.iter().all(|svc| svc.runtime.pid.is_none()) {
            info!("all services stopped, exiting");
            break;
        }
    }

    Ok(())
}

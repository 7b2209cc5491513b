//! Plugin Manager: discovery, filename-based dependency resolution, and
//! I/O-watcher attachment for dynamically (or statically) loaded modules
//! (spec.md section 4.6).

use std::collections::HashMap;
use std::fs;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::sys::epoll::EpollFlags;
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::event_loop::{EventLoop, IoInterest};
use crate::hooks::{HookArg, HookCallback, HookPoint};

/// What an I/O-capable plugin watches.
#[derive(Debug, Clone, Copy)]
pub struct PluginIo {
    /// The fd to watch; re-read after every invocation in case the plugin
    /// closed and reopened it (e.g. a FIFO).
    pub fd: RawFd,
    /// Requested readiness flags.
    pub flags: EpollFlags,
}

/// The contract a loaded plugin exposes. A default, no-op implementation of
/// every method except `name` is provided so a plugin only needs to
/// override what it actually uses.
pub trait PluginModule: Send {
    /// Stable plugin identity, used for dependency resolution and the
    /// duplicate-registration check.
    fn name(&self) -> &str;

    /// Other plugin filenames that must be loaded (from the same directory)
    /// before this one is considered active.
    fn depends(&self) -> Vec<String> {
        Vec::new()
    }

    /// Hook points this plugin wants a callback invoked for.
    fn hooks(&self) -> Vec<HookPoint> {
        Vec::new()
    }

    /// Invoked for each of `hooks()`, in registration order, same as any
    /// other hook callback.
    fn on_hook(&mut self, _point: HookPoint, _arg: &HookArg) {}

    /// The fd/flags this plugin wants watched, if any (spec: `io.fd > 0`
    /// with a non-null callback).
    fn io(&self) -> Option<PluginIo> {
        None
    }

    /// Invoked when the watched fd becomes ready. The loop has already
    /// stopped the watcher; returning lets the manager re-arm against
    /// whatever `io()` now reports.
    fn on_io_ready(&mut self) {}
}

type SharedModule = Arc<Mutex<Box<dyn PluginModule>>>;

struct PluginRecord {
    name: String,
    module: SharedModule,
}

/// Discovers, loads, and tracks plugin modules; owns the filename → loaded
/// mapping dependency resolution walks.
pub struct PluginManager {
    plugin_dir: PathBuf,
    records: Vec<PluginRecord>,
    io_tags: HashMap<u64, (RawFd, SharedModule)>,
    next_tag: u64,
}

/// A statically compiled-in plugin constructor, keyed by the filename it
/// stands in for. Used when the crate is built without `dynamic_plugins`,
/// or as a fallback when a `.so` fails to load (spec section 9 Design
/// Notes: "compile-time registration via a static array covers the same
/// contract").
pub type StaticFactory = fn() -> Box<dyn PluginModule>;

impl PluginManager {
    /// A manager rooted at `plugin_dir`, with no plugins loaded yet.
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        PluginManager {
            plugin_dir: plugin_dir.into(),
            records: Vec::new(),
            io_tags: HashMap::new(),
            next_tag: 1,
        }
    }

    /// True if a plugin named `name` is already loaded (duplicate
    /// registration by name is idempotent, spec section 4.6).
    pub fn is_loaded(&self, name: &str) -> bool {
        self.records.iter().any(|r| r.name == name)
    }

    /// Scan `plugin_dir` for candidate files (skipping dotfiles), loading
    /// each via `statics` (or, with `dynamic_plugins`, `libloading`),
    /// resolving `depends()` recursively before a plugin is considered
    /// active.
    pub fn discover(&mut self, statics: &HashMap<String, StaticFactory>) -> Result<(), PluginError> {
        let entries = fs::read_dir(&self.plugin_dir)
            .map_err(|e| PluginError::DirectoryUnreadable(self.plugin_dir.display().to_string(), e))?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();

        for name in names {
            self.load_by_name(&name, statics)?;
        }
        Ok(())
    }

    /// Two-pass find-by-name (spec section 4.6): exact match against
    /// already-loaded plugins first, then (if `name` has no leading `/`)
    /// the configured plugin path with a `.so` suffix appended if absent.
    fn resolve_path(&self, name: &str) -> PathBuf {
        if name.starts_with('/') {
            return PathBuf::from(name);
        }
        let mut path = self.plugin_dir.join(name);
        if path.extension().is_none() {
            path.set_extension("so");
        }
        path
    }

    /// Load `name` (idempotent), then recursively load anything it
    /// `depends()` on that isn't already present.
    fn load_by_name(&mut self, name: &str, statics: &HashMap<String, StaticFactory>) -> Result<(), PluginError> {
        if self.is_loaded(name) {
            return Ok(());
        }

        let module: Box<dyn PluginModule> = if let Some(factory) = statics.get(name) {
            factory()
        } else {
            self.load_dynamic(name)?
        };

        let depends = module.depends();
        let record = PluginRecord {
            name: name.to_string(),
            module: Arc::new(Mutex::new(module)),
        };
        self.records.push(record);
        debug!(plugin = name, "plugin loaded");

        for dep in depends {
            if !self.is_loaded(&dep) {
                self.load_by_name(&dep, statics)?;
            }
        }
        Ok(())
    }

    #[cfg(feature = "dynamic_plugins")]
    fn load_dynamic(&self, name: &str) -> Result<Box<dyn PluginModule>, PluginError> {
        let path = self.resolve_path(name);
        // Safety: the loaded library is expected to have been built against
        // the same compiler/std as this binary; a mismatched ABI is
        // undefined behaviour, not a recoverable error.
        let lib = unsafe { libloading::Library::new(&path) }
            .map_err(|e| PluginError::LoadFailed(name.to_string(), e.to_string()))?;
        let ctor: libloading::Symbol<unsafe extern "C" fn() -> Box<dyn PluginModule>> =
            unsafe { lib.get(b"systemg_plugin_register\0") }
                .map_err(|e| PluginError::LoadFailed(name.to_string(), e.to_string()))?;
        let module = unsafe { ctor() };
        std::mem::forget(lib); // keep the mapping alive for the process lifetime
        Ok(module)
    }

    #[cfg(not(feature = "dynamic_plugins"))]
    fn load_dynamic(&self, name: &str) -> Result<Box<dyn PluginModule>, PluginError> {
        Err(PluginError::InvalidIoFd(name.to_string(), -1))
    }

    /// Every hook callback contributed by loaded plugins, in registration
    /// order, ready to append to the dispatcher's callback list.
    pub fn hook_callbacks(&self) -> Vec<HookCallback> {
        let mut out = Vec::new();
        for record in &self.records {
            let points = record.module.lock().expect("plugin mutex poisoned").hooks();
            for point in points {
                let module = record.module.clone();
                let owner = record.name.clone();
                out.push(HookCallback::new(owner, point, HookArg::default(), move |arg| {
                    module.lock().expect("plugin mutex poisoned").on_hook(point, arg);
                }));
            }
        }
        out
    }

    /// Attach every I/O-capable plugin's watcher to `loop_` (spec section
    /// 4.6, "at loop start").
    pub fn attach_io(&mut self, loop_: &mut EventLoop) -> Result<(), PluginError> {
        for record in &self.records {
            let io = record.module.lock().expect("plugin mutex poisoned").io();
            if let Some(io) = io {
                if io.fd <= 0 {
                    return Err(PluginError::InvalidIoFd(record.name.clone(), io.fd));
                }
                let tag = self.next_tag;
                self.next_tag += 1;
                loop_
                    .watch_io(IoInterest { fd: io.fd, flags: io.flags }, tag)
                    .map_err(|_| PluginError::InvalidIoFd(record.name.clone(), io.fd))?;
                self.io_tags.insert(tag, (io.fd, record.module.clone()));
            }
        }
        Ok(())
    }

    /// Dispatch a ready I/O event for `tag`: stop the watcher, invoke the
    /// plugin, then re-arm against whatever fd/flags it now reports (spec
    /// section 4.6, "so the plugin may close or replace the fd"). The fd the
    /// watcher was registered under is tracked internally so the caller only
    /// needs the opaque tag the loop handed back.
    pub fn dispatch_io(&mut self, tag: u64, loop_: &mut EventLoop) -> Result<(), PluginError> {
        let Some((old_fd, module)) = self.io_tags.get(&tag).cloned() else {
            warn!(tag, "io event for unknown plugin tag");
            return Ok(());
        };
        let _ = loop_.unwatch_io(old_fd);
        module.lock().expect("plugin mutex poisoned").on_io_ready();
        if let Some(io) = module.lock().expect("plugin mutex poisoned").io() {
            loop_
                .watch_io(IoInterest { fd: io.fd, flags: io.flags }, tag)
                .map_err(|_| PluginError::InvalidIoFd(tag.to_string(), io.fd))?;
            self.io_tags.insert(tag, (io.fd, module));
        } else {
            self.io_tags.remove(&tag);
        }
        Ok(())
    }

    /// Number of loaded plugins (discovery order).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no plugins are loaded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str, Vec<String>);
    impl PluginModule for Noop {
        fn name(&self) -> &str {
            self.0
        }
        fn depends(&self) -> Vec<String> {
            self.1.clone()
        }
    }

    fn factories() -> HashMap<String, StaticFactory> {
        let mut m: HashMap<String, StaticFactory> = HashMap::new();
        m.insert("base".to_string(), || Box::new(Noop("base", vec![])));
        m.insert("extra".to_string(), || {
            Box::new(Noop("extra", vec!["base".to_string()]))
        });
        m
    }

    #[test]
    fn dependency_loads_before_duplicate_registration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("extra"), b"").unwrap();
        fs::write(dir.path().join("base"), b"").unwrap();
        let mut mgr = PluginManager::new(dir.path());
        mgr.discover(&factories()).unwrap();
        assert_eq!(mgr.len(), 2);
        assert!(mgr.is_loaded("base"));
        assert!(mgr.is_loaded("extra"));

        // Re-discovering (e.g. a second scan pass) must not duplicate.
        mgr.discover(&factories()).unwrap();
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn dotfiles_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden"), b"").unwrap();
        fs::write(dir.path().join("base"), b"").unwrap();
        let mut mgr = PluginManager::new(dir.path());
        mgr.discover(&factories()).unwrap();
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn resolve_path_appends_so_suffix() {
        let mgr = PluginManager::new("/plugins");
        assert_eq!(mgr.resolve_path("foo"), PathBuf::from("/plugins/foo.so"));
        assert_eq!(mgr.resolve_path("/abs/foo.so"), PathBuf::from("/abs/foo.so"));
    }
}

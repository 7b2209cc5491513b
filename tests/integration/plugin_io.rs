//! Scenario: an I/O-capable plugin's watched fd becomes ready, the real
//! `EventLoop` invokes its callback exactly once per turn, then re-arms
//! against whatever fd the plugin reports next (spec.md section 4.6).

#[path = "common/mod.rs"]
mod common;

use std::collections::HashMap;
use std::fs;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use nix::sys::epoll::EpollFlags;

use systemg_core::event_loop::{EventLoop, LoopEvent};
use systemg_core::plugin::{PluginIo, PluginManager, PluginModule, StaticFactory};

/// A raw, close-on-drop-free pipe pair. Uses `libc` directly rather than
/// `nix::unistd::pipe` so the plugin can own bare `RawFd`s across its own
/// struct fields without fighting `OwnedFd`'s move semantics.
fn raw_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe(2) failed");
    (fds[0], fds[1])
}

fn raw_write(fd: RawFd, byte: u8) {
    let buf = [byte];
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1, "write(2) failed");
}

fn raw_drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

fn raw_close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

/// A test plugin that watches a pipe's read end and counts readiness
/// events to a marker file (same-process fd numbers are valid to hand
/// across this indirection since the plugin and test share one address
/// space). After its first event it closes the original pipe and opens a
/// fresh one, exercising the close-and-reopen re-arm path.
struct FifoPlugin {
    read_fd: RawFd,
    write_fd_file: PathBuf,
    count_file: PathBuf,
    rotated: bool,
}

impl FifoPlugin {
    fn new() -> Self {
        let pid = std::process::id();
        let base = std::env::temp_dir().join(format!("systemg-plugin-io-test-{pid}"));
        fs::create_dir_all(&base).expect("create plugin test scratch dir");
        let write_fd_file = base.join("write_fd");
        let count_file = base.join("count");
        fs::write(&count_file, b"0").expect("init count file");

        let (read_fd, write_fd) = raw_pipe();
        fs::write(&write_fd_file, write_fd.to_string()).expect("publish write fd");
        FifoPlugin { read_fd, write_fd_file, count_file, rotated: false }
    }
}

impl PluginModule for FifoPlugin {
    fn name(&self) -> &str {
        "fifoplug"
    }

    fn io(&self) -> Option<PluginIo> {
        Some(PluginIo { fd: self.read_fd, flags: EpollFlags::EPOLLIN })
    }

    fn on_io_ready(&mut self) {
        // Drain whatever is pending so the watcher doesn't immediately
        // re-fire on re-arm.
        raw_drain(self.read_fd);

        let count: u32 = fs::read_to_string(&self.count_file).unwrap_or_default().trim().parse().unwrap_or(0);
        fs::write(&self.count_file, (count + 1).to_string()).expect("bump count");

        if !self.rotated {
            self.rotated = true;
            raw_close(self.read_fd);
            let (new_read, new_write) = raw_pipe();
            self.read_fd = new_read;
            fs::write(&self.write_fd_file, new_write.to_string()).expect("publish rotated write fd");
        }
    }
}

fn make_fifo_plugin() -> Box<dyn PluginModule> {
    Box::new(FifoPlugin::new())
}

fn read_count(count_file: &std::path::Path) -> u32 {
    fs::read_to_string(count_file).unwrap_or_default().trim().parse().unwrap_or(0)
}

fn read_write_fd(write_fd_file: &std::path::Path) -> RawFd {
    fs::read_to_string(write_fd_file).expect("read write fd file").trim().parse().expect("parse fd")
}

#[test]
fn plugin_io_watcher_rearms_after_close_and_reopen() {
    let plugin_dir = tempfile::tempdir().expect("tempdir");
    fs::write(plugin_dir.path().join("fifoplug"), b"").expect("seed plugin file");

    let mut statics: HashMap<String, StaticFactory> = HashMap::new();
    statics.insert("fifoplug".to_string(), make_fifo_plugin as StaticFactory);

    let mut mgr = PluginManager::new(plugin_dir.path());
    mgr.discover(&statics).expect("discover");
    assert_eq!(mgr.len(), 1);

    let pid = std::process::id();
    let base = std::env::temp_dir().join(format!("systemg-plugin-io-test-{pid}"));
    let write_fd_file = base.join("write_fd");
    let count_file = base.join("count");
    common::wait_for_path(&write_fd_file);

    // An unused self-pipe read end stands in for the signal source; this
    // test never sends a signal.
    let (signal_read, _signal_write) = raw_pipe();
    let mut event_loop = EventLoop::new(signal_read).expect("event loop");
    mgr.attach_io(&mut event_loop).expect("attach io");

    // First readiness: write a byte on the original pipe.
    let write_fd = read_write_fd(&write_fd_file);
    raw_write(write_fd, b'x');

    let mut pending_io = Vec::new();
    event_loop
        .turn(|_reactor, ev| {
            if let LoopEvent::Io(tag) = ev {
                pending_io.push(tag);
            }
        })
        .expect("turn");
    assert_eq!(pending_io.len(), 1, "exactly one io event per turn");
    for tag in pending_io.drain(..) {
        mgr.dispatch_io(tag, &mut event_loop).expect("dispatch io");
    }
    assert_eq!(read_count(&count_file), 1);

    // The plugin closed its original pipe and opened a new one; writing to
    // the new fd should still be observed through the re-armed watcher.
    let rotated_write_fd = read_write_fd(&write_fd_file);
    assert_ne!(rotated_write_fd, write_fd, "plugin should have rotated to a new fd");
    raw_write(rotated_write_fd, b'y');

    event_loop
        .turn(|_reactor, ev| {
            if let LoopEvent::Io(tag) = ev {
                pending_io.push(tag);
            }
        })
        .expect("second turn");
    assert_eq!(pending_io.len(), 1);
    for tag in pending_io.drain(..) {
        mgr.dispatch_io(tag, &mut event_loop).expect("dispatch io");
    }
    assert_eq!(read_count(&count_file), 2);

    raw_close(write_fd);
    raw_close(rotated_write_fd);
    raw_close(_signal_write);
    fs::remove_dir_all(&base).ok();
}

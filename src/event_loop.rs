//! The single-threaded, cooperative event loop: the only place the core
//! blocks on external I/O outside of a synchronous `waitpid` in `start`/
//! `stop` (spec section 5).
//!
//! Three event sources are multiplexed over one `epoll` instance: plugin
//! I/O watchers, a self-pipe carrying signal notifications, and a single
//! `TimerFd` re-armed to the earliest pending deadline. A deferred-work
//! queue drains fully between epoll waits so cascading `step` calls never
//! block on I/O.

use std::collections::BinaryHeap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::Signal;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tracing::trace;

use crate::constants::MAX_EPOLL_EVENTS_PER_TURN;
use crate::error::CoreError;
use crate::registry::ServiceKey;

/// Opaque identifier for an armed timer, held by the service (or plugin)
/// that owns it. Handed back to [`Scheduler::cancel_timer`].
pub type TimerId = u64;

/// What an expired timer means to the driver.
#[derive(Debug, Clone)]
pub enum TimerEvent {
    /// The graceful-to-forceful kill-timer for a service expired; send
    /// `SIGKILL` to its process group.
    KillTimeout(ServiceKey),
    /// A crash-backoff retry timer expired; re-attempt start.
    Retry(ServiceKey),
}

/// A unit of work deferred to the next loop turn.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// Re-evaluate one service.
    Step(ServiceKey),
    /// Re-evaluate every dirty service (the façade's cascading pass).
    StepAll,
    /// Re-run a hook point.
    RunHook(crate::hooks::HookPoint),
}

/// What a plugin (or other collaborator) registers an I/O watcher for.
#[derive(Debug, Clone, Copy)]
pub struct IoInterest {
    /// The fd to watch.
    pub fd: RawFd,
    /// Requested readiness flags.
    pub flags: EpollFlags,
}

/// Narrow seam through which `sm`/`facade`/`hooks`/`plugin` schedule timers
/// and deferred work without depending on the concrete event loop type —
/// the "owner holds handle" resolution to the cyclic-ownership problem
/// flagged in spec section 9 Design Notes.
pub trait Scheduler {
    /// Arm a new timer firing `after` from now. Returns its id.
    fn arm_timer(&mut self, after: Duration, event: TimerEvent) -> TimerId;

    /// Cancel a previously armed timer. A no-op if it already fired or
    /// `id` is `None`; guaranteed synchronous — after this call the timer's
    /// event will not be delivered.
    fn cancel_timer(&mut self, id: Option<TimerId>);

    /// Enqueue a unit of work for the next loop turn.
    fn schedule_work(&mut self, item: WorkItem);
}

struct ArmedTimer {
    deadline: Instant,
    id: TimerId,
    event: TimerEvent,
}

impl PartialEq for ArmedTimer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for ArmedTimer {}
impl PartialOrd for ArmedTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ArmedTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse so BinaryHeap (a max-heap) pops the earliest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

/// The timer heap plus deferred-work queue; the concrete `Scheduler` used
/// by the real event loop. Kept separable from `EventLoop` itself so unit
/// tests can drive `sm::step` against a bare `Reactor` without epoll.
pub struct Reactor {
    next_id: TimerId,
    timers: BinaryHeap<ArmedTimer>,
    cancelled: std::collections::HashSet<TimerId>,
    work: std::collections::VecDeque<WorkItem>,
}

impl Default for Reactor {
    fn default() -> Self {
        Reactor {
            next_id: 1,
            timers: BinaryHeap::new(),
            cancelled: std::collections::HashSet::new(),
            work: std::collections::VecDeque::new(),
        }
    }
}

impl Reactor {
    /// A fresh reactor with no armed timers or pending work.
    pub fn new() -> Self {
        Reactor::default()
    }

    /// Deadline of the nearest non-cancelled timer, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_cancelled_heads();
        self.timers.peek().map(|t| t.deadline)
    }

    fn drop_cancelled_heads(&mut self) {
        while let Some(top) = self.timers.peek() {
            if self.cancelled.remove(&top.id) {
                self.timers.pop();
            } else {
                break;
            }
        }
    }

    /// Pop every timer whose deadline has passed `now`, returning their
    /// events in deadline order.
    pub fn expire(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut fired = Vec::new();
        loop {
            self.drop_cancelled_heads();
            match self.timers.peek() {
                Some(top) if top.deadline <= now => {
                    let t = self.timers.pop().expect("peeked Some");
                    fired.push(t.event);
                }
                _ => break,
            }
        }
        fired
    }

    /// Drain every pending deferred-work item.
    pub fn drain_work(&mut self) -> Vec<WorkItem> {
        self.work.drain(..).collect()
    }
}

impl Scheduler for Reactor {
    fn arm_timer(&mut self, after: Duration, event: TimerEvent) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.timers.push(ArmedTimer {
            deadline: Instant::now() + after,
            id,
            event,
        });
        id
    }

    fn cancel_timer(&mut self, id: Option<TimerId>) {
        if let Some(id) = id {
            self.cancelled.insert(id);
        }
    }

    fn schedule_work(&mut self, item: WorkItem) {
        self.work.push_back(item);
    }
}

/// The real, epoll-backed event loop. Owns the self-pipe signal source, the
/// reactor (timers + deferred work), and the set of plugin I/O watchers.
/// Drives `facade::sm_step` on every relevant event.
pub struct EventLoop {
    epoll: Epoll,
    reactor: Reactor,
    signal_pipe_fd: RawFd,
    timerfd: TimerFd,
    watchers: std::collections::HashMap<RawFd, u64>,
}

impl EventLoop {
    /// Construct a loop with its epoll instance and timerfd created but not
    /// yet running; `signal_pipe_fd` is the read end of a self-pipe that
    /// `signal_hook::low_level::pipe::register` (or equivalent) has been
    /// wired to write a byte into for each watched signal.
    pub fn new(signal_pipe_fd: RawFd) -> Result<Self, CoreError> {
        let epoll = Epoll::new(EpollCreateFlags::empty())
            .map_err(|e| CoreError::EventLoop(format!("epoll_create1 failed: {e}")))?;
        let timerfd = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)
            .map_err(|e| CoreError::EventLoop(format!("timerfd_create failed: {e}")))?;

        epoll
            .add(
                signal_pipe_fd,
                EpollEvent::new(EpollFlags::EPOLLIN, signal_pipe_fd as u64),
            )
            .map_err(|e| CoreError::EventLoop(format!("epoll_ctl(signal) failed: {e}")))?;
        epoll
            .add(
                timerfd.as_fd().as_raw_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, u64::MAX),
            )
            .map_err(|e| CoreError::EventLoop(format!("epoll_ctl(timerfd) failed: {e}")))?;

        Ok(EventLoop {
            epoll,
            reactor: Reactor::new(),
            signal_pipe_fd,
            timerfd,
            watchers: std::collections::HashMap::new(),
        })
    }

    /// Mutable access to the scheduler seam (for wiring into `sm`/`facade`
    /// calls made from within signal/IO handlers).
    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    /// Register a plugin fd watcher. `tag` is an opaque identifier the
    /// caller uses to dispatch the readiness callback (spec section 4.6: the
    /// loop stops the watcher before invoking the plugin, then re-arms with
    /// the possibly-updated fd/flags).
    pub fn watch_io(&mut self, interest: IoInterest, tag: u64) -> Result<(), CoreError> {
        self.epoll
            .add(interest.fd, EpollEvent::new(interest.flags, tag))
            .map_err(|e| CoreError::EventLoop(format!("epoll_ctl(add io) failed: {e}")))?;
        self.watchers.insert(interest.fd, tag);
        Ok(())
    }

    /// Stop watching `fd` (e.g. a plugin is about to close or replace it).
    pub fn unwatch_io(&mut self, fd: RawFd) -> Result<(), CoreError> {
        if self.watchers.remove(&fd).is_some() {
            self.epoll
                .delete(fd)
                .map_err(|e| CoreError::EventLoop(format!("epoll_ctl(del io) failed: {e}")))?;
        }
        Ok(())
    }

    fn rearm_timerfd(&mut self) -> Result<(), CoreError> {
        match self.reactor.next_deadline() {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.timerfd
                    .set(
                        Expiration::OneShot(TimeSpec::from_duration(remaining)),
                        TimerSetTimeFlags::empty(),
                    )
                    .map_err(|e| CoreError::EventLoop(format!("timerfd_settime failed: {e}")))?;
            }
            None => {
                let _ = self.timerfd.unset();
            }
        }
        Ok(())
    }

    /// Block for at most one epoll pass, then drain whatever fired. Callers
    /// wrap this in their own `loop { }`; splitting it out keeps the
    /// quiescence point testable without an infinite loop.
    pub fn turn<F>(&mut self, mut dispatch: F) -> Result<(), CoreError>
    where
        F: FnMut(&mut Reactor, LoopEvent),
    {
        self.rearm_timerfd()?;
        let mut events = [EpollEvent::empty(); MAX_EPOLL_EVENTS_PER_TURN];
        let timeout: EpollTimeout = EpollTimeout::NONE;
        let n = self
            .epoll
            .wait(&mut events, timeout)
            .map_err(|e| CoreError::EventLoop(format!("epoll_wait failed: {e}")))?;

        for ev in &events[..n] {
            let tag = ev.data();
            if tag == u64::MAX {
                // Drain the timerfd's expiration counter.
                let _ = self.timerfd.wait();
                let now = Instant::now();
                for fired in self.reactor.expire(now) {
                    dispatch(&mut self.reactor, LoopEvent::Timer(fired));
                }
            } else if tag == self.signal_pipe_fd as u64 {
                dispatch(&mut self.reactor, LoopEvent::Signal);
            } else {
                trace!(fd = tag, "plugin io watcher ready");
                dispatch(&mut self.reactor, LoopEvent::Io(tag));
            }
        }

        for item in self.reactor.drain_work() {
            dispatch(&mut self.reactor, LoopEvent::Work(item));
        }
        Ok(())
    }
}

/// The three (four, counting deferred work) kinds of event a loop turn can
/// deliver to the dispatch closure.
#[derive(Debug)]
pub enum LoopEvent {
    /// A signal arrived via the self-pipe; the caller reads which one from
    /// its own signal-reading buffer and routes accordingly (`SIGCHLD` →
    /// reap, `SIGHUP`/`SIGUSR1` → reload, `SIGINT`/`SIGTERM`/`SIGPWR` →
    /// shutdown, `SIGUSR2` → dump, `SIGSTOP` sentinel → norespawn).
    Signal,
    /// A timer expired.
    Timer(TimerEvent),
    /// A watched fd (tagged, opaque to the loop) became ready.
    Io(u64),
    /// A deferred work item is due.
    Work(WorkItem),
}

/// Signals the core process reacts to (spec section 6).
pub const HANDLED_SIGNALS: &[Signal] = &[
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

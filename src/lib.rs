//! Core of a Unix process-1-style service supervisor: state machine,
//! condition graph, hook dispatch, and an I/O-driven event loop.

#![warn(unused_crate_dependencies)]
// strum_macros' derives (Display, EnumString on ServiceKind) pull in the
// strum runtime traits without an explicit `use strum::...` anywhere.
use strum as _;

/// Narrow collaborator interfaces (cgroups, logging, tty, pid files,
/// networking).
pub mod collab;

/// Reactive condition store.
pub mod cond;

/// Constants and well-known paths.
pub mod constants;

/// Directive-line parsing and argument word-expansion.
pub mod directive;

/// Error taxonomy.
pub mod error;

/// Single-threaded epoll event loop and scheduler seam.
pub mod event_loop;

/// Scheduler façade: runlevel transitions and the outer step driver.
pub mod facade;

/// Hook dispatcher.
pub mod hooks;

/// Plugin discovery and I/O-watcher attachment.
pub mod plugin;

/// Service registry.
pub mod registry;

/// Runtime paths and modes.
pub mod runtime;

/// Service data model.
pub mod service;

/// Service state machine.
pub mod sm;

/// Fork/exec/wait process supervision.
pub mod supervisor;

/// Test utilities.
#[doc(hidden)]
pub mod test_utils;

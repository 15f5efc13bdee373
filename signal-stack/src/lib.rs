//! Installation of failure signal handlers.
//!
//! Handlers are registered with `SA_SIGINFO | SA_NODEFER`, and with
//! `SA_ONSTACK` whenever the alternate signal stack could be set up, so
//! that a stack overflow can still be reported.
//!
//! The alternate stack belongs to the thread that installed the handlers.
//! Threads started afterwards should call [`setup_current_thread`]; a
//! handler that finds itself on a stack that is too small can move to a
//! spare one with [`redeliver_on_spare_stack`].
use std::io;

use libc::c_int;
use tracing::debug;

mod backend;
mod stack;

pub use backend::{FailureAction, FailureHandler};
pub use stack::{
    handler_stack_is_adequate, is_available as alt_stack_available, redeliver_on_spare_stack,
    setup_current_thread, stack_size, MIN_SIGNAL_STACK_SIZE,
};

/// The signals treated as process failures, in installation order.
pub const FAILURE_SIGNALS: [c_int; 6] = [
    libc::SIGILL,
    libc::SIGTRAP,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGSEGV,
    libc::SIGTERM,
];

const FAILURE_SIGNAL_NAMES: [(&str, c_int); 6] = [
    ("SIGILL", libc::SIGILL),
    ("SIGTRAP", libc::SIGTRAP),
    ("SIGABRT", libc::SIGABRT),
    ("SIGFPE", libc::SIGFPE),
    ("SIGSEGV", libc::SIGSEGV),
    ("SIGTERM", libc::SIGTERM),
];

/// Name of a failure signal, or `None` for any signal outside
/// [`FAILURE_SIGNALS`]. Safe to call from a signal handler.
pub fn signal_name(signum: c_int) -> Option<&'static str> {
    FAILURE_SIGNAL_NAMES
        .iter()
        .find(|&&(_, value)| value == signum)
        .map(|&(name, _)| name)
}

/// Installs `handler` for `signum`.
///
/// The first call in the process also sets up the alternate signal stack.
/// If that fails the handler is still installed, just without
/// `SA_ONSTACK`. The returned error carries the OS error code.
pub fn install_signal_handler(signum: c_int, handler: FailureHandler) -> io::Result<()> {
    let on_stack = stack::setup_once();
    FailureAction::new(handler, on_stack).install(signum)?;
    debug!(signum, on_stack, "installed failure signal handler");
    Ok(())
}

/// Installs `handler` for every signal in [`FAILURE_SIGNALS`].
///
/// Stops at the first failure; signals earlier in the list stay installed.
pub fn install_all_failure_signals(handler: FailureHandler) -> io::Result<()> {
    for &signum in FAILURE_SIGNALS.iter() {
        install_signal_handler(signum, handler)?;
    }
    Ok(())
}

/// Restores the default disposition for `signum`. Safe to call from a
/// signal handler.
pub fn restore_default(signum: c_int) -> io::Result<()> {
    FailureAction::default_action().install(signum).map(drop)
}

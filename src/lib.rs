//! Symbolic stack traces for fatal signals, written from inside the signal
//! handler without allocating or taking locks.
//!
//! ```no_run
//! use crashtrace::Config;
//!
//! // Reports SIGILL, SIGTRAP, SIGABRT, SIGFPE, SIGSEGV and SIGTERM to
//! // stderr, then lets the signal terminate the process.
//! crashtrace::install(&Config::default()).unwrap();
//! ```
//!
//! Applications that want their own handler call [`init`] once at startup,
//! install the handler with [`signal_stack::install_all_failure_signals`],
//! and call [`print`] or [`dump`] from it.
#[cfg(not(unix))]
compile_error!("crashtrace supports unix platforms only");

use libc::c_int;
use thiserror::Error;
use tracing::info;

mod config;
mod reporter;
pub mod signal_safe;
pub mod symbolize;
mod unix;

pub use config::{Config, ConfigError, Output, DEFAULT_MAX_DEPTH, MAX_DEPTH_VAR, OUTPUT_VAR};
pub use reporter::{
    deinit, dump, init, init_with, init_with_config, is_initialized, print, report, InitError,
};
pub use signal_stack;
pub use symbolize::{BacktraceSymbolizer, ErrorCallback, Frame, Symbolizer};
pub use unix::failure_handler;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unable to install a handler for signal {signal}")]
    Install {
        signal: c_int,
        #[source]
        source: std::io::Error,
    },
}

/// Initializes the reporter from `config` and installs [`failure_handler`]
/// for every failure signal.
///
/// If a handler cannot be installed the reporter is deinitialized again,
/// so the call can be retried. Handlers installed before the failure stay
/// in place; they do nothing while the reporter is uninitialized.
///
/// Only the calling thread gets a large alternate signal stack. Threads
/// spawned later should call [`signal_stack::setup_current_thread`].
pub fn install(config: &Config) -> Result<(), Error> {
    install_for(config, &signal_stack::FAILURE_SIGNALS)
}

fn install_for(config: &Config, signals: &[c_int]) -> Result<(), Error> {
    init_with_config(config)?;
    for &signal in signals {
        if let Err(source) = signal_stack::install_signal_handler(signal, failure_handler) {
            deinit();
            return Err(Error::Install { signal, source });
        }
    }
    info!(
        alt_stack = signal_stack::alt_stack_available(),
        "failure signal handlers installed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_install_can_be_retried() {
        let _serial = reporter::TEST_SERIAL.lock();
        for _ in 0..2 {
            match install_for(&Config::default(), &[libc::SIGKILL]) {
                Err(Error::Install { signal, source }) => {
                    assert_eq!(signal, libc::SIGKILL);
                    assert_eq!(source.raw_os_error(), Some(libc::EINVAL));
                }
                other => panic!("unexpected result: {:?}", other),
            }
            assert!(!is_initialized());
        }
    }
}

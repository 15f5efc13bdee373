//! The process-wide trace context and the report it writes.
//!
//! Reports look like this, one `#` line per resolved frame:
//!
//! ```text
//!
//! *************** BACKTRACES: ***************
//! EXECUTABLE: /usr/bin/app
//! TIMESTAMP:  1700000000.123456789
//! SIGNAL:     SIGSEGV
//!
//! #0:  app::parse  at  src/parse.rs:42
//! ```
//!
//! The context is shared by every thread without locking, so two threads
//! crashing at the same moment produce interleaved output. Locking inside a
//! signal handler risks deadlock, so this is left as it is.
use std::ffi::CStr;
use std::ops::ControlFlow;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};

use libc::c_int;
use parking_lot::lock_api::RawMutex;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, Output};
use crate::symbolize::{BacktraceSymbolizer, ErrorCallback, Frame, Symbolizer};
use crate::unix;

const BANNER: &str = "*************** BACKTRACES: ***************";
const UNKNOWN_SIGNAL: &str = "unknown signal";
const EXE_PATH_CAPACITY: usize = 1024;
const DEMANGLE_CAPACITY: usize = 1024;
const NO_SINK: RawFd = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("the crash reporter is already initialized")]
    AlreadyInitialized,
    #[error("unable to create the stack unwinder")]
    Unwinder,
}

struct TraceContext {
    symbolizer: Box<dyn Symbolizer>,
    max_depth: usize,
    output: Output,
    sink: AtomicI32,
    frame_index: AtomicUsize,
}

static CONTEXT: AtomicPtr<TraceContext> = AtomicPtr::new(ptr::null_mut());
// Serializes init and deinit against each other. Never taken on the crash path.
static LIFECYCLE: Mutex<()> = Mutex::const_new(RawMutex::INIT, ());

#[cfg(test)]
pub(crate) static TEST_SERIAL: Mutex<()> = Mutex::const_new(RawMutex::INIT, ());

fn report_init_error(msg: &str, errnum: i32) {
    unix::print_to(
        unix::STDERR,
        "error %d occurred while initializing the stacktrace: %s\n",
        &[errnum.into(), msg.into()],
    );
}

fn report_walk_error(msg: &str, errnum: i32) {
    unix::print_to(
        unix::STDERR,
        "error %d occurred while getting the stacktrace: %s\n",
        &[errnum.into(), msg.into()],
    );
}

/// Initializes the reporter with the default symbolizer, writing to
/// stderr and emitting frames while their index is at most `max_depth`.
pub fn init(max_depth: usize) -> Result<(), InitError> {
    init_with_config(&Config::default().with_max_depth(max_depth))
}

pub fn init_with_config(config: &Config) -> Result<(), InitError> {
    init_created(config, BacktraceSymbolizer::create)
}

fn init_created<S, F>(config: &Config, create: F) -> Result<(), InitError>
where
    S: Symbolizer,
    F: FnOnce(ErrorCallback) -> Option<S>,
{
    let symbolizer = create(report_init_error).ok_or(InitError::Unwinder)?;
    init_with(config, symbolizer)
}

/// Initializes the reporter with a caller-supplied symbolizer.
pub fn init_with<S: Symbolizer>(config: &Config, symbolizer: S) -> Result<(), InitError> {
    let _guard = LIFECYCLE.lock();
    if !CONTEXT.load(Ordering::SeqCst).is_null() {
        return Err(InitError::AlreadyInitialized);
    }
    let ctx = Box::new(TraceContext {
        symbolizer: Box::new(symbolizer),
        max_depth: config.max_depth,
        output: config.output.clone(),
        sink: AtomicI32::new(NO_SINK),
        frame_index: AtomicUsize::new(0),
    });
    CONTEXT.store(Box::into_raw(ctx), Ordering::SeqCst);
    info!(max_depth = config.max_depth, "crash reporter initialized");
    Ok(())
}

/// Frees the trace context. Does nothing if the reporter is not
/// initialized.
///
/// Must not race with a report in progress on another thread.
pub fn deinit() {
    let _guard = LIFECYCLE.lock();
    let ctx = CONTEXT.swap(ptr::null_mut(), Ordering::SeqCst);
    if !ctx.is_null() {
        // Safety: the pointer came from `Box::into_raw` in `init_with` and has
        // just been unpublished.
        drop(unsafe { Box::from_raw(ctx) });
        debug!("crash reporter deinitialized");
    }
}

pub fn is_initialized() -> bool {
    !CONTEXT.load(Ordering::SeqCst).is_null()
}

fn context() -> &'static TraceContext {
    let ctx = CONTEXT.load(Ordering::SeqCst);
    if ctx.is_null() {
        unix::print_to(
            unix::STDERR,
            "%s\n",
            &["crashtrace::init() must be called before print or dump stacktrace".into()],
        );
        unsafe { libc::abort() }
    }
    // Safety: non-null pointers in `CONTEXT` are live until `deinit`.
    unsafe { &*ctx }
}

/// Writes a report for `signal` to stderr.
///
/// Aborts the process if the reporter is not initialized.
pub fn print(signal: c_int) {
    context().capture(signal, unix::STDERR);
}

/// Appends a report for `signal` to the file at `path`, creating it if
/// needed. Does nothing if the file cannot be opened.
///
/// Aborts the process if the reporter is not initialized.
pub fn dump(signal: c_int, path: &CStr) {
    let ctx = context();
    if let Some(fd) = unix::open_append(path) {
        ctx.capture(signal, fd);
        unix::sync_and_close(fd);
    }
}

/// Writes a report for `signal` to the configured output.
///
/// Aborts the process if the reporter is not initialized.
pub fn report(signal: c_int) {
    match &context().output {
        Output::Stderr => print(signal),
        Output::File(path) => dump(signal, path),
    }
}

impl TraceContext {
    fn capture(&self, signal: c_int, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let (secs, nanos) = match unix::realtime_now() {
            Some(now) => now,
            None => return,
        };
        let mut exe_buf = [0u8; EXE_PATH_CAPACITY];
        let exe = match unix::executable_path(&mut exe_buf) {
            Some(exe) => exe,
            None => return,
        };
        let name = signal_stack::signal_name(signal).unwrap_or(UNKNOWN_SIGNAL);

        unix::print_to(fd, "\n%s\n", &[BANNER.into()]);
        unix::print_to(fd, "EXECUTABLE: %s\n", &[exe.into()]);
        unix::print_to(fd, "TIMESTAMP:  %ld.%ld\n", &[secs.into(), nanos.into()]);
        unix::print_to(fd, "SIGNAL:     %s\n\n", &[name.into()]);

        self.frame_index.store(0, Ordering::Relaxed);
        self.sink.store(fd, Ordering::Relaxed);
        self.symbolizer
            .walk(0, &mut |frame: &Frame<'_>| self.on_frame(frame), report_walk_error);
        self.sink.store(NO_SINK, Ordering::Relaxed);
        self.frame_index.store(0, Ordering::Relaxed);
    }

    fn on_frame(&self, frame: &Frame<'_>) -> ControlFlow<()> {
        self.emit(frame);
        let index = self.frame_index.fetch_add(1, Ordering::Relaxed) + 1;
        if index > self.max_depth {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Frames without a file, function or line are not printed, though
    /// they still take up an index.
    fn emit(&self, frame: &Frame<'_>) {
        let fd = self.sink.load(Ordering::Relaxed);
        if fd < 0 {
            return;
        }
        let (filename, function, line) = match (frame.filename, frame.function, frame.line) {
            (Some(filename), Some(function), Some(line)) if line != 0 => (filename, function, line),
            _ => return,
        };

        let mut demangled = [0u8; DEMANGLE_CAPACITY];
        let name = match self.symbolizer.demangle(function, &mut demangled) {
            Some(len) => &demangled[..len],
            None => function,
        };
        unix::print_to(
            fd,
            "#%lu:  %s  at  %s:%u\n",
            &[
                self.frame_index.load(Ordering::Relaxed).into(),
                name.into(),
                filename.into(),
                line.into(),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwinder_failure_leaves_reporter_uninitialized() {
        let _serial = TEST_SERIAL.lock();
        let result = init_created(&Config::default(), |on_error| {
            on_error("unable to unwind the current stack", -1);
            None::<BacktraceSymbolizer>
        });
        assert_eq!(result, Err(InitError::Unwinder));
        assert!(!is_initialized());

        init_with_config(&Config::default()).unwrap();
        assert!(is_initialized());
        deinit();
    }
}

//! Frame enumeration and symbol demangling, behind a narrow interface so
//! the reporter does not depend on any particular unwinder.
use std::fmt::{self, Write};
use std::ops::ControlFlow;
use std::os::unix::ffi::OsStrExt;
use std::str;

/// Receives unwinder diagnostics: a message and an error number (`-1`
/// when there is none). Called from the crash path, so it must not
/// allocate.
pub type ErrorCallback = fn(msg: &str, errnum: i32);

/// One resolved frame. Inlined calls are reported as separate frames
/// sharing the same `pc`.
#[derive(Copy, Clone, Debug)]
pub struct Frame<'a> {
    pub pc: usize,
    pub filename: Option<&'a [u8]>,
    /// `Some(0)` and `None` both mean the line is unknown.
    pub line: Option<u32>,
    /// The raw, possibly mangled, symbol name.
    pub function: Option<&'a [u8]>,
}

/// Walks the current call stack and turns symbol names into readable form.
///
/// Both operations are called from inside a signal handler and are never
/// called concurrently by this crate.
pub trait Symbolizer: Send + Sync + 'static {
    /// Calls `on_frame` for each frame, innermost first, after skipping
    /// `skip` frames, until it returns `Break` or the stack is exhausted.
    fn walk(
        &self,
        skip: usize,
        on_frame: &mut dyn FnMut(&Frame<'_>) -> ControlFlow<()>,
        on_error: ErrorCallback,
    );

    /// Writes the readable form of `mangled` into `out` and returns its
    /// length, or `None` if the name is not recognised or does not fit.
    fn demangle(&self, mangled: &[u8], out: &mut [u8]) -> Option<usize>;
}

/// [`Symbolizer`] backed by the `backtrace` crate, demangling Rust symbols
/// with `rustc-demangle`. Other names are left for the caller to print raw.
#[derive(Debug)]
pub struct BacktraceSymbolizer {
    _private: (),
}

impl BacktraceSymbolizer {
    /// Creates the symbolizer and loads symbol information for the running
    /// executable, so that the crash path does not have to.
    ///
    /// Returns `None` if the current stack cannot be walked at all. Missing
    /// symbol information is reported through `on_error` but is not fatal:
    /// frames are then printed without names.
    pub fn create(on_error: ErrorCallback) -> Option<Self> {
        let mut frames = 0usize;
        let mut resolved = false;
        backtrace::trace(|frame| {
            frames += 1;
            backtrace::resolve_frame(frame, |symbol| {
                resolved |= symbol.name().is_some();
            });
            !resolved
        });
        if frames == 0 {
            on_error("unable to unwind the current stack", -1);
            return None;
        }
        if !resolved {
            on_error("no symbol information available for this executable", -1);
        }
        Some(Self { _private: () })
    }
}

impl Symbolizer for BacktraceSymbolizer {
    fn walk(
        &self,
        skip: usize,
        on_frame: &mut dyn FnMut(&Frame<'_>) -> ControlFlow<()>,
        on_error: ErrorCallback,
    ) {
        let mut seen = 0usize;
        let mut flow = ControlFlow::Continue(());
        // Safety: the synchronized variants take a lock, which is not an
        // option in a signal handler. The reporter never walks from two
        // threads at once except when two threads crash together.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                seen += 1;
                if seen <= skip {
                    return true;
                }
                let pc = frame.ip() as usize;
                backtrace::resolve_frame_unsynchronized(frame, |symbol| {
                    if flow.is_break() {
                        return;
                    }
                    let name = symbol.name();
                    let resolved = Frame {
                        pc,
                        filename: symbol.filename().map(|p| p.as_os_str().as_bytes()),
                        line: symbol.lineno(),
                        function: name.as_ref().map(|n| n.as_bytes()),
                    };
                    flow = on_frame(&resolved);
                });
                flow.is_continue()
            });
        }
        if seen == 0 {
            on_error("unable to unwind the current stack", -1);
        }
    }

    fn demangle(&self, mangled: &[u8], out: &mut [u8]) -> Option<usize> {
        let name = str::from_utf8(mangled).ok()?;
        let demangled = rustc_demangle::try_demangle(name).ok()?;
        let mut writer = SliceWriter { buf: out, len: 0 };
        // `{:#}` leaves out the trailing hash.
        write!(writer, "{:#}", demangled).ok()?;
        Some(writer.len)
    }
}

/// `fmt::Write` into a fixed slice; fails rather than truncating.
struct SliceWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}

//! Thin wrappers over the async-signal-safe system calls used while a
//! report is being written.
use std::ffi::CStr;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_int, c_void};

use crate::signal_safe::{Arg, FormatBuffer};

pub const STDERR: RawFd = libc::STDERR_FILENO;

const LINE_CAPACITY: usize = 4096;
const SELF_EXE: &CStr = c"/proc/self/exe";

/// Writes all of `bytes` to `fd`, retrying after interruptions. Errors are
/// dropped: there is nobody left to report them to.
pub fn write_all(fd: RawFd, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const c_void, bytes.len()) };
        if n < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Formats one line on the stack and writes it to `fd`.
pub fn print_to(fd: RawFd, fmt: &str, args: &[Arg<'_>]) -> usize {
    let mut line = FormatBuffer::<LINE_CAPACITY>::new();
    let text = line.format(fmt, args);
    write_all(fd, text);
    text.len()
}

/// Opens `path` for appending, creating it with mode 0644.
pub fn open_append(path: &CStr) -> Option<RawFd> {
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    if fd < 0 {
        None
    } else {
        Some(fd)
    }
}

pub fn sync_and_close(fd: RawFd) {
    unsafe {
        libc::fsync(fd);
        libc::close(fd);
    }
}

/// Reads the path of the running executable into `buf`, returning the
/// filled prefix. `readlink` does not terminate its output, so one byte is
/// kept back.
pub fn executable_path(buf: &mut [u8]) -> Option<&[u8]> {
    let capacity = buf.len().checked_sub(1)?;
    let n = unsafe {
        libc::readlink(
            SELF_EXE.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            capacity,
        )
    };
    if n < 0 {
        return None;
    }
    Some(&buf[..n as usize])
}

/// Wall-clock time as seconds and nanoseconds since the epoch.
pub fn realtime_now() -> Option<(i64, i64)> {
    let mut tp: libc::timespec = unsafe { mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut tp) } < 0 {
        return None;
    }
    Some((tp.tv_sec as i64, tp.tv_nsec as i64))
}

/// Terminates the process with the default action of `signum`, falling
/// back to `_exit(1)` if that action does not end the process.
pub fn terminate_with(signum: c_int) -> ! {
    unsafe {
        if signal_stack::restore_default(signum).is_ok() {
            libc::raise(signum);
        }
        libc::_exit(1)
    }
}

static REPORTING: AtomicBool = AtomicBool::new(false);

const STACK_TOO_SMALL: &[u8] = b"\ncrashtrace: the signal stack of the crashing thread is too small for a \
backtrace; call signal_stack::setup_current_thread() when starting it\n";

/// A ready-made failure handler: reports the signal through
/// [`crate::report`], then terminates the process the way the signal
/// would have without a handler installed.
///
/// A fault raised while the report is being written skips straight to
/// termination. Nothing is reported if the reporter is not initialized.
///
/// Threads without a large enough alternate stack of their own have the
/// signal delivered again on a spare stack where the platform allows it,
/// and get a one-line notice on stderr otherwise.
pub unsafe extern "C" fn failure_handler(
    signum: c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut c_void,
) {
    if crate::is_initialized() && !REPORTING.load(Ordering::SeqCst) {
        if !signal_stack::handler_stack_is_adequate() {
            if signal_stack::redeliver_on_spare_stack(signum, ucontext) {
                return;
            }
            write_all(STDERR, STACK_TOO_SMALL);
        } else if !REPORTING.swap(true, Ordering::SeqCst) {
            crate::report(signum);
        }
    }
    terminate_with(signum)
}

use std::io;
use std::mem;
use std::ptr;

use libc::{c_int, c_void};

/// Signature of a failure handler: signal number, signal info and the
/// interrupted execution context.
pub type FailureHandler = unsafe extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

/// A signal disposition, as passed to or returned from `sigaction`.
#[derive(Clone)]
pub struct FailureAction(libc::sigaction);

impl FailureAction {
    /// An action that runs `handler` with extended info.
    ///
    /// `SA_NODEFER` keeps the signal deliverable while its own handler is
    /// running, so a fault raised by the handler itself (an internal
    /// `abort`, say) is not silently blocked.
    pub fn new(handler: FailureHandler, on_stack: bool) -> Self {
        Self(unsafe {
            let mut res: libc::sigaction = mem::zeroed();
            res.sa_sigaction = handler as usize;
            res.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
            if on_stack {
                res.sa_flags |= libc::SA_ONSTACK;
            }
            libc::sigemptyset(&mut res.sa_mask);
            res
        })
    }

    /// The default disposition for any signal.
    pub fn default_action() -> Self {
        Self(unsafe {
            let mut res: libc::sigaction = mem::zeroed();
            res.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut res.sa_mask);
            res
        })
    }

    /// Installs this action for `signum`, returning the one it replaced.
    pub fn install(&self, signum: c_int) -> io::Result<Self> {
        unsafe {
            let mut prev = mem::zeroed();
            if libc::sigaction(signum, &self.0, &mut prev) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self(prev))
        }
    }

    /// Reads the current action for `signum` without changing it.
    pub fn detect(signum: c_int) -> io::Result<Self> {
        unsafe {
            let mut res = mem::zeroed();
            if libc::sigaction(signum, ptr::null(), &mut res) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self(res))
        }
    }

    pub fn handler_address(&self) -> usize {
        self.0.sa_sigaction as usize
    }

    pub fn is_handler(&self, handler: FailureHandler) -> bool {
        self.handler_address() == handler as usize
    }

    pub fn flags(&self) -> c_int {
        self.0.sa_flags as c_int
    }

    pub fn runs_on_alt_stack(&self) -> bool {
        self.flags() & libc::SA_ONSTACK != 0
    }
}

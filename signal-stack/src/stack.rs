use std::cell::RefCell;
use std::cmp;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_int, c_void};
use tracing::{debug, warn};

/// Lower bound on the size of the alternate signal stack. The platform
/// minimum (`SIGSTKSZ`) is far too small to symbolize a backtrace on.
pub const MIN_SIGNAL_STACK_SIZE: usize = 64 * 1024;

static ALT_STACK: spin::Once<bool> = spin::Once::new();
static SPARE: spin::Once<Option<StackRegion>> = spin::Once::new();
static SPARE_TAKEN: AtomicBool = AtomicBool::new(false);

thread_local! {
    static THREAD_STACK: RefCell<Option<SignalStack>> = const { RefCell::new(None) };
}

/// Size of the alternate signal stack: the larger of the platform minimum
/// and [`MIN_SIGNAL_STACK_SIZE`], rounded up to a whole number of pages.
pub fn stack_size() -> usize {
    round_to_page(
        cmp::max(libc::SIGSTKSZ, MIN_SIGNAL_STACK_SIZE),
        page_size::get(),
    )
}

fn round_to_page(size: usize, page: usize) -> usize {
    let mask = page - 1;
    (size + mask) & !mask
}

/// An anonymous mapping of [`stack_size`] bytes with a guard page below it.
/// Unmapped on drop, after being unregistered if it is the calling
/// thread's alternate stack.
struct SignalStack {
    mapping: *mut c_void,
    page: usize,
    size: usize,
}

/// A [`SignalStack`] that has been leaked.
#[derive(Copy, Clone)]
struct StackRegion {
    sp: usize,
    size: usize,
}

impl SignalStack {
    fn allocate() -> io::Result<Self> {
        let page = page_size::get();
        let size = stack_size();
        unsafe {
            let mapping = libc::mmap(
                ptr::null_mut(),
                size + page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if mapping == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            let stack = Self {
                mapping,
                page,
                size,
            };
            if libc::mprotect(mapping, page, libc::PROT_NONE) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(stack)
        }
    }

    fn sp(&self) -> *mut c_void {
        unsafe { (self.mapping as *mut u8).add(self.page) as *mut c_void }
    }

    fn register(&self) -> io::Result<()> {
        let mut stack: libc::stack_t = unsafe { mem::zeroed() };
        stack.ss_sp = self.sp();
        stack.ss_size = self.size;
        stack.ss_flags = 0;
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn leak(self) -> StackRegion {
        let region = StackRegion {
            sp: self.sp() as usize,
            size: self.size,
        };
        mem::forget(self);
        region
    }
}

impl Drop for SignalStack {
    fn drop(&mut self) {
        if let Ok(current) = current() {
            if current.ss_sp == self.sp() && current.ss_flags & libc::SS_ONSTACK == 0 {
                let mut disable: libc::stack_t = unsafe { mem::zeroed() };
                disable.ss_flags = libc::SS_DISABLE;
                unsafe { libc::sigaltstack(&disable, ptr::null_mut()) };
            }
        }
        unsafe { libc::munmap(self.mapping, self.size + self.page) };
    }
}

fn current() -> io::Result<libc::stack_t> {
    let mut current: libc::stack_t = unsafe { mem::zeroed() };
    if unsafe { libc::sigaltstack(ptr::null(), &mut current) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(current)
}

/// Allocates and registers the alternate signal stack for the calling
/// thread, and sets aside a spare one for threads that have none.
///
/// Only the first call does any work; every later call returns the
/// outcome of that first attempt. A `false` result means handlers must be
/// installed without `SA_ONSTACK`.
///
/// Neither stack is ever freed. Other threads need
/// [`setup_current_thread`].
pub fn setup_once() -> bool {
    *ALT_STACK.call_once(|| {
        SPARE.call_once(|| match SignalStack::allocate() {
            Ok(stack) => Some(stack.leak()),
            Err(err) => {
                warn!(%err, "unable to reserve a spare signal stack");
                None
            }
        });
        match SignalStack::allocate().and_then(|stack| {
            stack.register()?;
            Ok(stack.leak())
        }) {
            Ok(stack) => {
                debug!(size = stack.size, "registered alternate signal stack");
                true
            }
            Err(err) => {
                warn!(%err, "alternate signal stack unavailable, handlers will run on the faulting stack");
                false
            }
        }
    })
}

/// Whether [`setup_once`] has run and succeeded.
pub fn is_available() -> bool {
    ALT_STACK.get().copied().unwrap_or(false)
}

/// Gives the calling thread an alternate signal stack of at least
/// [`stack_size`] bytes, unless it already has one. Returns the size of the
/// stack now registered.
///
/// The alternate stack is a per-thread setting, so [`setup_once`] only
/// covers the thread that installed the handlers. Threads spawned by std
/// get a stack of a few kilobytes, too small to write a report on; call
/// this first thing in each of them:
///
/// ```no_run
/// std::thread::spawn(|| {
///     signal_stack::setup_current_thread().ok();
///     // ...
/// });
/// ```
///
/// A stack allocated here is released when the thread exits.
pub fn setup_current_thread() -> io::Result<usize> {
    let existing = current()?;
    if existing.ss_flags & libc::SS_DISABLE == 0 && existing.ss_size >= stack_size() {
        return Ok(existing.ss_size);
    }

    let stack = SignalStack::allocate()?;
    stack.register()?;
    let size = stack.size;
    THREAD_STACK
        .try_with(move |slot| drop(slot.replace(Some(stack))))
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "thread is shutting down"))?;
    debug!(size, "registered alternate signal stack for thread");
    Ok(size)
}

/// Whether a handler running right now has room to write a report: either
/// it is on the thread's own stack, or on an alternate stack of at least
/// [`MIN_SIGNAL_STACK_SIZE`] bytes. Safe to call from a signal handler.
pub fn handler_stack_is_adequate() -> bool {
    match current() {
        Ok(stack) => {
            stack.ss_flags & libc::SS_ONSTACK == 0 || stack.ss_size >= MIN_SIGNAL_STACK_SIZE
        }
        Err(_) => true,
    }
}

/// Arranges for `signum` to be delivered again, on the spare stack, as soon
/// as the calling handler returns. Returns `false` if that is not possible,
/// in which case nothing has changed.
///
/// The spare stack is handed out once per process.
///
/// # Safety
///
/// Must be called from a handler installed with `SA_SIGINFO`, passing the
/// context pointer it received. On success the handler must return
/// without doing anything else.
pub unsafe fn redeliver_on_spare_stack(signum: c_int, ucontext: *mut c_void) -> bool {
    #[cfg(target_os = "linux")]
    {
        let spare = match SPARE.get() {
            Some(Some(spare)) => *spare,
            _ => return false,
        };
        if ucontext.is_null() || SPARE_TAKEN.swap(true, Ordering::SeqCst) {
            return false;
        }

        // The kernel reinstalls `uc_stack` as the alternate stack when the
        // handler returns.
        let uc = &mut *(ucontext as *mut libc::ucontext_t);
        uc.uc_stack.ss_sp = spare.sp as *mut c_void;
        uc.uc_stack.ss_size = spare.size;
        uc.uc_stack.ss_flags = 0;

        // Held pending until the mask saved in `uc` is restored on return.
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signum);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
        libc::raise(signum);
        true
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (signum, ucontext, &SPARE, &SPARE_TAKEN);
        false
    }
}

//! Thin wrapper around POSIX `ucontext_t` plus the stack it runs on.
//!
//! Every transition between a thread and the scheduler is either a
//! `swapcontext` (save the running context, restore another) or a
//! one-way `setcontext` (jump, never to return). Both are raw `libc`
//! calls; there is no way to model a machine-context swap in safe Rust.

use std::os::raw::c_void;

pub struct Context {
    pub ucontext: libc::ucontext_t,
    stack: Option<Box<[u8]>>,
}

impl Context {
    /// Captures the calling context as-is (used for the main thread and
    /// as a scratch value before `make` overwrites it).
    pub fn capture_current() -> Self {
        let mut ucontext: libc::ucontext_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::getcontext(&mut ucontext);
        }
        Context {
            ucontext,
            stack: None,
        }
    }

    /// Builds a fresh context that, when switched into, starts executing
    /// `entry` on its own `stack_size`-byte stack.
    pub fn new_with_entry(stack_size: usize, entry: extern "C" fn()) -> Self {
        let mut ctx = Self::capture_current();
        let mut stack = vec![0u8; stack_size].into_boxed_slice();
        ctx.ucontext.uc_link = std::ptr::null_mut();
        ctx.ucontext.uc_stack.ss_sp = stack.as_mut_ptr() as *mut c_void;
        ctx.ucontext.uc_stack.ss_size = stack_size;
        ctx.ucontext.uc_stack.ss_flags = 0;
        unsafe {
            libc::makecontext(&mut ctx.ucontext, entry, 0);
        }
        ctx.stack = Some(stack);
        ctx
    }
}

/// Save `from` and restore `to`. Returns control to the caller once
/// something later swaps back into `from`.
///
/// # Safety
/// Both contexts must be live (their stacks, if any, must outlive the
/// call), and `from`/`to` must not alias the same context.
pub unsafe fn swap(from: &mut Context, to: &mut Context) {
    libc::swapcontext(&mut from.ucontext, &mut to.ucontext);
}

/// Restore `to` without saving the caller's context. Never returns.
///
/// # Safety
/// `to` must be a live context.
pub unsafe fn jump(to: &Context) -> ! {
    libc::setcontext(&to.ucontext);
    unreachable!("setcontext returned")
}

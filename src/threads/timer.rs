//! SIGPROF-driven preemption.
//!
//! The handler is intentionally tiny: it bumps the tick counter and, if a
//! thread is currently running, swaps straight into the scheduler context
//! from inside the signal handler. That is not strictly async-signal-safe
//! (swapcontext isn't on the POSIX safe list), but it is exactly what the
//! thread library this runtime is modeled on does, and it is safe in
//! practice here because the runtime never takes a lock that the handler
//! might reacquire.

use std::os::raw::c_int;

use super::runtime;

pub const TIME_QUANTUM_MS: i64 = 10;

pub fn install() {
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = on_tick as usize;
        act.sa_flags = 0;
        libc::sigemptyset(&mut act.sa_mask);
        libc::sigaction(libc::SIGPROF, &act, std::ptr::null_mut());

        let quantum_usec = TIME_QUANTUM_MS * 1000;
        let tv = libc::timeval {
            tv_sec: quantum_usec / 1_000_000,
            tv_usec: (quantum_usec % 1_000_000) as libc::suseconds_t,
        };
        let it = libc::itimerval {
            it_interval: tv,
            it_value: tv,
        };
        libc::setitimer(libc::ITIMER_PROF, &it, std::ptr::null_mut());
    }
}

extern "C" fn on_tick(_signum: c_int) {
    let rt = runtime();
    rt.on_timer_tick();
}

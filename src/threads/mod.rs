//! A preemptive, user-level thread library.
//!
//! One real OS thread hosts many cooperative/preemptive "worker" threads,
//! each with its own stack and `ucontext_t`, switched by a scheduler that
//! runs on its own stack and is entered either voluntarily (`yield_now`,
//! blocking on a mutex or a join) or involuntarily (a `SIGPROF` tick).
//!
//! The runtime is process-global and single-threaded by design — see
//! `runtime()` below — which mirrors the single static scheduler state
//! the mechanism this models uses internally.

mod context;
mod timer;

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use context::Context;

pub const MAIN_THREAD_ID: usize = 0;
const STACK_SIZE: usize = 256 * 1024;
const TOTAL_QUEUES: usize = 8;
const AGING_QUANTA: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Psjf,
    Mlfq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ready,
    Running,
    Blocked,
    Exited,
}

struct Tcb {
    status: Status,
    context: Option<Context>,
    priority: usize,
    quantum: u64,
    create_time: Instant,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
    waiter_id: Option<usize>,
    retval: usize,
    entry: Option<Box<dyn FnOnce() -> usize>>,
}

impl Tcb {
    fn main() -> Self {
        Tcb {
            status: Status::Running,
            context: Some(Context::capture_current()),
            priority: 0,
            quantum: 0,
            create_time: Instant::now(),
            start_time: Some(Instant::now()),
            end_time: None,
            waiter_id: None,
            retval: 0,
            entry: None,
        }
    }
}

#[derive(Default, Clone, Copy)]
pub struct Stats {
    pub tot_cntx_switches: u64,
    pub avg_turnaround_ms: f64,
    pub avg_response_ms: f64,
}

pub struct Runtime {
    policy: Policy,
    threads: Vec<Option<Tcb>>,
    runqueues: Vec<VecDeque<usize>>,
    current: Option<usize>,
    scheduler_context: Option<Context>,
    next_tid: usize,
    quanta: u64,
    tot_cntx_switches: u64,
    tot_turnaround_ms: u64,
    tot_response_ms: u64,
    exited_count: u64,
    initialized: bool,
}

impl Runtime {
    const fn new() -> Self {
        Runtime {
            policy: Policy::Psjf,
            threads: Vec::new(),
            runqueues: Vec::new(),
            current: None,
            scheduler_context: None,
            next_tid: MAIN_THREAD_ID + 1,
            quanta: 0,
            tot_cntx_switches: 0,
            tot_turnaround_ms: 0,
            tot_response_ms: 0,
            exited_count: 0,
            initialized: false,
        }
    }

    fn bootstrap(&mut self, policy: Policy) {
        self.policy = policy;
        self.runqueues = (0..TOTAL_QUEUES).map(|_| VecDeque::new()).collect();
        self.threads = vec![Some(Tcb::main())];
        self.current = Some(MAIN_THREAD_ID);
        self.scheduler_context = Some(Context::new_with_entry(STACK_SIZE, scheduler_trampoline));
        timer::install();
        self.initialized = true;
        log::debug!("thread runtime initialized with {:?} policy", policy);
    }

    fn set_status(&mut self, tid: usize, status: Status) {
        self.threads[tid].as_mut().unwrap().status = status;
    }

    fn enqueue_ready(&mut self, tid: usize) {
        let prio = self.threads[tid].as_ref().unwrap().priority;
        self.runqueues[prio].push_back(tid);
    }

    fn switch_to_scheduler(&mut self) {
        let cur = self.current.expect("no current thread");
        let Runtime {
            threads,
            scheduler_context,
            ..
        } = self;
        let cur_ctx = threads[cur].as_mut().unwrap().context.as_mut().unwrap();
        let sched_ctx = scheduler_context.as_mut().unwrap();
        unsafe { context::swap(cur_ctx, sched_ctx) };
    }

    fn jump_to_scheduler(&mut self) -> ! {
        unsafe { context::jump(self.scheduler_context.as_ref().unwrap()) }
    }

    fn on_timer_tick(&mut self) {
        self.quanta += 1;
        if self.current.is_some() {
            self.switch_to_scheduler();
        }
    }

    fn spawn(&mut self, f: Box<dyn FnOnce() -> usize>) -> usize {
        let tid = self.next_tid;
        self.next_tid += 1;
        let tcb = Tcb {
            status: Status::Ready,
            context: Some(Context::new_with_entry(STACK_SIZE, thread_trampoline)),
            priority: 0,
            quantum: 0,
            create_time: Instant::now(),
            start_time: None,
            end_time: None,
            waiter_id: None,
            retval: 0,
            entry: Some(f),
        };
        if tid == self.threads.len() {
            self.threads.push(Some(tcb));
        } else {
            self.threads[tid] = Some(tcb);
        }
        self.runqueues[0].push_back(tid);
        tid
    }

    fn exit_current(&mut self, retval: usize) -> ! {
        let cur = self.current.take().expect("exit with no current thread");
        let now = Instant::now();
        let waiter = {
            let t = self.threads[cur].as_mut().unwrap();
            t.retval = retval;
            t.status = Status::Exited;
            t.end_time = Some(now);
            let turnaround = now.duration_since(t.create_time).as_millis() as u64;
            let response = t
                .start_time
                .map(|s| s.duration_since(t.create_time).as_millis() as u64)
                .unwrap_or(0);
            self.tot_turnaround_ms += turnaround;
            self.tot_response_ms += response;
            self.exited_count += 1;
            // The stack and ucontext are no longer needed; drop them now.
            // The rest of the TCB (status, retval) stays reachable so a
            // later join() can still observe it.
            t.context = None;
            t.waiter_id.take()
        };
        if let Some(w) = waiter {
            self.set_status(w, Status::Ready);
            self.enqueue_ready(w);
        }
        self.jump_to_scheduler()
    }

    fn join(&mut self, tid: usize) -> Option<usize> {
        if tid >= self.threads.len() || self.threads[tid].is_none() {
            return None;
        }
        if self.threads[tid].as_ref().unwrap().status != Status::Exited {
            let cur = self.current.expect("join called with no current thread");
            self.threads[tid].as_mut().unwrap().waiter_id = Some(cur);
            self.set_status(cur, Status::Blocked);
            self.switch_to_scheduler();
        }
        Some(self.threads[tid].as_ref().unwrap().retval)
    }

    fn dispatch(&mut self) {
        if let Some(cur) = self.current.take() {
            let status = self.threads[cur].as_ref().unwrap().status;
            match (self.policy, status) {
                (Policy::Psjf, Status::Ready) | (Policy::Psjf, Status::Running) => {
                    self.threads[cur].as_mut().unwrap().quantum += 1;
                    self.runqueues[0].push_back(cur);
                }
                (Policy::Mlfq, Status::Ready) => {
                    self.threads[cur].as_mut().unwrap().quantum += 1;
                    let prio = self.threads[cur].as_ref().unwrap().priority;
                    self.runqueues[prio].push_back(cur);
                }
                (Policy::Mlfq, Status::Running) => {
                    let t = self.threads[cur].as_mut().unwrap();
                    t.quantum += 1;
                    if t.priority < TOTAL_QUEUES - 1 {
                        t.priority += 1;
                    }
                    let prio = t.priority;
                    self.runqueues[prio].push_back(cur);
                }
                _ => {}
            }
        }

        if self.policy == Policy::Mlfq && self.quanta % AGING_QUANTA == 0 {
            for level in 1..TOTAL_QUEUES {
                while let Some(tid) = self.runqueues[level].pop_front() {
                    self.threads[tid].as_mut().unwrap().priority = 0;
                    self.runqueues[0].push_back(tid);
                }
            }
        }

        let next = match self.policy {
            Policy::Psjf => self.pick_shortest_job(),
            Policy::Mlfq => self.pick_highest_priority(),
        };

        let Some(tid) = next else { return };
        self.current = Some(tid);
        self.set_status(tid, Status::Running);
        self.tot_cntx_switches += 1;
        let t = self.threads[tid].as_mut().unwrap();
        if t.start_time.is_none() {
            t.start_time = Some(Instant::now());
        }
        let ctx_ptr: *const Context = t.context.as_ref().unwrap();
        unsafe { context::jump(&*ctx_ptr) }
    }

    fn pick_shortest_job(&mut self) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (pos, &tid) in self.runqueues[0].iter().enumerate() {
            let q = self.threads[tid].as_ref().unwrap().quantum;
            if best.map_or(true, |(_, bq)| q < bq) {
                best = Some((pos, q));
            }
        }
        let (pos, _) = best?;
        self.runqueues[0].remove(pos)
    }

    fn pick_highest_priority(&mut self) -> Option<usize> {
        for level in 0..TOTAL_QUEUES {
            if let Some(tid) = self.runqueues[level].pop_front() {
                return Some(tid);
            }
        }
        None
    }

    fn stats(&self) -> Stats {
        let n = self.exited_count.max(1) as f64;
        Stats {
            tot_cntx_switches: self.tot_cntx_switches,
            avg_turnaround_ms: self.tot_turnaround_ms as f64 / n,
            avg_response_ms: self.tot_response_ms as f64 / n,
        }
    }
}

struct RuntimeCell(UnsafeCell<Runtime>);
// SAFETY: this process is single-threaded by construction — every worker
// thread is cooperatively scheduled on the one real OS thread that calls
// into this module, so there is never a concurrent access to contend with.
unsafe impl Sync for RuntimeCell {}

static RUNTIME: RuntimeCell = RuntimeCell(UnsafeCell::new(Runtime::new()));

fn runtime() -> &'static mut Runtime {
    unsafe { &mut *RUNTIME.0.get() }
}

fn ensure_started(policy: Policy) {
    let rt = runtime();
    if !rt.initialized {
        rt.bootstrap(policy);
    }
}

extern "C" fn scheduler_trampoline() {
    loop {
        runtime().dispatch();
    }
}

extern "C" fn thread_trampoline() {
    let rt = runtime();
    let tid = rt.current.expect("thread_trampoline entered with no current tid");
    let entry = rt.threads[tid].as_mut().unwrap().entry.take();
    let retval = entry.map(|f| f()).unwrap_or(0);
    rt.exit_current(retval);
}

/// Starts the runtime (if not already running) under the given scheduling
/// policy and spawns `f` as a new worker thread, returning its id.
pub fn create<F>(policy: Policy, f: F) -> usize
where
    F: FnOnce() -> usize + 'static,
{
    ensure_started(policy);
    runtime().spawn(Box::new(f))
}

/// Voluntarily gives up the remainder of the calling thread's quantum.
pub fn yield_now() {
    let rt = runtime();
    let cur = rt.current.expect("yield_now called outside a worker thread");
    rt.set_status(cur, Status::Ready);
    rt.switch_to_scheduler();
}

/// Terminates the calling thread, publishing `retval` to a future `join`.
pub fn exit(retval: usize) -> ! {
    runtime().exit_current(retval)
}

/// Blocks until thread `tid` has exited, then returns its retval. Returns
/// `None` if `tid` never existed.
pub fn join(tid: usize) -> Option<usize> {
    runtime().join(tid)
}

/// Snapshot of scheduling statistics collected since the runtime started.
pub fn stats() -> Stats {
    runtime().stats()
}

/// Writes the scheduling statistics to stderr, matching the summary a
/// worker-thread benchmark prints on exit.
pub fn print_stats() {
    let s = stats();
    eprintln!("Total context switches: {}", s.tot_cntx_switches);
    eprintln!("Average turnaround time (ms): {:.3}", s.avg_turnaround_ms);
    eprintln!("Average response time (ms): {:.3}", s.avg_response_ms);
}

/// A cooperative mutex built on a test-and-set flag and an explicit wait
/// queue, matching the mechanism this models — no relation to
/// `std::sync::Mutex`, whose blocking is handled by the OS scheduler
/// rather than this one.
pub struct Mutex {
    locked: AtomicBool,
    owner: Option<usize>,
    waiters: VecDeque<usize>,
}

impl Mutex {
    pub fn new() -> Self {
        Mutex {
            locked: AtomicBool::new(false),
            owner: None,
            waiters: VecDeque::new(),
        }
    }

    pub fn lock(&mut self) {
        loop {
            if !self.locked.swap(true, Ordering::AcqRel) {
                let rt = runtime();
                self.owner = rt.current;
                return;
            }
            let rt = runtime();
            let cur = rt.current.expect("mutex lock outside a worker thread");
            rt.set_status(cur, Status::Blocked);
            self.waiters.push_back(cur);
            rt.switch_to_scheduler();
        }
    }

    pub fn unlock(&mut self) {
        self.locked.store(false, Ordering::Release);
        self.owner = None;
        let rt = runtime();
        while let Some(tid) = self.waiters.pop_front() {
            rt.set_status(tid, Status::Ready);
            rt.enqueue_ready(tid);
        }
    }

    /// Releases the mutex's resources. As in the library this models,
    /// there is no check that the mutex is actually unowned at this
    /// point — callers are trusted to respect that contract themselves.
    pub fn destroy(self) {}
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AOrdering};
    use std::sync::Mutex as StdMutex;

    // The runtime is one process-global scheduler (see `runtime()` above),
    // so tests that drive it can't run concurrently on separate OS
    // threads the way `cargo test` normally schedules them. This lock
    // just serializes those tests against each other.
    static TEST_SERIAL: StdMutex<()> = StdMutex::new(());

    // These tests drive the real preemptive runtime (SIGPROF is armed on
    // first use), so they run actual wall-clock thread switching. Keep
    // work small so the suite stays fast.

    #[test]
    fn two_threads_run_to_completion_and_join() {
        let _guard = TEST_SERIAL.lock().unwrap();
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let t1 = create(Policy::Psjf, || {
            for _ in 0..1000 {
                COUNTER.fetch_add(1, AOrdering::SeqCst);
                yield_now();
            }
            1
        });
        let t2 = create(Policy::Psjf, || {
            for _ in 0..1000 {
                COUNTER.fetch_add(1, AOrdering::SeqCst);
                yield_now();
            }
            2
        });
        assert_eq!(join(t1), Some(1));
        assert_eq!(join(t2), Some(2));
        assert_eq!(COUNTER.load(AOrdering::SeqCst), 2000);
    }

    #[test]
    fn join_on_already_exited_thread_returns_immediately() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let t = create(Policy::Psjf, || 42);
        assert_eq!(join(t), Some(42));
        assert_eq!(join(t), Some(42));
    }

    #[test]
    fn join_on_unknown_thread_returns_none() {
        let _guard = TEST_SERIAL.lock().unwrap();
        assert_eq!(join(999_999), None);
    }

    #[test]
    fn mutex_serializes_access_to_shared_state() {
        let _guard = TEST_SERIAL.lock().unwrap();
        static mut SHARED: u64 = 0;
        let mut m = Mutex::new();
        let m_ptr: *mut Mutex = &mut m;

        let t1 = create(Policy::Psjf, move || {
            let m = unsafe { &mut *m_ptr };
            for _ in 0..500 {
                m.lock();
                unsafe {
                    SHARED += 1;
                }
                m.unlock();
                yield_now();
            }
            0
        });
        let t2 = create(Policy::Psjf, move || {
            let m = unsafe { &mut *m_ptr };
            for _ in 0..500 {
                m.lock();
                unsafe {
                    SHARED += 1;
                }
                m.unlock();
                yield_now();
            }
            0
        });
        join(t1);
        join(t2);
        assert_eq!(unsafe { SHARED }, 1000);
    }
}

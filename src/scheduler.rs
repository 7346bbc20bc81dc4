// The MIT License (MIT)

// Copyright (c) 2016 The corc Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! VPU manager and global coroutine scheduler

use std::io::{self, Write as IoWrite};
use std::panic;
use std::process;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal};
use libc;
use linked_hash_map::LinkedHashMap;

use coroutine::{Coroutine, CoroutineType, ForceUnwind, Handle, State};
use io::{OffloadPool, PollDriver};
use join_handle::{self, JoinHandle};
use options::Options;
use runtime::processor::Processor;
use runtime::signal;
use runtime::timer::Clock;

/// Coroutine scheduler: `P` VPU worker threads over `P + 1` ready queues.
/// The queue at index `P` is the global queue; it receives fresh spawns and
/// voluntary yields, the others belong to one VPU each and receive affinity
/// wakeups.
pub struct Scheduler {
    expected_worker_count: usize,
    default_spawn_options: Options,
    preempt_tick: Option<Duration>,
    deadlock_detect: bool,

    poll_driver: Option<Box<dyn PollDriver>>,
    offload_pool: Option<Box<dyn OffloadPool>>,

    queues: Vec<Injector<Handle>>,
    next_coro_id: AtomicU32,
    work_counts: AtomicUsize,

    // Number of VPUs that are not sleeping on `idle_cond`.
    alive: Mutex<usize>,
    idle_cond: Condvar,
    shutting_down: AtomicBool,

    // Owner of every parked coroutine; doubles as the deadlock diagnostic.
    wait_list: Mutex<LinkedHashMap<u32, Handle>>,

    vpu_threads: Mutex<Vec<libc::pthread_t>>,
}

impl Scheduler {
    /// Create a scheduler with default configurations
    pub fn new() -> Scheduler {
        Scheduler {
            expected_worker_count: 1,
            default_spawn_options: Options::new(),
            preempt_tick: None,
            deadlock_detect: false,

            poll_driver: None,
            offload_pool: None,

            queues: (0..2).map(|_| Injector::new()).collect(),
            next_coro_id: AtomicU32::new(0),
            work_counts: AtomicUsize::new(0),

            alive: Mutex::new(1),
            idle_cond: Condvar::new(),
            shutting_down: AtomicBool::new(false),

            wait_list: Mutex::new(LinkedHashMap::new()),

            vpu_threads: Mutex::new(Vec::new()),
        }
    }

    /// Set the number of VPU workers
    pub fn with_workers(mut self, workers: usize) -> Scheduler {
        assert!(workers >= 1, "must have at least one worker");
        self.expected_worker_count = workers;
        self.queues = (0..workers + 1).map(|_| Injector::new()).collect();
        *self.alive.lock().unwrap() = workers;
        self
    }

    /// Set the default stack size for spawned coroutines
    pub fn default_stack_size(mut self, stack_size: usize) -> Scheduler {
        self.default_spawn_options.stack_size(stack_size);
        self
    }

    /// Enable the watchdog clock: coroutines that run past the watchdog
    /// threshold without yielding are forcibly rescheduled.
    pub fn with_preemption(mut self, tick: Duration) -> Scheduler {
        self.preempt_tick = Some(tick);
        self
    }

    /// Abort with a dump of all parked coroutines when every VPU is idle
    /// and no external I/O is pending. Leave this off when channels are
    /// also driven from threads outside the runtime; the detector cannot
    /// see those.
    pub fn with_deadlock_detection(mut self) -> Scheduler {
        self.deadlock_detect = true;
        self
    }

    /// Plug in a network poll driver.
    pub fn with_poll_driver(mut self, driver: Box<dyn PollDriver>) -> Scheduler {
        self.poll_driver = Some(driver);
        self
    }

    /// Plug in a blocking-syscall offload pool.
    pub fn with_offload_pool(mut self, pool: Box<dyn OffloadPool>) -> Scheduler {
        self.offload_pool = Some(pool);
        self
    }

    /// Get the scheduler the current VPU belongs to.
    pub fn instance() -> Option<Arc<Scheduler>> {
        Processor::current().map(|p| p.scheduler().clone())
    }

    #[inline]
    pub fn work_count(&self) -> usize {
        self.work_counts.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.expected_worker_count
    }

    #[inline]
    fn global_index(&self) -> usize {
        self.expected_worker_count
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    fn next_coroutine_id(&self) -> u32 {
        self.next_coro_id.fetch_add(1, Ordering::Relaxed)
    }

    #[doc(hidden)]
    pub fn register_vpu_thread(&self, tid: libc::pthread_t) {
        self.vpu_threads.lock().unwrap().push(tid);
    }

    #[doc(hidden)]
    pub fn vpu_threads(&self) -> Vec<libc::pthread_t> {
        self.vpu_threads.lock().unwrap().clone()
    }

    /// Run the scheduler until `f` (the main coroutine) returns.
    pub fn run<F, T>(self, f: F) -> thread::Result<T>
        where F: FnOnce() -> T + Send + 'static,
              T: Send + 'static
    {
        let sched = Arc::new(self);
        *sched.alive.lock().unwrap() = sched.expected_worker_count;

        // The main coroutine reports back over a plain channel: the calling
        // thread is not a VPU.
        let (result_tx, result_rx) = mpsc::channel();
        {
            let wrapper = move || {
                match panic::catch_unwind(panic::AssertUnwindSafe(f)) {
                    Err(err) => {
                        if err.is::<ForceUnwind>() {
                            panic::resume_unwind(err);
                        }
                        let _ = result_tx.send(Err(err));
                    }
                    Ok(val) => {
                        let _ = result_tx.send(Ok(val));
                    }
                }
            };

            let mut opts = sched.default_spawn_options.clone();
            opts.name("<main>".to_owned());

            sched.work_counts.fetch_add(1, Ordering::SeqCst);
            let main_coro = Coroutine::new(Box::new(wrapper),
                                           opts,
                                           sched.next_coroutine_id(),
                                           CoroutineType::Main,
                                           sched.global_index(),
                                           Arc::downgrade(&sched));
            sched.ready_global(main_coro);
        }

        trace!("spawning {} VPUs", sched.expected_worker_count);
        let barrier = Arc::new(Barrier::new(sched.expected_worker_count + 1));
        let handles: Vec<_> = (0..sched.expected_worker_count)
                                  .map(|tid| Processor::spawn(sched.clone(), tid, barrier.clone()))
                                  .collect();
        barrier.wait();

        let clock = sched.preempt_tick.map(|tick| Clock::start(sched.clone(), tick));

        let ret = result_rx.recv().expect("the main coroutine vanished");

        trace!("main coroutine finished, shutting down");
        sched.begin_shutdown();
        if let Some(clock) = clock {
            clock.stop();
        }
        for hdl in handles {
            let _ = hdl.join();
        }
        sched.drain();

        ret
    }

    fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _alive = self.alive.lock().unwrap();
        self.idle_cond.notify_all();
    }

    /// Drop everything the VPUs left behind. Unfinished coroutines are
    /// force-unwound by their handle drops.
    fn drain(&self) {
        for queue in &self.queues {
            while let Some(coro) = Scheduler::steal(queue) {
                drop(coro);
            }
        }
        self.wait_list.lock().unwrap().clear();
    }

    /// Spawn a new coroutine with default options
    pub fn spawn<F, T>(f: F) -> JoinHandle<T>
        where F: FnOnce() -> T + Send + 'static,
              T: Send + 'static
    {
        let opts = Scheduler::instance()
                       .expect("spawn requires a running scheduler")
                       .default_spawn_options
                       .clone();
        Scheduler::spawn_opts(f, opts)
    }

    /// Spawn a new coroutine with options
    pub fn spawn_opts<F, T>(f: F, opts: Options) -> JoinHandle<T>
        where F: FnOnce() -> T + Send + 'static,
              T: Send + 'static
    {
        let _mask = signal::MaskGuard::new();
        let sched = Scheduler::instance().expect("spawn requires a running scheduler");

        let (tx, handle) = join_handle::handle_pair();
        let wrapper = move || {
            let ret = panic::catch_unwind(panic::AssertUnwindSafe(f));
            match ret {
                Err(err) => {
                    // A torn-down coroutine keeps unwinding; everything else
                    // is delivered to the join handle.
                    if err.is::<ForceUnwind>() {
                        panic::resume_unwind(err);
                    }
                    let _ = tx.send(Err(err));
                }
                Ok(val) => {
                    let _ = tx.send(Ok(val));
                }
            }
        };

        sched.work_counts.fetch_add(1, Ordering::SeqCst);
        let coro = Coroutine::new(Box::new(wrapper),
                                  opts,
                                  sched.next_coroutine_id(),
                                  CoroutineType::Normal,
                                  sched.global_index(),
                                  Arc::downgrade(&sched));
        sched.ready_global(coro);

        handle
    }

    /// Voluntarily give up the CPU of the current coroutine.
    pub fn sched() {
        match Processor::current() {
            Some(mut p) => {
                let _mask = signal::MaskGuard::new();
                p.sched();
            }
            None => thread::yield_now(),
        }
    }

    #[doc(hidden)]
    pub fn coroutine_finished(&self) {
        self.work_counts.fetch_sub(1, Ordering::SeqCst);
    }

    /// Make a coroutine runnable on its affinity queue.
    pub fn ready(&self, mut coro: Handle) {
        coro.state = State::Ready;
        let mut idx = coro.affinity.load(Ordering::Relaxed);
        if idx >= self.queues.len() {
            idx = self.global_index();
        }
        trace!("Coroutine `{}`: ready on queue {}", coro.debug_name(), idx);
        self.queues[idx].push(coro);
        self.wakeup_one();
    }

    /// Make a coroutine runnable on the global queue (fresh spawns and
    /// voluntary yields).
    pub fn ready_global(&self, mut coro: Handle) {
        coro.state = State::Ready;
        self.queues[self.global_index()].push(coro);
        self.wakeup_one();
    }

    /// Wake a coroutine parked on the global wait list. The pointer stays
    /// valid because the wait list owns the coroutine until here.
    #[doc(hidden)]
    pub fn ready_parked(&self, ptr: NonNull<Coroutine>) {
        let id = unsafe { ptr.as_ref() }.id();
        let hdl = self.wait_list.lock().unwrap().remove(&id);
        match hdl {
            Some(coro) => self.ready(coro),
            None => debug!("coroutine #{} is not on the wait list", id),
        }
    }

    /// Take ownership of a coroutine that is going to wait. Runs on the
    /// scheduler stack, after the coroutine's context save.
    #[doc(hidden)]
    pub fn register_wait(&self, coro: Handle) {
        debug_assert_eq!(coro.state, State::Parked);
        let mut wait_list = self.wait_list.lock().unwrap();
        wait_list.insert(coro.id(), coro);
    }

    fn steal(queue: &Injector<Handle>) -> Option<Handle> {
        loop {
            match queue.steal() {
                Steal::Success(coro) => return Some(coro),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Pop from one ready queue.
    #[doc(hidden)]
    pub fn dequeue(&self, index: usize) -> Option<Handle> {
        Scheduler::steal(&self.queues[index])
    }

    /// Fetch from the global queue, then try stealing from the other VPUs
    /// in ascending id order.
    #[doc(hidden)]
    pub fn elect(&self, vpu_id: usize) -> Option<Handle> {
        if let Some(coro) = self.dequeue(self.global_index()) {
            return Some(coro);
        }

        for index in 0..self.expected_worker_count {
            if index == vpu_id {
                continue;
            }
            if let Some(coro) = self.dequeue(index) {
                trace!("VPU#{}: stole Coroutine `{}` from VPU#{}",
                       vpu_id,
                       coro.debug_name(),
                       index);
                return Some(coro);
            }
        }

        None
    }

    #[doc(hidden)]
    pub fn poll_network(&self, block: bool) -> usize {
        match self.poll_driver {
            Some(ref driver) => driver.poll(self, block),
            None => 0,
        }
    }

    fn poll_pending(&self) -> usize {
        self.poll_driver.as_ref().map_or(0, |d| d.pending())
    }

    #[doc(hidden)]
    pub fn offload_completed(&self) -> Option<Handle> {
        self.offload_pool.as_ref().and_then(|p| p.completed())
    }

    fn offload_working(&self) -> bool {
        self.offload_pool.as_ref().map_or(false, |p| p.working())
    }

    fn has_ready_work(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }

    /// Called by a VPU that found nothing to run for a while. Sleeps until
    /// `wakeup_one`; the last VPU standing with no external I/O in flight
    /// declares deadlock instead (when detection is enabled).
    #[doc(hidden)]
    pub fn idle_wait(&self) {
        let mut alive = self.alive.lock().unwrap();
        *alive -= 1;

        if *alive == 0 && self.deadlock_detect && !self.has_ready_work() &&
           self.poll_pending() == 0 && !self.offload_working() &&
           !self.is_shutting_down() {
            *alive += 1;
            drop(alive);
            self.report_deadlock();
        }

        // The last awake VPU keeps spinning while descriptors are pending:
        // someone has to poll the network driver.
        if *alive == 0 && self.poll_pending() > 0 {
            *alive += 1;
            return;
        }

        // Re-check under the manager lock: ready() enqueues before it takes
        // this lock to signal, so nothing can slip in unnoticed.
        if self.has_ready_work() || self.is_shutting_down() {
            *alive += 1;
            return;
        }

        let mut alive = self.idle_cond.wait(alive).unwrap();
        *alive += 1;
    }

    /// Wake one sleeping VPU after a coroutine was made ready.
    #[doc(hidden)]
    pub fn wakeup_one(&self) {
        let alive = self.alive.lock().unwrap();
        if *alive < self.expected_worker_count {
            self.idle_cond.notify_one();
        }
    }

    fn report_deadlock(&self) -> ! {
        let stderr = io::stderr();
        let mut stderr = stderr.lock();
        let wait_list = self.wait_list.lock().unwrap();

        let _ = writeln!(stderr,
                         "all VPUs are idle and no I/O is pending: deadlock; {} coroutine(s) \
                          parked:",
                         wait_list.len());
        for (_, coro) in wait_list.iter() {
            let _ = writeln!(stderr, "  Coroutine `{}` ({:?})", coro.debug_name(), coro.state);
        }
        let _ = stderr.flush();

        process::abort();
    }
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_join_basic() {
        Scheduler::new()
            .run(|| {
                let guard = Scheduler::spawn(|| 1);

                assert_eq!(1, guard.join().unwrap());
            })
            .unwrap();
    }

    #[test]
    fn test_join_panic() {
        Scheduler::new()
            .run(|| {
                let guard = Scheduler::spawn(|| panic!("oops"));

                assert!(guard.join().is_err());
            })
            .unwrap();
    }

    #[test]
    fn test_sched_yield() {
        Scheduler::new()
            .run(|| {
                let guard = Scheduler::spawn(|| {
                    for _ in 0..10 {
                        Scheduler::sched();
                    }
                    7
                });

                assert_eq!(7, guard.join().unwrap());
            })
            .unwrap();
    }

    #[test]
    fn test_spawn_inside_spawn() {
        Scheduler::new()
            .with_workers(2)
            .run(|| {
                let guard = Scheduler::spawn(|| {
                    let inner = Scheduler::spawn(|| 41);
                    inner.join().unwrap() + 1
                });

                assert_eq!(42, guard.join().unwrap());
            })
            .unwrap();
    }

    #[test]
    fn test_run_returns_main_result() {
        let result = Scheduler::new().run(|| "done").unwrap();
        assert_eq!(result, "done");
    }
}

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

//! Processing unit of a thread (VPU)

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread::{self, Builder};

use libc;

use coroutine::{Coroutine, Handle, State};
use runtime::signal;
use scheduler::Scheduler;

/// Forced reschedules kick in after this many unanswered clock ticks.
pub const WATCHDOG_THRESHOLD: u32 = 3;

/// Empty election rounds before a VPU goes to sleep on the manager condvar.
const MAX_SPIN_LOOPS: u32 = 16;

thread_local!(static PROCESSOR: UnsafeCell<Option<Processor>> = UnsafeCell::new(None));

#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

unsafe impl Send for Processor {}
unsafe impl Sync for Processor {}

/// Processing unit of a thread
pub struct ProcessorInner {
    id: usize,
    scheduler: Arc<Scheduler>,

    // NOTE: ONLY to be used by resume() and take_current_coroutine().
    current_coro: Option<Handle>,
    take_coro_cb: Option<&'static mut dyn FnMut(Handle)>,

    // True exactly while control is on a user coroutine's stack; the clock
    // handler keys off this so the scheduler stack is never preempted.
    in_user: Cell<bool>,

    ticks: u64,
    watchdog: u32,
}

impl Processor {
    fn new(sched: Arc<Scheduler>, id: usize) -> Processor {
        Processor {
            inner: Arc::new(ProcessorInner {
                id: id,
                scheduler: sched,

                current_coro: None,
                take_coro_cb: None,

                in_user: Cell::new(false),

                ticks: 0,
                watchdog: 0,
            }),
        }
    }

    /// Start the worker thread for VPU `id`. The thread's native stack
    /// becomes the scheduler context.
    pub fn spawn(sched: Arc<Scheduler>, id: usize, barrier: Arc<Barrier>) -> thread::JoinHandle<()> {
        let mut p = Processor::new(sched, id);

        Builder::new()
            .name(format!("VPU#{}", id))
            .spawn(move || {
                p.scheduler().register_vpu_thread(unsafe { libc::pthread_self() });
                Processor::set_tls(&p);
                barrier.wait();
                signal::enter_scheduler();
                p.schedule();
            })
            .unwrap()
    }

    fn set_tls(p: &Processor) {
        PROCESSOR.with(|proc_opt| unsafe {
            let proc_opt = &mut *proc_opt.get();
            *proc_opt = Some(p.clone());
        })
    }

    /// Get the thread local processor.
    pub fn current() -> Option<Processor> {
        PROCESSOR.with(|proc_opt| unsafe { (&*proc_opt.get()).clone() })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn current_coroutine(&mut self) -> Option<&mut Handle> {
        self.current_coro.as_mut()
    }

    /// Raw pointer to the running coroutine, used by select to claim it.
    pub fn running_coroutine_ptr(&self) -> Option<NonNull<Coroutine>> {
        self.current_coro.as_ref().map(|hdl| hdl.as_ptr())
    }

    /// Run the VPU scheduler loop. Election order: own ready queue, then a
    /// non-blocking poll of the network driver, then the global queue and
    /// the siblings' queues in ascending id order, then the syscall offload
    /// pool. A VPU that stays empty-handed sleeps on the manager condvar.
    fn schedule(&mut self) {
        trace!("{:?}: starts", self);

        let sched = self.scheduler().clone();
        let mut idle_loops = 0u32;

        while !sched.is_shutting_down() {
            if let Some(coro) = sched.dequeue(self.id) {
                idle_loops = 0;
                self.resume(coro);
                continue;
            }

            sched.poll_network(false);

            let candidate = sched.elect(self.id).or_else(|| sched.offload_completed());
            if let Some(coro) = candidate {
                idle_loops = 0;
                self.resume(coro);
                continue;
            }

            idle_loops += 1;
            if idle_loops > MAX_SPIN_LOOPS {
                idle_loops = 0;
                sched.idle_wait();
            } else {
                thread::yield_now();
            }
        }

        trace!("{:?}: dropping coroutines in the local queue", self);
        while let Some(coro) = sched.dequeue(self.id) {
            drop(coro);
        }

        trace!("{:?}: is shutdown", self);
    }

    /// Elect the given coroutine: switch onto its stack and dispatch
    /// whatever it yielded with once control is back here.
    fn resume(&mut self, mut coro: Handle) {
        debug_assert!(!coro.is_finished(), "cannot resume a finished coroutine");
        trace!("{:?}: resuming Coroutine `{}`", self, coro.debug_name());

        self.watchdog = 0;
        coro.state = State::Running;
        coro.affinity.store(self.id, Ordering::Relaxed);

        let nest = coro.sigmask_nest;
        let ptr = coro.as_ptr();
        self.current_coro = Some(coro);

        signal::prepare_switch(nest);
        let _ = unsafe { (&mut *ptr.as_ptr()).resume(0) };
        signal::enter_scheduler();

        let coro = self.current_coro.take().expect("current coroutine vanished");

        match coro.state {
            State::Suspended => {
                trace!("Coroutine `{}`: yielded", coro.debug_name());
                self.scheduler().ready_global(coro);
            }
            State::Parked => {
                // The callback registers the coroutine with whatever it is
                // waiting on and releases the caller's lock: strictly after
                // the context save, on this stack.
                let cb = self.take_coro_cb.take().expect("parked without a callback");
                cb(coro);
            }
            State::Finished => {
                // The coroutine's own stack cannot free itself; the record
                // dies here, on the scheduler stack.
                trace!("Coroutine `{}`: destroying", coro.debug_name());
                self.scheduler().coroutine_finished();
                drop(coro);
            }
            s => panic!("coroutine yielded with invalid state {:?}", s),
        }
    }

    /// Suspend the current coroutine with the given state. Returns once the
    /// coroutine is elected again.
    pub fn yield_with(&mut self, state: State, data: usize) {
        let ptr = {
            let coro = self.current_coro.as_mut().expect("no coroutine running on this VPU");
            coro.sigmask_nest = signal::save_nest();
            coro.as_ptr()
        };

        self.in_user.set(false);
        // NOTE: when this returns the coroutine may be running on a
        // different VPU; `self` must not be touched anymore.
        let _ = unsafe { (&mut *ptr.as_ptr()).yield_with(state, data) };
    }

    /// Voluntary reschedule: back onto the global ready queue.
    pub fn sched(&mut self) {
        self.yield_with(State::Suspended, 0)
    }

    /// Obtains the currently running coroutine after setting its state to
    /// Parked. The callback runs on the scheduler stack once the context
    /// save completed.
    ///
    /// NOTE: do not call Scheduler or Processor methods in the callback,
    /// other than making coroutines ready.
    pub fn take_current_coroutine<U, F>(&mut self, f: F) -> U
        where F: FnOnce(Handle) -> U
    {
        let mut f = Some(f);
        let mut r = None;

        {
            let mut cb = |coro: Handle| r = Some((f.take().unwrap())(coro));

            // NOTE: Circumvents the transmute size check; the reference dies
            // before this frame resumes.
            let cb_ref: &mut dyn FnMut(Handle) = &mut cb;
            let cb_ref_static: &'static mut dyn FnMut(Handle) = unsafe { mem::transmute(cb_ref) };

            // Gets executed as soon as the context save completes in resume().
            self.take_coro_cb = Some(cb_ref_static);
            self.yield_with(State::Parked, 0);
        }

        r.expect("park callback did not run")
    }

    /// Park the current coroutine on the global wait list, then run
    /// `release` (the caller's unlock handler) on the scheduler stack.
    pub fn park_and_release<F: FnOnce()>(&mut self, release: F) {
        let sched = self.scheduler().clone();
        self.take_current_coroutine(move |coro| {
            sched.register_wait(coro);
            release();
        });
    }

    /// Clock tick delivered by the watchdog signal handler.
    pub fn on_clock_tick(&mut self) {
        self.ticks += 1;

        // The scheduler stack is never preempted.
        if !self.in_user.get() || self.current_coro.is_none() {
            return;
        }

        self.watchdog += 1;
        if self.watchdog > WATCHDOG_THRESHOLD {
            self.watchdog = 0;
            self.sched();
        }
    }
}

/// Called by a coroutine right after it gains control of its VPU.
pub fn coroutine_entered() {
    if let Some(p) = Processor::current() {
        p.in_user.set(true);
    }
    signal::after_switch();
}

/// Called by a coroutine right before it leaves its stack for good.
pub fn coroutine_exiting() {
    if let Some(p) = Processor::current() {
        p.in_user.set(false);
    }
}

impl Deref for Processor {
    type Target = ProcessorInner;

    #[inline]
    fn deref(&self) -> &ProcessorInner {
        self.inner.deref()
    }
}

impl DerefMut for Processor {
    #[inline]
    #[allow(invalid_reference_casting)]
    fn deref_mut(&mut self) -> &mut ProcessorInner {
        unsafe { &mut *(self.inner.deref() as *const ProcessorInner as *mut ProcessorInner) }
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Processor(#{})", self.id())
    }
}

impl Eq for Processor {}

impl PartialEq for Processor {
    fn eq(&self, other: &Processor) -> bool {
        let a = self.inner.deref() as *const ProcessorInner;
        let b = other.inner.deref() as *const ProcessorInner;
        a == b
    }
}

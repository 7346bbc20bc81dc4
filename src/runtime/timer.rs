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

//! Watchdog clock
//!
//! A dedicated timer thread delivers [`signal::CLOCK_SIGNAL`] ticks to every
//! VPU thread. The handler bumps the VPU watchdog and, past
//! `WATCHDOG_THRESHOLD`, forces the running coroutine to yield. Cooperative
//! scheduling remains the primary path; the clock is an opt-in safety net
//! for coroutines that never reach a yield point.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use libc;

use runtime::processor::Processor;
use runtime::signal;
use scheduler::Scheduler;

static HANDLER_INSTALL: Once = Once::new();

extern "C" fn clock_handler(_sig: libc::c_int) {
    if let Some(mut p) = Processor::current() {
        p.on_clock_tick();
    }
}

fn install_handler() {
    HANDLER_INSTALL.call_once(|| unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = clock_handler;
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        let ret = libc::sigaction(signal::CLOCK_SIGNAL, &sa, ::std::ptr::null_mut());
        assert_eq!(ret, 0, "failed to install the clock signal handler");
    });
}

/// Periodic tick source for the VPUs of one scheduler run.
pub struct Clock {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Clock {
    pub fn start(sched: Arc<Scheduler>, tick: Duration) -> Clock {
        signal::enable_preemption();
        install_handler();

        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();

        let thread = thread::Builder::new()
                         .name("corc-clock".to_owned())
                         .spawn(move || {
                             while !stop2.load(Ordering::Relaxed) {
                                 thread::sleep(tick);
                                 for tid in sched.vpu_threads() {
                                     unsafe {
                                         libc::pthread_kill(tid, signal::CLOCK_SIGNAL);
                                     }
                                 }
                             }
                         })
                         .unwrap();

        debug!("clock started with tick {:?}", tick);

        Clock {
            stop: stop,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(hdl) = self.thread.take() {
            let _ = hdl.join();
        }
    }
}

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

//! Clock-signal masking
//!
//! Every public runtime entry point brackets itself with [`MaskGuard`] so the
//! watchdog clock cannot preempt a coroutine in the middle of a runtime
//! critical section. The nesting depth is thread-local while a coroutine
//! runs and travels with the coroutine across context switches: the electing
//! VPU installs the coroutine's depth before switching in, and the coroutine
//! re-synchronizes the kernel mask right after it gains control.
//!
//! The VPU scheduler stack itself always runs with the clock signal blocked;
//! it is never preempted.
//!
//! All of this collapses to counter bumps while preemption is disabled.

use std::cell::Cell;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use libc;

/// Signal carrying watchdog clock ticks to the VPUs.
pub const CLOCK_SIGNAL: libc::c_int = libc::SIGURG;

static PREEMPT_ENABLED: AtomicBool = AtomicBool::new(false);

thread_local!(static MASK_NEST: Cell<u32> = Cell::new(0));

pub fn enable_preemption() {
    PREEMPT_ENABLED.store(true, Ordering::SeqCst);
}

#[inline]
pub fn preemption_enabled() -> bool {
    PREEMPT_ENABLED.load(Ordering::Relaxed)
}

fn set_clock_blocked(blocked: bool) {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, CLOCK_SIGNAL);
        let how = if blocked { libc::SIG_BLOCK } else { libc::SIG_UNBLOCK };
        libc::pthread_sigmask(how, &set, ::std::ptr::null_mut());
    }
}

/// Raise the nesting depth, blocking the clock signal at the 0 -> 1 edge.
pub fn mask() {
    MASK_NEST.with(|nest| {
        let n = nest.get();
        nest.set(n + 1);
        if n == 0 && preemption_enabled() {
            set_clock_blocked(true);
        }
    });
}

/// Lower the nesting depth, unblocking the clock signal at the 1 -> 0 edge.
/// Saturates at zero: a force-unwound coroutine runs its guard drops on a
/// thread whose depth it never raised.
pub fn unmask() {
    MASK_NEST.with(|nest| {
        let n = nest.get();
        if n == 0 {
            return;
        }
        nest.set(n - 1);
        if n == 1 && preemption_enabled() {
            set_clock_blocked(false);
        }
    });
}

/// RAII bracket around a public runtime call.
pub struct MaskGuard {
    _priv: (),
}

impl MaskGuard {
    pub fn new() -> MaskGuard {
        mask();
        MaskGuard { _priv: () }
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        unmask();
    }
}

/// Snapshot the current depth into the coroutine before it yields.
#[inline]
pub fn save_nest() -> u32 {
    MASK_NEST.with(|nest| nest.get())
}

/// Install a coroutine's depth before switching onto its stack. The kernel
/// mask stays blocked here; the coroutine unblocks it itself once it runs
/// (see `after_switch`), so the signal can never fire on the scheduler
/// stack with a half-installed coroutine.
#[inline]
pub fn prepare_switch(nest: u32) {
    MASK_NEST.with(|cell| cell.set(nest));
}

/// Called by a coroutine right after it gains control: make the kernel mask
/// agree with the nesting depth it parked with.
#[inline]
pub fn after_switch() {
    if preemption_enabled() {
        let nest = MASK_NEST.with(|cell| cell.get());
        if nest == 0 {
            set_clock_blocked(false);
        }
    }
}

/// Called whenever control is back on the VPU scheduler stack: depth resets
/// to zero and the clock signal is blocked for the scheduler itself.
#[inline]
pub fn enter_scheduler() {
    MASK_NEST.with(|cell| cell.set(0));
    if preemption_enabled() {
        set_clock_blocked(true);
    }
}

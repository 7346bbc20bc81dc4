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

//! Collaborator interfaces consumed by the scheduler core
//!
//! The network poll driver and the blocking-syscall offload pool live
//! outside the core; the scheduler only drives them through these traits.
//! Both park coroutines through the regular suspension primitives and hand
//! them back here.

use coroutine::Handle;
use scheduler::Scheduler;

/// Network readiness source. The scheduler polls it non-blocking on every
/// election round that finds the local queue empty.
pub trait PollDriver: Send + Sync {
    /// Poll for readiness events, making any woken coroutines ready through
    /// the scheduler. Returns the number of coroutines made ready.
    fn poll(&self, sched: &Scheduler, block: bool) -> usize;

    /// Number of descriptors still waiting. A non-zero value keeps the last
    /// awake VPU polling instead of declaring deadlock.
    fn pending(&self) -> usize;
}

/// Pool of worker threads running blocking syscalls on behalf of parked
/// coroutines.
pub trait OffloadPool: Send + Sync {
    /// Hand back one coroutine whose operation completed, if any.
    fn completed(&self) -> Option<Handle>;

    /// True while operations are in flight; consulted by deadlock
    /// detection.
    fn working(&self) -> bool;
}

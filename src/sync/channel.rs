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

//! Typed CSP channel: bounded FIFO buffer plus two wait queues
//!
//! A channel with capacity 0 is a pure rendezvous: every transfer is a
//! direct handoff between a sender and a receiver. With a non-zero capacity
//! the buffer absorbs sends until it is full; parked waiters are only ever
//! present on the side the buffer cannot serve.
//!
//! Parked operations are represented by a *quantum*: a token allocated in
//! the waiting caller's stack frame, linked into the channel's wait queue
//! and carrying a pointer to the item slot the peer reads or fills. Wait
//! queues hold raw token pointers, never owning references; the parked
//! coroutine itself is owned by the scheduler's wait list.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use coroutine::Coroutine;
use runtime::processor::Processor;
use runtime::signal;
use sync::spinlock::{RawSpin, Spinlock, SpinlockGuard};

/// The channel is closed; the undelivered value is handed back.
#[derive(Debug, PartialEq, Eq)]
pub struct SendError<T>(pub T);

#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// No waiting receiver and no free buffer slot.
    Full(T),
    Closed(T),
}

/// The channel is closed and drained.
#[derive(Debug, PartialEq, Eq)]
pub struct RecvError;

#[derive(Debug, PartialEq, Eq)]
pub enum TryRecvError {
    /// No waiting sender and no buffered value.
    Empty,
    Closed,
}

/// Whom to wake when a parked operation completes.
pub(crate) enum Waiter {
    Coroutine(NonNull<Coroutine>),
    /// A channel used from outside the runtime parks the OS thread itself.
    Thread(thread::Thread),
}

impl Waiter {
    fn current() -> Waiter {
        match Processor::current().and_then(|p| p.running_coroutine_ptr()) {
            Some(ptr) => Waiter::Coroutine(ptr),
            None => Waiter::Thread(thread::current()),
        }
    }
}

/// A parked channel operation.
///
/// Lives in the parked caller's stack frame (or inside a select operation);
/// the wait queue links it by pointer. `slot` points at the caller's item
/// slot: a sender parks with `Some(value)`, a receiver with `None`, and the
/// slot state after the wakeup tells success from close.
pub(crate) struct Quantum<T> {
    waiter: Waiter,
    slot: *mut Option<T>,
    select: bool,
    /// Claim value for the select protocol: the owning channel's address.
    tag: usize,
    /// Kept in sync with wait-queue membership, under the channel lock.
    linked: AtomicBool,

    chan: *const RawChannel<T>,
    on_send_queue: bool,
}

impl<T> Quantum<T> {
    pub(crate) fn new(waiter: Waiter,
                      slot: *mut Option<T>,
                      select: bool,
                      tag: usize,
                      chan: *const RawChannel<T>,
                      on_send_queue: bool)
                      -> Quantum<T> {
        Quantum {
            waiter: waiter,
            slot: slot,
            select: select,
            tag: tag,
            linked: AtomicBool::new(false),
            chan: chan,
            on_send_queue: on_send_queue,
        }
    }

    #[inline]
    pub(crate) fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Relaxed)
    }

    /// Wake the parked side. The caller has already moved the value through
    /// `slot` (or decided not to, on close).
    fn wake(&self) {
        match self.waiter {
            Waiter::Coroutine(coro) => {
                match unsafe { coro.as_ref() }.scheduler() {
                    Some(sched) => sched.ready_parked(coro),
                    None => warn!("dropping a wakeup: the scheduler is gone"),
                }
            }
            Waiter::Thread(ref thread) => thread.unpark(),
        }
    }
}

impl<T> Drop for Quantum<T> {
    fn drop(&mut self) {
        if !self.is_linked() {
            return;
        }

        // Still linked: the owner is being unwound while parked. Unlink
        // under the channel lock so the queue never dangles.
        let chan = unsafe { &*self.chan };
        let mut inner = chan.lock.lock();
        let me = unsafe { NonNull::new_unchecked(self as *mut Quantum<T>) };
        let queue = if self.on_send_queue {
            &mut inner.send_que
        } else {
            &mut inner.recv_que
        };
        queue.extract(me);
    }
}

/// FIFO queue of parked operations, serialized by the channel lock.
pub(crate) struct WaitQueue<T> {
    items: VecDeque<NonNull<Quantum<T>>>,
}

impl<T> WaitQueue<T> {
    fn new() -> WaitQueue<T> {
        WaitQueue { items: VecDeque::new() }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn push(&mut self, mut q: NonNull<Quantum<T>>) {
        unsafe { q.as_mut() }.linked.store(true, Ordering::Relaxed);
        self.items.push_back(q);
    }

    /// Pop the first consumable waiter. Non-select tokens are always
    /// consumed; a select token is consumed only by winning the CAS on its
    /// coroutine's claim tag, so at most one channel of a select set
    /// delivers. Tokens that lost their claim are dropped from the queue.
    pub(crate) fn fetch(&mut self) -> Option<NonNull<Quantum<T>>> {
        while let Some(mut q) = self.items.pop_front() {
            let quantum = unsafe { q.as_mut() };
            quantum.linked.store(false, Ordering::Relaxed);

            if !quantum.select {
                return Some(q);
            }

            let coro = match quantum.waiter {
                Waiter::Coroutine(coro) => coro,
                Waiter::Thread(..) => unreachable!("select tokens always belong to coroutines"),
            };
            let qtag = &unsafe { coro.as_ref() }.qtag;
            if qtag.compare_exchange(0, quantum.tag, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                return Some(q);
            }
        }
        None
    }

    /// Remove a specific token if it is still linked here.
    pub(crate) fn extract(&mut self, mut q: NonNull<Quantum<T>>) -> bool {
        match self.items.iter().position(|item| *item == q) {
            Some(index) => {
                self.items.remove(index);
                unsafe { q.as_mut() }.linked.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

pub(crate) struct Inner<T> {
    cap: usize,
    buf: VecDeque<T>,
    closed: bool,
    pub(crate) send_que: WaitQueue<T>,
    pub(crate) recv_que: WaitQueue<T>,
}

unsafe impl<T: Send> Send for Inner<T> {}

pub(crate) struct RawChannel<T> {
    lock: Spinlock<Inner<T>>,
}

unsafe impl<T: Send> Send for RawChannel<T> {}
unsafe impl<T: Send> Sync for RawChannel<T> {}

/// Non-blocking send against locked channel state. Shared between the
/// public operations and the select sweep.
pub(crate) fn try_send_inner<T>(inner: &mut Inner<T>, value: T) -> Result<(), TrySendError<T>> {
    if inner.closed {
        return Err(TrySendError::Closed(value));
    }

    // A sender finding parked receivers delivers directly and never touches
    // the buffer (the buffer is necessarily empty).
    if let Some(q) = inner.recv_que.fetch() {
        let quantum = unsafe { q.as_ref() };
        unsafe {
            *quantum.slot = Some(value);
        }
        quantum.wake();
        return Ok(());
    }

    if inner.buf.len() < inner.cap {
        inner.buf.push_back(value);
        return Ok(());
    }

    Err(TrySendError::Full(value))
}

/// Non-blocking receive against locked channel state.
pub(crate) fn try_recv_inner<T>(inner: &mut Inner<T>) -> Result<T, TryRecvError> {
    if inner.cap == 0 {
        // Rendezvous: take straight out of a parked sender's slot.
        if let Some(q) = inner.send_que.fetch() {
            let quantum = unsafe { q.as_ref() };
            let value = unsafe { (*quantum.slot).take() }.expect("parked sender without a value");
            quantum.wake();
            return Ok(value);
        }
    } else if let Some(value) = inner.buf.pop_front() {
        // A parked sender's value refills the freed slot at the back of the
        // buffer, preserving FIFO order.
        if let Some(q) = inner.send_que.fetch() {
            let quantum = unsafe { q.as_ref() };
            let moved = unsafe { (*quantum.slot).take() }.expect("parked sender without a value");
            inner.buf.push_back(moved);
            quantum.wake();
        }
        return Ok(value);
    }

    if inner.closed {
        return Err(TryRecvError::Closed);
    }
    Err(TryRecvError::Empty)
}

/// Park the caller behind an already-enqueued quantum. For a coroutine the
/// channel lock is released on the scheduler stack, strictly after the
/// context save; an OS thread re-checks its token under the lock to absorb
/// spurious unparks.
fn wait<T: Send>(raw: &RawChannel<T>, guard: SpinlockGuard<Inner<T>>, q: NonNull<Quantum<T>>) {
    let is_coroutine = match unsafe { q.as_ref() }.waiter {
        Waiter::Coroutine(..) => true,
        Waiter::Thread(..) => false,
    };

    if is_coroutine {
        let mut p = Processor::current().expect("coroutine waiter without a processor");
        p.park_and_release(move || drop(guard));
    } else {
        drop(guard);
        loop {
            thread::park();
            let reacquired = raw.lock.lock();
            let gone = !unsafe { q.as_ref() }.is_linked();
            drop(reacquired);
            if gone {
                break;
            }
        }
    }
}

/// Allocate a channel for elements of type `T`. Capacity 0 makes every
/// transfer a rendezvous.
pub fn channel<T: Send>(capacity: usize) -> Channel<T> {
    Channel {
        raw: Arc::new(RawChannel {
            lock: Spinlock::new(Inner {
                cap: capacity,
                buf: VecDeque::with_capacity(capacity),
                closed: false,
                send_que: WaitQueue::new(),
                recv_que: WaitQueue::new(),
            }),
        }),
    }
}

/// A channel endpoint. Clones share the same channel; the channel lives
/// until the last clone is dropped.
pub struct Channel<T> {
    raw: Arc<RawChannel<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Channel<T> {
        Channel { raw: self.raw.clone() }
    }
}

impl<T: Send> Channel<T> {
    /// Send a value, parking until a receiver or a buffer slot takes it.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let _mask = signal::MaskGuard::new();
        let mut guard = self.raw.lock.lock();

        match try_send_inner(&mut guard, value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(value)) => Err(SendError(value)),
            Err(TrySendError::Full(value)) => {
                let mut slot = Some(value);
                let mut quantum = Quantum::new(Waiter::current(),
                                               &mut slot as *mut Option<T>,
                                               false,
                                               0,
                                               &*self.raw as *const RawChannel<T>,
                                               true);
                let q = unsafe { NonNull::new_unchecked(&mut quantum as *mut Quantum<T>) };
                guard.send_que.push(q);

                wait(&self.raw, guard, q);

                // A taken slot means a receiver (or the buffer) got the
                // value; an untouched one means the channel closed under us.
                match slot.take() {
                    None => Ok(()),
                    Some(value) => Err(SendError(value)),
                }
            }
        }
    }

    /// Send without blocking.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let _mask = signal::MaskGuard::new();
        let mut guard = self.raw.lock.lock();
        try_send_inner(&mut guard, value)
    }

    /// Receive a value, parking until one is available. Returns an error
    /// only once the channel is closed and drained.
    pub fn recv(&self) -> Result<T, RecvError> {
        let _mask = signal::MaskGuard::new();
        let mut guard = self.raw.lock.lock();

        match try_recv_inner(&mut guard) {
            Ok(value) => Ok(value),
            Err(TryRecvError::Closed) => Err(RecvError),
            Err(TryRecvError::Empty) => {
                let mut slot: Option<T> = None;
                let mut quantum = Quantum::new(Waiter::current(),
                                               &mut slot as *mut Option<T>,
                                               false,
                                               0,
                                               &*self.raw as *const RawChannel<T>,
                                               false);
                let q = unsafe { NonNull::new_unchecked(&mut quantum as *mut Quantum<T>) };
                guard.recv_que.push(q);

                wait(&self.raw, guard, q);

                match slot.take() {
                    Some(value) => Ok(value),
                    None => Err(RecvError),
                }
            }
        }
    }

    /// Receive without blocking.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let _mask = signal::MaskGuard::new();
        let mut guard = self.raw.lock.lock();
        try_recv_inner(&mut guard)
    }

    /// Close the channel: parked senders fail, parked receivers wake empty
    /// handed, buffered values remain receivable. Idempotent; reopening is
    /// not possible.
    pub fn close(&self) {
        let _mask = signal::MaskGuard::new();
        let mut guard = self.raw.lock.lock();

        if guard.closed {
            return;
        }
        guard.closed = true;

        while let Some(q) = guard.send_que.fetch() {
            unsafe { q.as_ref() }.wake();
        }
        while let Some(q) = guard.recv_que.fetch() {
            unsafe { q.as_ref() }.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.raw.lock.lock().closed
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.raw.lock.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.raw.lock.lock().cap
    }

    /// The lock word, for the select lock-chain.
    pub(crate) fn raw_lock(&self) -> NonNull<RawSpin> {
        NonNull::from(self.raw.lock.raw())
    }

    /// Claim-tag value identifying this channel in a select set.
    pub(crate) fn tag(&self) -> usize {
        &*self.raw as *const RawChannel<T> as usize
    }

    pub(crate) fn raw_channel(&self) -> *const RawChannel<T> {
        &*self.raw
    }

    /// Access the channel state while its lock is held externally (by the
    /// select lock-chain).
    pub(crate) unsafe fn inner_unlocked(&self) -> &mut Inner<T> {
        self.raw.lock.data_unlocked()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use scheduler::Scheduler;

    #[test]
    fn test_channel_basic() {
        Scheduler::new()
            .run(|| {
                let ch = channel::<i32>(4);

                {
                    let ch = ch.clone();
                    Scheduler::spawn(move || {
                        for i in 0..4 {
                            assert_eq!(ch.send(i), Ok(()));
                        }
                    })
                    .join()
                    .unwrap();
                }

                for i in 0..4 {
                    assert_eq!(ch.recv(), Ok(i));
                }
                assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
            })
            .unwrap();
    }

    #[test]
    fn test_try_send_full() {
        Scheduler::new()
            .run(|| {
                let ch = channel::<i32>(2);
                assert_eq!(ch.try_send(1), Ok(()));
                assert_eq!(ch.try_send(2), Ok(()));
                assert_eq!(ch.try_send(3), Err(TrySendError::Full(3)));
                assert_eq!(ch.recv(), Ok(1));
                assert_eq!(ch.try_send(3), Ok(()));
            })
            .unwrap();
    }

    #[test]
    fn test_rendezvous_handoff() {
        Scheduler::new()
            .run(|| {
                let ch = channel::<i32>(0);

                // nothing to hand off yet
                assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
                assert_eq!(ch.try_send(1), Err(TrySendError::Full(1)));

                let guard = {
                    let ch = ch.clone();
                    Scheduler::spawn(move || ch.recv().unwrap())
                };

                // let the receiver park first
                for _ in 0..10 {
                    Scheduler::sched();
                }

                assert_eq!(ch.send(42), Ok(()));
                assert_eq!(guard.join().unwrap(), 42);
            })
            .unwrap();
    }

    #[test]
    fn test_close_fails_senders() {
        Scheduler::new()
            .run(|| {
                let ch = channel::<i32>(1);
                assert_eq!(ch.send(1), Ok(()));

                let guard = {
                    let ch = ch.clone();
                    // buffer is full: this one parks until close
                    Scheduler::spawn(move || ch.send(2))
                };

                for _ in 0..10 {
                    Scheduler::sched();
                }
                ch.close();

                assert_eq!(guard.join().unwrap(), Err(SendError(2)));

                // buffered value still drains, then the close shows through
                assert_eq!(ch.recv(), Ok(1));
                assert_eq!(ch.recv(), Err(RecvError));
                assert_eq!(ch.try_send(9), Err(TrySendError::Closed(9)));
            })
            .unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        Scheduler::new()
            .run(|| {
                let ch = channel::<i32>(0);
                ch.close();
                ch.close();
                assert!(ch.is_closed());
                assert_eq!(ch.recv(), Err(RecvError));
            })
            .unwrap();
    }

    #[test]
    fn test_channel_from_foreign_thread() {
        let ch = channel::<i32>(0);
        let barrier = Arc::new(Barrier::new(2));

        let inner = {
            let ch = ch.clone();
            let barrier = barrier.clone();

            thread::spawn(move || {
                Scheduler::new()
                    .run(move || {
                        barrier.wait();
                        assert_eq!(ch.recv(), Ok(17));
                        assert_eq!(ch.send(18), Ok(()));
                    })
                    .unwrap();
            })
        };

        // make sure the coroutine's recv is parked before sending
        barrier.wait();
        thread::sleep(Duration::from_millis(10));

        assert_eq!(ch.send(17), Ok(()));
        assert_eq!(ch.recv(), Ok(18));

        inner.join().unwrap();
    }
}

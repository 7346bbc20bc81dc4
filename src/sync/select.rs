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

//! Atomic multi-way choice over channel operations
//!
//! A [`ChanSet`] collects send and receive operations over any number of
//! channels (of any element types) and completes exactly one of them. All
//! involved channel locks form a chain acquired in address order, so
//! overlapping sets cannot deadlock. A blocking select that finds nothing
//! ready posts one select-marked quantum per channel and parks; the first
//! channel that can complete claims the caller by a compare-and-swap on its
//! claim tag and wakes it, and the loser tokens are extracted on the way
//! out.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use coroutine::Coroutine;
use runtime::processor::Processor;
use runtime::signal;
use sync::channel::{self, Channel, Quantum, TryRecvError, TrySendError, Waiter};
use sync::spinlock::RawSpin;

/// The operation that completed a select.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    /// Index of the completed operation, in registration order.
    pub index: usize,
    /// The operation completed because its channel is closed: a send kept
    /// its value, a receive got none.
    pub closed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectError {
    /// No operation registered.
    EmptySet,
    /// Nothing ready (non-blocking select only).
    Busy,
}

enum OpResult {
    Complete(bool),
    NotReady,
}

/// One registered operation, type-erased over the channel element type.
/// All methods except `raw_lock`/`tag` require the operation's channel lock
/// to be held by the chain.
trait SelOp {
    fn raw_lock(&self) -> NonNull<RawSpin>;
    fn tag(&self) -> usize;
    unsafe fn try_exec(&mut self) -> OpResult;
    /// Post a select token; false if the operation has nothing left to do.
    unsafe fn park(&mut self, coro: NonNull<Coroutine>) -> bool;
    unsafe fn unpark(&mut self);
    fn won_closed(&self) -> bool;
}

struct SendOp<T: Send> {
    chan: Channel<T>,
    slot: Option<T>,
    quantum: Option<Quantum<T>>,
}

impl<T: Send> SelOp for SendOp<T> {
    fn raw_lock(&self) -> NonNull<RawSpin> {
        self.chan.raw_lock()
    }

    fn tag(&self) -> usize {
        self.chan.tag()
    }

    unsafe fn try_exec(&mut self) -> OpResult {
        let value = match self.slot.take() {
            Some(value) => value,
            // already delivered in an earlier select over this set
            None => return OpResult::NotReady,
        };

        let inner = self.chan.inner_unlocked();
        match channel::try_send_inner(inner, value) {
            Ok(()) => OpResult::Complete(false),
            Err(TrySendError::Closed(value)) => {
                self.slot = Some(value);
                OpResult::Complete(true)
            }
            Err(TrySendError::Full(value)) => {
                self.slot = Some(value);
                OpResult::NotReady
            }
        }
    }

    unsafe fn park(&mut self, coro: NonNull<Coroutine>) -> bool {
        if self.slot.is_none() {
            return false;
        }
        self.quantum = Some(Quantum::new(Waiter::Coroutine(coro),
                                         &mut self.slot as *mut Option<T>,
                                         true,
                                         self.chan.tag(),
                                         self.chan.raw_channel(),
                                         true));
        let q = NonNull::new_unchecked(self.quantum.as_mut().unwrap() as *mut Quantum<T>);
        self.chan.inner_unlocked().send_que.push(q);
        true
    }

    unsafe fn unpark(&mut self) {
        if let Some(ref mut quantum) = self.quantum {
            if quantum.is_linked() {
                let q = NonNull::new_unchecked(quantum as *mut Quantum<T>);
                self.chan.inner_unlocked().send_que.extract(q);
            }
        }
        self.quantum = None;
    }

    fn won_closed(&self) -> bool {
        // the winning handoff takes the value out of the slot
        self.slot.is_some()
    }
}

struct RecvOp<'a, T: Send + 'a> {
    chan: Channel<T>,
    out: &'a mut Option<T>,
    quantum: Option<Quantum<T>>,
}

impl<'a, T: Send + 'a> SelOp for RecvOp<'a, T> {
    fn raw_lock(&self) -> NonNull<RawSpin> {
        self.chan.raw_lock()
    }

    fn tag(&self) -> usize {
        self.chan.tag()
    }

    unsafe fn try_exec(&mut self) -> OpResult {
        let inner = self.chan.inner_unlocked();
        match channel::try_recv_inner(inner) {
            Ok(value) => {
                *self.out = Some(value);
                OpResult::Complete(false)
            }
            Err(TryRecvError::Closed) => OpResult::Complete(true),
            Err(TryRecvError::Empty) => OpResult::NotReady,
        }
    }

    unsafe fn park(&mut self, coro: NonNull<Coroutine>) -> bool {
        let slot: *mut Option<T> = &mut *self.out;
        self.quantum = Some(Quantum::new(Waiter::Coroutine(coro),
                                         slot,
                                         true,
                                         self.chan.tag(),
                                         self.chan.raw_channel(),
                                         false));
        let q = NonNull::new_unchecked(self.quantum.as_mut().unwrap() as *mut Quantum<T>);
        self.chan.inner_unlocked().recv_que.push(q);
        true
    }

    unsafe fn unpark(&mut self) {
        if let Some(ref mut quantum) = self.quantum {
            if quantum.is_linked() {
                let q = NonNull::new_unchecked(quantum as *mut Quantum<T>);
                self.chan.inner_unlocked().recv_que.extract(q);
            }
        }
        self.quantum = None;
    }

    fn won_closed(&self) -> bool {
        self.out.is_none()
    }
}

unsafe fn acquire_chain(chain: &[NonNull<RawSpin>]) {
    for lock in chain {
        lock.as_ref().lock();
    }
}

unsafe fn release_chain(chain: &[NonNull<RawSpin>]) {
    for lock in chain.iter().rev() {
        lock.as_ref().unlock();
    }
}

/// A pre-registered set of channel operations to choose from.
///
/// Send operations own their value until it is delivered; receive
/// operations write into the caller-provided slot. Operations are tried in
/// registration order.
pub struct ChanSet<'a> {
    ops: Vec<Box<dyn SelOp + 'a>>,
    // distinct channel locks in address order
    chain: Vec<NonNull<RawSpin>>,
}

impl<'a> ChanSet<'a> {
    pub fn new() -> ChanSet<'a> {
        ChanSet {
            ops: Vec::new(),
            chain: Vec::new(),
        }
    }

    fn chain_insert(&mut self, lock: NonNull<RawSpin>) {
        match self.chain.binary_search_by(|probe| (probe.as_ptr() as usize).cmp(&(lock.as_ptr() as usize))) {
            Ok(_) => {}
            Err(index) => self.chain.insert(index, lock),
        }
    }

    /// Register sending `value` on `chan`.
    pub fn send<T: Send + 'a>(&mut self, chan: &Channel<T>, value: T) {
        self.chain_insert(chan.raw_lock());
        self.ops.push(Box::new(SendOp {
            chan: chan.clone(),
            slot: Some(value),
            quantum: None,
        }));
    }

    /// Register receiving from `chan` into `out`.
    pub fn recv<T: Send + 'a>(&mut self, chan: &Channel<T>, out: &'a mut Option<T>) {
        self.chain_insert(chan.raw_lock());
        self.ops.push(Box::new(RecvOp {
            chan: chan.clone(),
            out: out,
            quantum: None,
        }));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Complete exactly one registered operation, parking until one can
    /// complete.
    pub fn select(&mut self) -> Result<Selection, SelectError> {
        self.do_select(true)
    }

    /// Complete one registered operation if any is immediately ready.
    pub fn try_select(&mut self) -> Result<Selection, SelectError> {
        self.do_select(false)
    }

    fn do_select(&mut self, block: bool) -> Result<Selection, SelectError> {
        if self.ops.is_empty() {
            return Err(SelectError::EmptySet);
        }

        let _mask = signal::MaskGuard::new();

        unsafe { acquire_chain(&self.chain) };

        // 1. Non-blocking sweep in registration order.
        for (index, op) in self.ops.iter_mut().enumerate() {
            match unsafe { op.try_exec() } {
                OpResult::Complete(closed) => {
                    unsafe { release_chain(&self.chain) };
                    return Ok(Selection {
                        index: index,
                        closed: closed,
                    });
                }
                OpResult::NotReady => {}
            }
        }

        if !block {
            unsafe { release_chain(&self.chain) };
            return Err(SelectError::Busy);
        }

        // 2. Nothing ready: post one select token per operation and park.
        let mut p = Processor::current().expect("blocking select requires a coroutine");
        let coro = p.running_coroutine_ptr().expect("blocking select requires a coroutine");

        unsafe { coro.as_ref() }.qtag.store(0, Ordering::SeqCst);
        let mut posted = 0usize;
        for op in self.ops.iter_mut() {
            if unsafe { op.park(coro) } {
                posted += 1;
            }
        }
        if posted == 0 {
            // every send operation already delivered earlier; nothing left
            // that could ever complete
            unsafe { release_chain(&self.chain) };
            return Err(SelectError::EmptySet);
        }

        // The whole chain is released on the scheduler stack, after the
        // context save; the first completer can then claim us.
        let chain = self.chain.clone();
        p.park_and_release(move || unsafe { release_chain(&chain) });

        // 3. Awake: the winner stored its channel tag in our claim slot.
        unsafe { acquire_chain(&self.chain) };

        let tag = unsafe { coro.as_ref() }.qtag.swap(0, Ordering::SeqCst);
        let mut selection = None;

        for (index, op) in self.ops.iter_mut().enumerate() {
            unsafe { op.unpark() };
            if selection.is_none() && op.tag() == tag {
                selection = Some(Selection {
                    index: index,
                    closed: op.won_closed(),
                });
            }
        }

        unsafe { release_chain(&self.chain) };

        Ok(selection.expect("select woke without a claimed channel"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use scheduler::Scheduler;
    use sync::channel::channel;

    #[test]
    fn test_empty_set() {
        Scheduler::new()
            .run(|| {
                let mut set = ChanSet::new();
                assert_eq!(set.select(), Err(SelectError::EmptySet));
                assert_eq!(set.try_select(), Err(SelectError::EmptySet));
            })
            .unwrap();
    }

    #[test]
    fn test_try_select_busy() {
        Scheduler::new()
            .run(|| {
                let a = channel::<i32>(0);
                let b = channel::<i32>(0);

                let mut va = None;
                let mut vb = None;
                let mut set = ChanSet::new();
                set.recv(&a, &mut va);
                set.recv(&b, &mut vb);

                assert_eq!(set.try_select(), Err(SelectError::Busy));
            })
            .unwrap();
    }

    #[test]
    fn test_try_select_buffered() {
        Scheduler::new()
            .run(|| {
                let a = channel::<i32>(1);
                let b = channel::<i32>(1);
                b.send(5).unwrap();

                let mut va = None;
                let mut vb = None;
                {
                    let mut set = ChanSet::new();
                    set.recv(&a, &mut va);
                    set.recv(&b, &mut vb);

                    let selection = set.try_select().unwrap();
                    assert_eq!(selection,
                               Selection {
                                   index: 1,
                                   closed: false,
                               });
                }
                assert_eq!(va, None);
                assert_eq!(vb, Some(5));
            })
            .unwrap();
    }

    #[test]
    fn test_select_send() {
        Scheduler::new()
            .run(|| {
                let a = channel::<i32>(0);

                let guard = {
                    let a = a.clone();
                    Scheduler::spawn(move || a.recv().unwrap())
                };

                for _ in 0..10 {
                    Scheduler::sched();
                }

                let mut set = ChanSet::new();
                set.send(&a, 11);
                let selection = set.select().unwrap();
                assert_eq!(selection,
                           Selection {
                               index: 0,
                               closed: false,
                           });

                assert_eq!(guard.join().unwrap(), 11);
            })
            .unwrap();
    }

    #[test]
    fn test_select_blocking_recv() {
        Scheduler::new()
            .with_workers(2)
            .run(|| {
                let a = channel::<&'static str>(0);
                let b = channel::<&'static str>(0);

                {
                    let a = a.clone();
                    Scheduler::spawn(move || {
                        for _ in 0..4 {
                            Scheduler::sched();
                        }
                        let _ = a.send("a");
                    });
                }

                let mut va = None;
                let mut vb = None;
                let mut set = ChanSet::new();
                set.recv(&a, &mut va);
                set.recv(&b, &mut vb);

                let selection = set.select().unwrap();
                assert_eq!(selection,
                           Selection {
                               index: 0,
                               closed: false,
                           });
                drop(set);
                assert_eq!(va, Some("a"));
                assert_eq!(vb, None);
            })
            .unwrap();
    }

    #[test]
    fn test_select_closed_channel() {
        Scheduler::new()
            .run(|| {
                let a = channel::<i32>(0);
                a.close();

                let mut va = None;
                let mut set = ChanSet::new();
                set.recv(&a, &mut va);

                let selection = set.select().unwrap();
                assert_eq!(selection,
                           Selection {
                               index: 0,
                               closed: true,
                           });
                drop(set);
                assert_eq!(va, None);
            })
            .unwrap();
    }
}

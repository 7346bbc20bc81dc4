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

//! Spinlock guarding the per-channel state

use std::cell::UnsafeCell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// The bare lock word. Channel select keeps chains of these, acquired
/// and released by address without a guard.
pub struct RawSpin {
    locked: AtomicBool,
}

impl RawSpin {
    pub fn new() -> RawSpin {
        RawSpin { locked: AtomicBool::new(false) }
    }

    pub fn lock(&self) {
        let mut spins = 0u32;
        while self.locked
                  .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                  .is_err() {
            while self.locked.load(Ordering::Relaxed) {
                spins += 1;
                if spins % 64 == 0 {
                    thread::yield_now();
                } else {
                    hint::spin_loop();
                }
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// The caller must hold the lock.
    pub fn unlock(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        self.locked.store(false, Ordering::Release);
    }
}

/// A spinlock wrapping the data it protects.
pub struct Spinlock<T> {
    raw: RawSpin,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub fn new(data: T) -> Spinlock<T> {
        Spinlock {
            raw: RawSpin::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<T> {
        self.raw.lock();
        SpinlockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<T>> {
        if self.raw.try_lock() {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    /// The lock word, for callers that manage locking themselves
    /// (the select lock-chain).
    pub fn raw(&self) -> &RawSpin {
        &self.raw
    }

    /// Access the protected data without a guard. The caller must hold
    /// the lock through `raw()`.
    pub unsafe fn data_unlocked(&self) -> &mut T {
        &mut *self.data.get()
    }
}

pub struct SpinlockGuard<'a, T: 'a> {
    lock: &'a Spinlock<T>,
}

impl<'a, T> Deref for SpinlockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinlockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

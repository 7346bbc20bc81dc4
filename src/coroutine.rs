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

//! Coroutine record, state machine and context switch

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use options::Options;
use runtime::processor;
use scheduler::Scheduler;

/// Resume payload that tells a suspended coroutine to unwind its stack
/// instead of continuing.
pub const FORCE_UNWIND: usize = 1;

/// Panic payload used to unwind a coroutine that is dropped before it
/// finished. It is re-raised past the user wrapper and swallowed by the
/// coroutine trampoline.
#[derive(Debug)]
pub struct ForceUnwind;

/// Panic payload carrying the code given to `corc::exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Linked on a ready queue, waiting for election.
    Ready,
    /// Executing on some VPU.
    Running,
    /// Yielded voluntarily; goes back to the global ready queue.
    Suspended,
    /// Waiting on a channel, select or collaborator event.
    Parked,
    /// Ran to completion; only the record remains.
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineType {
    /// The entry coroutine; its completion ends the scheduler run.
    Main,
    Normal,
}

/// A user-space thread with its own stack and saved machine context.
///
/// The two `Context` slots realize one save/restore primitive used in both
/// directions: `context` enters the coroutine while it is suspended, `back`
/// leaves it towards the electing VPU. The `state` field disambiguates which
/// direction a switch came from.
pub struct Coroutine {
    id: u32,
    name: Option<String>,
    ty: CoroutineType,
    priority: u32,

    pub state: State,
    context: Option<Context>,
    back: Option<Context>,
    stack: Option<ProtectedFixedSizeStack>,
    func: Option<Box<dyn FnOnce() + Send + 'static>>,

    /// Ready-queue index this coroutine is enqueued on when woken;
    /// updated to the electing VPU every time it runs.
    pub affinity: AtomicUsize,
    /// Select claim tag: 0 when free, otherwise the address of the channel
    /// that claimed this coroutine.
    pub qtag: AtomicUsize,
    /// Clock-signal mask nesting depth, persisted across context switches.
    pub sigmask_nest: u32,

    sched: Weak<Scheduler>,
    ref_count: AtomicUsize,
}

impl Coroutine {
    /// Allocate a coroutine record and its stack and initialize the context
    /// so the first resume runs `func` and a return from it finishes the
    /// coroutine.
    pub fn new(func: Box<dyn FnOnce() + Send + 'static>,
               opts: Options,
               id: u32,
               ty: CoroutineType,
               affinity: usize,
               sched: Weak<Scheduler>)
               -> Handle {
        let stack = ProtectedFixedSizeStack::new(opts.stack_size)
                        .expect("failed to allocate coroutine stack");

        let mut coro = Box::new(Coroutine {
            id: id,
            name: opts.name,
            ty: ty,
            priority: opts.priority,

            state: State::Ready,
            context: None,
            back: None,
            stack: None,
            func: Some(func),

            affinity: AtomicUsize::new(affinity),
            qtag: AtomicUsize::new(0),
            sigmask_nest: 0,

            sched: sched,
            ref_count: AtomicUsize::new(1),
        });

        // Hand the record pointer to the trampoline; it stores nothing yet
        // and yields straight back, leaving a context that is ready to run
        // the entry function.
        let ptr: *mut Coroutine = &mut *coro;
        let context = unsafe { Context::new(&stack, coroutine_entry) };
        let t = unsafe { context.resume(ptr as usize) };
        coro.context = Some(t.context);
        coro.stack = Some(stack);

        trace!("Coroutine `{}`: spawned", coro.debug_name());

        unsafe { Handle::from_raw(Box::into_raw(coro)) }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().map(|s| &s[..])
    }

    #[inline]
    pub fn coroutine_type(&self) -> CoroutineType {
        self.ty
    }

    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.sched.upgrade()
    }

    pub fn debug_name(&self) -> String {
        match self.name {
            Some(ref name) => format!("{}#{}", name, self.id),
            None => format!("#{}", self.id),
        }
    }

    /// Switch from the scheduler stack onto this coroutine's stack. Returns
    /// when the coroutine yields; the yielded payload is passed through.
    pub fn resume(&mut self, data: usize) -> usize {
        let context = self.context.take().expect("coroutine has no saved context");
        let t = unsafe { context.resume(data) };
        self.context = Some(t.context);
        t.data
    }

    /// Switch from this coroutine's stack back to the VPU that elected it.
    /// Returns the payload of the next resume; a `FORCE_UNWIND` payload
    /// unwinds the stack instead of returning.
    pub fn yield_with(&mut self, state: State, data: usize) -> usize {
        self.state = state;

        let back = self.back.take().expect("coroutine is not running");
        let t = unsafe { back.resume(data) };
        self.back = Some(t.context);
        processor::coroutine_entered();

        if t.data == FORCE_UNWIND {
            panic::panic_any(ForceUnwind);
        }
        t.data
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Coroutine(`{}`, {:?})", self.debug_name(), self.state)
    }
}

extern "C" fn coroutine_entry(t: Transfer) -> ! {
    let coro_ptr = t.data as *mut Coroutine;

    // Give control back to the spawner; the next resume comes from an
    // electing VPU (or from a drop that never ran the coroutine).
    let t = unsafe { t.context.resume(0) };

    {
        let coro = unsafe { &mut *coro_ptr };
        coro.back = Some(t.context);
    }
    processor::coroutine_entered();

    if t.data != FORCE_UNWIND {
        let func = unsafe { (&mut *coro_ptr).func.take() };
        if let Some(func) = func {
            // User panics are caught by the spawn wrapper; this catch only
            // swallows the ForceUnwind of a torn-down coroutine.
            let _ = panic::catch_unwind(panic::AssertUnwindSafe(move || func()));
        }
    }

    processor::coroutine_exiting();
    let back = {
        let coro = unsafe { &mut *coro_ptr };
        trace!("Coroutine `{}`: finished", coro.debug_name());
        coro.state = State::Finished;
        coro.back.take().expect("coroutine is not running")
    };
    unsafe { back.resume(0) };
    unreachable!();
}

/// Owning reference to a coroutine. Cloning acquires a reference, dropping
/// releases one; the last drop destroys the record, force-unwinding the
/// stack first if the coroutine never finished.
pub struct Handle(NonNull<Coroutine>);

unsafe impl Send for Handle {}

impl Handle {
    #[inline]
    pub unsafe fn from_raw(ptr: *mut Coroutine) -> Handle {
        Handle(NonNull::new_unchecked(ptr))
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<Coroutine> {
        self.0
    }
}

impl Deref for Handle {
    type Target = Coroutine;

    #[inline]
    fn deref(&self) -> &Coroutine {
        unsafe { self.0.as_ref() }
    }
}

impl DerefMut for Handle {
    #[inline]
    fn deref_mut(&mut self) -> &mut Coroutine {
        unsafe { self.0.as_mut() }
    }
}

impl Clone for Handle {
    fn clone(&self) -> Handle {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
        Handle(self.0)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);

        unsafe {
            let ptr = self.0.as_ptr();
            {
                let coro = &mut *ptr;
                if coro.state != State::Finished && coro.context.is_some() {
                    // Unwind the abandoned stack so frame destructors run
                    // (releasing wait-queue tokens among other things).
                    trace!("Coroutine `{}`: force unwinding", coro.debug_name());
                    coro.resume(FORCE_UNWIND);
                }
            }
            drop(Box::from_raw(ptr));
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.deref().fmt(f)
    }
}

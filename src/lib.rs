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

//! M:N coroutine runtime: a fixed pool of VPU worker threads cooperatively
//! scheduling coroutines that communicate over typed CSP channels with
//! select.
//!
//! ```ignore
//! corc::Scheduler::new()
//!     .with_workers(4)
//!     .run(|| {
//!         let ch = corc::sync::channel::<i32>(0);
//!         let tx = ch.clone();
//!         corc::spawn(move || tx.send(42).unwrap());
//!         assert_eq!(ch.recv(), Ok(42));
//!     })
//!     .unwrap();
//! ```

#[macro_use]
extern crate log;

extern crate context;
extern crate crossbeam_deque;
extern crate libc;
extern crate linked_hash_map;

pub mod coroutine;
pub mod io;
pub mod join_handle;
pub mod options;
pub mod runtime;
pub mod scheduler;
pub mod sync;

pub use coroutine::{ExitCode, Handle};
pub use join_handle::JoinHandle;
pub use options::Options;
pub use scheduler::Scheduler;

use std::panic;

use runtime::processor::Processor;

/// Spawn a new coroutine with default options.
#[inline]
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
    where F: FnOnce() -> T + Send + 'static,
          T: Send + 'static
{
    Scheduler::spawn(f)
}

/// Spawn a new coroutine with options.
#[inline]
pub fn spawn_opts<F, T>(f: F, opts: Options) -> JoinHandle<T>
    where F: FnOnce() -> T + Send + 'static,
          T: Send + 'static
{
    Scheduler::spawn_opts(f, opts)
}

/// Give up the CPU; the coroutine goes to the back of the global ready
/// queue.
#[inline]
pub fn sched() {
    Scheduler::sched()
}

/// Alias of [`sched`].
#[inline]
pub fn yield_now() {
    sched()
}

/// Terminate the current coroutine immediately, unwinding its stack. The
/// code travels to the join handle as an [`ExitCode`] payload; when the
/// main coroutine exits this way, the scheduler run ends.
pub fn exit(code: i32) -> ! {
    panic::panic_any(ExitCode(code));
}

/// Handle of the currently running coroutine, if any.
pub fn current() -> Option<Handle> {
    Processor::current().and_then(|mut p| p.current_coroutine().map(|hdl| hdl.clone()))
}

/// Id of the VPU executing the caller, if the caller runs on one.
pub fn vpu_id() -> Option<usize> {
    Processor::current().map(|p| p.id())
}

/// Coroutine configuration. Provides detailed control over the properties
/// of a new coroutine.
pub struct Builder {
    opts: Options,
}

impl Builder {
    /// Generate the base configuration for spawning a coroutine.
    pub fn new() -> Builder {
        Builder { opts: Options::new() }
    }

    /// Set the size of the stack for the new coroutine.
    pub fn stack_size(mut self, stack_size: usize) -> Builder {
        self.opts.stack_size(stack_size);
        self
    }

    /// Name the coroutine-to-be.
    pub fn name(mut self, name: String) -> Builder {
        self.opts.name(name);
        self
    }

    /// Spawn a new coroutine with this configuration.
    pub fn spawn<F, T>(self, f: F) -> JoinHandle<T>
        where F: FnOnce() -> T + Send + 'static,
              T: Send + 'static
    {
        Scheduler::spawn_opts(f, self.opts)
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builder_spawn() {
        Scheduler::new()
            .run(|| {
                let guard = Builder::new()
                                .name("worker".to_owned())
                                .stack_size(128 * 1024)
                                .spawn(|| {
                                    let me = current().unwrap();
                                    assert_eq!(me.name(), Some("worker"));
                                    me.id()
                                });

                guard.join().unwrap();
            })
            .unwrap();
    }

    #[test]
    fn test_exit_code() {
        Scheduler::new()
            .run(|| {
                let guard = spawn(|| -> i32 { exit(3) });

                let err = guard.join().unwrap_err();
                assert_eq!(err.downcast_ref::<ExitCode>(), Some(&ExitCode(3)));
            })
            .unwrap();
    }

    #[test]
    fn test_vpu_id_inside_runtime() {
        Scheduler::new()
            .run(|| {
                assert!(vpu_id().is_some());
            })
            .unwrap();
        assert_eq!(vpu_id(), None);
    }
}

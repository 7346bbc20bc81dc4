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

//! Join handles for spawned coroutines

use std::thread;

use sync::channel::{channel, Channel};

/// Create the result channel shared by a coroutine and its join handle.
/// Capacity 1, so delivering the result never blocks the coroutine.
pub fn handle_pair<T: Send + 'static>() -> (Channel<thread::Result<T>>, JoinHandle<T>) {
    let ch = channel(1);
    (ch.clone(), JoinHandle { result: ch })
}

/// A handle that can join a coroutine.
pub struct JoinHandle<T> {
    result: Channel<thread::Result<T>>,
}

impl<T: Send + 'static> JoinHandle<T> {
    /// Wait for the coroutine to finish and return its result. A panicking
    /// coroutine yields `Err` with the panic payload.
    pub fn join(self) -> thread::Result<T> {
        self.result
            .recv()
            .expect("the coroutine result channel was closed")
    }
}

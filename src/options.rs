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

//! Coroutine spawn options

/// Default stack size of a new coroutine.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Properties of a coroutine to be spawned.
#[derive(Clone, Debug)]
pub struct Options {
    pub stack_size: usize,
    pub name: Option<String>,
    pub priority: u32,
}

impl Options {
    pub fn new() -> Options {
        Options {
            stack_size: DEFAULT_STACK_SIZE,
            name: None,
            priority: 0,
        }
    }

    /// Set the stack size of the new coroutine.
    pub fn stack_size(&mut self, stack_size: usize) -> &mut Options {
        self.stack_size = stack_size;
        self
    }

    /// Name the coroutine. The name shows up in log messages
    /// and in the deadlock dump.
    pub fn name(&mut self, name: String) -> &mut Options {
        self.name = Some(name);
        self
    }

    /// Set the scheduling priority. The field is carried on the
    /// coroutine record; election is FIFO.
    pub fn priority(&mut self, priority: u32) -> &mut Options {
        self.priority = priority;
        self
    }
}

impl Default for Options {
    fn default() -> Options {
        Options::new()
    }
}

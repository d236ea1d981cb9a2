//! Scripted in-process transport.
//!
//! A [`MemoryTransport`] reads from a queue of bytes fed in advance and
//! records everything written to it, along with the mode switches it saw.
//! Clones share state, so a caller can hand one clone to a [`Link`] and keep
//! another to feed input and inspect output.
//!
//! [`Link`]: crate::protocol::link::Link
use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use crate::error::{ErrorNum, Result};

use super::{Listener, Mode, Transport};

#[derive(Debug)]
struct Pipe {
    input: VecDeque<u8>,
    output: Vec<u8>,
    modes: Vec<Mode>,
    open: bool,
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    pipe: Rc<RefCell<Pipe>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            pipe: Rc::new(RefCell::new(Pipe {
                input: VecDeque::new(),
                output: Vec::new(),
                modes: Vec::new(),
                open: true,
            })),
        }
    }

    pub fn with_input(bytes: &[u8]) -> Self {
        let tpt = Self::new();
        tpt.feed(bytes);
        tpt
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.pipe.borrow_mut().input.extend(bytes);
    }

    /// Everything written since the last call.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.pipe.borrow_mut().output)
    }

    pub fn modes(&self) -> Vec<Mode> {
        self.pipe.borrow().modes.clone()
    }

    pub fn remaining(&self) -> usize {
        self.pipe.borrow().input.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut pipe = self.pipe.borrow_mut();
        if !pipe.open {
            return Err(ErrorNum::Closed.into());
        }
        // Running dry is the scripted equivalent of the peer hanging up.
        if pipe.input.len() < buf.len() {
            pipe.input.clear();
            pipe.open = false;
            return Err(ErrorNum::Eof.into());
        }
        let len = buf.len();
        for (dst, src) in buf.iter_mut().zip(pipe.input.drain(..len)) {
            *dst = src;
        }
        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let mut pipe = self.pipe.borrow_mut();
        if !pipe.open {
            return Err(ErrorNum::Closed.into());
        }
        pipe.output.extend_from_slice(buf);
        Ok(())
    }

    fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.pipe.borrow_mut().modes.push(mode);
        Ok(())
    }

    fn readable(&mut self) -> Result<bool> {
        Ok(!self.pipe.borrow().input.is_empty())
    }

    fn is_open(&self) -> bool {
        self.pipe.borrow().open
    }

    fn close(&mut self) {
        self.pipe.borrow_mut().open = false;
    }
}

/// Hands out queued [`MemoryTransport`]s; closes itself once they run out.
#[derive(Debug, Default)]
pub struct MemoryListener {
    pending: VecDeque<MemoryTransport>,
    closed: bool,
}

impl MemoryListener {
    pub fn new<I: IntoIterator<Item = MemoryTransport>>(connections: I) -> Self {
        Self {
            pending: connections.into_iter().collect(),
            closed: false,
        }
    }
}

impl Listener for MemoryListener {
    fn accept(&mut self) -> Result<Box<dyn Transport>> {
        if self.closed {
            return Err(ErrorNum::Closed.into());
        }
        match self.pending.pop_front() {
            Some(tpt) => Ok(Box::new(tpt)),
            None => {
                self.closed = true;
                Err(ErrorNum::Closed.into())
            }
        }
    }

    fn readable(&mut self) -> Result<bool> {
        Ok(!self.closed && !self.pending.is_empty())
    }

    fn is_open(&self) -> bool {
        !self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

//! Byte-budgeted handoff queue
//!
//! The only synchronized structure between an application thread and a
//! channel thread. The budget counts payload bytes, not items. A frame that
//! is larger than the whole budget is rejected outright; any other frame fits
//! once enough older frames left the queue.

use crate::error::{AdaptioError, Result};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of [`BoundedQueue::pop`]
#[derive(Debug, PartialEq)]
pub enum Popped {
    Item(Bytes),
    /// The wait elapsed with the queue still empty
    Empty,
    /// Closed and fully drained
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Bytes>,
    bytes: usize,
    closed: bool,
    evicted: u64,
}

/// Thread-safe FIFO of frames bounded by total byte size
#[derive(Debug)]
pub struct BoundedQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check_size(&self, frame: &Bytes) -> Result<()> {
        if frame.len() > self.capacity {
            return Err(AdaptioError::BufferOverflow {
                size: frame.len(),
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Enqueue, waiting for room until `deadline` (forever when `None`)
    pub fn push_blocking(&self, frame: Bytes, deadline: Option<Instant>) -> Result<()> {
        self.check_size(&frame)?;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(AdaptioError::InvalidState("queue is closed".into()));
            }
            if state.items.is_empty() || state.bytes + frame.len() <= self.capacity {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self.not_full.wait_until(&mut state, deadline).timed_out() {
                        return Err(AdaptioError::Timeout(format!(
                            "no room for {} bytes within the buffer budget",
                            frame.len()
                        )));
                    }
                }
                None => self.not_full.wait(&mut state),
            }
        }
        state.bytes += frame.len();
        state.items.push_back(frame);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue without waiting, dropping the oldest frames to make room.
    ///
    /// Returns how many frames were dropped.
    pub fn push_evicting(&self, frame: Bytes) -> Result<usize> {
        self.check_size(&frame)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(AdaptioError::InvalidState("queue is closed".into()));
        }
        let mut dropped = 0;
        while state.bytes + frame.len() > self.capacity {
            match state.items.pop_front() {
                Some(old) => {
                    state.bytes -= old.len();
                    dropped += 1;
                }
                None => break,
            }
        }
        state.evicted += dropped as u64;
        state.bytes += frame.len();
        state.items.push_back(frame);
        self.not_empty.notify_one();
        Ok(dropped)
    }

    /// Dequeue, waiting up to `timeout` (forever when `None`).
    ///
    /// Frames queued before [`Self::close`] are still handed out.
    pub fn pop(&self, timeout: Option<Duration>) -> Popped {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.items.pop_front() {
                state.bytes -= frame.len();
                self.not_full.notify_all();
                return Popped::Item(frame);
            }
            if state.closed {
                return Popped::Closed;
            }
            match deadline {
                Some(deadline) => {
                    if self.not_empty.wait_until(&mut state, deadline).timed_out()
                        && state.items.is_empty()
                    {
                        return if state.closed {
                            Popped::Closed
                        } else {
                            Popped::Empty
                        };
                    }
                }
                None => self.not_empty.wait(&mut state),
            }
        }
    }

    /// Refuse further pushes and wake every waiter
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Bytes currently queued
    pub fn bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// Frames dropped by [`Self::push_evicting`] so far
    pub fn evicted(&self) -> u64 {
        self.state.lock().evicted
    }
}

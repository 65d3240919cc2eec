//! Collective group handles
//!
//! Engines only need three things from a group of cooperating processes:
//! their own rank, the group size, and a barrier at open and close. The
//! [`Comm`] trait captures exactly that.
//!
//! # Main Types
//!
//! - [`Comm`] - The capability engines are bound to
//! - [`SelfComm`] - Single-member group; the barrier is a no-op
//! - [`ThreadComm`] - In-process ranks sharing one barrier (one rank per thread)

use std::fmt;
use std::sync::{Arc, Barrier};

/// Opaque collective group capability
pub trait Comm: Send + Sync + fmt::Debug {
    /// Rank of this member, in `0..size()`
    fn rank(&self) -> usize;

    /// Number of members in the group
    fn size(&self) -> usize;

    /// Block until every member reached the barrier
    fn barrier(&self);
}

/// Shared group handle as stored on IO namespaces and engines
pub type CommHandle = Arc<dyn Comm>;

/// The trivial group of one
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

impl SelfComm {
    pub fn handle() -> CommHandle {
        Arc::new(SelfComm)
    }
}

impl Comm for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}
}

/// Group of in-process ranks, one per thread
#[derive(Debug, Clone)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    barrier: Arc<Barrier>,
}

impl ThreadComm {
    /// Create all members of a group of `size` ranks.
    ///
    /// Each member must be moved to its own thread before a barrier is
    /// reached, otherwise the barrier never releases.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let size = size.max(1);
        let barrier = Arc::new(Barrier::new(size));
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }

    pub fn into_handle(self) -> CommHandle {
        Arc::new(self)
    }
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.barrier.wait();
    }
}

//! Byte-level transports
//!
//! A transport moves whole messages (frames) between an engine and a file or
//! a network peer. Engines never talk to a transport directly: they go
//! through a [`TransportManager`], which owns one transport per configured
//! parameter set.
//!
//! # Main Types
//!
//! - [`Transport`] - Message channel contract (open, write, read, flush, close)
//! - [`TransportKind`] - Supported transport families
//! - [`FileTransport`] - Synchronous file-backed channel
//! - [`Publisher`] / [`Subscriber`] - TCP channels with one background thread each
//! - [`BoundedQueue`] - Byte-budgeted handoff between the caller and a channel thread
//! - [`TransportManager`] - The set of channels an engine writes to and reads from
//!
//! # Threading
//!
//! File transports do their I/O on the calling thread. Network transports
//! hand frames to a background thread through a [`BoundedQueue`], so the
//! caller only ever blocks at the queue boundary, and only for bounded time.

pub mod file;
pub mod manager;
pub mod queue;
pub mod stream;

pub use file::FileTransport;
pub use manager::TransportManager;
pub use queue::{BoundedQueue, Popped};
pub use stream::{Delivery, Publisher, StreamInbound, StreamSettings, Subscriber};

use crate::error::{AdaptioError, Result};
use crate::types::{Mode, Params};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Supported transport families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Sequential file I/O ("file", "fstream", "posix")
    File,
    /// TCP streams ("tcp", "wan")
    Tcp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::File => "file",
            TransportKind::Tcp => "tcp",
        }
    }
}

impl FromStr for TransportKind {
    type Err = AdaptioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "fstream" | "posix" => Ok(TransportKind::File),
            "tcp" | "wan" => Ok(TransportKind::Tcp),
            _ => Err(AdaptioError::UnsupportedTransport(s.to_string())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured transport: its kind and parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParams {
    pub kind: TransportKind,
    pub parameters: Params,
}

/// A message channel.
///
/// `write` and `read` move whole frames. `close` is idempotent, flushes and
/// joins any background thread; `cancel` requests a hard stop first, after
/// which pending frames may be lost.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Open the channel for `name` (a path for files, ignored by streams)
    fn open(&mut self, name: &str, mode: Mode) -> Result<()>;

    /// Configure the staging buffer budget in bytes
    fn set_buffer(&mut self, size: usize);

    fn write(&mut self, frame: Bytes) -> Result<()>;

    /// Next frame, `Ok(None)` once the peer ended the channel.
    ///
    /// Fails with [`AdaptioError::Timeout`] when `timeout` elapsed first.
    fn read(&mut self, timeout: Option<Duration>) -> Result<Option<Bytes>>;

    fn flush(&mut self) -> Result<()>;

    /// Stop accepting writes and start draining in the background
    fn finish(&mut self) {}

    /// True once nothing is left to drain
    fn is_drained(&self) -> bool {
        true
    }

    /// Request a hard stop of any background work
    fn cancel(&mut self) {}

    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Address peers connect to, for listening channels
    fn endpoint(&self) -> Option<String> {
        None
    }

    /// Connected peers, for listening channels
    fn subscribers(&self) -> usize {
        0
    }

    /// Frames discarded under backpressure
    fn dropped(&self) -> u64 {
        0
    }

    /// First failure recorded by background work, if any
    fn fault(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_names() {
        assert_eq!("file".parse::<TransportKind>().unwrap(), TransportKind::File);
        assert_eq!("FStream".parse::<TransportKind>().unwrap(), TransportKind::File);
        assert_eq!("wan".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert!(matches!(
            "carrier-pigeon".parse::<TransportKind>(),
            Err(AdaptioError::UnsupportedTransport(_))
        ));
        assert_eq!(TransportKind::Tcp.to_string(), "tcp");
    }
}

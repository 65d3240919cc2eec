//! Mock construction helpers

use adaptio::transport::{Transport, TransportKind};
use adaptio::{AdaptioError, Mode, Result};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// In-memory transport: one end writes, the other reads.
///
/// Dropping the writing end (or closing it) ends the reading end.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Option<Sender<Bytes>>,
    rx: Option<Receiver<Bytes>>,
    open: bool,
}

/// Connected (writer, reader) pair holding at most `capacity` frames in flight
pub fn channel_pair(capacity: usize) -> (ChannelTransport, ChannelTransport) {
    let (tx, rx) = bounded(capacity);
    (
        ChannelTransport {
            tx: Some(tx),
            rx: None,
            open: false,
        },
        ChannelTransport {
            tx: None,
            rx: Some(rx),
            open: false,
        },
    )
}

impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn open(&mut self, _name: &str, _mode: Mode) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn set_buffer(&mut self, _size: usize) {}

    fn write(&mut self, frame: Bytes) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| AdaptioError::InvalidState("read end cannot write".into()))?;
        tx.send(frame)
            .map_err(|_| AdaptioError::TransportFault("peer gone".into()))
    }

    fn read(&mut self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| AdaptioError::InvalidState("write end cannot read".into()))?;
        let received = match timeout {
            Some(t) => rx.recv_timeout(t),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(AdaptioError::Timeout("channel idle".into())),
        }
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.tx = None;
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

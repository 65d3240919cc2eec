//! Control connection between a writer and its readers
//!
//! The writer's [`ControlServer`] accepts readers on the control address.
//! A reader sends `Hello`, the writer answers with a [`Handshake`] carrying
//! its data channel addresses and a snapshot of its catalog. On close the
//! writer sends `Goodbye` to every reader still connected.
//!
//! The reader's [`ControlClient`] does its side of this on a background
//! thread and hands the handshake to the opening thread through a one-slot
//! crossbeam channel.

use super::WorkflowMode;
use crate::address::Address;
use crate::catalog::VariableDescriptor;
use crate::engine::payload::AttributeRecord;
use crate::error::{AdaptioError, Result};
use crate::transport::stream::{connect_with_retry, read_frame_until, write_frame, IO_POLL};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// What a writer tells a reader after `Hello`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Handshake {
    pub rank: usize,
    pub size: usize,
    pub workflow: WorkflowMode,
    /// Data channel addresses, in stripe order
    pub channels: Vec<String>,
    pub variables: Vec<VariableDescriptor>,
    pub attributes: Vec<AttributeRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    Hello { rank: usize, size: usize },
    Handshake(Handshake),
    Goodbye { steps: u64 },
}

fn send(stream: &mut TcpStream, message: &ControlMessage, cancel: &AtomicBool) -> Result<()> {
    let bytes = bincode::serialize(message)?;
    write_frame(stream, &bytes, cancel)?;
    Ok(())
}

fn receive(
    stream: &mut TcpStream,
    cancel: &AtomicBool,
    deadline: Option<Instant>,
) -> Result<Option<ControlMessage>> {
    match read_frame_until(stream, cancel, deadline) {
        Ok(Some(frame)) => Ok(Some(bincode::deserialize(&frame)?)),
        Ok(None) => Ok(None),
        Err(e) if e.kind() == ErrorKind::TimedOut => Err(AdaptioError::Timeout(e.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// A reader that completed the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: SocketAddr,
    pub rank: usize,
    pub size: usize,
}

// ==================== Writer side ====================

/// Control thread of a writer
#[derive(Debug)]
pub struct ControlServer {
    local: SocketAddr,
    snapshot: Arc<Mutex<Handshake>>,
    peers: Arc<Mutex<Vec<Peer>>>,
    cancel: Arc<AtomicBool>,
    goodbye: Sender<u64>,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind `address` and start answering readers with `snapshot`.
    ///
    /// A reader that does not send `Hello` within `hello_timeout` is dropped.
    pub fn start(address: &Address, snapshot: Handshake, hello_timeout: Duration) -> Result<Self> {
        let target = address.socket_addr()?;
        let listener = TcpListener::bind(&target)
            .map_err(|e| AdaptioError::from(e).with_context(format!("binding control address {}", target)))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        let snapshot = Arc::new(Mutex::new(snapshot));
        let peers = Arc::new(Mutex::new(Vec::new()));
        let cancel = Arc::new(AtomicBool::new(false));
        let (goodbye, goodbye_rx) = bounded(1);

        let thread_snapshot = Arc::clone(&snapshot);
        let thread_peers = Arc::clone(&peers);
        let thread_cancel = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name("adaptio-ctl-server".to_string())
            .spawn(move || {
                run_server(
                    listener,
                    thread_snapshot,
                    thread_peers,
                    thread_cancel,
                    goodbye_rx,
                    hello_timeout,
                )
            })?;

        tracing::debug!("Control server listening on {}", local);
        Ok(Self {
            local,
            snapshot,
            peers,
            cancel,
            goodbye,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn endpoint(&self) -> String {
        format!("tcp://{}", self.local)
    }

    /// Change what later readers receive
    pub fn update(&self, f: impl FnOnce(&mut Handshake)) {
        f(&mut self.snapshot.lock());
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.lock().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Say goodbye to every reader and stop the thread.
    ///
    /// Whatever is still in progress at `deadline` is cancelled.
    pub fn shutdown(&mut self, steps: u64, deadline: Instant) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if self.goodbye.try_send(steps).is_err() {
            self.cancel.store(true, Ordering::Release);
        }
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(ACCEPT_POLL);
        }
        if !handle.is_finished() {
            tracing::warn!("Control server on {} still busy at close, cancelling", self.local);
            self.cancel.store(true, Ordering::Release);
        }
        handle
            .join()
            .map_err(|_| AdaptioError::TransportFault("control thread panicked".into()))
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.store(true, Ordering::Release);
            let _ = handle.join();
        }
    }
}

type Connections = Arc<Mutex<Vec<(SocketAddr, TcpStream)>>>;

fn greet(
    mut stream: TcpStream,
    address: SocketAddr,
    snapshot: &Mutex<Handshake>,
    stop: &AtomicBool,
    hello_timeout: Duration,
) -> Result<(Peer, TcpStream)> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(IO_POLL))?;
    stream.set_write_timeout(Some(IO_POLL))?;

    let deadline = Instant::now() + hello_timeout;
    let (rank, size) = match receive(&mut stream, stop, Some(deadline))? {
        Some(ControlMessage::Hello { rank, size }) => (rank, size),
        other => {
            return Err(AdaptioError::TransportFault(format!(
                "expected hello, got {:?}",
                other
            )))
        }
    };
    let handshake = snapshot.lock().clone();
    send(&mut stream, &ControlMessage::Handshake(handshake), stop)?;
    Ok((Peer { address, rank, size }, stream))
}

/// Handshake with one connection on its own thread
fn spawn_greeter(
    stream: TcpStream,
    address: SocketAddr,
    snapshot: &Arc<Mutex<Handshake>>,
    peers: &Arc<Mutex<Vec<Peer>>>,
    connections: &Connections,
    stop: &Arc<AtomicBool>,
    hello_timeout: Duration,
) -> std::io::Result<JoinHandle<()>> {
    let snapshot = Arc::clone(snapshot);
    let peers = Arc::clone(peers);
    let connections = Arc::clone(connections);
    let stop = Arc::clone(stop);
    thread::Builder::new()
        .name("adaptio-ctl-greet".to_string())
        .spawn(move || match greet(stream, address, &snapshot, &stop, hello_timeout) {
            Ok((peer, stream)) => {
                tracing::info!(
                    "Reader rank {}/{} at {} completed handshake",
                    peer.rank,
                    peer.size,
                    peer.address
                );
                peers.lock().push(peer);
                connections.lock().push((address, stream));
            }
            Err(e) if stop.load(Ordering::Acquire) => {
                tracing::debug!("Handshake with {} abandoned: {}", address, e)
            }
            Err(e) => tracing::warn!("Handshake with {} failed: {}", address, e),
        })
}

fn run_server(
    listener: TcpListener,
    snapshot: Arc<Mutex<Handshake>>,
    peers: Arc<Mutex<Vec<Peer>>>,
    cancel: Arc<AtomicBool>,
    goodbye: Receiver<u64>,
    hello_timeout: Duration,
) {
    let connections: Connections = Arc::new(Mutex::new(Vec::new()));
    let stop_greeting = Arc::new(AtomicBool::new(false));
    let mut greeters: Vec<JoinHandle<()>> = Vec::new();

    let farewell = loop {
        if cancel.load(Ordering::Acquire) {
            break None;
        }
        match goodbye.try_recv() {
            Ok(steps) => break Some(steps),
            Err(TryRecvError::Disconnected) => break None,
            Err(TryRecvError::Empty) => {}
        }
        greeters.retain(|greeter| !greeter.is_finished());

        match listener.accept() {
            Ok((stream, address)) => {
                match spawn_greeter(
                    stream,
                    address,
                    &snapshot,
                    &peers,
                    &connections,
                    &stop_greeting,
                    hello_timeout,
                ) {
                    Ok(greeter) => greeters.push(greeter),
                    Err(e) => tracing::warn!("No thread to greet {}: {}", address, e),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!("Control accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    };

    // Handshakes still waiting for a hello give up within one poll
    stop_greeting.store(true, Ordering::Release);
    for greeter in greeters {
        let _ = greeter.join();
    }

    let mut connections = std::mem::take(&mut *connections.lock());
    if let Some(steps) = farewell {
        for (address, stream) in connections.iter_mut() {
            if let Err(e) = send(stream, &ControlMessage::Goodbye { steps }, &cancel) {
                tracing::debug!("Goodbye to {} failed: {}", address, e);
            }
        }
    }
    for (_, stream) in connections {
        let _ = stream.shutdown(Shutdown::Both);
    }
    tracing::trace!("Control server thread exiting");
}

// ==================== Reader side ====================

/// Control thread of a reader
#[derive(Debug)]
pub struct ControlClient {
    cancel: Arc<AtomicBool>,
    goodbye: Arc<Mutex<Option<u64>>>,
    handle: Option<JoinHandle<()>>,
}

fn handshake(
    address: &Address,
    rank: usize,
    size: usize,
    cancel: &AtomicBool,
    timeout: Duration,
) -> Result<(TcpStream, Handshake)> {
    let deadline = Instant::now() + timeout;
    let mut stream = connect_with_retry(address, timeout)?;
    stream.set_read_timeout(Some(IO_POLL))?;
    stream.set_write_timeout(Some(IO_POLL))?;
    send(&mut stream, &ControlMessage::Hello { rank, size }, cancel)?;
    match receive(&mut stream, cancel, Some(deadline))? {
        Some(ControlMessage::Handshake(handshake)) => Ok((stream, handshake)),
        other => Err(AdaptioError::TransportFault(format!(
            "expected handshake from {}, got {:?}",
            address, other
        ))),
    }
}

impl ControlClient {
    /// Connect to a writer's control address and wait for its handshake
    pub fn connect(address: &Address, rank: usize, size: usize, timeout: Duration) -> Result<(Self, Handshake)> {
        let cancel = Arc::new(AtomicBool::new(false));
        let goodbye = Arc::new(Mutex::new(None));
        let (tx, rx) = bounded::<Result<Handshake>>(1);

        let thread_address = address.clone();
        let thread_cancel = Arc::clone(&cancel);
        let thread_goodbye = Arc::clone(&goodbye);
        let handle = thread::Builder::new()
            .name("adaptio-ctl-client".to_string())
            .spawn(move || {
                let mut stream = match handshake(&thread_address, rank, size, &thread_cancel, timeout) {
                    Ok((stream, handshake)) => {
                        if tx.send(Ok(handshake)).is_err() {
                            return;
                        }
                        stream
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                loop {
                    match receive(&mut stream, &thread_cancel, None) {
                        Ok(Some(ControlMessage::Goodbye { steps })) => {
                            tracing::debug!("Writer at {} closed after {} step(s)", thread_address, steps);
                            *thread_goodbye.lock() = Some(steps);
                            break;
                        }
                        Ok(Some(other)) => tracing::debug!("Ignoring control message {:?}", other),
                        Ok(None) => break,
                        Err(e) => {
                            if !thread_cancel.load(Ordering::Acquire) {
                                tracing::debug!("Control connection to {} ended: {}", thread_address, e);
                            }
                            break;
                        }
                    }
                }
            })?;

        let mut client = Self {
            cancel,
            goodbye,
            handle: Some(handle),
        };
        match rx.recv_timeout(timeout + IO_POLL * 2) {
            Ok(Ok(handshake)) => Ok((client, handshake)),
            Ok(Err(e)) => {
                client.close()?;
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                client.close()?;
                Err(AdaptioError::Timeout(format!("no handshake from {} within {:?}", address, timeout)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                client.close()?;
                Err(AdaptioError::TransportFault(format!(
                    "control thread for {} exited before the handshake",
                    address
                )))
            }
        }
    }

    /// Steps the writer reported in its goodbye, once received
    pub fn writer_steps(&self) -> Option<u64> {
        *self.goodbye.lock()
    }

    pub fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.cancel.store(true, Ordering::Release);
        handle
            .join()
            .map_err(|_| AdaptioError::TransportFault("control thread panicked".into()))
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.store(true, Ordering::Release);
            let _ = handle.join();
        }
    }
}

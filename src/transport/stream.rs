//! TCP stream channels
//!
//! A [`Publisher`] listens on one address and broadcasts every frame written
//! to it to all connected subscribers. A [`Subscriber`] connects to one
//! publisher and feeds received frames into a [`StreamInbound`] queue that
//! may be shared by several subscribers (one per parallel channel).
//!
//! Each channel runs exactly one background thread. The application thread
//! and the channel thread only meet at a [`BoundedQueue`]. Sockets carry read
//! and write timeouts so a channel thread notices its cancel flag within
//! [`IO_POLL`] even in the middle of a transfer.
//!
//! # Framing
//!
//! Every message is a little-endian `u32` length followed by the payload. A
//! zero-length message is the orderly end marker a publisher writes after its
//! queue was closed and drained; a connection that ends without it is a fault.

use super::queue::{BoundedQueue, Popped};
use super::{Transport, TransportKind};
use crate::address::Address;
use crate::error::{AdaptioError, Result, ResultExt};
use crate::types::Mode;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest time a channel thread goes without checking its cancel flag
pub const IO_POLL: Duration = Duration::from_millis(50);

/// Pause between accept attempts while a publisher has no subscriber
const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// Pause between connection attempts to a publisher that is not up yet
const CONNECT_RETRY: Duration = Duration::from_millis(20);

// ==================== Framing ====================

fn cancelled() -> io::Error {
    io::Error::new(ErrorKind::Other, "channel cancelled")
}

/// The peer went away, as opposed to the connection failing under us
fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::WriteZero
            | ErrorKind::UnexpectedEof
    )
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

fn write_fully(stream: &mut TcpStream, mut buf: &[u8], cancel: &AtomicBool) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "peer stopped reading")),
            Ok(n) => buf = &buf[n..],
            Err(e) if is_retryable(&e) => {
                if cancel.load(Ordering::Acquire) {
                    return Err(cancelled());
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn read_fully(
    stream: &mut TcpStream,
    buf: &mut [u8],
    cancel: &AtomicBool,
    deadline: Option<Instant>,
) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "connection closed without end marker",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if is_retryable(&e) => {
                if cancel.load(Ordering::Acquire) {
                    return Err(cancelled());
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(io::Error::new(ErrorKind::TimedOut, "peer sent nothing in time"));
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write one length-prefixed message
pub(crate) fn write_frame(stream: &mut TcpStream, payload: &[u8], cancel: &AtomicBool) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "message exceeds 4 GiB"))?;
    let mut header = BytesMut::with_capacity(4);
    header.put_u32_le(len);
    write_fully(stream, &header, cancel)?;
    write_fully(stream, payload, cancel)?;
    stream.flush()
}

/// Write the orderly end marker
pub(crate) fn write_end_marker(stream: &mut TcpStream, cancel: &AtomicBool) -> io::Result<()> {
    write_frame(stream, &[], cancel)
}

/// Read one message; `Ok(None)` is the end marker
pub(crate) fn read_frame(stream: &mut TcpStream, cancel: &AtomicBool) -> io::Result<Option<Bytes>> {
    read_frame_until(stream, cancel, None)
}

/// Like [`read_frame`], failing with `TimedOut` once `deadline` passed.
///
/// The stream needs a read timeout for the deadline to be noticed.
pub(crate) fn read_frame_until(
    stream: &mut TcpStream,
    cancel: &AtomicBool,
    deadline: Option<Instant>,
) -> io::Result<Option<Bytes>> {
    let mut header = [0u8; 4];
    read_fully(stream, &mut header, cancel, deadline)?;
    let len = u32::from_le_bytes(header) as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut body = vec![0u8; len];
    read_fully(stream, &mut body, cancel, deadline)?;
    Ok(Some(Bytes::from(body)))
}

/// Resolve `address` and connect, retrying refused connections until `timeout`
pub(crate) fn connect_with_retry(address: &Address, timeout: Duration) -> Result<TcpStream> {
    let target = address.socket_addr()?;
    let deadline = Instant::now() + timeout;
    loop {
        let candidates: Vec<SocketAddr> = target
            .to_socket_addrs()
            .with_context(|| format!("resolving {}", target))?
            .collect();
        let mut last_error = None;
        for candidate in &candidates {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match TcpStream::connect_timeout(candidate, remaining.max(Duration::from_millis(1))) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        if Instant::now() >= deadline {
            let reason = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses".to_string());
            return Err(AdaptioError::Timeout(format!(
                "connecting to {}: {}",
                target, reason
            )));
        }
        thread::sleep(CONNECT_RETRY);
    }
}

// ==================== Settings ====================

/// What a full queue does to the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Wait for room, at most `timeout` per frame; nothing is dropped
    Blocking { timeout: Duration },
    /// Never wait; the oldest queued frames are discarded
    DropOldest,
}

/// Per-channel settings of a stream transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Byte budget of the channel queue
    pub capacity: usize,
    pub delivery: Delivery,
    /// Longest time `close` waits for queued frames to go out
    pub drain_interval: Duration,
    /// Longest time a subscriber waits for its publisher to accept
    pub connect_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            capacity: 1 << 30,
            delivery: Delivery::DropOldest,
            drain_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// ==================== Publisher ====================

#[derive(Debug, Default)]
struct PublisherShared {
    subscribers: AtomicUsize,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    fault: Mutex<Option<String>>,
}

impl PublisherShared {
    fn record_fault(&self, message: String) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(message);
        }
    }
}

/// Listening channel that broadcasts frames to every subscriber
#[derive(Debug)]
pub struct Publisher {
    index: usize,
    address: Address,
    settings: StreamSettings,
    queue: Arc<BoundedQueue>,
    cancel: Arc<AtomicBool>,
    shared: Arc<PublisherShared>,
    local: Option<SocketAddr>,
    handle: Option<JoinHandle<()>>,
}

impl Publisher {
    /// Channel `index` that will listen on `address` once opened
    pub fn new(index: usize, address: Address, settings: StreamSettings) -> Self {
        Self {
            index,
            address,
            queue: Arc::new(BoundedQueue::new(settings.capacity)),
            settings,
            cancel: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(PublisherShared::default()),
            local: None,
            handle: None,
        }
    }

    /// Address actually bound (differs from the configured one for port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }
}

impl Transport for Publisher {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn open(&mut self, _name: &str, _mode: Mode) -> Result<()> {
        if self.handle.is_some() {
            return Err(AdaptioError::InvalidState("publisher already open".into()));
        }
        let target = self.address.socket_addr()?;
        let listener =
            TcpListener::bind(&target).with_context(|| format!("binding channel {} on {}", self.index, target))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        let index = self.index;
        let queue = Arc::clone(&self.queue);
        let cancel = Arc::clone(&self.cancel);
        let shared = Arc::clone(&self.shared);
        let delivery = self.settings.delivery;
        let handle = thread::Builder::new()
            .name(format!("adaptio-pub-{}", index))
            .spawn(move || run_publisher(index, listener, delivery, queue, cancel, shared))?;

        tracing::debug!("Channel {} publishing on {}", index, local);
        self.local = Some(local);
        self.handle = Some(handle);
        Ok(())
    }

    fn set_buffer(&mut self, size: usize) {
        if self.handle.is_none() {
            self.settings.capacity = size;
            self.queue = Arc::new(BoundedQueue::new(size));
        }
    }

    fn write(&mut self, frame: Bytes) -> Result<()> {
        if self.handle.is_none() {
            return Err(AdaptioError::InvalidState("publisher is not open".into()));
        }
        match self.settings.delivery {
            Delivery::Blocking { timeout } => self
                .queue
                .push_blocking(frame, Some(Instant::now() + timeout)),
            Delivery::DropOldest => {
                let dropped = self.queue.push_evicting(frame)?;
                if dropped > 0 {
                    tracing::debug!("Channel {} dropped {} queued frame(s)", self.index, dropped);
                }
                Ok(())
            }
        }
    }

    fn read(&mut self, _timeout: Option<Duration>) -> Result<Option<Bytes>> {
        Err(AdaptioError::InvalidState("cannot read from a publisher".into()))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) {
        self.queue.close();
    }

    fn is_drained(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Release);
    }

    fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.queue.close();
        let deadline = Instant::now() + self.settings.drain_interval;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(ACCEPT_POLL);
        }
        if !handle.is_finished() {
            tracing::warn!(
                "Channel {} not drained within {:?}, dropping {} queued frame(s)",
                self.index,
                self.settings.drain_interval,
                self.queue.len()
            );
            self.cancel.store(true, Ordering::Release);
        }
        handle
            .join()
            .map_err(|_| AdaptioError::TransportFault(format!("channel {} thread panicked", self.index)))
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn endpoint(&self) -> Option<String> {
        self.local.map(|addr| format!("tcp://{}", addr))
    }

    fn subscribers(&self) -> usize {
        self.shared.subscribers.load(Ordering::Relaxed)
    }

    /// Frames discarded because the queue was full
    fn dropped(&self) -> u64 {
        self.queue.evicted()
    }

    fn fault(&self) -> Option<String> {
        self.shared.fault.lock().clone()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.store(true, Ordering::Release);
            self.queue.close();
            let _ = handle.join();
        }
    }
}

fn accept_pending(
    index: usize,
    listener: &TcpListener,
    shared: &PublisherShared,
    subscribers: &mut Vec<(SocketAddr, TcpStream)>,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let configured = stream
                    .set_nonblocking(false)
                    .and_then(|_| stream.set_nodelay(true))
                    .and_then(|_| stream.set_write_timeout(Some(IO_POLL)));
                match configured {
                    Ok(()) => {
                        tracing::info!("Subscriber {} connected to channel {}", peer, index);
                        subscribers.push((peer, stream));
                    }
                    Err(e) => tracing::warn!("Rejecting subscriber {}: {}", peer, e),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionAborted | ErrorKind::Interrupted) => {
                tracing::debug!("Channel {} lost a connection before accept: {}", index, e);
                return;
            }
            Err(e) => {
                tracing::error!("Channel {} accept failed: {}", index, e);
                shared.record_fault(format!("channel {} accept failed: {}", index, e));
                return;
            }
        }
    }
}

fn run_publisher(
    index: usize,
    listener: TcpListener,
    delivery: Delivery,
    queue: Arc<BoundedQueue>,
    cancel: Arc<AtomicBool>,
    shared: Arc<PublisherShared>,
) {
    let mut subscribers: Vec<(SocketAddr, TcpStream)> = Vec::new();

    loop {
        if cancel.load(Ordering::Acquire) {
            tracing::debug!("Channel {} cancelled with {} frame(s) queued", index, queue.len());
            break;
        }

        accept_pending(index, &listener, &shared, &mut subscribers);
        shared.subscribers.store(subscribers.len(), Ordering::Relaxed);

        if subscribers.is_empty() {
            if queue.is_closed() && queue.is_empty() {
                break;
            }
            thread::sleep(ACCEPT_POLL);
            continue;
        }

        match queue.pop(Some(IO_POLL)) {
            Popped::Item(frame) => {
                subscribers.retain_mut(|(peer, stream)| match write_frame(stream, &frame, &cancel) {
                    Ok(()) => true,
                    Err(_) if cancel.load(Ordering::Acquire) => false,
                    // A synchronous stream may not lose a step to a departed reader
                    Err(e) if is_disconnect(&e) && delivery == Delivery::DropOldest => {
                        tracing::warn!("Subscriber {} left channel {}: {}", peer, index, e);
                        false
                    }
                    Err(e) => {
                        tracing::error!("Channel {} lost subscriber {}: {}", index, peer, e);
                        shared.record_fault(format!("channel {} to {}: {}", index, peer, e));
                        false
                    }
                });
                shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                shared.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            Popped::Empty => {}
            Popped::Closed => {
                for (peer, stream) in subscribers.iter_mut() {
                    if let Err(e) = write_end_marker(stream, &cancel) {
                        tracing::debug!("End marker to {} failed: {}", peer, e);
                    }
                }
                break;
            }
        }
    }

    for (_, stream) in subscribers {
        let _ = stream.shutdown(Shutdown::Write);
    }
    shared.subscribers.store(0, Ordering::Relaxed);
    tracing::trace!("Channel {} publisher thread exiting", index);
}

// ==================== Subscriber ====================

/// Receive side shared by every subscriber channel of one reader
#[derive(Debug)]
pub struct StreamInbound {
    queue: BoundedQueue,
    fault: Mutex<Option<String>>,
    live: AtomicUsize,
    dropped: AtomicU64,
}

impl StreamInbound {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: BoundedQueue::new(capacity),
            fault: Mutex::new(None),
            live: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// First fault recorded by any channel thread
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Frames discarded because the reader fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_fault(&self, message: String) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(message);
        }
    }

    fn deliver(&self, frame: Bytes, delivery: Delivery, cancel: &AtomicBool) -> Result<()> {
        match delivery {
            Delivery::DropOldest => {
                let dropped = self.queue.push_evicting(frame)?;
                self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
                Ok(())
            }
            Delivery::Blocking { .. } => loop {
                match self
                    .queue
                    .push_blocking(frame.clone(), Some(Instant::now() + IO_POLL))
                {
                    Err(e) if e.is_timeout() => {
                        if cancel.load(Ordering::Acquire) {
                            return Ok(());
                        }
                    }
                    other => return other,
                }
            },
        }
    }

    fn release(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.queue.close();
        }
    }

    /// Next frame from any channel
    pub fn next(&self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        match self.queue.pop(timeout) {
            Popped::Item(frame) => Ok(Some(frame)),
            Popped::Empty => Err(AdaptioError::Timeout(format!(
                "no data within {:?}",
                timeout.unwrap_or_default()
            ))),
            Popped::Closed => match self.fault() {
                Some(fault) => Err(AdaptioError::TransportFault(fault)),
                None => Ok(None),
            },
        }
    }
}

/// Connecting channel that feeds a [`StreamInbound`]
#[derive(Debug)]
pub struct Subscriber {
    index: usize,
    address: Address,
    settings: StreamSettings,
    inbound: Arc<StreamInbound>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscriber {
    pub fn new(index: usize, address: Address, settings: StreamSettings, inbound: Arc<StreamInbound>) -> Self {
        Self {
            index,
            address,
            settings,
            inbound,
            cancel: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn inbound(&self) -> &Arc<StreamInbound> {
        &self.inbound
    }
}

impl Transport for Subscriber {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn open(&mut self, _name: &str, _mode: Mode) -> Result<()> {
        if self.handle.is_some() {
            return Err(AdaptioError::InvalidState("subscriber already open".into()));
        }
        let mut stream = connect_with_retry(&self.address, self.settings.connect_timeout)
            .with_context(|| format!("channel {}", self.index))?;
        stream.set_read_timeout(Some(IO_POLL))?;
        let peer = self.address.to_string();

        let index = self.index;
        let delivery = self.settings.delivery;
        let inbound = Arc::clone(&self.inbound);
        let cancel = Arc::clone(&self.cancel);
        inbound.live.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("adaptio-sub-{}", index))
            .spawn(move || {
                let outcome = loop {
                    if cancel.load(Ordering::Acquire) {
                        break Ok(());
                    }
                    match read_frame(&mut stream, &cancel) {
                        Ok(Some(frame)) => {
                            if let Err(e) = inbound.deliver(frame, delivery, &cancel) {
                                break Err(e.to_string());
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("Channel {} received end marker from {}", index, peer);
                            break Ok(());
                        }
                        Err(_) if cancel.load(Ordering::Acquire) => break Ok(()),
                        Err(e) => break Err(e.to_string()),
                    }
                };
                if let Err(reason) = outcome {
                    if !cancel.load(Ordering::Acquire) {
                        tracing::error!("Channel {} from {} failed: {}", index, peer, reason);
                        inbound.record_fault(format!("channel {} from {}: {}", index, peer, reason));
                    }
                }
                inbound.release();
            });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.inbound.release();
                Err(e.into())
            }
        }
    }

    fn set_buffer(&mut self, size: usize) {
        self.settings.capacity = size;
    }

    fn write(&mut self, _frame: Bytes) -> Result<()> {
        Err(AdaptioError::InvalidState("cannot write to a subscriber".into()))
    }

    fn read(&mut self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        self.inbound.next(timeout)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop receiving; frames already delivered stay readable
    fn finish(&mut self) {
        self.cancel.store(true, Ordering::Release);
    }

    fn is_drained(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Release);
    }

    fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.cancel.store(true, Ordering::Release);
        handle
            .join()
            .map_err(|_| AdaptioError::TransportFault(format!("channel {} thread panicked", self.index)))
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.store(true, Ordering::Release);
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> Address {
        "tcp://127.0.0.1:0".parse().unwrap()
    }

    fn settings(delivery: Delivery) -> StreamSettings {
        StreamSettings {
            capacity: 1 << 20,
            delivery,
            drain_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn open_pair(delivery: Delivery) -> (Publisher, Subscriber) {
        let mut publisher = Publisher::new(0, local(), settings(delivery));
        publisher.open("", Mode::Write).unwrap();
        let endpoint: Address = publisher.endpoint().unwrap().parse().unwrap();
        let inbound = StreamInbound::new(1 << 20);
        let mut subscriber = Subscriber::new(0, endpoint, settings(delivery), inbound);
        subscriber.open("", Mode::Read).unwrap();
        (publisher, subscriber)
    }

    #[test]
    fn test_frames_arrive_in_order_then_end() {
        let (mut publisher, mut subscriber) =
            open_pair(Delivery::Blocking { timeout: Duration::from_secs(2) });
        for i in 0..10u8 {
            publisher.write(Bytes::from(vec![i; 64])).unwrap();
        }
        publisher.close().unwrap();

        for i in 0..10u8 {
            let frame = subscriber.read(Some(Duration::from_secs(2))).unwrap().unwrap();
            assert_eq!(frame[0], i);
        }
        assert!(subscriber.read(Some(Duration::from_secs(2))).unwrap().is_none());
        assert_eq!(publisher.frames_sent(), 10);
        subscriber.close().unwrap();
    }

    #[test]
    fn test_read_times_out_without_data() {
        let (mut publisher, mut subscriber) = open_pair(Delivery::DropOldest);
        let err = subscriber.read(Some(Duration::from_millis(30))).unwrap_err();
        assert!(err.is_timeout());
        subscriber.close().unwrap();
        publisher.close().unwrap();
    }

    #[test]
    fn test_connection_lost_is_fault() {
        let (publisher, mut subscriber) = open_pair(Delivery::DropOldest);
        // Wait until the publisher sees its subscriber, then kill it hard
        let deadline = Instant::now() + Duration::from_secs(2);
        while publisher.subscribers() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        drop(publisher);

        let err = subscriber.read(Some(Duration::from_secs(2))).unwrap_err();
        assert!(matches!(err, AdaptioError::TransportFault(_)));
        subscriber.close().unwrap();
    }

    /// Keep writing after the subscriber left until the publisher notices
    fn write_past_departure(delivery: Delivery) -> Publisher {
        let (mut publisher, mut subscriber) = open_pair(delivery);
        let deadline = Instant::now() + Duration::from_secs(2);
        while publisher.subscribers() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        subscriber.close().unwrap();

        for _ in 0..100 {
            publisher.write(Bytes::from(vec![7u8; 256])).unwrap();
            thread::sleep(Duration::from_millis(10));
            if publisher.subscribers() == 0 {
                break;
            }
        }
        publisher
    }

    #[test]
    fn test_departed_subscriber_faults_only_blocking_delivery() {
        let mut blocking = write_past_departure(Delivery::Blocking {
            timeout: Duration::from_secs(2),
        });
        assert_eq!(blocking.subscribers(), 0);
        assert!(blocking.fault().is_some());
        blocking.cancel();
        blocking.close().unwrap();

        let mut dropping = write_past_departure(Delivery::DropOldest);
        assert_eq!(dropping.subscribers(), 0);
        assert!(dropping.fault().is_none());
        dropping.cancel();
        dropping.close().unwrap();
    }

    #[test]
    fn test_close_without_subscriber_respects_drain_interval() {
        let mut publisher = Publisher::new(
            0,
            local(),
            StreamSettings {
                drain_interval: Duration::from_millis(100),
                ..settings(Delivery::DropOldest)
            },
        );
        publisher.open("", Mode::Write).unwrap();
        publisher.write(Bytes::from_static(b"never sent")).unwrap();
        let start = Instant::now();
        publisher.close().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(publisher.is_drained());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut publisher = Publisher::new(
            0,
            local(),
            StreamSettings {
                capacity: 16,
                ..settings(Delivery::DropOldest)
            },
        );
        publisher.open("", Mode::Write).unwrap();
        assert!(matches!(
            publisher.write(Bytes::from(vec![0u8; 17])),
            Err(AdaptioError::BufferOverflow { .. })
        ));
        publisher.close().unwrap();
    }

    #[test]
    fn test_direction_is_enforced() {
        let (mut publisher, mut subscriber) = open_pair(Delivery::DropOldest);
        assert!(publisher.read(None).is_err());
        assert!(subscriber.write(Bytes::new()).is_err());
        subscriber.close().unwrap();
        publisher.close().unwrap();
    }
}

//! Transport manager
//!
//! Owns the channels of one engine, one per configured transport, and runs
//! the same operation across all of them.

use super::{Transport, TransportKind};
use crate::error::{AdaptioError, Result, ResultExt};
use crate::types::Mode;
use bytes::Bytes;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

/// Time slice given to each channel when several are polled for data
const READ_SLICE: Duration = Duration::from_millis(10);

/// The set of channels used by one engine
#[derive(Default)]
pub struct TransportManager {
    channels: Vec<Box<dyn Transport>>,
    ended: Vec<bool>,
    next_read: usize,
}

impl fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<TransportKind> = self.channels.iter().map(|c| c.kind()).collect();
        f.debug_struct("TransportManager")
            .field("channels", &kinds)
            .field("ended", &self.ended)
            .finish()
    }
}

impl TransportManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(channels: Vec<Box<dyn Transport>>) -> Self {
        let mut manager = Self::new();
        for channel in channels {
            manager.add_channel(channel);
        }
        manager
    }

    /// Add a channel and return its index
    pub fn add_channel(&mut self, channel: Box<dyn Transport>) -> usize {
        self.channels.push(channel);
        self.ended.push(false);
        self.channels.len() - 1
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel(&self, index: usize) -> Option<&dyn Transport> {
        self.channels.get(index).map(|c| c.as_ref())
    }

    /// Give every channel a staging buffer of `size` bytes
    pub fn set_buffer_all(&mut self, size: usize) {
        for channel in &mut self.channels {
            channel.set_buffer(size);
        }
    }

    pub fn open_all(&mut self, name: &str, mode: Mode) -> Result<()> {
        for (index, channel) in self.channels.iter_mut().enumerate() {
            channel
                .open(name, mode)
                .with_context(|| format!("opening {} channel {}", channel.kind(), index))?;
        }
        Ok(())
    }

    /// Write the same frame to every channel
    pub fn write_all(&mut self, frame: Bytes) -> Result<()> {
        for channel in &mut self.channels {
            channel.write(frame.clone())?;
        }
        Ok(())
    }

    /// Write a frame to one channel
    pub fn write_to(&mut self, index: usize, frame: Bytes) -> Result<()> {
        let len = self.channels.len();
        self.channels
            .get_mut(index)
            .ok_or(AdaptioError::OutOfRange { index, len })?
            .write(frame)
    }

    /// Next frame from whichever channel has one.
    ///
    /// `Ok(None)` once every channel ended. Fails with
    /// [`AdaptioError::Timeout`] when `timeout` elapsed first.
    pub fn read_any(&mut self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        if self.channels.is_empty() {
            return Err(AdaptioError::InvalidState("no channels to read from".into()));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let count = self.channels.len();

        loop {
            let active = self.ended.iter().filter(|ended| !**ended).count();
            if active == 0 {
                return Ok(None);
            }

            for offset in 0..count {
                let index = (self.next_read + offset) % count;
                if self.ended[index] {
                    continue;
                }
                let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                let slice = if active == 1 {
                    remaining
                } else {
                    Some(remaining.map_or(READ_SLICE, |r| r.min(READ_SLICE)))
                };
                match self.channels[index].read(slice) {
                    Ok(Some(frame)) => {
                        self.next_read = (index + 1) % count;
                        return Ok(Some(frame));
                    }
                    Ok(None) => self.ended[index] = true,
                    Err(e) if e.is_timeout() => {}
                    Err(e) => return Err(e),
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(AdaptioError::Timeout(format!(
                    "no data within {:?}",
                    timeout.unwrap_or_default()
                )));
            }
        }
    }

    pub fn flush_all(&mut self) -> Result<()> {
        for channel in &mut self.channels {
            channel.flush()?;
        }
        Ok(())
    }

    /// Drain and close every channel, waiting at most `drain` overall.
    ///
    /// Channels still busy at the deadline are cancelled, so this never waits
    /// much longer than `drain`. Every channel is closed even if one fails;
    /// the first error is returned.
    pub fn close_all(&mut self, drain: Duration) -> Result<()> {
        for channel in &mut self.channels {
            channel.finish();
        }

        let deadline = Instant::now() + drain;
        while !self.channels.iter().all(|c| c.is_drained()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let mut first_error = None;
        for (index, channel) in self.channels.iter_mut().enumerate() {
            if !channel.is_drained() {
                tracing::warn!("Channel {} still busy after {:?}, cancelling", index, drain);
                channel.cancel();
            }
            if let Err(e) = channel.close() {
                tracing::error!("Closing channel {} failed: {}", index, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hard stop: cancel every channel, then close it
    pub fn cancel_all(&mut self) {
        for channel in &mut self.channels {
            channel.cancel();
        }
        for channel in &mut self.channels {
            if let Err(e) = channel.close() {
                tracing::debug!("Ignoring close error after cancel: {}", e);
            }
        }
    }

    /// Listening endpoints of all channels that have one
    pub fn endpoints(&self) -> Vec<String> {
        self.channels.iter().filter_map(|c| c.endpoint()).collect()
    }

    /// Peers connected to each channel, in channel order
    pub fn subscribers(&self) -> Vec<usize> {
        self.channels.iter().map(|c| c.subscribers()).collect()
    }

    /// True when every channel has at least one connected peer
    pub fn all_subscribed(&self) -> bool {
        !self.channels.is_empty() && self.channels.iter().all(|c| c.subscribers() > 0)
    }

    /// First background fault of any channel, tagged with its index
    pub fn fault(&self) -> Option<String> {
        self.channels
            .iter()
            .enumerate()
            .find_map(|(index, c)| c.fault().map(|f| format!("channel {}: {}", index, f)))
    }

    /// Largest number of frames any single channel discarded
    pub fn dropped(&self) -> u64 {
        self.channels.iter().map(|c| c.dropped()).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use mockall::predicate::*;
    use mockall::Sequence;

    fn mock_file() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.expect_kind().return_const(TransportKind::File);
        mock
    }

    #[test]
    fn test_open_all_opens_each_channel() {
        let mut a = mock_file();
        a.expect_open()
            .with(eq("data"), eq(Mode::Write))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut b = mock_file();
        b.expect_open().times(1).returning(|_, _| Ok(()));

        let mut manager = TransportManager::with_channels(vec![Box::new(a), Box::new(b)]);
        manager.open_all("data", Mode::Write).unwrap();
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_open_failure_carries_channel_context() {
        let mut a = mock_file();
        a.expect_open()
            .returning(|_, _| Err(AdaptioError::InvalidState("disk gone".into())));
        let mut manager = TransportManager::with_channels(vec![Box::new(a)]);
        let err = manager.open_all("data", Mode::Write).unwrap_err();
        assert!(err.to_string().contains("channel 0"));
        assert!(matches!(err.root(), AdaptioError::InvalidState(_)));
    }

    #[test]
    fn test_write_all_and_write_to() {
        let mut a = mock_file();
        a.expect_write().times(2).returning(|_| Ok(()));
        let mut b = mock_file();
        b.expect_write()
            .with(eq(Bytes::from_static(b"step")))
            .times(1)
            .returning(|_| Ok(()));

        let mut manager = TransportManager::with_channels(vec![Box::new(a), Box::new(b)]);
        manager.write_all(Bytes::from_static(b"step")).unwrap();
        manager.write_to(0, Bytes::from_static(b"only a")).unwrap();
        assert!(matches!(
            manager.write_to(5, Bytes::new()),
            Err(AdaptioError::OutOfRange { index: 5, len: 2 })
        ));
    }

    #[test]
    fn test_read_any_skips_ended_channels() {
        let mut a = mock_file();
        a.expect_read().times(1).returning(|_| Ok(None));
        let mut b = mock_file();
        let mut seq = Sequence::new();
        b.expect_read()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(Bytes::from_static(b"one"))));
        b.expect_read()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));

        let mut manager = TransportManager::with_channels(vec![Box::new(a), Box::new(b)]);
        assert_eq!(
            manager.read_any(None).unwrap(),
            Some(Bytes::from_static(b"one"))
        );
        assert_eq!(manager.read_any(None).unwrap(), None);
    }

    #[test]
    fn test_read_any_times_out() {
        let mut a = mock_file();
        a.expect_read().returning(|timeout| {
            if let Some(t) = timeout {
                std::thread::sleep(t);
            }
            Err(AdaptioError::Timeout("idle".into()))
        });
        let mut manager = TransportManager::with_channels(vec![Box::new(a)]);
        let err = manager.read_any(Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_close_all_cancels_busy_channels_and_reports_first_error() {
        let mut busy = mock_file();
        busy.expect_finish().times(1).return_const(());
        busy.expect_is_drained().return_const(false);
        busy.expect_cancel().times(1).return_const(());
        busy.expect_close()
            .times(1)
            .returning(|| Err(AdaptioError::TransportFault("stuck".into())));

        let mut idle = mock_file();
        idle.expect_finish().times(1).return_const(());
        idle.expect_is_drained().return_const(true);
        idle.expect_cancel().never();
        idle.expect_close().times(1).returning(|| Ok(()));

        let mut manager = TransportManager::with_channels(vec![Box::new(busy), Box::new(idle)]);
        let start = Instant::now();
        let err = manager.close_all(Duration::from_millis(30)).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, AdaptioError::TransportFault(_)));
    }

    #[test]
    fn test_subscriber_and_drop_counters() {
        let mut a = MockTransport::new();
        a.expect_subscribers().return_const(2usize);
        a.expect_dropped().return_const(3u64);
        let mut b = MockTransport::new();
        b.expect_subscribers().return_const(0usize);
        b.expect_dropped().return_const(1u64);

        let manager = TransportManager::with_channels(vec![Box::new(a), Box::new(b)]);
        assert_eq!(manager.subscribers(), vec![2, 0]);
        assert!(!manager.all_subscribed());
        assert_eq!(manager.dropped(), 3);
    }

    #[test]
    fn test_first_channel_fault_reported() {
        let mut healthy = MockTransport::new();
        healthy.expect_fault().return_const(None::<String>);
        let mut broken = MockTransport::new();
        broken
            .expect_fault()
            .return_const(Some("subscriber lost".to_string()));

        let manager = TransportManager::with_channels(vec![Box::new(healthy), Box::new(broken)]);
        assert_eq!(manager.fault().as_deref(), Some("channel 1: subscriber lost"));
    }

    #[test]
    fn test_read_any_without_channels() {
        let mut manager = TransportManager::new();
        assert!(manager.is_empty());
        assert!(manager.read_any(None).is_err());
        assert!(manager.endpoints().is_empty());
    }
}

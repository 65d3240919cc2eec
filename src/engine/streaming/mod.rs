//! Streaming publish/subscribe engine
//!
//! A writer listens on a control address and on one data address per
//! channel. Readers connect to the control address, receive the writer's
//! handshake (data addresses, schema, attributes), then subscribe to every
//! data channel. Each step is encoded once, cut into one stripe per channel,
//! and reassembled by the reader.
//!
//! # Main Types
//!
//! - [`StreamWriter`] - Producing side (Write/Append modes)
//! - [`StreamReader`] - Consuming side (Read mode)
//! - [`StreamingSettings`] - Engine parameters after parsing
//! - [`WorkflowMode`] - Subscribe (drops allowed) or synchronous (no drops)
//!
//! # Threads
//!
//! Both sides run one control thread plus one thread per data channel. The
//! application thread only meets them at bounded queues and a one-slot
//! handshake handoff, so every blocking call is bounded by a configured
//! timeout.
//!
//! # Parameters
//!
//! | key                  | default     |
//! |----------------------|-------------|
//! | `workflow_mode`      | `subscribe` |
//! | `buffer_size`        | 1 GiB       |
//! | `transport_channels` | 1           |
//! | `address`            | see below   |
//! | `drain_interval_ms`  | 5000        |
//! | `sync_timeout_ms`    | 30000       |
//! | `open_timeout_ms`    | 10000       |
//! | `monitor`            | false       |
//!
//! Without an `address` parameter the first tcp transport's `address` is
//! used, then the engine name if it carries a port, then
//! [`DEFAULT_ADDRESS`]. Port 0 binds ephemeral ports. Otherwise, in a writer
//! group of `size` ranks, rank `r` listens for control on `port + r` and
//! serves data channel `c` on `port + size + r * channels + c`.

pub mod assembler;
pub mod control;
pub mod reader;
pub mod writer;

pub use assembler::StepAssembler;
pub use reader::StreamReader;
pub use writer::StreamWriter;

use super::{Engine, EngineSetup};
use crate::address::Address;
use crate::config::params;
use crate::error::{AdaptioError, Result};
use crate::transport::{Delivery, StreamSettings, TransportKind};
use crate::types::Mode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;

/// Control address used when nothing else names one
pub const DEFAULT_ADDRESS: &str = "tcp://127.0.0.1:12306";

/// Delivery contract between a writer and its readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkflowMode {
    /// Newest data wins: steps may be dropped under backpressure
    #[default]
    Subscribe,
    /// Every step is delivered; backpressure reaches the writer
    Synchronous,
}

impl FromStr for WorkflowMode {
    type Err = AdaptioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subscribe" => Ok(WorkflowMode::Subscribe),
            "synchronous" | "sync" => Ok(WorkflowMode::Synchronous),
            _ => Err(AdaptioError::InvalidParameter {
                key: "workflow_mode".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowMode::Subscribe => f.write_str("subscribe"),
            WorkflowMode::Synchronous => f.write_str("synchronous"),
        }
    }
}

/// Parsed engine parameters
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingSettings {
    pub workflow: WorkflowMode,
    /// Byte budget of each channel queue
    pub buffer_size: usize,
    pub channels: usize,
    /// Control address of rank 0
    pub address: Address,
    pub drain_interval: Duration,
    pub sync_timeout: Duration,
    pub open_timeout: Duration,
    pub monitor: bool,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            workflow: WorkflowMode::Subscribe,
            buffer_size: 1 << 30,
            channels: 1,
            address: Address {
                protocol: "tcp".to_string(),
                host: "127.0.0.1".to_string(),
                port: Some(12306),
                params: Vec::new(),
            },
            drain_interval: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(10),
            monitor: false,
        }
    }
}

impl StreamingSettings {
    pub fn from_setup(setup: &EngineSetup<'_>) -> Result<Self> {
        let p = setup.parameters;
        let defaults = Self::default();

        let workflow = match params::get_string(p, "workflow_mode") {
            Some(value) => value.parse()?,
            None => defaults.workflow,
        };
        let channels = params::get_usize(p, "transport_channels")?.unwrap_or(defaults.channels);
        if channels == 0 {
            return Err(AdaptioError::InvalidParameter {
                key: "transport_channels".to_string(),
                value: "0".to_string(),
            });
        }

        let transport_address = setup
            .transports
            .iter()
            .filter(|t| t.kind == TransportKind::Tcp)
            .find_map(|t| params::get_string(&t.parameters, "address"));
        let address = match params::get_string(p, "address").or(transport_address) {
            Some(text) => Address::parse(text, Some("tcp"))?,
            None => match Address::parse(setup.name, Some("tcp")) {
                Ok(addr) if addr.port.is_some() => addr,
                _ => Address::parse(DEFAULT_ADDRESS, None)?,
            },
        };

        Ok(Self {
            workflow,
            buffer_size: params::get_byte_size(p, "buffer_size")?.unwrap_or(defaults.buffer_size),
            channels,
            address,
            drain_interval: params::get_duration_ms(p, "drain_interval_ms")?
                .unwrap_or(defaults.drain_interval),
            sync_timeout: params::get_duration_ms(p, "sync_timeout_ms")?
                .unwrap_or(defaults.sync_timeout),
            open_timeout: params::get_duration_ms(p, "open_timeout_ms")?
                .unwrap_or(defaults.open_timeout),
            monitor: params::get_bool(p, "monitor")?.unwrap_or(defaults.monitor),
        })
    }

    /// Control address of `rank`: the base port plus the rank.
    ///
    /// Depends on nothing but the rank, so a reader finds its writer before
    /// it knows the writer's channel count.
    pub fn control_address(&self, rank: usize) -> Result<Address> {
        self.offset_address(Some(rank))
    }

    /// Data address of `channel` of `rank` in a writer group of `size`.
    ///
    /// Data ports follow the `size` control ports, `channels` per rank.
    pub fn data_address(&self, rank: usize, size: usize, channel: usize) -> Result<Address> {
        let offset = rank
            .checked_mul(self.channels)
            .and_then(|o| o.checked_add(size))
            .and_then(|o| o.checked_add(channel));
        self.offset_address(offset)
    }

    fn offset_address(&self, offset: Option<usize>) -> Result<Address> {
        let mut address = self.address.clone();
        address.port = match address.port {
            Some(0) | None => Some(0),
            Some(port) => {
                let shifted = offset
                    .and_then(|o| u16::try_from(o).ok())
                    .and_then(|o| port.checked_add(o));
                match shifted {
                    Some(port) => Some(port),
                    None => {
                        return Err(AdaptioError::InvalidParameter {
                            key: "address".to_string(),
                            value: format!("{} leaves no room for port offset {:?}", self.address, offset),
                        })
                    }
                }
            }
        };
        Ok(address)
    }

    /// Per-channel transport settings for this workflow
    pub fn stream_settings(&self, workflow: WorkflowMode) -> StreamSettings {
        StreamSettings {
            capacity: self.buffer_size,
            delivery: match workflow {
                WorkflowMode::Subscribe => Delivery::DropOldest,
                WorkflowMode::Synchronous => Delivery::Blocking {
                    timeout: self.sync_timeout,
                },
            },
            drain_interval: self.drain_interval,
            connect_timeout: self.open_timeout,
        }
    }
}

/// One stripe of one step on a data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub step: u64,
    pub stripe: u32,
    pub stripes: u32,
    pub bytes: Vec<u8>,
}

/// Byte ranges cutting `len` bytes into `stripes` nearly equal parts
pub fn stripe_ranges(len: usize, stripes: usize) -> Vec<Range<usize>> {
    let stripes = stripes.max(1);
    let chunk = len.div_ceil(stripes);
    (0..stripes)
        .map(|i| {
            let start = (i * chunk).min(len);
            let end = ((i + 1) * chunk).min(len);
            start..end
        })
        .collect()
}

/// Factory registered for the streaming engine types
pub fn create(setup: EngineSetup<'_>) -> Result<Box<dyn Engine>> {
    match setup.mode {
        Mode::Write | Mode::Append => Ok(Box::new(StreamWriter::open(setup)?)),
        Mode::Read => Ok(Box::new(StreamReader::open(setup)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::VariableCatalog;
    use crate::comm::SelfComm;
    use crate::transport::TransportParams;
    use crate::types::{IoMode, Params};

    fn settings_for(name: &str, pairs: &[(&str, &str)], transports: &[TransportParams]) -> Result<StreamingSettings> {
        let parameters: Params = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut catalog = VariableCatalog::new(true);
        let setup = EngineSetup {
            name,
            engine_type: "dataman",
            mode: Mode::Write,
            comm: SelfComm::handle(),
            io_mode: IoMode::Independent,
            parameters: &parameters,
            transports,
            catalog: &mut catalog,
        };
        StreamingSettings::from_setup(&setup)
    }

    #[test]
    fn test_defaults() {
        let s = settings_for("plain", &[], &[]).unwrap();
        assert_eq!(s, StreamingSettings::default());
        assert_eq!(s.address.to_string(), DEFAULT_ADDRESS);
    }

    #[test]
    fn test_parameters_parsed() {
        let s = settings_for(
            "x",
            &[
                ("workflow_mode", "Synchronous"),
                ("buffer_size", "4m"),
                ("transport_channels", "3"),
                ("address", "127.0.0.1:5000"),
                ("monitor", "on"),
                ("sync_timeout_ms", "250"),
            ],
            &[],
        )
        .unwrap();
        assert_eq!(s.workflow, WorkflowMode::Synchronous);
        assert_eq!(s.buffer_size, 4 << 20);
        assert_eq!(s.channels, 3);
        assert_eq!(s.address.protocol, "tcp");
        assert!(s.monitor);
        assert_eq!(s.sync_timeout, Duration::from_millis(250));
        assert_eq!(s.control_address(1).unwrap().port, Some(5001));
        assert_eq!(s.data_address(0, 1, 2).unwrap().port, Some(5003));
        assert_eq!(s.data_address(1, 2, 0).unwrap().port, Some(5005));
    }

    #[test]
    fn test_address_fallbacks() {
        let mut tcp = Params::new();
        tcp.insert("address".into(), "tcp://10.0.0.1:7000".into());
        let transports = vec![TransportParams {
            kind: TransportKind::Tcp,
            parameters: tcp,
        }];
        let s = settings_for("ignored", &[], &transports).unwrap();
        assert_eq!(s.address.host, "10.0.0.1");

        let s = settings_for("localhost:9100", &[], &[]).unwrap();
        assert_eq!(s.address.port, Some(9100));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            settings_for("x", &[("workflow_mode", "eventually")], &[]),
            Err(AdaptioError::InvalidParameter { .. })
        ));
        assert!(settings_for("x", &[("transport_channels", "0")], &[]).is_err());
        assert!(matches!(
            settings_for("x", &[("address", "tcp://h:port")], &[]),
            Err(AdaptioError::MalformedAddress { .. })
        ));
    }

    #[test]
    fn test_ephemeral_ports_stay_ephemeral() {
        let s = settings_for("x", &[("address", "127.0.0.1:0"), ("transport_channels", "2")], &[])
            .unwrap();
        assert_eq!(s.control_address(3).unwrap().port, Some(0));
        assert_eq!(s.data_address(3, 4, 1).unwrap().port, Some(0));
    }

    #[test]
    fn test_control_port_ignores_channel_count() {
        let one = settings_for("x", &[("address", "127.0.0.1:6000")], &[]).unwrap();
        let three = settings_for("x", &[("address", "127.0.0.1:6000"), ("transport_channels", "3")], &[])
            .unwrap();
        for rank in 0..4 {
            assert_eq!(one.control_address(rank).unwrap(), three.control_address(rank).unwrap());
        }
        // No data port of a two-rank group lands on a control port
        for rank in 0..2 {
            for channel in 0..3 {
                let port = three.data_address(rank, 2, channel).unwrap().port.unwrap();
                assert!(port >= 6002);
            }
        }
    }

    #[test]
    fn test_port_offsets_never_wrap() {
        let s = settings_for("x", &[("address", "127.0.0.1:65530"), ("transport_channels", "2")], &[])
            .unwrap();
        assert_eq!(s.control_address(5).unwrap().port, Some(65535));
        assert!(matches!(
            s.control_address(6),
            Err(AdaptioError::InvalidParameter { .. })
        ));
        assert!(s.data_address(3, 4, 0).is_err());
        assert!(s.data_address(usize::MAX, 1, 0).is_err());
        assert!(s.control_address(1 << 20).is_err());
    }

    #[test]
    fn test_stripe_ranges_cover_payload() {
        assert_eq!(stripe_ranges(10, 3), vec![0..4, 4..8, 8..10]);
        assert_eq!(stripe_ranges(2, 4), vec![0..1, 1..2, 2..2, 2..2]);
        assert_eq!(stripe_ranges(0, 2), vec![0..0, 0..0]);
        assert_eq!(stripe_ranges(5, 0), vec![0..5]);
    }
}

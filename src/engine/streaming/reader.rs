//! Consuming side of the streaming engine

use super::control::ControlClient;
use super::{DataFrame, StepAssembler, StreamingSettings, WorkflowMode};
use crate::address::Address;
use crate::catalog::VariableCatalog;
use crate::comm::CommHandle;
use crate::engine::payload::{self, StepPayload, VariableBlock};
use crate::engine::{ensure_state, Engine, EngineSetup, EngineState, EngineStats};
use crate::error::{AdaptioError, Result, ResultExt};
use crate::transport::{StreamInbound, Subscriber, TransportManager};
use crate::types::Mode;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Replace a wildcard host advertised by the writer with the host we reached it on
fn reachable(mut address: Address, control: &Address) -> Address {
    let wildcard = address.host.is_empty()
        || address
            .host
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_unspecified());
    if wildcard {
        address.host = control.host.clone();
    }
    address
}

/// Streaming engine opened for reading
pub struct StreamReader {
    name: String,
    engine_type: String,
    comm: CommHandle,
    settings: StreamingSettings,
    workflow: WorkflowMode,
    writer: (usize, usize),
    state: EngineState,
    fault: Option<String>,
    control: ControlClient,
    inbound: Arc<StreamInbound>,
    transports: TransportManager,
    assembler: StepAssembler,
    current: Option<StepPayload>,
    last_step: Option<u64>,
    ended: bool,
    steps: u64,
    bytes: u64,
    opened_at: Instant,
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("name", &self.name)
            .field("workflow", &self.workflow)
            .field("state", &self.state)
            .field("transports", &self.transports)
            .finish()
    }
}

impl StreamReader {
    pub fn open(setup: EngineSetup<'_>) -> Result<Self> {
        let settings = StreamingSettings::from_setup(&setup)?;
        let rank = setup.comm.rank();
        let control_address = settings.control_address(rank)?;

        let (mut control, handshake) =
            ControlClient::connect(&control_address, rank, setup.comm.size(), settings.open_timeout)
                .with_context(|| format!("opening streaming reader '{}'", setup.name))?;

        if handshake.workflow != settings.workflow {
            tracing::debug!(
                "Reader '{}' follows the writer's {} workflow",
                setup.name,
                handshake.workflow
            );
        }
        for descriptor in &handshake.variables {
            setup.catalog.adopt_descriptor(descriptor);
        }
        for record in &handshake.attributes {
            setup.catalog.adopt_attribute(record)?;
        }

        if handshake.channels.is_empty() {
            control.close()?;
            return Err(AdaptioError::TransportFault(format!(
                "writer at {} advertised no data channels",
                control_address
            )));
        }

        let inbound = StreamInbound::new(settings.buffer_size);
        let stream_settings = settings.stream_settings(handshake.workflow);
        let mut transports = TransportManager::new();
        for (index, channel) in handshake.channels.iter().enumerate() {
            let address = reachable(Address::parse(channel, Some("tcp"))?, &control_address);
            transports.add_channel(Box::new(Subscriber::new(
                index,
                address,
                stream_settings,
                Arc::clone(&inbound),
            )));
        }
        if let Err(e) = transports.open_all(setup.name, Mode::Read) {
            transports.cancel_all();
            control.close()?;
            return Err(e);
        }

        setup.comm.barrier();
        tracing::info!(
            "Opened streaming reader '{}' rank {}/{} from writer rank {}/{}, {} channel(s)",
            setup.name,
            rank,
            setup.comm.size(),
            handshake.rank,
            handshake.size,
            transports.len()
        );

        Ok(Self {
            name: setup.name.to_string(),
            engine_type: setup.engine_type.to_string(),
            comm: setup.comm,
            settings,
            workflow: handshake.workflow,
            writer: (handshake.rank, handshake.size),
            state: EngineState::Opened,
            fault: None,
            control,
            inbound,
            transports,
            assembler: StepAssembler::new(),
            current: None,
            last_step: None,
            ended: false,
            steps: 0,
            bytes: 0,
            opened_at: Instant::now(),
        })
    }

    /// Rank and group size of the writer this reader is paired with
    pub fn writer_rank(&self) -> (usize, usize) {
        self.writer
    }

    /// Workflow announced by the writer
    pub fn workflow(&self) -> WorkflowMode {
        self.workflow
    }

    /// Steps the writer reported on close, once it said goodbye
    pub fn writer_steps(&self) -> Option<u64> {
        self.control.writer_steps()
    }

    fn check(&self, allowed: &[EngineState], operation: &str) -> Result<()> {
        ensure_state(&self.name, self.state, self.fault.as_deref(), allowed, operation)
    }

    fn fail(&mut self, error: AdaptioError) -> AdaptioError {
        let message = match error.root() {
            AdaptioError::TransportFault(reason) => reason.clone(),
            _ => error.to_string(),
        };
        tracing::error!("Streaming reader '{}' faulted: {}", self.name, message);
        self.state = EngineState::Faulted;
        self.fault = Some(message.clone());
        AdaptioError::TransportFault(message)
    }

    /// Move to `Faulted` if a channel thread recorded a failure
    fn check_channels(&mut self) -> Result<()> {
        match self.inbound.fault() {
            Some(fault) => Err(self.fail(AdaptioError::TransportFault(fault))),
            None => Ok(()),
        }
    }
}

impl Engine for StreamReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine_type(&self) -> &str {
        &self.engine_type
    }

    fn mode(&self) -> Mode {
        Mode::Read
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn current_step(&self) -> Option<u64> {
        self.last_step
    }

    fn begin_step(&mut self, catalog: &mut VariableCatalog, timeout: Option<Duration>) -> Result<u64> {
        self.check(&[EngineState::Opened], "begin_step")?;
        self.check_channels()?;
        if self.ended {
            return Err(AdaptioError::EndOfStream);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let frame = match self.transports.read_any(remaining) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.ended = true;
                    tracing::debug!("Reader '{}' reached end of stream after {} step(s)", self.name, self.steps);
                    return Err(AdaptioError::EndOfStream);
                }
                Err(e) if e.is_timeout() => {
                    return Err(AdaptioError::Timeout(format!(
                        "no step from '{}' within {:?}",
                        self.name,
                        timeout.unwrap_or_default()
                    )))
                }
                Err(e) => return Err(self.fail(e)),
            };

            let stripe: DataFrame = match bincode::deserialize(&frame) {
                Ok(stripe) => stripe,
                Err(e) => return Err(self.fail(e.into())),
            };
            let Some((step, bytes)) = self.assembler.push(stripe) else {
                continue;
            };
            let payload = match payload::decode_step(&bytes) {
                Ok(payload) => payload,
                Err(e) => return Err(self.fail(e)),
            };
            payload.apply_to(catalog)?;

            if let Some(previous) = self.last_step {
                if step > previous + 1 {
                    tracing::debug!("Reader '{}' skipped steps {}..{}", self.name, previous + 1, step);
                }
            }
            self.bytes += bytes.len() as u64;
            self.last_step = Some(step);
            self.current = Some(payload);
            self.state = EngineState::Active;
            return Ok(step);
        }
    }

    fn put_block(&mut self, block: VariableBlock) -> Result<()> {
        Err(AdaptioError::InvalidState(format!(
            "put of '{}' on streaming reader '{}'",
            block.name, self.name
        )))
    }

    fn get_block(&self, name: &str) -> Result<&VariableBlock> {
        self.check(&[EngineState::Active], "get")?;
        self.current
            .as_ref()
            .and_then(|p| p.find(name))
            .ok_or_else(|| AdaptioError::VariableNotInStep(name.to_string()))
    }

    fn end_step(&mut self, _catalog: &VariableCatalog) -> Result<()> {
        self.check(&[EngineState::Active], "end_step")?;
        self.current = None;
        self.steps += 1;
        self.state = EngineState::Opened;
        self.check_channels()?;
        if self.settings.monitor {
            tracing::info!(
                "Reader '{}' consumed step {:?} ({} total, {} dropped)",
                self.name,
                self.last_step,
                self.steps,
                self.stats().dropped_steps
            );
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == EngineState::Closed {
            return Ok(());
        }
        self.current = None;
        let unreported = match self.inbound.fault() {
            Some(fault) if self.fault.is_none() => {
                tracing::error!("Streaming reader '{}' faulted before close: {}", self.name, fault);
                Some(AdaptioError::TransportFault(fault))
            }
            _ => None,
        };
        let channels = self.transports.close_all(self.settings.drain_interval);
        let control = self.control.close();
        self.comm.barrier();
        self.state = EngineState::Closed;
        tracing::info!(
            "Closed streaming reader '{}' after {} step(s), {} bytes",
            self.name,
            self.steps,
            self.bytes
        );
        match unreported {
            Some(fault) => Err(fault),
            None => channels.and(control),
        }
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            steps: self.steps,
            bytes: self.bytes,
            dropped_steps: self.inbound.dropped() + self.assembler.discarded(),
            subscribers: 0,
            elapsed: self.opened_at.elapsed(),
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if self.state != EngineState::Closed {
            self.transports.cancel_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_host_replaced() {
        let control: Address = "tcp://10.1.2.3:5000".parse().unwrap();
        let advertised: Address = "tcp://0.0.0.0:6001".parse().unwrap();
        assert_eq!(reachable(advertised, &control).to_string(), "tcp://10.1.2.3:6001");

        let advertised: Address = "tcp://127.0.0.1:6001".parse().unwrap();
        assert_eq!(reachable(advertised, &control).host, "127.0.0.1");
    }
}

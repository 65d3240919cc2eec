//! Producing side of the streaming engine

use super::control::{ControlServer, Handshake, Peer};
use super::{stripe_ranges, DataFrame, StreamingSettings, WorkflowMode};
use crate::catalog::VariableCatalog;
use crate::comm::CommHandle;
use crate::engine::payload::{self, StepPayload, VariableBlock};
use crate::engine::{ensure_state, Engine, EngineSetup, EngineState, EngineStats};
use crate::error::{AdaptioError, Result};
use crate::transport::stream::IO_POLL;
use crate::transport::{Publisher, TransportManager};
use crate::types::Mode;
use bytes::Bytes;
use std::thread;
use std::time::{Duration, Instant};

const SUBSCRIBE_POLL: Duration = Duration::from_millis(5);

/// Streaming engine opened for writing
pub struct StreamWriter {
    name: String,
    engine_type: String,
    mode: Mode,
    comm: CommHandle,
    settings: StreamingSettings,
    state: EngineState,
    fault: Option<String>,
    control: ControlServer,
    transports: TransportManager,
    current: Option<StepPayload>,
    next_step: u64,
    steps: u64,
    bytes: u64,
    opened_at: Instant,
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("name", &self.name)
            .field("workflow", &self.settings.workflow)
            .field("state", &self.state)
            .field("control", &self.control.local_addr())
            .field("transports", &self.transports)
            .finish()
    }
}

impl StreamWriter {
    pub fn open(setup: EngineSetup<'_>) -> Result<Self> {
        let settings = StreamingSettings::from_setup(&setup)?;
        let rank = setup.comm.rank();
        let size = setup.comm.size();
        let stream_settings = settings.stream_settings(settings.workflow);
        let control_address = settings.control_address(rank)?;

        let mut transports = TransportManager::new();
        for channel in 0..settings.channels {
            let address = settings.data_address(rank, size, channel)?;
            transports.add_channel(Box::new(Publisher::new(channel, address, stream_settings)));
        }
        transports.open_all(setup.name, setup.mode)?;

        let handshake = Handshake {
            rank,
            size,
            workflow: settings.workflow,
            channels: transports.endpoints(),
            variables: setup.catalog.descriptors(),
            attributes: setup.catalog.attribute_records()?,
        };
        let control = match ControlServer::start(
            &control_address,
            handshake,
            settings.open_timeout,
        ) {
            Ok(control) => control,
            Err(e) => {
                transports.cancel_all();
                return Err(e);
            }
        };

        if setup.mode == Mode::Append {
            tracing::debug!("Streaming engine '{}' treats append as write", setup.name);
        }
        setup.comm.barrier();
        tracing::info!(
            "Opened streaming writer '{}' ({}) rank {}/{} on {}, {} channel(s)",
            setup.name,
            settings.workflow,
            rank,
            size,
            control.endpoint(),
            settings.channels
        );

        Ok(Self {
            name: setup.name.to_string(),
            engine_type: setup.engine_type.to_string(),
            mode: setup.mode,
            comm: setup.comm,
            settings,
            state: EngineState::Opened,
            fault: None,
            control,
            transports,
            current: None,
            next_step: 0,
            steps: 0,
            bytes: 0,
            opened_at: Instant::now(),
        })
    }

    /// Readers that completed the handshake
    pub fn peers(&self) -> Vec<Peer> {
        self.control.peers()
    }

    pub fn settings(&self) -> &StreamingSettings {
        &self.settings
    }

    fn check(&self, allowed: &[EngineState], operation: &str) -> Result<()> {
        ensure_state(&self.name, self.state, self.fault.as_deref(), allowed, operation)
    }

    fn fail(&mut self, error: AdaptioError) -> AdaptioError {
        let message = match error.root() {
            AdaptioError::TransportFault(reason) => reason.clone(),
            _ => error.to_string(),
        };
        tracing::error!("Streaming writer '{}' faulted: {}", self.name, message);
        self.state = EngineState::Faulted;
        self.fault = Some(message.clone());
        AdaptioError::TransportFault(message)
    }

    /// Move to `Faulted` if a channel thread recorded a failure
    fn check_channels(&mut self) -> Result<()> {
        match self.transports.fault() {
            Some(fault) => Err(self.fail(AdaptioError::TransportFault(fault))),
            None => Ok(()),
        }
    }

    /// Block until a reader is subscribed to every channel
    fn wait_for_readers(&mut self, deadline: Instant) -> Result<()> {
        while !(self.control.peer_count() > 0 && self.transports.all_subscribed()) {
            self.check_channels()?;
            if Instant::now() >= deadline {
                return Err(AdaptioError::Timeout(format!(
                    "no reader subscribed to '{}' within {:?}",
                    self.name, self.settings.sync_timeout
                )));
            }
            thread::sleep(SUBSCRIBE_POLL);
        }
        Ok(())
    }

    fn send_step(&mut self, payload: &StepPayload) -> Result<usize> {
        let encoded = payload::encode_step(payload)?;
        let ranges = stripe_ranges(encoded.len(), self.transports.len());
        let stripes = ranges.len() as u32;
        for (index, range) in ranges.into_iter().enumerate() {
            let frame = DataFrame {
                step: payload.step,
                stripe: index as u32,
                stripes,
                bytes: encoded[range].to_vec(),
            };
            let bytes = Bytes::from(bincode::serialize(&frame)?);
            match self.transports.write_to(index, bytes) {
                Ok(()) => {}
                Err(e) if e.is_timeout() => return Err(e),
                Err(e @ AdaptioError::BufferOverflow { .. }) => return Err(e),
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(encoded.len())
    }
}

impl Engine for StreamWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine_type(&self) -> &str {
        &self.engine_type
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn current_step(&self) -> Option<u64> {
        match &self.current {
            Some(payload) => Some(payload.step),
            None => self.next_step.checked_sub(1),
        }
    }

    fn begin_step(&mut self, _catalog: &mut VariableCatalog, _timeout: Option<Duration>) -> Result<u64> {
        self.check(&[EngineState::Opened], "begin_step")?;
        self.check_channels()?;
        self.current = Some(StepPayload::new(self.next_step));
        self.state = EngineState::Active;
        Ok(self.next_step)
    }

    fn put_block(&mut self, block: VariableBlock) -> Result<()> {
        self.check(&[EngineState::Active], "put")?;
        match self.current.as_mut() {
            Some(payload) => {
                payload.push(block);
                Ok(())
            }
            None => Err(AdaptioError::InvalidState("no step in progress".into())),
        }
    }

    fn get_block(&self, name: &str) -> Result<&VariableBlock> {
        Err(AdaptioError::InvalidState(format!(
            "get of '{}' on streaming writer '{}'",
            name, self.name
        )))
    }

    fn end_step(&mut self, catalog: &VariableCatalog) -> Result<()> {
        self.check(&[EngineState::Active], "end_step")?;
        let Some(mut payload) = self.current.take() else {
            return Err(AdaptioError::InvalidState("no step in progress".into()));
        };
        self.state = EngineState::Opened;
        self.check_channels()?;

        let described = !catalog.is_definition_final() || self.steps == 0;
        if described {
            payload.describe(catalog)?;
            let variables = payload.schema.clone();
            let attributes = payload.attributes.clone();
            self.control.update(|h| {
                h.variables = variables;
                h.attributes = attributes;
            });
        }

        if self.settings.workflow == WorkflowMode::Synchronous {
            self.wait_for_readers(Instant::now() + self.settings.sync_timeout)?;
        }

        let started = Instant::now();
        let size = self.send_step(&payload)?;
        self.next_step = payload.step + 1;
        self.steps += 1;
        self.bytes += size as u64;

        if self.settings.monitor {
            let secs = started.elapsed().as_secs_f64().max(1e-9);
            tracing::info!(
                "Step {} of '{}': {} bytes, {} reader(s), {:.1} MiB/s",
                payload.step,
                self.name,
                size,
                self.control.peer_count(),
                size as f64 / (1024.0 * 1024.0) / secs
            );
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == EngineState::Closed {
            return Ok(());
        }
        if self.current.take().is_some() {
            tracing::warn!("Closing streaming writer '{}' inside a step, discarding it", self.name);
        }

        let already_reported = self.fault.is_some();
        let deadline = Instant::now() + self.settings.drain_interval;
        let drained = self.transports.close_all(self.settings.drain_interval);
        let unreported = match self.transports.fault() {
            Some(fault) if !already_reported => {
                tracing::error!("Streaming writer '{}' faulted while closing: {}", self.name, fault);
                Some(AdaptioError::TransportFault(fault))
            }
            _ => None,
        };
        let control = self
            .control
            .shutdown(self.steps, deadline.max(Instant::now() + IO_POLL));
        self.comm.barrier();
        self.state = EngineState::Closed;

        let stats = self.stats();
        if self.settings.monitor {
            tracing::info!(
                "Streaming writer '{}' closed: {} step(s), {} bytes, {} dropped, {:.1} MiB/s",
                self.name,
                stats.steps,
                stats.bytes,
                stats.dropped_steps,
                stats.throughput_mib_s()
            );
        } else {
            tracing::info!("Closed streaming writer '{}' after {} step(s)", self.name, stats.steps);
        }
        match unreported {
            Some(fault) => Err(fault),
            None => drained.and(control),
        }
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            steps: self.steps,
            bytes: self.bytes,
            dropped_steps: self.transports.dropped(),
            subscribers: self.control.peer_count(),
            elapsed: self.opened_at.elapsed(),
        }
    }

    fn endpoints(&self) -> Vec<String> {
        let mut endpoints = vec![self.control.endpoint()];
        endpoints.extend(self.transports.endpoints());
        endpoints
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.state != EngineState::Closed {
            tracing::debug!("Dropping open streaming writer '{}', cancelling channels", self.name);
            self.transports.cancel_all();
        }
    }
}

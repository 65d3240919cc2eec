//! File-backed engine
//!
//! Each rank writes its steps to `<name>.dir/<basename>.<rank>`, one encoded
//! [`StepPayload`] per frame. Extra file transports mirror the same frames to
//! their own `path`. With `have_metadata_file` on, rank 0 also keeps a
//! JSON-lines step index at `<name>`.
//!
//! Readers replay the frames of their rank in order and report
//! [`AdaptioError::EndOfStream`] after the last one.

use super::payload::{self, StepPayload, VariableBlock};
use super::{ensure_state, Engine, EngineSetup, EngineState, EngineStats};
use crate::catalog::VariableCatalog;
use crate::comm::CommHandle;
use crate::config::params;
use crate::error::{AdaptioError, Result, ResultExt};
use crate::transport::file::DEFAULT_FILE_BUFFER;
use crate::transport::{FileTransport, TransportKind, TransportManager};
use crate::types::Mode;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One line of the metadata index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepIndexEntry {
    pub step: u64,
    /// RFC 3339 time the step was written
    pub time: String,
    pub ranks: usize,
    pub bytes: usize,
    pub variables: Vec<String>,
}

/// Data file of `rank` for dataset `name`
pub fn data_path(name: &str, rank: usize) -> PathBuf {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    PathBuf::from(format!("{}.dir", name)).join(format!("{}.{}", base, rank))
}

/// Read every entry of a metadata index
pub fn read_index(path: impl AsRef<Path>) -> Result<Vec<StepIndexEntry>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

/// Engine writing or replaying steps through file transports
pub struct FileEngine {
    name: String,
    engine_type: String,
    mode: Mode,
    comm: CommHandle,
    state: EngineState,
    fault: Option<String>,
    transports: TransportManager,
    index: Option<BufWriter<File>>,
    current: Option<StepPayload>,
    next_step: u64,
    last_step: Option<u64>,
    steps: u64,
    bytes: u64,
    opened_at: Instant,
}

impl std::fmt::Debug for FileEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEngine")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("transports", &self.transports)
            .finish()
    }
}

/// Factory registered for the file engine types
pub fn create(setup: EngineSetup<'_>) -> Result<Box<dyn Engine>> {
    Ok(Box::new(FileEngine::open(setup)?))
}

impl FileEngine {
    pub fn open(setup: EngineSetup<'_>) -> Result<Self> {
        let rank = setup.comm.rank();
        let buffer_size =
            params::get_byte_size(setup.parameters, "buffer_size")?.unwrap_or(DEFAULT_FILE_BUFFER);

        let mut first_file_params = None;
        let mut transports = TransportManager::new();
        let primary = data_path(setup.name, rank);
        for (i, transport) in setup.transports.iter().enumerate() {
            if transport.kind != TransportKind::File {
                return Err(AdaptioError::UnsupportedTransport(format!(
                    "{} (transport {} of file engine '{}')",
                    transport.kind, i, setup.name
                )));
            }
            if first_file_params.is_none() {
                first_file_params = Some(&transport.parameters);
                transports.add_channel(Box::new(FileTransport::with_path(&primary)));
            } else if setup.mode.is_write() {
                let mirror = match params::get_string(&transport.parameters, "path") {
                    Some(path) => PathBuf::from(format!("{}.{}", path, rank)),
                    None => PathBuf::from(format!("{}.{}", primary.display(), i)),
                };
                transports.add_channel(Box::new(FileTransport::with_path(mirror)));
            }
        }
        if transports.is_empty() {
            transports.add_channel(Box::new(FileTransport::with_path(&primary)));
        }
        transports.set_buffer_all(buffer_size);

        let have_metadata = match params::get_bool(setup.parameters, "have_metadata_file")? {
            Some(flag) => flag,
            None => match first_file_params {
                Some(p) => params::get_bool(p, "have_metadata_file")?.unwrap_or(false),
                None => false,
            },
        };

        let next_step = match setup.mode {
            Mode::Append => FileTransport::count_frames(&primary)?,
            _ => 0,
        };

        transports
            .open_all(setup.name, setup.mode)
            .with_context(|| format!("opening file engine '{}'", setup.name))?;

        let index = if have_metadata && rank == 0 && setup.mode.is_write() {
            let file = match setup.mode {
                Mode::Append => OpenOptions::new().create(true).append(true).open(setup.name),
                _ => File::create(setup.name),
            }
            .with_context(|| format!("creating metadata file {}", setup.name))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        setup.comm.barrier();
        tracing::info!(
            "Opened file engine '{}' ({}) rank {}/{}, {} channel(s)",
            setup.name,
            setup.mode,
            rank,
            setup.comm.size(),
            transports.len()
        );

        Ok(Self {
            name: setup.name.to_string(),
            engine_type: setup.engine_type.to_string(),
            mode: setup.mode,
            comm: setup.comm,
            state: EngineState::Opened,
            fault: None,
            transports,
            index,
            current: None,
            next_step,
            last_step: next_step.checked_sub(1),
            steps: 0,
            bytes: 0,
            opened_at: Instant::now(),
        })
    }

    fn check(&self, allowed: &[EngineState], operation: &str) -> Result<()> {
        ensure_state(&self.name, self.state, self.fault.as_deref(), allowed, operation)
    }

    fn fail(&mut self, error: AdaptioError) -> AdaptioError {
        let message = error.to_string();
        tracing::error!("File engine '{}' faulted: {}", self.name, message);
        self.state = EngineState::Faulted;
        self.fault = Some(message.clone());
        AdaptioError::TransportFault(message)
    }

    fn write_step(&mut self, catalog: &VariableCatalog) -> Result<()> {
        let Some(mut payload) = self.current.take() else {
            return Err(AdaptioError::InvalidState("no step in progress".into()));
        };
        if !catalog.is_definition_final() || self.steps == 0 {
            payload.describe(catalog)?;
        }
        let frame = payload::encode_step(&payload)?;
        let size = frame.len();
        if let Err(e) = self.transports.write_all(frame) {
            return Err(self.fail(e));
        }

        if let Some(index) = self.index.as_mut() {
            let entry = StepIndexEntry {
                step: payload.step,
                time: Utc::now().to_rfc3339(),
                ranks: self.comm.size(),
                bytes: size,
                variables: payload.variables.iter().map(|b| b.name.clone()).collect(),
            };
            let written = serde_json::to_writer(&mut *index, &entry)
                .map_err(AdaptioError::from)
                .and_then(|_| index.write_all(b"\n").map_err(AdaptioError::from));
            if let Err(e) = written {
                return Err(self.fail(e));
            }
        }

        self.last_step = Some(payload.step);
        self.next_step = payload.step + 1;
        self.steps += 1;
        self.bytes += size as u64;
        Ok(())
    }
}

impl Engine for FileEngine {
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
        self.current.as_ref().map(|p| p.step).or(self.last_step)
    }

    fn begin_step(&mut self, catalog: &mut VariableCatalog, _timeout: Option<Duration>) -> Result<u64> {
        self.check(&[EngineState::Opened], "begin_step")?;

        if self.mode.is_write() {
            self.current = Some(StepPayload::new(self.next_step));
            self.state = EngineState::Active;
            return Ok(self.next_step);
        }

        let frame = match self.transports.read_any(None) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(AdaptioError::EndOfStream),
            Err(e) => return Err(self.fail(e)),
        };
        let payload = payload::decode_step(&frame)?;
        payload.apply_to(catalog)?;
        let step = payload.step;
        self.bytes += frame.len() as u64;
        self.last_step = Some(step);
        self.current = Some(payload);
        self.state = EngineState::Active;
        Ok(step)
    }

    fn put_block(&mut self, block: VariableBlock) -> Result<()> {
        self.check(&[EngineState::Active], "put")?;
        if !self.mode.is_write() {
            return Err(AdaptioError::InvalidState(format!(
                "put on engine '{}' opened for reading",
                self.name
            )));
        }
        match self.current.as_mut() {
            Some(payload) => {
                payload.push(block);
                Ok(())
            }
            None => Err(AdaptioError::InvalidState("no step in progress".into())),
        }
    }

    fn get_block(&self, name: &str) -> Result<&VariableBlock> {
        self.check(&[EngineState::Active], "get")?;
        if self.mode.is_write() {
            return Err(AdaptioError::InvalidState(format!(
                "get on engine '{}' opened for writing",
                self.name
            )));
        }
        self.current
            .as_ref()
            .and_then(|p| p.find(name))
            .ok_or_else(|| AdaptioError::VariableNotInStep(name.to_string()))
    }

    fn end_step(&mut self, catalog: &VariableCatalog) -> Result<()> {
        self.check(&[EngineState::Active], "end_step")?;
        if self.mode.is_write() {
            self.write_step(catalog)?;
        } else {
            self.current = None;
            self.steps += 1;
        }
        self.state = EngineState::Opened;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == EngineState::Closed {
            return Ok(());
        }
        if self.state == EngineState::Active && self.mode.is_write() {
            tracing::warn!(
                "Closing file engine '{}' inside step {:?}, discarding it",
                self.name,
                self.current.as_ref().map(|p| p.step)
            );
        }
        self.current = None;

        let mut result = self.transports.close_all(Duration::ZERO);
        if let Some(mut index) = self.index.take() {
            if let Err(e) = index.flush() {
                result = result.and(Err(e.into()));
            }
        }
        self.comm.barrier();
        self.state = EngineState::Closed;
        tracing::info!(
            "Closed file engine '{}' after {} step(s), {} bytes",
            self.name,
            self.steps,
            self.bytes
        );
        result
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            steps: self.steps,
            bytes: self.bytes,
            dropped_steps: 0,
            subscribers: 0,
            elapsed: self.opened_at.elapsed(),
        }
    }
}

impl Drop for FileEngine {
    fn drop(&mut self) {
        if self.state != EngineState::Closed {
            self.transports.cancel_all();
        }
    }
}

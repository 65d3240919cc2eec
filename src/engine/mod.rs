//! Engines: the step-wise read/write protocol
//!
//! An engine is opened from an [`crate::Io`] namespace and moves the data of
//! that namespace's variables through transports one step at a time.
//!
//! # Main Types
//!
//! - [`Engine`] - Object-safe engine contract, implemented by every engine type
//! - [`EngineRef`] - Typed front used by applications (put/get by handle)
//! - [`EngineState`] - Lifecycle state
//! - [`EngineTypeRegistry`] - Table of engine-type factories handed to an IO
//! - [`EngineRegistry`] - Engines currently open in one IO namespace
//!
//! # Lifecycle
//!
//! ```text
//! Created → Opened → { begin_step → Active → end_step }* → Closed
//!                 any state ──(transport failure)──→ Faulted
//! ```
//!
//! A faulted engine rejects every step operation with
//! [`AdaptioError::TransportFault`] until it is closed.

pub mod file;
pub mod payload;
pub mod registry;
pub mod streaming;

pub use payload::{StepPayload, VariableBlock};
pub use registry::EngineRegistry;

use crate::catalog::{variable::Compound, VarHandle, VariableCatalog};
use crate::comm::CommHandle;
use crate::error::{AdaptioError, Result};
use crate::transport::TransportParams;
use crate::types::{DataType, DataTypeTag, IoMode, Mode, Params};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Created,
    Opened,
    /// Inside a step
    Active,
    Closed,
    Faulted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Created => "created",
            EngineState::Opened => "opened",
            EngineState::Active => "active",
            EngineState::Closed => "closed",
            EngineState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Counters reported by an engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    /// Steps completed (written or consumed)
    pub steps: u64,
    /// Encoded step bytes moved
    pub bytes: u64,
    /// Steps known to be lost to backpressure
    pub dropped_steps: u64,
    /// Connected consumers (streaming writers only)
    pub subscribers: usize,
    /// Time since open
    pub elapsed: Duration,
}

impl EngineStats {
    /// Average throughput since open, in MiB/s
    pub fn throughput_mib_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

/// Object-safe engine contract.
///
/// Applications normally use [`EngineRef`]; this trait is what engine types
/// implement and what [`EngineTypeRegistry`] factories return.
pub trait Engine: Send {
    fn name(&self) -> &str;

    /// Registered engine type this instance was created as
    fn engine_type(&self) -> &str;

    fn mode(&self) -> Mode;

    fn state(&self) -> EngineState;

    /// Step in progress or last completed, `None` before the first step
    fn current_step(&self) -> Option<u64>;

    /// Start the next step; readers may wait up to `timeout` for data.
    ///
    /// Readers update `catalog` with what the producer declared.
    fn begin_step(&mut self, catalog: &mut VariableCatalog, timeout: Option<Duration>) -> Result<u64>;

    /// Add one variable's data to the current step (writers)
    fn put_block(&mut self, block: VariableBlock) -> Result<()>;

    /// One variable's data in the current step (readers)
    fn get_block(&self, name: &str) -> Result<&VariableBlock>;

    fn end_step(&mut self, catalog: &VariableCatalog) -> Result<()>;

    /// Idempotent; joins every background thread before returning
    fn close(&mut self) -> Result<()>;

    fn stats(&self) -> EngineStats;

    /// Addresses peers can connect to (listening engines only)
    fn endpoints(&self) -> Vec<String> {
        Vec::new()
    }
}

/// What a factory gets to build an engine
pub struct EngineSetup<'a> {
    pub name: &'a str,
    pub engine_type: &'a str,
    pub mode: Mode,
    pub comm: CommHandle,
    pub io_mode: IoMode,
    pub parameters: &'a Params,
    pub transports: &'a [TransportParams],
    /// Writers snapshot it; readers fill it from the producer's handshake
    pub catalog: &'a mut VariableCatalog,
}

/// Constructor of one engine type
pub type EngineFactory = fn(EngineSetup<'_>) -> Result<Box<dyn Engine>>;

/// Engine-type table handed to IO namespaces.
///
/// Type names match case-insensitively.
#[derive(Clone)]
pub struct EngineTypeRegistry {
    factories: BTreeMap<String, EngineFactory>,
}

impl fmt::Debug for EngineTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl Default for EngineTypeRegistry {
    /// File engine as "file"/"bpfile"/"bp", streaming engine as "dataman"/"streaming"
    fn default() -> Self {
        let mut registry = Self::empty();
        for name in ["file", "bpfile", "bp"] {
            registry.register(name, file::create);
        }
        for name in ["dataman", "streaming"] {
            registry.register(name, streaming::create);
        }
        registry
    }
}

impl EngineTypeRegistry {
    /// Table without any engine type
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register (or replace) the factory for `engine_type`
    pub fn register(&mut self, engine_type: &str, factory: EngineFactory) {
        self.factories
            .insert(engine_type.to_ascii_lowercase(), factory);
    }

    pub fn contains(&self, engine_type: &str) -> bool {
        self.factories
            .contains_key(&engine_type.to_ascii_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|k| k.as_str())
    }

    pub fn create(&self, setup: EngineSetup<'_>) -> Result<Box<dyn Engine>> {
        let factory = self
            .factories
            .get(&setup.engine_type.to_ascii_lowercase())
            .ok_or_else(|| AdaptioError::UnsupportedEngine(setup.engine_type.to_string()))?;
        factory(setup)
    }
}

/// Typed access to an open engine together with its IO's catalog
pub struct EngineRef<'a> {
    engine: &'a mut (dyn Engine + 'static),
    catalog: &'a mut VariableCatalog,
}

impl fmt::Debug for EngineRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRef")
            .field("name", &self.engine.name())
            .field("type", &self.engine.engine_type())
            .field("state", &self.engine.state())
            .finish()
    }
}

impl<'a> EngineRef<'a> {
    pub(crate) fn new(engine: &'a mut (dyn Engine + 'static), catalog: &'a mut VariableCatalog) -> Self {
        Self { engine, catalog }
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    pub fn engine_type(&self) -> &str {
        self.engine.engine_type()
    }

    pub fn mode(&self) -> Mode {
        self.engine.mode()
    }

    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn current_step(&self) -> Option<u64> {
        self.engine.current_step()
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.engine.endpoints()
    }

    /// Catalog of the owning IO (readers see the producer's schema here)
    pub fn catalog(&self) -> &VariableCatalog {
        self.catalog
    }

    pub fn inquire_variable<T: DataType>(&self, name: &str) -> Option<VarHandle<T>> {
        self.catalog.inquire_variable(name)
    }

    /// Start a step, waiting at most `timeout` for data when reading
    pub fn begin_step(&mut self, timeout: Option<Duration>) -> Result<u64> {
        self.engine.begin_step(self.catalog, timeout)
    }

    /// Copy `data` into the current step under the variable's metadata
    pub fn put<T: DataType>(&mut self, handle: VarHandle<T>, data: &[T]) -> Result<()> {
        let variable = self
            .catalog
            .variable(handle)
            .ok_or(AdaptioError::StaleHandle("variable"))?;
        let expected = variable.element_count();
        if data.len() != expected {
            return Err(AdaptioError::SizeMismatch {
                name: variable.name().to_string(),
                expected,
                found: data.len(),
            });
        }
        let block = VariableBlock {
            name: variable.name().to_string(),
            type_tag: T::TAG,
            shape: variable.shape().to_vec(),
            start: variable.start().to_vec(),
            count: variable.count().to_vec(),
            bytes: payload::encode_values(data)?,
        };
        self.engine.put_block(block)?;

        let step = self.engine.current_step().unwrap_or(0);
        if let Some(variable) = self.catalog.variable_mut(handle) {
            variable.record_block(step, data);
        }
        Ok(())
    }

    /// Put the data previously attached with [`crate::Variable::attach_data`]
    pub fn put_attached<T: DataType>(&mut self, handle: VarHandle<T>) -> Result<()> {
        let variable = self
            .catalog
            .variable(handle)
            .ok_or(AdaptioError::StaleHandle("variable"))?;
        let data = variable
            .attached_data()
            .ok_or_else(|| {
                AdaptioError::InvalidState(format!("no data attached to '{}'", variable.name()))
            })?
            .to_vec();
        self.put(handle, &data)
    }

    /// Read the variable's block of the current step
    pub fn get<T: DataType>(&mut self, handle: VarHandle<T>) -> Result<Vec<T>> {
        let name = self
            .catalog
            .variable(handle)
            .ok_or(AdaptioError::StaleHandle("variable"))?
            .name()
            .to_string();
        let values: Vec<T> = self.engine.get_block(&name)?.decode()?;

        let step = self.engine.current_step().unwrap_or(0);
        if let Some(variable) = self.catalog.variable_mut(handle) {
            variable.record_block(step, &values);
        }
        Ok(values)
    }

    /// Read into a caller buffer of exactly the block's length
    pub fn get_into<T: DataType>(&mut self, handle: VarHandle<T>, buffer: &mut [T]) -> Result<()> {
        let values = self.get(handle)?;
        if values.len() != buffer.len() {
            let name = self
                .catalog
                .variable(handle)
                .map(|v| v.name().to_string())
                .unwrap_or_default();
            return Err(AdaptioError::SizeMismatch {
                name,
                expected: values.len(),
                found: buffer.len(),
            });
        }
        for (slot, value) in buffer.iter_mut().zip(values) {
            *slot = value;
        }
        Ok(())
    }

    /// Put raw records of a compound variable
    pub fn put_compound(&mut self, handle: VarHandle<Compound>, bytes: &[u8]) -> Result<()> {
        let variable = self
            .catalog
            .compound_variable(handle)
            .ok_or(AdaptioError::StaleHandle("compound variable"))?;
        if bytes.len() != variable.byte_count() {
            return Err(AdaptioError::SizeMismatch {
                name: variable.name().to_string(),
                expected: variable.byte_count(),
                found: bytes.len(),
            });
        }
        let selection = variable.selection();
        let block = VariableBlock {
            name: variable.name().to_string(),
            type_tag: DataTypeTag::Compound,
            shape: selection.shape.clone(),
            start: selection.start.clone(),
            count: selection.count.clone(),
            bytes: bytes.to_vec(),
        };
        self.engine.put_block(block)?;

        let step = self.engine.current_step().unwrap_or(0);
        if let Some(variable) = self.catalog.compound_variable_mut(handle) {
            variable.record_step(step);
        }
        Ok(())
    }

    /// Raw records of a compound variable in the current step
    pub fn get_compound(&mut self, handle: VarHandle<Compound>) -> Result<Vec<u8>> {
        let name = self
            .catalog
            .compound_variable(handle)
            .ok_or(AdaptioError::StaleHandle("compound variable"))?
            .name()
            .to_string();
        let block = self.engine.get_block(&name)?;
        if block.type_tag != DataTypeTag::Compound {
            return Err(AdaptioError::TypeMismatch {
                name,
                expected: DataTypeTag::Compound.to_string(),
                found: block.type_tag.to_string(),
            });
        }
        let bytes = block.bytes.clone();

        let step = self.engine.current_step().unwrap_or(0);
        if let Some(variable) = self.catalog.compound_variable_mut(handle) {
            variable.record_step(step);
        }
        Ok(bytes)
    }

    pub fn end_step(&mut self) -> Result<()> {
        self.engine.end_step(self.catalog)
    }

    pub fn close(&mut self) -> Result<()> {
        self.engine.close()
    }
}

/// Shared lifecycle checks for engine implementations
pub(crate) fn ensure_state(
    name: &str,
    state: EngineState,
    fault: Option<&str>,
    allowed: &[EngineState],
    operation: &str,
) -> Result<()> {
    if state == EngineState::Faulted {
        return Err(AdaptioError::TransportFault(
            fault.unwrap_or("engine is faulted").to_string(),
        ));
    }
    if !allowed.contains(&state) {
        return Err(AdaptioError::InvalidState(format!(
            "{} on engine '{}' in state {}",
            operation, name, state
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_types() {
        let registry = EngineTypeRegistry::default();
        assert!(registry.contains("file"));
        assert!(registry.contains("BPFile"));
        assert!(registry.contains("DataMan"));
        assert!(!registry.contains("sst"));
        assert_eq!(registry.names().count(), 5);
    }

    #[test]
    fn test_ensure_state() {
        assert!(ensure_state("e", EngineState::Opened, None, &[EngineState::Opened], "begin_step").is_ok());
        assert!(matches!(
            ensure_state("e", EngineState::Active, None, &[EngineState::Opened], "begin_step"),
            Err(AdaptioError::InvalidState(_))
        ));
        assert!(matches!(
            ensure_state("e", EngineState::Faulted, Some("lost"), &[EngineState::Opened], "put"),
            Err(AdaptioError::TransportFault(msg)) if msg == "lost"
        ));
    }

    #[test]
    fn test_stats_throughput() {
        let stats = EngineStats {
            bytes: 2 * 1024 * 1024,
            elapsed: Duration::from_secs(2),
            ..EngineStats::default()
        };
        assert!((stats.throughput_mib_s() - 1.0).abs() < 1e-9);
        assert_eq!(EngineStats::default().throughput_mib_s(), 0.0);
    }
}

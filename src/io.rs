//! IO namespaces
//!
//! An [`Io`] groups the variables and attributes an application declares,
//! the engine parameters and transports it configures, and the engines it
//! opens. Definitions go to the namespace's [`VariableCatalog`]; `open`
//! builds an engine of the configured type and keeps it in the namespace's
//! [`EngineRegistry`].
//!
//! # Example
//!
//! ```no_run
//! use adaptio::{Context, Mode};
//!
//! # fn main() -> adaptio::Result<()> {
//! let mut ctx = Context::new(true);
//! let io = ctx.declare_io("sim")?;
//! io.set_engine("dataman");
//! io.set_parameter("address", "tcp://127.0.0.1:12306");
//! let temperature = io.define_variable::<f64>("temperature", &[100], &[0], &[100], true)?;
//!
//! let mut writer = io.open("sim", Mode::Write)?;
//! writer.begin_step(None)?;
//! writer.put(temperature, &[20.0; 100])?;
//! writer.end_step()?;
//! writer.close()?;
//! # Ok(())
//! # }
//! ```

use crate::catalog::{
    AttrHandle, Attribute, Compound, CompoundLayout, DataMap, VarHandle, Variable, VariableCatalog,
};
use crate::comm::{CommHandle, SelfComm};
use crate::engine::{EngineRef, EngineRegistry, EngineSetup, EngineStats, EngineTypeRegistry};
use crate::error::{AdaptioError, Result, ResultExt};
use crate::transport::{TransportKind, TransportParams};
use crate::types::{DataType, DataTypeTag, IoMode, Mode, Params};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Engine type used when none was set
pub const DEFAULT_ENGINE: &str = "file";

/// An operator (e.g. a compressor) attached to the namespace
#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    pub name: String,
    pub parameters: Params,
}

/// One IO namespace
#[derive(Debug)]
pub struct Io {
    name: String,
    engine_type: String,
    io_mode: IoMode,
    parameters: Params,
    transports: Vec<TransportParams>,
    operators: Vec<Operator>,
    in_config_file: bool,
    declared: bool,
    comm: CommHandle,
    engine_types: Arc<EngineTypeRegistry>,
    catalog: VariableCatalog,
    engines: EngineRegistry,
}

impl Io {
    /// Namespace bound to `comm`, creating engines from `engine_types`
    pub fn new(
        name: &str,
        debug_mode: bool,
        comm: CommHandle,
        engine_types: Arc<EngineTypeRegistry>,
    ) -> Self {
        Self {
            name: name.to_string(),
            engine_type: DEFAULT_ENGINE.to_string(),
            io_mode: IoMode::default(),
            parameters: Params::new(),
            transports: Vec::new(),
            operators: Vec::new(),
            in_config_file: false,
            declared: true,
            comm,
            engine_types,
            catalog: VariableCatalog::new(debug_mode),
            engines: EngineRegistry::new(),
        }
    }

    /// Single-process namespace with the default engine types
    pub fn standalone(name: &str, debug_mode: bool) -> Self {
        Self::new(
            name,
            debug_mode,
            SelfComm::handle(),
            Arc::new(EngineTypeRegistry::default()),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn debug_mode(&self) -> bool {
        self.catalog.debug_mode()
    }

    pub fn comm(&self) -> &CommHandle {
        &self.comm
    }

    // ==================== Provenance ====================

    /// True when the namespace was created from a configuration file
    pub fn in_config_file(&self) -> bool {
        self.in_config_file
    }

    pub(crate) fn set_in_config_file(&mut self, value: bool) {
        self.in_config_file = value;
    }

    pub fn set_declared(&mut self) {
        self.declared = true;
    }

    pub(crate) fn set_undeclared(&mut self) {
        self.declared = false;
    }

    pub fn is_declared(&self) -> bool {
        self.declared
    }

    // ==================== Engine configuration ====================

    /// Engine type used by later `open` calls (case-insensitive)
    pub fn set_engine(&mut self, engine_type: &str) {
        self.engine_type = engine_type.to_string();
    }

    pub fn engine_type(&self) -> &str {
        &self.engine_type
    }

    pub fn set_io_mode(&mut self, mode: IoMode) {
        self.io_mode = mode;
    }

    pub fn io_mode(&self) -> IoMode {
        self.io_mode
    }

    pub fn set_parameter(&mut self, key: &str, value: &str) {
        self.parameters.insert(key.to_string(), value.to_string());
    }

    /// Merge `parameters` into the engine parameters
    pub fn set_parameters(&mut self, parameters: &Params) {
        for (key, value) in parameters {
            self.parameters.insert(key.clone(), value.clone());
        }
    }

    pub fn parameters(&self) -> &Params {
        &self.parameters
    }

    pub fn clear_parameters(&mut self) {
        self.parameters.clear();
    }

    /// Add a transport and return its index
    pub fn add_transport(&mut self, transport_type: &str, parameters: Params) -> Result<usize> {
        let kind: TransportKind = transport_type.parse()?;
        self.transports.push(TransportParams { kind, parameters });
        Ok(self.transports.len() - 1)
    }

    pub fn set_transport_parameter(&mut self, index: usize, key: &str, value: &str) -> Result<()> {
        let len = self.transports.len();
        let transport = self
            .transports
            .get_mut(index)
            .ok_or(AdaptioError::OutOfRange { index, len })?;
        transport.parameters.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn transports(&self) -> &[TransportParams] {
        &self.transports
    }

    /// Attach an operator and return its index
    pub fn add_operator(&mut self, name: &str, parameters: Params) -> usize {
        self.operators.push(Operator {
            name: name.to_string(),
            parameters,
        });
        self.operators.len() - 1
    }

    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    // ==================== Catalog ====================

    pub fn catalog(&self) -> &VariableCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut VariableCatalog {
        &mut self.catalog
    }

    pub fn define_variable<T: DataType>(
        &mut self,
        name: &str,
        shape: &[usize],
        start: &[usize],
        count: &[usize],
        constant_dims: bool,
    ) -> Result<VarHandle<T>> {
        self.catalog
            .define_variable(name, shape, start, count, constant_dims)
    }

    /// Define a variable and attach its data in one call
    pub fn define_variable_with_data<T: DataType>(
        &mut self,
        name: &str,
        shape: &[usize],
        start: &[usize],
        count: &[usize],
        constant_dims: bool,
        data: Vec<T>,
    ) -> Result<VarHandle<T>> {
        let handle = self
            .catalog
            .define_variable(name, shape, start, count, constant_dims)?;
        if let Some(variable) = self.catalog.variable_mut(handle) {
            variable.attach_data(data);
        }
        Ok(handle)
    }

    pub fn define_value<T: DataType>(&mut self, name: &str) -> Result<VarHandle<T>> {
        self.catalog.define_value(name)
    }

    pub fn define_compound_variable(
        &mut self,
        name: &str,
        layout: CompoundLayout,
        shape: &[usize],
        start: &[usize],
        count: &[usize],
        constant_dims: bool,
    ) -> Result<VarHandle<Compound>> {
        self.catalog
            .define_compound_variable(name, layout, shape, start, count, constant_dims)
    }

    pub fn define_attribute<T: DataType>(&mut self, name: &str, value: T) -> Result<AttrHandle<T>> {
        self.catalog.define_attribute(name, value)
    }

    pub fn define_attribute_array<T: DataType>(
        &mut self,
        name: &str,
        values: &[T],
    ) -> Result<AttrHandle<T>> {
        self.catalog.define_attribute_array(name, values)
    }

    pub fn remove_variable(&mut self, name: &str) -> bool {
        self.catalog.remove_variable(name)
    }

    pub fn remove_attribute(&mut self, name: &str) -> bool {
        self.catalog.remove_attribute(name)
    }

    pub fn remove_all_variables(&mut self) {
        self.catalog.remove_all_variables();
    }

    pub fn remove_all_attributes(&mut self) {
        self.catalog.remove_all_attributes();
    }

    pub fn inquire_variable<T: DataType>(&self, name: &str) -> Option<VarHandle<T>> {
        self.catalog.inquire_variable(name)
    }

    pub fn inquire_compound_variable(&self, name: &str) -> Option<VarHandle<Compound>> {
        self.catalog.inquire_compound_variable(name)
    }

    pub fn inquire_attribute<T: DataType>(&self, name: &str) -> Option<AttrHandle<T>> {
        self.catalog.inquire_attribute(name)
    }

    pub fn inquire_variable_type(&self, name: &str) -> Option<DataTypeTag> {
        self.catalog.inquire_variable_type(name)
    }

    pub fn variable<T: DataType>(&self, handle: VarHandle<T>) -> Option<&Variable<T>> {
        self.catalog.variable(handle)
    }

    pub fn variable_mut<T: DataType>(&mut self, handle: VarHandle<T>) -> Option<&mut Variable<T>> {
        self.catalog.variable_mut(handle)
    }

    pub fn attribute<T: DataType>(&self, handle: AttrHandle<T>) -> Option<&Attribute<T>> {
        self.catalog.attribute(handle)
    }

    pub fn available_variables(&self) -> BTreeMap<String, Params> {
        self.catalog.available_variables()
    }

    pub fn available_attributes(&self) -> BTreeMap<String, Params> {
        self.catalog.available_attributes()
    }

    pub fn variables_data_map(&self) -> &DataMap {
        self.catalog.variables_data_map()
    }

    pub fn attributes_data_map(&self) -> &DataMap {
        self.catalog.attributes_data_map()
    }

    /// Latch that no more definitions follow (advisory)
    pub fn definition_is_final(&mut self) {
        self.catalog.set_definition_final();
    }

    pub fn is_definition_final(&self) -> bool {
        self.catalog.is_definition_final()
    }

    // ==================== Engines ====================

    /// Open engine `name` on the namespace's group
    pub fn open(&mut self, name: &str, mode: Mode) -> Result<EngineRef<'_>> {
        let comm = Arc::clone(&self.comm);
        self.open_with_group(name, mode, comm)
    }

    /// Open engine `name` on an explicit group
    pub fn open_with_group(&mut self, name: &str, mode: Mode, comm: CommHandle) -> Result<EngineRef<'_>> {
        self.engines.reserve(name, self.catalog.debug_mode())?;
        if !self.engine_types.contains(&self.engine_type) {
            return Err(AdaptioError::UnsupportedEngine(self.engine_type.clone()));
        }

        tracing::debug!(
            "IO '{}' opening {} engine '{}' for {}",
            self.name,
            self.engine_type,
            name,
            mode
        );
        let engine = self
            .engine_types
            .create(EngineSetup {
                name,
                engine_type: &self.engine_type,
                mode,
                comm,
                io_mode: self.io_mode,
                parameters: &self.parameters,
                transports: &self.transports,
                catalog: &mut self.catalog,
            })
            .with_context(|| format!("opening engine '{}' of IO '{}'", name, self.name))?;

        let engine = self.engines.insert(engine);
        Ok(EngineRef::new(engine, &mut self.catalog))
    }

    /// Re-borrow an engine opened earlier
    pub fn engine(&mut self, name: &str) -> Option<EngineRef<'_>> {
        let engine = self.engines.get_mut(name)?;
        Some(EngineRef::new(engine, &mut self.catalog))
    }

    pub fn engine_names(&self) -> impl Iterator<Item = &str> {
        self.engines.names()
    }

    pub fn engine_stats(&self, name: &str) -> Option<EngineStats> {
        self.engines.get(name).map(|e| e.stats())
    }

    /// Close engine `name`; `Ok(false)` when there is none
    pub fn close_engine(&mut self, name: &str) -> Result<bool> {
        self.engines.close(name)
    }

    /// Close (if still open) and forget engine `name`
    pub fn remove_engine(&mut self, name: &str) -> bool {
        self.engines.remove(name).is_some()
    }

    /// Close every open engine of the namespace
    pub fn close_all_engines(&mut self) -> Result<()> {
        self.engines.close_all()
    }
}

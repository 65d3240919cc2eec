//! Top-level factory of IO namespaces
//!
//! A [`Context`] holds what every namespace shares: the debug flag, the
//! default collective group and the engine-type table. Namespaces come from
//! [`Context::declare_io`] or from a configuration file.

use crate::comm::{CommHandle, SelfComm};
use crate::config::ContextConfig;
use crate::engine::{EngineFactory, EngineTypeRegistry};
use crate::error::{AdaptioError, Result, ResultExt};
use crate::io::Io;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug)]
pub struct Context {
    debug_mode: bool,
    comm: CommHandle,
    engine_types: Arc<EngineTypeRegistry>,
    ios: BTreeMap<String, Io>,
}

impl Context {
    /// Single-process context with the default engine types
    pub fn new(debug_mode: bool) -> Self {
        Self::with_group(debug_mode, SelfComm::handle())
    }

    /// Context whose namespaces open engines on `comm`
    pub fn with_group(debug_mode: bool, comm: CommHandle) -> Self {
        Self {
            debug_mode,
            comm,
            engine_types: Arc::new(EngineTypeRegistry::default()),
            ios: BTreeMap::new(),
        }
    }

    /// Build a context and its pre-described namespaces from `config`
    pub fn from_config(config: &ContextConfig, comm: CommHandle) -> Result<Self> {
        let mut context = Self::with_group(config.debug_mode, comm);
        for io_config in &config.io {
            let mut io = context.new_io(&io_config.name);
            if let Some(engine) = &io_config.engine {
                io.set_engine(engine);
            }
            io.set_parameters(&io_config.parameters);
            for transport in &io_config.transports {
                io.add_transport(&transport.kind, transport.parameters.clone())
                    .with_context(|| format!("IO '{}' in configuration", io_config.name))?;
            }
            io.set_in_config_file(true);
            io.set_undeclared();
            tracing::debug!("IO '{}' described by configuration", io_config.name);
            context.ios.insert(io_config.name.clone(), io);
        }
        Ok(context)
    }

    /// Load a TOML configuration file and build the context from it
    pub fn from_config_file(path: impl AsRef<Path>, comm: CommHandle) -> Result<Self> {
        let config = ContextConfig::load(path)?;
        Self::from_config(&config, comm)
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn comm(&self) -> &CommHandle {
        &self.comm
    }

    /// Register an engine type for namespaces declared from now on
    pub fn register_engine_type(&mut self, engine_type: &str, factory: EngineFactory) {
        Arc::make_mut(&mut self.engine_types).register(engine_type, factory);
    }

    pub fn engine_types(&self) -> &EngineTypeRegistry {
        &self.engine_types
    }

    fn new_io(&self, name: &str) -> Io {
        Io::new(
            name,
            self.debug_mode,
            Arc::clone(&self.comm),
            Arc::clone(&self.engine_types),
        )
    }

    /// Create namespace `name`, or claim the one a configuration described.
    ///
    /// With debug checks on, declaring a name twice is a
    /// [`AdaptioError::DuplicateName`]; otherwise the existing namespace is
    /// returned.
    pub fn declare_io(&mut self, name: &str) -> Result<&mut Io> {
        if let Some(existing) = self.ios.get(name) {
            if existing.is_declared() && self.debug_mode {
                return Err(AdaptioError::DuplicateName {
                    kind: "io",
                    name: name.to_string(),
                });
            }
        } else {
            let io = self.new_io(name);
            self.ios.insert(name.to_string(), io);
        }

        let io = self
            .ios
            .get_mut(name)
            .ok_or_else(|| AdaptioError::InvalidState(format!("IO '{}' vanished", name)))?;
        io.set_declared();
        Ok(io)
    }

    pub fn at_io(&mut self, name: &str) -> Option<&mut Io> {
        self.ios.get_mut(name)
    }

    pub fn io(&self, name: &str) -> Option<&Io> {
        self.ios.get(name)
    }

    /// Drop namespace `name`, closing its engines
    pub fn remove_io(&mut self, name: &str) -> bool {
        match self.ios.remove(name) {
            Some(mut io) => {
                if let Err(e) = io.close_all_engines() {
                    tracing::warn!("Closing engines of IO '{}' failed: {}", name, e);
                }
                true
            }
            None => false,
        }
    }

    pub fn remove_all_ios(&mut self) {
        let names: Vec<String> = self.ios.keys().cloned().collect();
        for name in names {
            self.remove_io(&name);
        }
    }

    pub fn io_names(&self) -> impl Iterator<Item = &str> {
        self.ios.keys().map(|k| k.as_str())
    }
}

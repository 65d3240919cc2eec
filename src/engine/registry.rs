//! Engines open in one IO namespace
//!
//! At most one engine per name is open at a time. A closed engine keeps its
//! slot (so its stats stay inspectable) until it is replaced by a new open
//! under the same name or removed.

use super::{Engine, EngineState};
use crate::error::{AdaptioError, Result};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Default)]
pub struct EngineRegistry {
    engines: BTreeMap<String, Box<dyn Engine>>,
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.engines.iter().map(|(name, e)| (name, e.state())))
            .finish()
    }
}

fn is_live(engine: &dyn Engine) -> bool {
    !matches!(engine.state(), EngineState::Closed)
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that `name` may be opened.
    ///
    /// With debug checks on, a live engine under `name` is a
    /// [`AdaptioError::DuplicateEngine`]. Without them the live engine is
    /// closed and its slot freed.
    pub fn reserve(&mut self, name: &str, debug_mode: bool) -> Result<()> {
        let Some(existing) = self.engines.get_mut(name) else {
            return Ok(());
        };
        if is_live(existing.as_ref()) {
            if debug_mode {
                return Err(AdaptioError::DuplicateEngine(name.to_string()));
            }
            tracing::warn!("Reopening engine '{}' while it is still open, closing it first", name);
            if let Err(e) = existing.close() {
                tracing::error!("Closing replaced engine '{}' failed: {}", name, e);
            }
        }
        self.engines.remove(name);
        Ok(())
    }

    /// Store a freshly opened engine and hand it back
    pub fn insert(&mut self, engine: Box<dyn Engine>) -> &mut (dyn Engine + 'static) {
        let name = engine.name().to_string();
        match self.engines.entry(name) {
            Entry::Occupied(mut slot) => {
                slot.insert(engine);
                slot.into_mut().as_mut()
            }
            Entry::Vacant(slot) => slot.insert(engine).as_mut(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&(dyn Engine + 'static)> {
        self.engines.get(name).map(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Engine + 'static)> {
        self.engines.get_mut(name).map(|e| e.as_mut())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }

    /// True when `name` is registered and not closed
    pub fn is_open(&self, name: &str) -> bool {
        self.engines.get(name).is_some_and(|e| is_live(e.as_ref()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Close the engine registered as `name`; `Ok(false)` if there is none
    pub fn close(&mut self, name: &str) -> Result<bool> {
        match self.engines.get_mut(name) {
            Some(engine) => engine.close().map(|_| true),
            None => Ok(false),
        }
    }

    /// Close (if needed) and unregister `name`
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Engine>> {
        let mut engine = self.engines.remove(name)?;
        if is_live(engine.as_ref()) {
            if let Err(e) = engine.close() {
                tracing::error!("Closing removed engine '{}' failed: {}", name, e);
            }
        }
        Some(engine)
    }

    /// Close every live engine, returning the first failure
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for (name, engine) in self.engines.iter_mut() {
            if !is_live(engine.as_ref()) {
                continue;
            }
            if let Err(e) = engine.close() {
                tracing::error!("Closing engine '{}' failed: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for EngineRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            tracing::debug!("Ignoring close error while dropping engines: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::VariableCatalog;
    use crate::engine::{EngineStats, VariableBlock};
    use crate::types::Mode;
    use std::time::Duration;

    #[derive(Debug)]
    struct StubEngine {
        name: String,
        state: EngineState,
        closes: usize,
    }

    impl StubEngine {
        fn boxed(name: &str) -> Box<dyn Engine> {
            Box::new(StubEngine {
                name: name.to_string(),
                state: EngineState::Opened,
                closes: 0,
            })
        }
    }

    impl Engine for StubEngine {
        fn name(&self) -> &str {
            &self.name
        }
        fn engine_type(&self) -> &str {
            "stub"
        }
        fn mode(&self) -> Mode {
            Mode::Write
        }
        fn state(&self) -> EngineState {
            self.state
        }
        fn current_step(&self) -> Option<u64> {
            None
        }
        fn begin_step(&mut self, _: &mut VariableCatalog, _: Option<Duration>) -> Result<u64> {
            Ok(0)
        }
        fn put_block(&mut self, _: VariableBlock) -> Result<()> {
            Ok(())
        }
        fn get_block(&self, name: &str) -> Result<&VariableBlock> {
            Err(AdaptioError::VariableNotInStep(name.to_string()))
        }
        fn end_step(&mut self, _: &VariableCatalog) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            self.closes += 1;
            self.state = EngineState::Closed;
            Ok(())
        }
        fn stats(&self) -> EngineStats {
            EngineStats {
                steps: self.closes as u64,
                ..EngineStats::default()
            }
        }
    }

    #[test]
    fn test_duplicate_open_rejected_in_debug_mode() {
        let mut registry = EngineRegistry::new();
        registry.reserve("sim", true).unwrap();
        registry.insert(StubEngine::boxed("sim"));
        assert!(registry.is_open("sim"));
        assert!(matches!(
            registry.reserve("sim", true),
            Err(AdaptioError::DuplicateEngine(name)) if name == "sim"
        ));
    }

    #[test]
    fn test_reopen_without_debug_closes_previous() {
        let mut registry = EngineRegistry::new();
        registry.insert(StubEngine::boxed("sim"));
        registry.reserve("sim", false).unwrap();
        assert!(!registry.contains("sim"));
    }

    #[test]
    fn test_closed_engine_can_be_reopened() {
        let mut registry = EngineRegistry::new();
        registry.insert(StubEngine::boxed("sim"));
        assert!(registry.close("sim").unwrap());
        assert!(!registry.is_open("sim"));
        assert_eq!(registry.get("sim").unwrap().stats().steps, 1);

        registry.reserve("sim", true).unwrap();
        registry.insert(StubEngine::boxed("sim"));
        assert!(registry.is_open("sim"));
        assert!(!registry.close("other").unwrap());
    }

    #[test]
    fn test_remove_closes_live_engine() {
        let mut registry = EngineRegistry::new();
        registry.insert(StubEngine::boxed("a"));
        registry.insert(StubEngine::boxed("b"));
        let removed = registry.remove("a").unwrap();
        assert_eq!(removed.state(), EngineState::Closed);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["b"]);
        assert!(registry.remove("a").is_none());
        registry.close_all().unwrap();
        assert!(!registry.is_open("b"));
    }
}

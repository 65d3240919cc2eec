//! Test data builders for creating test objects

use adaptio::{Context, Params};

/// Builder for a context with one declared IO namespace
pub struct ContextBuilder {
    io: String,
    debug_mode: bool,
    engine: String,
    parameters: Params,
    transports: Vec<(String, Params)>,
}

impl ContextBuilder {
    pub fn new(io: &str) -> Self {
        Self {
            io: io.to_string(),
            debug_mode: true,
            engine: "file".to_string(),
            parameters: Params::new(),
            transports: Vec::new(),
        }
    }

    pub fn debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    pub fn engine(mut self, engine: &str) -> Self {
        self.engine = engine.to_string();
        self
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn transport(mut self, kind: &str, pairs: &[(&str, &str)]) -> Self {
        let parameters = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.transports.push((kind.to_string(), parameters));
        self
    }

    /// Streaming engine on ephemeral loopback ports
    pub fn streaming(self) -> Self {
        self.engine("dataman")
            .param("address", "tcp://127.0.0.1:0")
            .param("drain_interval_ms", "2000")
            .param("open_timeout_ms", "3000")
    }

    pub fn build(self) -> Context {
        let mut ctx = Context::new(self.debug_mode);
        let io = ctx.declare_io(&self.io).unwrap();
        io.set_engine(&self.engine);
        io.set_parameters(&self.parameters);
        for (kind, parameters) in self.transports {
            io.add_transport(&kind, parameters).unwrap();
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builder() {
        let mut ctx = ContextBuilder::new("sim")
            .streaming()
            .transport("tcp", &[("address", "127.0.0.1:0")])
            .build();

        let io = ctx.at_io("sim").unwrap();
        assert_eq!(io.engine_type(), "dataman");
        assert_eq!(io.parameters()["address"], "tcp://127.0.0.1:0");
        assert_eq!(io.transports().len(), 1);
    }
}

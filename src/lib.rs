//! # Adaptio: adaptable step-based data IO
//!
//! Applications declare typed variables and attributes in named IO
//! namespaces, then open engines that move one step of data at a time to a
//! file or to live readers over TCP. The engine is picked at run time from
//! the namespace configuration, so the same producer code can write to disk
//! or stream to a coupled analysis.
//!
//! ## Architecture
//!
//! - **Catalog**: typed variable/attribute definitions keyed by name, with
//!   stable handles ([`catalog`])
//! - **IO**: a namespace of definitions, parameters and transports that
//!   opens engines ([`io`], [`context`])
//! - **Engines**: the file engine and the streaming pub/sub engine behind
//!   one [`Engine`] trait, looked up by type name ([`engine`])
//! - **Transports**: files and framed TCP channels with bounded queues,
//!   owned by a [`transport::TransportManager`]
//! - **Communication**: crossbeam channels between worker threads and the
//!   engine, and a small collective [`Comm`] for multi-rank groups
//!
//! ## Configuration
//!
//! Namespaces can be described ahead of time in a TOML file
//! (see [`config::ContextConfig`]); `declare_io` then claims them.
//!
//! ## Example
//!
//! ```no_run
//! use adaptio::{Context, Mode};
//!
//! fn main() -> adaptio::Result<()> {
//!     let mut ctx = Context::new(true);
//!     let io = ctx.declare_io("heat")?;
//!     io.set_engine("file");
//!     let t = io.define_variable::<f64>("temperature", &[4], &[0], &[4], true)?;
//!
//!     let mut engine = io.open("heat.bp", Mode::Write)?;
//!     for step in 0..3 {
//!         engine.begin_step(None)?;
//!         engine.put(t, &[step as f64; 4])?;
//!         engine.end_step()?;
//!     }
//!     engine.close()
//! }
//! ```

pub mod address;
pub mod catalog;
pub mod comm;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod io;
pub mod logging;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use address::Address;
pub use catalog::{
    AttrHandle, Attribute, Compound, CompoundLayout, VarHandle, Variable, VariableCatalog,
};
pub use comm::{Comm, CommHandle, SelfComm, ThreadComm};
pub use config::ContextConfig;
pub use context::Context;
pub use engine::streaming::WorkflowMode;
pub use engine::{Engine, EngineRef, EngineState, EngineStats, EngineTypeRegistry};
pub use error::{AdaptioError, Result, ResultExt};
pub use io::Io;
pub use types::{Complex32, Complex64, DataType, DataTypeTag, IoMode, Mode, Params};

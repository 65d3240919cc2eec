//! Error handling for adaptio
//!
//! This module defines the crate error type and a Result alias for use
//! throughout the library.
//!
//! Catalog and definition errors surface synchronously from the defining
//! call. Transport faults raised on a background thread are parked in the
//! owning engine and re-surfaced from the next `begin_step`, `end_step` or
//! `close` call. Lookup misses are never errors: inquiries return `None`.

use thiserror::Error;

/// Main error type for adaptio operations
#[derive(Error, Debug)]
pub enum AdaptioError {
    /// A variable or attribute with this name already exists (debug mode)
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    /// An engine with this name is already open in the IO namespace (debug mode)
    #[error("Engine already open: {0}")]
    DuplicateEngine(String),

    /// Transport type is not one of the supported kinds
    #[error("Unsupported transport type: {0}")]
    UnsupportedTransport(String),

    /// Engine type has no registered factory
    #[error("Unsupported engine type: {0}")]
    UnsupportedEngine(String),

    /// Index handle outside the range of previously returned handles
    #[error("Index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },

    /// Transport address string could not be parsed
    #[error("Malformed address '{address}': {reason}")]
    MalformedAddress { address: String, reason: String },

    /// A bounded wait elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The producer closed the stream and every step was consumed
    #[error("End of stream")]
    EndOfStream,

    /// The current step carries no block for the requested variable
    #[error("Variable not in current step: {0}")]
    VariableNotInStep(String),

    /// Unrecoverable channel failure; the engine is faulted
    #[error("Transport fault: {0}")]
    TransportFault(String),

    /// Shape/start/count do not describe a valid selection
    #[error("Invalid dimensions for '{name}': {reason}")]
    InvalidDimensions { name: String, reason: String },

    /// Element type of a stored entity differs from the requested one
    #[error("Type mismatch for '{name}': expected {expected}, found {found}")]
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// Buffer length differs from the selection's element count
    #[error("Size mismatch for '{name}': expected {expected} elements, found {found}")]
    SizeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    /// A single message exceeds a channel's buffer budget
    #[error("Message of {size} bytes exceeds buffer budget of {capacity} bytes")]
    BufferOverflow { size: usize, capacity: usize },

    /// Operation is not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Handle refers to an entity that was removed
    #[error("Stale handle for {0}")]
    StaleHandle(&'static str),

    /// A parameter value could not be interpreted
    #[error("Invalid parameter {key}={value}")]
    InvalidParameter { key: String, value: String },

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<AdaptioError>,
    },
}

impl AdaptioError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        AdaptioError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context layers and return the underlying error
    pub fn root(&self) -> &AdaptioError {
        match self {
            AdaptioError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for the orderly end-of-stream condition
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.root(), AdaptioError::EndOfStream)
    }

    /// True when a bounded wait elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), AdaptioError::Timeout(_))
    }
}

impl From<bincode::Error> for AdaptioError {
    fn from(err: bincode::Error) -> Self {
        AdaptioError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AdaptioError {
    fn from(err: serde_json::Error) -> Self {
        AdaptioError::Serialization(err.to_string())
    }
}

/// Result type alias for adaptio operations
pub type Result<T> = std::result::Result<T, AdaptioError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| AdaptioError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AdaptioError::from(e).with_context(f()))
    }
}

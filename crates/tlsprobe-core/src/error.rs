//! Error taxonomy shared by every stage of the capture pipeline

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::module::ModuleState;

/// Capture pipeline error type
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Configuration could not be turned into a usable module setup
    #[error("Configuration error in module {module}: {message}")]
    Config { module: String, message: String },

    /// No candidate library exists for the module
    #[error("Library not found for module {module}: searched {searched:?}")]
    NotFound {
        module: String,
        searched: Vec<PathBuf>,
    },

    /// Several non-identical candidate libraries and nothing to choose between them
    #[error("Ambiguous library for module {module}: candidates {candidates:?}, set an explicit library path")]
    Ambiguous {
        module: String,
        candidates: Vec<PathBuf>,
    },

    /// A path was given but is not a usable shared object
    #[error("Not a loadable shared object: {path}: {reason}")]
    InvalidLibrary { path: PathBuf, reason: String },

    /// A required entry point is absent from both symbol tables
    #[error("Symbol {symbol} not found in {path}")]
    SymbolNotFound { path: PathBuf, symbol: String },

    /// The shared object could not be parsed
    #[error("Failed to parse {path}: {message}")]
    Elf { path: PathBuf, message: String },

    /// Instrumentation could not be installed
    #[error("Failed to attach {symbol} at {offset:#x} in {path}: {message}")]
    Attach {
        path: PathBuf,
        symbol: String,
        offset: u64,
        message: String,
    },

    /// Instrumentation could not be removed
    #[error("Failed to detach {symbol} in {path}: {message}")]
    Detach {
        path: PathBuf,
        symbol: String,
        message: String,
    },

    /// Transport displaced unread records (never fatal)
    #[error("Transport for module {module} dropped {dropped} events ({total} total)")]
    TransportLoss {
        module: String,
        dropped: u64,
        total: u64,
    },

    /// Transport closed while the module was still running
    #[error("Transport for module {module} closed unexpectedly")]
    TransportClosed { module: String },

    /// Cancellation observed; expected terminal state
    #[error("Cancelled")]
    Cancelled,

    /// A lifecycle method was called out of order
    #[error("Module {module}: cannot {operation} while {state}")]
    InvalidState {
        module: String,
        operation: &'static str,
        state: ModuleState,
    },

    /// No module registered under that name
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Sink error: {0}")]
    Sink(#[from] crate::sink::SinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type CaptureResult<T> = Result<T, CaptureError>;

impl CaptureError {
    /// Build a configuration error for a module
    pub fn config(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Errors raised while resolving configuration, before any resource is allocated
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::NotFound { .. }
                | Self::Ambiguous { .. }
                | Self::InvalidLibrary { .. }
                | Self::UnknownModule(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error ends the lifecycle of the module that raised it
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TransportLoss { .. } | Self::Cancelled)
    }
}

impl From<ConfigError> for CaptureError {
    fn from(err: ConfigError) -> Self {
        Self::config("session", err.to_string())
    }
}

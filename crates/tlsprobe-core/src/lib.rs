//! tlsprobe core - contracts, transport and session orchestration
//!
//! This crate holds everything that does not depend on a particular
//! instrumentation backend:
//!
//! - **Events**: raw records and the immutable events handed to sinks
//! - **Transport**: bounded drop-oldest relay from probes to a module consumer
//! - **Probe**: targets, process filters and the backend contract
//! - **Module**: the Validate/Init/Run/Close lifecycle
//! - **Orchestrator**: runs a session over the registered modules
//! - **Config**: TOML configuration with environment overrides

pub mod config;
pub mod error;
pub mod events;
pub mod module;
pub mod orchestrator;
pub mod probe;
pub mod registry;
pub mod sink;
pub mod transport;

// Re-export commonly used types
pub use config::{
    ConfigError, ConfigLoader, GlobalConfig, LibrarySettings, ModuleConfig, SessionConfig,
    SessionPolicy,
};
pub use error::{CaptureError, CaptureResult};
pub use events::{Direction, Event, RawRecord};
pub use module::{CaptureModule, ModuleContext, ModuleState, ModuleStats};
pub use orchestrator::{ModuleReport, Orchestrator};
pub use probe::{ArgSpec, Fingerprint, ProbeBackend, ProbeHandle, ProbeLink, ProbeTarget, ProcessFilter};
pub use registry::{ModuleFactory, ModuleRegistry};
pub use sink::{EventSink, MemorySink, SinkError, SinkResult};
pub use transport::{TransportConsumer, TransportProducer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

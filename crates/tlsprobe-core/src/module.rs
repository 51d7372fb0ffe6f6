//! Capture module contract
//!
//! A module owns one crypto library end to end: it locates the library,
//! resolves the hooked entry points, attaches probes and drives its own
//! transport consumer until cancelled.
//!
//! ```text
//! Created --validate--> Validated --init--> Initialized --run--> Running --> Stopped
//!    \________________________\___________________\______________\------> Failed
//! ```

use crate::config::ModuleConfig;
use crate::error::{CaptureError, CaptureResult};
use crate::sink::EventSink;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Created,
    Validated,
    Initialized,
    Running,
    Stopped,
    Failed,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Created => "created",
            ModuleState::Validated => "validated",
            ModuleState::Initialized => "initialized",
            ModuleState::Running => "running",
            ModuleState::Stopped => "stopped",
            ModuleState::Failed => "failed",
        }
    }

    /// Stopped or Failed; no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModuleState::Stopped | ModuleState::Failed)
    }

    /// Fail with [`CaptureError::InvalidState`] unless in `expected`
    pub fn require(
        self,
        expected: ModuleState,
        module: &str,
        operation: &'static str,
    ) -> CaptureResult<()> {
        if self == expected {
            Ok(())
        } else {
            Err(CaptureError::InvalidState {
                module: module.to_string(),
                operation,
                state: self,
            })
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters a module keeps while running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModuleStats {
    /// Events handed to the sink
    pub events: u64,
    /// Payload bytes handed to the sink
    pub bytes: u64,
    /// Events whose payload was cut short
    pub truncated: u64,
    /// Records displaced or lost before reaching the consumer
    pub dropped: u64,
    /// Events the sink refused
    pub sink_errors: u64,
    /// Probes attached at the end of the attach phase
    pub attached: usize,
}

/// What a module receives from the orchestrator at init
#[derive(Clone)]
pub struct ModuleContext {
    /// Session cancellation, shared by every module
    pub cancel: CancellationToken,
    /// Shared, thread-safe event destination
    pub sink: Arc<dyn EventSink>,
}

impl ModuleContext {
    pub fn new(cancel: CancellationToken, sink: Arc<dyn EventSink>) -> Self {
        Self { cancel, sink }
    }
}

/// One crypto-library capture backend
#[async_trait]
pub trait CaptureModule: Send {
    /// Registry name (openssl, gnutls, nspr)
    fn name(&self) -> &str;

    fn state(&self) -> ModuleState;

    /// Resolve the target library from `config`.
    ///
    /// Runs before any kernel-side resource exists, so configuration
    /// problems surface first.
    fn validate(&mut self, config: &ModuleConfig) -> CaptureResult<()>;

    /// Resolve symbols and prepare probe targets without attaching them
    fn init(&mut self, ctx: ModuleContext) -> CaptureResult<()>;

    /// Attach, then consume events until cancelled.
    ///
    /// Returns `Ok(())` on graceful cancellation.
    async fn run(&mut self) -> CaptureResult<()>;

    /// Detach every probe and release the transport.
    ///
    /// Idempotent and valid in every state.
    fn close(&mut self) -> CaptureResult<()>;

    fn stats(&self) -> ModuleStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_state() {
        assert!(ModuleState::Created
            .require(ModuleState::Created, "openssl", "validate")
            .is_ok());

        let err = ModuleState::Running
            .require(ModuleState::Validated, "openssl", "init")
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::InvalidState {
                state: ModuleState::Running,
                ..
            }
        ));
        assert_eq!(err.to_string(), "Module openssl: cannot init while running");
    }

    #[test]
    fn test_terminal_states() {
        assert!(ModuleState::Stopped.is_terminal());
        assert!(ModuleState::Failed.is_terminal());
        assert!(!ModuleState::Running.is_terminal());
        assert!(!ModuleState::Created.is_terminal());
    }
}

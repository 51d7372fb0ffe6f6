//! Sink contract - the external consumer of captured events
//!
//! Sinks own all presentation and persistence. Several module tasks write to
//! the same sink concurrently, so implementations must be `Send + Sync` and
//! do their own synchronization.

use crate::events::Event;
use async_trait::async_trait;
use thiserror::Error;

/// Sink error type
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink closed: {0}")]
    Closed(String),
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Destination for captured events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Sink name, for logs
    fn name(&self) -> &str;

    /// Take ownership of one event
    async fn accept(&self, event: Event) -> SinkResult<()>;

    /// Flush anything buffered
    async fn flush(&self) -> SinkResult<()> {
        Ok(())
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: parking_lot::Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything accepted so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events captured by `module`
    pub fn count_for(&self, module: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.module() == module)
            .count()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn accept(&self, event: Event) -> SinkResult<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

//! Fan-out sink

use async_trait::async_trait;
use std::sync::Arc;
use tlsprobe_core::{Event, EventSink, SinkResult};
use tracing::warn;

/// Hands every event to each inner sink
///
/// A failing sink does not stop delivery to the others; the first error is
/// returned once all of them were tried.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn accept(&self, event: Event) -> SinkResult<()> {
        let mut first_error = None;
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                if let Err(e) = sink.accept(event.clone()).await {
                    warn!("Sink {} failed: {}", sink.name(), e);
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = last.accept(event).await {
                warn!("Sink {} failed: {}", last.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn flush(&self) -> SinkResult<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.flush().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlsprobe_core::{Direction, MemorySink, RawRecord, SinkError};

    struct Broken;

    #[async_trait]
    impl EventSink for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn accept(&self, _event: Event) -> SinkResult<()> {
            Err(SinkError::Closed("gone".to_string()))
        }
    }

    fn event() -> Event {
        Event::from_record(
            "nspr",
            RawRecord {
                timestamp_ns: 1,
                pid: 1,
                tid: 1,
                uid: 0,
                direction: Direction::Read,
                data_len: 2,
                comm: "firefox".to_string(),
                data: b"ok".to_vec(),
            },
            4096,
        )
    }

    #[tokio::test]
    async fn test_every_sink_gets_the_event() {
        let first = Arc::new(MemorySink::new());
        let second = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(first.clone()).with(second.clone());
        assert_eq!(fanout.len(), 2);

        fanout.accept(event()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first.events()[0].id(), second.events()[0].id());
    }

    #[tokio::test]
    async fn test_failure_does_not_starve_others() {
        let memory = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(Arc::new(Broken)).with(memory.clone());

        let err = fanout.accept(event()).await.unwrap_err();
        assert!(matches!(err, SinkError::Closed(_)));
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_fanout_accepts() {
        let fanout = FanoutSink::new();
        assert!(fanout.is_empty());
        fanout.accept(event()).await.unwrap();
        fanout.flush().await.unwrap();
    }
}

//! JSONL file sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tlsprobe_core::{Event, EventSink, SinkResult};
use tracing::info;

/// JSONL sink configuration
#[derive(Debug, Clone)]
pub struct JsonlSinkConfig {
    /// Output file path
    pub path: PathBuf,

    /// Whether to append to existing file
    pub append: bool,

    /// Flush after each write
    pub flush_each: bool,
}

impl JsonlSinkConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append: true,
            flush_each: true,
        }
    }
}

/// One output line: the event plus when the sink saw it
#[derive(Serialize)]
struct Line<'a> {
    captured_at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a Event,
    /// Payload as text when it is valid UTF-8
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<Cow<'a, str>>,
}

/// JSONL file sink
pub struct JsonlSink {
    config: JsonlSinkConfig,
    writer: Mutex<BufWriter<File>>,
    events_written: AtomicU64,
}

impl JsonlSink {
    /// Open (or create) the output file
    pub fn open(config: JsonlSinkConfig) -> SinkResult<Self> {
        let file = if config.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.path)?
        } else {
            File::create(&config.path)?
        };
        info!("JSONL sink writing to: {:?}", config.path);

        Ok(Self {
            config,
            writer: Mutex::new(BufWriter::new(file)),
            events_written: AtomicU64::new(0),
        })
    }

    pub fn events_written(&self) -> u64 {
        self.events_written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn accept(&self, event: Event) -> SinkResult<()> {
        let line = Line {
            captured_at: Utc::now(),
            event: &event,
            text: std::str::from_utf8(event.payload()).ok().map(Cow::Borrowed),
        };
        let json = serde_json::to_string(&line)?;

        // One lock per line keeps concurrent writers from interleaving
        let mut w = self.writer.lock();
        writeln!(w, "{}", json)?;
        if self.config.flush_each {
            w.flush()?;
        }

        self.events_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> SinkResult<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tlsprobe_core::{Direction, RawRecord};

    fn event(module: &str, data: &[u8]) -> Event {
        Event::from_record(
            module,
            RawRecord {
                timestamp_ns: 1,
                pid: 10,
                tid: 11,
                uid: 0,
                direction: Direction::Read,
                data_len: data.len() as u32,
                comm: "wget".to_string(),
                data: data.to_vec(),
            },
            4096,
        )
    }

    #[tokio::test]
    async fn test_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlSink::open(JsonlSinkConfig::new(&path)).unwrap();

        sink.accept(event("gnutls", b"HTTP/1.1 200 OK")).await.unwrap();
        sink.accept(event("gnutls", &[0xff, 0x00, 0x10])).await.unwrap();
        sink.flush().await.unwrap();
        assert_eq!(sink.events_written(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["module"], "gnutls");
        assert_eq!(lines[0]["direction"], "read");
        assert_eq!(lines[0]["pid"], 10);
        assert_eq!(lines[0]["text"], "HTTP/1.1 200 OK");
        assert_eq!(lines[1]["payload"], "ff0010");
        assert!(lines[1].get("text").is_none());
        assert!(lines[0]["captured_at"].is_string());
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_lines_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = Arc::new(JsonlSink::open(JsonlSinkConfig::new(&path)).unwrap());

        let mut tasks = Vec::new();
        for module in ["openssl", "gnutls", "nspr"] {
            let sink = sink.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    sink.accept(event(module, &[b'x'; 512])).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 150);
        for line in content.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["length"], 512);
        }
    }

    #[tokio::test]
    async fn test_truncate_mode_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "stale\n").unwrap();

        let mut config = JsonlSinkConfig::new(&path);
        config.append = false;
        let sink = JsonlSink::open(config).unwrap();
        sink.accept(event("openssl", b"hi")).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("stale"));
        assert_eq!(content.lines().count(), 1);
    }
}

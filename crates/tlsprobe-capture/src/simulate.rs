//! Simulated instrumentation backend
//!
//! Keeps an in-memory attachment table instead of kernel probes, so the whole
//! capture pipeline runs without privileges: tests fire calls directly and the
//! `demo` command drives it with generated TLS traffic.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tlsprobe_core::events::MAX_DATA_LEN;
use tlsprobe_core::{
    CaptureError, CaptureResult, Direction, ProbeBackend, ProbeHandle, ProbeLink, ProbeTarget,
    ProcessFilter, RawRecord, TransportProducer,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type AttachmentKey = (PathBuf, u64, ProcessFilter);

struct Attachment {
    key: AttachmentKey,
    symbol: String,
    direction: Direction,
    events: TransportProducer,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    attachments: HashMap<u64, Attachment>,
    failing: HashSet<String>,
    attach_calls: u64,
}

/// In-memory probe backend
#[derive(Clone)]
pub struct SimulatedBackend {
    table: Arc<Mutex<Table>>,
    started: Instant,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            started: Instant::now(),
        }
    }

    /// Make every future attach of `symbol` fail
    pub fn fail_symbol(&self, symbol: impl Into<String>) {
        self.table.lock().failing.insert(symbol.into());
    }

    /// Live attachments
    pub fn attachment_count(&self) -> usize {
        self.table.lock().attachments.len()
    }

    /// Number of attach calls made, successful or not
    pub fn attach_calls(&self) -> u64 {
        self.table.lock().attach_calls
    }

    pub fn is_attached(&self, symbol: &str) -> bool {
        self.table
            .lock()
            .attachments
            .values()
            .any(|a| a.symbol == symbol)
    }

    /// Distinct (symbol, direction) pairs currently attached
    pub fn attached_symbols(&self) -> Vec<(String, Direction)> {
        let table = self.table.lock();
        let mut symbols: Vec<_> = table
            .attachments
            .values()
            .map(|a| (a.symbol.clone(), a.direction))
            .collect();
        symbols.sort_by(|a, b| a.0.cmp(&b.0));
        symbols.dedup();
        symbols
    }

    /// Simulate one completed call of `symbol` in `pid`/`tid`.
    ///
    /// The payload is capped the way kernel-side capture caps it, while the
    /// reported length stays the full call length. Returns how many
    /// attachments received the record.
    pub fn fire(&self, pid: u32, tid: u32, comm: &str, symbol: &str, payload: &[u8]) -> usize {
        let timestamp_ns = self.started.elapsed().as_nanos() as u64;
        let table = self.table.lock();
        let mut delivered = 0;
        for attachment in table.attachments.values() {
            if attachment.symbol != symbol || !attachment.key.2.matches(pid) {
                continue;
            }
            let captured = payload.len().min(MAX_DATA_LEN);
            attachment.events.push(RawRecord {
                timestamp_ns,
                pid,
                tid,
                uid: 1000,
                direction: attachment.direction,
                data_len: reported_len(payload.len()),
                comm: comm.to_string(),
                data: payload[..captured].to_vec(),
            });
            delivered += 1;
        }
        delivered
    }
}

/// Full payload length as the kernel reports it, saturating at `u32::MAX`
fn reported_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn attach(
        &self,
        filter: ProcessFilter,
        target: &ProbeTarget,
        events: TransportProducer,
    ) -> CaptureResult<ProbeHandle> {
        let mut table = self.table.lock();
        table.attach_calls += 1;

        let attach_error = |message: &str| CaptureError::Attach {
            path: target.library().to_path_buf(),
            symbol: target.symbol.clone(),
            offset: target.offset,
            message: message.to_string(),
        };

        if table.failing.contains(&target.symbol) {
            return Err(attach_error("injected failure"));
        }

        let key = (target.library().to_path_buf(), target.offset, filter);
        if table.attachments.values().any(|a| a.key == key) {
            return Err(attach_error("already attached"));
        }

        let id = table.next_id;
        table.next_id += 1;
        table.attachments.insert(
            id,
            Attachment {
                key,
                symbol: target.symbol.clone(),
                direction: target.direction,
                events,
            },
        );
        debug!("Simulated attach #{} {} for {}", id, target, filter);

        Ok(ProbeHandle::new(
            target.clone(),
            filter,
            Box::new(SimulatedLink {
                id,
                symbol: target.symbol.clone(),
                library: target.library().to_path_buf(),
                table: self.table.clone(),
            }),
        ))
    }
}

struct SimulatedLink {
    id: u64,
    symbol: String,
    library: PathBuf,
    table: Arc<Mutex<Table>>,
}

impl ProbeLink for SimulatedLink {
    fn detach(&mut self) -> CaptureResult<()> {
        match self.table.lock().attachments.remove(&self.id) {
            Some(_) => Ok(()),
            None => Err(CaptureError::Detach {
                path: self.library.clone(),
                symbol: self.symbol.clone(),
                message: format!("attachment #{} is not live", self.id),
            }),
        }
    }
}

/// Generator settings
#[derive(Debug, Clone)]
pub struct TrafficConfig {
    /// Pause between request/response exchanges
    pub interval: Duration,
    /// Exchanges to generate (0 = until cancelled)
    pub exchanges: u64,
    pub pid: u32,
    pub comm: String,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            exchanges: 0,
            pid: 12345,
            comm: "curl".to_string(),
        }
    }
}

/// Drives a [`SimulatedBackend`] with plausible HTTPS exchanges
pub struct TrafficGenerator {
    backend: SimulatedBackend,
    config: TrafficConfig,
}

impl TrafficGenerator {
    pub fn new(backend: SimulatedBackend, config: TrafficConfig) -> Self {
        Self { backend, config }
    }

    /// Fire one exchange on every attached symbol; returns records delivered
    pub fn exchange(&self, seq: u64) -> usize {
        let request = format!(
            "GET /api/items/{} HTTP/1.1\r\n\
             Host: api.example.com\r\n\
             User-Agent: {}/8.5.0\r\n\
             Accept: application/json\r\n\
             \r\n",
            seq, self.config.comm
        );
        let body = format!("{{\"id\":{},\"status\":\"ok\"}}", seq);
        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {}",
            body.len(),
            body
        );

        let pid = self.config.pid;
        let mut delivered = 0;
        for (symbol, direction) in self.backend.attached_symbols() {
            let payload = match direction {
                Direction::Write => request.as_bytes(),
                Direction::Read => response.as_bytes(),
            };
            delivered += self
                .backend
                .fire(pid, pid, &self.config.comm, &symbol, payload);
        }
        delivered
    }

    /// Generate traffic until cancelled or the configured count is reached
    pub async fn run(self, cancel: CancellationToken) -> u64 {
        info!("Starting simulated TLS traffic for pid {}", self.config.pid);
        let mut seq = 0u64;
        loop {
            if self.config.exchanges > 0 && seq >= self.config.exchanges {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {
                    self.exchange(seq);
                    seq += 1;
                }
            }
        }
        info!("Simulated traffic stopped after {} exchanges", seq);
        seq
    }
}

//! Captured plaintext events
//!
//! A [`RawRecord`] is what the instrumentation point hands to the transport.
//! The module consumer turns each record into an immutable [`Event`] that is
//! handed over to the sink.

use serde::{Deserialize, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;

/// Maximum payload bytes captured per intercepted call
pub const MAX_DATA_LEN: usize = 4096;

/// Command name length (matches TASK_COMM_LEN in kernel)
pub const COMM_LEN: usize = 16;

/// Direction of the intercepted call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Plaintext returned to the application after decryption
    Read,
    /// Plaintext handed to the library before encryption
    Write,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record relayed from an instrumentation point
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Monotonic timestamp in nanoseconds
    pub timestamp_ns: u64,
    /// Process ID (tgid)
    pub pid: u32,
    /// Thread ID
    pub tid: u32,
    /// User ID
    pub uid: u32,
    pub direction: Direction,
    /// Length reported by the intercepted call (may exceed `data.len()`)
    pub data_len: u32,
    /// Process command name
    pub comm: String,
    /// Captured bytes
    pub data: Vec<u8>,
}

/// A captured plaintext buffer
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    id: String,
    module: String,
    pid: u32,
    tid: u32,
    uid: u32,
    comm: String,
    timestamp_ns: u64,
    direction: Direction,
    length: u32,
    truncated: bool,
    #[serde(serialize_with = "serialize_hex")]
    payload: Vec<u8>,
}

impl Event {
    /// Build an event from a raw record, bounding the payload to `max_payload` bytes.
    ///
    /// Truncation is recorded on the event whenever the call moved more bytes
    /// than the payload keeps.
    pub fn from_record(module: &str, record: RawRecord, max_payload: usize) -> Self {
        let RawRecord {
            timestamp_ns,
            pid,
            tid,
            uid,
            direction,
            data_len,
            comm,
            mut data,
        } = record;

        let reported = data_len as usize;
        data.truncate(reported);
        let cap = max_payload.min(MAX_DATA_LEN);
        if data.len() > cap {
            data.truncate(cap);
        }
        let truncated = reported > data.len();

        Self {
            id: ulid::Ulid::new().to_string(),
            module: module.to_string(),
            pid,
            tid,
            uid,
            comm,
            timestamp_ns,
            direction,
            length: data_len,
            truncated,
            payload: data,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tag of the module (crypto library) that captured the event
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn comm(&self) -> &str {
        &self.comm
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Length reported by the intercepted call, before truncation
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload decoded as UTF-8, lossy
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

//! Probe contract - where instrumentation goes and how it is installed

use crate::error::CaptureResult;
use crate::events::Direction;
use crate::transport::TransportProducer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

/// Identity of the exact on-disk file an offset was resolved from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Canonical path
    pub path: PathBuf,
    /// Hex SHA-256 of the file content
    pub digest: String,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = &self.digest[..self.digest.len().min(12)];
        write!(f, "{}@{}", self.path.display(), short)
    }
}

/// Which function arguments hold the buffer pointer and its length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArgSpec {
    /// Zero-based index of the buffer pointer argument
    pub buffer_arg: u8,
    /// Zero-based index of the length argument
    pub length_arg: u8,
}

impl ArgSpec {
    pub const fn new(buffer_arg: u8, length_arg: u8) -> Self {
        Self {
            buffer_arg,
            length_arg,
        }
    }
}

/// A resolved instrumentation point
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeTarget {
    /// File the offset belongs to; the offset is meaningless for any other content
    pub fingerprint: Fingerprint,
    pub symbol: String,
    /// Symbol version the offset was taken from, if versioned
    pub version: Option<String>,
    /// File-relative offset of the function entry
    pub offset: u64,
    pub direction: Direction,
    pub args: ArgSpec,
}

impl ProbeTarget {
    pub fn library(&self) -> &std::path::Path {
        &self.fingerprint.path
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}+{:#x} ({}, {})",
            self.symbol,
            self.offset,
            self.direction,
            self.fingerprint.path.display()
        )
    }
}

/// Process scope of an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessFilter {
    /// Every process mapping the library, now or later
    #[default]
    All,
    /// One specific process
    Pid(u32),
}

impl ProcessFilter {
    /// `0` means all processes
    pub fn from_pid(pid: u32) -> Self {
        if pid == 0 {
            ProcessFilter::All
        } else {
            ProcessFilter::Pid(pid)
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessFilter::All => None,
            ProcessFilter::Pid(pid) => Some(*pid),
        }
    }

    pub fn matches(&self, pid: u32) -> bool {
        match self {
            ProcessFilter::All => true,
            ProcessFilter::Pid(target) => *target == pid,
        }
    }
}

impl fmt::Display for ProcessFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessFilter::All => f.write_str("all processes"),
            ProcessFilter::Pid(pid) => write!(f, "pid {}", pid),
        }
    }
}

/// Backend-specific attachment that can be removed
pub trait ProbeLink: Send {
    fn detach(&mut self) -> CaptureResult<()>;
}

/// Installs instrumentation at resolved offsets
pub trait ProbeBackend: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &str;

    /// Install entry and return instrumentation for `target` in processes matching `filter`.
    ///
    /// Captured records are pushed into `events`. Each successful call yields an
    /// independent handle; detaching it leaves every other attachment untouched.
    fn attach(
        &self,
        filter: ProcessFilter,
        target: &ProbeTarget,
        events: TransportProducer,
    ) -> CaptureResult<ProbeHandle>;
}

/// One live attachment
pub struct ProbeHandle {
    target: ProbeTarget,
    filter: ProcessFilter,
    link: Option<Box<dyn ProbeLink>>,
}

impl ProbeHandle {
    pub fn new(target: ProbeTarget, filter: ProcessFilter, link: Box<dyn ProbeLink>) -> Self {
        Self {
            target,
            filter,
            link: Some(link),
        }
    }

    pub fn target(&self) -> &ProbeTarget {
        &self.target
    }

    pub fn filter(&self) -> ProcessFilter {
        self.filter
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    /// Remove the instrumentation. Calling it again is a no-op.
    pub fn detach(&mut self) -> CaptureResult<()> {
        match self.link.take() {
            Some(mut link) => link.detach(),
            None => Ok(()),
        }
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.detach() {
                warn!("Failed to detach {} on drop: {}", self.target, e);
            }
        }
    }
}

impl fmt::Debug for ProbeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeHandle")
            .field("target", &self.target)
            .field("filter", &self.filter)
            .field("attached", &self.is_attached())
            .finish()
    }
}

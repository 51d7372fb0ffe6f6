//! Shared types for the uprobe backend
//!
//! These types mirror the kernel-side eBPF structures and must be kept in sync.

use tlsprobe_core::events::{COMM_LEN, MAX_DATA_LEN};
use tlsprobe_core::{ArgSpec, Direction, RawRecord};

/// Upper bound on concurrently attached probe targets
pub const MAX_PROBES: u32 = 256;

pub const DIRECTION_READ: u8 = 1;
pub const DIRECTION_WRITE: u8 = 2;

/// Kernel program and map names
pub const ENTRY_PROGRAM: &str = "tls_entry";
pub const RETURN_PROGRAM: &str = "tls_return";
pub const EVENTS_MAP: &str = "EVENTS";
pub const LOST_EVENTS_MAP: &str = "LOST_EVENTS";
pub const ARG_LAYOUT_MAP: &str = "ARG_LAYOUT";

pub fn direction_code(direction: Direction) -> u8 {
    match direction {
        Direction::Read => DIRECTION_READ,
        Direction::Write => DIRECTION_WRITE,
    }
}

/// Argument positions and direction for one probe id
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgLayout {
    pub buffer_arg: u8,
    pub length_arg: u8,
    pub direction: u8,
    _pad: [u8; 5],
}

impl ArgLayout {
    pub fn new(args: ArgSpec, direction: Direction) -> Self {
        Self {
            buffer_arg: args.buffer_arg,
            length_arg: args.length_arg,
            direction: direction_code(direction),
            _pad: [0; 5],
        }
    }
}

#[cfg(target_os = "linux")]
unsafe impl aya::Pod for ArgLayout {}

/// Record sent from kernel to userspace via ring buffer
///
/// This struct must match the eBPF-side structure exactly:
/// - `#[repr(C)]` for consistent memory layout
/// - Fixed size (no dynamic allocation)
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProbeRecord {
    /// Timestamp in nanoseconds (from bpf_ktime_get_ns)
    pub timestamp_ns: u64,
    /// Attach cookie identifying the probe target
    pub probe_id: u64,
    /// Process ID (tgid)
    pub pid: u32,
    /// Thread ID (pid in kernel terms)
    pub tid: u32,
    pub uid: u32,
    pub direction: u8,
    _pad: [u8; 3],
    /// Length returned by the intercepted call (may be > captured_len)
    pub data_len: u32,
    /// Bytes copied into `data` (up to MAX_DATA_LEN)
    pub captured_len: u32,
    /// Process command name (null-terminated)
    pub comm: [u8; COMM_LEN],
    pub data: [u8; MAX_DATA_LEN],
}

impl ProbeRecord {
    pub const fn zeroed() -> Self {
        Self {
            timestamp_ns: 0,
            probe_id: 0,
            pid: 0,
            tid: 0,
            uid: 0,
            direction: 0,
            _pad: [0; 3],
            data_len: 0,
            captured_len: 0,
            comm: [0u8; COMM_LEN],
            data: [0u8; MAX_DATA_LEN],
        }
    }

    /// Read a record out of a ring buffer item
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < std::mem::size_of::<Self>() {
            return None;
        }
        // Ring buffer items are only byte aligned
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }

    pub fn comm_str(&self) -> String {
        let end = self.comm.iter().position(|&c| c == 0).unwrap_or(COMM_LEN);
        String::from_utf8_lossy(&self.comm[..end]).to_string()
    }

    pub fn captured_data(&self) -> &[u8] {
        let len = (self.captured_len as usize).min(MAX_DATA_LEN);
        &self.data[..len]
    }

    pub fn direction(&self) -> Option<Direction> {
        match self.direction {
            DIRECTION_READ => Some(Direction::Read),
            DIRECTION_WRITE => Some(Direction::Write),
            _ => None,
        }
    }

    pub fn to_raw(&self) -> Option<RawRecord> {
        Some(RawRecord {
            timestamp_ns: self.timestamp_ns,
            pid: self.pid,
            tid: self.tid,
            uid: self.uid,
            direction: self.direction()?,
            data_len: self.data_len,
            comm: self.comm_str(),
            data: self.captured_data().to_vec(),
        })
    }
}

impl std::fmt::Debug for ProbeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRecord")
            .field("probe_id", &self.probe_id)
            .field("pid", &self.pid)
            .field("tid", &self.tid)
            .field("direction", &self.direction)
            .field("data_len", &self.data_len)
            .field("captured_len", &self.captured_len)
            .field("comm", &self.comm_str())
            .finish()
    }
}

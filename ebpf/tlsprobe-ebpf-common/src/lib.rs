#![no_std]

/// Maximum payload bytes copied per intercepted call (4KB to stay within eBPF limits)
pub const MAX_DATA_LEN: usize = 4096;

/// Command name length
pub const COMM_LEN: usize = 16;

/// Upper bound on concurrently attached probe targets
///
/// Probe ids are indices into `LOST_EVENTS`, so they must stay below this.
pub const MAX_PROBES: u32 = 256;

/// Direction values carried in [`ProbeRecord::direction`]
pub const DIRECTION_READ: u8 = 1;
pub const DIRECTION_WRITE: u8 = 2;

/// Buffer and length argument positions for one probe id
///
/// Userspace writes one entry per attachment into `ARG_LAYOUT` before the
/// probe goes live; the entry program looks it up by the attach cookie.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgLayout {
    pub buffer_arg: u8,
    pub length_arg: u8,
    pub direction: u8,
    _pad: [u8; 5],
}

impl ArgLayout {
    pub const fn new(buffer_arg: u8, length_arg: u8, direction: u8) -> Self {
        Self {
            buffer_arg,
            length_arg,
            direction,
            _pad: [0; 5],
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ArgLayout {}

/// Record sent from kernel to userspace via ring buffer
///
/// This struct is shared between eBPF (kernel) and userspace code.
/// It must be:
/// - `#[repr(C)]` for consistent memory layout
/// - `Copy` for eBPF map operations
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
    /// [`DIRECTION_READ`] or [`DIRECTION_WRITE`]
    pub direction: u8,
    _pad: [u8; 3],
    /// Length returned by the intercepted call (may be > captured_len)
    pub data_len: u32,
    /// Bytes actually copied into `data` (up to MAX_DATA_LEN)
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
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ProbeRecord {}

/// Entry arguments kept until the matching return probe fires
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PendingCall {
    pub probe_id: u64,
    /// Buffer pointer
    pub buf: u64,
    /// Requested length
    pub len: u64,
}

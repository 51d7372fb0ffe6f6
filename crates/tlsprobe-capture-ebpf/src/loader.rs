//! eBPF program loader and host capability checks

use serde::Serialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tlsprobe_core::{CaptureError, CaptureResult};
use tracing::{debug, warn};

/// Ring buffers need 5.8, uprobe attach cookies need 5.15
pub const MIN_KERNEL: (u32, u32) = (5, 15);

const CAP_SYS_ADMIN: u32 = 21;
const CAP_PERFMON: u32 = 38;
const CAP_BPF: u32 = 39;

#[cfg(embedded_probe_object)]
static EMBEDDED_OBJECT: &[u8] = include_bytes!(env!("TLSPROBE_EBPF_OBJECT_PATH"));

#[cfg(not(embedded_probe_object))]
static EMBEDDED_OBJECT: &[u8] = &[];

/// Whether this build carries the kernel object
pub fn has_embedded_object() -> bool {
    !EMBEDDED_OBJECT.is_empty()
}

/// Bytes of the kernel object: `path` if given, else the embedded copy
pub fn object_bytes(path: Option<&Path>) -> CaptureResult<Cow<'static, [u8]>> {
    match path {
        Some(path) => {
            let bytes = std::fs::read(path).map_err(|e| {
                CaptureError::config(
                    "ebpf",
                    format!("Failed to read eBPF object '{}': {}", path.display(), e),
                )
            })?;
            debug!("Read eBPF object {} ({} bytes)", path.display(), bytes.len());
            Ok(Cow::Owned(bytes))
        }
        None if has_embedded_object() => Ok(Cow::Borrowed(EMBEDDED_OBJECT)),
        None => Err(CaptureError::config(
            "ebpf",
            "no eBPF object embedded in this build; pass --ebpf-object or set TLSPROBE_EBPF_OBJECT",
        )),
    }
}

/// Check if eBPF is available on this system
pub fn check_ebpf_available() -> bool {
    // Check for /sys/fs/bpf
    if !Path::new("/sys/fs/bpf").exists() {
        warn!("BPF filesystem not mounted at /sys/fs/bpf");
        return false;
    }

    if !uprobes_supported() {
        warn!("Kernel has no uprobe event source");
        return false;
    }

    true
}

/// Whether the kernel exposes the uprobe PMU
pub fn uprobes_supported() -> bool {
    Path::new("/sys/bus/event_source/devices/uprobe").exists()
}

/// Check kernel version for eBPF feature support
pub fn kernel_version() -> Option<(u32, u32, u32)> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
    parse_kernel_release(&release)
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32, u32)> {
    let parts: Vec<&str> = release.trim().split('.').collect();

    if parts.len() >= 2 {
        let major = parts[0].parse().ok()?;
        let minor = parts[1].split('-').next()?.parse().ok()?;
        let patch = parts
            .get(2)
            .and_then(|p| p.split(|c: char| !c.is_ascii_digit()).next())
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        Some((major, minor, patch))
    } else {
        None
    }
}

/// Check if running as root
pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Effective capability mask of this process
fn effective_caps() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_cap_eff(&status)
}

fn parse_cap_eff(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|mask| u64::from_str_radix(mask.trim(), 16).ok())
}

/// CAP_BPF plus CAP_PERFMON, or CAP_SYS_ADMIN on kernels that predate them
pub fn has_cap_bpf() -> bool {
    match effective_caps() {
        Some(mask) => {
            let has = |cap: u32| mask & (1u64 << cap) != 0;
            has(CAP_SYS_ADMIN) || (has(CAP_BPF) && has(CAP_PERFMON))
        }
        None => is_root(),
    }
}

/// Bump memlock rlimit for eBPF (required on older kernels)
pub fn bump_memlock_rlimit() -> bool {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to remove limit on locked memory (ret={})", ret);
        false
    } else {
        true
    }
}

/// What this host offers for uprobe capture
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityReport {
    pub kernel: Option<String>,
    pub kernel_supported: bool,
    pub bpf_fs: bool,
    pub btf: bool,
    pub uprobes: bool,
    pub root: bool,
    pub cap_bpf: bool,
    pub embedded_object: bool,
    pub object_override: Option<PathBuf>,
}

impl CapabilityReport {
    pub fn collect(object_override: Option<&Path>) -> Self {
        let kernel = kernel_version();
        Self {
            kernel: kernel.map(|(a, b, c)| format!("{}.{}.{}", a, b, c)),
            kernel_supported: kernel.is_some_and(|(a, b, _)| (a, b) >= MIN_KERNEL),
            bpf_fs: Path::new("/sys/fs/bpf").exists(),
            btf: Path::new("/sys/kernel/btf/vmlinux").exists(),
            uprobes: uprobes_supported(),
            root: is_root(),
            cap_bpf: has_cap_bpf(),
            embedded_object: has_embedded_object(),
            object_override: object_override.map(Path::to_path_buf),
        }
    }

    /// Everything needed to attach is in place
    pub fn ready(&self) -> bool {
        self.kernel_supported
            && self.bpf_fs
            && self.uprobes
            && self.cap_bpf
            && (self.embedded_object || self.object_override.is_some())
    }
}

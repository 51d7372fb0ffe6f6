//! Linux uprobe backend for tlsprobe
//!
//! Attaches the entry/return programs of `ebpf/tlsprobe-ebpf` at resolved
//! file offsets and relays the records from the kernel ring buffer into the
//! transport of the owning module.

pub mod types;

#[cfg(target_os = "linux")]
pub mod loader;

#[cfg(target_os = "linux")]
pub mod proc_maps;

#[cfg(target_os = "linux")]
mod uprobe;

#[cfg(target_os = "linux")]
pub use loader::CapabilityReport;

#[cfg(target_os = "linux")]
pub use uprobe::UprobeBackend;

// Stub for non-Linux platforms
#[cfg(not(target_os = "linux"))]
mod stub {
    use std::path::PathBuf;
    use tlsprobe_core::transport::TransportProducer;
    use tlsprobe_core::{CaptureError, CaptureResult, ProbeBackend, ProbeHandle, ProbeTarget, ProcessFilter};

    pub struct UprobeBackend;

    impl UprobeBackend {
        pub fn new(_object: Option<PathBuf>) -> Self {
            Self
        }

        pub fn attachment_count(&self) -> usize {
            0
        }
    }

    impl ProbeBackend for UprobeBackend {
        fn name(&self) -> &str {
            "uprobe"
        }

        fn attach(
            &self,
            _filter: ProcessFilter,
            target: &ProbeTarget,
            _events: TransportProducer,
        ) -> CaptureResult<ProbeHandle> {
            Err(CaptureError::Attach {
                path: target.library().to_path_buf(),
                symbol: target.symbol.clone(),
                offset: target.offset,
                message: "uprobes are only available on Linux".to_string(),
            })
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::UprobeBackend;

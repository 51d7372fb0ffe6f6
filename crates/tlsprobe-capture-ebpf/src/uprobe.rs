//! Uprobe backend on aya
//!
//! One kernel object serves every attachment. Each attachment gets a probe id
//! that travels as the attach cookie; the kernel stamps it on every record so
//! the relay can route records to the transport of the module that owns them.

use crate::loader::{bump_memlock_rlimit, object_bytes};
use crate::proc_maps;
use crate::types::{
    ArgLayout, ProbeRecord, ARG_LAYOUT_MAP, ENTRY_PROGRAM, EVENTS_MAP, LOST_EVENTS_MAP,
    MAX_PROBES, RETURN_PROGRAM,
};
use aya::maps::{HashMap as AyaHashMap, MapData, PerCpuArray, RingBuf};
use aya::programs::uprobe::{
    UProbeAttachLocation, UProbeAttachPoint, UProbeLinkId, UProbeScope,
};
use aya::programs::UProbe;
use aya::Ebpf;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tlsprobe_core::transport::TransportProducer;
use tlsprobe_core::{
    CaptureError, CaptureResult, ProbeBackend, ProbeHandle, ProbeLink, ProbeTarget,
    ProcessFilter,
};
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// How often kernel-side loss counters are folded into the transports
const LOSS_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct Route {
    producer: TransportProducer,
    /// Kernel loss count already reported; `None` until the first poll
    lost_seen: Option<u64>,
}

type Routes = Arc<Mutex<HashMap<u64, Route>>>;
type SharedRing = Arc<Mutex<RingBuf<MapData>>>;
type LossCounters = Arc<PerCpuArray<MapData, u64>>;

/// Kernel object with its relay, alive while at least one probe is attached
struct Loaded {
    ebpf: Ebpf,
    layouts: AyaHashMap<MapData, u64, ArgLayout>,
    ring: SharedRing,
    lost: Option<LossCounters>,
    routes: Routes,
    free_ids: Vec<u64>,
    next_id: u64,
    relay: CancellationToken,
}

impl Loaded {
    fn allocate_id(&mut self) -> Option<u64> {
        if let Some(id) = self.free_ids.pop() {
            return Some(id);
        }
        if self.next_id >= MAX_PROBES as u64 {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        Some(id)
    }

    fn release(&mut self, probe_id: u64) {
        if let Err(e) = self.layouts.remove(&probe_id) {
            debug!("Failed to remove argument layout of probe {}: {}", probe_id, e);
        }
        let lost = self.lost.as_ref().and_then(|lost| loss_total(lost, probe_id));
        retire_route(&mut *self.ring.lock(), &self.routes, probe_id, lost);
        self.free_ids.push(probe_id);
    }

    fn attach_program(
        &mut self,
        name: &str,
        offset: u64,
        library: &Path,
        pid: Option<libc::pid_t>,
        probe_id: u64,
    ) -> Result<UProbeLinkId, String> {
        let point = UProbeAttachPoint {
            location: UProbeAttachLocation::AbsoluteOffset(offset),
            cookie: Some(probe_id),
        };
        let scope = match pid {
            None => UProbeScope::AllProcesses,
            Some(pid) => match NonZeroU32::new(pid as u32) {
                Some(pid) => UProbeScope::OneProcess(pid),
                None => UProbeScope::CallingProcess,
            },
        };
        self.program(name)?
            .attach(point, library, scope)
            .map_err(|e| format!("Failed to attach {}: {}", name, e))
    }

    fn program(&mut self, name: &str) -> Result<&mut UProbe, String> {
        let program = self
            .ebpf
            .program_mut(name)
            .ok_or_else(|| format!("{} program not found", name))?;
        program
            .try_into()
            .map_err(|e| format!("{} is not a uprobe program: {}", name, e))
    }
}

/// Linux uprobe/uretprobe backend
pub struct UprobeBackend {
    object: Option<PathBuf>,
    state: Arc<Mutex<Option<Loaded>>>,
}

impl UprobeBackend {
    /// `object` overrides the kernel object embedded at build time
    pub fn new(object: Option<PathBuf>) -> Self {
        Self {
            object,
            state: Arc::new(Mutex::new(None)),
        }
    }

    /// Number of live attachments
    pub fn attachment_count(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map(|loaded| loaded.routes.lock().len())
            .unwrap_or(0)
    }

    fn load(&self) -> Result<Loaded, String> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| "uprobe relay needs a tokio runtime".to_string())?;

        bump_memlock_rlimit();
        let bytes = object_bytes(self.object.as_deref()).map_err(|e| e.to_string())?;
        info!("Loading eBPF object ({} bytes)...", bytes.len());
        let mut ebpf = Ebpf::load(&bytes).map_err(|e| format!("Failed to load eBPF object: {}", e))?;

        for name in [ENTRY_PROGRAM, RETURN_PROGRAM] {
            let program: &mut UProbe = ebpf
                .program_mut(name)
                .ok_or_else(|| format!("{} program not found", name))?
                .try_into()
                .map_err(|e| format!("{} is not a uprobe program: {}", name, e))?;
            program
                .load()
                .map_err(|e| format!("Failed to load {}: {}", name, e))?;
        }

        let layouts = ebpf
            .take_map(ARG_LAYOUT_MAP)
            .ok_or_else(|| format!("{} map not found", ARG_LAYOUT_MAP))?;
        let layouts = AyaHashMap::try_from(layouts)
            .map_err(|e| format!("Failed to get {} map: {}", ARG_LAYOUT_MAP, e))?;

        let ring = ebpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| format!("{} map not found", EVENTS_MAP))?;
        let ring = RingBuf::try_from(ring)
            .map_err(|e| format!("Failed to create ring buffer: {}", e))?;

        // Older objects without loss accounting still work
        let lost = match ebpf.take_map(LOST_EVENTS_MAP) {
            Some(map) => match PerCpuArray::try_from(map) {
                Ok(lost) => Some(Arc::new(lost)),
                Err(e) => {
                    warn!("Failed to get {} map: {}", LOST_EVENTS_MAP, e);
                    None
                }
            },
            None => {
                debug!("{} map not found - kernel loss accounting disabled", LOST_EVENTS_MAP);
                None
            }
        };

        // Readiness is watched on a duplicate so detach can drain the ring itself
        let ring_fd = ring
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| format!("Failed to duplicate ring buffer fd: {}", e))?;
        let readiness = {
            let _guard = runtime.enter();
            AsyncFd::new(ring_fd).map_err(|e| format!("Failed to poll ring buffer: {}", e))?
        };
        let ring: SharedRing = Arc::new(Mutex::new(ring));

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let relay = CancellationToken::new();
        runtime.spawn(relay_records(
            readiness,
            ring.clone(),
            lost.clone(),
            routes.clone(),
            relay.clone(),
        ));
        info!("eBPF object loaded, relay started");

        Ok(Loaded {
            ebpf,
            layouts,
            ring,
            lost,
            routes,
            free_ids: Vec::new(),
            next_id: 0,
            relay,
        })
    }
}

impl ProbeBackend for UprobeBackend {
    fn name(&self) -> &str {
        "uprobe"
    }

    fn attach(
        &self,
        filter: ProcessFilter,
        target: &ProbeTarget,
        events: TransportProducer,
    ) -> CaptureResult<ProbeHandle> {
        let attach_error = |message: String| CaptureError::Attach {
            path: target.library().to_path_buf(),
            symbol: target.symbol.clone(),
            offset: target.offset,
            message,
        };

        // The offset is only meaningful if this exact file is mapped in the target process
        if let Some(pid) = filter.pid() {
            let maps = proc_maps::read_maps(pid)
                .map_err(|e| attach_error(format!("cannot read maps of pid {}: {}", pid, e)))?;
            let address = proc_maps::runtime_address(&maps, target.library(), target.offset)
                .ok_or_else(|| {
                    attach_error(format!(
                        "{} is not mapped executable in pid {}",
                        target.library().display(),
                        pid
                    ))
                })?;
            info!(
                "{} resolves to {:#x} in pid {} ({})",
                target.symbol,
                address,
                pid,
                proc_maps::process_comm(pid).unwrap_or_default()
            );
        }

        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(self.load().map_err(attach_error)?);
        }
        let Some(loaded) = state.as_mut() else {
            return Err(attach_error("eBPF object not loaded".to_string()));
        };

        let probe_id = loaded
            .allocate_id()
            .ok_or_else(|| attach_error(format!("more than {} live probes", MAX_PROBES)))?;
        let layout = ArgLayout::new(target.args, target.direction);
        if let Err(e) = loaded.layouts.insert(probe_id, layout, 0) {
            loaded.release(probe_id);
            return Err(attach_error(format!("Failed to store argument layout: {}", e)));
        }
        // Counter slots are reused; only increases from here on are this probe's loss
        let lost_seen = loaded
            .lost
            .as_ref()
            .and_then(|lost| loss_total(lost, probe_id));
        loaded.routes.lock().insert(
            probe_id,
            Route {
                producer: events,
                lost_seen,
            },
        );

        let pid = filter.pid().map(|pid| pid as libc::pid_t);
        let library = target.library().to_path_buf();

        let entry = match loaded.attach_program(ENTRY_PROGRAM, target.offset, &library, pid, probe_id) {
            Ok(link) => link,
            Err(message) => {
                loaded.release(probe_id);
                return Err(attach_error(message));
            }
        };
        let ret = match loaded.attach_program(RETURN_PROGRAM, target.offset, &library, pid, probe_id) {
            Ok(link) => link,
            Err(message) => {
                if let Ok(program) = loaded.program(ENTRY_PROGRAM) {
                    let _ = program.detach(entry);
                }
                loaded.release(probe_id);
                return Err(attach_error(message));
            }
        };
        debug!("Attached probe {} to {} ({})", probe_id, target, filter);

        let link = UprobeLink {
            state: self.state.clone(),
            probe_id,
            links: Some((entry, ret)),
            library,
            symbol: target.symbol.clone(),
        };
        Ok(ProbeHandle::new(target.clone(), filter, Box::new(link)))
    }
}

/// Entry and return attachment of one target
struct UprobeLink {
    state: Arc<Mutex<Option<Loaded>>>,
    probe_id: u64,
    links: Option<(UProbeLinkId, UProbeLinkId)>,
    library: PathBuf,
    symbol: String,
}

impl ProbeLink for UprobeLink {
    fn detach(&mut self) -> CaptureResult<()> {
        let Some((entry, ret)) = self.links.take() else {
            return Ok(());
        };
        let mut state = self.state.lock();
        let Some(loaded) = state.as_mut() else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for (name, link) in [(ENTRY_PROGRAM, entry), (RETURN_PROGRAM, ret)] {
            let detached = loaded
                .program(name)
                .and_then(|program| program.detach(link).map_err(|e| e.to_string()));
            if let Err(message) = detached {
                failures.push(format!("{}: {}", name, message));
            }
        }
        // No new records once both links are gone; release delivers what the kernel still holds
        loaded.release(self.probe_id);
        trace!("Released probe {}", self.probe_id);

        // Last probe gone: unload programs and stop the relay
        if loaded.routes.lock().is_empty() {
            loaded.relay.cancel();
            *state = None;
            debug!("eBPF object unloaded");
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CaptureError::Detach {
                path: self.library.clone(),
                symbol: self.symbol.clone(),
                message: failures.join("; "),
            })
        }
    }
}

/// Move records from the kernel ring buffer into module transports
async fn relay_records(
    readiness: AsyncFd<OwnedFd>,
    ring: SharedRing,
    lost: Option<LossCounters>,
    routes: Routes,
    cancel: CancellationToken,
) {
    let mut loss_tick = tokio::time::interval(LOSS_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = loss_tick.tick() => {
                if let Some(lost) = &lost {
                    fold_losses(&routes, |probe_id| loss_total(lost, probe_id));
                }
            }
            guard = readiness.readable() => {
                let mut guard = match guard {
                    Ok(guard) => guard,
                    Err(e) => {
                        error!("Ring buffer poll failed: {}", e);
                        break;
                    }
                };
                drain_ring(&mut *ring.lock(), &routes);
                guard.clear_ready();
            }
        }
    }

    drain_ring(&mut *ring.lock(), &routes);
    if let Some(lost) = &lost {
        fold_losses(&routes, |probe_id| loss_total(lost, probe_id));
    }
    debug!("Relay stopped");
}

/// Items waiting in a kernel ring buffer
trait RecordSource {
    fn drain_items(&mut self, f: &mut dyn FnMut(&[u8]));
}

impl RecordSource for RingBuf<MapData> {
    fn drain_items(&mut self, f: &mut dyn FnMut(&[u8])) {
        while let Some(item) = self.next() {
            f(&item);
        }
    }
}

fn drain_ring(ring: &mut impl RecordSource, routes: &Routes) {
    let routes = routes.lock();
    ring.drain_items(&mut |item: &[u8]| {
        let Some(record) = ProbeRecord::from_bytes(item) else {
            debug!("Skipping short ring buffer item ({} bytes)", item.len());
            return;
        };
        let Some(route) = routes.get(&record.probe_id) else {
            trace!("Record for released probe {}", record.probe_id);
            return;
        };
        match record.to_raw() {
            Some(raw) => {
                route.producer.push(raw);
            }
            None => debug!("Skipping record with direction {}", record.direction),
        }
    });
}

/// Deliver what is buffered, settle the loss count, then forget the probe
fn retire_route(ring: &mut impl RecordSource, routes: &Routes, probe_id: u64, lost: Option<u64>) {
    drain_ring(ring, routes);
    if let Some(mut route) = routes.lock().remove(&probe_id) {
        if let Some(total) = lost {
            fold_route(&mut route, total);
        }
    }
}

fn fold_losses(routes: &Routes, loss_of: impl Fn(u64) -> Option<u64>) {
    let mut routes = routes.lock();
    for (probe_id, route) in routes.iter_mut() {
        if let Some(total) = loss_of(*probe_id) {
            fold_route(route, total);
        }
    }
}

fn fold_route(route: &mut Route, total: u64) {
    match route.lost_seen {
        None => route.lost_seen = Some(total),
        Some(seen) if total > seen => {
            route.producer.record_loss(total - seen);
            route.lost_seen = Some(total);
        }
        Some(_) => {}
    }
}

fn loss_total(lost: &PerCpuArray<MapData, u64>, probe_id: u64) -> Option<u64> {
    match lost.get(&(probe_id as u32), 0) {
        Ok(values) => Some(values.iter().sum()),
        Err(e) => {
            trace!("Loss counter for probe {} unavailable: {}", probe_id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlsprobe_core::transport;
    use tlsprobe_core::{ArgSpec, Direction, Fingerprint};

    fn target(library: &str) -> ProbeTarget {
        ProbeTarget {
            fingerprint: Fingerprint {
                path: PathBuf::from(library),
                digest: "00".repeat(32),
            },
            symbol: "SSL_write".to_string(),
            version: None,
            offset: 0x1000,
            direction: Direction::Write,
            args: ArgSpec::new(1, 2),
        }
    }

    #[tokio::test]
    async fn test_missing_object_fails_attach() {
        let backend = UprobeBackend::new(Some(PathBuf::from("/nonexistent/tlsprobe.bpf.o")));
        let (producer, _consumer) = transport::channel(8);
        let err = backend
            .attach(ProcessFilter::All, &target("/usr/lib/libssl.so.3"), producer)
            .unwrap_err();
        match err {
            CaptureError::Attach { symbol, message, .. } => {
                assert_eq!(symbol, "SSL_write");
                assert!(message.contains("tlsprobe.bpf.o"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(backend.attachment_count(), 0);
    }

    #[tokio::test]
    async fn test_unmapped_library_fails_for_pid() {
        let backend = UprobeBackend::new(None);
        let (producer, _consumer) = transport::channel(8);
        let filter = ProcessFilter::from_pid(std::process::id());
        let err = backend
            .attach(filter, &target("/nonexistent/libssl.so.3"), producer)
            .unwrap_err();
        assert!(matches!(err, CaptureError::Attach { ref message, .. } if message.contains("not mapped")));
        assert_eq!(backend.attachment_count(), 0);
    }

    impl RecordSource for std::collections::VecDeque<Vec<u8>> {
        fn drain_items(&mut self, f: &mut dyn FnMut(&[u8])) {
            while let Some(item) = self.pop_front() {
                f(&item);
            }
        }
    }

    fn item(probe_id: u64, payload: &[u8]) -> Vec<u8> {
        let mut record = ProbeRecord::zeroed();
        record.probe_id = probe_id;
        record.pid = 42;
        record.direction = crate::types::DIRECTION_WRITE;
        record.data_len = payload.len() as u32;
        record.captured_len = payload.len() as u32;
        record.data[..payload.len()].copy_from_slice(payload);
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &record as *const ProbeRecord as *const u8,
                std::mem::size_of::<ProbeRecord>(),
            )
        };
        bytes.to_vec()
    }

    #[test]
    fn test_retire_delivers_buffered_records_first() {
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (producer, mut consumer) = transport::channel(8);
        let (other, mut other_consumer) = transport::channel(8);
        routes.lock().insert(
            3,
            Route {
                producer,
                lost_seen: Some(10),
            },
        );
        routes.lock().insert(
            4,
            Route {
                producer: other,
                lost_seen: None,
            },
        );

        let mut ring: std::collections::VecDeque<Vec<u8>> =
            [item(3, b"GET /"), item(4, b"HTTP/1.1"), item(3, b"Host: a")].into();
        retire_route(&mut ring, &routes, 3, Some(12));

        assert!(ring.is_empty());
        assert!(!routes.lock().contains_key(&3));
        let delivered: Vec<Vec<u8>> = consumer.drain().into_iter().map(|r| r.data).collect();
        assert_eq!(delivered, vec![b"GET /".to_vec(), b"Host: a".to_vec()]);
        assert_eq!(consumer.dropped(), 2);

        // Records of a probe that stays attached are routed too
        assert_eq!(other_consumer.drain().len(), 1);
        assert!(routes.lock().contains_key(&4));
    }

    #[test]
    fn test_loss_baseline_then_increases() {
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (producer, consumer) = transport::channel(8);
        routes.lock().insert(
            1,
            Route {
                producer,
                lost_seen: None,
            },
        );

        fold_losses(&routes, |_| Some(5));
        assert_eq!(consumer.dropped(), 0);
        fold_losses(&routes, |_| Some(9));
        fold_losses(&routes, |_| Some(9));
        assert_eq!(consumer.dropped(), 4);
    }
}

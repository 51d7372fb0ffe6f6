#![no_std]
#![no_main]

use aya_ebpf::{
    EbpfContext,
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_uid_gid,
        bpf_ktime_get_ns, bpf_probe_read_user_buf, generated::bpf_get_attach_cookie,
    },
    macros::{map, uprobe, uretprobe},
    maps::{HashMap, PerCpuArray, RingBuf},
    programs::{ProbeContext, RetProbeContext},
};
use tlsprobe_ebpf_common::{
    ArgLayout, DIRECTION_READ, MAX_DATA_LEN, MAX_PROBES, PendingCall, ProbeRecord,
};

// =============================================================================
// Maps
// =============================================================================

/// Ring buffer for sending captured buffers to userspace
/// Size: 1MB - about 250 records at 4KB each
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(1024 * 1024, 0);

/// Per-probe count of records that did not fit in EVENTS
/// Index: probe id (attach cookie)
#[map]
static LOST_EVENTS: PerCpuArray<u64> = PerCpuArray::with_max_entries(MAX_PROBES, 0);

/// Argument positions and direction per probe id, written by userspace
#[map]
static ARG_LAYOUT: HashMap<u64, ArgLayout> = HashMap::with_max_entries(MAX_PROBES, 0);

/// Entry arguments of in-flight write calls, keyed by pid_tgid
#[map]
static PENDING_WRITES: HashMap<u64, PendingCall> = HashMap::with_max_entries(10240, 0);

/// Entry arguments of in-flight read calls, keyed by pid_tgid
#[map]
static PENDING_READS: HashMap<u64, PendingCall> = HashMap::with_max_entries(10240, 0);

// =============================================================================
// Helpers
// =============================================================================

#[inline(always)]
fn probe_id<C: EbpfContext>(ctx: &C) -> u64 {
    unsafe { bpf_get_attach_cookie(ctx.as_ptr()) }
}

#[inline(always)]
fn pending_map(direction: u8) -> &'static HashMap<u64, PendingCall> {
    if direction == DIRECTION_READ {
        &PENDING_READS
    } else {
        &PENDING_WRITES
    }
}

#[inline(always)]
fn count_lost(probe_id: u64) {
    if probe_id >= MAX_PROBES as u64 {
        return;
    }
    if let Some(counter) = LOST_EVENTS.get_ptr_mut(probe_id as u32) {
        unsafe { *counter += 1 };
    }
}

/// Copy `data_len` bytes at `buf_ptr` into a ring buffer record
#[inline(always)]
fn submit(probe_id: u64, direction: u8, buf_ptr: u64, data_len: usize) {
    let pid_tgid = bpf_get_current_pid_tgid();
    let uid_gid = bpf_get_current_uid_gid();

    let captured_len = if data_len > MAX_DATA_LEN { MAX_DATA_LEN } else { data_len };

    let Some(mut entry) = EVENTS.reserve::<ProbeRecord>(0) else {
        count_lost(probe_id);
        return;
    };
    let record = unsafe { &mut *entry.as_mut_ptr() };

    record.timestamp_ns = unsafe { bpf_ktime_get_ns() };
    record.probe_id = probe_id;
    record.pid = (pid_tgid >> 32) as u32;
    record.tid = pid_tgid as u32;
    record.uid = uid_gid as u32;
    record.direction = direction;
    record.data_len = data_len as u32;
    record.captured_len = 0;
    record.comm = bpf_get_current_comm().unwrap_or([0u8; 16]);

    // The verifier needs the copy length bounded
    if buf_ptr != 0 && captured_len > 0 && captured_len <= MAX_DATA_LEN {
        let copied = unsafe {
            bpf_probe_read_user_buf(buf_ptr as *const u8, &mut record.data[..captured_len])
        };
        if copied.is_ok() {
            record.captured_len = captured_len as u32;
        }
    }

    entry.submit(0);
}

// =============================================================================
// Probes
// =============================================================================

/// Entry probe - remembers buffer pointer and length until the call returns
#[uprobe]
pub fn tls_entry(ctx: ProbeContext) -> u32 {
    match try_tls_entry(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_tls_entry(ctx: &ProbeContext) -> Result<(), i64> {
    let probe_id = probe_id(ctx);
    let layout = unsafe { ARG_LAYOUT.get(&probe_id).ok_or(1i64)? };

    let buf: u64 = ctx.arg::<u64>(layout.buffer_arg as usize).ok_or(1i64)?;
    let len: u64 = ctx.arg::<u64>(layout.length_arg as usize).ok_or(1i64)?;

    let pending = PendingCall { probe_id, buf, len };
    pending_map(layout.direction)
        .insert(&bpf_get_current_pid_tgid(), &pending, 0)
        .map_err(|_| 1i64)?;

    Ok(())
}

/// Return probe - copies the plaintext once the call reports how many bytes moved
///
/// Writes are read back after the call, which still sees the caller's buffer
/// since the library encrypts into its own.
#[uretprobe]
pub fn tls_return(ctx: RetProbeContext) -> u32 {
    match try_tls_return(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_tls_return(ctx: &RetProbeContext) -> Result<(), i64> {
    let probe_id = probe_id(ctx);
    let layout = unsafe { ARG_LAYOUT.get(&probe_id).ok_or(1i64)? };
    let pending_calls = pending_map(layout.direction);

    let pid_tgid = bpf_get_current_pid_tgid();
    let pending = unsafe { *pending_calls.get(&pid_tgid).ok_or(1i64)? };
    let _ = pending_calls.remove(&pid_tgid);

    // Entry and return of different hooks on the same thread
    if pending.probe_id != probe_id {
        return Ok(());
    }

    // <= 0 means error or nothing transferred
    let ret: i64 = ctx.ret::<i64>();
    if ret > 0 {
        submit(probe_id, layout.direction, pending.buf, ret as usize);
    }

    Ok(())
}

// =============================================================================
// Required for eBPF programs
// =============================================================================

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";

#![no_std]
#![no_main]

#[allow(
    clippy::all,
    dead_code,
    improper_ctypes_definitions,
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals,
    unnecessary_transmutes,
    unsafe_op_in_unsafe_fn,
)]
#[rustfmt::skip]
mod vmlinux {
    include!(concat!(env!("OUT_DIR"), "/vmlinux.rs"));
}

use core::ptr::{addr_of, addr_of_mut};

use aya_ebpf::{
    bindings::path as bpf_path,
    bpf_printk,
    cty::c_char,
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_probe_read_kernel,
        r#gen::{bpf_d_path, bpf_get_current_task_btf, bpf_ktime_get_ns},
    },
    macros::{lsm, map},
    maps::{PerCpuArray, RingBuf},
    programs::LsmContext,
};
use lsm_audit_common::{
    AF_INET, CONNECT_EVENTS_DEFAULT_BYTES, ConnectEvent, DROP_INDEX_CONNECT, DROP_INDEX_FILE_OPEN,
    DROP_SLOTS, FILE_OPEN_EVENTS_DEFAULT_BYTES, FileOpenEvent, MAX_PATH_LEN, SockAddrIn,
    ipv4_octets,
};

use crate::vmlinux::{file, task_struct};

// =============================================================================
// Load-time configuration
// =============================================================================

/// Non-zero enables bpf_printk tracing (rewritten by the loader)
#[unsafe(no_mangle)]
static ENABLE_DEBUG: u8 = 0;

/// Only this tgid is recorded when non-zero (rewritten by the loader)
#[unsafe(no_mangle)]
static PID_TARGET: u32 = 0;

#[inline(always)]
fn debug_enabled() -> bool {
    unsafe { core::ptr::read_volatile(&ENABLE_DEBUG) != 0 }
}

#[inline(always)]
fn admits(tgid: u32) -> bool {
    let target = unsafe { core::ptr::read_volatile(&PID_TARGET) };
    target == 0 || target == tgid
}

// =============================================================================
// Maps
// =============================================================================

/// Allowed IPv4 connects (resized by the loader)
#[map]
static CONNECT_EVENTS: RingBuf = RingBuf::with_byte_size(CONNECT_EVENTS_DEFAULT_BYTES, 0);

/// Every file open (resized by the loader)
#[map]
static FILE_OPEN_EVENTS: RingBuf = RingBuf::with_byte_size(FILE_OPEN_EVENTS_DEFAULT_BYTES, 0);

/// Reservations that found their ring buffer full
#[map]
static DROPPED: PerCpuArray<u64> = PerCpuArray::with_max_entries(DROP_SLOTS, 0);

#[inline(always)]
fn count_drop(index: u32) {
    if let Some(counter) = DROPPED.get_ptr_mut(index) {
        unsafe { *counter += 1 };
    }
}

// =============================================================================
// Process context
// =============================================================================

#[inline(always)]
fn current_tgid() -> u32 {
    (bpf_get_current_pid_tgid() >> 32) as u32
}

/// Fill `buf` with the path of the current task's executable.
///
/// Kernel threads have no mm and some tasks no exe_file; the buffer is left
/// (or reset to) all zeroes in those cases.
#[inline(always)]
fn read_exe_path(buf: &mut [u8; MAX_PATH_LEN]) {
    unsafe {
        let task = bpf_get_current_task_btf() as *const task_struct;
        if task.is_null() {
            return;
        }
        let mm = (*task).mm;
        if mm.is_null() {
            return;
        }
        let exe_file = (*mm).__bindgen_anon_1.exe_file;
        if exe_file.is_null() {
            return;
        }
        read_file_path(exe_file, buf);
    }
}

#[inline(always)]
unsafe fn read_file_path(f: *mut file, buf: &mut [u8; MAX_PATH_LEN]) {
    let ret = unsafe {
        bpf_d_path(
            addr_of_mut!((*f).f_path) as *mut bpf_path,
            buf.as_mut_ptr() as *mut c_char,
            MAX_PATH_LEN as u32,
        )
    };
    if ret < 0 {
        buf.fill(0);
    }
}

// =============================================================================
// LSM: socket_connect
// =============================================================================

/// security_socket_connect(sock, address, addrlen) with the previous
/// decision in arg 3. The decision is always passed through.
#[lsm(hook = "socket_connect")]
pub fn socket_connect(ctx: LsmContext) -> i32 {
    let ret: i32 = unsafe { ctx.arg(3) };
    if ret != 0 {
        return ret;
    }
    let address: *const SockAddrIn = unsafe { ctx.arg(1) };
    record_connect(address);
    ret
}

#[inline(always)]
fn record_connect(address: *const SockAddrIn) {
    let tgid = current_tgid();
    if !admits(tgid) {
        return;
    }

    let Some(mut entry) = CONNECT_EVENTS.reserve::<ConnectEvent>(0) else {
        count_drop(DROP_INDEX_CONNECT);
        if debug_enabled() {
            unsafe { bpf_printk!(b"lsm-audit: connect pid=%u dropped", tgid) };
        }
        return;
    };

    let event = unsafe {
        core::ptr::write_bytes(entry.as_mut_ptr(), 0, 1);
        &mut *entry.as_mut_ptr()
    };
    event.timestamp_ns = unsafe { bpf_ktime_get_ns() };
    event.pid = tgid;
    if let Ok(comm) = bpf_get_current_comm() {
        event.comm = comm;
    }
    read_exe_path(&mut event.exe);

    let family = unsafe { bpf_probe_read_kernel(addr_of!((*address).sin_family)) };
    if !matches!(family, Ok(AF_INET)) {
        entry.discard(0);
        return;
    }

    match unsafe { bpf_probe_read_kernel(addr_of!((*address).sin_addr)) } {
        Ok(s_addr) => {
            event.dst_ip = ipv4_octets(s_addr);
            if debug_enabled() {
                let dst = u32::from_be_bytes(event.dst_ip);
                unsafe { bpf_printk!(b"lsm-audit: connect pid=%u dst=%x", tgid, dst) };
            }
            entry.submit(0);
        }
        Err(_) => entry.discard(0),
    }
}

// =============================================================================
// LSM: file_open
// =============================================================================

/// security_file_open(file). Always lets the open continue.
#[lsm(hook = "file_open")]
pub fn file_open(ctx: LsmContext) -> i32 {
    let f: *mut file = unsafe { ctx.arg(0) };
    record_file_open(f);
    0
}

#[inline(always)]
fn record_file_open(f: *mut file) {
    let tgid = current_tgid();
    if !admits(tgid) {
        return;
    }

    let Some(mut entry) = FILE_OPEN_EVENTS.reserve::<FileOpenEvent>(0) else {
        count_drop(DROP_INDEX_FILE_OPEN);
        if debug_enabled() {
            unsafe { bpf_printk!(b"lsm-audit: file_open pid=%u dropped", tgid) };
        }
        return;
    };

    let event = unsafe {
        core::ptr::write_bytes(entry.as_mut_ptr(), 0, 1);
        &mut *entry.as_mut_ptr()
    };
    event.timestamp_ns = unsafe { bpf_ktime_get_ns() };
    event.pid = tgid;
    if let Ok(comm) = bpf_get_current_comm() {
        event.comm = comm;
    }
    read_exe_path(&mut event.exe);
    unsafe { read_file_path(f, &mut event.path) };

    if debug_enabled() {
        unsafe { bpf_printk!(b"lsm-audit: file_open pid=%u", tgid) };
    }
    entry.submit(0);
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";

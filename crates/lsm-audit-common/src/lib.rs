#![cfg_attr(not(test), no_std)]

//! Record layouts shared between the LSM programs and userspace.
//!
//! Everything in here is `#[repr(C)]`, `Copy` and fixed size so the same
//! definition can be written by a kernel hook and read back byte-for-byte by
//! the consumer.

/// Process command name length (TASK_COMM_LEN)
pub const COMM_LEN: usize = 16;

/// Capacity of the executable and file path fields
pub const MAX_PATH_LEN: usize = 128;

/// Address family for IPv4 (AF_INET)
pub const AF_INET: u16 = 2;

/// Address family for IPv6 (AF_INET6)
pub const AF_INET6: u16 = 10;

// =============================================================================
// Map and global names
// =============================================================================

/// Ring buffer carrying [`ConnectEvent`] records
pub const CONNECT_EVENTS_MAP: &str = "CONNECT_EVENTS";

/// Ring buffer carrying [`FileOpenEvent`] records
pub const FILE_OPEN_EVENTS_MAP: &str = "FILE_OPEN_EVENTS";

/// Per-CPU counters of reservations that found the ring buffer full
pub const DROPPED_MAP: &str = "DROPPED";

/// Slot in [`DROPPED_MAP`] counting lost connect records
pub const DROP_INDEX_CONNECT: u32 = 0;

/// Slot in [`DROPPED_MAP`] counting lost file-open records
pub const DROP_INDEX_FILE_OPEN: u32 = 1;

/// Number of slots in [`DROPPED_MAP`]
pub const DROP_SLOTS: u32 = 2;

/// Load-time global: non-zero enables `bpf_printk` tracing in the hooks
pub const ENABLE_DEBUG_GLOBAL: &str = "ENABLE_DEBUG";

/// Load-time global: when non-zero only this tgid is recorded
pub const PID_TARGET_GLOBAL: &str = "PID_TARGET";

/// Default connect ring buffer size (4 MiB)
pub const CONNECT_EVENTS_DEFAULT_BYTES: u32 = 1 << 22;

/// Default file-open ring buffer size (8 MiB)
pub const FILE_OPEN_EVENTS_DEFAULT_BYTES: u32 = 1 << 23;

// =============================================================================
// Records
// =============================================================================

/// Outbound IPv4 connection that the kernel allowed
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ConnectEvent {
    /// Monotonic nanoseconds since boot (bpf_ktime_get_ns)
    pub timestamp_ns: u64,
    /// Thread-group id of the caller
    pub pid: u32,
    /// Command name, NUL-padded
    pub comm: [u8; COMM_LEN],
    /// Executable path, NUL-terminated when it fits
    pub exe: [u8; MAX_PATH_LEN],
    /// Destination address octets in network order
    pub dst_ip: [u8; 4],
}

impl ConnectEvent {
    /// Create a new zeroed event
    pub const fn zeroed() -> Self {
        Self {
            timestamp_ns: 0,
            pid: 0,
            comm: [0u8; COMM_LEN],
            exe: [0u8; MAX_PATH_LEN],
            dst_ip: [0u8; 4],
        }
    }
}

/// File open performed by a process
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FileOpenEvent {
    /// Monotonic nanoseconds since boot (bpf_ktime_get_ns)
    pub timestamp_ns: u64,
    /// Thread-group id of the caller
    pub pid: u32,
    /// Command name, NUL-padded
    pub comm: [u8; COMM_LEN],
    /// Executable path, NUL-terminated when it fits
    pub exe: [u8; MAX_PATH_LEN],
    /// Path of the opened file, NUL-terminated when it fits
    pub path: [u8; MAX_PATH_LEN],
    /// Explicit tail padding to the 8-byte record alignment
    _pad: [u8; 4],
}

impl FileOpenEvent {
    /// Create a new zeroed event
    pub const fn zeroed() -> Self {
        Self {
            timestamp_ns: 0,
            pid: 0,
            comm: [0u8; COMM_LEN],
            exe: [0u8; MAX_PATH_LEN],
            path: [0u8; MAX_PATH_LEN],
            _pad: [0u8; 4],
        }
    }
}

const _: () = assert!(core::mem::size_of::<ConnectEvent>() == 160);
const _: () = assert!(core::mem::size_of::<FileOpenEvent>() == 288);
const _: () = assert!(core::mem::align_of::<ConnectEvent>() == 8);
const _: () = assert!(core::mem::align_of::<FileOpenEvent>() == 8);

// =============================================================================
// Socket addresses
// =============================================================================

/// `struct sockaddr_in` as the kernel hands it to `security_socket_connect`.
///
/// Only `sin_family` is meaningful until it has been checked against
/// [`AF_INET`]; every sockaddr variant starts with the family field.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SockAddrIn {
    pub sin_family: u16,
    /// Port in network byte order
    pub sin_port: u16,
    /// `s_addr` word, exactly as loaded from memory
    pub sin_addr: u32,
    pub sin_zero: [u8; 8],
}

impl SockAddrIn {
    pub const fn zeroed() -> Self {
        Self {
            sin_family: 0,
            sin_port: 0,
            sin_addr: 0,
            sin_zero: [0u8; 8],
        }
    }
}

/// Byte order a 32-bit word was loaded with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WordOrder {
    Little,
    Big,
}

impl WordOrder {
    /// Order of the machine this code runs on
    #[cfg(target_endian = "little")]
    pub const NATIVE: WordOrder = WordOrder::Little;
    #[cfg(target_endian = "big")]
    pub const NATIVE: WordOrder = WordOrder::Big;
}

/// Recover the four destination octets from an `s_addr` word that was loaded
/// with the given byte order.
///
/// `s_addr` is stored in network order, so writing the word back out in the
/// order it was read yields `a.b.c.d` with `a` first on every host.
#[inline(always)]
pub const fn ipv4_octets_in(s_addr: u32, order: WordOrder) -> [u8; 4] {
    match order {
        WordOrder::Little => s_addr.to_le_bytes(),
        WordOrder::Big => s_addr.to_be_bytes(),
    }
}

/// [`ipv4_octets_in`] for a word loaded on this host.
#[inline(always)]
pub const fn ipv4_octets(s_addr: u32) -> [u8; 4] {
    ipv4_octets_in(s_addr, WordOrder::NATIVE)
}

/// Portion of a NUL-padded field before its first NUL byte.
#[inline]
pub fn until_nul(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == 0) {
        Some(end) => &field[..end],
        None => field,
    }
}

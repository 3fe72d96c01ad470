//! Process context resolution
//!
//! Hook handlers never look at the caller directly; they ask an
//! [`EventSource`] for normalized fields. The kernel programs implement the
//! same contract with BPF helpers.

use lsm_audit_common::{COMM_LEN, MAX_PATH_LEN};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

/// The executable path of the calling context could not be determined
/// (no memory descriptor, or no backing file).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("executable path unavailable")]
pub struct ContextUnavailable;

/// Capability to describe the context that triggered a hook.
///
/// Implementations must answer in bounded time without blocking or
/// allocating.
pub trait EventSource {
    /// Monotonic nanoseconds
    fn timestamp_ns(&self) -> u64;

    /// Thread-group id of the caller
    fn pid(&self) -> u32;

    /// Write the command name into `buf`, NUL-padded
    fn comm(&self, buf: &mut [u8; COMM_LEN]);

    /// Write the executable path into `buf` and return the number of bytes
    /// written.
    fn exe_path(&self, buf: &mut [u8; MAX_PATH_LEN]) -> Result<usize, ContextUnavailable>;
}

/// Record fields the resolver fills in
pub struct ContextFields<'a> {
    pub pid: &'a mut u32,
    pub comm: &'a mut [u8; COMM_LEN],
    pub exe: &'a mut [u8; MAX_PATH_LEN],
}

/// Copy the caller's identity into a reserved record.
///
/// A missing executable path leaves `exe` zero-filled. The last byte of each
/// string field is always NUL.
pub fn resolve_context<S: EventSource + ?Sized>(source: &S, fields: ContextFields<'_>) {
    *fields.pid = source.pid();

    source.comm(fields.comm);
    fields.comm[COMM_LEN - 1] = 0;

    match source.exe_path(fields.exe) {
        Ok(_) => fields.exe[MAX_PATH_LEN - 1] = 0,
        Err(ContextUnavailable) => fields.exe.fill(0),
    }
}

/// Copy `src` into a fixed field, truncating so that a NUL always fits.
///
/// Returns the number of bytes copied.
pub fn copy_bounded(dst: &mut [u8], src: &[u8]) -> usize {
    let Some(room) = dst.len().checked_sub(1) else {
        return 0;
    };
    let n = src.len().min(room);
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(0);
    n
}

/// Nanosecond clock anchored at construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Event source with fixed identity fields, read from a shared clock.
#[derive(Debug, Clone)]
pub struct StaticSource {
    pid: u32,
    comm: [u8; COMM_LEN],
    exe: Option<[u8; MAX_PATH_LEN]>,
    exe_len: usize,
    clock: MonotonicClock,
}

impl StaticSource {
    pub fn new(pid: u32, comm: &str, clock: MonotonicClock) -> Self {
        let mut buf = [0u8; COMM_LEN];
        copy_bounded(&mut buf, comm.as_bytes());
        Self {
            pid,
            comm: buf,
            exe: None,
            exe_len: 0,
            clock,
        }
    }

    /// Set the executable path reported by this source
    pub fn with_exe(mut self, exe: impl AsRef<Path>) -> Self {
        let mut buf = [0u8; MAX_PATH_LEN];
        self.exe_len = copy_bounded(&mut buf, exe.as_ref().as_os_str().as_encoded_bytes());
        self.exe = Some(buf);
        self
    }
}

impl EventSource for StaticSource {
    fn timestamp_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn comm(&self, buf: &mut [u8; COMM_LEN]) {
        *buf = self.comm;
    }

    fn exe_path(&self, buf: &mut [u8; MAX_PATH_LEN]) -> Result<usize, ContextUnavailable> {
        let exe = self.exe.as_ref().ok_or(ContextUnavailable)?;
        *buf = *exe;
        Ok(self.exe_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsm_audit_common::until_nul;

    struct Fields {
        pid: u32,
        comm: [u8; COMM_LEN],
        exe: [u8; MAX_PATH_LEN],
    }

    impl Fields {
        fn new() -> Self {
            Self {
                pid: 0,
                comm: [0xaa; COMM_LEN],
                exe: [0xaa; MAX_PATH_LEN],
            }
        }

        fn resolve(&mut self, source: &impl EventSource) {
            resolve_context(
                source,
                ContextFields {
                    pid: &mut self.pid,
                    comm: &mut self.comm,
                    exe: &mut self.exe,
                },
            );
        }
    }

    #[test]
    fn test_resolves_all_fields() {
        let source =
            StaticSource::new(4242, "curl", MonotonicClock::new()).with_exe("/usr/bin/curl");
        let mut fields = Fields::new();
        fields.resolve(&source);

        assert_eq!(fields.pid, 4242);
        assert_eq!(until_nul(&fields.comm), b"curl");
        assert_eq!(until_nul(&fields.exe), b"/usr/bin/curl");
        assert!(fields.exe[b"/usr/bin/curl".len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_missing_exe_is_zero_filled() {
        let source = StaticSource::new(7, "kworker/0:1", MonotonicClock::new());
        let mut fields = Fields::new();
        fields.resolve(&source);

        assert_eq!(fields.pid, 7);
        assert_eq!(until_nul(&fields.comm), b"kworker/0:1");
        assert!(fields.exe.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_long_values_truncated_to_field() {
        let long_comm = "a-very-long-command-name";
        let long_exe = format!("/opt/{}", "x".repeat(300));
        let source = StaticSource::new(1, long_comm, MonotonicClock::new()).with_exe(&long_exe);
        let mut fields = Fields::new();
        fields.resolve(&source);

        assert_eq!(until_nul(&fields.comm), &long_comm.as_bytes()[..COMM_LEN - 1]);
        assert_eq!(fields.comm[COMM_LEN - 1], 0);
        assert_eq!(until_nul(&fields.exe).len(), MAX_PATH_LEN - 1);
        assert_eq!(fields.exe[MAX_PATH_LEN - 1], 0);
    }

    #[test]
    fn test_missing_exe_reports_error() {
        let source = StaticSource::new(7, "kworker/0:1", MonotonicClock::new());
        let mut buf = [0u8; MAX_PATH_LEN];
        let err = source.exe_path(&mut buf).unwrap_err();
        assert_eq!(err, ContextUnavailable);
        assert_eq!(err.to_string(), "executable path unavailable");

        let wrapped = anyhow::Error::new(err);
        assert!(wrapped.downcast_ref::<ContextUnavailable>().is_some());
    }

    #[test]
    fn test_copy_bounded() {
        let mut buf = [0xffu8; 4];
        assert_eq!(copy_bounded(&mut buf, b"ab"), 2);
        assert_eq!(buf, *b"ab\0\0");
        assert_eq!(copy_bounded(&mut buf, b"abcdef"), 3);
        assert_eq!(buf, *b"abc\0");
        assert_eq!(copy_bounded(&mut [0u8; 0], b"abc"), 0);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }
}

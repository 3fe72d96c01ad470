//! Hook handlers for the connect and file-open decision points
//!
//! Both handlers are fail-open: whatever happens to the audit record, the
//! caller's outcome is returned untouched. They never block and never
//! allocate beyond the one slot they reserve.

use crate::channel::RingChannel;
use crate::context::{copy_bounded, resolve_context, ContextFields, EventSource};
use crate::pipeline::PipelineConfig;
use lsm_audit_common::{
    ipv4_octets, ConnectEvent, FileOpenEvent, SockAddrIn, AF_INET, AF_INET6, MAX_PATH_LEN,
};
use std::mem;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Opaque identifier of the socket a connect was issued on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketCookie(pub u64);

/// File handed to the file-open hook
#[derive(Debug, Clone, Copy)]
pub struct OpenedFile<'a> {
    path: &'a Path,
}

impl<'a> OpenedFile<'a> {
    pub fn new(path: &'a Path) -> Self {
        Self { path }
    }

    /// Write the file's path into `buf`, truncated to fit
    fn write_path(&self, buf: &mut [u8; MAX_PATH_LEN]) -> usize {
        copy_bounded(buf, self.path.as_os_str().as_encoded_bytes())
    }
}

/// Build the raw `sockaddr` a connect hook would receive for `addr`.
///
/// IPv6 destinations only carry their family; the handler never reads past
/// it for anything but IPv4.
pub fn raw_sockaddr(addr: SocketAddr) -> SockAddrIn {
    let mut raw = SockAddrIn::zeroed();
    match addr {
        SocketAddr::V4(v4) => {
            raw.sin_family = AF_INET;
            raw.sin_port = v4.port().to_be();
            raw.sin_addr = u32::from_ne_bytes(v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            raw.sin_family = AF_INET6;
            raw.sin_port = v6.port().to_be();
        }
    }
    raw
}

/// Entry points invoked synchronously from the instrumented operations
#[derive(Debug, Clone)]
pub struct HookHandlers {
    config: PipelineConfig,
    connect: Arc<RingChannel>,
    file_open: Arc<RingChannel>,
}

impl HookHandlers {
    pub fn new(
        config: PipelineConfig,
        connect: Arc<RingChannel>,
        file_open: Arc<RingChannel>,
    ) -> Self {
        Self {
            config,
            connect,
            file_open,
        }
    }

    /// Audit an outbound connection attempt.
    ///
    /// Only attempts the kernel allowed (`outcome == 0`) to an IPv4
    /// destination produce a record. Returns `outcome` unchanged.
    pub fn on_socket_connect<S: EventSource + ?Sized>(
        &self,
        source: &S,
        socket: SocketCookie,
        address: &SockAddrIn,
        outcome: i32,
    ) -> i32 {
        if outcome != 0 {
            return outcome;
        }

        let pid = source.pid();
        if !self.config.admits(pid) {
            return outcome;
        }

        let Some(mut slot) = self.connect.reserve(mem::size_of::<ConnectEvent>()) else {
            if self.config.debug_tracing {
                trace!(pid, socket = socket.0, "connect record dropped, channel full");
            }
            return outcome;
        };
        let Some(event) = slot.record_mut::<ConnectEvent>() else {
            return outcome;
        };

        event.timestamp_ns = source.timestamp_ns();
        resolve_context(
            source,
            ContextFields {
                pid: &mut event.pid,
                comm: &mut event.comm,
                exe: &mut event.exe,
            },
        );

        if address.sin_family != AF_INET {
            if self.config.debug_tracing {
                trace!(pid, family = address.sin_family, "connect record discarded");
            }
            slot.discard();
            return outcome;
        }

        event.dst_ip = ipv4_octets(address.sin_addr);
        if self.config.debug_tracing {
            let [a, b, c, d] = event.dst_ip;
            trace!(pid, socket = socket.0, "connect to {a}.{b}.{c}.{d} recorded");
        }
        slot.commit();

        outcome
    }

    /// Audit a file open. Every admitted open produces one record.
    ///
    /// Always lets the open continue.
    pub fn on_file_open<S: EventSource + ?Sized>(&self, source: &S, file: OpenedFile<'_>) -> i32 {
        let pid = source.pid();
        if !self.config.admits(pid) {
            return 0;
        }

        let Some(mut slot) = self.file_open.reserve(mem::size_of::<FileOpenEvent>()) else {
            if self.config.debug_tracing {
                trace!(pid, "file open record dropped, channel full");
            }
            return 0;
        };
        let Some(event) = slot.record_mut::<FileOpenEvent>() else {
            return 0;
        };

        event.timestamp_ns = source.timestamp_ns();
        resolve_context(
            source,
            ContextFields {
                pid: &mut event.pid,
                comm: &mut event.comm,
                exe: &mut event.exe,
            },
        );
        file.write_path(&mut event.path);

        if self.config.debug_tracing {
            trace!(pid, path = %file.path.display(), "file open recorded");
        }
        slot.commit();

        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MonotonicClock, StaticSource};
    use crate::decode::{decode_connect, decode_file_open};
    use crate::metrics::ChannelStats;
    use crate::schema::EventKind;
    use std::net::{Ipv4Addr, SocketAddrV4};

    const ECONNREFUSED: i32 = -111;

    fn handlers(config: PipelineConfig, slots: usize) -> HookHandlers {
        HookHandlers::new(
            config,
            Arc::new(RingChannel::new(
                EventKind::Connect,
                slots * EventKind::Connect.record_size(),
                Arc::new(ChannelStats::default()),
            )),
            Arc::new(RingChannel::new(
                EventKind::FileOpen,
                slots * EventKind::FileOpen.record_size(),
                Arc::new(ChannelStats::default()),
            )),
        )
    }

    fn curl() -> StaticSource {
        StaticSource::new(1234, "curl", MonotonicClock::new()).with_exe("/usr/bin/curl")
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> SockAddrIn {
        raw_sockaddr(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), 443)))
    }

    #[test]
    fn test_successful_ipv4_connect_recorded() {
        let h = handlers(PipelineConfig::default(), 4);
        let ret = h.on_socket_connect(&curl(), SocketCookie(1), &v4(93, 184, 216, 34), 0);
        assert_eq!(ret, 0);

        let record = h.connect.next().unwrap();
        let event = decode_connect(&record).unwrap();
        assert_eq!(event.dst_ip, Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(event.pid, 1234);
        assert_eq!(event.comm, "curl");
        assert_eq!(event.exe.as_deref(), Some("/usr/bin/curl"));
    }

    #[test]
    fn test_failed_connect_not_recorded() {
        let h = handlers(PipelineConfig::default(), 4);
        let ret = h.on_socket_connect(&curl(), SocketCookie(1), &v4(10, 0, 0, 1), ECONNREFUSED);

        assert_eq!(ret, ECONNREFUSED);
        assert!(h.connect.next().is_none());
        assert_eq!(h.connect.stats().snapshot().reserved, 0);
    }

    #[test]
    fn test_ipv6_connect_discarded() {
        let h = handlers(PipelineConfig::default(), 4);
        let addr = raw_sockaddr("[2001:db8::1]:443".parse().unwrap());
        let ret = h.on_socket_connect(&curl(), SocketCookie(1), &addr, 0);

        assert_eq!(ret, 0);
        assert!(h.connect.next().is_none());
        assert_eq!(h.connect.free_slots(), 4);
        let stats = h.connect.stats().snapshot();
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.committed, 0);
    }

    #[test]
    fn test_full_connect_channel_keeps_outcome() {
        let h = handlers(PipelineConfig::default(), 1);
        assert_eq!(h.on_socket_connect(&curl(), SocketCookie(1), &v4(1, 1, 1, 1), 0), 0);
        assert_eq!(h.on_socket_connect(&curl(), SocketCookie(2), &v4(8, 8, 8, 8), 0), 0);

        assert_eq!(h.connect.stats().snapshot().dropped, 1);
        let record = h.connect.next().unwrap();
        assert_eq!(decode_connect(&record).unwrap().dst_ip, Ipv4Addr::new(1, 1, 1, 1));
    }

    #[test]
    fn test_every_file_open_recorded() {
        let h = handlers(PipelineConfig::default(), 8);
        for name in ["/etc/passwd", "/tmp/missing", "/etc/shadow"] {
            assert_eq!(h.on_file_open(&curl(), OpenedFile::new(Path::new(name))), 0);
        }

        let paths: Vec<String> = std::iter::from_fn(|| {
            h.file_open
                .next()
                .map(|r| decode_file_open(&r).unwrap().path)
        })
        .collect();
        assert_eq!(paths, vec!["/etc/passwd", "/tmp/missing", "/etc/shadow"]);
    }

    #[test]
    fn test_file_path_truncated_to_field() {
        let h = handlers(PipelineConfig::default(), 1);
        let long = format!("/data/{}", "d".repeat(400));
        h.on_file_open(&curl(), OpenedFile::new(Path::new(&long)));

        let record = h.file_open.next().unwrap();
        let event = decode_file_open(&record).unwrap();
        assert_eq!(event.path.len(), MAX_PATH_LEN - 1);
        assert!(long.starts_with(&event.path));
    }

    #[test]
    fn test_pid_filter_skips_reservation() {
        let config = PipelineConfig {
            target_pid: 99,
            ..Default::default()
        };
        let h = handlers(config, 4);

        h.on_socket_connect(&curl(), SocketCookie(1), &v4(1, 2, 3, 4), 0);
        h.on_file_open(&curl(), OpenedFile::new(Path::new("/etc/hosts")));
        assert_eq!(h.connect.stats().snapshot().reserved, 0);
        assert_eq!(h.file_open.stats().snapshot().reserved, 0);

        let target = StaticSource::new(99, "target", MonotonicClock::new());
        h.on_socket_connect(&target, SocketCookie(1), &v4(1, 2, 3, 4), 0);
        h.on_file_open(&target, OpenedFile::new(Path::new("/etc/hosts")));
        assert_eq!(h.connect.pending(), 1);
        assert_eq!(h.file_open.pending(), 1);
    }

    #[test]
    fn test_debug_tracing_does_not_change_records() {
        let config = PipelineConfig {
            debug_tracing: true,
            ..Default::default()
        };
        let h = handlers(config, 2);
        h.on_socket_connect(&curl(), SocketCookie(3), &v4(127, 0, 0, 1), 0);
        h.on_file_open(&curl(), OpenedFile::new(Path::new("/proc/self/status")));

        assert_eq!(h.connect.pending(), 1);
        assert_eq!(h.file_open.pending(), 1);
    }

    #[test]
    fn test_raw_sockaddr_layout() {
        let raw = v4(192, 168, 1, 10);
        assert_eq!(raw.sin_family, AF_INET);
        assert_eq!(u16::from_be(raw.sin_port), 443);
        assert_eq!(raw.sin_addr.to_ne_bytes(), [192, 168, 1, 10]);
    }
}

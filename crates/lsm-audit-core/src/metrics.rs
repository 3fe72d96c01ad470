//! Channel and consumer counters
//!
//! Every counter is a relaxed atomic; none of them orders record data.

use crate::schema::EventKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters for one ring channel
#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Successful reservations
    pub reserved: AtomicU64,
    /// Reservations made visible to the consumer
    pub committed: AtomicU64,
    /// Reservations returned without becoming visible
    pub discarded: AtomicU64,
    /// Reservations refused because the channel was full
    pub dropped: AtomicU64,
    /// Records handed to the consumer
    pub consumed: AtomicU64,
}

impl ChannelStats {
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            reserved: self.reserved.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
        }
    }

    /// Overwrite the drop counter with an externally maintained total.
    ///
    /// Kernel ring buffers count drops in a per-CPU map; the loader folds
    /// the sum back in here.
    pub fn set_dropped(&self, total: u64) {
        self.dropped.store(total, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`ChannelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub reserved: u64,
    pub committed: u64,
    pub discarded: u64,
    pub dropped: u64,
    pub consumed: u64,
}

/// Consumer-side counters
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    /// Records that failed defensive decoding
    pub decode_errors: AtomicU64,
    /// Decoded events forwarded downstream
    pub events_forwarded: AtomicU64,
}

/// Metrics for one pipeline instance
#[derive(Debug)]
pub struct MetricsCollector {
    start_time: Instant,
    connect: Arc<ChannelStats>,
    file_open: Arc<ChannelStats>,
    pub consumer: ConsumerMetrics,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connect: Arc::new(ChannelStats::default()),
            file_open: Arc::new(ChannelStats::default()),
            consumer: ConsumerMetrics::default(),
        }
    }

    /// Shared counters for a channel, handed to the channel at construction
    pub fn channel(&self, kind: EventKind) -> Arc<ChannelStats> {
        match kind {
            EventKind::Connect => self.connect.clone(),
            EventKind::FileOpen => self.file_open.clone(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self, kind: EventKind) -> ChannelSnapshot {
        match kind {
            EventKind::Connect => self.connect.snapshot(),
            EventKind::FileOpen => self.file_open.snapshot(),
        }
    }

    pub fn decode_errors(&self) -> u64 {
        self.consumer.decode_errors.load(Ordering::Relaxed)
    }

    pub fn events_forwarded(&self) -> u64 {
        self.consumer.events_forwarded.load(Ordering::Relaxed)
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP lsm_audit_uptime_seconds Time since the pipeline started\n");
        output.push_str("# TYPE lsm_audit_uptime_seconds gauge\n");
        output.push_str(&format!(
            "lsm_audit_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        let counters: [(&str, &str, fn(&ChannelSnapshot) -> u64); 5] = [
            ("reserved", "Slots reserved by hook handlers", |s| s.reserved),
            ("committed", "Records made visible to the consumer", |s| s.committed),
            ("discarded", "Reservations returned without a record", |s| s.discarded),
            ("dropped", "Reservations refused on a full channel", |s| s.dropped),
            ("consumed", "Records drained by the consumer", |s| s.consumed),
        ];

        for (name, help, read) in counters {
            output.push_str(&format!("# HELP lsm_audit_channel_{name}_total {help}\n"));
            output.push_str(&format!("# TYPE lsm_audit_channel_{name}_total counter\n"));
            for kind in EventKind::ALL {
                output.push_str(&format!(
                    "lsm_audit_channel_{name}_total{{channel=\"{}\"}} {}\n",
                    kind.channel_name(),
                    read(&self.snapshot(kind))
                ));
            }
            output.push('\n');
        }

        output.push_str("# HELP lsm_audit_decode_errors_total Records rejected by the decoder\n");
        output.push_str("# TYPE lsm_audit_decode_errors_total counter\n");
        output.push_str(&format!(
            "lsm_audit_decode_errors_total {}\n\n",
            self.decode_errors()
        ));

        output.push_str("# HELP lsm_audit_events_forwarded_total Decoded events sent downstream\n");
        output.push_str("# TYPE lsm_audit_events_forwarded_total counter\n");
        output.push_str(&format!(
            "lsm_audit_events_forwarded_total {}\n",
            self.events_forwarded()
        ));

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "channels": {
                "connect-events": self.snapshot(EventKind::Connect),
                "file-open-events": self.snapshot(EventKind::FileOpen),
            },
            "consumer": {
                "decode_errors": self.decode_errors(),
                "events_forwarded": self.events_forwarded(),
            },
        })
    }
}

/// Shared metrics handle
pub type SharedMetrics = Arc<MetricsCollector>;

/// Create a new shared metrics collector
pub fn create_metrics() -> SharedMetrics {
    Arc::new(MetricsCollector::new())
}

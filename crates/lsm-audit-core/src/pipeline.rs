//! Pipeline assembly: channels, handlers and consumer wired together

use crate::channel::RingChannel;
use crate::consumer::Consumer;
use crate::hooks::HookHandlers;
use crate::metrics::{create_metrics, SharedMetrics};
use crate::schema::EventKind;
use lsm_audit_common::{CONNECT_EVENTS_DEFAULT_BYTES, FILE_OPEN_EVENTS_DEFAULT_BYTES};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Parameters fixed before the hooks are activated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Emit a trace line for every record decision
    pub debug_tracing: bool,
    /// Only record this tgid; 0 records everything
    pub target_pid: u32,
}

impl PipelineConfig {
    /// Whether events from `pid` should be recorded
    pub fn admits(&self, pid: u32) -> bool {
        self.target_pid == 0 || self.target_pid == pid
    }
}

/// Byte capacity of each channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSizes {
    pub connect_bytes: usize,
    pub file_open_bytes: usize,
}

impl Default for ChannelSizes {
    fn default() -> Self {
        Self {
            connect_bytes: CONNECT_EVENTS_DEFAULT_BYTES as usize,
            file_open_bytes: FILE_OPEN_EVENTS_DEFAULT_BYTES as usize,
        }
    }
}

/// In-process audit pipeline
pub struct AuditPipeline {
    handlers: Arc<HookHandlers>,
    connect: Arc<RingChannel>,
    file_open: Arc<RingChannel>,
    metrics: SharedMetrics,
}

impl AuditPipeline {
    pub fn new(config: PipelineConfig, sizes: ChannelSizes) -> Self {
        let metrics = create_metrics();
        let connect = Arc::new(RingChannel::new(
            EventKind::Connect,
            sizes.connect_bytes,
            metrics.channel(EventKind::Connect),
        ));
        let file_open = Arc::new(RingChannel::new(
            EventKind::FileOpen,
            sizes.file_open_bytes,
            metrics.channel(EventKind::FileOpen),
        ));
        debug!(
            connect_slots = connect.capacity(),
            file_open_slots = file_open.capacity(),
            "audit channels allocated"
        );

        let handlers = Arc::new(HookHandlers::new(config, connect.clone(), file_open.clone()));

        Self {
            handlers,
            connect,
            file_open,
            metrics,
        }
    }

    /// Handlers to invoke from the instrumented operations
    pub fn handlers(&self) -> Arc<HookHandlers> {
        self.handlers.clone()
    }

    pub fn channel(&self, kind: EventKind) -> &Arc<RingChannel> {
        match kind {
            EventKind::Connect => &self.connect,
            EventKind::FileOpen => &self.file_open,
        }
    }

    /// Consumer draining both channels
    pub fn consumer(&self, poll_interval: Duration) -> Consumer {
        Consumer::new(
            vec![self.connect.clone(), self.file_open.clone()],
            self.metrics.clone(),
            poll_interval,
        )
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits() {
        let all = PipelineConfig::default();
        assert!(all.admits(1));
        assert!(all.admits(4242));

        let one = PipelineConfig {
            target_pid: 4242,
            ..Default::default()
        };
        assert!(one.admits(4242));
        assert!(!one.admits(1));
    }

    #[test]
    fn test_default_channel_capacity() {
        let pipeline = AuditPipeline::new(PipelineConfig::default(), ChannelSizes::default());
        assert_eq!(pipeline.channel(EventKind::Connect).capacity(), (1 << 22) / 160);
        assert_eq!(pipeline.channel(EventKind::FileOpen).capacity(), (1 << 23) / 288);
    }

    #[test]
    fn test_channels_report_into_pipeline_metrics() {
        let pipeline = AuditPipeline::new(
            PipelineConfig::default(),
            ChannelSizes {
                connect_bytes: 160,
                file_open_bytes: 288,
            },
        );
        let connect = pipeline.channel(EventKind::Connect);
        connect.reserve(160).unwrap().commit();
        assert!(connect.reserve(160).is_none());

        let snap = pipeline.metrics().snapshot(EventKind::Connect);
        assert_eq!(snap.committed, 1);
        assert_eq!(snap.dropped, 1);
    }
}

//! Consumer task draining committed records
//!
//! Runs independently of the producers: it polls each channel, decodes what
//! was committed and forwards the result. Records that fail to decode are
//! counted and skipped.

use crate::channel::RingChannel;
use crate::decode::decode;
use crate::events::AuditEvent;
use crate::metrics::SharedMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Consumer {
    channels: Vec<Arc<RingChannel>>,
    metrics: SharedMetrics,
    poll_interval: Duration,
}

impl Consumer {
    pub fn new(
        channels: Vec<Arc<RingChannel>>,
        metrics: SharedMetrics,
        poll_interval: Duration,
    ) -> Self {
        Self {
            channels,
            metrics,
            poll_interval,
        }
    }

    /// Take every record committed so far, oldest first within each channel.
    ///
    /// Returns the number of events passed to `sink`.
    pub fn drain(&self, mut sink: impl FnMut(AuditEvent)) -> usize {
        let mut decoded = 0;
        for channel in &self.channels {
            while let Some(record) = channel.next() {
                match decode(record.kind(), &record) {
                    Ok(event) => {
                        sink(event);
                        decoded += 1;
                    }
                    Err(e) => {
                        self.metrics
                            .consumer
                            .decode_errors
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(channel = record.kind().channel_name(), "Dropping record: {}", e);
                    }
                }
            }
        }
        decoded
    }

    /// Poll until `running` is cleared, then drain once more and return.
    ///
    /// Also returns early if the receiver goes away.
    pub async fn run(self, tx: mpsc::Sender<AuditEvent>, running: Arc<AtomicBool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Consumer started"
        );

        loop {
            interval.tick().await;
            let stopping = !running.load(Ordering::SeqCst);

            let mut batch = Vec::new();
            self.drain(|event| batch.push(event));

            for event in batch {
                if tx.send(event).await.is_err() {
                    debug!("Event receiver closed, consumer exiting");
                    return;
                }
                self.metrics
                    .consumer
                    .events_forwarded
                    .fetch_add(1, Ordering::Relaxed);
            }

            if stopping {
                break;
            }
        }

        info!(
            forwarded = self.metrics.events_forwarded(),
            decode_errors = self.metrics.decode_errors(),
            "Consumer stopped"
        );
    }
}

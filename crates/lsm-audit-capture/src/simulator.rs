//! In-process traffic simulator
//!
//! Drives the userspace hook handlers from a pool of producer threads so the
//! whole pipeline (reserve, fill, commit or discard, consume) can be exercised
//! without loading anything into the kernel. Useful on hosts without BPF LSM
//! and in CI.

use async_trait::async_trait;
use lsm_audit_core::capture::{CaptureError, CaptureResult, CaptureSource};
use lsm_audit_core::context::{MonotonicClock, StaticSource};
use lsm_audit_core::events::AuditEvent;
use lsm_audit_core::hooks::{raw_sockaddr, HookHandlers, OpenedFile, SocketCookie};
use lsm_audit_core::metrics::{ChannelSnapshot, SharedMetrics};
use lsm_audit_core::pipeline::{AuditPipeline, ChannelSizes, PipelineConfig};
use lsm_audit_core::schema::EventKind;
use serde::Serialize;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// `-ECONNREFUSED`, the outcome used for simulated failed connects
const CONNECT_REFUSED: i32 = -111;

const SIMULATED_EXE: &str = "/usr/bin/sim-worker";

const SIMULATED_PATHS: &[&str] = &[
    "/etc/hosts",
    "/etc/resolv.conf",
    "/etc/ssl/certs/ca-certificates.crt",
    "/usr/lib/x86_64-linux-gnu/libc.so.6",
    "/proc/self/status",
    "/var/log/sim-worker/current.log",
];

/// Configuration for the simulator
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Number of producer threads
    pub producers: usize,

    /// Connect/open pairs per producer (0 = until stopped)
    pub events_per_producer: u64,

    /// Share of allowed connects that go to an IPv6 destination
    pub ipv6_ratio: f64,

    /// Share of connects the "kernel" refuses
    pub fail_ratio: f64,

    /// Pid of the first producer; producer `n` uses `base_pid + n`
    pub base_pid: u32,

    pub pipeline: PipelineConfig,
    pub channel_sizes: ChannelSizes,
    pub poll_interval: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            producers: 4,
            events_per_producer: 1000,
            ipv6_ratio: 0.1,
            fail_ratio: 0.05,
            base_pid: 20000,
            pipeline: PipelineConfig::default(),
            channel_sizes: ChannelSizes::default(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// What the producers did, summed over all threads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProducerTally {
    pub connect_attempts: u64,
    /// Connects with a non-zero outcome
    pub failed_connects: u64,
    /// Allowed connects to an IPv6 destination
    pub ipv6_connects: u64,
    /// Allowed connects skipped by the pid filter
    pub filtered_connects: u64,
    pub file_opens: u64,
    pub filtered_opens: u64,
}

impl ProducerTally {
    fn merge(mut self, other: ProducerTally) -> Self {
        self.connect_attempts += other.connect_attempts;
        self.failed_connects += other.failed_connects;
        self.ipv6_connects += other.ipv6_connects;
        self.filtered_connects += other.filtered_connects;
        self.file_opens += other.file_opens;
        self.filtered_opens += other.filtered_opens;
        self
    }
}

/// Outcome of a finished simulation
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub producers: ProducerTally,
    pub connect: ChannelSnapshot,
    pub file_open: ChannelSnapshot,
    pub decode_errors: u64,
    pub forwarded: u64,
}

impl SimulationReport {
    /// Check the channel counters against what the producers did.
    ///
    /// Returns a description of every accounting rule that does not hold.
    pub fn violations(&self) -> Vec<String> {
        let p = &self.producers;
        let mut out = Vec::new();

        let connect_expected = p.connect_attempts - p.failed_connects - p.filtered_connects;
        if self.connect.reserved + self.connect.dropped != connect_expected {
            out.push(format!(
                "connect: reserved {} + dropped {} != admitted {}",
                self.connect.reserved, self.connect.dropped, connect_expected
            ));
        }
        if self.connect.discarded > p.ipv6_connects {
            out.push(format!(
                "connect: discarded {} > ipv6 attempts {}",
                self.connect.discarded, p.ipv6_connects
            ));
        }

        let open_expected = p.file_opens - p.filtered_opens;
        if self.file_open.reserved + self.file_open.dropped != open_expected {
            out.push(format!(
                "file_open: reserved {} + dropped {} != admitted {}",
                self.file_open.reserved, self.file_open.dropped, open_expected
            ));
        }
        if self.file_open.discarded != 0 {
            out.push(format!("file_open: {} records discarded", self.file_open.discarded));
        }

        for (name, c) in [("connect", &self.connect), ("file_open", &self.file_open)] {
            if c.committed + c.discarded != c.reserved {
                out.push(format!(
                    "{name}: committed {} + discarded {} != reserved {}",
                    c.committed, c.discarded, c.reserved
                ));
            }
            if c.consumed != c.committed {
                out.push(format!(
                    "{name}: consumed {} != committed {}",
                    c.consumed, c.committed
                ));
            }
        }

        if self.forwarded + self.decode_errors != self.connect.consumed + self.file_open.consumed {
            out.push(format!(
                "forwarded {} + decode errors {} != consumed {}",
                self.forwarded,
                self.decode_errors,
                self.connect.consumed + self.file_open.consumed
            ));
        }

        out
    }
}

/// Simulated capture source
pub struct Simulator {
    config: SimulatorConfig,
    pipeline: AuditPipeline,
    running: Arc<AtomicBool>,
    // Cleared only once every producer has been joined
    consuming: Arc<AtomicBool>,
    producers: Vec<thread::JoinHandle<ProducerTally>>,
    consumer: Option<JoinHandle<()>>,
    tally: ProducerTally,
}

impl Simulator {
    pub fn new() -> Self {
        Self::with_config(SimulatorConfig::default())
    }

    pub fn with_config(config: SimulatorConfig) -> Self {
        let pipeline = AuditPipeline::new(config.pipeline, config.channel_sizes);
        Self {
            config,
            pipeline,
            running: Arc::new(AtomicBool::new(false)),
            consuming: Arc::new(AtomicBool::new(false)),
            producers: Vec::new(),
            consumer: None,
            tally: ProducerTally::default(),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Flag the producers poll; clearing it makes them wind down so that a
    /// pending [`finish`](Self::finish) returns early.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Wait for the producers to run out of work, then stop the consumer
    /// after its final drain.
    pub async fn finish(&mut self) -> CaptureResult<SimulationReport> {
        self.join_producers().await?;
        self.running.store(false, Ordering::SeqCst);
        self.join_consumer().await?;
        Ok(self.report())
    }

    /// Counters as of now
    pub fn report(&self) -> SimulationReport {
        let metrics = self.pipeline.metrics();
        SimulationReport {
            producers: self.tally,
            connect: metrics.snapshot(EventKind::Connect),
            file_open: metrics.snapshot(EventKind::FileOpen),
            decode_errors: metrics.decode_errors(),
            forwarded: metrics.events_forwarded(),
        }
    }

    async fn join_producers(&mut self) -> CaptureResult<()> {
        let handles = std::mem::take(&mut self.producers);
        if handles.is_empty() {
            return Ok(());
        }

        let tally = tokio::task::spawn_blocking(move || {
            handles
                .into_iter()
                .try_fold(ProducerTally::default(), |acc, handle| {
                    handle.join().map(|t| acc.merge(t))
                })
        })
        .await
        .map_err(|e| CaptureError::Other(e.into()))?
        .map_err(|_| CaptureError::Other(anyhow::anyhow!("producer thread panicked")))?;

        self.tally = self.tally.merge(tally);
        debug!(tally = ?self.tally, "Producers finished");
        Ok(())
    }

    async fn join_consumer(&mut self) -> CaptureResult<()> {
        self.consuming.store(false, Ordering::SeqCst);
        if let Some(task) = self.consumer.take() {
            task.await.map_err(|e| CaptureError::Other(e.into()))?;
        }
        Ok(())
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic spread: true for `ratio` of the indices in any long run.
fn ratio_hit(index: u64, ratio: f64) -> bool {
    let ratio = ratio.clamp(0.0, 1.0);
    ((index + 1) as f64 * ratio).floor() > (index as f64 * ratio).floor()
}

fn destination(producer: usize, index: u64, ipv6: bool) -> SocketAddr {
    if ipv6 {
        let addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, producer as u16, index as u16);
        SocketAddr::from((addr, 443))
    } else {
        let addr = Ipv4Addr::new(10, producer as u8, (index >> 8) as u8, index as u8);
        SocketAddr::from((addr, 443))
    }
}

fn produce(
    producer: usize,
    config: &SimulatorConfig,
    handlers: &HookHandlers,
    clock: MonotonicClock,
    running: &AtomicBool,
) -> ProducerTally {
    let pid = config.base_pid.wrapping_add(producer as u32);
    let source = StaticSource::new(pid, &format!("sim-{producer}"), clock).with_exe(SIMULATED_EXE);
    let admitted = config.pipeline.admits(pid);
    let mut tally = ProducerTally::default();

    let mut index = 0u64;
    while running.load(Ordering::Relaxed) {
        if config.events_per_producer > 0 && index >= config.events_per_producer {
            break;
        }

        let failed = ratio_hit(index, config.fail_ratio);
        let ipv6 = ratio_hit(index, config.ipv6_ratio);
        let outcome = if failed { CONNECT_REFUSED } else { 0 };
        let address = raw_sockaddr(destination(producer, index, ipv6));

        let returned = handlers.on_socket_connect(&source, SocketCookie(index), &address, outcome);
        debug_assert_eq!(returned, outcome);

        tally.connect_attempts += 1;
        if failed {
            tally.failed_connects += 1;
        } else if !admitted {
            tally.filtered_connects += 1;
        } else if ipv6 {
            tally.ipv6_connects += 1;
        }

        let path = SIMULATED_PATHS[index as usize % SIMULATED_PATHS.len()];
        handlers.on_file_open(&source, OpenedFile::new(Path::new(path)));
        tally.file_opens += 1;
        if !admitted {
            tally.filtered_opens += 1;
        }

        index = index.wrapping_add(1);
    }

    tally
}

#[async_trait]
impl CaptureSource for Simulator {
    fn name(&self) -> &str {
        "simulator"
    }

    async fn start(&mut self, tx: mpsc::Sender<AuditEvent>) -> CaptureResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);
        self.consuming.store(true, Ordering::SeqCst);
        info!(
            producers = self.config.producers,
            events_per_producer = self.config.events_per_producer,
            "Starting simulator"
        );

        let consumer = self.pipeline.consumer(self.config.poll_interval);
        self.consumer = Some(tokio::spawn(consumer.run(tx, self.consuming.clone())));

        let clock = MonotonicClock::new();
        for producer in 0..self.config.producers {
            let config = self.config.clone();
            let handlers = self.pipeline.handlers();
            let running = self.running.clone();
            let spawned = thread::Builder::new()
                .name(format!("sim-producer-{producer}"))
                .spawn(move || produce(producer, &config, &handlers, clock, &running));
            match spawned {
                Ok(handle) => self.producers.push(handle),
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    self.join_producers().await?;
                    self.join_consumer().await?;
                    return Err(CaptureError::IoError(e));
                }
            }
        }

        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<()> {
        info!("Stopping simulator...");
        self.running.store(false, Ordering::SeqCst);
        self.join_producers().await?;
        self.join_consumer().await
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn metrics(&self) -> SharedMetrics {
        self.pipeline.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(producers: usize, events: u64) -> SimulatorConfig {
        SimulatorConfig {
            producers,
            events_per_producer: events,
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    async fn run_to_completion(config: SimulatorConfig) -> (SimulationReport, u64) {
        let (tx, mut rx) = mpsc::channel(256);
        let reader = tokio::spawn(async move {
            let mut received = 0u64;
            while rx.recv().await.is_some() {
                received += 1;
            }
            received
        });

        let mut simulator = Simulator::with_config(config);
        simulator.start(tx).await.unwrap();
        let report = simulator.finish().await.unwrap();
        assert!(!simulator.is_running());
        (report, reader.await.unwrap())
    }

    #[test]
    fn test_ratio_hit_spread() {
        let hits = |ratio| (0..100).filter(|&i| ratio_hit(i, ratio)).count();
        assert_eq!(hits(0.0), 0);
        assert_eq!(hits(0.25), 25);
        assert_eq!(hits(0.1), 10);
        assert_eq!(hits(1.0), 100);
        assert_eq!(hits(7.0), 100);
    }

    #[test]
    fn test_destination_family() {
        assert!(destination(1, 300, false).is_ipv4());
        assert!(destination(1, 300, true).is_ipv6());
        assert_eq!(
            destination(3, 0x0102, false),
            SocketAddr::from((Ipv4Addr::new(10, 3, 1, 2), 443))
        );
    }

    #[tokio::test]
    async fn test_simulation_accounts_for_every_attempt() {
        // Channels large enough that nothing is dropped
        let (report, received) = run_to_completion(small(4, 200)).await;
        let p = report.producers;

        assert_eq!(p.connect_attempts, 800);
        assert_eq!(p.failed_connects, 40);
        assert_eq!(p.file_opens, 800);
        assert!(report.violations().is_empty(), "{:?}", report.violations());

        assert_eq!(report.connect.dropped, 0);
        assert_eq!(report.connect.discarded, p.ipv6_connects);
        assert_eq!(report.connect.committed, 800 - 40 - p.ipv6_connects);
        assert_eq!(report.file_open.committed, 800);
        assert_eq!(received, report.connect.committed + report.file_open.committed);
        assert_eq!(received, report.forwarded);
    }

    #[tokio::test]
    async fn test_saturated_channels_stay_consistent() {
        let config = SimulatorConfig {
            channel_sizes: ChannelSizes {
                connect_bytes: 8 * 160,
                file_open_bytes: 8 * 288,
            },
            poll_interval: Duration::from_millis(50),
            ..small(4, 500)
        };
        let (report, received) = run_to_completion(config).await;

        assert!(report.violations().is_empty(), "{:?}", report.violations());
        assert!(report.file_open.dropped > 0);
        assert_eq!(received, report.forwarded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_discards_return_every_slot() {
        // 1024 slots per channel; half the connects target IPv6 and are
        // discarded by whichever producer reserved them.
        let config = SimulatorConfig {
            ipv6_ratio: 0.5,
            fail_ratio: 0.0,
            channel_sizes: ChannelSizes {
                connect_bytes: 1024 * 160,
                file_open_bytes: 1024 * 288,
            },
            ..small(8, 2_000)
        };
        let (tx, mut rx) = mpsc::channel(256);
        let reader = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let mut simulator = Simulator::with_config(config);
        simulator.start(tx).await.unwrap();
        let report = simulator.finish().await.unwrap();
        reader.await.unwrap();

        assert!(report.violations().is_empty(), "{:?}", report.violations());
        assert!(report.connect.discarded > 0);
        for kind in EventKind::ALL {
            let channel = simulator.pipeline.channel(kind);
            assert_eq!(channel.capacity(), 1024);
            assert_eq!(channel.free_slots(), channel.capacity(), "{}", kind);
            assert_eq!(channel.pending(), 0);
        }
    }

    #[tokio::test]
    async fn test_pid_filter_limits_recording() {
        let mut config = small(3, 50);
        config.fail_ratio = 0.0;
        config.ipv6_ratio = 0.0;
        config.pipeline.target_pid = config.base_pid + 1;
        let (report, _) = run_to_completion(config).await;

        assert!(report.violations().is_empty(), "{:?}", report.violations());
        assert_eq!(report.producers.filtered_connects, 100);
        assert_eq!(report.producers.filtered_opens, 100);
        assert_eq!(report.connect.committed, 50);
        assert_eq!(report.file_open.committed, 50);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let mut simulator = Simulator::with_config(small(1, 10));
        let (tx, _rx) = mpsc::channel(1024);
        simulator.start(tx.clone()).await.unwrap();
        assert!(matches!(
            simulator.start(tx).await,
            Err(CaptureError::AlreadyRunning)
        ));
        simulator.stop().await.unwrap();
        assert!(!simulator.is_running());
    }

    #[tokio::test]
    async fn test_stop_interrupts_unbounded_run() {
        let mut simulator = Simulator::with_config(small(2, 0));
        let (tx, mut rx) = mpsc::channel(64);
        simulator.start(tx).await.unwrap();

        let first = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(matches!(first, Ok(Some(_))));

        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        simulator.stop().await.unwrap();
        drain.await.unwrap();

        let report = simulator.report();
        assert!(report.producers.connect_attempts > 0);
        assert!(report.violations().is_empty(), "{:?}", report.violations());
    }
}

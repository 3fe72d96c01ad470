//! BPF LSM capture
//!
//! Loads the `socket_connect` and `file_open` LSM programs, attaches them and
//! drains their ring buffers from an async task. The kernel does the
//! reserve/fill/commit/discard half; this side only consumes.

use async_trait::async_trait;
use aya::maps::{Map, MapData, PerCpuArray, RingBuf};
use aya::programs::Lsm;
use aya::{Btf, Ebpf, EbpfLoader};
use lsm_audit_common::{
    CONNECT_EVENTS_DEFAULT_BYTES, CONNECT_EVENTS_MAP, DROPPED_MAP, DROP_INDEX_CONNECT,
    DROP_INDEX_FILE_OPEN, ENABLE_DEBUG_GLOBAL, FILE_OPEN_EVENTS_DEFAULT_BYTES,
    FILE_OPEN_EVENTS_MAP, PID_TARGET_GLOBAL,
};
use lsm_audit_core::capture::{CaptureError, CaptureResult, CaptureSource};
use lsm_audit_core::config::AuditConfig;
use lsm_audit_core::decode::decode;
use lsm_audit_core::events::AuditEvent;
use lsm_audit_core::metrics::{create_metrics, MetricsCollector, SharedMetrics};
use lsm_audit_core::pipeline::PipelineConfig;
use lsm_audit_core::schema::EventKind;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// LSM hooks and the programs attached to them
const PROGRAMS: [&str; 2] = ["socket_connect", "file_open"];

/// How often drop counters are refreshed and the stop flag checked
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(250);

/// Configuration for the LSM capture source
#[derive(Debug, Clone)]
pub struct LsmCaptureConfig {
    /// Compiled kernel programs (bpfel object file)
    pub ebpf_path: Option<PathBuf>,
    /// Written into the programs' globals before load
    pub pipeline: PipelineConfig,
    pub connect_bytes: u32,
    pub file_open_bytes: u32,
}

impl Default for LsmCaptureConfig {
    fn default() -> Self {
        Self {
            ebpf_path: None,
            pipeline: PipelineConfig::default(),
            connect_bytes: CONNECT_EVENTS_DEFAULT_BYTES,
            file_open_bytes: FILE_OPEN_EVENTS_DEFAULT_BYTES,
        }
    }
}

impl LsmCaptureConfig {
    pub fn from_config(config: &AuditConfig) -> Self {
        Self {
            ebpf_path: config.capture.ebpf_path.as_ref().map(PathBuf::from),
            pipeline: config.pipeline_config(),
            connect_bytes: config.channels.connect_bytes,
            file_open_bytes: config.channels.file_open_bytes,
        }
    }
}

/// Kernel capture source backed by BPF LSM programs
pub struct LsmCapture {
    config: LsmCaptureConfig,
    running: Arc<AtomicBool>,
    metrics: SharedMetrics,
    task: Option<JoinHandle<()>>,
}

fn init_failed<E: Display>(what: &str) -> impl FnOnce(E) -> CaptureError + '_ {
    move |e| CaptureError::InitializationFailed(format!("{}: {}", what, e))
}

impl LsmCapture {
    pub fn new() -> Self {
        Self::with_config(LsmCaptureConfig::default())
    }

    pub fn with_config(config: LsmCaptureConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            metrics: create_metrics(),
            task: None,
        }
    }

    /// Bump the memlock rlimit (required for older kernels)
    fn bump_memlock_rlimit() -> bool {
        let rlim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
        if ret != 0 {
            warn!("Failed to remove limit on locked memory (ret={})", ret);
            false
        } else {
            true
        }
    }

    /// Read the object file and load it with this configuration's globals
    /// and ring buffer sizes. Nothing is attached yet.
    fn load(&self) -> CaptureResult<Ebpf> {
        let path = self.config.ebpf_path.as_ref().ok_or_else(|| {
            CaptureError::InitializationFailed(
                "eBPF object path not configured (set capture.ebpf_path or pass --ebpf-path)"
                    .into(),
            )
        })?;
        let bytecode = std::fs::read(path).map_err(|e| {
            CaptureError::InitializationFailed(format!(
                "Failed to read eBPF object from {}: {}",
                path.display(),
                e
            ))
        })?;

        let enable_debug = u8::from(self.config.pipeline.debug_tracing);
        let target_pid = self.config.pipeline.target_pid;
        info!(
            bytes = bytecode.len(),
            debug = self.config.pipeline.debug_tracing,
            target_pid,
            "Loading LSM programs"
        );

        EbpfLoader::new()
            .set_global(ENABLE_DEBUG_GLOBAL, &enable_debug, true)
            .set_global(PID_TARGET_GLOBAL, &target_pid, true)
            .set_max_entries(CONNECT_EVENTS_MAP, self.config.connect_bytes)
            .set_max_entries(FILE_OPEN_EVENTS_MAP, self.config.file_open_bytes)
            .load(&bytecode)
            .map_err(init_failed("Failed to load eBPF object"))
    }

    fn attach(ebpf: &mut Ebpf) -> CaptureResult<()> {
        let btf = Btf::from_sys_fs().map_err(init_failed("Failed to read kernel BTF"))?;
        for hook in PROGRAMS {
            let program: &mut Lsm = ebpf
                .program_mut(hook)
                .ok_or_else(|| {
                    CaptureError::InitializationFailed(format!("{} program not found", hook))
                })?
                .try_into()
                .map_err(|e| {
                    CaptureError::InitializationFailed(format!(
                        "{} is not an LSM program: {}",
                        hook, e
                    ))
                })?;
            program.load(hook, &btf).map_err(|e| {
                CaptureError::InitializationFailed(format!("Failed to load {}: {}", hook, e))
            })?;
            program.attach().map_err(|e| {
                CaptureError::InitializationFailed(format!("Failed to attach {}: {}", hook, e))
            })?;
            info!("Attached LSM program to {}", hook);
        }
        Ok(())
    }

    fn take_map(ebpf: &mut Ebpf, name: &str) -> CaptureResult<Map> {
        ebpf.take_map(name).ok_or_else(|| {
            CaptureError::InitializationFailed(format!("{} map not found", name))
        })
    }
}

impl Default for LsmCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the drain task owns. Keeping `ebpf` here keeps the programs
/// attached for as long as the task runs.
struct Drain {
    _ebpf: Ebpf,
    connect: AsyncFd<RingBuf<MapData>>,
    file_open: AsyncFd<RingBuf<MapData>>,
    dropped: PerCpuArray<MapData, u64>,
    metrics: SharedMetrics,
}

/// Pop every record currently visible in `ring`, oldest first.
fn drain_ring(
    ring: &mut RingBuf<MapData>,
    kind: EventKind,
    metrics: &MetricsCollector,
    out: &mut Vec<AuditEvent>,
) {
    let stats = metrics.channel(kind);
    while let Some(item) = ring.next() {
        // The kernel only exposes committed records
        stats.committed.fetch_add(1, Ordering::Relaxed);
        stats.consumed.fetch_add(1, Ordering::Relaxed);
        match decode(kind, &item) {
            Ok(event) => out.push(event),
            Err(e) => {
                metrics.consumer.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(channel = kind.channel_name(), "Dropping record: {}", e);
            }
        }
    }
}

/// Sum the per-CPU drop counters into the channel stats
fn refresh_dropped(dropped: &PerCpuArray<MapData, u64>, metrics: &MetricsCollector) {
    for (kind, index) in [
        (EventKind::Connect, DROP_INDEX_CONNECT),
        (EventKind::FileOpen, DROP_INDEX_FILE_OPEN),
    ] {
        match dropped.get(&index, 0) {
            Ok(per_cpu) => metrics.channel(kind).set_dropped(per_cpu.iter().sum()),
            Err(e) => debug!("Failed to read {} drop counter: {}", kind, e),
        }
    }
}

impl Drain {
    async fn forward(&self, batch: Vec<AuditEvent>, tx: &mpsc::Sender<AuditEvent>) -> bool {
        for event in batch {
            if tx.send(event).await.is_err() {
                return false;
            }
            self.metrics
                .consumer
                .events_forwarded
                .fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    async fn run(mut self, tx: mpsc::Sender<AuditEvent>, running: Arc<AtomicBool>) {
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        info!("LSM capture started, polling ring buffers...");

        loop {
            let mut batch = Vec::new();
            let mut stopping = false;

            tokio::select! {
                guard = self.connect.readable_mut() => match guard {
                    Ok(mut guard) => {
                        drain_ring(guard.get_inner_mut(), EventKind::Connect, &self.metrics, &mut batch);
                        guard.clear_ready();
                    }
                    Err(e) => {
                        error!("Connect ring buffer poll failed: {}", e);
                        stopping = true;
                    }
                },
                guard = self.file_open.readable_mut() => match guard {
                    Ok(mut guard) => {
                        drain_ring(guard.get_inner_mut(), EventKind::FileOpen, &self.metrics, &mut batch);
                        guard.clear_ready();
                    }
                    Err(e) => {
                        error!("File-open ring buffer poll failed: {}", e);
                        stopping = true;
                    }
                },
                _ = housekeeping.tick() => {
                    refresh_dropped(&self.dropped, &self.metrics);
                    stopping = !running.load(Ordering::SeqCst);
                }
            }

            if stopping {
                // Whatever the hooks committed before we noticed
                drain_ring(self.connect.get_mut(), EventKind::Connect, &self.metrics, &mut batch);
                drain_ring(self.file_open.get_mut(), EventKind::FileOpen, &self.metrics, &mut batch);
                refresh_dropped(&self.dropped, &self.metrics);
            }

            if !self.forward(batch, &tx).await {
                debug!("Event receiver closed, LSM capture exiting");
                break;
            }
            if stopping {
                break;
            }
        }

        running.store(false, Ordering::SeqCst);
        info!(
            forwarded = self.metrics.events_forwarded(),
            decode_errors = self.metrics.decode_errors(),
            "LSM capture stopped"
        );
    }
}

#[async_trait]
impl CaptureSource for LsmCapture {
    fn name(&self) -> &str {
        "bpf-lsm"
    }

    fn is_available(&self) -> bool {
        crate::host::check_lsm_available()
    }

    async fn start(&mut self, tx: mpsc::Sender<AuditEvent>) -> CaptureResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::AlreadyRunning);
        }

        info!("Starting BPF LSM capture...");
        Self::bump_memlock_rlimit();

        let mut ebpf = self.load()?;
        Self::attach(&mut ebpf)?;

        let connect = RingBuf::try_from(Self::take_map(&mut ebpf, CONNECT_EVENTS_MAP)?)
            .map_err(init_failed("Failed to open connect ring buffer"))?;
        let file_open = RingBuf::try_from(Self::take_map(&mut ebpf, FILE_OPEN_EVENTS_MAP)?)
            .map_err(init_failed("Failed to open file-open ring buffer"))?;
        let dropped = PerCpuArray::try_from(Self::take_map(&mut ebpf, DROPPED_MAP)?)
            .map_err(init_failed("Failed to open drop counters"))?;

        let drain = Drain {
            _ebpf: ebpf,
            connect: AsyncFd::new(connect)?,
            file_open: AsyncFd::new(file_open)?,
            dropped,
            metrics: self.metrics.clone(),
        };

        self.running.store(true, Ordering::SeqCst);
        self.task = Some(tokio::spawn(drain.run(tx, self.running.clone())));
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<()> {
        info!("Stopping BPF LSM capture...");
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| CaptureError::Other(e.into()))?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }
}

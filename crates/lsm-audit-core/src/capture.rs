//! Capture source trait
//!
//! A capture source owns a pair of channels (userspace or kernel), runs the
//! consumer for them and forwards decoded events.

use crate::events::AuditEvent;
use crate::metrics::SharedMetrics;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capture error type
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Capture already running")]
    AlreadyRunning,

    #[error("Capture not supported: {0}")]
    NotSupported(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type CaptureResult<T> = Result<T, CaptureError>;

#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Source name
    fn name(&self) -> &str;

    /// Whether this source can run on this host
    fn is_available(&self) -> bool {
        true
    }

    /// Start capturing events
    async fn start(&mut self, tx: mpsc::Sender<AuditEvent>) -> CaptureResult<()>;

    /// Stop capturing and wait for the consumer to finish draining
    async fn stop(&mut self) -> CaptureResult<()>;

    /// Check if capture is running
    fn is_running(&self) -> bool;

    /// Counters for this source's channels
    fn metrics(&self) -> SharedMetrics;
}

//! lsm-audit core - channels, hook handlers and the consumer
//!
//! This crate provides the userspace half of the audit pipeline:
//!
//! - **Channels**: bounded reserve/commit/discard ring channels
//! - **Hooks**: fail-open handlers for connect and file-open decisions
//! - **Context**: the capability handlers use to identify the caller
//! - **Consumer**: async drain, defensive decode and forwarding
//! - **Config**: TOML configuration with environment overrides

pub mod capture;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod context;
pub mod decode;
pub mod events;
pub mod hooks;
pub mod metrics;
pub mod pipeline;
pub mod schema;

// Re-export commonly used types
pub use capture::{CaptureError, CaptureResult, CaptureSource};
pub use channel::{CommittedRecord, RingChannel, Slot};
pub use config::{AuditConfig, ConfigError, ConfigLoader};
pub use consumer::Consumer;
pub use context::{ContextUnavailable, EventSource, MonotonicClock, StaticSource};
pub use decode::{decode, DecodeError};
pub use events::{AuditEvent, ConnectRecord, FileOpenRecord};
pub use hooks::{raw_sockaddr, HookHandlers, OpenedFile, SocketCookie};
pub use metrics::{create_metrics, ChannelSnapshot, MetricsCollector, SharedMetrics};
pub use pipeline::{AuditPipeline, ChannelSizes, PipelineConfig};
pub use schema::{EventKind, Record};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

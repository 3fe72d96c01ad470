//! Record kinds and the plain-old-data contract for channel payloads

use lsm_audit_common::{ConnectEvent, FileOpenEvent};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which hook produced a record. Each kind has its own channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connect,
    FileOpen,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::Connect, EventKind::FileOpen];

    /// Name of the output channel carrying this kind
    pub fn channel_name(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect-events",
            EventKind::FileOpen => "file-open-events",
        }
    }

    /// Fixed record size in bytes
    pub fn record_size(&self) -> usize {
        match self {
            EventKind::Connect => std::mem::size_of::<ConnectEvent>(),
            EventKind::FileOpen => std::mem::size_of::<FileOpenEvent>(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Connect => write!(f, "connect"),
            EventKind::FileOpen => write!(f, "file_open"),
        }
    }
}

/// Fixed-layout record that can live in a channel slot.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers or references,
/// have an alignment of at most 8, and accept every bit pattern as a valid
/// value. Slots are written in place and read back with an unaligned copy.
pub unsafe trait Record: Copy + Send + 'static {
    const KIND: EventKind;
}

unsafe impl Record for ConnectEvent {
    const KIND: EventKind = EventKind::Connect;
}

unsafe impl Record for FileOpenEvent {
    const KIND: EventKind = EventKind::FileOpen;
}

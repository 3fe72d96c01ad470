//! Decoded audit events handed to downstream consumers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use ulid::Ulid;

use crate::schema::EventKind;

/// A decoded record from either channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    #[serde(rename = "network.connect")]
    Connect(ConnectRecord),
    #[serde(rename = "file.open")]
    FileOpen(FileOpenRecord),
}

impl AuditEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AuditEvent::Connect(_) => EventKind::Connect,
            AuditEvent::FileOpen(_) => EventKind::FileOpen,
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            AuditEvent::Connect(r) => r.pid,
            AuditEvent::FileOpen(r) => r.pid,
        }
    }

    pub fn timestamp_ns(&self) -> u64 {
        match self {
            AuditEvent::Connect(r) => r.timestamp_ns,
            AuditEvent::FileOpen(r) => r.timestamp_ns,
        }
    }
}

/// Outbound IPv4 connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRecord {
    pub id: Ulid,
    pub observed_at: DateTime<Utc>,
    /// Monotonic nanoseconds from the hook
    pub timestamp_ns: u64,
    pub pid: u32,
    pub comm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exe: Option<String>,
    pub dst_ip: Ipv4Addr,
}

/// File open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOpenRecord {
    pub id: Ulid,
    pub observed_at: DateTime<Utc>,
    pub timestamp_ns: u64,
    pub pid: u32,
    pub comm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exe: Option<String>,
    pub path: String,
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEvent::Connect(r) => write!(
                f,
                "[{}] connect pid={} comm={:?} exe={:?} dst={}",
                r.timestamp_ns,
                r.pid,
                r.comm,
                r.exe.as_deref().unwrap_or(""),
                r.dst_ip
            ),
            AuditEvent::FileOpen(r) => write!(
                f,
                "[{}] open pid={} comm={:?} exe={:?} path={:?}",
                r.timestamp_ns,
                r.pid,
                r.comm,
                r.exe.as_deref().unwrap_or(""),
                r.path
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect() -> AuditEvent {
        AuditEvent::Connect(ConnectRecord {
            id: Ulid::new(),
            observed_at: Utc::now(),
            timestamp_ns: 1_000,
            pid: 42,
            comm: "curl".to_string(),
            exe: None,
            dst_ip: Ipv4Addr::new(93, 184, 216, 34),
        })
    }

    #[test]
    fn test_serialized_tag() {
        let json = serde_json::to_value(connect()).unwrap();
        assert_eq!(json["event_type"], "network.connect");
        assert_eq!(json["dst_ip"], "93.184.216.34");
        assert!(json.get("exe").is_none());
    }

    #[test]
    fn test_deserialize_file_open() {
        let json = serde_json::json!({
            "event_type": "file.open",
            "id": Ulid::new().to_string(),
            "observed_at": "2026-01-01T00:00:00Z",
            "timestamp_ns": 5,
            "pid": 7,
            "comm": "cat",
            "exe": "/usr/bin/cat",
            "path": "/etc/hosts",
        });
        let event: AuditEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.kind(), EventKind::FileOpen);
        assert_eq!(event.pid(), 7);
        assert_eq!(event.timestamp_ns(), 5);
    }

    #[test]
    fn test_display() {
        let line = connect().to_string();
        assert!(line.starts_with("[1000] connect pid=42"));
        assert!(line.ends_with("dst=93.184.216.34"));
    }
}

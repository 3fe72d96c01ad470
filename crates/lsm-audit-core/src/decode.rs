//! Defensive decoding of fixed-layout records
//!
//! Input bytes come from a shared buffer and are not trusted: the length is
//! checked against the schema size before anything is read, reads are
//! unaligned copies, and string fields never extend past their bound.

use crate::events::{AuditEvent, ConnectRecord, FileOpenRecord};
use crate::schema::{EventKind, Record};
use chrono::Utc;
use lsm_audit_common::{until_nul, ConnectEvent, FileOpenEvent};
use std::mem;
use std::net::Ipv4Addr;
use std::ptr;
use thiserror::Error;
use ulid::Ulid;

/// Decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{kind} record truncated: {actual} bytes, need {expected}")]
    Truncated {
        kind: EventKind,
        expected: usize,
        actual: usize,
    },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

fn read_record<T: Record>(bytes: &[u8]) -> DecodeResult<T> {
    let expected = mem::size_of::<T>();
    if bytes.len() < expected {
        return Err(DecodeError::Truncated {
            kind: T::KIND,
            expected,
            actual: bytes.len(),
        });
    }
    // SAFETY: length checked above; `Record` types accept any bit pattern.
    Ok(unsafe { ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}

/// Bounded, lossy string from a NUL-padded field
pub fn field_string(field: &[u8]) -> String {
    String::from_utf8_lossy(until_nul(field)).into_owned()
}

fn optional_field(field: &[u8]) -> Option<String> {
    let s = until_nul(field);
    (!s.is_empty()).then(|| String::from_utf8_lossy(s).into_owned())
}

pub fn decode_connect(bytes: &[u8]) -> DecodeResult<ConnectRecord> {
    let raw: ConnectEvent = read_record(bytes)?;
    Ok(ConnectRecord {
        id: Ulid::new(),
        observed_at: Utc::now(),
        timestamp_ns: raw.timestamp_ns,
        pid: raw.pid,
        comm: field_string(&raw.comm),
        exe: optional_field(&raw.exe),
        dst_ip: Ipv4Addr::from(raw.dst_ip),
    })
}

pub fn decode_file_open(bytes: &[u8]) -> DecodeResult<FileOpenRecord> {
    let raw: FileOpenEvent = read_record(bytes)?;
    Ok(FileOpenRecord {
        id: Ulid::new(),
        observed_at: Utc::now(),
        timestamp_ns: raw.timestamp_ns,
        pid: raw.pid,
        comm: field_string(&raw.comm),
        exe: optional_field(&raw.exe),
        path: field_string(&raw.path),
    })
}

/// Decode a record taken from the channel carrying `kind`
pub fn decode(kind: EventKind, bytes: &[u8]) -> DecodeResult<AuditEvent> {
    match kind {
        EventKind::Connect => decode_connect(bytes).map(AuditEvent::Connect),
        EventKind::FileOpen => decode_file_open(bytes).map(AuditEvent::FileOpen),
    }
}

//! Listening-socket handoff for zero-downtime binary upgrade.
//!
//! The parent serializes `{address, fd_index, file_name}` records into
//! an environment variable and arranges for each duplicated descriptor
//! to appear at `fd_index` in the child (3 onward, after the stdio
//! triple). The child reconstructs the listeners and feeds them to
//! `Mux::take_files` before `start`, so no address is ever unbound.

use std::os::fd::{AsRawFd, FromRawFd};

use serde::{Deserialize, Serialize};

use crate::error::MuxError;
use crate::graph::Address;

/// Environment variable carrying the serialized records to the child.
pub const FILES_ENV: &str = "ROUTEGATE_FILES";

/// A bound listening socket tagged with the address it serves.
#[derive(Debug)]
pub struct FileDescriptor {
    pub address: Address,
    pub file: std::net::TcpListener,
}

impl FileDescriptor {
    pub fn raw_fd(&self) -> i32 {
        self.file.as_raw_fd()
    }
}

/// Wire form of one passed descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub address: Address,
    /// Descriptor number in the child. The first three are stdin,
    /// stdout and stderr, so passed files count up from 3.
    pub fd_index: i32,
    pub file_name: String,
}

/// Serialize descriptors for the child's environment. Indices are
/// assigned by position, starting at 3.
pub fn files_to_string(files: &[FileDescriptor]) -> Result<String, MuxError> {
    let records: Vec<FileRecord> = files
        .iter()
        .enumerate()
        .map(|(i, f)| FileRecord {
            address: f.address.clone(),
            fd_index: i as i32 + 3,
            file_name: f.address.address.clone(),
        })
        .collect();
    records_to_string(&records)
}

pub fn records_to_string(records: &[FileRecord]) -> Result<String, MuxError> {
    serde_json::to_string(records)
        .map_err(|e| MuxError::internal(format!("failed to serialize files: {}", e)))
}

pub fn records_from_string(input: &str) -> Result<Vec<FileRecord>, MuxError> {
    serde_json::from_str(input)
        .map_err(|e| MuxError::invalid_argument(format!("failed to parse files: {}", e)))
}

/// Turn wire records back into live listeners.
///
/// # Safety
///
/// Each `fd_index` must refer to an inherited, open listening socket
/// that nothing else owns; the returned listeners take ownership.
pub unsafe fn files_from_records(records: Vec<FileRecord>) -> Vec<FileDescriptor> {
    records
        .into_iter()
        .map(|record| FileDescriptor {
            address: record.address,
            file: std::net::TcpListener::from_raw_fd(record.fd_index),
        })
        .collect()
}

/// Read inherited descriptors from the environment, if the parent
/// passed any.
pub fn files_from_env() -> Result<Vec<FileDescriptor>, MuxError> {
    let payload = match std::env::var(FILES_ENV) {
        Ok(value) if !value.is_empty() => value,
        _ => return Ok(Vec::new()),
    };
    let records = records_from_string(&payload)?;
    // Safety: the parent placed exactly these descriptors at these
    // indices via dup2 before exec.
    Ok(unsafe { files_from_records(records) })
}

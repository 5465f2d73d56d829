//! Connection registry
//!
//! Maps connection ids to their records. Callers only ever see
//! [`ConnectionSnapshot`] copies; the live record stays behind the lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{mpsc, RwLock, RwLockWriteGuard};
use tracing::debug;

/// Connection status as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    AuthError,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::AuthError => "auth_error",
        };
        f.write_str(s)
    }
}

/// Handle to a running tunnel process.
///
/// The monitor task owns the child itself; this handle only carries the pid
/// and the channel used to ask the monitor to terminate it.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stop_tx: mpsc::UnboundedSender<()>,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Option<u32>, stop_tx: mpsc::UnboundedSender<()>) -> Self {
        Self { pid, stop_tx }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the monitor to terminate the process. Returns false if the
    /// monitor has already finished.
    pub(crate) fn request_stop(&self) -> bool {
        self.stop_tx.send(()).is_ok()
    }
}

/// Live registry entry
#[derive(Debug)]
pub(crate) struct ConnectionRecord {
    pub status: ConnectionStatus,
    pub process: Option<ProcessHandle>,
    pub started_at: DateTime<Utc>,
    /// Set while a start is staging credentials and spawning; cleared once
    /// the process handle is stored or the start fails.
    pub launching: bool,
}

impl ConnectionRecord {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            process: None,
            started_at: Utc::now(),
            launching: false,
        }
    }

    /// A record that is claimed by a start in progress
    pub fn launching() -> Self {
        Self { launching: true, ..Self::new() }
    }

    /// True while a tunnel process is running or about to be spawned
    pub fn is_active(&self) -> bool {
        self.launching || self.process.is_some()
    }

    pub fn snapshot(&self, id: &str) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: id.to_string(),
            status: self.status,
            pid: self.process.as_ref().and_then(|p| p.pid()),
            started_at: self.started_at,
        }
    }
}

/// Point-in-time copy of a connection record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub id: String,
    pub status: ConnectionStatus,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Owner of all connection records
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    records: RwLock<HashMap<String, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access for the start sequence. Held only for the
    /// check-and-claim step and for storing the spawned handle.
    pub(crate) async fn lock(&self) -> RwLockWriteGuard<'_, HashMap<String, ConnectionRecord>> {
        self.records.write().await
    }

    pub async fn get(&self, id: &str) -> Option<ConnectionSnapshot> {
        self.records.read().await.get(id).map(|r| r.snapshot(id))
    }

    pub async fn list(&self) -> Vec<ConnectionSnapshot> {
        let records = self.records.read().await;
        let mut list: Vec<_> = records.iter().map(|(id, r)| r.snapshot(id)).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn set_status(&self, id: &str, status: ConnectionStatus) {
        if let Some(record) = self.records.write().await.get_mut(id) {
            if record.status != status {
                debug!("Connection {} status {} -> {}", id, record.status, status);
                record.status = status;
            }
        }
    }

    /// Request termination of the process behind `id`. Returns false when
    /// there is no record or no process to stop.
    pub async fn request_stop(&self, id: &str) -> bool {
        let records = self.records.read().await;
        match records.get(id).and_then(|r| r.process.as_ref()) {
            Some(process) => process.request_stop(),
            None => false,
        }
    }

    /// Request termination of every live process, returning how many were asked.
    pub async fn request_stop_all(&self) -> usize {
        let records = self.records.read().await;
        records
            .values()
            .filter_map(|r| r.process.as_ref())
            .filter(|p| p.request_stop())
            .count()
    }

    /// Drop the record for `id`. An already removed record is ignored.
    pub async fn remove(&self, id: &str) {
        if self.records.write().await.remove(id).is_some() {
            debug!("Removed connection record {}", id);
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

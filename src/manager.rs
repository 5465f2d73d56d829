//! Connection manager - starts, stops and tracks tunnel connections
//!
//! This is the facade the host service wrapper and the control surface talk
//! to. It owns the connection registry and the adapter inventory; per
//! connection work happens in the supervisor's monitor tasks.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterCounts, AdapterInventory};
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::config::ServiceConfig;
use crate::credentials;
use crate::error::{TunsvcError, TunsvcResult};
use crate::network_reset::NetworkReset;
use crate::registry::{ConnectionRecord, ConnectionRegistry, ConnectionSnapshot, ConnectionStatus};
use crate::supervisor;

/// Connection manager
pub struct ConnectionManager {
    config: ServiceConfig,
    registry: Arc<ConnectionRegistry>,
    adapters: AdapterInventory,
    network_reset: NetworkReset,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Create a manager that runs external commands on the host
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemCommandRunner))
    }

    /// Create a manager with a custom command runner for adapter listing and
    /// network reset
    pub fn with_runner(config: ServiceConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            adapters: AdapterInventory::new(config.adapters.clone(), runner.clone()),
            network_reset: NetworkReset::new(config.network_reset.clone(), runner),
            registry: Arc::new(ConnectionRegistry::new()),
            config,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Start the tunnel for profile `id`.
    ///
    /// If the profile already has a running process, or another start for it
    /// is in progress, its current record is returned and nothing is spawned.
    /// Otherwise the tunnel is launched and the call waits up to the connect
    /// timeout for the first status marker. Timing out is not an error; the
    /// snapshot then still says `connecting`.
    pub async fn start_profile(
        &self,
        id: &str,
        config_path: &Path,
        password: Option<&str>,
    ) -> TunsvcResult<ConnectionSnapshot> {
        if id.is_empty() {
            return Err(TunsvcError::InvalidParameter("Connection id cannot be empty".to_string()));
        }
        if config_path.as_os_str().is_empty() {
            return Err(TunsvcError::InvalidParameter("Profile path cannot be empty".to_string()));
        }

        let tunnel = &self.config.tunnel;
        let password = password.filter(|p| !p.is_empty());
        ensure_distinct_from_profile(config_path, &tunnel.log_extension, "log")?;
        if password.is_some() {
            ensure_distinct_from_profile(config_path, &tunnel.credential_extension, "credential")?;
        }

        info!("Starting profile {} ({:?})", id, config_path);

        let started_at = {
            let mut records = self.registry.lock().await;
            if let Some(record) = records.get(id) {
                if record.is_active() {
                    debug!("Profile {} is already running or starting", id);
                    return Ok(record.snapshot(id));
                }
            }
            let record = ConnectionRecord::launching();
            let started_at = record.started_at;
            records.insert(id.to_string(), record);
            started_at
        };

        let staged = match password {
            Some(password) => {
                match credentials::stage(
                    config_path,
                    &tunnel.credential_extension,
                    &tunnel.credential_username,
                    password,
                )
                .await
                {
                    Ok(staged) => Some(staged),
                    Err(e) => {
                        error!("Profile {}: {}", id, e);
                        self.registry.remove(id).await;
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let (started, pid) = {
            let mut records = self.registry.lock().await;

            let child = match supervisor::spawn_tunnel(tunnel, config_path, staged.as_ref().map(|c| c.path())) {
                Ok(child) => child,
                Err(e) => {
                    error!("Profile {}: {}", id, e);
                    records.remove(id);
                    drop(records);
                    if let Some(staged) = staged {
                        staged.discard().await;
                    }
                    return Err(e);
                }
            };

            // The monitor needs this lock to touch the record, so the handle
            // is stored before it can report or remove anything.
            let (handle, started) = supervisor::supervise(
                id.to_string(),
                child,
                supervisor::log_path(config_path, &tunnel.log_extension),
                staged,
                self.registry.clone(),
            );
            let pid = handle.pid();
            if let Some(record) = records.get_mut(id) {
                record.process = Some(handle);
                record.launching = false;
            }
            (started, pid)
        };

        let signaled = match tokio::time::timeout(tunnel.connect_timeout(), started).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(_)) => {
                warn!("Profile {}: tunnel exited before reporting a status", id);
                None
            }
            Err(_) => {
                info!("Profile {}: still connecting after {:?}", id, tunnel.connect_timeout());
                None
            }
        };

        Ok(match self.registry.get(id).await {
            Some(snapshot) => snapshot,
            None => ConnectionSnapshot {
                id: id.to_string(),
                status: signaled.unwrap_or(ConnectionStatus::Disconnected),
                pid,
                started_at,
            },
        })
    }

    /// Request termination of the tunnel for `id`.
    ///
    /// Does not wait for the process; its monitor removes the record once
    /// the process has exited. Unknown ids are ignored.
    pub async fn stop_profile(&self, id: &str) {
        if self.registry.request_stop(id).await {
            info!("Stop requested for profile {}", id);
        } else {
            debug!("Stop for profile {} ignored: no running tunnel", id);
        }
    }

    /// Request termination of every running tunnel
    pub async fn stop_all(&self) {
        let count = self.registry.request_stop_all().await;
        if count > 0 {
            info!("Stop requested for {} tunnel(s)", count);
        }
    }

    /// Snapshot of one connection
    pub async fn status(&self, id: &str) -> Option<ConnectionSnapshot> {
        self.registry.get(id).await
    }

    /// Snapshots of all connections, sorted by id
    pub async fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.registry.list().await
    }

    /// Re-read the virtual adapter inventory
    pub async fn update_adapter_inventory(&self) -> AdapterCounts {
        self.adapters.refresh().await
    }

    /// Last known adapter counts
    pub async fn adapter_counts(&self) -> AdapterCounts {
        self.adapters.counts().await
    }

    /// Run the network reset batch, returning how many commands failed
    pub async fn reset_networking(&self) -> usize {
        self.network_reset.run().await
    }

    /// Service start hook: refresh the adapter inventory, then idle until
    /// [`stop`](Self::stop) is called.
    pub async fn start(&self) {
        let counts = self.update_adapter_inventory().await;
        info!("Current tunnel adapters: {}/{}", counts.used, counts.available);

        let mut shutdown = self.shutdown_tx.subscribe();
        if shutdown.wait_for(|stop| *stop).await.is_err() {
            warn!("Shutdown channel closed");
        }
        info!("Connection manager stopping");
    }

    /// Service stop hook: release [`start`](Self::start)
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Reject a profile whose own extension is the one used for a derived
/// artifact, since that artifact would then be the profile file itself.
fn ensure_distinct_from_profile(config_path: &Path, extension: &str, artifact: &str) -> TunsvcResult<()> {
    let clashes = config_path
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension))
        .unwrap_or(false);
    if clashes {
        return Err(TunsvcError::InvalidParameter(format!(
            "Profile {} uses the .{} extension reserved for the {} file",
            config_path.display(),
            extension,
            artifact
        )));
    }
    Ok(())
}

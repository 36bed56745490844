//! MCP server lifecycle management
//!
//! Drives each descriptor through
//! `disconnected -> connecting -> connected | error`, provisioning sandboxes
//! for local commands and writing the outcome back to the registry.
//!
//! Operations on one id are serialized through a per-id FIFO lock, so a
//! `stop` queued behind a `start` runs after it. Different ids proceed
//! independently.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use toolchat_core::{RetryConfig, Sleeper, TokioSleeper};
use tracing::{debug, info, instrument, warn};

use super::probe::HealthProbe;
use super::registry::{
    materialize, DescriptorPatch, RegistryError, ServerId, ServerRegistry, ServerStatus, ToolServerDescriptor,
    Transport,
};
use super::sandbox::{SandboxHandle, SandboxProvisioner};

pub struct ServerLifecycleManager {
    registry: Arc<ServerRegistry>,
    probe: Arc<dyn HealthProbe>,
    provisioner: Option<Arc<SandboxProvisioner>>,
    retry: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
    /// Live sandboxes, at most one per descriptor
    sandboxes: DashMap<ServerId, SandboxHandle>,
    locks: DashMap<ServerId, Arc<Mutex<()>>>,
}

impl ServerLifecycleManager {
    pub fn new(
        registry: Arc<ServerRegistry>,
        probe: Arc<dyn HealthProbe>,
        provisioner: Option<Arc<SandboxProvisioner>>,
    ) -> Self {
        Self {
            registry,
            probe,
            provisioner,
            retry: RetryConfig::default(),
            sleeper: Arc::new(TokioSleeper),
            sandboxes: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn sandbox_for(&self, id: &ServerId) -> Option<SandboxHandle> {
        self.sandboxes.get(id).map(|h| h.clone())
    }

    pub fn live_sandboxes(&self) -> usize {
        self.sandboxes.len()
    }

    fn lock_for(&self, id: &ServerId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.clone()).or_default().value())
    }

    /// Bring a server to `connected`; failures end in `error` and `false`
    #[instrument(skip_all, fields(server = %id))]
    pub async fn start(&self, id: &ServerId) -> bool {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.start_locked(id).await
    }

    /// Tear a server down to `disconnected`
    ///
    /// Returns false only for an unknown id. Stopping an already
    /// disconnected server changes nothing.
    #[instrument(skip_all, fields(server = %id))]
    pub async fn stop(&self, id: &ServerId) -> bool {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.stop_locked(id).await
    }

    /// Stop, wait for the settle delay, start again
    ///
    /// Only applies to servers that are connected or connecting.
    #[instrument(skip_all, fields(server = %id))]
    pub async fn restart(&self, id: &ServerId) -> bool {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(descriptor) = self.registry.get(id) else {
            warn!("Restart requested for unknown server");
            return false;
        };
        if !matches!(
            descriptor.status,
            ServerStatus::Connected | ServerStatus::Connecting
        ) {
            debug!(status = %descriptor.status, "Restart skipped");
            return false;
        }

        self.stop_locked(id).await;
        self.sleeper.sleep(self.retry.settle_delay()).await;
        self.start_locked(id).await
    }

    /// Replace the active set and auto-start newly added servers
    ///
    /// Starts run in the background; their outcome lands in the registry.
    /// Servers leaving the set keep running until stopped explicitly.
    pub fn set_active_servers(
        self: &Arc<Self>,
        ids: &[ServerId],
    ) -> Result<Vec<JoinHandle<bool>>, RegistryError> {
        let previous = self.registry.active();
        self.registry.set_active(ids)?;

        let mut started = Vec::new();
        for id in ids {
            if previous.contains(id) {
                continue;
            }
            let connected = self
                .registry
                .get(id)
                .is_some_and(|d| d.status == ServerStatus::Connected);
            if connected {
                continue;
            }

            debug!(server = %id, "Auto-starting newly activated server");
            let manager = Arc::clone(self);
            let id = id.clone();
            started.push(tokio::spawn(async move { manager.start(&id).await }));
        }
        Ok(started)
    }

    /// Edit a descriptor; a transport change stops the server first
    #[instrument(skip_all, fields(server = %id))]
    pub async fn update_server(&self, id: &ServerId, patch: DescriptorPatch) -> Result<(), RegistryError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let current = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let transport_changed = patch
            .transport
            .as_ref()
            .is_some_and(|transport| *transport != current.transport);
        if transport_changed {
            self.stop_locked(id).await;
        }
        self.registry.update(id, patch)
    }

    /// Stop a server and delete its descriptor
    #[instrument(skip_all, fields(server = %id))]
    pub async fn remove_server(&self, id: &ServerId) -> Result<ToolServerDescriptor, RegistryError> {
        let lock = self.lock_for(id);
        let removed = {
            let _guard = lock.lock().await;
            self.stop_locked(id).await;
            self.registry.remove(id)?
        };
        self.locks.remove(id);
        Ok(removed)
    }

    /// Release every live sandbox, marking their servers disconnected
    pub async fn shutdown(&self) {
        let ids: Vec<ServerId> = self.sandboxes.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }
        info!(sandboxes = ids.len(), "Shutting down lifecycle manager");
        futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    async fn start_locked(&self, id: &ServerId) -> bool {
        let Some(descriptor) = self.registry.get(id) else {
            warn!("Start requested for unknown server");
            return false;
        };
        self.record(id, self.registry.mark_connecting(id));

        match &descriptor.transport {
            Transport::Remote { url, headers } => {
                let report = self.probe.probe(url, &materialize(headers)).await;
                if report.ready {
                    let tools = report.into_tools();
                    info!(tools = tools.len(), "Server connected");
                    self.record(id, self.registry.mark_connected(id, None, tools));
                    true
                } else {
                    let message = report
                        .error
                        .unwrap_or_else(|| "Server is not ready".to_string());
                    warn!(error = %message, "Server failed to connect");
                    self.record(id, self.registry.mark_error(id, message));
                    false
                }
            }
            Transport::LocalCommand { command, args, env } => {
                self.start_local(id, command, args, materialize(env)).await
            }
        }
    }

    async fn start_local(
        &self,
        id: &ServerId,
        command: &str,
        args: &[String],
        env: Vec<(String, String)>,
    ) -> bool {
        if let Some(handle) = self.sandbox_for(id) {
            if !handle.runs(command, args, &env) {
                debug!(sandbox = %handle.sandbox_id, "Command changed, replacing sandbox");
                self.release(id).await;
            } else {
                let report = self.probe.probe(&handle.endpoint, &[]).await;
                if report.ready {
                    debug!(sandbox = %handle.sandbox_id, "Reusing live sandbox");
                    let tools = report.into_tools();
                    self.record(id, self.registry.mark_connected(id, Some(handle.endpoint), tools));
                    return true;
                }
                debug!(sandbox = %handle.sandbox_id, "Existing sandbox unresponsive, replacing it");
                self.release(id).await;
            }
        }

        let Some(provisioner) = &self.provisioner else {
            self.record(
                id,
                self.registry
                    .mark_error(id, "Sandbox provisioning is not configured"),
            );
            return false;
        };

        let handle = match provisioner.provision(id, command, args, env).await {
            Ok(handle) => handle,
            Err(e) => {
                let message = format!("Failed to provision sandbox: {e:#}");
                warn!(error = %message, "Server failed to connect");
                self.record(id, self.registry.mark_error(id, message));
                return false;
            }
        };
        let endpoint = handle.endpoint.clone();
        self.sandboxes.insert(id.clone(), handle);

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            let report = self.probe.probe(&endpoint, &[]).await;
            if report.ready {
                let tools = report.into_tools();
                info!(attempt, tools = tools.len(), endpoint = %endpoint, "Server connected");
                self.record(id, self.registry.mark_connected(id, Some(endpoint), tools));
                return true;
            }

            debug!(attempt, error = ?report.error, "Sandbox endpoint not ready yet");
            last_error = report.error;
            if attempt < max_attempts {
                self.sleeper.sleep(self.retry.delay_for(attempt)).await;
            }
        }

        self.release(id).await;
        let message = format!(
            "Server did not become ready after {} attempts: {}",
            max_attempts,
            last_error.as_deref().unwrap_or("no response")
        );
        warn!(error = %message, "Server failed to connect");
        self.record(id, self.registry.mark_error(id, message));
        false
    }

    async fn stop_locked(&self, id: &ServerId) -> bool {
        let Some(descriptor) = self.registry.get(id) else {
            warn!("Stop requested for unknown server");
            return false;
        };

        let released = self.release(id).await;
        if !released && descriptor.status == ServerStatus::Disconnected {
            return true;
        }

        info!("Server stopped");
        self.record(id, self.registry.mark_disconnected(id));
        true
    }

    /// Drop and delete the sandbox owned by `id`, if any
    async fn release(&self, id: &ServerId) -> bool {
        let Some((_, handle)) = self.sandboxes.remove(id) else {
            return false;
        };
        if let Some(provisioner) = &self.provisioner {
            provisioner.release(&handle).await;
        }
        true
    }

    fn record(&self, id: &ServerId, result: Result<(), RegistryError>) {
        if let Err(e) = result {
            warn!(server = %id, error = %e, "Failed to record server state");
        }
    }
}

impl Drop for ServerLifecycleManager {
    fn drop(&mut self) {
        // Sandboxes need an async delete; `shutdown` is the clean path
        if !self.sandboxes.is_empty() {
            warn!(
                sandboxes = self.sandboxes.len(),
                "Lifecycle manager dropped with live sandboxes"
            );
        }
    }
}

//! Tool server registry
//!
//! User-editable descriptors plus the active set, persisted write-through to
//! a [`KeyValueStore`]. The registry performs no network or process I/O;
//! runtime fields (`status`, `resolved_endpoint`, `tool_catalog`,
//! `error_message`) are only written by the lifecycle subsystem through the
//! `mark_*` methods, which keep the descriptor invariants intact.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{KeyValueStore, SELECTED_SERVERS_KEY, SERVERS_KEY};

/// Errors reported synchronously by registry edits
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid server descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("unknown server: {0}")]
    NotFound(ServerId),
    #[error("registry store failed: {0:#}")]
    Store(anyhow::Error),
}

/// Opaque descriptor identifier, assigned once at creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Ordered key/value entry (headers, environment variables)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse `KEY=VALUE`; a missing `=` yields an empty value
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('=') {
            Some((key, value)) => Self::new(key.trim(), value),
            None => Self::new(raw.trim(), ""),
        }
    }
}

/// Materialise pairs, ignoring entries with an empty key
pub fn materialize(pairs: &[KeyValue]) -> Vec<(String, String)> {
    pairs
        .iter()
        .filter(|kv| !kv.key.trim().is_empty())
        .map(|kv| (kv.key.clone(), kv.value.clone()))
        .collect()
}

/// How a tool server is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Transport {
    Remote {
        url: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        headers: Vec<KeyValue>,
    },
    LocalCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        env: Vec<KeyValue>,
    },
}

impl Transport {
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Remote { .. } => "remote",
            Transport::LocalCommand { .. } => "local-command",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Transport::LocalCommand { .. })
    }

    fn validate(&self) -> Result<(), RegistryError> {
        match self {
            Transport::Remote { url, .. } => {
                if url.trim().is_empty() {
                    return Err(RegistryError::InvalidDescriptor(
                        "remote server requires a URL".to_string(),
                    ));
                }
                url::Url::parse(url.trim()).map_err(|e| {
                    RegistryError::InvalidDescriptor(format!("invalid URL '{url}': {e}"))
                })?;
            }
            Transport::LocalCommand { command, args, .. } => {
                if command.trim().is_empty() {
                    return Err(RegistryError::InvalidDescriptor(
                        "local command server requires an executable".to_string(),
                    ));
                }
                if args.iter().all(|a| a.trim().is_empty()) {
                    return Err(RegistryError::InvalidDescriptor(
                        "local command server requires at least one argument".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Disconnected => write!(f, "disconnected"),
            ServerStatus::Connecting => write!(f, "connecting"),
            ServerStatus::Connected => write!(f, "connected"),
            ServerStatus::Error => write!(f, "error"),
        }
    }
}

/// A discovered tool, in the shape the UI renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }
}

/// A configured tool source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerDescriptor {
    pub id: ServerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub transport: Transport,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_catalog: Vec<ToolDescriptor>,
}

impl ToolServerDescriptor {
    pub fn new(name: impl Into<String>, transport: Transport) -> Self {
        Self {
            id: ServerId::generate(),
            name: name.into(),
            description: None,
            transport,
            status: ServerStatus::Disconnected,
            error_message: None,
            resolved_endpoint: None,
            tool_catalog: Vec::new(),
        }
    }

    pub fn remote(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            Transport::Remote {
                url: url.into(),
                headers: Vec::new(),
            },
        )
    }

    pub fn local_command<I, S>(name: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            Transport::LocalCommand {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: Vec::new(),
            },
        )
    }

    pub fn with_id(mut self, id: impl Into<ServerId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a header (remote) or environment variable (local command)
    pub fn with_pair(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let pair = KeyValue::new(key, value);
        match &mut self.transport {
            Transport::Remote { headers, .. } => headers.push(pair),
            Transport::LocalCommand { env, .. } => env.push(pair),
        }
        self
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidDescriptor(
                "server name must not be empty".to_string(),
            ));
        }
        self.transport.validate()
    }

    /// Address a protocol client should open, if any
    pub fn endpoint(&self) -> Option<&str> {
        match &self.transport {
            Transport::Remote { url, .. } => Some(url.as_str()),
            Transport::LocalCommand { .. } => self.resolved_endpoint.as_deref(),
        }
    }

    /// Static request headers; sandbox endpoints are public and carry none
    pub fn request_headers(&self) -> Vec<(String, String)> {
        match &self.transport {
            Transport::Remote { headers, .. } => materialize(headers),
            Transport::LocalCommand { .. } => Vec::new(),
        }
    }

    fn reset_runtime(&mut self) {
        self.status = ServerStatus::Disconnected;
        self.error_message = None;
        self.resolved_endpoint = None;
        self.tool_catalog.clear();
    }
}

/// User edits applied by [`ServerRegistry::update`]
#[derive(Debug, Clone, Default)]
pub struct DescriptorPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub transport: Option<Transport>,
}

#[derive(Debug, Default)]
struct RegistryState {
    servers: Vec<ToolServerDescriptor>,
    active: Vec<ServerId>,
}

impl RegistryState {
    fn find_mut(&mut self, id: &ServerId) -> Result<&mut ToolServerDescriptor, RegistryError> {
        self.servers
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }
}

pub struct ServerRegistry {
    store: Arc<dyn KeyValueStore>,
    state: RwLock<RegistryState>,
}

impl ServerRegistry {
    /// Load descriptors and the active set from the store
    ///
    /// Runtime fields are reset because no sandbox or session outlives the
    /// process that created it. Active ids without a descriptor are dropped.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Result<Self, RegistryError> {
        let mut servers: Vec<ToolServerDescriptor> = read_json(store.as_ref(), SERVERS_KEY)?;
        for server in &mut servers {
            server.reset_runtime();
        }

        let known: HashSet<&ServerId> = servers.iter().map(|s| &s.id).collect();
        let mut active: Vec<ServerId> = read_json(store.as_ref(), SELECTED_SERVERS_KEY)?;
        active.retain(|id| known.contains(id));
        dedup_in_order(&mut active);

        debug!(servers = servers.len(), active = active.len(), "Loaded server registry");

        Ok(Self {
            store,
            state: RwLock::new(RegistryState { servers, active }),
        })
    }

    pub fn list(&self) -> Vec<ToolServerDescriptor> {
        self.state.read().servers.clone()
    }

    pub fn get(&self, id: &ServerId) -> Option<ToolServerDescriptor> {
        self.state.read().servers.iter().find(|s| &s.id == id).cloned()
    }

    pub fn add(&self, mut descriptor: ToolServerDescriptor) -> Result<ServerId, RegistryError> {
        descriptor.validate()?;
        descriptor.reset_runtime();

        let mut state = self.state.write();
        if state.servers.iter().any(|s| s.id == descriptor.id) {
            return Err(RegistryError::InvalidDescriptor(format!(
                "duplicate server id {}",
                descriptor.id
            )));
        }

        let id = descriptor.id.clone();
        info!(server = %id, name = %descriptor.name, transport = descriptor.transport.kind(), "Adding server");
        let mut servers = state.servers.clone();
        servers.push(descriptor);
        self.persist_servers(&servers)?;
        state.servers = servers;
        Ok(id)
    }

    /// Apply user edits; a transport change resets runtime state
    pub fn update(&self, id: &ServerId, patch: DescriptorPatch) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        let mut updated = state.find_mut(id)?.clone();
        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(description) = patch.description {
            updated.description = Some(description).filter(|d| !d.trim().is_empty());
        }
        let transport_changed = match patch.transport {
            Some(transport) if transport != updated.transport => {
                updated.transport = transport;
                true
            }
            _ => false,
        };
        updated.validate()?;
        if transport_changed {
            updated.reset_runtime();
        }

        self.commit_servers(&mut state, |servers| {
            if let Some(current) = servers.iter_mut().find(|s| &s.id == id) {
                *current = updated;
            }
        })
    }

    /// Remove a descriptor, dropping it from the active set too
    pub fn remove(&self, id: &ServerId) -> Result<ToolServerDescriptor, RegistryError> {
        let mut state = self.state.write();
        let index = state
            .servers
            .iter()
            .position(|s| &s.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        let mut servers = state.servers.clone();
        let removed = servers.remove(index);
        let mut active = state.active.clone();
        active.retain(|a| a != id);

        if active.len() != state.active.len() {
            self.persist_active(&active)?;
        }
        self.persist_servers(&servers)?;
        info!(server = %id, "Removed server");

        state.servers = servers;
        state.active = active;
        Ok(removed)
    }

    /// Replace the active set, keeping the given order
    pub fn set_active(&self, ids: &[ServerId]) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        if let Some(unknown) = ids.iter().find(|id| !state.servers.iter().any(|s| &s.id == *id)) {
            return Err(RegistryError::NotFound(unknown.clone()));
        }

        let mut active = ids.to_vec();
        dedup_in_order(&mut active);
        self.persist_active(&active)?;
        state.active = active;
        Ok(())
    }

    pub fn active(&self) -> Vec<ServerId> {
        self.state.read().active.clone()
    }

    pub fn is_active(&self, id: &ServerId) -> bool {
        self.state.read().active.contains(id)
    }

    /// Active descriptors in active-set order
    pub fn active_descriptors(&self) -> Vec<ToolServerDescriptor> {
        let state = self.state.read();
        state
            .active
            .iter()
            .filter_map(|id| state.servers.iter().find(|s| &s.id == id).cloned())
            .collect()
    }

    /// Import servers from an `mcp.json` document
    ///
    /// Every entry is validated before any is added, so a bad entry leaves
    /// the registry untouched.
    pub fn import_mcp_json(&self, document: &str) -> Result<Vec<ServerId>, RegistryError> {
        let descriptors = parse_mcp_json(document)?;
        for descriptor in &descriptors {
            descriptor.validate()?;
        }

        let mut state = self.state.write();
        let ids: Vec<ServerId> = descriptors.iter().map(|d| d.id.clone()).collect();
        self.commit_servers(&mut state, |servers| servers.extend(descriptors))?;
        info!(count = ids.len(), "Imported servers");
        Ok(ids)
    }

    pub fn mark_connecting(&self, id: &ServerId) -> Result<(), RegistryError> {
        self.patch_runtime(id, |s| {
            s.reset_runtime();
            s.status = ServerStatus::Connecting;
        })
    }

    /// Record a successful connect; the endpoint is only kept for local commands
    pub fn mark_connected(
        &self,
        id: &ServerId,
        endpoint: Option<String>,
        tools: Vec<ToolDescriptor>,
    ) -> Result<(), RegistryError> {
        self.patch_runtime(id, |s| {
            s.status = ServerStatus::Connected;
            s.error_message = None;
            s.resolved_endpoint = endpoint.filter(|_| s.transport.is_local());
            s.tool_catalog = tools;
        })
    }

    pub fn mark_error(&self, id: &ServerId, message: impl Into<String>) -> Result<(), RegistryError> {
        let message = message.into();
        self.patch_runtime(id, |s| {
            s.reset_runtime();
            s.status = ServerStatus::Error;
            s.error_message = Some(message);
        })
    }

    pub fn mark_disconnected(&self, id: &ServerId) -> Result<(), RegistryError> {
        self.patch_runtime(id, ToolServerDescriptor::reset_runtime)
    }

    fn patch_runtime(
        &self,
        id: &ServerId,
        apply: impl FnOnce(&mut ToolServerDescriptor),
    ) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        state.find_mut(id)?;
        self.commit_servers(&mut state, |servers| {
            if let Some(server) = servers.iter_mut().find(|s| &s.id == id) {
                apply(server);
            }
        })
    }

    /// Edit a copy of the descriptor list and keep it only once it is stored
    fn commit_servers(
        &self,
        state: &mut RegistryState,
        edit: impl FnOnce(&mut Vec<ToolServerDescriptor>),
    ) -> Result<(), RegistryError> {
        let mut servers = state.servers.clone();
        edit(&mut servers);
        self.persist_servers(&servers)?;
        state.servers = servers;
        Ok(())
    }

    fn persist_servers(&self, servers: &[ToolServerDescriptor]) -> Result<(), RegistryError> {
        write_json(self.store.as_ref(), SERVERS_KEY, &servers)
    }

    fn persist_active(&self, active: &[ServerId]) -> Result<(), RegistryError> {
        write_json(self.store.as_ref(), SELECTED_SERVERS_KEY, &active)
    }
}

impl fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ServerRegistry")
            .field("servers", &state.servers.len())
            .field("active", &state.active)
            .finish()
    }
}

fn read_json<T>(store: &dyn KeyValueStore, key: &str) -> Result<Vec<T>, RegistryError>
where
    T: for<'de> Deserialize<'de>,
{
    let Some(raw) = store.get(key).map_err(RegistryError::Store)? else {
        return Ok(Vec::new());
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw)
        .map_err(|e| RegistryError::Store(anyhow::anyhow!("corrupt '{key}' entry: {e}")))
}

fn write_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), RegistryError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| RegistryError::Store(anyhow::Error::new(e)))?;
    store.set(key, &json).map_err(RegistryError::Store)
}

fn dedup_in_order(ids: &mut Vec<ServerId>) {
    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}

/// Parse `{"mcpServers": {"<name>": {...}}}` into fresh descriptors
fn parse_mcp_json(document: &str) -> Result<Vec<ToolServerDescriptor>, RegistryError> {
    let root: Value = serde_json::from_str(document)
        .map_err(|e| RegistryError::InvalidDescriptor(format!("invalid mcp.json: {e}")))?;
    let servers = root
        .get("mcpServers")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            RegistryError::InvalidDescriptor("mcp.json has no 'mcpServers' object".to_string())
        })?;

    let mut descriptors = Vec::with_capacity(servers.len());
    for (name, entry) in servers {
        let transport = if let Some(url) = entry.get("url").and_then(Value::as_str) {
            Transport::Remote {
                url: url.to_string(),
                headers: pairs_from_value(entry.get("headers")),
            }
        } else if let Some(command) = entry.get("command").and_then(Value::as_str) {
            let args = entry
                .get("args")
                .and_then(Value::as_array)
                .map(|args| {
                    args.iter()
                        .filter_map(|a| a.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            Transport::LocalCommand {
                command: command.to_string(),
                args,
                env: pairs_from_value(entry.get("env")),
            }
        } else {
            return Err(RegistryError::InvalidDescriptor(format!(
                "server '{name}' needs either 'url' or 'command'"
            )));
        };

        let mut descriptor = ToolServerDescriptor::new(name.clone(), transport);
        descriptor.description = entry
            .get("description")
            .and_then(Value::as_str)
            .map(String::from);
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}

/// Accept both `{"K": "V"}` and `[{"key": "K", "value": "V"}]`
fn pairs_from_value(value: Option<&Value>) -> Vec<KeyValue> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                KeyValue::new(k.clone(), value)
            })
            .collect(),
        Some(list @ Value::Array(_)) => {
            serde_json::from_value(list.clone()).unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

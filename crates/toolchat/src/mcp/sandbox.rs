//! Sandbox provisioning for local-command servers
//!
//! A local command is started inside an ephemeral remote sandbox behind a
//! gateway that bridges its stdio protocol to the SSE dialect, so the rest
//! of the system treats it like any remote server.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use toolchat_core::SandboxConfig;
use tracing::{debug, info, instrument, warn};

use super::registry::ServerId;

/// Resources requested for a sandbox
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    pub cpu: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    pub public: bool,
    pub timeout_secs: u64,
    pub auto_stop_minutes: u32,
    pub preview_port: u16,
    pub env: Vec<(String, String)>,
}

impl SandboxSpec {
    pub fn from_config(config: &SandboxConfig, env: Vec<(String, String)>) -> Self {
        Self {
            cpu: config.cpu,
            memory_gb: config.memory_gb,
            disk_gb: config.disk_gb,
            public: true,
            timeout_secs: config.timeout_secs,
            auto_stop_minutes: config.auto_stop_minutes,
            preview_port: config.gateway_port,
            env,
        }
    }
}

/// A created sandbox and its externally reachable preview address
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub id: String,
    pub preview_url: String,
    pub preview_token: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: String,
}

/// External sandbox service
#[async_trait]
pub trait SandboxApi: Send + Sync {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxInfo>;
    async fn create_session(&self, sandbox_id: &str, session_id: &str) -> Result<()>;
    /// Run a command in a session; `run_async` returns once it has started
    async fn execute(
        &self,
        sandbox_id: &str,
        session_id: &str,
        command: &str,
        run_async: bool,
    ) -> Result<ExecResult>;
    async fn delete(&self, sandbox_id: &str) -> Result<()>;
}

/// REST client for the sandbox service
#[derive(Debug, Clone)]
pub struct HttpSandboxApi {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpSandboxApi {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build sandbox HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Option<Self>> {
        let Some(url) = &config.api_url else {
            return Ok(None);
        };
        Self::new(url.clone(), config.api_key(), config.timeout()).map(Some)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("Sandbox API {} failed ({}): {}", action, status, body.trim());
}

#[async_trait]
impl SandboxApi for HttpSandboxApi {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxInfo> {
        let env: serde_json::Map<String, serde_json::Value> = spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        let body = serde_json::json!({
            "resources": {"cpu": spec.cpu, "memory": spec.memory_gb, "disk": spec.disk_gb},
            "public": spec.public,
            "timeoutSecs": spec.timeout_secs,
            "autoStopInterval": spec.auto_stop_minutes,
            "previewPort": spec.preview_port,
            "envVars": env,
        });

        let response = self
            .request(reqwest::Method::POST, "/sandboxes")
            .json(&body)
            .send()
            .await
            .context("Failed to reach sandbox API")?;
        check(response, "create")
            .await?
            .json()
            .await
            .context("Invalid sandbox create response")
    }

    async fn create_session(&self, sandbox_id: &str, session_id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/sandboxes/{sandbox_id}/sessions"))
            .json(&serde_json::json!({ "sessionId": session_id }))
            .send()
            .await
            .context("Failed to reach sandbox API")?;
        check(response, "create session").await?;
        Ok(())
    }

    async fn execute(
        &self,
        sandbox_id: &str,
        session_id: &str,
        command: &str,
        run_async: bool,
    ) -> Result<ExecResult> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{sandbox_id}/sessions/{session_id}/exec"),
            )
            .json(&serde_json::json!({ "command": command, "runAsync": run_async }))
            .send()
            .await
            .context("Failed to reach sandbox API")?;
        check(response, "execute")
            .await?
            .json()
            .await
            .context("Invalid sandbox execute response")
    }

    async fn delete(&self, sandbox_id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/sandboxes/{sandbox_id}"))
            .send()
            .await
            .context("Failed to reach sandbox API")?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(sandbox = sandbox_id, "Sandbox already gone");
            return Ok(());
        }
        check(response, "delete").await?;
        Ok(())
    }
}

/// A live sandbox fronting one descriptor's command
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxHandle {
    pub server: ServerId,
    pub sandbox_id: String,
    pub session_id: String,
    /// SSE endpoint served by the gateway
    pub endpoint: String,
    /// Command line the gateway wraps
    pub command_line: String,
    pub env: Vec<(String, String)>,
}

impl SandboxHandle {
    /// Whether this sandbox was launched for exactly this command
    pub fn runs(&self, command: &str, args: &[String], env: &[(String, String)]) -> bool {
        self.command_line == command_line(command, args) && self.env == env
    }
}

/// Package install step run before a python or uvx command
pub fn install_command(command_line: &str) -> Option<String> {
    let mut tokens = command_line.split_whitespace();
    let program = tokens.next()?;

    if program == "uvx" {
        return Some("pip install uv".to_string());
    }
    if program.starts_with("python") {
        let package = command_line
            .split("-m ")
            .nth(1)?
            .split_whitespace()
            .next()?;
        return Some(format!("pip install {package}"));
    }
    None
}

/// Gateway invocation bridging the command's stdio to SSE on `port`
pub fn gateway_command(
    preview_url: &str,
    token_header: &str,
    token: &str,
    port: u16,
    command_line: &str,
) -> String {
    let escaped = command_line.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "npx -y supergateway --base-url {preview_url} --header \"{token_header}: {token}\" --port {port} --cors --stdio \"{escaped}\""
    )
}

/// Join a command and its arguments into one shell line
pub fn command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct SandboxProvisioner {
    api: std::sync::Arc<dyn SandboxApi>,
    config: SandboxConfig,
}

impl SandboxProvisioner {
    pub fn new(api: std::sync::Arc<dyn SandboxApi>, config: SandboxConfig) -> Self {
        Self { api, config }
    }

    /// Create a sandbox, install dependencies and launch the gateway
    ///
    /// Returns once the gateway has been launched; readiness is for the
    /// caller to confirm. A failure after creation deletes the sandbox.
    #[instrument(skip(self, args, env), fields(server = %server))]
    pub async fn provision(
        &self,
        server: &ServerId,
        command: &str,
        args: &[String],
        env: Vec<(String, String)>,
    ) -> Result<SandboxHandle> {
        let spec = SandboxSpec::from_config(&self.config, env.clone());
        let sandbox = self.api.create(&spec).await.context("Failed to create sandbox")?;
        info!(sandbox = %sandbox.id, "Sandbox created");

        match self.launch(server, &sandbox, command, args, env).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if let Err(delete_error) = self.api.delete(&sandbox.id).await {
                    warn!(sandbox = %sandbox.id, error = %delete_error, "Failed to delete sandbox after launch failure");
                }
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        server: &ServerId,
        sandbox: &SandboxInfo,
        command: &str,
        args: &[String],
        env: Vec<(String, String)>,
    ) -> Result<SandboxHandle> {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        self.api
            .create_session(&sandbox.id, &session_id)
            .await
            .context("Failed to open sandbox session")?;

        let line = command_line(command, args);
        if let Some(install) = install_command(&line) {
            debug!(command = %install, "Installing package");
            match self.api.execute(&sandbox.id, &session_id, &install, false).await {
                Ok(result) if result.exit_code.unwrap_or(0) != 0 => {
                    warn!(exit_code = ?result.exit_code, output = %result.output, "Package install failed");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %format!("{e:#}"), "Package install failed"),
            }
        }

        let gateway = gateway_command(
            &sandbox.preview_url,
            &self.config.token_header,
            &sandbox.preview_token,
            self.config.gateway_port,
            &line,
        );
        let result = self
            .api
            .execute(&sandbox.id, &session_id, &gateway, true)
            .await
            .context("Failed to launch gateway")?;
        if result.exit_code.is_some_and(|code| code != 0) {
            warn!(exit_code = ?result.exit_code, output = %result.output, "Gateway exited early");
        }

        let endpoint = format!("{}/sse", sandbox.preview_url.trim_end_matches('/'));
        info!(endpoint = %endpoint, "Gateway launched");
        Ok(SandboxHandle {
            server: server.clone(),
            sandbox_id: sandbox.id.clone(),
            session_id,
            endpoint,
            command_line: line,
            env,
        })
    }

    /// Delete the sandbox; failures are logged, never raised
    pub async fn release(&self, handle: &SandboxHandle) {
        match self.api.delete(&handle.sandbox_id).await {
            Ok(()) => info!(server = %handle.server, sandbox = %handle.sandbox_id, "Sandbox released"),
            Err(e) => warn!(
                server = %handle.server,
                sandbox = %handle.sandbox_id,
                error = %format!("{e:#}"),
                "Failed to release sandbox"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Recording fake of the sandbox service
    #[derive(Default)]
    pub struct FakeSandboxApi {
        pub created: AtomicUsize,
        pub commands: Mutex<Vec<String>>,
        pub deleted: Mutex<Vec<String>>,
        pub fail_gateway: bool,
        pub fail_delete: bool,
    }

    #[async_trait]
    impl SandboxApi for FakeSandboxApi {
        async fn create(&self, _spec: &SandboxSpec) -> Result<SandboxInfo> {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SandboxInfo {
                id: format!("sbx-{n}"),
                preview_url: format!("https://3000-sbx-{n}.preview.test"),
                preview_token: "tok".to_string(),
            })
        }

        async fn create_session(&self, _sandbox_id: &str, _session_id: &str) -> Result<()> {
            Ok(())
        }

        async fn execute(
            &self,
            _sandbox_id: &str,
            _session_id: &str,
            command: &str,
            _run_async: bool,
        ) -> Result<ExecResult> {
            self.commands.lock().push(command.to_string());
            if self.fail_gateway && command.contains("supergateway") {
                bail!("exec refused");
            }
            Ok(ExecResult {
                exit_code: Some(0),
                output: String::new(),
            })
        }

        async fn delete(&self, sandbox_id: &str) -> Result<()> {
            self.deleted.lock().push(sandbox_id.to_string());
            if self.fail_delete {
                bail!("delete refused");
            }
            Ok(())
        }
    }
}

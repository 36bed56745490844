//! CLI commands implementation

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use toolchat_core::{ChatMessage, Config, OpenAiClient};

use crate::agent::{StreamOrchestrator, TurnConfig, TurnEvent, TurnOutcome, TurnRequest};
use crate::mcp::{
    HealthProbe, HttpSandboxApi, KeyValue, McpConnector, McpHealthProbe, SandboxProvisioner,
    ServerId, ServerLifecycleManager, ServerRegistry, ServerStatus, ToolAggregator,
    ToolServerDescriptor, Transport,
};
use crate::store::FileStore;
use crate::tools::ToolOutput;

// ANSI color codes
const GREEN: &str = "\x1b[92m";
const RED: &str = "\x1b[91m";
const YELLOW: &str = "\x1b[93m";
const CYAN: &str = "\x1b[96m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

fn print_status(ok: bool, msg: &str) {
    let icon = if ok {
        format!("{}✓{}", GREEN, RESET)
    } else {
        format!("{}✗{}", RED, RESET)
    };
    println!("  {} {}", icon, msg);
}

fn status_color(status: ServerStatus) -> &'static str {
    match status {
        ServerStatus::Connected => GREEN,
        ServerStatus::Connecting => YELLOW,
        ServerStatus::Error => RED,
        ServerStatus::Disconnected => DIM,
    }
}

/// Registry and lifecycle manager wired from configuration
struct App {
    config: Config,
    registry: Arc<ServerRegistry>,
    manager: Arc<ServerLifecycleManager>,
}

impl App {
    fn load() -> Result<Self> {
        let config = Config::load().context("Failed to load toolchat.toml")?;
        let dir = config.storage.resolve_dir()?;
        let registry = Arc::new(ServerRegistry::load(Arc::new(FileStore::new(dir)))?);

        let probe: Arc<dyn HealthProbe> = Arc::new(McpHealthProbe::new(config.probe.timeout()));
        let provisioner = HttpSandboxApi::from_config(&config.sandbox)?.map(|api| {
            Arc::new(SandboxProvisioner::new(
                Arc::new(api),
                config.sandbox.clone(),
            ))
        });

        let manager = Arc::new(
            ServerLifecycleManager::new(Arc::clone(&registry), probe, provisioner)
                .with_retry(config.retry.clone()),
        );

        Ok(Self {
            config,
            registry,
            manager,
        })
    }

    fn require(&self, id: &str) -> Result<ServerId> {
        let id = ServerId::from(id);
        if self.registry.get(&id).is_none() {
            bail!("Unknown server: {}", id);
        }
        Ok(id)
    }

    fn report(&self, id: &ServerId) {
        let Some(descriptor) = self.registry.get(id) else {
            return;
        };
        let ok = descriptor.status == ServerStatus::Connected;
        let mut line = format!(
            "{} {}{}{}",
            descriptor.name,
            status_color(descriptor.status),
            descriptor.status,
            RESET
        );
        if ok {
            line.push_str(&format!(" ({} tools)", descriptor.tool_catalog.len()));
        }
        if let Some(error) = &descriptor.error_message {
            line.push_str(&format!(": {}", error));
        }
        print_status(ok, &line);
    }
}

/// List configured servers
pub async fn servers_list() -> Result<()> {
    let app = App::load()?;
    let servers = app.registry.list();

    println!("{}Tool Servers ({}){}", BOLD, servers.len(), RESET);
    if servers.is_empty() {
        println!("  {}No servers configured{}", YELLOW, RESET);
        println!("  Run: {}toolchat servers add --name N --url U{}", CYAN, RESET);
        return Ok(());
    }

    println!(
        "  {:<38} {:<20} {:<14} {:<13} {:<7} {}",
        "ID", "NAME", "TRANSPORT", "STATUS", "ACTIVE", "TOOLS"
    );
    for server in servers {
        let active = if app.registry.is_active(&server.id) {
            "yes"
        } else {
            "-"
        };
        println!(
            "  {:<38} {:<20} {:<14} {}{:<13}{} {:<7} {}",
            server.id,
            server.name,
            server.transport.kind(),
            status_color(server.status),
            server.status.to_string(),
            RESET,
            active,
            server.tool_catalog.len()
        );
        if let Some(error) = &server.error_message {
            println!("  {}{}{}", DIM, error, RESET);
        }
    }
    Ok(())
}

/// Arguments of `servers add`
#[derive(Debug, Default)]
pub struct AddServer {
    pub name: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub headers: Vec<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<String>,
}

pub async fn servers_add(add: AddServer) -> Result<()> {
    let app = App::load()?;
    let pairs = |raw: &[String]| raw.iter().map(|p| KeyValue::parse(p)).collect::<Vec<_>>();

    let transport = match (add.url, add.command) {
        (Some(url), None) => Transport::Remote {
            url,
            headers: pairs(&add.headers),
        },
        (None, Some(command)) => Transport::LocalCommand {
            command,
            args: add.args,
            env: pairs(&add.env),
        },
        _ => bail!("Specify exactly one of --url or --command"),
    };

    let mut descriptor = ToolServerDescriptor::new(add.name, transport);
    if let Some(description) = add.description {
        descriptor = descriptor.with_description(description);
    }
    let id = app.registry.add(descriptor)?;
    print_status(true, &format!("Added server {}", id));
    Ok(())
}

pub async fn servers_remove(id: &str) -> Result<()> {
    let app = App::load()?;
    let id = app.require(id)?;
    let removed = app.manager.remove_server(&id).await?;
    print_status(true, &format!("Removed {} ({})", removed.name, id));
    Ok(())
}

/// Replace the active set, waiting for newly activated servers to start
pub async fn servers_activate(ids: &[String]) -> Result<()> {
    let app = App::load()?;
    let ids: Vec<ServerId> = ids.iter().map(|id| ServerId::from(id.as_str())).collect();

    let started = app.manager.set_active_servers(&ids)?;
    for result in join_all(started).await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Start task failed");
        }
    }

    println!("{}Active servers ({}){}", BOLD, ids.len(), RESET);
    for id in &ids {
        app.report(id);
    }
    app.manager.shutdown().await;
    Ok(())
}

pub async fn servers_import(path: &Path) -> Result<()> {
    let app = App::load()?;
    let document = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let ids = app.registry.import_mcp_json(&document)?;

    print_status(true, &format!("Imported {} servers", ids.len()));
    for id in &ids {
        if let Some(server) = app.registry.get(id) {
            println!("  - {} {}({}){}", server.name, DIM, id, RESET);
        }
    }
    Ok(())
}

/// Lifecycle operation run by `servers start|stop|restart`
#[derive(Debug, Clone, Copy)]
pub enum Lifecycle {
    Start,
    Stop,
    Restart,
}

pub async fn servers_lifecycle(id: &str, op: Lifecycle) -> Result<()> {
    let app = App::load()?;
    let id = app.require(id)?;

    let applied = match op {
        Lifecycle::Start => app.manager.start(&id).await,
        Lifecycle::Stop => app.manager.stop(&id).await,
        Lifecycle::Restart => app.manager.restart(&id).await,
    };
    if !applied && matches!(op, Lifecycle::Restart) {
        println!("  {}Server is not running; nothing to restart{}", YELLOW, RESET);
    }
    app.report(&id);

    // Sandboxes do not outlive the process
    app.manager.shutdown().await;
    Ok(())
}

/// Probe an endpoint and print the report as JSON
pub async fn probe(url: &str, headers: &[String]) -> Result<()> {
    let config = Config::load().context("Failed to load toolchat.toml")?;
    let headers: Vec<(String, String)> = headers
        .iter()
        .map(|raw| KeyValue::parse(raw))
        .map(|kv| (kv.key, kv.value))
        .collect();

    let report = McpHealthProbe::new(config.probe.timeout())
        .probe(url, &headers)
        .await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Run one streamed turn with the tools of every active server
pub async fn chat(prompt: &str, model: Option<String>) -> Result<()> {
    let app = App::load()?;
    let config = &app.config;

    let active = app.registry.active();
    join_all(active.iter().map(|id| app.manager.start(id))).await;
    for id in &active {
        app.report(id);
    }

    let aggregator = ToolAggregator::new(Arc::new(McpConnector::new(config.probe.timeout())));
    let built = aggregator.build(&app.registry.active_descriptors()).await;

    let mut turn = TurnConfig::from_model_config(&config.model);
    if let Some(model) = model {
        turn = turn.with_model(model);
    }
    let client = OpenAiClient::new(config.model.base_url.clone(), config.model.api_key());
    let orchestrator = StreamOrchestrator::new(Arc::new(client), turn);

    let request = TurnRequest::new(vec![ChatMessage::user(prompt)], built.tools, built.cleanup);
    let mut handle = orchestrator.run(request);

    let token = handle.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    let mut in_reasoning = false;
    while let Some(event) = handle.next_event().await {
        match event {
            TurnEvent::ReasoningDelta(text) => {
                if !in_reasoning {
                    print!("{}", DIM);
                    in_reasoning = true;
                }
                print!("{}", text);
            }
            TurnEvent::TextDelta(text) => {
                if in_reasoning {
                    println!("{}", RESET);
                    in_reasoning = false;
                }
                print!("{}", text);
            }
            TurnEvent::ToolCall(call) => {
                println!(
                    "\n{}→ {}{} {}{}{}",
                    CYAN, call.function.name, RESET, DIM, call.function.arguments, RESET
                );
            }
            TurnEvent::ToolResult {
                name,
                output,
                success,
                ..
            } => {
                let summary = match output {
                    ToolOutput::PlainText(text) => text.lines().next().unwrap_or("").to_string(),
                    ToolOutput::Resource { uri, .. } => format!("resource {}", uri),
                };
                print_status(success, &format!("{} {}{}{}", name, DIM, summary, RESET));
            }
            TurnEvent::Error(message) => {
                println!("\n{}{}{}", RED, message, RESET);
            }
            TurnEvent::Finished => println!(),
        }
        if let Err(e) = stdout.flush() {
            tracing::warn!(error = %e, "Stdout closed, cancelling turn");
            handle.cancel();
            break;
        }
    }

    let outcome = handle.join().await;
    interrupt.abort();
    if outcome == TurnOutcome::Cancelled {
        println!("\n{}Cancelled{}", YELLOW, RESET);
    }

    app.manager.shutdown().await;
    Ok(())
}

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use langdag_core::config::AppConfig;
use langdag_core::event::{ConversationEvent, EventStream, ExecutionEvent};
use langdag_core::traits::{NodeStore, Provider};
use langdag_core::types::Node;
use langdag_engine::{ConversationEngine, RunOptions, WorkflowExecutor, WorkflowManager};
use langdag_store::SqliteStore;

#[derive(Parser)]
#[command(name = "langdag", version, about = "Branching LLM conversations and workflow DAGs")]
struct Cli {
    /// Path to config file (default: ~/.config/langdag/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a conversation, or continue one from a node
    Prompt {
        /// Continue from this node (id or unique prefix)
        #[arg(long)]
        node: Option<String>,
        /// Model override
        #[arg(long)]
        model: Option<String>,
        /// System prompt for a new conversation
        #[arg(long)]
        system: Option<String>,
        /// The message to send
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },
    /// List conversations and workflow runs, newest first
    Ls,
    /// Show a node and everything below it
    Show {
        /// Node id or unique prefix
        id: String,
    },
    /// Delete a node and its subtree
    Rm {
        /// Node id or unique prefix
        id: String,
    },
    /// Set the title of a conversation root
    Title {
        /// Root id or unique prefix
        id: String,
        #[arg(trailing_var_arg = true, required = true)]
        title: Vec<String>,
    },
    /// Manage and run workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Show current configuration
    Config,
    /// List models offered by the configured provider
    Models,
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Store a workflow from a YAML or JSON file
    Create { file: PathBuf },
    /// List stored workflows
    Ls,
    /// Print a stored workflow as YAML
    Show { workflow: String },
    /// Check a workflow file without storing it
    Validate { file: PathBuf },
    /// Run a stored workflow
    Run {
        workflow: String,
        /// Input payload (JSON; anything else is taken as a string)
        #[arg(long)]
        input: Option<String>,
        /// Stream llm output as it arrives
        #[arg(long)]
        stream: bool,
    },
    /// Delete a stored workflow
    Rm { workflow: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("langdag={},warn", config.logging.level))
        }))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    // Commands that never open the database
    match &cli.command {
        Commands::Config => return print_config(&config, cli.json),
        Commands::Models => {
            let provider = langdag_llm::create_provider(&config)?;
            return print_models(provider.as_ref(), cli.json);
        }
        Commands::Workflow {
            action: WorkflowAction::Validate { file },
        } => return validate_file(file, cli.json),
        _ => {}
    }

    let store = Arc::new(SqliteStore::open(&config.storage_path())?);
    let out = Output { json: cli.json };

    match cli.command {
        Commands::Prompt {
            node,
            model,
            system,
            message,
        } => {
            let provider = langdag_llm::create_provider(&config)?;
            let engine = ConversationEngine::new(store, provider).with_config(config.engine.clone());
            let message = message.join(" ");
            let events = match node {
                Some(node) => {
                    if system.is_some() {
                        warn!("--system only applies to new conversations; ignoring");
                    }
                    let parent = engine.resolve_node(&node).await?;
                    engine
                        .prompt_from(&parent.id, &message, model.as_deref())
                        .await?
                }
                None => engine.prompt(&message, model.as_deref(), system.as_deref()).await?,
            };
            drain_conversation(events, &out).await?;
        }
        Commands::Ls => {
            let roots = store.list_roots().await?;
            if out.json {
                out.print_json(&roots)?;
            } else if roots.is_empty() {
                println!("No conversations yet.");
            } else {
                for root in &roots {
                    println!(
                        "{}  {}  {:<9}  {}",
                        short_id(&root.id),
                        root.created_at.format("%Y-%m-%d %H:%M"),
                        root.kind,
                        root.title.as_deref().unwrap_or("(untitled)")
                    );
                }
            }
        }
        Commands::Show { id } => {
            let node = store.resolve(&id).await?;
            let tree = store.subtree(&node.id).await?;
            if out.json {
                out.print_json(&tree)?;
            } else {
                print_tree(&tree);
            }
        }
        Commands::Rm { id } => {
            let node = store.resolve(&id).await?;
            let removed = store.delete(&node.id).await?;
            if out.json {
                out.print_json(&serde_json::json!({ "deleted": removed }))?;
            } else {
                println!("Deleted {removed} node(s)");
            }
        }
        Commands::Title { id, title } => {
            // Retitling never reaches a provider.
            let engine = ConversationEngine::new(store, Arc::new(langdag_llm::MockProvider::echo()));
            let node = engine.resolve_node(&id).await?;
            let title = title.join(" ");
            engine.update_title(&node.id, &title).await?;
            println!("{} {title}", short_id(&node.id));
        }
        Commands::Workflow { action } => {
            workflow_command(action, store, &config, &out).await?;
        }
        Commands::Config | Commands::Models => {}
    }

    Ok(())
}

async fn workflow_command(
    action: WorkflowAction,
    store: Arc<SqliteStore>,
    config: &AppConfig,
    out: &Output,
) -> anyhow::Result<()> {
    let manager = WorkflowManager::new(store.clone());

    match action {
        WorkflowAction::Create { file } => {
            let workflow = langdag_engine::parse_file(&file)?;
            let created = manager.create(workflow).await?;
            if out.json {
                out.print_json(&created)?;
            } else {
                println!("Created workflow {} ({})", created.name, created.id);
            }
        }
        WorkflowAction::Ls => {
            let workflows = manager.list().await?;
            if out.json {
                out.print_json(&workflows)?;
            } else {
                for wf in &workflows {
                    println!(
                        "{}  v{:<3}  {:<24}  {}",
                        short_id(&wf.id),
                        wf.version,
                        wf.name,
                        wf.description.as_deref().unwrap_or("")
                    );
                }
            }
        }
        WorkflowAction::Show { workflow } => {
            let wf = manager.resolve(&workflow).await?;
            if out.json {
                out.print_json(&wf)?;
            } else {
                print!("{}", langdag_engine::to_yaml(&wf)?);
            }
        }
        WorkflowAction::Run {
            workflow,
            input,
            stream,
        } => {
            let wf = manager.resolve(&workflow).await?;
            let input = parse_input(input.as_deref());
            let provider = langdag_llm::create_provider(config)?;
            let executor = WorkflowExecutor::new(store, provider).with_config(config.engine.clone());
            let events = executor.execute(&wf, input, RunOptions { stream }).await?;
            drain_execution(events, out).await?;
        }
        WorkflowAction::Rm { workflow } => {
            let removed = manager.delete(&workflow).await?;
            println!("Deleted workflow {} ({})", removed.name, removed.id);
        }
        WorkflowAction::Validate { file } => validate_file(&file, out.json)?,
    }
    Ok(())
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<AppConfig> {
    let mut config = match explicit {
        Some(path) => AppConfig::load(path)?,
        None => {
            let path = AppConfig::default_path();
            if path.exists() {
                AppConfig::load(&path)?
            } else {
                AppConfig::default()
            }
        }
    };
    config.apply_env_overrides()?;
    Ok(config)
}

/// JSON values pass through; anything that does not parse is a string.
fn parse_input(raw: Option<&str>) -> serde_json::Value {
    match raw {
        None => serde_json::Value::Null,
        Some(text) => serde_json::from_str(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string())),
    }
}

struct Output {
    json: bool,
}

impl Output {
    fn print_json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn event<T: Serialize>(&self, event: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(event)?);
        Ok(())
    }
}

/// Drain a prompt stream to stdout. Ctrl-C cancels the in-flight turn.
async fn drain_conversation(
    mut events: EventStream<ConversationEvent>,
    out: &Output,
) -> anyhow::Result<()> {
    let cancel = events.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut failure = None;
    while let Some(event) = events.next().await {
        if out.json {
            out.event(&event)?;
        }
        match event {
            ConversationEvent::Start { user_node_id } => {
                debug!(node_id = %user_node_id, "Waiting for reply");
            }
            ConversationEvent::Delta { text } => {
                if !out.json {
                    print!("{text}");
                    io::stdout().flush().ok();
                }
            }
            ConversationEvent::NodeSaved { node_id } => {
                if !out.json {
                    println!();
                    eprintln!("[saved {}]", short_id(&node_id));
                }
            }
            ConversationEvent::Error { error } => failure = Some(error),
        }
    }
    interrupt.abort();

    match failure {
        Some(error) => anyhow::bail!("prompt failed: {error}"),
        None => Ok(()),
    }
}

async fn drain_execution(
    mut events: EventStream<ExecutionEvent>,
    out: &Output,
) -> anyhow::Result<()> {
    let cancel = events.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut failure = None;
    while let Some(event) = events.next().await {
        if out.json {
            out.event(&event)?;
            if let ExecutionEvent::Error { error, root_id, .. } = event {
                failure = Some(format!("run {} failed: {error}", short_id(&root_id)));
            }
            continue;
        }
        match event {
            ExecutionEvent::NodeStarted { node_id, kind } => eprintln!("[{kind} {node_id}]"),
            ExecutionEvent::NodeDelta { text, .. } => {
                print!("{text}");
                io::stdout().flush().ok();
            }
            ExecutionEvent::NodeComplete { node_id, .. } => debug!(node_id = %node_id, "Node done"),
            ExecutionEvent::Done { output, root_id } => {
                println!();
                match output {
                    serde_json::Value::String(text) => println!("{text}"),
                    other => println!("{}", serde_json::to_string_pretty(&other)?),
                }
                eprintln!("[run {}]", short_id(&root_id));
            }
            ExecutionEvent::Error {
                node_id,
                error,
                root_id,
            } => {
                let at = node_id.map(|n| format!(" at {n}")).unwrap_or_default();
                failure = Some(format!("run {} failed{at}: {error}", short_id(&root_id)));
            }
        }
    }
    interrupt.abort();

    match failure {
        Some(message) => anyhow::bail!(message),
        None => Ok(()),
    }
}

fn validate_file(file: &Path, json: bool) -> anyhow::Result<()> {
    let workflow = langdag_engine::parse_file(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let report = langdag_engine::validate(&workflow);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "valid": report.valid,
                "errors": report.errors,
            }))?
        );
    } else if report.valid {
        println!("{} is valid", workflow.name);
    } else {
        eprintln!("{}", report.format_errors());
    }

    if report.valid {
        Ok(())
    } else {
        anyhow::bail!("{} validation error(s)", report.errors.len())
    }
}

fn print_config(config: &AppConfig, json: bool) -> anyhow::Result<()> {
    let mut shown = config.clone();
    if let Some(key) = shown.provider.anthropic.api_key.as_mut() {
        *key = mask_secret(key);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
    } else {
        print!("{}", toml::to_string_pretty(&shown)?);
        info!(path = %config.storage_path().display(), "Storage path");
    }
    Ok(())
}

fn print_models(provider: &dyn Provider, json: bool) -> anyhow::Result<()> {
    let models = provider.models();
    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }
    println!("Provider: {}", provider.name());
    for model in &models {
        println!(
            "  {:<32} {:<24} context {:>7}  max output {:>6}",
            model.id, model.name, model.context_window, model.max_output
        );
    }
    Ok(())
}

/// Print nodes (sequence ascending) as an indented tree.
fn print_tree(nodes: &[Node]) {
    let mut depth: HashMap<&str, usize> = HashMap::new();
    for node in nodes {
        let level = node
            .parent_id
            .as_deref()
            .and_then(|p| depth.get(p))
            .map_or(0, |d| d + 1);
        depth.insert(node.id.as_str(), level);

        let mut meta = Vec::new();
        if let Some(model) = &node.model {
            meta.push(model.clone());
        }
        if let Some(status) = node.status {
            meta.push(status.to_string());
        }
        if let (Some(tin), Some(tout)) = (node.tokens_in, node.tokens_out) {
            meta.push(format!("{tin}/{tout} tok"));
        }
        if let Some(ms) = node.latency_ms {
            meta.push(format!("{ms}ms"));
        }

        let indent = "  ".repeat(level);
        let title = node
            .title
            .as_deref()
            .map(|t| format!(" \"{t}\""))
            .unwrap_or_default();
        println!(
            "{indent}{} [{}]{title} {}",
            short_id(&node.id),
            node.kind,
            if meta.is_empty() {
                String::new()
            } else {
                format!("({})", meta.join(", "))
            }
        );
        for line in truncate(&node.content, 400).lines() {
            println!("{indent}  | {line}");
        }
    }
}

fn short_id(id: &str) -> &str {
    truncate(id, 8)
}

fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= 8 {
        "********".into()
    } else {
        let head: String = secret.chars().take(4).collect();
        format!("{head}********")
    }
}

/// Cut `s` to at most `max` bytes without splitting a character.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

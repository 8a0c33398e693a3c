mod config;
mod error;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use runtime::{BackendAdapter, ConnectReport, Conversation, Orchestrator, ToolRegistry, TurnError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use config::{Config, Provider};
use error::{Error, Result};

const SYSTEM_PROMPT: &str = "You are a helpful assistant. Be concise and direct.";
const TOOL_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to tools served by external \
programs. Use a tool when a request needs what it offers, and answer directly otherwise. Be concise.";

/// Inputs that end the chat, compared case-insensitively.
const EXIT_WORDS: [&str; 3] = ["exit", "quit", "bye"];

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Chat with a model that can use tools from MCP servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./conduit.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// JSON file with an `mcpServers` map, added after the configured servers
    #[arg(short, long, global = true)]
    servers: Option<PathBuf>,

    /// Backend provider, overriding the config file
    #[arg(short, long, global = true)]
    provider: Option<Provider>,

    /// Model name, overriding the config file
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat,
    /// Connect to the configured servers and list their tools
    Tools,
    /// Check that the backend is reachable and serves the model
    Probe,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    match cli.command {
        Some(Commands::Chat) | None => cmd_chat(&config).await,
        Some(Commands::Tools) => cmd_tools(&config).await,
        Some(Commands::Probe) => cmd_probe(&config).await,
    }
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// `RUST_LOG` wins over `-v` when set.
fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(path) = &cli.servers {
        config.add_servers_file(path)?;
    }
    match cli.provider {
        Some(provider) if provider != config.backend.provider => {
            // A configured model belongs to the configured provider.
            config.backend.provider = provider;
            config.backend.model = None;
        }
        _ => {}
    }
    if let Some(model) = &cli.model {
        config.backend.model = Some(model.clone());
    }
    Ok(config)
}

// ─────────────────────────────────────────────────────────────────────────────
// chat
// ─────────────────────────────────────────────────────────────────────────────

async fn cmd_chat(config: &Config) -> Result<()> {
    let registry = Arc::new(connect(config).await?);
    let outcome = start_chat(config, Arc::clone(&registry)).await;
    registry.shutdown().await;
    println!("\nSession ended.");
    outcome
}

async fn start_chat(config: &Config, registry: Arc<ToolRegistry>) -> Result<()> {
    let backend = &config.backend;
    match backend.provider {
        Provider::Anthropic => chat(backend.anthropic()?, config, registry).await,
        Provider::Ollama => chat(backend.ollama(), config, registry).await,
        Provider::Cohere => chat(backend.cohere()?, config, registry).await,
        Provider::Directive => chat(backend.directive(), config, registry).await,
    }
}

async fn chat<B: BackendAdapter>(backend: B, config: &Config, registry: Arc<ToolRegistry>) -> Result<()> {
    println!("conduit v{}", env!("CARGO_PKG_VERSION"));
    println!("Backend: {}", backend.describe());
    println!("Tools: {}", registry.len());
    for entry in registry.entries() {
        println!("  - {}: {}", entry.descriptor.name, first_line(&entry.descriptor.description));
    }

    let prompt = system_prompt(config.backend.system_prompt.as_deref(), &registry);
    let mut conversation = Conversation::with_system(prompt);
    let orchestrator = Orchestrator::new(backend, registry)
        .max_rounds(config.engine.max_rounds)
        .on_tool_call(|call| println!("  Calling {} with {}", call.tool_name, call.arguments));

    println!("Type 'quit' or Ctrl+D to exit, Ctrl+C to cancel a running turn.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if is_exit(input) {
            break;
        }

        let cancel = CancellationToken::new();
        let turn = orchestrator.run_turn(&mut conversation, input, &cancel);
        tokio::pin!(turn);
        let outcome = tokio::select! {
            outcome = &mut turn => outcome,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                turn.await
            }
        };

        match outcome {
            Ok(reply) => {
                debug!(rounds = reply.rounds, "turn complete");
                println!("\n{}\n", reply.text);
            }
            Err(TurnError::Cancelled) => eprintln!("\nTurn cancelled.\n"),
            Err(e) if e.keeps_transcript() => {
                eprintln!("Error: {e}\nThe tool results so far stay in the conversation.\n")
            }
            Err(e) => eprintln!("Error: {e}\n"),
        }
    }
    Ok(())
}

fn is_exit(input: &str) -> bool {
    EXIT_WORDS.iter().any(|word| input.eq_ignore_ascii_case(word))
}

/// The configured system prompt, or a default that mentions tools when
/// any are available, followed by each provider's instructions.
fn system_prompt(configured: Option<&str>, registry: &ToolRegistry) -> String {
    let base = match configured {
        Some(prompt) => prompt,
        None if registry.is_empty() => SYSTEM_PROMPT,
        None => TOOL_SYSTEM_PROMPT,
    };
    let provided = registry.sessions().iter().filter_map(|session| {
        let text = session.instructions()?.trim();
        (!text.is_empty()).then(|| format!("Instructions from the '{}' tool server:\n{text}", session.name()))
    });
    std::iter::once(base.to_string())
        .chain(provided)
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// tools / probe
// ─────────────────────────────────────────────────────────────────────────────

async fn cmd_tools(config: &Config) -> Result<()> {
    let registry = connect(config).await?;

    if registry.is_empty() {
        println!("No tools available.");
    } else {
        println!("{:<28}  {:<16}  DESCRIPTION", "TOOL", "SERVER");
        println!("{}", "-".repeat(80));
        for entry in registry.entries() {
            println!(
                "{:<28}  {:<16}  {}",
                entry.descriptor.name,
                entry.server,
                first_line(&entry.descriptor.description)
            );
        }
    }

    for shadowed in registry.shadowed() {
        println!(
            "\n'{}' from {} is shadowed by {}",
            shadowed.name, shadowed.dropped, shadowed.kept
        );
    }

    registry.shutdown().await;
    Ok(())
}

async fn cmd_probe(config: &Config) -> Result<()> {
    let backend = &config.backend;
    let report = match backend.provider {
        Provider::Anthropic => backend.anthropic()?.probe().await?,
        Provider::Ollama => backend.ollama().probe().await?,
        Provider::Cohere => backend.cohere()?.probe().await?,
        Provider::Directive => backend.directive().probe().await?,
    };

    println!("Endpoint: {}", report.endpoint);
    println!("Models listed: {}", report.models.len());
    for model in &report.models {
        println!("  {model}");
    }

    if !report.model_available() {
        return Err(Error::ModelUnavailable {
            model: report.model,
            endpoint: report.endpoint,
        });
    }
    println!("Model '{}' is available.", report.model);
    Ok(())
}

/// Connect to every configured server. Servers that fail are reported and
/// skipped; if servers were configured and no tool came up, that is fatal.
async fn connect(config: &Config) -> Result<ToolRegistry> {
    let (registry, report) = ToolRegistry::connect_all(&config.servers, config.engine.session_options()).await;
    print_report(&report);

    if !config.servers.is_empty() && registry.is_empty() {
        registry.shutdown().await;
        return Err(Error::NoTools {
            configured: config.servers.len(),
        });
    }
    info!(tools = registry.len(), servers = registry.sessions().len(), "tool registry ready");
    Ok(registry)
}

fn print_report(report: &ConnectReport) {
    for registration in &report.registrations {
        println!(
            "Connected to {} ({} tools: {})",
            registration.server,
            registration.registered.len(),
            registration.registered.join(", ")
        );
    }
    for failure in &report.failures {
        eprintln!("Warning: {failure}");
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

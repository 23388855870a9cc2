//! Turnstile CLI binary entry point.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;
use turnstile::arbiter::{ArbiterOptions, ProviderArbiter};
use turnstile::cache::InMemoryCache;
use turnstile::cli::{ChatArgs, Cli, Commands};
use turnstile::config::TurnstileConfig;
use turnstile::provider::HttpProviderFactory;
use turnstile::run::{Orchestrator, OrchestratorOptions, RunEventPayload, RunStatus};
use turnstile::store::{AssistantConfig, AssistantTool, InMemoryStore, Store, Thread, ThreadMessage};
use turnstile::tools::{ProcessSandbox, ToolRegistry};
use turnstile::types::{CanonicalEvent, ModelMessage};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match TurnstileConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Chat(args) => handle_chat(config, args).await,
        Commands::Routes => handle_routes(&config),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn handle_routes(config: &TurnstileConfig) -> Result<(), Box<dyn std::error::Error>> {
    let table = config.route_table()?;
    let mut providers: Vec<&str> = table.providers().collect();
    providers.sort_unstable();
    for provider in providers {
        let marker = if config.has_credentials(provider) { "*" } else { " " };
        println!("{marker} {provider}");
    }
    Ok(())
}

async fn handle_chat(config: TurnstileConfig, args: ChatArgs) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config.settings().clone();
    let store = Arc::new(InMemoryStore::new());
    let arbiter = Arc::new(ProviderArbiter::new(
        config.route_table()?,
        Arc::new(HttpProviderFactory::new(config.clone())),
        store.clone(),
        Some(Arc::new(InMemoryCache::default())),
        ArbiterOptions::from_settings(&settings),
    ));

    let mut tools = ToolRegistry::new();
    let mut declared = Vec::new();
    if let Some(dir) = &args.sandbox_dir {
        tools = tools.with_code_sandbox(Arc::new(ProcessSandbox::new(dir)));
        declared.push(AssistantTool::CodeInterpreter);
    }
    let orchestrator = Orchestrator::new(arbiter, tools, OrchestratorOptions::from_settings(&settings));

    let mut assistant = AssistantConfig::new(&args.model, args.system.unwrap_or_default()).with_tools(declared);
    assistant.settings.temperature = args.temperature;
    assistant.settings.max_tokens = args.max_tokens;
    store.create_assistant(assistant.clone()).await?;

    let thread = Thread::new();
    store.create_thread(thread.clone()).await?;
    store
        .append_message(ThreadMessage::new(&thread.id, None, ModelMessage::user(args.prompt)))
        .await?;

    let run = orchestrator.create_run(&thread.id, &assistant.id).await?;
    let mut events = orchestrator.stream_run(&run.id).await?;
    while let Some(event) = events.next().await {
        match event.payload {
            RunEventPayload::Event { event: CanonicalEvent::Content { text } } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            RunEventPayload::Event { event: CanonicalEvent::Reasoning { text } } => {
                eprint!("\x1b[2m{text}\x1b[0m");
            }
            RunEventPayload::Event { event: CanonicalEvent::ToolCallComplete { name, call_id, .. } } => {
                eprintln!("\n⚡ {name} ({call_id})");
            }
            RunEventPayload::Event { event: CanonicalEvent::Error { kind, message } } => {
                eprintln!("\n❌ {kind}: {message}");
            }
            RunEventPayload::Status { status } if status.is_terminal() => {
                eprintln!("\n[{status}]");
            }
            _ => {}
        }
    }
    println!();

    let run = orchestrator.get_run(&run.id).await?;
    if run.status != RunStatus::Completed {
        let reason = run.last_error.map(|e| e.message).unwrap_or_else(|| run.status.to_string());
        return Err(reason.into());
    }
    Ok(())
}

//! Command-line surface for the `turnstile` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Turnstile CLI
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about = "Run model turns through the turnstile orchestrator")]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one turn against a model and stream the answer
    Chat(ChatArgs),
    /// List configured route providers
    Routes,
}

#[derive(Parser, Debug)]
pub struct ChatArgs {
    /// Model to use (format: provider:model, e.g., openai:gpt-4o)
    #[arg(short, long, default_value = "openai:gpt-4o")]
    pub model: String,

    /// System prompt
    #[arg(short, long)]
    pub system: Option<String>,

    /// Temperature (0.0 - 2.0)
    #[arg(short, long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Let the model run code in this directory via `code_interpreter`
    #[arg(long)]
    pub sandbox_dir: Option<PathBuf>,

    pub prompt: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chat_with_defaults() {
        let cli = Cli::try_parse_from(["turnstile", "chat", "hello"]).unwrap();
        match cli.command {
            Commands::Chat(args) => {
                assert_eq!(args.model, "openai:gpt-4o");
                assert!(args.system.is_none());
                assert!(args.sandbox_dir.is_none());
                assert_eq!(args.prompt, "hello");
            }
            other => panic!("expected Chat, got {other:?}"),
        }
    }

    #[test]
    fn parse_chat_with_all_options() {
        let cli = Cli::try_parse_from([
            "turnstile",
            "--config",
            "/tmp/t.toml",
            "chat",
            "-m",
            "ollama:qwen3:8b",
            "-s",
            "You are helpful",
            "-t",
            "0.7",
            "--max-tokens",
            "1024",
            "--sandbox-dir",
            "/tmp/work",
            "Hello world",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/t.toml")));
        match cli.command {
            Commands::Chat(args) => {
                assert_eq!(args.model, "ollama:qwen3:8b");
                assert_eq!(args.system.as_deref(), Some("You are helpful"));
                assert!((args.temperature.unwrap() - 0.7).abs() < f64::EPSILON);
                assert_eq!(args.max_tokens, Some(1024));
                assert_eq!(args.prompt, "Hello world");
            }
            other => panic!("expected Chat, got {other:?}"),
        }
    }

    #[test]
    fn chat_requires_prompt() {
        assert!(Cli::try_parse_from(["turnstile", "chat"]).is_err());
        assert!(Cli::try_parse_from(["turnstile"]).is_err());
    }
}

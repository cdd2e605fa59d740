mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::Context;
use commands::agents::AgentCommand;
use commands::config::ConfigCommand;
use commands::keys::KeyCommand;
use commands::models::ModelCommand;
use commands::servers::ServerCommand;
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "troop",
    version,
    about = "Run LLM agents backed by MCP tool servers from the terminal",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Config file (default: ~/.troop/config.yaml)
    #[arg(long, global = true, env = "TROOP_CONFIG")]
    config: Option<PathBuf>,

    /// Agent to use instead of the default
    #[arg(short, long, global = true)]
    agent: Option<String>,

    /// Model (profile name or provider:model) to use instead of the default
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Show tool calls and their results
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Overwrite existing entries without asking
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// Send a single query to the default agent
    query: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single prompt against an agent
    Prompt {
        #[arg(required = true)]
        message: Vec<String>,
    },
    /// Start an interactive chat session
    Chat,
    /// Manage API keys
    #[command(subcommand, visible_alias = "keys")]
    Key(KeyCommand),
    /// Manage MCP servers
    #[command(subcommand, visible_aliases = ["servers", "mcp"])]
    Server(ServerCommand),
    /// Manage agents
    #[command(subcommand, visible_alias = "agents")]
    Agent(AgentCommand),
    /// Manage the default model and model profiles
    #[command(subcommand, visible_alias = "models")]
    Model(ModelCommand),
    /// Inspect the config file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Before the subscriber, so RUST_LOG may come from .env.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("troop=warn")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => troop::config::default_config_path()?,
    };
    let ctx = Context {
        config_path,
        agent: cli.agent,
        model: cli.model,
        verbose: cli.verbose,
        yes: cli.yes,
    };

    match cli.command {
        Some(Command::Prompt { message }) => commands::run::prompt(&ctx, &message.join(" ")).await,
        Some(Command::Chat) => commands::run::chat(&ctx).await,
        Some(Command::Key(cmd)) => commands::keys::run(&ctx, cmd),
        Some(Command::Server(cmd)) => commands::servers::run(&ctx, cmd),
        Some(Command::Agent(cmd)) => commands::agents::run(&ctx, cmd),
        Some(Command::Model(cmd)) => commands::models::run(&ctx, cmd),
        Some(Command::Config(cmd)) => commands::config::run(&ctx, cmd),
        None if cli.query.is_empty() => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            Ok(())
        }
        None => commands::run::prompt(&ctx, &cli.query.join(" ")).await,
    }
}

use super::{Context, arg_or_prompt, display, prompts};
use anyhow::{Context as _, Result, bail};
use clap::Subcommand;
use std::collections::BTreeMap;
use troop::config::ServerDef;

#[derive(Subcommand)]
pub enum ServerCommand {
    /// List registered MCP servers
    List,
    /// Register an MCP server launched over stdio
    ///
    /// e.g. `troop server add fs -- npx -y @modelcontextprotocol/server-filesystem /tmp`
    Add {
        name: Option<String>,
        /// Environment variable for the server process (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Program and arguments; prompted for when omitted
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Remove an MCP server
    Remove {
        name: Option<String>,
        /// Also detach the server from agents that use it
        #[arg(long)]
        force: bool,
    },
}

pub fn run(ctx: &Context, command: ServerCommand) -> Result<()> {
    match command {
        ServerCommand::List => list(ctx),
        ServerCommand::Add { name, env, command } => add(ctx, name, env, command),
        ServerCommand::Remove { name, force } => remove(ctx, name, force),
    }
}

fn list(ctx: &Context) -> Result<()> {
    let settings = ctx.load_settings()?;
    let rows: Vec<Vec<String>> = settings
        .servers
        .iter()
        .map(|(name, server)| {
            vec![
                name.clone(),
                shell_words::join(&server.command),
                server.env.keys().cloned().collect::<Vec<_>>().join(", "),
                settings.agents_using(name).join(", "),
            ]
        })
        .collect();
    display().table(&["Name", "Command", "Env", "Agents"], &rows)?;
    Ok(())
}

fn add(ctx: &Context, name: Option<String>, env: Vec<String>, command: Vec<String>) -> Result<()> {
    let name = arg_or_prompt(name, "Server Name")?;
    let mut settings = ctx.load_settings()?;
    if !ctx.confirm_overwrite(settings.servers.contains_key(&name), "Server", &name)? {
        return Ok(());
    }

    let mut vars = BTreeMap::new();
    for entry in &env {
        let (key, value) = parse_env(entry)?;
        vars.insert(key, value);
    }

    let command = if command.is_empty() {
        let line = prompts::text("Command (including args)")?;
        let command = split_command(&line)?;
        // Interactive mode also asks for environment variables.
        loop {
            let key = prompts::optional_text("Environment variable key (leave empty to finish)")?;
            if key.is_empty() {
                break;
            }
            let value = prompts::text(&format!("Environment Value for {key}"))?;
            vars.insert(key, value);
        }
        command
    } else {
        command
    };

    settings.add_server(
        &name,
        ServerDef {
            command,
            env: vars,
        },
    )?;
    ctx.save_settings(&settings)?;
    display().success(&format!("Added MCP server {name}"))?;
    Ok(())
}

fn remove(ctx: &Context, name: Option<String>, force: bool) -> Result<()> {
    let name = arg_or_prompt(name, "Server Name")?;
    let mut settings = ctx.load_settings()?;
    let detached = settings.remove_server(&name, force)?;
    ctx.save_settings(&settings)?;

    let mut out = display();
    out.success(&format!("Deleted MCP server {name}"))?;
    if !detached.is_empty() {
        out.dim(&format!("Detached from agent(s): {}", detached.join(", ")))?;
    }
    Ok(())
}

/// Split a command line the way a POSIX shell would.
pub fn split_command(line: &str) -> Result<Vec<String>> {
    let words = shell_words::split(line).context("Invalid command line")?;
    if words.is_empty() {
        bail!("Command must not be empty");
    }
    Ok(words)
}

pub fn parse_env(entry: &str) -> Result<(String, String)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => bail!("Invalid --env '{entry}'. Use KEY=VALUE"),
    }
}

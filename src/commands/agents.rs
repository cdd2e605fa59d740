use super::{Context, arg_or_prompt, display, prompts};
use anyhow::{Result, bail};
use clap::Subcommand;
use troop::config::{AgentDef, RESERVED_NAMES, Settings, is_reserved};
use troop::display::truncate_chars;

const INSTRUCTIONS_PREVIEW: usize = 30;

#[derive(Subcommand)]
pub enum AgentCommand {
    /// List all agents
    List,
    /// Add a new agent
    Add {
        name: Option<String>,
        /// System instructions; prompted for when omitted
        #[arg(long)]
        instructions: Option<String>,
        /// MCP server the agent may use (repeatable)
        #[arg(long = "server", value_name = "NAME")]
        servers: Vec<String>,
    },
    /// Edit an existing agent
    Edit { name: Option<String> },
    /// Remove an agent
    Remove { name: Option<String> },
    /// Make an agent the default
    Set { name: Option<String> },
}

pub fn run(ctx: &Context, command: AgentCommand) -> Result<()> {
    match command {
        AgentCommand::List => list(ctx),
        AgentCommand::Add {
            name,
            instructions,
            servers,
        } => add(ctx, name, instructions, servers),
        AgentCommand::Edit { name } => edit(ctx, name),
        AgentCommand::Remove { name } => remove(ctx, name),
        AgentCommand::Set { name } => set(ctx, name),
    }
}

fn list(ctx: &Context) -> Result<()> {
    let settings = ctx.load_settings()?;
    let default = settings.defaults.agent.as_deref();
    let rows: Vec<Vec<String>> = settings
        .agents
        .iter()
        .map(|(name, agent)| {
            let marker = if Some(name.as_str()) == default { " *" } else { "" };
            vec![
                format!("{name}{marker}"),
                agent.model.clone().unwrap_or_else(|| "Not set".into()),
                truncate_chars(&agent.instructions.replace('\n', " "), INSTRUCTIONS_PREVIEW),
                agent.servers.join(", "),
            ]
        })
        .collect();
    display().table(&["Name", "Model", "Instructions", "Servers"], &rows)?;
    Ok(())
}

fn add(
    ctx: &Context,
    name: Option<String>,
    instructions: Option<String>,
    servers: Vec<String>,
) -> Result<()> {
    let name = arg_or_prompt(name, "Enter name")?;
    let mut out = display();
    if is_reserved(&name) {
        out.dim(&format!("Reserved names: {}", RESERVED_NAMES.join(", ")))?;
        bail!("'{name}' is a reserved command name and cannot be used as an agent name");
    }

    let mut settings = ctx.load_settings()?;
    if !ctx.confirm_overwrite(settings.agents.contains_key(&name), "Agent", &name)? {
        return Ok(());
    }

    let interactive = instructions.is_none();
    let model = match &ctx.model {
        Some(m) => Some(m.clone()),
        None if interactive => {
            Some(prompts::optional_text("Enter model (profile or provider:model, empty for default)")?)
                .filter(|m| !m.is_empty())
        }
        None => None,
    };
    let instructions = match instructions {
        Some(i) => i,
        None => prompts::text("Enter instructions")?,
    };
    let servers = if interactive && servers.is_empty() {
        prompt_servers(&settings)?
    } else {
        servers
    };

    settings.add_agent(
        &name,
        AgentDef {
            instructions,
            servers,
            model,
        },
    )?;
    ctx.save_settings(&settings)?;
    out.success(&format!("Added agent {name}"))?;
    Ok(())
}

/// Ask for server names one at a time until an empty line.
fn prompt_servers(settings: &Settings) -> Result<Vec<String>> {
    let mut out = display();
    let mut servers = Vec::new();
    loop {
        let server = prompts::optional_text("Enter MCP servers (leave empty to finish)")?;
        if server.is_empty() {
            return Ok(servers);
        }
        if !settings.servers.contains_key(&server) {
            out.warning(&format!("Server {server} does not exist"))?;
            continue;
        }
        servers.push(server);
    }
}

fn edit(ctx: &Context, name: Option<String>) -> Result<()> {
    let name = arg_or_prompt(name, "Enter name")?;
    let mut settings = ctx.load_settings()?;
    let Some(current) = settings.agents.get(&name).cloned() else {
        bail!("Agent '{name}' does not exist");
    };

    let mut out = display();
    out.line(&format!("Editing agent: {name}"))?;
    out.dim("Press Enter to keep current value")?;

    let model = prompts::text_with_default(
        "Enter model (empty for default)",
        current.model.as_deref().unwrap_or(""),
        true,
    )?;

    out.dim(&format!("Current instructions: {}", current.instructions))?;
    let instructions =
        prompts::text_with_default("Enter instructions", &current.instructions, false)?;

    let current_servers = if current.servers.is_empty() {
        "None".to_string()
    } else {
        current.servers.join(", ")
    };
    out.dim(&format!("Current servers: {current_servers}"))?;
    out.dim("Leave empty to keep current, 'none' to clear all")?;
    let servers_input = prompts::optional_text("Enter MCP servers (comma-separated)")?;

    let servers = parse_server_list(&servers_input, &current.servers);
    settings.add_agent(
        &name,
        AgentDef {
            instructions: if instructions.is_empty() {
                current.instructions
            } else {
                instructions
            },
            servers,
            model: Some(model).filter(|m| !m.is_empty()),
        },
    )?;
    ctx.save_settings(&settings)?;
    out.success(&format!("Agent '{name}' updated successfully"))?;
    Ok(())
}

/// Empty keeps `current`, `none` clears, anything else is a comma list.
pub fn parse_server_list(input: &str, current: &[String]) -> Vec<String> {
    let input = input.trim();
    if input.is_empty() {
        return current.to_vec();
    }
    if input.eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn remove(ctx: &Context, name: Option<String>) -> Result<()> {
    let name = arg_or_prompt(name, "Enter name")?;
    let mut settings = ctx.load_settings()?;
    let was_default = settings.remove_agent(&name)?;
    ctx.save_settings(&settings)?;

    let mut out = display();
    out.success(&format!("Deleted agent {name}"))?;
    if was_default {
        out.dim("It was the default agent; no default is set now")?;
    }
    Ok(())
}

fn set(ctx: &Context, name: Option<String>) -> Result<()> {
    let name = arg_or_prompt(name, "Enter name")?;
    let mut settings = ctx.load_settings()?;
    settings.set_default_agent(&name)?;
    ctx.save_settings(&settings)?;
    display().success(&format!("Set default agent to {name}"))?;
    Ok(())
}

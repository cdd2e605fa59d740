use super::{Context, display};
use anyhow::{Result, bail};
use clap::Subcommand;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,
    /// Validate the config file
    Check,
}

pub fn run(ctx: &Context, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Path => {
            display().line(&ctx.config_path.display().to_string())?;
            Ok(())
        }
        ConfigCommand::Check => check(ctx),
    }
}

fn check(ctx: &Context) -> Result<()> {
    let settings = troop::config::Settings::load(&ctx.config_path)?;
    let problems = settings.problems();
    let mut out = display();
    if problems.is_empty() {
        out.success(&format!(
            "{} is valid ({} agents, {} servers, {} model profiles)",
            ctx.config_path.display(),
            settings.agents.len(),
            settings.servers.len(),
            settings.models.len()
        ))?;
        return Ok(());
    }
    for problem in &problems {
        out.error(problem)?;
    }
    bail!("{} problem(s) found in {}", problems.len(), ctx.config_path.display())
}

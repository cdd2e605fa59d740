use super::{Context, arg_or_prompt, display, prompts};
use anyhow::Result;
use clap::Subcommand;
use troop::config::mask_key;
use troop::llm::Provider;

#[derive(Subcommand)]
pub enum KeyCommand {
    /// List stored API keys (masked)
    List,
    /// Add or replace the API key for a provider
    Add {
        /// Provider name (anthropic, openai, openrouter, gemini, ...)
        provider: Option<String>,
        /// The key itself; prompted for without echo when omitted
        key: Option<String>,
    },
    /// Delete the API key for a provider
    Remove { provider: Option<String> },
}

pub fn run(ctx: &Context, command: KeyCommand) -> Result<()> {
    match command {
        KeyCommand::List => list(ctx),
        KeyCommand::Add { provider, key } => add(ctx, provider, key),
        KeyCommand::Remove { provider } => remove(ctx, provider),
    }
}

fn list(ctx: &Context) -> Result<()> {
    let settings = ctx.load_settings()?;
    let mut rows: Vec<Vec<String>> = settings
        .keys
        .iter()
        .map(|(provider, key)| vec![provider.clone(), mask_key(key), "config".into()])
        .collect();

    // Keys only present in the environment are still usable, so show them.
    for provider in Provider::ALL {
        if settings.key_for(provider.name()).is_some() {
            continue;
        }
        if let Some(var) = provider.default_api_key_env()
            && let Ok(key) = std::env::var(var)
            && !key.is_empty()
        {
            rows.push(vec![
                provider.name().to_string(),
                mask_key(&key),
                format!("env {var}"),
            ]);
        }
    }

    display().table(&["Provider", "Key", "Source"], &rows)?;
    Ok(())
}

fn add(ctx: &Context, provider: Option<String>, key: Option<String>) -> Result<()> {
    let provider = arg_or_prompt(provider, "Provider")?.to_lowercase();
    let mut out = display();
    let provider = match Provider::from_name(&provider) {
        Some(p) => p.name().to_string(),
        None => {
            out.warning(&format!(
                "'{provider}' is not a provider troop can call; storing the key anyway"
            ))?;
            provider
        }
    };

    let mut settings = ctx.load_settings()?;
    let exists = settings.key_for(&provider).is_some();
    if !ctx.confirm_overwrite(exists, "Provider", &provider)? {
        return Ok(());
    }

    let key = match key {
        Some(k) => k,
        None => prompts::secret("API Key")?,
    };
    settings.set_key(&provider, &key)?;
    ctx.save_settings(&settings)?;
    out.success(&format!("Added API key for {provider}"))?;
    Ok(())
}

fn remove(ctx: &Context, provider: Option<String>) -> Result<()> {
    let provider = arg_or_prompt(provider, "Provider")?;
    let mut settings = ctx.load_settings()?;
    settings.remove_key(&provider)?;
    ctx.save_settings(&settings)?;
    display().success(&format!("Deleted API key for {provider}"))?;
    Ok(())
}

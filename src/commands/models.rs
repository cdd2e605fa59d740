use super::{Context, arg_or_prompt, display, prompts};
use anyhow::Result;
use clap::Subcommand;
use std::collections::BTreeMap;
use troop::config::{ModelProfile, is_known_setting, parse_setting};

#[derive(Subcommand)]
pub enum ModelCommand {
    /// Set the default model (a profile name or provider:model)
    Set { model: Option<String> },
    /// List model profiles
    List,
    /// Add a named model profile
    ///
    /// e.g. `troop model add fast --model openai:gpt-4o-mini --set temperature=0.2`
    Add {
        name: Option<String>,
        /// Model setting as key=JSON_value (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        settings: Vec<String>,
    },
    /// Remove a model profile
    Remove { name: Option<String> },
}

pub fn run(ctx: &Context, command: ModelCommand) -> Result<()> {
    match command {
        ModelCommand::Set { model } => set(ctx, model),
        ModelCommand::List => list(ctx),
        ModelCommand::Add { name, settings } => add(ctx, name, settings),
        ModelCommand::Remove { name } => remove(ctx, name),
    }
}

fn set(ctx: &Context, model: Option<String>) -> Result<()> {
    let model = arg_or_prompt(model.or_else(|| ctx.model.clone()), "Model")?;
    let mut settings = ctx.load_settings()?;
    settings.set_default_model(&model)?;
    ctx.save_settings(&settings)?;
    display().success(&format!("Set default model to {model}"))?;
    Ok(())
}

fn list(ctx: &Context) -> Result<()> {
    let settings = ctx.load_settings()?;
    let default = settings.defaults.model.as_deref();
    let rows: Vec<Vec<String>> = settings
        .models
        .iter()
        .map(|(name, profile)| {
            let marker = if Some(name.as_str()) == default { " *" } else { "" };
            vec![
                format!("{name}{marker}"),
                profile.model.clone(),
                profile.settings.keys().cloned().collect::<Vec<_>>().join(", "),
            ]
        })
        .collect();

    let mut out = display();
    out.table(&["Name", "Model", "Settings (keys)"], &rows)?;
    if let Some(model) = default {
        out.line("")?;
        out.dim(&format!("Default model: {model}"))?;
    }
    Ok(())
}

fn add(ctx: &Context, name: Option<String>, entries: Vec<String>) -> Result<()> {
    let name = arg_or_prompt(name, "Enter name")?;
    let mut settings = ctx.load_settings()?;
    if !ctx.confirm_overwrite(settings.models.contains_key(&name), "Model profile", &name)? {
        return Ok(());
    }

    let interactive = ctx.model.is_none();
    let model = arg_or_prompt(ctx.model.clone(), "Enter model (e.g., openai:gpt-4o-mini)")?;

    let mut out = display();
    let mut values = BTreeMap::new();
    for entry in &entries {
        let (key, value) = parse_setting(entry)?;
        if !is_known_setting(&key) {
            out.warning(&format!("setting key may not be recognized: {key}"))?;
        }
        values.insert(key, value);
    }

    if interactive {
        loop {
            let entry =
                prompts::optional_text("Enter setting (key=JSON_value, leave empty to finish)")?;
            if entry.is_empty() {
                break;
            }
            match parse_setting(&entry) {
                Ok((key, value)) => {
                    if !is_known_setting(&key) {
                        out.warning(&format!("setting key may not be recognized: {key}"))?;
                    }
                    values.insert(key, value);
                }
                Err(e) => out.error(&e.to_string())?,
            }
        }
    }

    settings.add_model_profile(
        &name,
        ModelProfile {
            model,
            settings: values,
        },
    )?;
    ctx.save_settings(&settings)?;
    out.success(&format!("Added model profile {name}"))?;
    Ok(())
}

fn remove(ctx: &Context, name: Option<String>) -> Result<()> {
    let name = arg_or_prompt(name, "Enter name")?;
    let mut settings = ctx.load_settings()?;
    settings.remove_model_profile(&name)?;
    ctx.save_settings(&settings)?;
    display().success(&format!("Deleted model profile {name}"))?;
    Ok(())
}

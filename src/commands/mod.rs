//! Subcommand handlers. Each one loads the settings, applies one change and
//! writes the document back.

pub mod agents;
pub mod config;
pub mod keys;
pub mod models;
pub mod prompts;
pub mod run;
pub mod servers;

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use tracing::warn;
use troop::config::Settings;
use troop::display::MessageDisplay;

/// Global flags shared by every subcommand.
pub struct Context {
    pub config_path: PathBuf,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub verbose: bool,
    pub yes: bool,
}

impl Context {
    pub fn load_settings(&self) -> Result<Settings> {
        let settings = Settings::load(&self.config_path)?;
        for problem in settings.problems() {
            warn!(path = %self.config_path.display(), "{problem}");
        }
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        settings
            .save(&self.config_path)
            .with_context(|| format!("Failed to write {}", self.config_path.display()))
    }

    /// Whether to go ahead and replace `name`. Always true for new entries
    /// and under `--yes`.
    pub fn confirm_overwrite(&self, exists: bool, what: &str, name: &str) -> Result<bool> {
        if !exists || self.yes {
            return Ok(true);
        }
        prompts::confirm(&format!("{what} {name} already exists. Overwrite it?"), false)
    }
}

pub fn display() -> MessageDisplay {
    MessageDisplay::stdout(false)
}

/// The argument if given, otherwise ask for it.
pub fn arg_or_prompt(value: Option<String>, prompt: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => prompts::text(prompt),
    }
}

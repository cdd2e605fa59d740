//! The user-scoped settings document (`~/.troop/config.yaml`).
//!
//! Holds API keys, MCP server definitions, model profiles, agent definitions
//! and the selected defaults. Every mutation goes through a method here so the
//! cross-collection invariants (agents only reference known servers, the
//! default agent exists) hold for whatever the CLI writes back to disk.

use crate::error::{Error, Result};
use crate::llm::{ModelSettings, ModelSpec, Provider};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Names that collide with CLI subcommands and cannot be used for agents.
pub const RESERVED_NAMES: &[&str] = &[
    "agent", "agents", "chat", "config", "help", "key", "keys", "mcp", "model", "models",
    "prompt", "server", "servers",
];

/// Setting keys understood by every provider backend.
const COMMON_SETTINGS: &[&str] = &[
    "max_tokens",
    "temperature",
    "top_p",
    "seed",
    "stop_sequences",
    "presence_penalty",
    "frequency_penalty",
    "parallel_tool_calls",
];

const PROVIDER_PREFIXES: &[&str] = &["openai", "anthropic", "openrouter", "gemini", "ollama"];

const DEFAULT_MAX_TURNS: u32 = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerDef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub models: BTreeMap<String, ModelProfile>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentDef>,
    #[serde(default)]
    pub defaults: Defaults,
}

/// How to launch an MCP server: `command[0]` is the program, the rest its args.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDef {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDef {
    pub instructions: String,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A named model id plus request settings (temperature, max_tokens, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model: String,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

impl Defaults {
    /// At least one turn, so a run always reaches the model.
    pub fn max_turns(&self) -> u32 {
        self.max_turns.unwrap_or(DEFAULT_MAX_TURNS).max(1)
    }
}

/// `$TROOP_CONFIG`, or `~/.troop/config.yaml`.
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("TROOP_CONFIG")
        && !path.is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| Error::config("could not determine home directory"))?;
    Ok(home.join(".troop").join("config.yaml"))
}

impl Settings {
    /// Load from `path`. A missing or empty file yields empty settings.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using empty settings");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config {}: {e}", path.display())))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|e| {
            Error::config(format!("Failed to parse config {}: {e}", path.display()))
        })
    }

    /// Write to a sibling temp file, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, content)?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Every invariant violation in the document, in a stable order.
    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, server) in &self.servers {
            if server.command.is_empty() {
                out.push(format!("server '{name}' has an empty command"));
            }
        }
        for (name, agent) in &self.agents {
            for server in &agent.servers {
                if !self.servers.contains_key(server) {
                    out.push(format!("agent '{name}' references unknown server '{server}'"));
                }
            }
            if let Some(model) = &agent.model
                && let Err(e) = self.check_model_ref(model)
            {
                out.push(format!("agent '{name}': {e}"));
            }
        }
        if let Some(agent) = &self.defaults.agent
            && !self.agents.contains_key(agent)
        {
            out.push(format!("default agent '{agent}' does not exist"));
        }
        if let Some(model) = &self.defaults.model
            && let Err(e) = self.check_model_ref(model)
        {
            out.push(format!("default model: {e}"));
        }
        if self.defaults.max_turns == Some(0) {
            out.push("defaults.max_turns must be at least 1".into());
        }
        for (name, profile) in &self.models {
            if let Err(e) = ModelSpec::parse(&profile.model) {
                out.push(format!("model profile '{name}': {e}"));
            }
            if let Err(e) = ModelSettings::from_map(&profile.settings) {
                out.push(format!("model profile '{name}': {e}"));
            }
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::config(problems.join("; ")))
        }
    }

    // -- keys --

    pub fn set_key(&mut self, provider: &str, key: &str) -> Result<()> {
        let provider = normalize_name(provider, "provider")?;
        if key.trim().is_empty() {
            return Err(Error::config("API key must not be empty"));
        }
        self.keys.insert(provider_key(&provider), key.trim().to_string());
        Ok(())
    }

    pub fn remove_key(&mut self, provider: &str) -> Result<()> {
        self.keys
            .remove(&provider_key(provider))
            .map(|_| ())
            .ok_or_else(|| Error::config(format!("No API key found for {provider}")))
    }

    pub fn key_for(&self, provider: &str) -> Option<&str> {
        self.keys.get(&provider_key(provider)).map(String::as_str)
    }

    // -- servers --

    pub fn add_server(&mut self, name: &str, server: ServerDef) -> Result<()> {
        let name = normalize_name(name, "server")?;
        if server.command.is_empty() || server.command[0].trim().is_empty() {
            return Err(Error::config(format!("server '{name}' needs a command")));
        }
        self.servers.insert(name, server);
        Ok(())
    }

    /// Remove a server. Agents still using it block the removal unless
    /// `force`, which detaches it from them. Returns the detached agents.
    pub fn remove_server(&mut self, name: &str, force: bool) -> Result<Vec<String>> {
        if !self.servers.contains_key(name) {
            return Err(Error::config(format!("No MCP server found with name {name}")));
        }
        let users = self.agents_using(name);
        if !users.is_empty() && !force {
            return Err(Error::config(format!(
                "server '{name}' is used by agent(s): {} (use --force to detach it)",
                users.join(", ")
            )));
        }
        for agent in &users {
            if let Some(def) = self.agents.get_mut(agent) {
                def.servers.retain(|s| s != name);
            }
        }
        self.servers.remove(name);
        Ok(users)
    }

    pub fn agents_using(&self, server: &str) -> Vec<String> {
        self.agents
            .iter()
            .filter(|(_, a)| a.servers.iter().any(|s| s == server))
            .map(|(n, _)| n.clone())
            .collect()
    }

    // -- agents --

    pub fn add_agent(&mut self, name: &str, agent: AgentDef) -> Result<()> {
        let name = normalize_name(name, "agent")?;
        if is_reserved(&name) {
            return Err(Error::config(format!(
                "'{name}' is a reserved command name and cannot be used as an agent name \
                 (reserved: {})",
                RESERVED_NAMES.join(", ")
            )));
        }
        let missing: Vec<&str> = agent
            .servers
            .iter()
            .filter(|s| !self.servers.contains_key(s.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "Unknown MCP servers: {}",
                missing.join(", ")
            )));
        }
        if let Some(model) = &agent.model {
            self.check_model_ref(model)?;
        }
        let mut agent = agent;
        dedup_in_order(&mut agent.servers);
        self.agents.insert(name, agent);
        Ok(())
    }

    /// Remove an agent. Returns `true` if it was the default and the default
    /// was cleared.
    pub fn remove_agent(&mut self, name: &str) -> Result<bool> {
        if self.agents.remove(name).is_none() {
            return Err(Error::config(format!("No agent found with name {name}")));
        }
        if self.defaults.agent.as_deref() == Some(name) {
            self.defaults.agent = None;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn set_default_agent(&mut self, name: &str) -> Result<()> {
        if !self.agents.contains_key(name) {
            return Err(Error::config(format!("Agent {name} does not exist")));
        }
        self.defaults.agent = Some(name.to_string());
        Ok(())
    }

    // -- models --

    pub fn set_default_model(&mut self, model: &str) -> Result<()> {
        let model = model.trim();
        self.check_model_ref(model)?;
        self.defaults.model = Some(model.to_string());
        Ok(())
    }

    pub fn add_model_profile(&mut self, name: &str, profile: ModelProfile) -> Result<()> {
        let name = normalize_name(name, "model profile")?;
        if name.contains(':') {
            return Err(Error::config(
                "model profile names may not contain ':' (reserved for provider:model ids)",
            ));
        }
        ModelSpec::parse(&profile.model)?;
        ModelSettings::from_map(&profile.settings)?;
        self.models.insert(name, profile);
        Ok(())
    }

    pub fn remove_model_profile(&mut self, name: &str) -> Result<()> {
        if !self.models.contains_key(name) {
            return Err(Error::config(format!(
                "No model profile found with name {name}"
            )));
        }
        let mut users: Vec<String> = self
            .agents
            .iter()
            .filter(|(_, a)| a.model.as_deref() == Some(name))
            .map(|(n, _)| format!("agent '{n}'"))
            .collect();
        if self.defaults.model.as_deref() == Some(name) {
            users.push("the default model".into());
        }
        if !users.is_empty() {
            return Err(Error::config(format!(
                "model profile '{name}' is still used by {}",
                users.join(", ")
            )));
        }
        self.models.remove(name);
        Ok(())
    }

    /// A model reference is either a profile name or a `provider:model` id.
    pub fn check_model_ref(&self, model: &str) -> Result<()> {
        if self.models.contains_key(model) {
            return Ok(());
        }
        ModelSpec::parse(model).map(|_| ())
    }
}

/// Keys are stored under the canonical provider name (`google` is `gemini`).
/// Unknown providers keep their lowercased name.
fn provider_key(provider: &str) -> String {
    let provider = provider.trim();
    match Provider::from_name(provider) {
        Some(p) => p.name().to_string(),
        None => provider.to_lowercase(),
    }
}

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name.to_lowercase().as_str())
}

fn normalize_name(name: &str, what: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::config(format!("{what} name must not be empty")));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(Error::config(format!(
            "{what} name '{name}' must not contain whitespace"
        )));
    }
    Ok(name.to_string())
}

fn dedup_in_order(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|s| seen.insert(s.clone()));
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Show only the ends of an API key.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len().max(3));
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("{head}...{tail}")
}

/// Parse a `key=value` model setting.
pub fn parse_setting(entry: &str) -> Result<(String, Value)> {
    let (key, raw) = entry
        .split_once('=')
        .ok_or_else(|| Error::config(format!("Invalid setting '{entry}'. Use key=JSON_value")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::config(format!("Invalid setting '{entry}': empty key")));
    }
    Ok((key.to_string(), parse_value(raw)))
}

/// JSON first, then bare booleans and numbers, else the trimmed string.
pub fn parse_value(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return v;
    }
    match raw.to_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>()
        && let Some(n) = serde_json::Number::from_f64(f)
    {
        return Value::Number(n);
    }
    Value::String(raw.to_string())
}

/// Heuristic only: unknown keys are warned about, never rejected.
pub fn is_known_setting(key: &str) -> bool {
    if COMMON_SETTINGS.contains(&key) {
        return true;
    }
    let lower = key.to_lowercase();
    PROVIDER_PREFIXES
        .iter()
        .any(|p| lower.starts_with(&format!("{p}_")) || lower.starts_with(&format!("{p}:")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(cmd: &[&str]) -> ServerDef {
        ServerDef {
            command: cmd.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    fn agent(servers: &[&str]) -> AgentDef {
        AgentDef {
            instructions: "be useful".into(),
            servers: servers.iter().map(|s| s.to_string()).collect(),
            model: None,
        }
    }

    #[test]
    fn full_document_parses() {
        let yaml = r#"
keys:
  openai: sk-test
servers:
  fs:
    command: [npx, -y, server-filesystem, /tmp]
    env:
      DEBUG: "0"
models:
  fast:
    model: openai:gpt-4o-mini
    settings:
      temperature: 0.2
      max_tokens: 512
agents:
  researcher:
    instructions: You research things.
    servers: [fs]
    model: fast
defaults:
  model: openai:gpt-4o
  agent: researcher
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.key_for("openai"), Some("sk-test"));
        assert_eq!(settings.servers["fs"].command[0], "npx");
        assert_eq!(settings.servers["fs"].env["DEBUG"], "0");
        assert_eq!(settings.models["fast"].settings["max_tokens"], 512);
        assert_eq!(settings.agents["researcher"].model.as_deref(), Some("fast"));
        assert_eq!(settings.defaults.agent.as_deref(), Some("researcher"));
        assert_eq!(settings.defaults.max_turns(), DEFAULT_MAX_TURNS);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn minimal_document_uses_defaults() {
        let settings: Settings = serde_yaml::from_str("keys: {}\n").unwrap();
        assert!(settings.servers.is_empty());
        assert!(settings.agents.is_empty());
        assert!(settings.defaults.model.is_none());
    }

    #[test]
    fn agent_cannot_reference_unknown_server() {
        let mut s = Settings::default();
        let err = s.add_agent("a", agent(&["missing"])).unwrap_err();
        assert!(err.to_string().contains("Unknown MCP servers: missing"));
        assert!(s.agents.is_empty());
    }

    #[test]
    fn reserved_agent_names_rejected() {
        let mut s = Settings::default();
        assert!(s.add_agent("chat", agent(&[])).is_err());
        assert!(s.add_agent("Model", agent(&[])).is_err());
        assert!(s.add_agent("helper", agent(&[])).is_ok());
    }

    #[test]
    fn agent_servers_are_deduplicated() {
        let mut s = Settings::default();
        s.add_server("fs", server(&["fs-server"])).unwrap();
        s.add_agent("a", agent(&["fs", "fs"])).unwrap();
        assert_eq!(s.agents["a"].servers, vec!["fs"]);
    }

    #[test]
    fn removing_used_server_requires_force() {
        let mut s = Settings::default();
        s.add_server("fs", server(&["fs-server"])).unwrap();
        s.add_agent("a", agent(&["fs"])).unwrap();

        assert!(s.remove_server("fs", false).is_err());
        assert!(s.servers.contains_key("fs"));

        let detached = s.remove_server("fs", true).unwrap();
        assert_eq!(detached, vec!["a"]);
        assert!(s.agents["a"].servers.is_empty());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn removing_default_agent_clears_default() {
        let mut s = Settings::default();
        s.add_agent("a", agent(&[])).unwrap();
        s.set_default_agent("a").unwrap();
        assert!(s.remove_agent("a").unwrap());
        assert!(s.defaults.agent.is_none());
    }

    #[test]
    fn default_agent_must_exist() {
        let mut s = Settings::default();
        assert!(s.set_default_agent("ghost").is_err());
    }

    #[test]
    fn default_model_accepts_ids_and_profiles() {
        let mut s = Settings::default();
        assert!(s.set_default_model("gpt-4o").is_err());
        s.set_default_model("openai:gpt-4o").unwrap();
        s.add_model_profile(
            "fast",
            ModelProfile {
                model: "anthropic:claude-haiku-4-5".into(),
                settings: BTreeMap::new(),
            },
        )
        .unwrap();
        s.set_default_model("fast").unwrap();
        assert_eq!(s.defaults.model.as_deref(), Some("fast"));
        assert!(s.remove_model_profile("fast").is_err());
    }

    #[test]
    fn empty_server_command_rejected() {
        let mut s = Settings::default();
        assert!(s.add_server("x", server(&[])).is_err());
        assert!(s.add_server("x y", server(&["a"])).is_err());
    }

    #[test]
    fn problems_reports_hand_edited_breakage() {
        let yaml = r#"
agents:
  a:
    instructions: hi
    servers: [nope]
defaults:
  agent: b
"#;
        let s: Settings = serde_yaml::from_str(yaml).unwrap();
        let problems = s.problems();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("unknown server 'nope'"));
        assert!(problems[1].contains("default agent 'b'"));
    }

    #[test]
    fn problems_reports_bad_defaults() {
        let yaml = "defaults:\n  model: fast\n  max_turns: 0\n";
        let s: Settings = serde_yaml::from_str(yaml).unwrap();
        let problems = s.problems();
        assert_eq!(problems.len(), 2, "{problems:?}");
        assert!(problems[0].contains("default model"));
        assert!(problems[1].contains("max_turns"));
        assert!(s.validate().is_err());
        assert_eq!(s.defaults.max_turns(), 1);
    }

    #[test]
    fn problems_reports_bad_profile_settings() {
        let yaml = "models:\n  fast:\n    model: openai:gpt-4o-mini\n    settings:\n      max_tokens: abc\n";
        let s: Settings = serde_yaml::from_str(yaml).unwrap();
        let problems = s.problems();
        assert_eq!(problems.len(), 1, "{problems:?}");
        assert!(problems[0].contains("model profile 'fast'"));
    }

    #[test]
    fn model_profile_settings_are_checked_on_add() {
        let mut s = Settings::default();
        let mut settings = BTreeMap::new();
        settings.insert("max_tokens".to_string(), Value::from("abc"));
        let profile = ModelProfile {
            model: "openai:gpt-4o-mini".into(),
            settings,
        };
        assert!(s.add_model_profile("fast", profile).is_err());
        assert!(s.models.is_empty());
    }

    #[test]
    fn provider_aliases_share_one_key() {
        let mut s = Settings::default();
        s.set_key("Google", "g-key").unwrap();
        assert_eq!(s.keys.get("gemini").map(String::as_str), Some("g-key"));
        assert_eq!(s.key_for("gemini"), Some("g-key"));
        assert_eq!(s.key_for("google"), Some("g-key"));
        s.remove_key("google").unwrap();
        assert!(s.key_for("gemini").is_none());
        s.set_key("custom", "c").unwrap();
        assert_eq!(s.key_for("CUSTOM"), Some("c"));
    }

    #[test]
    fn keys_are_masked() {
        assert_eq!(mask_key("sk-abcdefghijklmnop"), "sk-abc...klmnop");
        assert_eq!(mask_key("short"), "*****");
    }

    #[test]
    fn setting_values_are_parsed() {
        assert_eq!(parse_value("0.5"), Value::from(0.5));
        assert_eq!(parse_value("True"), Value::Bool(true));
        assert_eq!(parse_value("[\"a\"]"), serde_json::json!(["a"]));
        assert_eq!(parse_value("hello"), Value::String("hello".into()));
        let (k, v) = parse_setting("max_tokens=100").unwrap();
        assert_eq!(k, "max_tokens");
        assert_eq!(v, Value::from(100));
        assert!(parse_setting("nope").is_err());
    }

    #[test]
    fn setting_key_heuristic() {
        assert!(is_known_setting("temperature"));
        assert!(is_known_setting("anthropic_thinking"));
        assert!(!is_known_setting("temprature"));
    }
}

//! Agent runs: resolve an agent from settings, then drive the conversation
//! loop between the model and the agent's MCP tools.
//!
//! Each turn sends the conversation to the model, executes any tool calls it
//! makes, appends the results, and repeats until the model answers without
//! calling tools or the turn limit is hit.

use crate::config::{ServerDef, Settings};
use crate::display::MessageDisplay;
use crate::error::{Error, Result};
use crate::llm::{
    ChatModel, ContentBlock, ConversationMessage, LlmClient, ModelSettings, ModelSpec, Role,
    StopReason, Usage,
};
use crate::mcp::{McpManager, ToolHost};
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

/// Everything needed to run an agent, looked up from the settings.
#[derive(Debug, Clone)]
pub struct ResolvedAgent {
    pub name: String,
    pub instructions: String,
    pub servers: Vec<(String, ServerDef)>,
    pub model: ModelSpec,
    pub settings: ModelSettings,
    pub max_turns: u32,
}

/// Pick the agent (flag, then default) and its model (flag, then the agent's
/// own, then the default), expanding model-profile names.
pub fn resolve_agent(
    settings: &Settings,
    agent_override: Option<&str>,
    model_override: Option<&str>,
) -> Result<ResolvedAgent> {
    let name = agent_override
        .or(settings.defaults.agent.as_deref())
        .ok_or_else(|| {
            Error::config("No agent selected. Pass --agent or run `troop agent set <name>`")
        })?;
    let agent = settings
        .agents
        .get(name)
        .ok_or_else(|| Error::config(format!("Agent {name} does not exist")))?;

    let model_ref = model_override
        .or(agent.model.as_deref())
        .or(settings.defaults.model.as_deref())
        .ok_or_else(|| {
            Error::config(format!(
                "No model specified for agent '{name}'. Pass --model or run `troop model set <provider:model>`"
            ))
        })?;

    let (model, model_settings) = match settings.models.get(model_ref) {
        Some(profile) => (
            ModelSpec::parse(&profile.model)?,
            ModelSettings::from_map(&profile.settings)?,
        ),
        None => (ModelSpec::parse(model_ref)?, ModelSettings::default()),
    };

    let missing: Vec<&str> = agent
        .servers
        .iter()
        .filter(|s| !settings.servers.contains_key(s.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(Error::config(format!(
            "Unknown MCP servers: {}",
            missing.join(", ")
        )));
    }
    let servers = agent
        .servers
        .iter()
        .map(|s| (s.clone(), settings.servers[s].clone()))
        .collect();

    Ok(ResolvedAgent {
        name: name.to_string(),
        instructions: agent.instructions.clone(),
        servers,
        model,
        settings: model_settings,
        max_turns: settings.defaults.max_turns(),
    })
}

/// The stored key for the model's provider, falling back to its
/// environment variable.
pub fn resolve_api_key(settings: &Settings, spec: &ModelSpec) -> Result<String> {
    let provider = spec.provider;
    if let Some(key) = settings.key_for(provider.name()) {
        return Ok(key.to_string());
    }
    match provider.default_api_key_env() {
        Some(var) => std::env::var(var).map_err(|_| {
            Error::config(format!(
                "No API key for {0}. Run `troop key add {0}` or set {var}",
                provider.name()
            ))
        }),
        None => Ok(String::new()),
    }
}

/// Token totals for one run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunStats {
    pub turns: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub tool_calls: u32,
}

impl RunStats {
    fn accumulate(&mut self, usage: &Usage) {
        self.turns += 1;
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The user prompt plus everything the run appended, for chat history.
    pub new_messages: Vec<ConversationMessage>,
    /// Text of the final assistant message.
    pub reply: String,
    pub stats: RunStats,
}

pub struct AgentRunner<M, T> {
    name: String,
    instructions: String,
    model: M,
    tools: T,
    max_turns: u32,
}

impl AgentRunner<LlmClient, McpManager> {
    /// Build the LLM client and start the agent's MCP servers.
    pub async fn from_settings(
        settings: &Settings,
        agent_override: Option<&str>,
        model_override: Option<&str>,
    ) -> Result<Self> {
        let resolved = resolve_agent(settings, agent_override, model_override)?;
        let api_key = resolve_api_key(settings, &resolved.model)?;
        let llm = LlmClient::new(
            resolved.model.provider,
            api_key,
            resolved.model.model.clone(),
            resolved.settings.clone(),
            None,
        )?;

        let tools = if resolved.servers.is_empty() {
            McpManager::empty()
        } else {
            McpManager::start(&resolved.servers).await?
        };

        info!(
            agent = %resolved.name,
            model = %resolved.model.model,
            servers = resolved.servers.len(),
            "agent ready"
        );
        Ok(Self::new(
            resolved.name,
            resolved.instructions,
            llm,
            tools,
            resolved.max_turns,
        ))
    }

    pub async fn shutdown(self) {
        self.tools.shutdown().await;
    }
}

impl<M: ChatModel, T: ToolHost> AgentRunner<M, T> {
    pub fn new(name: String, instructions: String, model: M, tools: T, max_turns: u32) -> Self {
        Self {
            name,
            instructions,
            model,
            tools,
            max_turns: max_turns.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tool_count(&self) -> usize {
        self.tools.tool_definitions().len()
    }

    /// Run one user prompt to completion on top of `history`.
    ///
    /// A model error aborts the run and nothing is returned for history, so
    /// a failed chat turn leaves the conversation as it was.
    pub async fn run_once<W: Write>(
        &self,
        prompt: &str,
        history: &[ConversationMessage],
        display: &mut MessageDisplay<W>,
    ) -> Result<RunOutcome> {
        let tools = self.tools.tool_definitions();
        let mut messages: Vec<ConversationMessage> = history.to_vec();
        messages.push(ConversationMessage::user_text(prompt));
        let start = history.len();
        let mut stats = RunStats::default();
        let mut reply = String::new();

        debug!(
            agent = %self.name,
            model = %self.model.model(),
            tools = tools.len(),
            "starting run"
        );

        loop {
            if stats.turns >= self.max_turns {
                warn!(turns = stats.turns, "hit max turns limit");
                let note = format!("(stopped after {} turns)", stats.turns);
                display.dim(&note)?;
                messages.push(ConversationMessage {
                    role: Role::Assistant,
                    content: vec![ContentBlock::Text { text: note }],
                });
                break;
            }

            let response = self
                .model
                .converse(&self.instructions, &messages, &tools)
                .await?;
            stats.accumulate(&response.usage);

            debug!(
                turn = stats.turns,
                stop = ?response.stop_reason,
                "agent turn"
            );

            let tool_uses: Vec<_> = response
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    _ => None,
                })
                .collect();

            let assistant = if response.content.is_empty() {
                ConversationMessage {
                    role: Role::Assistant,
                    content: vec![ContentBlock::Text {
                        text: "(no response)".into(),
                    }],
                }
            } else {
                ConversationMessage {
                    role: Role::Assistant,
                    content: response.content,
                }
            };

            let text = assistant.text();
            if !text.trim().is_empty() {
                display.agent_reply(&self.name, &text)?;
            }
            reply = text;
            messages.push(assistant);

            if tool_uses.is_empty() {
                if response.stop_reason == StopReason::MaxTokens {
                    warn!("model reply was cut off at max_tokens");
                }
                break;
            }

            let mut tool_results = Vec::with_capacity(tool_uses.len());
            for (id, name, input) in &tool_uses {
                stats.tool_calls += 1;
                debug!(tool = %name, "executing tool");
                let (result, is_error) = self.tools.call_tool(name, input).await;
                display.tool_execution(name, input, &result, is_error)?;
                tool_results.push(ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: result,
                    is_error,
                });
            }

            messages.push(ConversationMessage {
                role: Role::User,
                content: tool_results,
            });
        }

        info!(
            agent = %self.name,
            turns = stats.turns,
            tool_calls = stats.tool_calls,
            input_tokens = stats.input_tokens,
            output_tokens = stats.output_tokens,
            "run complete"
        );

        Ok(RunOutcome {
            new_messages: messages.split_off(start),
            reply,
            stats,
        })
    }

    /// Interactive loop: one run per input line, keeping history between
    /// them. `exit`, `quit` or end of input stops it. A failed run is
    /// reported and the session carries on. Returns the final history.
    pub async fn chat<R, W>(
        &self,
        input: R,
        display: &mut MessageDisplay<W>,
    ) -> Result<Vec<ConversationMessage>>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut history = Vec::new();
        let mut lines = input.lines();
        loop {
            display.prompt_prefix()?;
            let Some(line) = lines.next_line().await? else {
                display.line("")?;
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
                break;
            }
            match self.run_once(line, &history, display).await {
                Ok(outcome) => history.extend(outcome.new_messages),
                Err(e) => {
                    warn!(error = %e, "chat turn failed");
                    display.error(&e.to_string())?;
                }
            }
        }
        debug!(messages = history.len(), "chat session ended");
        Ok(history)
    }
}

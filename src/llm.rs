use crate::error::{Error, Result};
use crate::http::HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// LLM provider: picks the wire format and endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
    OpenRouter,
    Gemini,
    /// Local ollama (OpenAI-compatible, no key).
    Ollama,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Self::Anthropic,
        Self::OpenAi,
        Self::OpenRouter,
        Self::Gemini,
        Self::Ollama,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            "openrouter" => Some(Self::OpenRouter),
            "gemini" | "google" => Some(Self::Gemini),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    /// The name API keys are stored under in the config.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::OpenRouter => Some("OPENROUTER_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Ollama => None,
        }
    }

    fn base_url_env(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_BASE_URL",
            Self::OpenAi => "OPENAI_BASE_URL",
            Self::OpenRouter => "OPENROUTER_BASE_URL",
            Self::Gemini => "GEMINI_BASE_URL",
            Self::Ollama => "OLLAMA_BASE_URL",
        }
    }

    pub fn requires_key(&self) -> bool {
        self.default_api_key_env().is_some()
    }
}

/// A `provider:model` id, e.g. `openai:gpt-4o`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: Provider,
    pub model: String,
}

impl ModelSpec {
    pub fn parse(id: &str) -> Result<Self> {
        let (provider, model) = id.trim().split_once(':').ok_or_else(|| {
            Error::config(format!(
                "invalid model '{id}'. Use provider:model syntax (e.g. openai:gpt-4o)"
            ))
        })?;
        let provider = Provider::from_name(provider.trim())
            .ok_or_else(|| Error::config(format!("unknown provider '{provider}' in '{id}'")))?;
        let model = model.trim();
        if model.is_empty() {
            return Err(Error::config(format!("missing model name in '{id}'")));
        }
        Ok(Self {
            provider,
            model: model.to_string(),
        })
    }
}

/// Request settings from a model profile. Unrecognised keys are merged into
/// the request body (see `merge_extra`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelSettings {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: Option<i64>,
    pub stop_sequences: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelSettings {
    pub fn from_map(map: &BTreeMap<String, Value>) -> Result<Self> {
        let value = Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        serde_json::from_value(value)
            .map_err(|e| Error::config(format!("invalid model settings: {e}")))
    }
}

// -- Conversation types --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Content blocks use the Anthropic wire shape; the OpenAI path converts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ConversationMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// All text blocks joined with newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// One model turn: send the conversation, get the assistant's reply.
#[allow(async_fn_in_trait)]
pub trait ChatModel {
    fn model(&self) -> &str;

    async fn converse(
        &self,
        system: &str,
        messages: &[ConversationMessage],
        tools: &[ToolDef],
    ) -> Result<LlmResponse>;
}

pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    settings: ModelSettings,
    base_url: String,
    http: HttpClient,
}

impl LlmClient {
    pub fn new(
        provider: Provider,
        api_key: String,
        model: String,
        settings: ModelSettings,
        base_url: Option<String>,
    ) -> Result<Self> {
        let http = HttpClient::new(concat!("troop/", env!("CARGO_PKG_VERSION")))?;
        let base_url = base_url
            .or_else(|| std::env::var(provider.base_url_env()).ok())
            .unwrap_or_else(|| provider.default_base_url().into());
        Ok(Self {
            provider,
            api_key,
            model,
            settings,
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    async fn converse_anthropic(
        &self,
        system: &str,
        messages: &[ConversationMessage],
        tools: &[ToolDef],
    ) -> Result<LlmResponse> {
        let body = anthropic_request(&self.model, &self.settings, system, messages, tools);
        let body = serde_json::to_string(&body)
            .map_err(|e| Error::parse(format!("serialize request: {e}")))?;

        let url = format!("{}/messages", self.base_url);
        let response_text = self
            .http
            .post_json_raw(
                &url,
                &body,
                &[
                    ("x-api-key", &self.api_key),
                    ("anthropic-version", "2023-06-01"),
                ],
            )
            .await
            .map_err(|e| {
                warn!("Anthropic API error: {e}");
                e
            })?;

        parse_anthropic_response(&response_text)
    }

    async fn converse_openai(
        &self,
        system: &str,
        messages: &[ConversationMessage],
        tools: &[ToolDef],
    ) -> Result<LlmResponse> {
        let body = openai_request(
            self.provider,
            &self.model,
            &self.settings,
            system,
            messages,
            tools,
        );
        let body = serde_json::to_string(&body)
            .map_err(|e| Error::parse(format!("serialize request: {e}")))?;

        let url = format!("{}/chat/completions", self.base_url);
        let auth = format!("Bearer {}", self.api_key);
        let headers: Vec<(&str, &str)> = if self.api_key.is_empty() {
            Vec::new()
        } else {
            vec![("Authorization", auth.as_str())]
        };
        let response_text = self
            .http
            .post_json_raw(&url, &body, &headers)
            .await
            .map_err(|e| {
                warn!("LLM API error: {e}");
                e
            })?;

        parse_openai_response(&response_text)
    }
}

impl ChatModel for LlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn converse(
        &self,
        system: &str,
        messages: &[ConversationMessage],
        tools: &[ToolDef],
    ) -> Result<LlmResponse> {
        debug!(
            provider = ?self.provider,
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            "sending LLM request"
        );
        match self.provider {
            Provider::Anthropic => self.converse_anthropic(system, messages, tools).await,
            Provider::OpenAi | Provider::OpenRouter | Provider::Gemini | Provider::Ollama => {
                self.converse_openai(system, messages, tools).await
            }
        }
    }
}

/// Copies extra settings into the body. A key prefixed with a provider name
/// (`anthropic_thinking`, `openai:reasoning_effort`) only reaches that
/// provider, with the prefix stripped.
fn merge_extra(body: &mut Value, extra: &Map<String, Value>, provider: Provider) {
    let Value::Object(obj) = body else {
        return;
    };
    for (k, v) in extra {
        let key = match k.split_once(['_', ':']) {
            Some((prefix, rest)) if !rest.is_empty() => match Provider::from_name(prefix) {
                Some(p) if p == provider => rest,
                Some(_) => continue,
                None => k.as_str(),
            },
            _ => k.as_str(),
        };
        obj.insert(key.to_string(), v.clone());
    }
}

// -- Anthropic format --

fn anthropic_request(
    model: &str,
    settings: &ModelSettings,
    system: &str,
    messages: &[ConversationMessage],
    tools: &[ToolDef],
) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = json!(system);
    }
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    if let Some(t) = settings.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = settings.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(stop) = &settings.stop_sequences {
        body["stop_sequences"] = json!(stop);
    }
    merge_extra(&mut body, &settings.extra, Provider::Anthropic);
    body
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<Value>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

fn parse_anthropic_response(text: &str) -> Result<LlmResponse> {
    let resp: AnthropicResponse = serde_json::from_str(text)
        .map_err(|e| Error::parse(format!("parse Anthropic response: {e}")))?;

    // Thinking and other non-text blocks are dropped.
    let content = resp
        .content
        .into_iter()
        .filter_map(|b| serde_json::from_value::<ContentBlock>(b).ok())
        .collect();

    let stop_reason = match resp.stop_reason.as_deref() {
        Some("end_turn") | Some("stop_sequence") => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::Other,
    };

    Ok(LlmResponse {
        content,
        stop_reason,
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
        },
    })
}

// -- OpenAI-compatible format --

fn openai_request(
    provider: Provider,
    model: &str,
    settings: &ModelSettings,
    system: &str,
    messages: &[ConversationMessage],
    tools: &[ToolDef],
) -> Value {
    let mut wire = Vec::new();
    if !system.is_empty() {
        wire.push(json!({"role": "system", "content": system}));
    }
    for msg in messages {
        wire.extend(openai_messages(msg));
    }

    let mut body = json!({
        "model": model,
        "messages": wire,
    });
    if !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
    }
    if let Some(max) = settings.max_tokens {
        let key = if provider == Provider::OpenAi {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };
        body[key] = json!(max);
    }
    if let Some(t) = settings.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = settings.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(seed) = settings.seed {
        body["seed"] = json!(seed);
    }
    if let Some(stop) = &settings.stop_sequences {
        body["stop"] = json!(stop);
    }
    merge_extra(&mut body, &settings.extra, provider);
    body
}

/// One conversation message may expand to several wire messages: tool
/// results each become a `tool` role message.
fn openai_messages(msg: &ConversationMessage) -> Vec<Value> {
    let mut out = Vec::new();
    match msg.role {
        Role::User => {
            let mut texts = Vec::new();
            for block in &msg.content {
                match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => out.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    })),
                    ContentBlock::Text { text } => texts.push(text.as_str()),
                    ContentBlock::ToolUse { .. } => {}
                }
            }
            if !texts.is_empty() {
                out.push(json!({"role": "user", "content": texts.join("\n")}));
            }
        }
        Role::Assistant => {
            let text = msg.text();
            let tool_calls: Vec<Value> = msg
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": input.to_string()},
                    })),
                    _ => None,
                })
                .collect();
            let mut m = json!({
                "role": "assistant",
                "content": if text.is_empty() { Value::Null } else { json!(text) },
            });
            if !tool_calls.is_empty() {
                m["tool_calls"] = json!(tool_calls);
            }
            out.push(m);
        }
    }
    out
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Deserialize)]
struct OpenAiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn parse_openai_response(text: &str) -> Result<LlmResponse> {
    let resp: OpenAiResponse = serde_json::from_str(text)
        .map_err(|e| Error::parse(format!("parse LLM response: {e}")))?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::parse("empty response from LLM"))?;

    let mut content = Vec::new();
    if let Some(text) = choice.message.content
        && !text.is_empty()
    {
        content.push(ContentBlock::Text { text });
    }
    for call in choice.message.tool_calls {
        let input = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.function.arguments).unwrap_or_else(|e| {
                warn!(tool = %call.function.name, error = %e, "tool arguments are not JSON");
                Value::String(call.function.arguments.clone())
            })
        };
        content.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    let stop_reason = match choice.finish_reason.as_deref() {
        Some("stop") => StopReason::EndTurn,
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::Other,
    };

    let usage = resp
        .usage
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(LlmResponse {
        content,
        stop_reason,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ToolDef {
        ToolDef {
            name: "search".into(),
            description: "Search the web".into(),
            input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        }
    }

    fn tool_round() -> Vec<ConversationMessage> {
        vec![
            ConversationMessage::user_text("find rust"),
            ConversationMessage {
                role: Role::Assistant,
                content: vec![
                    ContentBlock::Text {
                        text: "Searching.".into(),
                    },
                    ContentBlock::ToolUse {
                        id: "call_1".into(),
                        name: "search".into(),
                        input: json!({"q": "rust"}),
                    },
                ],
            },
            ConversationMessage {
                role: Role::User,
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: "call_1".into(),
                    content: "rust-lang.org".into(),
                    is_error: false,
                }],
            },
        ]
    }

    #[test]
    fn model_spec_parses_provider_prefix() {
        let spec = ModelSpec::parse("openai:gpt-4o").unwrap();
        assert_eq!(spec.provider, Provider::OpenAi);
        assert_eq!(spec.model, "gpt-4o");

        let spec = ModelSpec::parse("openrouter:meta-llama/llama-3:free").unwrap();
        assert_eq!(spec.provider, Provider::OpenRouter);
        assert_eq!(spec.model, "meta-llama/llama-3:free");

        assert!(ModelSpec::parse("gpt-4o").is_err());
        assert!(ModelSpec::parse("nope:model").is_err());
        assert!(ModelSpec::parse("anthropic:").is_err());
    }

    #[test]
    fn settings_split_known_and_extra_keys() {
        let mut map = BTreeMap::new();
        map.insert("temperature".to_string(), json!(0.3));
        map.insert("max_tokens".to_string(), json!(256));
        map.insert("openai_reasoning_effort".to_string(), json!("low"));
        let s = ModelSettings::from_map(&map).unwrap();
        assert_eq!(s.temperature, Some(0.3));
        assert_eq!(s.max_tokens, Some(256));
        assert_eq!(s.extra.get("openai_reasoning_effort"), Some(&json!("low")));
    }

    #[test]
    fn provider_prefixed_settings_only_reach_their_provider() {
        let mut map = BTreeMap::new();
        map.insert("anthropic_thinking".to_string(), json!({"type": "enabled"}));
        map.insert("openai_reasoning_effort".to_string(), json!("low"));
        map.insert("top_k".to_string(), json!(5));
        let s = ModelSettings::from_map(&map).unwrap();

        let body = anthropic_request("claude", &s, "", &[], &[]);
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["top_k"], 5);
        assert!(body.get("reasoning_effort").is_none());
        assert!(body.get("anthropic_thinking").is_none());
        assert!(body.get("openai_reasoning_effort").is_none());

        let body = openai_request(Provider::OpenAi, "gpt-4o", &s, "", &[], &[]);
        assert_eq!(body["reasoning_effort"], "low");
        assert_eq!(body["top_k"], 5);
        assert!(body.get("thinking").is_none());
        assert!(body.get("openai_reasoning_effort").is_none());

        let body = openai_request(Provider::OpenRouter, "x/y", &s, "", &[], &[]);
        assert!(body.get("reasoning_effort").is_none());
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn anthropic_request_shape() {
        let settings = ModelSettings {
            temperature: Some(0.1),
            ..Default::default()
        };
        let body = anthropic_request("claude", &settings, "be brief", &tool_round(), &[tool()]);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["messages"][1]["content"][1]["type"], "tool_use");
        assert_eq!(body["messages"][2]["content"][0]["type"], "tool_result");
        assert_eq!(body["messages"][2]["content"][0]["is_error"], false);
        assert_eq!(body["temperature"], 0.1);
    }

    #[test]
    fn openai_request_expands_tool_results() {
        let settings = ModelSettings {
            max_tokens: Some(100),
            ..Default::default()
        };
        let body = openai_request(
            Provider::OpenAi,
            "gpt-4o",
            &settings,
            "sys",
            &tool_round(),
            &[tool()],
        );
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[2]["role"], "assistant");
        assert_eq!(msgs[2]["tool_calls"][0]["function"]["arguments"], "{\"q\":\"rust\"}");
        assert_eq!(msgs[3]["role"], "tool");
        assert_eq!(msgs[3]["tool_call_id"], "call_1");
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert_eq!(body["max_completion_tokens"], 100);
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn anthropic_response_with_tool_use() {
        let raw = r#"{
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "x"},
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "tu_1", "name": "search", "input": {"q": "x"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }"#;
        let resp = parse_anthropic_response(raw).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.content.len(), 2);
        assert_eq!(resp.usage.output_tokens, 5);
        assert!(matches!(&resp.content[1], ContentBlock::ToolUse { name, .. } if name == "search"));
    }

    #[test]
    fn openai_response_with_tool_calls() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "search", "arguments": "{\"q\":\"y\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4}
        }"#;
        let resp = parse_openai_response(raw).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(
            resp.content,
            vec![ContentBlock::ToolUse {
                id: "call_9".into(),
                name: "search".into(),
                input: json!({"q": "y"}),
            }]
        );
        assert_eq!(resp.usage.input_tokens, 3);
    }

    #[test]
    fn openai_empty_choices_is_error() {
        assert!(parse_openai_response(r#"{"choices": []}"#).is_err());
    }
}

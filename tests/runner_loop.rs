use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use troop::display::MessageDisplay;
use troop::error::{Error, Result};
use troop::llm::{
    ChatModel, ContentBlock, ConversationMessage, LlmResponse, Role, StopReason, ToolDef, Usage,
};
use troop::mcp::ToolHost;
use troop::runner::AgentRunner;

/// Replays canned replies and records how many messages each call saw.
struct ScriptedModel {
    replies: Mutex<VecDeque<std::result::Result<LlmResponse, String>>>,
    seen: Arc<Mutex<Vec<usize>>>,
    loop_forever: bool,
}

impl ScriptedModel {
    fn new(replies: Vec<std::result::Result<LlmResponse, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Arc::default(),
            loop_forever: false,
        }
    }

    /// Always asks for the `add` tool.
    fn looping() -> Self {
        Self {
            loop_forever: true,
            ..Self::new(Vec::new())
        }
    }

    /// Handle on the per-call message counts, usable after the model moves.
    fn calls(&self) -> Arc<Mutex<Vec<usize>>> {
        self.seen.clone()
    }
}

impl ChatModel for ScriptedModel {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn converse(
        &self,
        _system: &str,
        messages: &[ConversationMessage],
        _tools: &[ToolDef],
    ) -> Result<LlmResponse> {
        self.seen.lock().unwrap().push(messages.len());
        if self.loop_forever {
            return Ok(tool_use("t", "add", json!({"a": 1, "b": 1})));
        }
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(r)) => Ok(r),
            Some(Err(msg)) => Err(Error::api("scripted", msg)),
            None => Err(Error::api("scripted", "script exhausted")),
        }
    }
}

/// One tool, `add`, summing `a` and `b`.
struct Calculator;

impl ToolHost for Calculator {
    fn tool_definitions(&self) -> Vec<ToolDef> {
        vec![ToolDef {
            name: "add".into(),
            description: "Add two numbers".into(),
            input_schema: json!({"type": "object"}),
        }]
    }

    async fn call_tool(&self, name: &str, input: &Value) -> (String, bool) {
        match name {
            "add" => {
                let a = input["a"].as_i64().unwrap_or(0);
                let b = input["b"].as_i64().unwrap_or(0);
                ((a + b).to_string(), false)
            }
            other => (format!("Unknown tool: {other}"), true),
        }
    }
}

fn text(t: &str) -> LlmResponse {
    LlmResponse {
        content: vec![ContentBlock::Text { text: t.into() }],
        stop_reason: StopReason::EndTurn,
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

fn tool_use(id: &str, name: &str, input: Value) -> LlmResponse {
    LlmResponse {
        content: vec![ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }],
        stop_reason: StopReason::ToolUse,
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

fn runner(model: ScriptedModel, max_turns: u32) -> AgentRunner<ScriptedModel, Calculator> {
    AgentRunner::new(
        "helper".into(),
        "You add numbers.".into(),
        model,
        Calculator,
        max_turns,
    )
}

fn output(display: MessageDisplay<Vec<u8>>) -> String {
    console::strip_ansi_codes(&String::from_utf8(display.into_inner()).unwrap()).into_owned()
}

#[tokio::test]
async fn tool_calls_feed_back_until_final_answer() {
    let model = ScriptedModel::new(vec![
        Ok(tool_use("call-1", "add", json!({"a": 2, "b": 3}))),
        Ok(text("The answer is 5.")),
    ]);
    let runner = runner(model, 10);
    let mut display = MessageDisplay::new(Vec::new(), true);

    let outcome = runner.run_once("2 + 3?", &[], &mut display).await.unwrap();

    assert_eq!(outcome.reply, "The answer is 5.");
    assert_eq!(outcome.stats.turns, 2);
    assert_eq!(outcome.stats.tool_calls, 1);
    assert_eq!(outcome.stats.input_tokens, 20);
    assert_eq!(outcome.new_messages.len(), 4);
    assert_eq!(outcome.new_messages[0], ConversationMessage::user_text("2 + 3?"));
    assert_eq!(
        outcome.new_messages[2].content,
        vec![ContentBlock::ToolResult {
            tool_use_id: "call-1".into(),
            content: "5".into(),
            is_error: false,
        }]
    );
    assert_eq!(outcome.new_messages[3].role, Role::Assistant);

    let out = output(display);
    assert!(out.contains("add {\"a\":2,\"b\":3}"), "{out}");
    assert!(out.contains("Helper:\nThe answer is 5."), "{out}");
}

#[tokio::test]
async fn unknown_tool_is_reported_to_the_model() {
    let model = ScriptedModel::new(vec![
        Ok(tool_use("c1", "multiply", json!({}))),
        Ok(text("Sorry, I cannot multiply.")),
    ]);
    let runner = runner(model, 10);
    let mut display = MessageDisplay::new(Vec::new(), false);

    let outcome = runner.run_once("2 * 3?", &[], &mut display).await.unwrap();

    assert!(matches!(
        &outcome.new_messages[2].content[0],
        ContentBlock::ToolResult { is_error: true, content, .. } if content == "Unknown tool: multiply"
    ));
    assert_eq!(outcome.reply, "Sorry, I cannot multiply.");
}

#[tokio::test]
async fn turn_limit_stops_the_loop() {
    let runner = runner(ScriptedModel::looping(), 3);
    let mut display = MessageDisplay::new(Vec::new(), false);

    let outcome = runner.run_once("loop", &[], &mut display).await.unwrap();

    assert_eq!(outcome.stats.turns, 3);
    assert_eq!(outcome.stats.tool_calls, 3);
    let last = outcome.new_messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.text(), "(stopped after 3 turns)");
    assert!(output(display).contains("stopped after 3 turns"));
}

#[tokio::test]
async fn zero_turn_limit_still_asks_the_model() {
    let runner = runner(ScriptedModel::new(vec![Ok(text("hello"))]), 0);
    let mut display = MessageDisplay::new(Vec::new(), false);

    let outcome = runner.run_once("hi", &[], &mut display).await.unwrap();

    assert_eq!(outcome.reply, "hello");
    assert_eq!(outcome.stats.turns, 1);
}

#[tokio::test]
async fn model_errors_propagate() {
    let runner = runner(ScriptedModel::new(vec![Err("overloaded".into())]), 5);
    let mut display = MessageDisplay::new(Vec::new(), false);
    let err = runner.run_once("hi", &[], &mut display).await.unwrap_err();
    assert!(err.to_string().contains("overloaded"));
}

#[tokio::test]
async fn empty_reply_gets_a_placeholder() {
    let empty = LlmResponse {
        content: Vec::new(),
        stop_reason: StopReason::EndTurn,
        usage: Usage::default(),
    };
    let runner = runner(ScriptedModel::new(vec![Ok(empty)]), 5);
    let mut display = MessageDisplay::new(Vec::new(), false);
    let outcome = runner.run_once("hi", &[], &mut display).await.unwrap();
    assert_eq!(outcome.new_messages.len(), 2);
    assert_eq!(outcome.new_messages[1].text(), "(no response)");
}

#[tokio::test]
async fn chat_keeps_history_and_survives_errors() {
    let model = ScriptedModel::new(vec![
        Err("rate limited".into()),
        Ok(text("Hello!")),
        Ok(text("You said hi.")),
    ]);
    let calls = model.calls();
    let runner = runner(model, 5);
    let mut display = MessageDisplay::new(Vec::new(), false);

    let input: &[u8] = b"first\n\nhi\nwhat did I say?\nquit\nnever sent\n";
    let history = runner.chat(input, &mut display).await.unwrap();

    // The failed turn leaves nothing behind.
    assert_eq!(history.len(), 4);
    assert_eq!(history[0], ConversationMessage::user_text("hi"));
    assert_eq!(history[3].text(), "You said hi.");
    assert_eq!(*calls.lock().unwrap(), vec![1, 1, 3]);

    let out = output(display);
    assert!(out.contains("Error:"), "{out}");
    assert!(out.contains("rate limited"), "{out}");
}

#[tokio::test]
async fn chat_ends_at_end_of_input() {
    let runner = runner(ScriptedModel::new(vec![Ok(text("ok"))]), 5);
    let mut display = MessageDisplay::new(Vec::new(), false);
    let input: &[u8] = b"one";
    let history = runner.chat(input, &mut display).await.unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn history_is_sent_with_each_prompt() {
    let model = ScriptedModel::new(vec![Ok(text("a")), Ok(text("b"))]);
    let calls = model.calls();
    let runner = runner(model, 5);
    let mut display = MessageDisplay::new(Vec::new(), false);

    let first = runner.run_once("one", &[], &mut display).await.unwrap();
    let second = runner
        .run_once("two", &first.new_messages, &mut display)
        .await
        .unwrap();
    assert_eq!(second.new_messages.len(), 2);
    assert_eq!(*calls.lock().unwrap(), vec![1, 3]);
}

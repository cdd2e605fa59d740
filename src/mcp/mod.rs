//! MCP (Model Context Protocol) client over stdio.
//!
//! Each configured server is spawned as a child process and spoken to with
//! newline-delimited JSON-RPC 2.0. The manager merges the tools of all an
//! agent's servers into one namespace for the model.

pub mod client;
pub mod jsonrpc;
pub mod manager;
pub mod protocol;

pub use client::McpClient;
pub use manager::McpManager;
pub use protocol::{McpContent, McpToolDef, McpToolResult, format_mcp_result};

use crate::llm::ToolDef;
use serde_json::Value;

/// Something that can list and execute tools on the model's behalf.
#[allow(async_fn_in_trait)]
pub trait ToolHost {
    fn tool_definitions(&self) -> Vec<ToolDef>;

    /// Returns `(result_text, is_error)`. Failures are reported to the model
    /// rather than aborting the run.
    async fn call_tool(&self, name: &str, input: &Value) -> (String, bool);
}

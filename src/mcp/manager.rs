//! Runs every MCP server an agent uses and routes tool calls between them.

use super::ToolHost;
use super::client::McpClient;
use super::protocol::{McpToolDef, format_mcp_result};
use crate::config::ServerDef;
use crate::error::Result;
use crate::llm::ToolDef;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Providers only accept `[a-zA-Z0-9_-]{1,64}` tool names.
const MAX_TOOL_NAME: usize = 64;

/// Where an exposed tool name leads.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub exposed: String,
    pub server: usize,
    pub tool: String,
}

pub struct McpManager {
    clients: Vec<McpClient>,
    routes: HashMap<String, Route>,
    tools: Vec<ToolDef>,
}

impl McpManager {
    /// A manager with no servers (an agent without tools).
    pub fn empty() -> Self {
        Self {
            clients: Vec::new(),
            routes: HashMap::new(),
            tools: Vec::new(),
        }
    }

    /// Spawn and initialize every server, then collect their tools.
    /// Any server failing to start aborts the whole set.
    pub async fn start(servers: &[(String, ServerDef)]) -> Result<Self> {
        let mut clients = Vec::with_capacity(servers.len());
        for (name, def) in servers {
            match McpClient::spawn(name, def).await {
                Ok(client) => clients.push(client),
                Err(e) => {
                    for c in clients {
                        c.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }
        Self::from_clients(clients).await
    }

    /// Build routes over already-initialized clients.
    pub async fn from_clients(clients: Vec<McpClient>) -> Result<Self> {
        let mut listings = Vec::with_capacity(clients.len());
        for client in &clients {
            let tools = client.list_tools().await?;
            info!(server = %client.name(), tools = tools.len(), "MCP tools discovered");
            listings.push((client.name().to_string(), tools));
        }

        let mut routes = HashMap::new();
        let mut tools = Vec::new();
        for (route, def) in build_routes(&listings) {
            tools.push(ToolDef {
                name: route.exposed.clone(),
                description: def.description.clone().unwrap_or_default(),
                input_schema: def.input_schema.clone(),
            });
            routes.insert(route.exposed.clone(), route);
        }

        Ok(Self {
            clients,
            routes,
            tools,
        })
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.clients.iter().map(McpClient::name).collect()
    }

    pub async fn shutdown(self) {
        for client in self.clients {
            client.shutdown().await;
        }
    }
}

impl ToolHost for McpManager {
    fn tool_definitions(&self) -> Vec<ToolDef> {
        self.tools.clone()
    }

    async fn call_tool(&self, name: &str, input: &Value) -> (String, bool) {
        let Some(route) = self.routes.get(name) else {
            return (format!("Unknown tool: {name}"), true);
        };
        let client = &self.clients[route.server];
        debug!(server = %client.name(), tool = %route.tool, "calling MCP tool");
        match client.call_tool(&route.tool, input).await {
            Ok(result) => (format_mcp_result(&result), result.is_error),
            Err(e) => {
                warn!(tool = %name, error = %e, "MCP tool call failed");
                (format!("MCP error: {e}"), true)
            }
        }
    }
}

/// Expose each server's tools under a provider-safe name. Names offered by
/// more than one server are prefixed with `<server>__`.
pub fn build_routes(listings: &[(String, Vec<McpToolDef>)]) -> Vec<(Route, &McpToolDef)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (_, tools) in listings {
        for t in tools {
            *counts.entry(t.name.as_str()).or_default() += 1;
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for (idx, (server, tools)) in listings.iter().enumerate() {
        for def in tools {
            let raw = if counts[def.name.as_str()] > 1 {
                format!("{server}__{}", def.name)
            } else {
                def.name.clone()
            };
            let exposed = sanitize_tool_name(&raw);
            if !seen.insert(exposed.clone()) {
                warn!(server = %server, tool = %def.name, "duplicate tool name, skipping");
                continue;
            }
            out.push((
                Route {
                    exposed,
                    server: idx,
                    tool: def.name.clone(),
                },
                def,
            ));
        }
    }
    out
}

fn sanitize_tool_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TOOL_NAME)
        .collect();
    if cleaned.is_empty() {
        "tool".into()
    } else {
        cleaned
    }
}

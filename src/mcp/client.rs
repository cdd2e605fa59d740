//! A single MCP server connection over newline-delimited JSON-RPC.
//!
//! A background task reads the server's stdout and hands each response to
//! the caller waiting on that request id. Server-initiated requests are
//! answered from the same task (`ping` succeeds, everything else is
//! method-not-found).

use super::jsonrpc::{self, Message, Notification, Request, Response, RpcError};
use super::protocol::{
    InitializeResult, ListToolsResult, McpToolDef, McpToolResult, PROTOCOL_VERSION, ServerInfo,
};
use crate::config::ServerDef;
use crate::error::{Error, Result};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TOOL_PAGES: usize = 100;

type Writer = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Value, RpcError>>>>>;

pub struct McpClient {
    name: String,
    writer: Writer,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    child: Option<Child>,
    timeout: Duration,
    server_info: ServerInfo,
}

impl McpClient {
    /// Launch the server process and run the initialize handshake.
    ///
    /// The child inherits troop's environment plus `server.env`; its stderr
    /// is discarded so chatty servers don't corrupt the terminal.
    pub async fn spawn(name: &str, server: &ServerDef) -> Result<Self> {
        let (program, args) = server
            .command
            .split_first()
            .ok_or_else(|| Error::mcp(name, "empty command"))?;

        debug!(server = %name, program = %program, "spawning MCP server");
        let mut child = Command::new(program)
            .args(args)
            .envs(&server.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::mcp(name, format!("failed to start '{program}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::mcp(name, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::mcp(name, "child stdout unavailable"))?;

        let mut client = Self::connect(name, stdout, stdin);
        client.child = Some(child);
        client.initialize().await?;
        Ok(client)
    }

    /// Wrap an already-open byte stream pair. Call [`initialize`](Self::initialize)
    /// before anything else.
    pub fn connect<R, W>(name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Writer = Arc::new(Mutex::new(Box::new(writer)));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            name.to_string(),
            reader,
            writer.clone(),
            pending.clone(),
            closed.clone(),
        ));

        Self {
            name: name.to_string(),
            writer,
            pending,
            closed,
            next_id: AtomicU64::new(1),
            reader,
            child: None,
            timeout: DEFAULT_TIMEOUT,
            server_info: ServerInfo::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub async fn initialize(&mut self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "troop", "version": env!("CARGO_PKG_VERSION")},
        });
        let raw = self.request("initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(raw)
            .map_err(|e| Error::mcp(&self.name, format!("bad initialize result: {e}")))?;
        info!(
            server = %self.name,
            remote = %init.server_info.name,
            protocol = %init.protocol_version,
            "MCP server initialized"
        );
        self.server_info = init.server_info;
        self.notify("notifications/initialized", None).await
    }

    /// All tools the server offers, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({"cursor": c}));
            let raw = self.request("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(raw)
                .map_err(|e| Error::mcp(&self.name, format!("bad tools/list result: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
        warn!(server = %self.name, "tools/list pagination did not terminate");
        Ok(tools)
    }

    pub async fn call_tool(&self, tool: &str, arguments: &Value) -> Result<McpToolResult> {
        let arguments = match arguments {
            Value::Object(_) => arguments.clone(),
            Value::Null => json!({}),
            _ => {
                return Err(Error::mcp(
                    &self.name,
                    format!("arguments for '{tool}' must be a JSON object"),
                ));
            }
        };
        let raw = self
            .request(
                "tools/call",
                Some(json!({"name": tool, "arguments": arguments})),
            )
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| Error::mcp(&self.name, format!("bad tools/call result: {e}")))
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.closed.load(Ordering::Acquire) {
            self.pending.lock().await.remove(&id);
            return Err(Error::mcp(&self.name, "connection closed"));
        }

        let line = serde_json::to_string(&Request::new(id, method, params))
            .map_err(|e| Error::parse(format!("serialize request: {e}")))?;
        debug!(server = %self.name, id, method, "MCP request");
        if let Err(e) = send_line(&self.writer, &line).await {
            self.pending.lock().await.remove(&id);
            return Err(Error::mcp(&self.name, format!("write failed: {e}")));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(rpc))) => Err(Error::mcp(
                &self.name,
                format!("{method} failed: {} (code {})", rpc.message, rpc.code),
            )),
            Ok(Err(_)) => Err(Error::mcp(&self.name, "connection closed")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::mcp(
                    &self.name,
                    format!("{method} timed out after {}s", self.timeout.as_secs()),
                ))
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = serde_json::to_string(&Notification::new(method, params))
            .map_err(|e| Error::parse(format!("serialize notification: {e}")))?;
        send_line(&self.writer, &line)
            .await
            .map_err(|e| Error::mcp(&self.name, format!("write failed: {e}")))
    }

    /// Close stdin and give the process a moment to exit before killing it.
    pub async fn shutdown(mut self) {
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if let Some(child) = self.child.as_mut() {
            match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                Ok(_) => debug!(server = %self.name, "MCP server exited"),
                Err(_) => {
                    debug!(server = %self.name, "MCP server did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn send_line(writer: &Writer, line: &str) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await
}

async fn read_loop<R>(name: String, reader: R, writer: Writer, pending: Pending, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match jsonrpc::parse_line(&line) {
                Some(Message::Response { id, result }) => {
                    if let Some(tx) = pending.lock().await.remove(&id) {
                        let _ = tx.send(result);
                    } else {
                        debug!(server = %name, id, "response for unknown request");
                    }
                }
                Some(Message::Request { id, method }) => {
                    let reply = if method == "ping" {
                        Response::ok(id, json!({}))
                    } else {
                        Response::err(id, jsonrpc::METHOD_NOT_FOUND, format!("unsupported method: {method}"))
                    };
                    if let Ok(line) = serde_json::to_string(&reply)
                        && let Err(e) = send_line(&writer, &line).await
                    {
                        warn!(server = %name, error = %e, "failed to answer server request");
                    }
                }
                Some(Message::Notification { method }) => {
                    debug!(server = %name, method = %method, "MCP notification");
                }
                None => debug!(server = %name, "ignoring non-JSON-RPC output"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(server = %name, error = %e, "MCP read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    // Dropping the senders wakes every waiter with a closed-channel error.
    pending.lock().await.clear();
    debug!(server = %name, "MCP connection closed");
}

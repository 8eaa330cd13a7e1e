use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::broker::{BrokerSnapshot, CommandBroker};
use crate::error::BrokerError;
use crate::types::CommandId;

pub const EXECUTE_SCRIPT_TOOL: &str = "execute_script";
pub const CONNECTION_STATUS_TOOL: &str = "connection_status";

const JSONRPC_PARSE_ERROR: i64 = -32700;
const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
const JSONRPC_INVALID_PARAMS: i64 = -32602;
const OUTBOUND_QUEUE: usize = 64;

/// Commands issued by running `execute_script` calls, keyed by request id.
type InFlight = Arc<Mutex<HashMap<String, CommandId>>>;

/// Newline-delimited JSON-RPC tool surface for a local agent.
#[derive(Clone)]
pub struct ToolServer {
    broker: Arc<CommandBroker>,
}

impl ToolServer {
    pub fn new(broker: Arc<CommandBroker>) -> Self {
        Self { broker }
    }

    pub async fn serve_stdio(&self) -> Result<()> {
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Serve requests from `reader` until it reaches end of input.
    ///
    /// `tools/call` requests run concurrently; every response goes through a
    /// single writer task so frames never interleave. Calls still in flight
    /// when input closes are aborted and their commands withdrawn. A
    /// `notifications/cancelled` for a running call cancels its command.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Value>(OUTBOUND_QUEUE);
        let writer_task = tokio::spawn(write_frames(writer, rx));
        let mut calls = JoinSet::new();
        let in_flight: InFlight = Arc::default();
        let mut lines = reader.lines();

        while let Some(line) = lines
            .next_line()
            .await
            .context("failed reading tool request")?
        {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            while calls.try_join_next().is_some() {}

            let message = match serde_json::from_str::<Value>(trimmed) {
                Ok(message) => message,
                Err(err) => {
                    debug!("unparseable tool frame: {err}");
                    let frame = error_frame(Value::Null, JSONRPC_PARSE_ERROR, "parse error");
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let id = message.get("id").cloned().filter(|id| !id.is_null());
            let method = message
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
            let Some(id) = id else {
                if method == "notifications/cancelled" {
                    if let Some(request_id) = params.get("requestId") {
                        self.cancel_request(&in_flight, &request_id.to_string())
                            .await;
                    }
                } else {
                    debug!("tool notification {method}");
                }
                continue;
            };

            if method == "tools/call" {
                let broker = self.broker.clone();
                let tx = tx.clone();
                let in_flight = in_flight.clone();
                calls.spawn(async move {
                    let key = id.to_string();
                    let frame = match call_tool(&broker, &params, &in_flight, &key).await {
                        Ok(result) => result_frame(id, result),
                        Err((code, message)) => error_frame(id, code, &message),
                    };
                    let _ = tx.send(frame).await;
                });
                continue;
            }

            let frame = match method.as_str() {
                "initialize" => {
                    let protocol = params
                        .get("protocolVersion")
                        .and_then(Value::as_str)
                        .unwrap_or("2024-11-05");
                    result_frame(
                        id,
                        json!({
                            "protocolVersion": protocol,
                            "capabilities": { "tools": {} },
                            "serverInfo": {
                                "name": env!("CARGO_PKG_NAME"),
                                "version": env!("CARGO_PKG_VERSION")
                            }
                        }),
                    )
                }
                "ping" => result_frame(id, json!({})),
                "tools/list" => result_frame(id, json!({ "tools": tool_definitions() })),
                other => error_frame(
                    id,
                    JSONRPC_METHOD_NOT_FOUND,
                    &format!("method not found: {other}"),
                ),
            };
            if tx.send(frame).await.is_err() {
                break;
            }
        }

        info!("tool input closed");
        calls.shutdown().await;
        let abandoned = std::mem::take(&mut *in_flight.lock().await);
        for command_id in abandoned.into_values() {
            self.broker.cancel_command(&command_id).await;
        }
        drop(tx);
        writer_task.await.context("tool writer task failed")??;
        Ok(())
    }

    async fn cancel_request(&self, in_flight: &InFlight, request_key: &str) {
        let command_id = in_flight.lock().await.remove(request_key);
        match command_id {
            Some(command_id) => {
                self.broker.cancel_command(&command_id).await;
            }
            None => debug!("cancel for unknown or finished request {request_key}"),
        }
    }
}

async fn write_frames<W>(mut writer: W, mut rx: mpsc::Receiver<Value>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let mut payload = serde_json::to_vec(&frame).context("failed serializing tool frame")?;
        payload.push(b'\n');
        writer
            .write_all(&payload)
            .await
            .context("failed writing tool frame")?;
        writer.flush().await.context("failed flushing tool frame")?;
    }
    Ok(())
}

fn result_frame(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_frame(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": EXECUTE_SCRIPT_TOOL,
            "description": "Run a script in the connected remote runtime. Anything the script logs is returned alongside its return value.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "Script source to execute" }
                },
                "required": ["code"]
            }
        },
        {
            "name": CONNECTION_STATUS_TOOL,
            "description": "Report whether the remote runtime is connected and how many commands are in flight.",
            "inputSchema": { "type": "object", "properties": {} }
        }
    ])
}

async fn call_tool(
    broker: &CommandBroker,
    params: &Value,
    in_flight: &InFlight,
    request_key: &str,
) -> Result<Value, (i64, String)> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        EXECUTE_SCRIPT_TOOL => {
            let Some(code) = arguments.get("code").and_then(Value::as_str) else {
                return Err((
                    JSONRPC_INVALID_PARAMS,
                    "execute_script requires a string `code` argument".to_owned(),
                ));
            };
            let id = broker
                .run_command(EXECUTE_SCRIPT_TOOL, json!({ "code": code }))
                .await;
            debug!("execute_script queued as {id}");
            in_flight
                .lock()
                .await
                .insert(request_key.to_owned(), id.clone());
            let outcome = broker.await_result(&id).await;
            in_flight.lock().await.remove(request_key);
            Ok(render_script_outcome(outcome))
        }
        CONNECTION_STATUS_TOOL => {
            let snapshot = broker.snapshot().await;
            Ok(text_content(vec![render_snapshot(&snapshot)], false))
        }
        other => {
            warn!("unknown tool requested: {other}");
            Err((JSONRPC_INVALID_PARAMS, format!("unknown tool: {other}")))
        }
    }
}

fn render_script_outcome(outcome: Result<Value, BrokerError>) -> Value {
    match outcome {
        Ok(result) => {
            let output = result.get("output").unwrap_or(&result);
            let output_text =
                serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string());
            let logs = result
                .get("logs")
                .and_then(Value::as_array)
                .map(|lines| {
                    lines
                        .iter()
                        .map(|line| match line {
                            Value::String(text) => text.clone(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            text_content(vec![output_text, format!("Logs:\n{logs}")], false)
        }
        Err(err) => text_content(vec![format!("Error executing script: {err}")], true),
    }
}

fn render_snapshot(snapshot: &BrokerSnapshot) -> String {
    let last_signal = snapshot
        .last_signal_ms
        .map(|ms| ms.to_string())
        .unwrap_or_else(|| "never".to_owned());
    format!(
        "state: {}\nlast keep-alive (unix ms): {}\npending commands: {}\nunclaimed results: {}\nwaiting callers: {}",
        snapshot.state.label(),
        last_signal,
        snapshot.pending,
        snapshot.resolved,
        snapshot.waiters
    )
}

fn text_content(blocks: Vec<String>, is_error: bool) -> Value {
    let content = blocks
        .into_iter()
        .map(|text| json!({ "type": "text", "text": text }))
        .collect::<Vec<_>>();
    json!({ "content": content, "isError": is_error })
}

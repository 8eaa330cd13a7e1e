use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::broker::{CommandBroker, SubmitReport};
use crate::config::ServerConfig;
use crate::error::BrokerError;

pub const KEEP_ALIVE_PATH: &str = "/keep-alive";
pub const GET_COMMANDS_PATH: &str = "/get-commands";
pub const SUBMIT_COMMANDS_PATH: &str = "/submit-commands";
pub const STATUS_PATH: &str = "/status";

const MAX_REQUEST_BYTES: usize = 256 * 1024;
const READ_CHUNK_BYTES: usize = 4096;

/// HTTP endpoint the remote runtime polls.
#[derive(Clone)]
pub struct BridgeServer {
    server: ServerConfig,
    broker: Arc<CommandBroker>,
}

impl BridgeServer {
    pub fn new(server: ServerConfig, broker: Arc<CommandBroker>) -> Self {
        Self { server, broker }
    }

    pub async fn run_forever(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>(), None).await
    }

    /// Serve until `shutdown` resolves. The bound address is reported
    /// through `bound` once the listener is up.
    pub async fn run_until<F>(
        &self,
        shutdown: F,
        bound: Option<oneshot::Sender<SocketAddr>>,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.server.bind)
            .await
            .with_context(|| format!("failed binding bridge listener on {}", self.server.bind))?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("bridge listening on http://{bound_addr}");
        if let Some(bound) = bound {
            let _ = bound.send(bound_addr);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("bridge listener shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let broker = self.broker.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, broker).await {
                                    warn!("bridge connection {remote_addr} failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("bridge accept failed: {err}");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

async fn handle_connection(mut stream: TcpStream, broker: Arc<CommandBroker>) -> Result<()> {
    let Some(request) = read_http_request(&mut stream).await? else {
        return Ok(());
    };
    debug!("bridge {} {}", request.method, request.path);

    let (status, payload) = route(&broker, &request).await;
    write_http_json_response(&mut stream, status, &payload).await
}

async fn route(broker: &Arc<CommandBroker>, request: &HttpRequest) -> (u16, Value) {
    match (request.method.as_str(), request.path.as_str()) {
        ("POST" | "GET", KEEP_ALIVE_PATH) => {
            let timestamp = broker.signal_liveness().await;
            (200, json!({ "status": "ok", "timestamp": timestamp }))
        }
        ("POST" | "GET", GET_COMMANDS_PATH) => match broker.fetch_pending().await {
            Ok(commands) => {
                let commands = commands
                    .iter()
                    .map(|command| command.to_wire())
                    .collect::<Vec<_>>();
                (200, json!({ "commands": commands }))
            }
            Err(err) => error_response(&err),
        },
        ("POST", SUBMIT_COMMANDS_PATH) => submit(broker, &request.body).await,
        ("GET", STATUS_PATH) => {
            let snapshot = broker.snapshot().await;
            (200, json!(snapshot))
        }
        ("GET", _) | ("POST", _) => (404, json!({ "error": "not_found", "path": request.path })),
        _ => (405, json!({ "error": "method_not_allowed" })),
    }
}

async fn submit(broker: &Arc<CommandBroker>, body: &[u8]) -> (u16, Value) {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(payload) => payload,
            Err(err) => {
                debug!("submit body is not JSON: {err}");
                Value::Null
            }
        }
    };

    let broker = broker.clone();
    let outcome = run_isolated(async move { broker.submit_results(&payload).await }).await;
    submit_response(outcome)
}

/// Run `work` in its own task so a panic surfaces as `InternalFault`
/// instead of killing the connection. Effects applied before the panic stay
/// applied.
async fn run_isolated<F, T>(work: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work)
        .await
        .unwrap_or_else(|err| Err(BrokerError::InternalFault(err.to_string())))
}

fn submit_response(outcome: Result<SubmitReport, BrokerError>) -> (u16, Value) {
    match outcome {
        Ok(report) => {
            if report.skipped > 0 {
                warn!("submit accepted {} results, skipped {}", report.accepted(), report.skipped);
            }
            (200, json!({ "status": "ok" }))
        }
        Err(err) => {
            if matches!(err, BrokerError::InternalFault(_)) {
                warn!("submit processing failed: {err}");
            }
            error_response(&err)
        }
    }
}

fn error_response(err: &BrokerError) -> (u16, Value) {
    (err.http_status(), json!({ "error": err.public_message() }))
}

fn find_http_header_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(idx) = buf.windows(4).position(|chunk| chunk == b"\r\n\r\n") {
        return Some((idx, 4));
    }
    buf.windows(2)
        .position(|chunk| chunk == b"\n\n")
        .map(|idx| (idx, 2))
}

fn parse_http_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })
}

async fn read_http_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>> {
    let mut buffer = Vec::with_capacity(8 * 1024);
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    let mut header_info: Option<(usize, usize, usize)> = None;

    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading bridge request bytes")?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > MAX_REQUEST_BYTES {
            anyhow::bail!("bridge request exceeds max size");
        }

        if header_info.is_none() {
            if let Some((header_end, separator_len)) = find_http_header_terminator(&buffer) {
                let headers = String::from_utf8_lossy(&buffer[..header_end]);
                let content_length = parse_http_content_length(&headers).unwrap_or(0);
                if content_length > MAX_REQUEST_BYTES {
                    anyhow::bail!("bridge request exceeds max size");
                }
                header_info = Some((header_end, separator_len, content_length));
            }
        }

        if let Some((header_end, separator_len, content_length)) = header_info {
            let expected = header_end
                .saturating_add(separator_len)
                .saturating_add(content_length);
            if buffer.len() >= expected {
                break;
            }
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }

    let (header_end, separator_len) = find_http_header_terminator(&buffer)
        .ok_or_else(|| anyhow::anyhow!("invalid bridge request: missing header terminator"))?;
    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let request_line = headers.lines().next().unwrap_or_default();
    let mut segments = request_line.split_whitespace();
    let method = segments.next().unwrap_or_default().to_ascii_uppercase();
    if method.is_empty() {
        anyhow::bail!("invalid bridge request line");
    }
    let path_raw = segments.next().unwrap_or("/");
    let path = path_raw.split('?').next().unwrap_or(path_raw).to_owned();
    let content_length = parse_http_content_length(&headers).unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        anyhow::bail!("bridge request exceeds max size");
    }
    let body_start = header_end + separator_len;
    let body_end = body_start
        .checked_add(content_length)
        .filter(|end| *end <= buffer.len())
        .ok_or_else(|| anyhow::anyhow!("truncated bridge request body"))?;
    let body = buffer[body_start..body_end].to_vec();
    Ok(Some(HttpRequest { method, path, body }))
}

async fn write_http_json_response(
    stream: &mut TcpStream,
    status_code: u16,
    payload: &Value,
) -> Result<()> {
    let body = serde_json::to_vec(payload).context("failed serializing bridge JSON body")?;
    let status_text = match status_code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "OK",
    };
    let head = format!(
        "HTTP/1.1 {status_code} {status_text}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .context("failed writing bridge response headers")?;
    stream
        .write_all(&body)
        .await
        .context("failed writing bridge response body")?;
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    use super::BridgeServer;
    use crate::broker::{BrokerSettings, CommandBroker, SubmitReport};
    use crate::config::ServerConfig;
    use crate::error::BrokerError;

    struct RunningServer {
        addr: SocketAddr,
        broker: Arc<CommandBroker>,
        shutdown: Option<oneshot::Sender<()>>,
        task: JoinHandle<Result<()>>,
    }

    impl RunningServer {
        async fn stop(mut self) -> Result<()> {
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
            self.task.await?
        }
    }

    async fn start_server(settings: BrokerSettings) -> Result<RunningServer> {
        let broker = Arc::new(CommandBroker::new(settings));
        let server = BridgeServer::new(
            ServerConfig {
                bind: "127.0.0.1:0".to_owned(),
            },
            broker.clone(),
        );
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (bound_tx, bound_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            server
                .run_until(
                    async {
                        let _ = shutdown_rx.await;
                    },
                    Some(bound_tx),
                )
                .await
        });
        let addr = bound_rx.await?;
        Ok(RunningServer {
            addr,
            broker,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    fn split_response(raw: &[u8]) -> Result<(u16, Value)> {
        let idx = raw
            .windows(4)
            .position(|chunk| chunk == b"\r\n\r\n")
            .ok_or_else(|| anyhow::anyhow!("missing HTTP body"))?;
        let head = String::from_utf8_lossy(&raw[..idx]);
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| anyhow::anyhow!("missing status code"))?;
        Ok((status, serde_json::from_slice(&raw[idx + 4..])?))
    }

    async fn http_request(addr: SocketAddr, method: &str, path: &str, body: &[u8]) -> Result<(u16, Value)> {
        let mut stream = TcpStream::connect(addr).await?;
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(request.as_bytes()).await?;
        stream.write_all(body).await?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        split_response(&raw)
    }

    async fn post_json(addr: SocketAddr, path: &str, payload: &Value) -> Result<(u16, Value)> {
        http_request(addr, "POST", path, &serde_json::to_vec(payload)?).await
    }

    #[tokio::test]
    async fn keep_alive_fetch_and_submit_round_trip() -> Result<()> {
        let server = start_server(BrokerSettings::default()).await?;
        let id = server.broker.run_command("echo", json!({ "v": 1 })).await;
        let waiting = {
            let broker = server.broker.clone();
            let id = id.clone();
            tokio::spawn(async move { broker.await_result(&id).await })
        };

        let (status, body) = post_json(server.addr, "/keep-alive", &json!({})).await?;
        assert_eq!(status, 200);
        assert_eq!(body.pointer("/status").and_then(Value::as_str), Some("ok"));
        assert!(body.pointer("/timestamp").and_then(Value::as_u64).is_some());

        let (status, body) = post_json(server.addr, "/get-commands", &json!({})).await?;
        assert_eq!(status, 200);
        let commands = body
            .pointer("/commands")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].pointer("/id").and_then(Value::as_str), Some(id.as_str()));
        assert_eq!(commands[0].pointer("/name").and_then(Value::as_str), Some("echo"));
        assert_eq!(commands[0].pointer("/args"), Some(&json!({ "v": 1 })));
        assert!(commands[0].pointer("/timestamp").and_then(Value::as_u64).is_some());

        let (status, body) = post_json(
            server.addr,
            "/submit-commands",
            &json!({ "responses": [{ "id": id, "result": { "v": 1 } }] }),
        )
        .await?;
        assert_eq!(status, 200);
        assert_eq!(body, json!({ "status": "ok" }));
        assert_eq!(waiting.await?, Ok(json!({ "v": 1 })));

        server.stop().await
    }

    #[tokio::test]
    async fn stale_connection_is_rejected_with_400() -> Result<()> {
        let server = start_server(BrokerSettings::default()).await?;
        server.broker.run_command("echo", json!({})).await;

        let (status, body) = post_json(server.addr, "/get-commands", &json!({})).await?;
        assert_eq!(status, 400);
        assert_eq!(
            body.pointer("/error").and_then(Value::as_str),
            Some("Connection expired. Send a keep-alive request first.")
        );

        let (status, _) = post_json(
            server.addr,
            "/submit-commands",
            &json!({ "responses": [] }),
        )
        .await?;
        assert_eq!(status, 400);
        assert_eq!(server.broker.snapshot().await.pending, 1);

        server.stop().await
    }

    #[tokio::test]
    async fn connection_expires_after_the_window() -> Result<()> {
        let server = start_server(BrokerSettings {
            keep_alive_window: Duration::from_millis(50),
            ..BrokerSettings::default()
        })
        .await?;
        post_json(server.addr, "/keep-alive", &json!({})).await?;
        tokio::time::sleep(Duration::from_millis(120)).await;

        let (status, _) = post_json(server.addr, "/get-commands", &json!({})).await?;
        assert_eq!(status, 400);

        server.stop().await
    }

    #[tokio::test]
    async fn submit_without_responses_array_is_rejected() -> Result<()> {
        let server = start_server(BrokerSettings::default()).await?;
        post_json(server.addr, "/keep-alive", &json!({})).await?;

        for body in [
            serde_json::to_vec(&json!({ "responses": "nope" }))?,
            b"{not json".to_vec(),
            Vec::new(),
        ] {
            let (status, payload) =
                http_request(server.addr, "POST", "/submit-commands", &body).await?;
            assert_eq!(status, 400);
            assert_eq!(
                payload.pointer("/error").and_then(Value::as_str),
                Some("Invalid request format. Expected 'responses' array.")
            );
        }

        server.stop().await
    }

    #[tokio::test]
    async fn orphaned_submission_is_accepted() -> Result<()> {
        let server = start_server(BrokerSettings::default()).await?;
        post_json(server.addr, "/keep-alive", &json!({})).await?;

        let (status, _) = post_json(
            server.addr,
            "/submit-commands",
            &json!({ "responses": [{ "id": "never-issued", "result": 3 }, { "bogus": 1 }] }),
        )
        .await?;
        assert_eq!(status, 200);
        assert_eq!(server.broker.snapshot().await.resolved, 1);
        assert_eq!(
            server.broker.await_result(&"never-issued".into()).await,
            Ok(json!(3))
        );

        server.stop().await
    }

    #[tokio::test]
    async fn status_unknown_paths_and_methods() -> Result<()> {
        let server = start_server(BrokerSettings::default()).await?;

        let (status, body) = http_request(server.addr, "GET", "/status", b"").await?;
        assert_eq!(status, 200);
        assert_eq!(body.pointer("/state").and_then(Value::as_str), Some("disconnected"));
        assert_eq!(body.pointer("/pending").and_then(Value::as_u64), Some(0));

        let (status, body) = http_request(server.addr, "GET", "/nowhere", b"").await?;
        assert_eq!(status, 404);
        assert_eq!(body.pointer("/path").and_then(Value::as_str), Some("/nowhere"));

        let (status, _) = http_request(server.addr, "DELETE", "/keep-alive", b"").await?;
        assert_eq!(status, 405);

        server.stop().await
    }

    #[tokio::test]
    async fn panicking_submit_reports_fault_and_keeps_applied_results() {
        let broker = Arc::new(CommandBroker::new(BrokerSettings::default()));
        broker.signal_liveness().await;

        let worker = broker.clone();
        let outcome = super::run_isolated(async move {
            worker
                .submit_results(&json!({ "responses": [{ "id": "early", "result": 1 }] }))
                .await
                .expect("connected");
            if worker.snapshot().await.resolved > 0 {
                panic!("result handler blew up");
            }
            Ok::<SubmitReport, BrokerError>(SubmitReport::default())
        })
        .await;
        assert!(matches!(outcome, Err(BrokerError::InternalFault(_))));

        let (status, body) = super::submit_response(outcome);
        assert_eq!(status, 500);
        assert_eq!(body, json!({ "error": "Failed to process submitted commands" }));
        assert_eq!(broker.snapshot().await.resolved, 1);
    }

    #[tokio::test]
    async fn oversized_content_length_is_dropped_and_server_keeps_serving() -> Result<()> {
        let server = start_server(BrokerSettings::default()).await?;

        let mut stream = TcpStream::connect(server.addr).await?;
        stream
            .write_all(
                b"POST /submit-commands HTTP/1.1\r\nHost: bridge\r\nContent-Length: 18446744073709551615\r\n\r\n{}",
            )
            .await?;
        let mut raw = Vec::new();
        let _ = stream.read_to_end(&mut raw).await;
        assert!(raw.is_empty());

        let (status, body) = http_request(server.addr, "GET", "/status", b"").await?;
        assert_eq!(status, 200);
        assert_eq!(body.pointer("/pending").and_then(Value::as_u64), Some(0));

        server.stop().await
    }
}

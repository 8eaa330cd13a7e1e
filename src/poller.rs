use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::bridge_server::{GET_COMMANDS_PATH, KEEP_ALIVE_PATH, SUBMIT_COMMANDS_PATH};
use crate::config::PollerConfig;
use crate::scheduler::{Schedule, TimedJob};
use crate::types::{ConnectionState, WireCommand, WireResult};

pub const ECHO_COMMAND: &str = "echo";

/// Executes one named command on the remote side.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, args: Value) -> Result<Value>;
}

/// Returns its arguments unchanged.
pub struct EchoHandler;

#[async_trait]
impl CommandHandler for EchoHandler {
    async fn handle(&self, args: Value) -> Result<Value> {
        Ok(args)
    }
}

#[derive(Debug, Deserialize)]
struct CommandsEnvelope {
    #[serde(default)]
    commands: Vec<WireCommand>,
}

struct PollerInner {
    http: reqwest::Client,
    base_url: String,
    keep_alive_interval: Duration,
    fetch_interval: Duration,
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    state: Mutex<ConnectionState>,
}

/// Reference implementation of the remote side: heartbeats, fetches queued
/// commands, runs them through registered handlers and submits the results.
#[derive(Clone)]
pub struct RemotePoller {
    inner: Arc<PollerInner>,
}

impl RemotePoller {
    pub fn new(cfg: &PollerConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url)
            .with_context(|| format!("invalid poller base url {}", cfg.base_url))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms.max(1)))
            .build()
            .context("failed building poller http client")?;

        Ok(Self {
            inner: Arc::new(PollerInner {
                http,
                base_url: base_url.as_str().trim_end_matches('/').to_owned(),
                keep_alive_interval: Duration::from_millis(cfg.keep_alive_interval_ms),
                fetch_interval: Duration::from_millis(cfg.fetch_interval_ms),
                handlers: RwLock::new(HashMap::new()),
                state: Mutex::new(ConnectionState::Disconnected),
            }),
        })
    }

    pub async fn register_handler(&self, name: &str, handler: Arc<dyn CommandHandler>) {
        let replaced = self
            .inner
            .handlers
            .write()
            .await
            .insert(name.to_owned(), handler)
            .is_some();
        debug!("handler {name} registered (replaced={replaced})");
    }

    #[cfg(test)]
    pub async fn unregister_handler(&self, name: &str) -> bool {
        self.inner.handlers.write().await.remove(name).is_some()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.lock().await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.inner.base_url, path)
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.inner.state.lock().await;
        if *state != next {
            info!("poller connection: {}", next.label());
            *state = next;
        }
    }

    /// Send one heartbeat and update the local connection state.
    pub async fn keep_alive(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
            }
        }

        let outcome = async {
            self.inner
                .http
                .post(self.endpoint(KEEP_ALIVE_PATH))
                .json(&json!({}))
                .send()
                .await
                .context("keep-alive request failed")?
                .error_for_status()
                .context("keep-alive rejected")?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        match &outcome {
            Ok(()) => self.set_state(ConnectionState::Connected).await,
            Err(_) => self.set_state(ConnectionState::Disconnected).await,
        }
        outcome
    }

    /// Fetch queued commands, run them concurrently and submit every outcome
    /// in one batch. Does nothing unless connected. Returns how many commands
    /// were run.
    pub async fn fetch_and_run(&self) -> Result<usize> {
        if self.state().await != ConnectionState::Connected {
            debug!("fetch skipped: not connected");
            return Ok(0);
        }

        let response = self
            .inner
            .http
            .post(self.endpoint(GET_COMMANDS_PATH))
            .json(&json!({}))
            .send()
            .await
            .context("get-commands request failed")?;
        if response.status() == StatusCode::BAD_REQUEST {
            warn!("bridge reports the connection expired");
            self.set_state(ConnectionState::Disconnected).await;
            return Ok(0);
        }
        let envelope = response
            .error_for_status()
            .context("get-commands rejected")?
            .json::<CommandsEnvelope>()
            .await
            .context("failed decoding get-commands body")?;
        if envelope.commands.is_empty() {
            return Ok(0);
        }

        let responses = join_all(
            envelope
                .commands
                .into_iter()
                .map(|command| self.run_command(command)),
        )
        .await;
        let count = responses.len();

        let response = self
            .inner
            .http
            .post(self.endpoint(SUBMIT_COMMANDS_PATH))
            .json(&json!({ "responses": responses }))
            .send()
            .await
            .context("submit-commands request failed")?;
        if response.status() == StatusCode::BAD_REQUEST {
            self.set_state(ConnectionState::Disconnected).await;
        }
        response
            .error_for_status()
            .context("submit-commands rejected")?;
        debug!("submitted {count} results");
        Ok(count)
    }

    async fn run_command(&self, command: WireCommand) -> WireResult {
        let handler = self.inner.handlers.read().await.get(&command.name).cloned();
        let Some(handler) = handler else {
            return WireResult {
                id: command.id,
                result: Value::Null,
                error: Some(format!(
                    "No handler registered for command '{}'",
                    command.name
                )),
            };
        };
        match handler.handle(command.args).await {
            Ok(result) => WireResult {
                id: command.id,
                result,
                error: None,
            },
            Err(err) => {
                debug!("command {} ({}) failed: {err:#}", command.id, command.name);
                WireResult {
                    id: command.id,
                    result: Value::Null,
                    error: Some(format!("{err:#}")),
                }
            }
        }
    }

    /// Poll until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("poller targeting {}", self.inner.base_url);
        if let Err(err) = self.keep_alive().await {
            warn!("initial keep-alive failed: {err:#}");
        }

        let poller = self.clone();
        let mut keep_alive_job = TimedJob::new(
            "poller-keep-alive",
            Schedule::Every(self.inner.keep_alive_interval),
            move || {
                let poller = poller.clone();
                async move {
                    if let Err(err) = poller.keep_alive().await {
                        warn!("keep-alive failed: {err:#}");
                    }
                }
            },
        );
        let poller = self.clone();
        let mut fetch_job = TimedJob::new(
            "poller-fetch",
            Schedule::Every(self.inner.fetch_interval),
            move || {
                let poller = poller.clone();
                async move {
                    if let Err(err) = poller.fetch_and_run().await {
                        warn!("fetch cycle failed: {err:#}");
                    }
                }
            },
        );
        keep_alive_job.start();
        fetch_job.start();

        shutdown.await;
        fetch_job.stop();
        keep_alive_job.stop();
        info!("poller stopped");
        Ok(())
    }
}

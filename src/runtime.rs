use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};

use crate::bridge_server::BridgeServer;
use crate::broker::{spawn_sweeper, BrokerSettings, CommandBroker};
use crate::config::Config;
use crate::poller::{EchoHandler, RemotePoller, ECHO_COMMAND};
use crate::scheduler::{Schedule, TimedJob};
use crate::tool_server::ToolServer;
use crate::types::ConnectionState;

/// Broker, sweeper, HTTP transport and (optionally) the stdio tool surface
/// wired together for `serve`.
pub struct BridgeRuntime {
    config: Config,
    broker: Arc<CommandBroker>,
}

impl BridgeRuntime {
    pub fn new(config: Config) -> Self {
        let broker = Arc::new(CommandBroker::new(BrokerSettings::from_config(
            &config.broker,
        )));
        Self { config, broker }
    }

    pub async fn run(self) -> Result<()> {
        let settings = self.broker.settings();
        info!(
            "starting bridge (bind={}, tools={}, keep_alive_window_ms={}, max_active_ms={}, retention_ms={}, sweep_ms={})",
            self.config.server.bind,
            self.config.tools.enabled,
            settings.keep_alive_window.as_millis(),
            settings.max_active_lifetime.as_millis(),
            settings.max_result_retention.as_millis(),
            settings.sweep_interval.as_millis()
        );

        let _sweeper = spawn_sweeper(self.broker.clone());
        let mut hint = connect_hint(self.broker.clone());
        hint.start();
        let server = BridgeServer::new(self.config.server.clone(), self.broker.clone());

        if self.config.tools.enabled {
            let tools = ToolServer::new(self.broker.clone());
            tokio::select! {
                res = server.run_forever() => res,
                res = tools.serve_stdio() => {
                    info!("tool client disconnected, shutting down");
                    res
                }
                _ = signal::ctrl_c() => {
                    info!("received ctrl-c, shutting down");
                    Ok(())
                }
            }
        } else {
            tokio::select! {
                res = server.run_forever() => res,
                _ = signal::ctrl_c() => {
                    info!("received ctrl-c, shutting down");
                    Ok(())
                }
            }
        }
    }
}

/// One-shot check, two keep-alive windows after start, that the remote
/// runtime has connected at all.
fn connect_hint(broker: Arc<CommandBroker>) -> TimedJob {
    let delay = broker.settings().keep_alive_window * 2;
    TimedJob::new("connect-hint", Schedule::Once(delay), move || {
        let broker = broker.clone();
        async move {
            if broker.connection_state().await != ConnectionState::Connected {
                warn!("no keep-alive received from the remote runtime yet");
            }
        }
    })
}

/// Run the reference poller until ctrl-c.
pub async fn run_poller(config: &Config) -> Result<()> {
    let poller = RemotePoller::new(&config.poller)?;
    poller
        .register_handler(ECHO_COMMAND, Arc::new(EchoHandler))
        .await;
    poller
        .run_until(async {
            if signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, shutting down");
            }
        })
        .await
}

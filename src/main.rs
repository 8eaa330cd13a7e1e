mod bridge_server;
mod broker;
mod config;
mod correlation;
mod error;
mod liveness;
mod poller;
mod runtime;
mod scheduler;
mod tool_server;
mod types;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use runtime::BridgeRuntime;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    about = "Correlates agent tool calls with a remote runtime that polls over HTTP"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "COMMAND_BRIDGE_CONFIG",
        default_value = "command-bridge.toml"
    )]
    config: PathBuf,

    /// Override the HTTP listen address.
    #[arg(long, global = true, env = "COMMAND_BRIDGE_BIND")]
    bind: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "COMMAND_BRIDGE_LOG", default_value = "info")]
    log: String,

    /// Force debug logging.
    #[arg(long, global = true, env = "COMMAND_BRIDGE_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the bridge: HTTP transport, sweeper and stdio tool surface.
    Serve,
    /// Run the reference remote poller with the built-in echo handler.
    Poll(PollArgs),
    /// Query a running bridge for its connection status.
    Status(StatusArgs),
    /// Run non-interactive configuration diagnostics.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct PollArgs {
    /// Bridge base URL (defaults to poller.base_url).
    #[arg(long)]
    url: Option<String>,
}

#[derive(Debug, Clone, Args, Default)]
struct StatusArgs {
    /// Bridge base URL (defaults to poller.base_url).
    #[arg(long)]
    url: Option<String>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = load_config(&cli);
    let filter = match &loaded {
        Ok(cfg) => cfg.log_filter(&cli.log).to_owned(),
        Err(_) if cli.debug => "debug".to_owned(),
        Err(_) => cli.log.clone(),
    };
    init_logging(&filter)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Serve);
    match command {
        CliCommand::Serve => BridgeRuntime::new(loaded?).run().await,
        CliCommand::Poll(_) => runtime::run_poller(&loaded?).await,
        CliCommand::Status(args) => run_status(&loaded?, args).await,
        CliCommand::Doctor(args) => run_doctor(loaded, &cli.config, args),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.bind.as_deref(), cli.debug);
    if let Some(CliCommand::Poll(PollArgs { url: Some(url) })) = &cli.command {
        cfg.poller.base_url = url.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

async fn run_status(cfg: &Config, args: StatusArgs) -> Result<()> {
    let base = args.url.unwrap_or_else(|| cfg.poller.base_url.clone());
    let url = format!("{}{}", base.trim_end_matches('/'), bridge_server::STATUS_PATH);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(cfg.poller.request_timeout_ms))
        .build()
        .context("failed building status client")?;
    let payload = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed reaching {url}"))?
        .error_for_status()
        .context("status request rejected")?
        .json::<Value>()
        .await
        .context("failed decoding status body")?;

    if args.json {
        print_json_value(&payload);
    } else {
        println!("{}", render_status(&payload));
    }
    Ok(())
}

fn render_status(payload: &Value) -> String {
    let state = payload
        .get("state")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let last_signal = payload
        .get("lastSignalMs")
        .and_then(Value::as_u64)
        .map(|ms| ms.to_string())
        .unwrap_or_else(|| "never".to_owned());
    let count = |key: &str| payload.get(key).and_then(Value::as_u64).unwrap_or(0);
    format!(
        "state: {state}\nlast keep-alive: {last_signal}\npending: {}\nresolved: {}\nwaiters: {}",
        count("pending"),
        count("resolved"),
        count("waiters")
    )
}

fn print_json_value(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn run_doctor(loaded: Result<Config>, config_path: &Path, args: DoctorArgs) -> Result<()> {
    let config_result = loaded.map_err(|err| format!("{err:#}"));
    let bind_free = config_result
        .as_ref()
        .map(|cfg| bind_available(&cfg.server.bind))
        .unwrap_or(false);
    let report = build_doctor_report(config_result, config_path, bind_free);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
    bind_free: bool,
) -> DoctorReport {
    let mut checks = Vec::new();
    let mut config = None;

    match config_result {
        Ok(cfg) => {
            let message = if config_path.exists() {
                format!("loaded {}", config_path.display())
            } else {
                format!("{} not found, using defaults", config_path.display())
            };
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message,
                detail: None,
            });
            config = Some(cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
        }
    }

    if let Some(cfg) = config.as_ref() {
        let parsed = cfg.server.bind.parse::<SocketAddr>();
        checks.push(DoctorCheck {
            id: "server.bind".to_owned(),
            status: match (&parsed, bind_free) {
                (Err(_), _) => "fail",
                (Ok(_), false) => "warn",
                (Ok(_), true) => "pass",
            }
            .to_owned(),
            message: cfg.server.bind.clone(),
            detail: Some(match parsed {
                Err(err) => format!("not a socket address: {err}"),
                Ok(_) if bind_free => "address is free".to_owned(),
                Ok(_) => "address is in use (bridge already running?)".to_owned(),
            }),
        });

        let broker = &cfg.broker;
        checks.push(DoctorCheck {
            id: "broker.sweep_interval".to_owned(),
            status: if broker.sweep_interval_ms > broker.max_active_lifetime_ms {
                "warn"
            } else {
                "pass"
            }
            .to_owned(),
            message: format!("{}ms", broker.sweep_interval_ms),
            detail: Some(format!(
                "max_active_lifetime_ms={}, max_result_retention_ms={}",
                broker.max_active_lifetime_ms, broker.max_result_retention_ms
            )),
        });

        checks.push(DoctorCheck {
            id: "broker.keep_alive_window".to_owned(),
            status: "pass".to_owned(),
            message: format!("{}ms", broker.keep_alive_window_ms),
            detail: Some(format!(
                "poller keep-alive every {}ms",
                cfg.poller.keep_alive_interval_ms
            )),
        });

        checks.push(DoctorCheck {
            id: "tools.stdio".to_owned(),
            status: "pass".to_owned(),
            message: if cfg.tools.enabled {
                "stdio tool surface enabled".to_owned()
            } else {
                "stdio tool surface disabled".to_owned()
            },
            detail: None,
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn bind_available(bind: &str) -> bool {
    std::net::TcpListener::bind(bind).is_ok()
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

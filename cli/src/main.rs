use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use remotedialer::connector::{self, ConnectOptions, Connector, OnConnect};
use remotedialer::{BackoffPolicy, TunnelConfig, TunnelError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {0}")]
    Status(u16),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("tunnel stopped: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "tunnel-agent", about = "Reverse tunnel agent: serves dials from a tunnel server")]
struct Cli {
    /// Server base URL (`http`, `https`, `ws` or `wss`).
    #[arg(long, env = "TUNNEL_URL", default_value = "http://127.0.0.1:3000")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and serve until Ctrl-C.
    Run(RunArgs),
    /// Check the server's health endpoint.
    Ping,
    /// List peers registered on the server.
    Peers,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Peer key to register as.
    #[arg(long, env = "TUNNEL_ID")]
    id: String,

    #[arg(long, env = "TUNNEL_TOKEN")]
    token: Option<String>,

    /// Unix socket path the server may dial; repeatable.
    #[arg(long = "allow-unix", value_name = "PATH")]
    allow_unix: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run_agent(&cli.url, args).await,
        Command::Ping => run_ping(&cli.url).await,
        Command::Peers => run_peers(&cli.url).await,
    }
}

async fn run_agent(base_url: &str, args: RunArgs) -> Result<(), CliError> {
    let mut options = ConnectOptions::new(connect_url(base_url)?, args.id)
        .with_config(TunnelConfig::from_env())
        .with_backoff(BackoffPolicy::from_env());
    if let Some(token) = args.token {
        options = options.with_token(token);
    }

    let on_connect: OnConnect = Arc::new(|_, session| {
        Box::pin(async move {
            tracing::info!(peer = %session.peer_key(), session_id = %session.id(), "tunnel session ready");
            Ok(())
        })
    });
    let connector = Connector::new(options, connector::allow_tcp_and_unix_sockets(args.allow_unix)).on_connect(on_connect);

    let mut states = connector.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::debug!(?state, "connector state");
        }
    });

    let ctx = CancellationToken::new();
    let agent = tokio::spawn({
        let ctx = ctx.clone();
        async move { connector.run(&ctx).await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    ctx.cancel();

    match agent.await {
        Ok(TunnelError::Cancelled) | Err(_) => Ok(()),
        Ok(other) => Err(other.into()),
    }
}

async fn run_ping(base_url: &str) -> Result<(), CliError> {
    let response = reqwest::get(http_url(base_url, "/healthz")?).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::Status(status.as_u16()));
    }
    println!("ok");
    Ok(())
}

async fn run_peers(base_url: &str) -> Result<(), CliError> {
    let response = reqwest::get(http_url(base_url, "/peers")?).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::Status(status.as_u16()));
    }
    let json: Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn split_base(base_url: &str) -> Result<(bool, &str), CliError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let Some((scheme, rest)) = trimmed.split_once("://") else {
        return Err(CliError::InvalidUrl(base_url.to_owned()));
    };
    let secure = match scheme {
        "http" | "ws" => false,
        "https" | "wss" => true,
        _ => return Err(CliError::InvalidUrl(base_url.to_owned())),
    };
    let host = rest.strip_suffix("/connect").unwrap_or(rest);
    if host.is_empty() {
        return Err(CliError::InvalidUrl(base_url.to_owned()));
    }
    Ok((secure, host))
}

/// WebSocket URL of the server's `/connect` endpoint.
fn connect_url(base_url: &str) -> Result<String, CliError> {
    let (secure, host) = split_base(base_url)?;
    let scheme = if secure { "wss" } else { "ws" };
    Ok(format!("{scheme}://{host}/connect"))
}

fn http_url(base_url: &str, path: &str) -> Result<String, CliError> {
    let (secure, host) = split_base(base_url)?;
    let scheme = if secure { "https" } else { "http" };
    Ok(format!("{scheme}://{host}{path}"))
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;

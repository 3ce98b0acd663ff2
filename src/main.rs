use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use clusterd::{
    client::{JoinClient, JoinRequestBody, persist_bundle},
    config::{AddNodeArgs, Cli, Command, Config, JoinApi, JoinArgs},
    http::{AppState, build_router},
    join::MembershipNegotiator,
    node_state::NodeState,
    token::{TOKEN_LEN, TokenAuthority, TokenKind, generate_token},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::AddNode(args) => add_node(&cli.config, args).await,
        Command::Join(args) => join_cluster(&cli.config, args).await,
    }
}

async fn run_server(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let negotiator = MembershipNegotiator::from_config(&config, shutdown.clone());
    let state = AppState {
        negotiator: Arc::new(negotiator),
        join_timeout: config.join_timeout(),
    };
    let app = build_router(state).layer(TraceLayer::new_for_http());

    info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        restart_mode = ?config.restart_mode,
        "starting clusterd"
    );
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;
    Ok(())
}

async fn add_node(config: &Config, args: AddNodeArgs) -> Result<()> {
    let token = match args.token {
        Some(token) => {
            anyhow::ensure!(
                token.len() >= TOKEN_LEN,
                "token must be at least {TOKEN_LEN} characters"
            );
            token
        }
        None => generate_token(),
    };
    let ttl = i64::try_from(args.ttl_secs).context("ttl out of range")?;
    let expires_at = chrono::Utc::now().timestamp() + ttl;

    let state = NodeState::new(&config.data_dir);
    TokenAuthority::new(state.paths().clone())
        .issue(TokenKind::Cluster, &token, Some(expires_at))
        .await?;

    info!(expires_at = expires_at, "cluster token issued");
    println!("From the node you wish to join to this cluster, run:");
    println!("clusterd join {} --token {token}", advertised_agent(config));
    Ok(())
}

async fn join_cluster(config: &Config, args: JoinArgs) -> Result<()> {
    let state = NodeState::new(&config.data_dir);
    let hostname = match args.hostname {
        Some(hostname) => hostname,
        None => system_hostname()?,
    };
    let callback_token = match args.api {
        JoinApi::Legacy => Some(
            TokenAuthority::new(state.paths().clone())
                .self_callback_token()
                .await?,
        ),
        JoinApi::Dqlite | JoinApi::Etcd => None,
    };

    let client = JoinClient::new(config.join_timeout())?;
    let bundle = client
        .request_join(
            &args.peer,
            args.api,
            &JoinRequestBody {
                token: &args.token,
                hostname: &hostname,
                port: config.bind.port(),
                worker: args.worker,
                callback_token: callback_token.as_deref(),
            },
        )
        .await?;
    persist_bundle(
        &state,
        args.api,
        &args.peer,
        &args.token,
        args.worker,
        &bundle,
    )
    .await?;

    let role = if args.worker {
        "worker"
    } else {
        "control plane member"
    };
    println!("Joined {} as {role}", args.peer);
    Ok(())
}

/// `host:port` peers should dial; the bind address unless it is a wildcard.
fn advertised_agent(config: &Config) -> String {
    if config.bind.ip().is_unspecified() {
        format!("<this-node-ip>:{}", config.bind.port())
    } else {
        config.bind.to_string()
    }
}

fn system_hostname() -> Result<String> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .context("read system hostname; pass --hostname")?;
    let hostname = raw.trim();
    anyhow::ensure!(!hostname.is_empty(), "system hostname is empty; pass --hostname");
    Ok(hostname.to_string())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    shutdown.cancel();
}

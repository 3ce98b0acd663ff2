use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    None,
    Systemd,
    Openrc,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinApi {
    /// Single-node / legacy etcd clusters.
    Legacy,
    /// Replicated-store (dqlite) HA clusters.
    Dqlite,
    /// etcd HA clusters.
    Etcd,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "clusterd",
    about = "Cluster bootstrap agent",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the cluster join API (default).
    Run,

    /// Issue a single-use cluster token for a new node.
    AddNode(AddNodeArgs),

    /// Join this node to a running cluster.
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AddNodeArgs {
    /// Use this token instead of generating one (at least 32 characters).
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,

    #[arg(
        long = "ttl-secs",
        value_name = "SECS",
        default_value_t = 3600,
        value_parser = clap::value_parser!(u64).range(60..=31_536_000)
    )]
    pub ttl_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    /// Peer cluster agent, e.g. `10.0.0.1:25000`.
    #[arg(value_name = "HOST:PORT")]
    pub peer: String,

    #[arg(long, value_name = "TOKEN")]
    pub token: String,

    /// Join as a worker-only node.
    #[arg(long, default_value_t = false)]
    pub worker: bool,

    #[arg(long, value_name = "API", default_value = "dqlite", value_enum)]
    pub api: JoinApi,

    /// Hostname reported to the peer. Defaults to the system hostname.
    #[arg(long, value_name = "NAME")]
    pub hostname: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "CLUSTERD_BIND",
        value_name = "ADDR",
        default_value = "0.0.0.0:25000"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "CLUSTERD_DATA_DIR",
        value_name = "PATH",
        default_value = "/var/snap/clusterd/current"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "membership-poll-interval-ms",
        global = true,
        env = "CLUSTERD_MEMBERSHIP_POLL_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(10..=60_000)
    )]
    pub membership_poll_interval_ms: u64,

    #[arg(
        long = "membership-wait-timeout-secs",
        global = true,
        env = "CLUSTERD_MEMBERSHIP_WAIT_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..=600)
    )]
    pub membership_wait_timeout_secs: u64,

    #[arg(
        long = "join-timeout-secs",
        global = true,
        env = "CLUSTERD_JOIN_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 120,
        value_parser = clap::value_parser!(u64).range(1..=900)
    )]
    pub join_timeout_secs: u64,

    #[arg(
        long = "restart-mode",
        global = true,
        env = "CLUSTERD_RESTART_MODE",
        value_name = "MODE",
        default_value = "systemd",
        value_enum
    )]
    pub restart_mode: RestartMode,

    #[arg(
        long = "service-unit-prefix",
        global = true,
        env = "CLUSTERD_SERVICE_UNIT_PREFIX",
        value_name = "PREFIX",
        default_value = "snap.clusterd.daemon-"
    )]
    pub service_unit_prefix: String,

    #[arg(
        long = "restart-timeout-secs",
        global = true,
        env = "CLUSTERD_RESTART_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub restart_timeout_secs: u64,

    #[arg(
        long = "storage-service",
        global = true,
        env = "CLUSTERD_STORAGE_SERVICE",
        value_name = "NAME",
        default_value = "k8s-dqlite"
    )]
    pub storage_service: String,

    #[arg(
        long,
        global = true,
        env = "CLUSTERD_KUBECTL",
        value_name = "PATH",
        default_value = "kubectl"
    )]
    pub kubectl: String,

    #[arg(
        long = "control-plane-label",
        global = true,
        env = "CLUSTERD_CONTROL_PLANE_LABEL",
        value_name = "LABEL",
        default_value = "node.kubernetes.io/control-plane"
    )]
    pub control_plane_label: String,
}

impl Config {
    pub fn membership_poll_interval(&self) -> Duration {
        Duration::from_millis(self.membership_poll_interval_ms)
    }

    pub fn membership_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.membership_wait_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }
}

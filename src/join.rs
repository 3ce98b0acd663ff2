use std::{net::IpAddr, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cni::CniReachabilityPatcher,
    config::Config,
    membership::{MembershipError, MembershipSnapshot, MembershipStore, MembershipStoreOptions},
    netutil::{
        BindAddressError, BindAddressResolver, HostResolver, SystemResolver, join_host_port,
        split_host_port,
    },
    node_state::{BackendMode, NodeState},
    service_args::ServiceArgumentStore,
    services::{KubeApi, KubeError, Kubectl, ServiceControl, service_control_from_config},
    token::{TokenAuthority, TokenError, TokenKind},
};

pub const DEFAULT_CLUSTER_AGENT_PORT: u16 = 25000;
pub const DEFAULT_API_SERVER_PORT: &str = "16443";
pub const DEFAULT_AUTHORIZATION_MODE: &str = "AlwaysAllow";

/// The join API variants. They share one pipeline and differ in the backend they accept and in
/// the membership step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinProtocol {
    /// v1: single node / legacy etcd clusters.
    Legacy,
    /// v2: replicated dqlite store.
    ReplicatedStore,
    /// v2 etcd: HA clusters backed by etcd.
    EtcdHa,
}

impl JoinProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::ReplicatedStore => "replicated-store",
            Self::EtcdHa => "etcd-ha",
        }
    }

    pub fn required_backend(self) -> BackendMode {
        match self {
            Self::ReplicatedStore => BackendMode::Dqlite,
            Self::Legacy | Self::EtcdHa => BackendMode::Etcd,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "token")]
    pub cluster_token: String,
    #[serde(rename = "hostname", default)]
    pub remote_hostname: String,
    #[serde(rename = "port", deserialize_with = "deserialize_port")]
    pub cluster_agent_port: u16,
    #[serde(rename = "worker", default)]
    pub worker_only: bool,
    /// The joining node's own callback token (legacy API only).
    #[serde(default)]
    pub callback_token: Option<String>,
    /// `host:port` the joining node dialed. Set by the transport.
    #[serde(skip)]
    pub request_host_port: String,
    /// Peer IP of the connection. Set by the transport.
    #[serde(skip)]
    pub remote_address: String,
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(raw) => raw.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinResponse {
    pub ca: String,
    pub callback_token: String,
    #[serde(rename = "apiport")]
    pub api_server_port: String,
    #[serde(rename = "api_authz_mode")]
    pub api_server_authorization_mode: String,
    pub kubelet_args: String,
    pub hostname_override: Option<String>,
    #[serde(flatten)]
    pub credentials: JoinCredentials,
}

/// What the joining node receives beyond the common fields. A worker never gets signing keys.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JoinCredentials {
    Member(MemberCredentials),
    Worker(WorkerCredentials),
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberCredentials {
    pub voters: Option<Vec<String>>,
    pub service_account_key: String,
    pub admin_token: String,
    pub ca_key: String,
    pub cluster_cert: String,
    pub cluster_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etcd_servers: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerCredentials {
    pub control_plane_nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinErrorKind {
    Authentication,
    Precondition,
    Consistency,
    TransientStore,
    Internal,
}

#[derive(Debug)]
pub enum JoinError {
    InvalidToken,
    BackendMismatch {
        protocol: JoinProtocol,
        backend: BackendMode,
    },
    PortMismatch {
        expected: u16,
        got: u16,
    },
    SelfJoin {
        address: String,
    },
    HostnameMismatch {
        hostname: String,
        remote: IpAddr,
    },
    InvalidRequest(String),
    AlreadyMember {
        address: String,
    },
    BindAddress(BindAddressError),
    NotBootstrap {
        members: usize,
    },
    MembershipTimeout(MembershipError),
    Cancelled,
    Timeout,
    Membership(MembershipError),
    Token(TokenError),
    State(anyhow::Error),
    ControlPlaneNodes(KubeError),
}

impl JoinError {
    pub fn kind(&self) -> JoinErrorKind {
        match self {
            Self::InvalidToken => JoinErrorKind::Authentication,
            Self::BackendMismatch { .. }
            | Self::PortMismatch { .. }
            | Self::SelfJoin { .. }
            | Self::HostnameMismatch { .. }
            | Self::InvalidRequest(_)
            | Self::BindAddress(_) => JoinErrorKind::Precondition,
            Self::AlreadyMember { .. } | Self::NotBootstrap { .. } => JoinErrorKind::Consistency,
            Self::MembershipTimeout(_) | Self::Cancelled | Self::Timeout => {
                JoinErrorKind::TransientStore
            }
            Self::Membership(_) | Self::Token(_) | Self::State(_) | Self::ControlPlaneNodes(_) => {
                JoinErrorKind::Internal
            }
        }
    }

    /// Stable machine-readable identifier.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::BackendMismatch { .. } => "backend_mismatch",
            Self::PortMismatch { .. } => "port_mismatch",
            Self::SelfJoin { .. } => "self_join",
            Self::HostnameMismatch { .. } => "hostname_mismatch",
            Self::InvalidRequest(_) => "invalid_request",
            Self::AlreadyMember { .. } => "already_member",
            Self::BindAddress(_) => "bind_address_not_found",
            Self::NotBootstrap { .. } => "bootstrap_precondition",
            Self::MembershipTimeout(_) => "membership_timeout",
            Self::Cancelled => "cancelled",
            Self::Timeout => "join_timeout",
            Self::Membership(_) => "membership_store",
            Self::Token(_) => "token_store",
            Self::State(_) => "node_state",
            Self::ControlPlaneNodes(_) => "control_plane_nodes",
        }
    }
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidToken => write!(f, "invalid or expired cluster token"),
            Self::BackendMismatch { protocol, backend } => write!(
                f,
                "not possible to join: this node runs {} and cannot accept {} joins",
                backend.as_str(),
                protocol.as_str()
            ),
            Self::PortMismatch { expected, got } => write!(
                f,
                "cluster agent port mismatch: this node listens on {expected}, joining node uses {got}"
            ),
            Self::SelfJoin { address } => {
                write!(f, "the joining node has the same address ({address}) as this node")
            }
            Self::HostnameMismatch { hostname, remote } => {
                write!(f, "hostname {hostname} does not resolve to {remote}")
            }
            Self::InvalidRequest(msg) => write!(f, "{msg}"),
            Self::AlreadyMember { address } => {
                write!(f, "the joining node ({address}) is already known to the cluster")
            }
            Self::BindAddress(e) => write!(f, "cannot determine bind address: {e}"),
            Self::NotBootstrap { members } => write!(
                f,
                "cluster membership changed underneath the join ({members} members)"
            ),
            Self::MembershipTimeout(e) => write!(f, "{e}; retry the join"),
            Self::Cancelled => write!(f, "join cancelled"),
            Self::Timeout => write!(f, "join timed out; retry the join"),
            Self::Membership(e) => write!(f, "{e}"),
            Self::Token(e) => write!(f, "{e}"),
            Self::State(e) => write!(f, "{e:#}"),
            Self::ControlPlaneNodes(e) => write!(f, "list control plane nodes: {e}"),
        }
    }
}

impl std::error::Error for JoinError {}

impl From<TokenError> for JoinError {
    fn from(value: TokenError) -> Self {
        Self::Token(value)
    }
}

impl From<MembershipError> for JoinError {
    fn from(value: MembershipError) -> Self {
        match value {
            MembershipError::NotBootstrap { members } => Self::NotBootstrap { members },
            MembershipError::Timeout { .. } => Self::MembershipTimeout(value),
            MembershipError::Cancelled => Self::Cancelled,
            other => Self::Membership(other),
        }
    }
}

impl From<BindAddressError> for JoinError {
    fn from(value: BindAddressError) -> Self {
        Self::BindAddress(value)
    }
}

impl From<anyhow::Error> for JoinError {
    fn from(value: anyhow::Error) -> Self {
        Self::State(value)
    }
}

/// Result of the protocol-specific membership step.
#[derive(Debug, Default)]
struct MembershipOutcome {
    voters: Option<Vec<String>>,
    etcd_servers: Option<String>,
}

pub struct NegotiatorParts {
    pub state: NodeState,
    pub tokens: Arc<TokenAuthority>,
    pub membership: Arc<MembershipStore>,
    pub cni: Arc<CniReachabilityPatcher>,
    pub bind: BindAddressResolver,
    pub hosts: Arc<dyn HostResolver>,
    pub kube: Arc<dyn KubeApi>,
    pub shutdown: CancellationToken,
}

/// Admits joining nodes.
pub struct MembershipNegotiator {
    state: NodeState,
    args: ServiceArgumentStore,
    tokens: Arc<TokenAuthority>,
    membership: Arc<MembershipStore>,
    cni: Arc<CniReachabilityPatcher>,
    bind: BindAddressResolver,
    hosts: Arc<dyn HostResolver>,
    kube: Arc<dyn KubeApi>,
    shutdown: CancellationToken,
}

impl MembershipNegotiator {
    pub fn new(parts: NegotiatorParts) -> Self {
        Self {
            args: ServiceArgumentStore::new(parts.state.paths().clone()),
            state: parts.state,
            tokens: parts.tokens,
            membership: parts.membership,
            cni: parts.cni,
            bind: parts.bind,
            hosts: parts.hosts,
            kube: parts.kube,
            shutdown: parts.shutdown,
        }
    }

    pub fn from_config(config: &Config, shutdown: CancellationToken) -> Self {
        let state = NodeState::new(&config.data_dir);
        let services: Arc<dyn ServiceControl> = service_control_from_config(config);
        let kube: Arc<dyn KubeApi> = Arc::new(Kubectl::from_config(config));
        let membership = MembershipStore::new(
            state.paths(),
            services,
            MembershipStoreOptions {
                storage_service: config.storage_service.clone(),
                poll_interval: config.membership_poll_interval(),
                wait_timeout: config.membership_wait_timeout(),
            },
        );
        Self::new(NegotiatorParts {
            tokens: Arc::new(TokenAuthority::new(state.paths().clone())),
            membership: Arc::new(membership),
            cni: Arc::new(CniReachabilityPatcher::new(
                state.paths().cni_manifest.clone(),
                kube.clone(),
            )),
            bind: BindAddressResolver::system(),
            hosts: Arc::new(SystemResolver),
            kube,
            state,
            shutdown,
        })
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn tokens(&self) -> &TokenAuthority {
        &self.tokens
    }

    /// Runs the join pipeline. Stops at the first failure; nothing done before it is undone,
    /// in particular the cluster token stays consumed.
    pub async fn join(
        &self,
        protocol: JoinProtocol,
        req: JoinRequest,
    ) -> Result<JoinResponse, JoinError> {
        if !self
            .tokens
            .validate_and_consume(TokenKind::Cluster, &req.cluster_token)
            .await?
        {
            return Err(JoinError::InvalidToken);
        }

        let backend = self.state.backend_mode();
        if backend != protocol.required_backend() {
            return Err(JoinError::BackendMismatch { protocol, backend });
        }

        let agent_port = self.cluster_agent_port().await;
        if agent_port != req.cluster_agent_port {
            return Err(JoinError::PortMismatch {
                expected: agent_port,
                got: req.cluster_agent_port,
            });
        }

        let remote_ip: IpAddr = req.remote_address.parse().map_err(|_| {
            JoinError::InvalidRequest(format!("invalid remote address: {}", req.remote_address))
        })?;
        let (contacted_host, _) = split_host_port(&req.request_host_port);
        if contacted_host
            .parse::<IpAddr>()
            .is_ok_and(|contacted| contacted == remote_ip)
        {
            return Err(JoinError::SelfJoin {
                address: remote_ip.to_string(),
            });
        }

        let hostname_override = self.resolve_hostname(&req.remote_hostname, remote_ip).await?;

        let outcome = match protocol {
            JoinProtocol::ReplicatedStore => self.admit_replicated_store(&req, remote_ip).await?,
            JoinProtocol::EtcdHa => self.admit_etcd_ha(remote_ip).await?,
            JoinProtocol::Legacy => self.admit_legacy(&req, remote_ip).await?,
        };

        let callback_token = self.tokens.self_callback_token().await?;
        let ca = self.state.read_ca_cert()?;
        let kubelet_args = self.state.read_service_args("kubelet")?;
        let api_server_port = non_empty_or(
            self.args
                .get_argument("kube-apiserver", "--secure-port")
                .await,
            DEFAULT_API_SERVER_PORT,
        );
        let api_server_authorization_mode = non_empty_or(
            self.args
                .get_argument("kube-apiserver", "--authorization-mode")
                .await,
            DEFAULT_AUTHORIZATION_MODE,
        );

        if let Err(err) = self.cni.maybe_patch(&remote_ip.to_string(), true).await {
            warn!(remote_ip = %remote_ip, error = %err, "cni reachability patch failed");
        }

        if let Err(err) = self.state.mark_no_cert_reissue() {
            warn!(error = %err, "failed to create no-cert-reissue marker");
        }

        let credentials = if req.worker_only {
            self.worker_credentials(&req).await?
        } else {
            self.member_credentials(protocol, outcome)?
        };

        info!(
            protocol = protocol.as_str(),
            remote_ip = %remote_ip,
            hostname = %req.remote_hostname,
            worker = req.worker_only,
            "node admitted"
        );

        Ok(JoinResponse {
            ca,
            callback_token,
            api_server_port,
            api_server_authorization_mode,
            kubelet_args,
            hostname_override,
            credentials,
        })
    }

    async fn cluster_agent_port(&self) -> u16 {
        let bind = self.args.get_argument("cluster-agent", "--bind").await;
        split_host_port(&bind)
            .1
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_CLUSTER_AGENT_PORT)
    }

    /// `None` when the hostname resolves to the peer address, the peer IP when it does not
    /// resolve at all. Resolving elsewhere is rejected.
    async fn resolve_hostname(
        &self,
        hostname: &str,
        remote_ip: IpAddr,
    ) -> Result<Option<String>, JoinError> {
        if hostname.is_empty() {
            return Ok(Some(remote_ip.to_string()));
        }
        match self.hosts.lookup(hostname).await {
            Ok(addrs) if addrs.contains(&remote_ip) => Ok(None),
            Ok(addrs) if addrs.is_empty() => Ok(Some(remote_ip.to_string())),
            Ok(addrs) => {
                debug!(hostname = hostname, resolved = ?addrs, remote_ip = %remote_ip, "hostname resolves elsewhere");
                Err(JoinError::HostnameMismatch {
                    hostname: hostname.to_string(),
                    remote: remote_ip,
                })
            }
            Err(err) => {
                debug!(hostname = hostname, error = %err, "hostname does not resolve; using peer address");
                Ok(Some(remote_ip.to_string()))
            }
        }
    }

    async fn admit_replicated_store(
        &self,
        req: &JoinRequest,
        remote_ip: IpAddr,
    ) -> Result<MembershipOutcome, JoinError> {
        let _guard = self.membership.lock().await;

        let snapshot = self.membership.snapshot().await?;
        let remote = remote_ip.to_string();
        if snapshot.contains_host(&remote) {
            return Err(JoinError::AlreadyMember { address: remote });
        }

        let snapshot = if snapshot.is_loopback_bootstrap() {
            let bind = self.bind.find_matching_bind_address(&req.request_host_port)?;
            info!(bind = %bind, "first peer joining; rewriting bootstrap address");
            self.membership.rewrite_bootstrap_address(&bind).await?;
            self.membership
                .wait_until(&self.shutdown, MembershipSnapshot::bootstrap_rewritten)
                .await?
        } else {
            snapshot
        };

        Ok(MembershipOutcome {
            voters: Some(snapshot.voters()),
            etcd_servers: None,
        })
    }

    async fn admit_etcd_ha(&self, remote_ip: IpAddr) -> Result<MembershipOutcome, JoinError> {
        let _guard = self.membership.lock().await;

        let servers = self
            .args
            .get_argument("kube-apiserver", "--etcd-servers")
            .await;
        let remote = remote_ip.to_string();
        if etcd_server_hosts(&servers).any(|host| host == remote) {
            return Err(JoinError::AlreadyMember { address: remote });
        }
        Ok(MembershipOutcome {
            voters: None,
            etcd_servers: Some(servers).filter(|s| !s.is_empty()),
        })
    }

    async fn admit_legacy(
        &self,
        req: &JoinRequest,
        remote_ip: IpAddr,
    ) -> Result<MembershipOutcome, JoinError> {
        if let Some(token) = req.callback_token.as_deref().filter(|t| !t.is_empty()) {
            let peer = join_host_port(&remote_ip.to_string(), &req.cluster_agent_port.to_string());
            self.tokens.store_callback_token(&peer, token).await?;
        }
        let servers = self
            .args
            .get_argument("kube-apiserver", "--etcd-servers")
            .await;
        Ok(MembershipOutcome {
            voters: None,
            etcd_servers: Some(servers).filter(|s| !s.is_empty()),
        })
    }

    async fn worker_credentials(&self, req: &JoinRequest) -> Result<JoinCredentials, JoinError> {
        self.tokens
            .issue_worker_certificate_request_tokens(&req.cluster_token)
            .await?;
        let control_plane_nodes = self
            .kube
            .control_plane_node_ips()
            .await
            .map_err(JoinError::ControlPlaneNodes)?;
        Ok(JoinCredentials::Worker(WorkerCredentials {
            control_plane_nodes,
        }))
    }

    fn member_credentials(
        &self,
        protocol: JoinProtocol,
        outcome: MembershipOutcome,
    ) -> Result<JoinCredentials, JoinError> {
        let (cluster_cert, cluster_key) = match protocol {
            JoinProtocol::ReplicatedStore => self.state.read_backend_cluster_credentials()?,
            JoinProtocol::Legacy | JoinProtocol::EtcdHa => {
                self.state.read_etcd_server_credentials()?
            }
        };
        Ok(JoinCredentials::Member(MemberCredentials {
            voters: outcome.voters,
            service_account_key: self.state.read_service_account_key()?,
            admin_token: self.state.admin_token()?,
            ca_key: self.state.read_ca_key()?,
            cluster_cert,
            cluster_key,
            etcd_servers: outcome.etcd_servers,
        }))
    }
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

/// Hosts of a comma-separated `--etcd-servers` URL list.
fn etcd_server_hosts(servers: &str) -> impl Iterator<Item = &str> {
    servers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|url| {
            let authority = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
            split_host_port(authority.trim_end_matches('/')).0
        })
}

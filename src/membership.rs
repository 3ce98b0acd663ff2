use std::{
    io,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, MutexGuard},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    netutil::{join_host_port, split_host_port},
    node_state::{NodePaths, write_atomic_async},
    services::{RestartError, ServiceControl},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeRole {
    Voter,
    StandBy,
    Spare,
}

impl TryFrom<u8> for NodeRole {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Voter),
            1 => Ok(Self::StandBy),
            2 => Ok(Self::Spare),
            other => Err(format!("unknown node role {other}")),
        }
    }
}

impl From<NodeRole> for u8 {
    fn from(value: NodeRole) -> Self {
        match value {
            NodeRole::Voter => 0,
            NodeRole::StandBy => 1,
            NodeRole::Spare => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipNode {
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Role")]
    pub role: NodeRole,
}

impl MembershipNode {
    pub fn host(&self) -> &str {
        split_host_port(&self.address).0
    }

    pub fn is_loopback(&self) -> bool {
        self.host()
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }
}

/// The store's node set as read in one go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MembershipSnapshot {
    pub nodes: Vec<MembershipNode>,
}

impl MembershipSnapshot {
    /// A single member still advertising itself on loopback: no peer has ever joined.
    pub fn is_loopback_bootstrap(&self) -> bool {
        matches!(self.nodes.as_slice(), [only] if only.is_loopback())
    }

    /// Whether the first member has moved off loopback.
    pub fn bootstrap_rewritten(&self) -> bool {
        self.nodes.first().is_some_and(|n| !n.is_loopback())
    }

    pub fn contains_host(&self, host: &str) -> bool {
        self.nodes.iter().any(|n| n.host() == host)
    }

    pub fn voters(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.role == NodeRole::Voter)
            .map(|n| n.address.clone())
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct AddressUpdate<'a> {
    #[serde(rename = "Address")]
    address: &'a str,
}

#[derive(Debug)]
pub enum MembershipError {
    Io { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, source: serde_yaml::Error },
    Serialize(serde_yaml::Error),
    NotBootstrap { members: usize },
    InvalidAddress(String),
    Restart(RestartError),
    Timeout { waited: Duration },
    Cancelled,
}

impl std::fmt::Display for MembershipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "membership file {}: {source}", path.display()),
            Self::Parse { path, source } => {
                write!(f, "parse membership file {}: {source}", path.display())
            }
            Self::Serialize(e) => write!(f, "serialize address update: {e}"),
            Self::NotBootstrap { members } => write!(
                f,
                "membership is not a single loopback-bound node ({members} members)"
            ),
            Self::InvalidAddress(addr) => write!(f, "membership address without port: {addr}"),
            Self::Restart(e) => write!(f, "restart storage service: {e}"),
            Self::Timeout { waited } => write!(
                f,
                "membership did not converge within {}s",
                waited.as_secs()
            ),
            Self::Cancelled => write!(f, "membership wait cancelled"),
        }
    }
}

impl std::error::Error for MembershipError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Serialize(e) => Some(e),
            Self::Restart(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MembershipStoreOptions {
    pub storage_service: String,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

/// Reads and rewrites the replicated store's membership through its on-disk snapshot.
///
/// Observe-then-mutate sequences must hold [`MembershipStore::lock`] for their whole span.
pub struct MembershipStore {
    cluster_yaml: PathBuf,
    update_yaml: PathBuf,
    services: Arc<dyn ServiceControl>,
    opts: MembershipStoreOptions,
    lock: Mutex<()>,
}

impl MembershipStore {
    pub fn new(
        paths: &NodePaths,
        services: Arc<dyn ServiceControl>,
        opts: MembershipStoreOptions,
    ) -> Self {
        Self {
            cluster_yaml: paths.backend_cluster_yaml.clone(),
            update_yaml: paths.backend_update_yaml.clone(),
            services,
            opts,
            lock: Mutex::new(()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    pub async fn snapshot(&self) -> Result<MembershipSnapshot, MembershipError> {
        read_snapshot(&self.cluster_yaml).await
    }

    /// Polls until `predicate` holds. Returns `Cancelled` without reading when `cancel` has
    /// already fired, and `Timeout` once the configured wait elapses.
    pub async fn wait_until<F>(
        &self,
        cancel: &CancellationToken,
        mut predicate: F,
    ) -> Result<MembershipSnapshot, MembershipError>
    where
        F: FnMut(&MembershipSnapshot) -> bool,
    {
        if cancel.is_cancelled() {
            return Err(MembershipError::Cancelled);
        }
        let started = Instant::now();
        let deadline = started + self.opts.wait_timeout;
        loop {
            match self.snapshot().await {
                Ok(snapshot) if predicate(&snapshot) => return Ok(snapshot),
                Ok(snapshot) => debug!(members = snapshot.nodes.len(), "membership not converged"),
                Err(err) => debug!(error = %err, "membership snapshot unavailable"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(MembershipError::Timeout {
                    waited: now - started,
                });
            }
            let pause = self.opts.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(MembershipError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Tells a never-joined store to advertise `new_host` on its current port and restarts it.
    /// Callers wait for [`MembershipSnapshot::bootstrap_rewritten`] afterwards.
    pub async fn rewrite_bootstrap_address(&self, new_host: &str) -> Result<(), MembershipError> {
        let snapshot = self.snapshot().await?;
        if !snapshot.is_loopback_bootstrap() {
            return Err(MembershipError::NotBootstrap {
                members: snapshot.nodes.len(),
            });
        }
        let current = &snapshot.nodes[0].address;
        let port = split_host_port(current)
            .1
            .ok_or_else(|| MembershipError::InvalidAddress(current.clone()))?;
        let address = join_host_port(new_host, port);

        let body = serde_yaml::to_string(&AddressUpdate { address: &address })
            .map_err(MembershipError::Serialize)?;
        write_atomic_async(&self.update_yaml, body.as_bytes())
            .await
            .map_err(|source| MembershipError::Io {
                path: self.update_yaml.clone(),
                source,
            })?;

        self.services
            .restart(&self.opts.storage_service)
            .await
            .map_err(MembershipError::Restart)?;
        info!(
            from = %current,
            to = %address,
            service = %self.opts.storage_service,
            "bootstrap address rewritten; storage restarted"
        );
        Ok(())
    }
}

async fn read_snapshot(path: &Path) -> Result<MembershipSnapshot, MembershipError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| MembershipError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if content.trim().is_empty() {
        return Ok(MembershipSnapshot::default());
    }
    let nodes: Vec<MembershipNode> =
        serde_yaml::from_str(&content).map_err(|source| MembershipError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(MembershipSnapshot { nodes })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{node_state::write_atomic, services::BoxFuture};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays the storage daemon: on restart it applies `update.yaml` to `cluster.yaml`.
    pub(crate) struct FakeStorageDaemon {
        pub(crate) paths: NodePaths,
        pub(crate) restarts: AtomicUsize,
        pub(crate) delay: Duration,
    }

    impl FakeStorageDaemon {
        pub(crate) fn new(paths: NodePaths) -> Self {
            Self {
                paths,
                restarts: AtomicUsize::new(0),
                delay: Duration::from_millis(30),
            }
        }
    }

    impl ServiceControl for FakeStorageDaemon {
        fn restart(&self, _service: &str) -> BoxFuture<'_, Result<(), RestartError>> {
            Box::pin(async move {
                self.restarts.fetch_add(1, Ordering::SeqCst);
                let update: serde_yaml::Value = serde_yaml::from_str(
                    &std::fs::read_to_string(&self.paths.backend_update_yaml).unwrap(),
                )
                .unwrap();
                let address = update["Address"].as_str().unwrap().to_string();
                let cluster_yaml = self.paths.backend_cluster_yaml.clone();
                let delay = self.delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    write_members(&cluster_yaml, &[(&address, NodeRole::Voter)]);
                });
                Ok(())
            })
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    pub(crate) fn write_members(path: &Path, members: &[(&str, NodeRole)]) {
        let nodes: Vec<MembershipNode> = members
            .iter()
            .enumerate()
            .map(|(i, (address, role))| MembershipNode {
                address: address.to_string(),
                id: 3297041220608546238 + i as u64,
                role: *role,
            })
            .collect();
        write_atomic(path, serde_yaml::to_string(&nodes).unwrap().as_bytes()).unwrap();
    }

    fn update_address(paths: &NodePaths) -> String {
        let update: serde_yaml::Value = serde_yaml::from_str(
            &std::fs::read_to_string(&paths.backend_update_yaml).unwrap(),
        )
        .unwrap();
        update["Address"].as_str().unwrap().to_string()
    }

    pub(crate) fn fast_opts() -> MembershipStoreOptions {
        MembershipStoreOptions {
            storage_service: "k8s-dqlite".to_string(),
            poll_interval: Duration::from_millis(10),
            wait_timeout: Duration::from_secs(5),
        }
    }

    fn store(tmp: &tempfile::TempDir) -> (MembershipStore, Arc<FakeStorageDaemon>) {
        let paths = NodePaths::new(tmp.path());
        let daemon = Arc::new(FakeStorageDaemon::new(paths.clone()));
        (
            MembershipStore::new(&paths, daemon.clone(), fast_opts()),
            daemon,
        )
    }

    #[tokio::test]
    async fn snapshot_parses_cluster_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store(&tmp);
        std::fs::create_dir_all(tmp.path().join("var/kubernetes/backend")).unwrap();
        std::fs::write(
            tmp.path().join("var/kubernetes/backend/cluster.yaml"),
            "- Address: 10.0.0.1:19001\n  ID: 3297041220608546238\n  Role: 0\n\
             - Address: 10.0.0.2:19001\n  ID: 12\n  Role: 2\n",
        )
        .unwrap();

        let snap = store.snapshot().await.unwrap();
        assert_eq!(snap.nodes.len(), 2);
        assert_eq!(snap.nodes[1].role, NodeRole::Spare);
        assert_eq!(snap.voters(), vec!["10.0.0.1:19001".to_string()]);
        assert!(snap.contains_host("10.0.0.2"));
        assert!(!snap.contains_host("10.0.0.20"));
        assert!(!snap.is_loopback_bootstrap());
    }

    #[tokio::test]
    async fn unknown_role_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store(&tmp);
        let paths = NodePaths::new(tmp.path());
        write_atomic(
            &paths.backend_cluster_yaml,
            b"- Address: 127.0.0.1:19001\n  ID: 1\n  Role: 7\n",
        )
        .unwrap();
        assert!(matches!(
            store.snapshot().await,
            Err(MembershipError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn wait_until_with_cancelled_token_never_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store(&tmp);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut calls = 0;
        let started = Instant::now();
        let res = store
            .wait_until(&cancel, |_| {
                calls += 1;
                true
            })
            .await;
        assert!(matches!(res, Err(MembershipError::Cancelled)));
        assert_eq!(calls, 0);
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn wait_until_is_interrupted_by_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store(&tmp);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let res = store.wait_until(&cancel, |_| false).await;
        assert!(matches!(res, Err(MembershipError::Cancelled)));
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(tmp.path());
        let daemon = Arc::new(FakeStorageDaemon::new(paths.clone()));
        let store = MembershipStore::new(
            &paths,
            daemon,
            MembershipStoreOptions {
                wait_timeout: Duration::from_millis(50),
                ..fast_opts()
            },
        );
        write_members(&paths.backend_cluster_yaml, &[("127.0.0.1:19001", NodeRole::Voter)]);

        let res = store
            .wait_until(&CancellationToken::new(), MembershipSnapshot::bootstrap_rewritten)
            .await;
        assert!(matches!(res, Err(MembershipError::Timeout { .. })));
    }

    #[tokio::test]
    async fn bootstrap_rewrite_converges_once_store_updates() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, daemon) = store(&tmp);
        let paths = NodePaths::new(tmp.path());
        write_members(&paths.backend_cluster_yaml, &[("127.0.0.1:19001", NodeRole::Voter)]);

        store.rewrite_bootstrap_address("10.10.10.10").await.unwrap();
        assert_eq!(update_address(&paths), "10.10.10.10:19001");

        let snap = store
            .wait_until(&CancellationToken::new(), MembershipSnapshot::bootstrap_rewritten)
            .await
            .unwrap();
        assert_eq!(snap.nodes[0].address, "10.10.10.10:19001");
        assert_eq!(snap.nodes[0].role, NodeRole::Voter);
        assert_eq!(daemon.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rewrite_requires_single_loopback_member() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, daemon) = store(&tmp);
        let paths = NodePaths::new(tmp.path());
        write_members(&paths.backend_cluster_yaml, &[("10.0.0.1:19001", NodeRole::Voter)]);

        let err = store.rewrite_bootstrap_address("10.0.0.1").await.unwrap_err();
        assert!(matches!(err, MembershipError::NotBootstrap { members: 1 }));
        assert!(!paths.backend_update_yaml.exists());
        assert_eq!(daemon.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ipv6_rewrite_brackets_the_host() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(tmp.path());
        let daemon = Arc::new(FakeStorageDaemon::new(paths.clone()));
        let store = MembershipStore::new(&paths, daemon, fast_opts());
        write_members(&paths.backend_cluster_yaml, &[("[::1]:19001", NodeRole::Voter)]);

        store.rewrite_bootstrap_address("fd00::10").await.unwrap();
        assert_eq!(update_address(&paths), "[fd00::10]:19001");
    }
}

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::JoinApi,
    http::{ETCD_JOIN_PATH, JOIN_PATH, LEGACY_JOIN_PATH},
    node_state::{NodeState, touch, write_atomic, write_secret},
    service_args::ServiceArgumentStore,
    token::{TokenAuthority, WORKER_CERT_ROLES},
};

#[derive(Debug, Serialize)]
pub struct JoinRequestBody<'a> {
    pub token: &'a str,
    pub hostname: &'a str,
    pub port: u16,
    pub worker: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_token: Option<&'a str>,
}

/// The credential bundle as received by a joining node.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinBundle {
    pub ca: String,
    pub callback_token: String,
    #[serde(rename = "apiport")]
    pub api_server_port: String,
    #[serde(rename = "api_authz_mode", default)]
    pub api_server_authorization_mode: String,
    #[serde(default)]
    pub kubelet_args: String,
    #[serde(default)]
    pub hostname_override: Option<String>,
    #[serde(default)]
    pub voters: Option<Vec<String>>,
    #[serde(default)]
    pub service_account_key: Option<String>,
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub ca_key: Option<String>,
    #[serde(default)]
    pub cluster_cert: Option<String>,
    #[serde(default)]
    pub cluster_key: Option<String>,
    #[serde(default)]
    pub etcd_servers: Option<String>,
    #[serde(default)]
    pub control_plane_nodes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    error: String,
    #[serde(default)]
    code: String,
}

pub fn join_url(peer: &str, api: JoinApi) -> String {
    let base = if peer.contains("://") {
        peer.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", peer.trim_end_matches('/'))
    };
    let path = match api {
        JoinApi::Legacy => LEGACY_JOIN_PATH,
        JoinApi::Dqlite => JOIN_PATH,
        JoinApi::Etcd => ETCD_JOIN_PATH,
    };
    format!("{base}{path}")
}

/// `host:port` of a peer given with or without a scheme.
fn peer_authority(peer: &str) -> &str {
    peer.split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(peer)
        .trim_end_matches('/')
}

pub struct JoinClient {
    http: reqwest::Client,
}

impl JoinClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("clusterd/{}", crate::version::VERSION))
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self { http })
    }

    pub async fn request_join(
        &self,
        peer: &str,
        api: JoinApi,
        body: &JoinRequestBody<'_>,
    ) -> anyhow::Result<JoinBundle> {
        let url = join_url(peer, api);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            match resp.json::<RemoteError>().await {
                Ok(err) if !err.code.is_empty() => {
                    bail!("join rejected by {peer} ({status}, {}): {}", err.code, err.error)
                }
                Ok(err) => bail!("join rejected by {peer} ({status}): {}", err.error),
                Err(_) => bail!("join rejected by {peer} ({status})"),
            }
        }
        resp.json::<JoinBundle>()
            .await
            .context("decode join response")
    }
}

/// Writes what a successful join handed over into this node's data directory.
pub async fn persist_bundle(
    state: &NodeState,
    api: JoinApi,
    peer: &str,
    cluster_token: &str,
    worker: bool,
    bundle: &JoinBundle,
) -> anyhow::Result<()> {
    let paths = state.paths();
    write_atomic(&paths.ca_cert, bundle.ca.as_bytes())
        .with_context(|| format!("write {}", paths.ca_cert.display()))?;

    write_atomic(
        &paths.service_args("kubelet"),
        bundle.kubelet_args.as_bytes(),
    )
    .context("write kubelet arguments")?;
    let args = ServiceArgumentStore::new(paths.clone());
    if let Some(host) = bundle.hostname_override.as_deref() {
        let updates = BTreeMap::from([("--hostname-override".to_string(), host.to_string())]);
        args.update_arguments("kubelet", &updates, &BTreeSet::new())
            .await?;
    }

    TokenAuthority::new(paths.clone())
        .store_callback_token(peer_authority(peer), &bundle.callback_token)
        .await
        .context("store peer callback token")?;

    if worker {
        let mut tokens = String::new();
        for role in WORKER_CERT_ROLES {
            tokens.push_str(&format!("{cluster_token}-{role}\n"));
        }
        write_secret(&paths.worker_cert_tokens, tokens.as_bytes())?;
        info!(
            peer = peer,
            control_plane_nodes = bundle.control_plane_nodes.len(),
            "joined as worker"
        );
        return Ok(());
    }

    let (Some(ca_key), Some(sa_key), Some(cluster_cert), Some(cluster_key)) = (
        bundle.ca_key.as_deref(),
        bundle.service_account_key.as_deref(),
        bundle.cluster_cert.as_deref(),
        bundle.cluster_key.as_deref(),
    ) else {
        bail!("join response from {peer} lacks control plane credentials");
    };
    write_secret(&paths.ca_key, ca_key.as_bytes())?;
    write_secret(&paths.service_account_key, sa_key.as_bytes())?;
    let (cert_path, key_path) = match api {
        JoinApi::Dqlite => (&paths.backend_cluster_cert, &paths.backend_cluster_key),
        JoinApi::Legacy | JoinApi::Etcd => (&paths.server_cert, &paths.server_key),
    };
    write_secret(cert_path, cluster_cert.as_bytes())?;
    write_secret(key_path, cluster_key.as_bytes())?;
    if let Some(admin) = bundle.admin_token.as_deref() {
        state.set_admin_token(admin)?;
    }

    match api {
        JoinApi::Dqlite => touch(&paths.ha_cluster_lock)?,
        JoinApi::Legacy | JoinApi::Etcd => {
            if let Some(servers) = bundle.etcd_servers.as_deref() {
                let updates = BTreeMap::from([("--etcd-servers".to_string(), servers.to_string())]);
                args.update_arguments("kube-apiserver", &updates, &BTreeSet::new())
                    .await?;
            }
        }
    }
    info!(
        peer = peer,
        voters = bundle.voters.as_ref().map_or(0, Vec::len),
        "joined as control plane member"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "abcdefghijklmnopqrstuvwxyz012345";

    fn member_bundle() -> serde_json::Value {
        json!({
            "ca": "CA CERT",
            "callback_token": "peercallbacktoken0123456789abcdef",
            "apiport": "16443",
            "api_authz_mode": "RBAC,Node",
            "kubelet_args": "--node-labels=role=node\n",
            "hostname_override": "10.0.0.2",
            "voters": ["10.0.0.1:19001"],
            "service_account_key": "SA KEY",
            "admin_token": "admintoken123",
            "ca_key": "CA KEY",
            "cluster_cert": "CLUSTER CERT",
            "cluster_key": "CLUSTER KEY",
        })
    }

    fn body<'a>(worker: bool) -> JoinRequestBody<'a> {
        JoinRequestBody {
            token: TOKEN,
            hostname: "node-2",
            port: 25000,
            worker,
            callback_token: None,
        }
    }

    #[test]
    fn join_url_picks_path_per_api() {
        assert_eq!(
            join_url("10.0.0.1:25000", JoinApi::Dqlite),
            "http://10.0.0.1:25000/cluster/api/v2.0/join"
        );
        assert_eq!(
            join_url("https://10.0.0.1:25000/", JoinApi::Etcd),
            "https://10.0.0.1:25000/cluster/api/v2.0/etcd/join"
        );
        assert_eq!(
            join_url("10.0.0.1:25000", JoinApi::Legacy),
            "http://10.0.0.1:25000/cluster/api/v1.0/join"
        );
        assert_eq!(peer_authority("http://10.0.0.1:25000/"), "10.0.0.1:25000");
    }

    #[tokio::test]
    async fn member_join_persists_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cluster/api/v2.0/join"))
            .and(body_partial_json(json!({"token": TOKEN, "worker": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(member_bundle()))
            .expect(1)
            .mount(&server)
            .await;

        let client = JoinClient::new(Duration::from_secs(5)).unwrap();
        let bundle = client
            .request_join(&server.uri(), JoinApi::Dqlite, &body(false))
            .await
            .unwrap();
        assert_eq!(bundle.voters, Some(vec!["10.0.0.1:19001".to_string()]));

        let tmp = tempfile::tempdir().unwrap();
        let state = NodeState::new(tmp.path());
        persist_bundle(&state, JoinApi::Dqlite, &server.uri(), TOKEN, false, &bundle)
            .await
            .unwrap();

        let paths = state.paths();
        assert_eq!(fs::read_to_string(&paths.ca_cert).unwrap(), "CA CERT");
        assert_eq!(fs::read_to_string(&paths.ca_key).unwrap(), "CA KEY");
        assert_eq!(
            fs::read_to_string(&paths.backend_cluster_key).unwrap(),
            "CLUSTER KEY"
        );
        assert_eq!(state.admin_token().unwrap(), "admintoken123");
        assert!(paths.ha_cluster_lock.exists());
        assert_eq!(
            fs::read_to_string(paths.service_args("kubelet")).unwrap(),
            "--node-labels=role=node\n--hostname-override=10.0.0.2\n"
        );
        let stored = TokenAuthority::new(paths.clone())
            .callback_token_for(peer_authority(&server.uri()))
            .await
            .unwrap();
        assert_eq!(stored.as_deref(), Some("peercallbacktoken0123456789abcdef"));
    }

    #[tokio::test]
    async fn worker_join_writes_certificate_request_tokens_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cluster/api/v2.0/join"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ca": "CA CERT",
                "callback_token": "peercallbacktoken0123456789abcdef",
                "apiport": "16443",
                "api_authz_mode": "RBAC,Node",
                "kubelet_args": "",
                "hostname_override": null,
                "control_plane_nodes": ["10.0.0.1"],
            })))
            .mount(&server)
            .await;

        let client = JoinClient::new(Duration::from_secs(5)).unwrap();
        let bundle = client
            .request_join(&server.uri(), JoinApi::Dqlite, &body(true))
            .await
            .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let state = NodeState::new(tmp.path());
        persist_bundle(&state, JoinApi::Dqlite, &server.uri(), TOKEN, true, &bundle)
            .await
            .unwrap();

        let paths = state.paths();
        assert_eq!(
            fs::read_to_string(&paths.worker_cert_tokens).unwrap(),
            format!("{TOKEN}-kubelet\n{TOKEN}-proxy\n")
        );
        assert!(!paths.ca_key.exists());
        assert!(!paths.ha_cluster_lock.exists());
    }

    #[tokio::test]
    async fn rejection_surfaces_remote_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cluster/api/v2.0/etcd/join"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": "the joining node (10.0.0.2) is already known to the cluster",
                "code": "already_member",
            })))
            .mount(&server)
            .await;

        let client = JoinClient::new(Duration::from_secs(5)).unwrap();
        let err = client
            .request_join(&server.uri(), JoinApi::Etcd, &body(false))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("already_member"), "{msg}");
        assert!(msg.contains("409"), "{msg}");
    }

    #[tokio::test]
    async fn member_bundle_without_keys_is_rejected() {
        let mut bundle: JoinBundle = serde_json::from_value(member_bundle()).unwrap();
        bundle.ca_key = None;
        let tmp = tempfile::tempdir().unwrap();
        let state = NodeState::new(tmp.path());
        let err = persist_bundle(&state, JoinApi::Etcd, "10.0.0.1:25000", TOKEN, false, &bundle)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("lacks control plane credentials"));
    }
}

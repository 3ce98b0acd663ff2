use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use tokio::io::AsyncWriteExt;

/// Which storage backend the control plane runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Replicated dqlite store (HA clusters).
    Dqlite,
    /// etcd, either single node or HA.
    Etcd,
}

impl BackendMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dqlite => "dqlite",
            Self::Etcd => "etcd",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePaths {
    pub root: PathBuf,
    pub credentials_dir: PathBuf,
    pub cluster_tokens: PathBuf,
    pub certs_request_tokens: PathBuf,
    pub callback_tokens: PathBuf,
    pub callback_token: PathBuf,
    /// Held with an exclusive `flock` around every token file update.
    pub tokens_lock: PathBuf,
    pub known_tokens: PathBuf,
    pub worker_cert_tokens: PathBuf,
    pub certs_dir: PathBuf,
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub service_account_key: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub args_dir: PathBuf,
    pub cni_manifest: PathBuf,
    pub backend_dir: PathBuf,
    pub backend_cluster_yaml: PathBuf,
    pub backend_update_yaml: PathBuf,
    pub backend_cluster_cert: PathBuf,
    pub backend_cluster_key: PathBuf,
    pub lock_dir: PathBuf,
    pub ha_cluster_lock: PathBuf,
    pub no_cert_reissue_lock: PathBuf,
}

impl NodePaths {
    pub fn new(data_dir: &Path) -> Self {
        let credentials_dir = data_dir.join("credentials");
        let certs_dir = data_dir.join("certs");
        let args_dir = data_dir.join("args");
        let backend_dir = data_dir.join("var/kubernetes/backend");
        let lock_dir = data_dir.join("var/lock");
        Self {
            root: data_dir.to_path_buf(),
            cluster_tokens: credentials_dir.join("cluster-tokens.txt"),
            certs_request_tokens: credentials_dir.join("certs-request-tokens.txt"),
            callback_tokens: credentials_dir.join("callback-tokens.txt"),
            callback_token: credentials_dir.join("callback-token.txt"),
            tokens_lock: credentials_dir.join(".tokens.lock"),
            known_tokens: credentials_dir.join("known_tokens.csv"),
            worker_cert_tokens: credentials_dir.join("worker-cert-tokens.txt"),
            ca_cert: certs_dir.join("ca.crt"),
            ca_key: certs_dir.join("ca.key"),
            service_account_key: certs_dir.join("serviceaccount.key"),
            server_cert: certs_dir.join("server.crt"),
            server_key: certs_dir.join("server.key"),
            cni_manifest: args_dir.join("cni-network/cni.yaml"),
            backend_cluster_yaml: backend_dir.join("cluster.yaml"),
            backend_update_yaml: backend_dir.join("update.yaml"),
            backend_cluster_cert: backend_dir.join("cluster.crt"),
            backend_cluster_key: backend_dir.join("cluster.key"),
            ha_cluster_lock: lock_dir.join("ha-cluster"),
            no_cert_reissue_lock: lock_dir.join("no-cert-reissue"),
            credentials_dir,
            certs_dir,
            args_dir,
            backend_dir,
            lock_dir,
        }
    }

    pub fn service_args(&self, service: &str) -> PathBuf {
        self.args_dir.join(service)
    }
}

/// File-backed view of everything a node keeps under its data directory.
#[derive(Debug, Clone)]
pub struct NodeState {
    paths: NodePaths,
}

impl NodeState {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            paths: NodePaths::new(data_dir.as_ref()),
        }
    }

    pub fn paths(&self) -> &NodePaths {
        &self.paths
    }

    pub fn backend_mode(&self) -> BackendMode {
        if self.paths.ha_cluster_lock.exists() {
            BackendMode::Dqlite
        } else {
            BackendMode::Etcd
        }
    }

    pub fn read_ca_cert(&self) -> anyhow::Result<String> {
        read_text(&self.paths.ca_cert)
    }

    pub fn read_ca_key(&self) -> anyhow::Result<String> {
        read_text(&self.paths.ca_key)
    }

    pub fn read_service_account_key(&self) -> anyhow::Result<String> {
        read_text(&self.paths.service_account_key)
    }

    pub fn read_backend_cluster_credentials(&self) -> anyhow::Result<(String, String)> {
        Ok((
            read_text(&self.paths.backend_cluster_cert)?,
            read_text(&self.paths.backend_cluster_key)?,
        ))
    }

    pub fn read_etcd_server_credentials(&self) -> anyhow::Result<(String, String)> {
        Ok((
            read_text(&self.paths.server_cert)?,
            read_text(&self.paths.server_key)?,
        ))
    }

    pub fn read_service_args(&self, service: &str) -> anyhow::Result<String> {
        read_text(&self.paths.service_args(service))
    }

    /// First column of the `known_tokens.csv` row whose user is `admin`.
    pub fn admin_token(&self) -> anyhow::Result<String> {
        let content = read_text(&self.paths.known_tokens)?;
        content
            .lines()
            .find_map(|line| {
                let mut cols = line.split(',');
                let token = cols.next()?.trim();
                let user = cols.next()?.trim();
                (user == "admin" && !token.is_empty()).then(|| token.to_string())
            })
            .ok_or_else(|| {
                anyhow::anyhow!("no admin token in {}", self.paths.known_tokens.display())
            })
    }

    /// Creates the sentinel that stops automatic certificate reissue. Idempotent.
    pub fn mark_no_cert_reissue(&self) -> anyhow::Result<()> {
        touch(&self.paths.no_cert_reissue_lock)
    }

    /// Replaces the `admin` row of `known_tokens.csv`, keeping every other row.
    pub fn set_admin_token(&self, token: &str) -> anyhow::Result<()> {
        let path = &self.paths.known_tokens;
        let existing = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let mut out = String::with_capacity(existing.len() + token.len() + 32);
        for line in existing
            .lines()
            .filter(|line| line.split(',').nth(1).map(str::trim) != Some("admin"))
        {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&format!("{token},admin,admin,\"system:masters\"\n"));
        write_secret(path, out.as_bytes())
    }
}

pub fn read_text(path: &Path) -> anyhow::Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    String::from_utf8(bytes).with_context(|| format!("{} is not valid utf-8", path.display()))
}

pub fn touch(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    Ok(())
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let (dir, tmp_path) = tmp_path_for(path)?;
    fs::create_dir_all(dir)?;
    {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

/// [`write_atomic`] through `tokio::fs`, for callers on the runtime.
pub async fn write_atomic_async(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let (dir, tmp_path) = tmp_path_for(path)?;
    tokio::fs::create_dir_all(dir).await?;
    {
        let mut f = tokio::fs::File::create(&tmp_path).await?;
        f.write_all(bytes).await?;
        f.sync_all().await?;
    }
    tokio::fs::rename(tmp_path, path).await
}

/// `<dir>/<file name>.tmp`, next to `path`.
fn tmp_path_for(path: &Path) -> io::Result<(&Path, PathBuf)> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    Ok((dir, dir.join(format!("{}.tmp", file_name.to_string_lossy()))))
}

/// Atomic write followed by a best-effort `0600`.
pub fn write_secret(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    write_atomic(path, bytes).with_context(|| format!("write {}", path.display()))?;
    best_effort_chmod_0600(path);
    Ok(())
}

pub fn best_effort_chmod_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
}

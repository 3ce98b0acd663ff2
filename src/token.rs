use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use rand::{Rng, distributions::Alphanumeric};
use tokio::sync::Mutex;

use crate::node_state::{NodePaths, best_effort_chmod_0600, write_atomic};

pub const TOKEN_LEN: usize = 32;

/// Suffixes of the certificate-request tokens issued to a worker node.
pub const WORKER_CERT_ROLES: [&str; 2] = ["kubelet", "proxy"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Admits a new node. Single use.
    Cluster,
    /// Authorizes one certificate signing call.
    CertificateRequest,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::CertificateRequest => "certificate-request",
        }
    }
}

#[derive(Debug)]
pub enum TokenError {
    Io { path: PathBuf, source: io::Error },
    InvalidToken(&'static str),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "token file {}: {source}", path.display()),
            Self::InvalidToken(reason) => write!(f, "invalid token: {reason}"),
        }
    }
}

impl std::error::Error for TokenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::InvalidToken(_) => None,
        }
    }
}

/// Issues, checks and consumes the tokens kept under `credentials/`.
///
/// Every read-modify-write of a token file runs under the in-process mutex and an
/// exclusive `flock` on `credentials/.tokens.lock`, so checking a token and removing it is
/// a single step even when another process (`clusterd add-node`) updates the same files.
/// Two joins presenting the same cluster token cannot both pass.
#[derive(Debug)]
pub struct TokenAuthority {
    paths: NodePaths,
    lock: Mutex<()>,
}

impl TokenAuthority {
    pub fn new(paths: NodePaths) -> Self {
        Self {
            paths,
            lock: Mutex::new(()),
        }
    }

    fn file_for(&self, kind: TokenKind) -> &Path {
        match kind {
            TokenKind::Cluster => &self.paths.cluster_tokens,
            TokenKind::CertificateRequest => &self.paths.certs_request_tokens,
        }
    }

    /// Runs `op` on the blocking pool while holding both locks.
    async fn locked<T, F>(&self, op: F) -> Result<T, TokenError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TokenError> + Send + 'static,
    {
        let _guard = self.lock.lock().await;
        let lock_path = self.paths.tokens_lock.clone();
        tokio::task::spawn_blocking(move || {
            let _file_lock = FileLock::exclusive(&lock_path)?;
            op()
        })
        .await
        .map_err(|err| TokenError::Io {
            path: self.paths.tokens_lock.clone(),
            source: io::Error::other(err),
        })?
    }

    pub async fn validate_and_consume(
        &self,
        kind: TokenKind,
        token: &str,
    ) -> Result<bool, TokenError> {
        self.validate_and_consume_at(kind, token, Utc::now()).await
    }

    /// Returns `true` and removes `token` if it is present and not expired at `now`.
    /// An expired or malformed entry is left in place.
    pub async fn validate_and_consume_at(
        &self,
        kind: TokenKind,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, TokenError> {
        if token.is_empty() {
            return Ok(false);
        }
        let path = self.file_for(kind).to_path_buf();
        let token = token.to_string();
        self.locked(move || {
            let Some(content) = read_optional(&path)? else {
                return Ok(false);
            };

            let mut found = false;
            let mut kept = Vec::new();
            for line in content.lines() {
                let entry = TokenEntry::parse(line);
                if entry.token == token && !found && entry.is_valid_at(now) {
                    found = true;
                    continue;
                }
                kept.push(line);
            }
            if !found {
                return Ok(false);
            }

            write_lines(&path, &kept)?;
            Ok(true)
        })
        .await
    }

    /// Appends `token` to the set for `kind`, optionally expiring at a unix timestamp.
    pub async fn issue(
        &self,
        kind: TokenKind,
        token: &str,
        expires_at: Option<i64>,
    ) -> Result<(), TokenError> {
        validate_token_text(token)?;
        let path = self.file_for(kind).to_path_buf();
        let entry = match expires_at {
            Some(ts) => format!("{token}|{ts}"),
            None => token.to_string(),
        };
        self.locked(move || {
            let content = read_optional(&path)?.unwrap_or_default();
            let mut lines: Vec<&str> = content.lines().collect();
            lines.push(entry.as_str());
            write_lines(&path, &lines)
        })
        .await
    }

    pub async fn issue_certificate_request_token(&self, token: &str) -> Result<(), TokenError> {
        self.issue(TokenKind::CertificateRequest, token, None).await
    }

    /// Issues `<base>-<role>` for each worker sub-identity and returns the issued tokens.
    pub async fn issue_worker_certificate_request_tokens(
        &self,
        base: &str,
    ) -> Result<Vec<String>, TokenError> {
        let mut issued = Vec::with_capacity(WORKER_CERT_ROLES.len());
        for role in WORKER_CERT_ROLES {
            let token = format!("{base}-{role}");
            self.issue_certificate_request_token(&token).await?;
            issued.push(token);
        }
        Ok(issued)
    }

    /// Records the callback token presented by the peer at `peer` (`host:port`), replacing any
    /// earlier entry for the same peer.
    pub async fn store_callback_token(&self, peer: &str, token: &str) -> Result<(), TokenError> {
        validate_token_text(token)?;
        if peer.is_empty() || peer.contains(char::is_whitespace) {
            return Err(TokenError::InvalidToken("peer must be a host:port"));
        }
        let path = self.paths.callback_tokens.clone();
        let peer = peer.to_string();
        let entry = format!("{peer} {token}");
        self.locked(move || {
            let content = read_optional(&path)?.unwrap_or_default();
            let mut lines: Vec<&str> = content
                .lines()
                .filter(|line| line.split_whitespace().next() != Some(peer.as_str()))
                .collect();
            lines.push(entry.as_str());
            write_lines(&path, &lines)
        })
        .await
    }

    pub async fn callback_token_for(&self, peer: &str) -> Result<Option<String>, TokenError> {
        let path = self.paths.callback_tokens.clone();
        let peer = peer.to_string();
        self.locked(move || {
            let content = read_optional(&path)?.unwrap_or_default();
            Ok(content.lines().find_map(|line| {
                let mut parts = line.split_whitespace();
                if parts.next()? != peer {
                    return None;
                }
                parts.next().map(str::to_string)
            }))
        })
        .await
    }

    /// This node's own callback token, created on first use and stable afterwards.
    pub async fn self_callback_token(&self) -> Result<String, TokenError> {
        let path = self.paths.callback_token.clone();
        self.locked(move || {
            if let Some(existing) = read_optional(&path)? {
                let existing = existing.trim();
                if !existing.is_empty() {
                    return Ok(existing.to_string());
                }
            }
            let token = generate_token();
            write_atomic(&path, token.as_bytes()).map_err(|source| TokenError::Io {
                path: path.clone(),
                source,
            })?;
            best_effort_chmod_0600(&path);
            Ok(token)
        })
        .await
    }
}

/// Exclusive advisory lock on a lock file, released when the descriptor closes.
struct FileLock {
    _file: fs::File,
}

impl FileLock {
    fn exclusive(path: &Path) -> Result<Self, TokenError> {
        let io_err = |source| TokenError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        file.lock_exclusive().map_err(io_err)?;
        Ok(Self { _file: file })
    }
}

/// A random alphanumeric token of [`TOKEN_LEN`] characters.
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TokenEntry<'a> {
    token: &'a str,
    expiry: Option<&'a str>,
}

impl<'a> TokenEntry<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        match line.split_once('|') {
            Some((token, expiry)) => Self {
                token,
                expiry: Some(expiry),
            },
            None => Self {
                token: line,
                expiry: None,
            },
        }
    }

    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            None => true,
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(|expiry| now.timestamp() < expiry)
                .unwrap_or(false),
        }
    }
}

fn validate_token_text(token: &str) -> Result<(), TokenError> {
    if token.is_empty() {
        return Err(TokenError::InvalidToken("token is empty"));
    }
    if token.contains('|') || token.contains(char::is_whitespace) {
        return Err(TokenError::InvalidToken(
            "token must not contain '|' or whitespace",
        ));
    }
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<String>, TokenError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(TokenError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_lines<S: AsRef<str>>(path: &Path, lines: &[S]) -> Result<(), TokenError> {
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push('\n');
    }
    write_atomic(path, out.as_bytes()).map_err(|source| TokenError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    best_effort_chmod_0600(path);
    Ok(())
}

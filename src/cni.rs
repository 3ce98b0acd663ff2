use std::{io, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{node_state::write_atomic_async, services::KubeApi};

pub const IPV4_AUTODETECTION_HINT: &str = "IP_AUTODETECTION_METHOD";
pub const IPV6_AUTODETECTION_HINT: &str = "IP6_AUTODETECTION_METHOD";
pub const DEFAULT_AUTODETECTION: &str = "first-found";

/// Points the CNI's IP autodetection at an address peers can reach, once.
pub struct CniReachabilityPatcher {
    manifest: PathBuf,
    kube: Arc<dyn KubeApi>,
    lock: Mutex<()>,
}

impl CniReachabilityPatcher {
    pub fn new(manifest: PathBuf, kube: Arc<dyn KubeApi>) -> Self {
        Self {
            manifest,
            kube,
            lock: Mutex::new(()),
        }
    }

    /// Rewrites a `first-found` autodetection hint to `can-reach=<reachable_host>`. Returns
    /// whether the manifest changed. With `apply`, a changed manifest is pushed to the cluster;
    /// a failed push is logged only.
    pub async fn maybe_patch(&self, reachable_host: &str, apply: bool) -> anyhow::Result<bool> {
        {
            let _guard = self.lock.lock().await;
            let content = match tokio::fs::read_to_string(&self.manifest).await {
                Ok(content) => content,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("read {}", self.manifest.display()));
                }
            };
            let Some(patched) = patch_autodetection(&content, reachable_host) else {
                return Ok(false);
            };
            write_atomic_async(&self.manifest, patched.as_bytes())
                .await
                .with_context(|| format!("write {}", self.manifest.display()))?;
            info!(
                manifest = %self.manifest.display(),
                reachable_host = reachable_host,
                "cni autodetection set to can-reach"
            );
        }

        if apply {
            if let Err(err) = self.kube.apply_manifest(&self.manifest).await {
                warn!(
                    manifest = %self.manifest.display(),
                    error = %err,
                    "failed to apply patched cni manifest"
                );
            }
        }
        Ok(true)
    }
}

/// Returns the patched manifest when the first value following the hint's name is
/// `first-found`, `None` otherwise.
pub fn patch_autodetection(manifest: &str, reachable_host: &str) -> Option<String> {
    let hint = if reachable_host.contains(':') {
        IPV6_AUTODETECTION_HINT
    } else {
        IPV4_AUTODETECTION_HINT
    };
    let name_at = manifest.find(hint)?;
    let after = name_at + hint.len();
    let (start, end) = value_span(&manifest[after..])?;
    let (start, end) = (after + start, after + end);
    if &manifest[start..end] != DEFAULT_AUTODETECTION {
        return None;
    }

    let mut out = String::with_capacity(manifest.len() + reachable_host.len());
    out.push_str(&manifest[..start]);
    out.push_str("can-reach=");
    out.push_str(reachable_host);
    out.push_str(&manifest[end..]);
    Some(out)
}

/// Byte span of the first value token in `rest`, which starts right after the hint's name.
/// Accepts `NAME: value` as well as the `- name: NAME` / `value: "..."` env var layout.
fn value_span(rest: &str) -> Option<(usize, usize)> {
    let is_sep = |c: char| c.is_whitespace() || c == ':' || c == '"' || c == '\'';
    let mut start = rest.find(|c: char| !is_sep(c))?;
    if rest[start..].starts_with("value:") {
        let skip = start + "value:".len();
        start = skip + rest[skip..].find(|c: char| !is_sep(c))?;
    }
    let len = rest[start..]
        .find(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .unwrap_or(rest.len() - start);
    Some((start, start + len))
}

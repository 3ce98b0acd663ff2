use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;

use crate::node_state::{NodePaths, write_atomic_async};

/// Line-oriented access to the per-service flag files under `args/`.
///
/// A line is `--flag value` or `--flag=value`. Lines this type does not understand are kept
/// verbatim when the file is rewritten.
#[derive(Debug, Clone)]
pub struct ServiceArgumentStore {
    paths: NodePaths,
}

impl ServiceArgumentStore {
    pub fn new(paths: NodePaths) -> Self {
        Self { paths }
    }

    /// Value of `flag` for `service`, or `""` when the file, the flag or the value is missing.
    ///
    /// Only the last whitespace-separated token of the matching line is taken as the value, so a
    /// line holding two flags answers only for the first one.
    pub async fn get_argument(&self, service: &str, flag: &str) -> String {
        let Ok(content) = tokio::fs::read_to_string(self.paths.service_args(service)).await else {
            return String::new();
        };
        for line in content.lines() {
            let line = line.trim();
            if !line.starts_with(flag) {
                continue;
            }
            if flag_name(line) != flag {
                continue;
            }
            let Some(last) = line.split_whitespace().last() else {
                continue;
            };
            let value = match last.split_once('=') {
                Some((_, value)) => value,
                None if last == flag => "",
                None => last,
            };
            return value.to_string();
        }
        String::new()
    }

    /// Rewrites the service's flag file: matching flags are replaced in place, deleted flags
    /// dropped, unmatched updates appended. No write happens when both maps are empty.
    pub async fn update_arguments(
        &self,
        service: &str,
        updates: &BTreeMap<String, String>,
        deletions: &BTreeSet<String>,
    ) -> anyhow::Result<()> {
        if updates.is_empty() && deletions.is_empty() {
            return Ok(());
        }

        let path = self.paths.service_args(service);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", path.display()));
            }
        };

        let mut applied = BTreeSet::new();
        let mut out = String::with_capacity(content.len());
        for line in content.lines() {
            let name = flag_name(line.trim());
            if deletions.contains(name) {
                continue;
            }
            match updates.get(name) {
                Some(value) => {
                    out.push_str(&format_flag(name, value));
                    applied.insert(name.to_string());
                }
                None => out.push_str(line),
            }
            out.push('\n');
        }
        for (name, value) in updates {
            if applied.contains(name) || deletions.contains(name) {
                continue;
            }
            out.push_str(&format_flag(name, value));
            out.push('\n');
        }

        write_atomic_async(&path, out.as_bytes())
            .await
            .with_context(|| format!("write {}", path.display()))
    }
}

/// Flag identity: the text before the first `=` or space.
fn flag_name(line: &str) -> &str {
    let end = line.find(['=', ' ']).unwrap_or(line.len());
    &line[..end]
}

fn format_flag(name: &str, value: &str) -> String {
    if value.is_empty() {
        name.to_string()
    } else {
        format!("{name}={value}")
    }
}

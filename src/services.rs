use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use tracing::{debug, info};

use crate::config::{Config, RestartMode};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Restarts node-local services by their short name (e.g. `k8s-dqlite`).
pub trait ServiceControl: Send + Sync {
    fn restart(&self, service: &str) -> BoxFuture<'_, Result<(), RestartError>>;
    fn name(&self) -> &'static str;
}

/// Access to the running cluster's orchestration API.
pub trait KubeApi: Send + Sync {
    fn apply_manifest(&self, manifest: &Path) -> BoxFuture<'_, Result<(), KubeError>>;
    fn control_plane_node_ips(&self) -> BoxFuture<'_, Result<Vec<String>, KubeError>>;
}

#[derive(Debug, Clone)]
struct SystemdServiceControl {
    unit_prefix: String,
    timeout: Duration,
}

impl ServiceControl for SystemdServiceControl {
    fn restart(&self, service: &str) -> BoxFuture<'_, Result<(), RestartError>> {
        let unit = format!("{}{service}", self.unit_prefix);
        Box::pin(async move {
            run_command_with_timeout(
                &["/usr/bin/systemctl", "/bin/systemctl", "systemctl"],
                &["restart", &unit],
                self.timeout,
            )
            .await
            .map_err(|details| RestartError::Command {
                program: "systemctl",
                details,
            })
        })
    }

    fn name(&self) -> &'static str {
        "systemd"
    }
}

#[derive(Debug, Clone)]
struct OpenrcServiceControl {
    service_prefix: String,
    timeout: Duration,
}

impl ServiceControl for OpenrcServiceControl {
    fn restart(&self, service: &str) -> BoxFuture<'_, Result<(), RestartError>> {
        let service = format!("{}{service}", self.service_prefix);
        Box::pin(async move {
            run_command_with_timeout(
                &["/sbin/rc-service", "/usr/sbin/rc-service", "rc-service"],
                &[&service, "restart"],
                self.timeout,
            )
            .await
            .map_err(|details| RestartError::Command {
                program: "rc-service",
                details,
            })
        })
    }

    fn name(&self) -> &'static str {
        "openrc"
    }
}

/// Leaves restarts to an external supervisor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopServiceControl;

impl ServiceControl for NoopServiceControl {
    fn restart(&self, service: &str) -> BoxFuture<'_, Result<(), RestartError>> {
        info!(service = service, "restart mode is none; not restarting");
        Box::pin(async { Ok(()) })
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

pub fn service_control_from_config(config: &Config) -> Arc<dyn ServiceControl> {
    let timeout = config.restart_timeout();
    match config.restart_mode {
        RestartMode::None => Arc::new(NoopServiceControl),
        RestartMode::Systemd => Arc::new(SystemdServiceControl {
            unit_prefix: config.service_unit_prefix.clone(),
            timeout,
        }),
        RestartMode::Openrc => Arc::new(OpenrcServiceControl {
            service_prefix: config.service_unit_prefix.clone(),
            timeout,
        }),
    }
}

/// `KubeApi` backed by the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct Kubectl {
    program: String,
    control_plane_label: String,
    timeout: Duration,
}

impl Kubectl {
    pub fn new(program: impl Into<String>, control_plane_label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            control_plane_label: control_plane_label.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.kubectl.clone(), config.control_plane_label.clone())
    }
}

impl KubeApi for Kubectl {
    fn apply_manifest(&self, manifest: &Path) -> BoxFuture<'_, Result<(), KubeError>> {
        let manifest: PathBuf = manifest.to_path_buf();
        Box::pin(async move {
            let manifest = manifest.to_string_lossy().into_owned();
            run_command_with_timeout(
                &[self.program.as_str()],
                &["apply", "-f", &manifest],
                self.timeout,
            )
            .await
            .map_err(KubeError::Command)
        })
    }

    fn control_plane_node_ips(&self) -> BoxFuture<'_, Result<Vec<String>, KubeError>> {
        Box::pin(async move {
            let selector = format!("-l={}", self.control_plane_label);
            let stdout = command_output_with_timeout(
                &self.program,
                &[
                    "get",
                    "nodes",
                    &selector,
                    "-o",
                    r#"jsonpath={.items[*].status.addresses[?(@.type=="InternalIP")].address}"#,
                ],
                self.timeout,
            )
            .await
            .map_err(KubeError::Command)?;
            let ips: Vec<String> = stdout.split_whitespace().map(str::to_string).collect();
            debug!(count = ips.len(), "listed control plane nodes");
            Ok(ips)
        })
    }
}

async fn run_command_with_timeout(
    programs: &[&str],
    args: &[&str],
    timeout: Duration,
) -> Result<(), String> {
    for program in programs {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let status = match tokio::time::timeout(timeout, cmd.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Ok(Err(err)) => return Err(format!("spawn {program}: {err}")),
            Err(_) => return Err(format!("timeout running {program}")),
        };

        if status.success() {
            return Ok(());
        }
        return Err(format!("{program} exited with {status}"));
    }

    Err("no matching program found".to_string())
}

async fn command_output_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, String> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Err(format!("spawn {program}: {err}")),
        Err(_) => return Err(format!("timeout running {program}")),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        ));
    }
    String::from_utf8(output.stdout).map_err(|_| format!("{program} printed invalid utf-8"))
}

#[derive(Debug)]
pub enum RestartError {
    Command {
        program: &'static str,
        details: String,
    },
}

impl std::fmt::Display for RestartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command { program, details } => write!(f, "{program}: {details}"),
        }
    }
}

impl std::error::Error for RestartError {}

#[derive(Debug)]
pub enum KubeError {
    Command(String),
}

impl std::fmt::Display for KubeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(details) => write!(f, "kubectl: {details}"),
        }
    }
}

impl std::error::Error for KubeError {}

//! One-shot installer containers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::blueprint::Blueprint;
use crate::config::AgentConfig;
use crate::error::{OrchestratorError, Result};
use crate::image_resolver::ResolutionSession;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};

const INSTALL_MOUNT: &str = "/mnt/server";
const FAILURE_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The blueprint has no installation phase.
    Skipped,
    Completed { image: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EulaChange {
    Created,
    Accepted,
    Unchanged,
}

/// Makes sure `eula.txt` in `dir` reads `eula=true`, touching nothing else.
pub fn ensure_eula(dir: &Path) -> std::io::Result<EulaChange> {
    let path = dir.join("eula.txt");
    let existing = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::write(&path, b"eula=true\n")?;
            return Ok(EulaChange::Created);
        }
        Err(e) => return Err(e),
    };

    let mut changed = false;
    let mut found = false;
    let mut out = String::with_capacity(existing.len() + 12);
    for line in existing.lines() {
        if let Some((key, value)) = line.split_once('=')
            && key.trim().eq_ignore_ascii_case("eula")
        {
            found = true;
            if !value.trim().eq_ignore_ascii_case("true") {
                out.push_str("eula=true\n");
                changed = true;
                continue;
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    if !found {
        out.push_str("eula=true\n");
        changed = true;
    }
    if !changed {
        return Ok(EulaChange::Unchanged);
    }
    std::fs::write(&path, out)?;
    Ok(EulaChange::Accepted)
}

fn apt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(^|[\s;&|(])apt(\s)").expect("valid regex"))
}

fn apt_get_subcommand_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"apt-get(\s+)(install|upgrade|dist-upgrade|full-upgrade)\b").expect("valid regex")
    })
}

fn has_assume_yes(line: &str) -> bool {
    line.split_whitespace().any(|t| {
        t == "--yes"
            || t == "--assume-yes"
            || (t.starts_with('-') && !t.starts_with("--") && t.contains('y'))
    })
}

/// Rewrites installer scripts that only work interactively or on the author's
/// machine: CRLF line endings, `apt` instead of `apt-get`, missing `-y`.
pub fn normalize_script(script: &str) -> String {
    let unix = script.replace("\r\n", "\n").replace('\r', "\n");

    let mut lines = Vec::new();
    for line in unix.lines() {
        let line = apt_re().replace_all(line, "${1}apt-get${2}").into_owned();
        let line = if apt_get_subcommand_re().is_match(&line) && !has_assume_yes(&line) {
            apt_get_subcommand_re()
                .replacen(&line, 1, "apt-get${1}${2} -y")
                .into_owned()
        } else {
            line
        };
        lines.push(line);
    }
    let mut body = lines.join("\n");
    body.push('\n');

    if body.contains("apt-get") && !body.contains("DEBIAN_FRONTEND") {
        let (shebang, rest) = match body.strip_prefix("#!") {
            Some(_) => body.split_once('\n').unwrap_or((body.as_str(), "")),
            None => ("", body.as_str()),
        };
        let mut out = String::with_capacity(body.len() + 48);
        if !shebang.is_empty() {
            out.push_str(shebang);
            out.push('\n');
        }
        out.push_str("export DEBIAN_FRONTEND=noninteractive\n");
        out.push_str(rest);
        return out;
    }
    body
}

/// Runs a blueprint's installation script against an instance's data directory.
pub struct InstallationRunner {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<AgentConfig>,
}

impl InstallationRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: Arc<AgentConfig>) -> Self {
        Self { runtime, config }
    }

    /// Installs into `data_dir`. The install container is removed whatever the
    /// outcome, including cancellation.
    pub async fn run(
        &self,
        session: &mut ResolutionSession,
        instance_id: &str,
        blueprint: &Blueprint,
        env: &BTreeMap<String, String>,
        data_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome> {
        let Some(install) = blueprint.install.as_ref() else {
            self.finish(blueprint, data_dir)?;
            return Ok(InstallOutcome::Skipped);
        };

        let image = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::Cancelled("installation".into()));
            }
            r = session.resolve_installer(install.container.as_deref()) => r?,
        };

        let name = self.config.install_container_name(instance_id);
        // A crashed agent may have left one behind.
        match self.runtime.remove_container(&name, true).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(OrchestratorError::from_runtime("install", "container", &name, e)),
        }

        let mut env_list: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env_list.push(format!("SERVER_DIR={INSTALL_MOUNT}"));
        let spec = ContainerSpec {
            name: name.clone(),
            image: image.clone(),
            env: env_list,
            entrypoint: Some(vec![install.entrypoint.clone()]),
            cmd: vec!["-c".to_string(), normalize_script(&install.script)],
            working_dir: Some(INSTALL_MOUNT.to_string()),
            binds: vec![format!("{}:{INSTALL_MOUNT}", data_dir.display())],
            labels: [
                ("hatchery.instance".to_string(), instance_id.to_string()),
                ("hatchery.role".to_string(), "install".to_string()),
            ]
            .into_iter()
            .collect(),
            ..ContainerSpec::default()
        };

        tracing::info!(instance_id, %image, blueprint = %blueprint.reference, "running installer");
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled("installation".into())),
            r = self.execute(&name, &spec) => r,
        };

        self.capture_log(instance_id, &name).await;
        match self.runtime.remove_container(&name, true).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => tracing::warn!(instance_id, container = %name, error = %e, "failed to remove install container"),
        }

        let exit_code = outcome?;
        if exit_code != 0 {
            self.log_failure_tail(instance_id).await;
            return Err(OrchestratorError::InstallationFailed {
                exit_code: Some(exit_code),
                message: format!("installer exited with code {exit_code}"),
            });
        }

        self.finish(blueprint, data_dir)?;
        tracing::info!(instance_id, "installation complete");
        Ok(InstallOutcome::Completed { image })
    }

    async fn execute(&self, name: &str, spec: &ContainerSpec) -> Result<i64> {
        self.runtime
            .create_container(spec)
            .await
            .map_err(|e| OrchestratorError::from_runtime("install", "image", &spec.image, e))?;
        self.runtime
            .start_container(name)
            .await
            .map_err(|e| OrchestratorError::from_runtime("install", "container", name, e))?;

        let limit = self.config.install_timeout;
        match tokio::time::timeout(limit, self.runtime.wait_container(name)).await {
            Ok(r) => r.map_err(|e| OrchestratorError::from_runtime("install", "container", name, e)),
            Err(_) => Err(OrchestratorError::InstallationFailed {
                exit_code: None,
                message: format!("installer exceeded {}s", limit.as_secs()),
            }),
        }
    }

    fn finish(&self, blueprint: &Blueprint, data_dir: &Path) -> Result<()> {
        if blueprint.requires_eula() {
            let change = ensure_eula(data_dir)?;
            tracing::debug!(?change, "license acceptance checked");
        }
        Ok(())
    }

    /// Writes the full installer output to the instance's install log.
    async fn capture_log(&self, instance_id: &str, name: &str) {
        let records = match self.runtime.tail_logs(name, None).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(instance_id, error = %e, "no installer output captured");
                return;
            }
        };
        let path = self.config.install_log_path(instance_id);
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut f = tokio::fs::File::create(&path).await?;
            for r in &records {
                f.write_all(r.text.as_bytes()).await?;
                f.write_all(b"\n").await?;
            }
            f.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(instance_id, error = %e, "failed to write install log");
        }
    }

    async fn log_failure_tail(&self, instance_id: &str) {
        let path = self.config.install_log_path(instance_id);
        let Ok(text) = tokio::fs::read_to_string(&path).await else {
            return;
        };
        let lines: Vec<&str> = text.lines().collect();
        let tail = lines[lines.len().saturating_sub(FAILURE_TAIL_LINES)..].join("\n");
        tracing::warn!(instance_id, output = %tail, "installer failed");
    }
}

use std::collections::HashMap;
use std::time::Duration;

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, PortMap, RestartPolicy, RestartPolicyNameEnum};
use futures_util::StreamExt;

use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ExecOutput, LogRecord, RuntimeError,
    RuntimeResult,
};

/// [`ContainerRuntime`] backed by the Docker Engine API.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using `DOCKER_HOST` or the platform's local socket.
    pub fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(format!("failed to connect to docker: {e}")))?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> RuntimeResult<()> {
        self.docker.ping().await.map(|_| ()).map_err(map_err)
    }
}

fn map_err(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code: 304,
            message,
        } => RuntimeError::NotModified(if message.is_empty() {
            "container already in requested state".to_string()
        } else {
            message
        }),
        BollardError::DockerResponseServerError { message, .. } => RuntimeError::Rejected(message),
        BollardError::DockerStreamError { error } => RuntimeError::Rejected(error),
        BollardError::DockerContainerWaitError { error, .. } => RuntimeError::Rejected(error),
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

/// Splits `repo[:tag]` for the pull API; a digest reference is passed whole.
fn split_image_ref(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    match image.rsplit_once(':') {
        // A colon before the last '/' belongs to a registry port.
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    }
}

fn build_config(spec: &ContainerSpec) -> Config<String> {
    let mut port_bindings = PortMap::new();
    let mut exposed_ports = HashMap::new();
    for p in &spec.ports {
        let key = format!("{}/{}", p.internal, p.protocol.as_str());
        port_bindings.insert(
            key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(p.external.to_string()),
            }]),
        );
        exposed_ports.insert(key, HashMap::new());
    }

    let mut host_config = HostConfig {
        binds: Some(spec.binds.clone()),
        port_bindings: Some(port_bindings),
        ..Default::default()
    };
    if spec.memory_mb > 0 {
        host_config.memory = Some((spec.memory_mb as i64) * 1024 * 1024);
    }
    if spec.cpu_percent > 0 {
        // 100% == one core == 1e9 nano cpus.
        host_config.nano_cpus = Some((spec.cpu_percent as i64) * 10_000_000);
    }
    if let Some(disk_mb) = spec.disk_mb.filter(|v| *v > 0) {
        host_config.storage_opt = Some(HashMap::from([(
            "size".to_string(),
            format!("{disk_mb}M"),
        )]));
    }
    if spec.restart_unless_stopped {
        host_config.restart_policy = Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        });
    }

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        cmd: if spec.cmd.is_empty() {
            None
        } else {
            Some(spec.cmd.clone())
        },
        entrypoint: spec.entrypoint.clone(),
        working_dir: spec.working_dir.clone(),
        user: spec.user.clone(),
        stop_signal: spec.stop_signal.clone(),
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        tty: Some(false),
        ..Default::default()
    }
}

fn collect_lines(bytes: &[u8]) -> Vec<LogRecord> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(LogRecord::parse_timestamped)
        .collect()
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_present(&self, image: &str) -> RuntimeResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let (from_image, tag) = split_image_ref(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            let info = item.map_err(map_err)?;
            if let Some(err) = info.error {
                return Err(RuntimeError::Rejected(err));
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let resp = self
            .docker
            .create_container(Some(options), build_config(spec))
            .await
            .map_err(map_err)?;
        for w in resp.warnings {
            tracing::warn!(container = %spec.name, warning = %w, "runtime warning on create");
        }
        Ok(resp.id)
    }

    async fn start_container(&self, name: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_err)
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> RuntimeResult<()> {
        self.docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(map_err)
    }

    async fn restart_container(&self, name: &str, grace: Duration) -> RuntimeResult<()> {
        self.docker
            .restart_container(
                name,
                Some(RestartContainerOptions {
                    t: grace.as_secs() as isize,
                }),
            )
            .await
            .map_err(map_err)
    }

    async fn remove_container(&self, name: &str, force: bool) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_err)
    }

    async fn inspect_container(&self, name: &str) -> RuntimeResult<Option<ContainerStatus>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(resp) => {
                let state = resp.state.unwrap_or_default();
                Ok(Some(ContainerStatus {
                    id: resp.id.unwrap_or_default(),
                    running: state.running.unwrap_or(false),
                    exit_code: state.exit_code,
                }))
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn wait_container(&self, name: &str) -> RuntimeResult<i64> {
        let mut stream = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(resp)) => Ok(resp.status_code),
            // bollard reports a nonzero exit as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_err(e)),
            None => Err(RuntimeError::Rejected(format!(
                "wait stream for {name} ended without a status"
            ))),
        }
    }

    async fn exec(&self, name: &str, cmd: Vec<String>) -> RuntimeResult<ExecOutput> {
        let created = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_err)?;

        let mut output = String::new();
        match self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(map_err)?
        {
            StartExecResults::Attached { output: mut out, .. } => {
                while let Some(chunk) = out.next().await {
                    let chunk = chunk.map_err(map_err)?;
                    output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(map_err)?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            output,
        })
    }

    async fn tail_logs(&self, name: &str, tail: Option<usize>) -> RuntimeResult<Vec<LogRecord>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_err)?;
            buf.extend_from_slice(&chunk.into_bytes());
        }
        Ok(collect_lines(&buf))
    }
}

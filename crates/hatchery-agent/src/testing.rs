//! Scripted in-memory runtime used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ExecOutput, LogRecord, RuntimeError,
    RuntimeResult,
};

#[derive(Debug, Clone)]
pub(crate) struct FakeContainer {
    pub spec: ContainerSpec,
    pub running: bool,
    pub logs: Vec<LogRecord>,
}

#[derive(Default)]
struct FakeState {
    present: HashSet<String>,
    pullable: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    install_exit_code: i64,
    install_output: Vec<String>,
    install_blocks: bool,
    startup_lines: Vec<String>,
    exit_on_start: bool,
    unremovable: HashSet<String>,
    calls: Vec<String>,
    log_seq: u64,
    next_id: u64,
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let rt = Self::default();
        {
            let mut st = rt.state.lock().unwrap();
            st.startup_lines = vec!["\u{1b}[32m[Server] Starting game server\u{1b}[0m".to_string()];
        }
        rt
    }

    pub fn with_present(self, image: &str) -> Self {
        self.state.lock().unwrap().present.insert(image.to_string());
        self
    }

    pub fn with_pullable(self, image: &str) -> Self {
        self.state.lock().unwrap().pullable.insert(image.to_string());
        self
    }

    pub fn with_install_exit(self, code: i64, output: &[&str]) -> Self {
        {
            let mut st = self.state.lock().unwrap();
            st.install_exit_code = code;
            st.install_output = output.iter().map(|s| s.to_string()).collect();
        }
        self
    }

    /// Install containers never exit on their own.
    pub fn with_blocking_install(self) -> Self {
        self.state.lock().unwrap().install_blocks = true;
        self
    }

    /// Containers stop right after starting, as if the server crashed.
    pub fn with_crash_on_start(self) -> Self {
        self.state.lock().unwrap().exit_on_start = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .containers
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Simulates the server process writing a line.
    pub fn push_log(&self, name: &str, text: &str) {
        let mut st = self.state.lock().unwrap();
        let ts = next_timestamp(&mut st);
        if let Some(c) = st.containers.get_mut(name) {
            c.logs.push(LogRecord {
                timestamp: Some(ts),
                text: text.to_string(),
            });
        }
    }

    /// Simulates the container dying outside of the orchestrator's control.
    pub fn kill(&self, name: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(name) {
            c.running = false;
        }
    }

    /// Removals of `name` fail as if the daemon went away mid-request.
    pub fn refuse_removal(&self, name: &str) {
        self.state.lock().unwrap().unremovable.insert(name.to_string());
    }

    /// Simulates the container vanishing from the runtime.
    pub fn forget(&self, name: &str) {
        self.state.lock().unwrap().containers.remove(name);
    }
}

fn next_timestamp(st: &mut FakeState) -> String {
    st.log_seq += 1;
    let base = chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let ts = base + chrono::Duration::milliseconds(st.log_seq as i64);
    ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

fn is_install(name: &str) -> bool {
    name.contains("_install_")
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_present(&self, image: &str) -> RuntimeResult<bool> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("image_present:{image}"));
        Ok(st.present.contains(image))
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("pull:{image}"));
        if st.pullable.contains(image) {
            st.present.insert(image.to_string());
            Ok(())
        } else {
            Err(RuntimeError::Rejected(format!("pull access denied for {image}")))
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("create:{}", spec.name));
        if !st.present.contains(&spec.image) {
            return Err(RuntimeError::NotFound(format!("no such image: {}", spec.image)));
        }
        if st.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Rejected(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        st.next_id += 1;
        let id = format!("c{}", st.next_id);
        st.containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                logs: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> RuntimeResult<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("start:{name}"));
        let exit_on_start = st.exit_on_start && !is_install(name);
        let lines = if is_install(name) {
            st.install_output.clone()
        } else {
            st.startup_lines.clone()
        };
        let stamps: Vec<String> = lines.iter().map(|_| next_timestamp(&mut st)).collect();
        let Some(c) = st.containers.get_mut(name) else {
            return Err(RuntimeError::NotFound(name.to_string()));
        };
        if c.running {
            return Err(RuntimeError::NotModified("container already started".into()));
        }
        c.running = !exit_on_start;
        for (text, ts) in lines.into_iter().zip(stamps) {
            c.logs.push(LogRecord {
                timestamp: Some(ts),
                text,
            });
        }
        Ok(())
    }

    async fn stop_container(&self, name: &str, _grace: Duration) -> RuntimeResult<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("stop:{name}"));
        let Some(c) = st.containers.get_mut(name) else {
            return Err(RuntimeError::NotFound(name.to_string()));
        };
        if !c.running {
            return Err(RuntimeError::NotModified("container already stopped".into()));
        }
        c.running = false;
        Ok(())
    }

    async fn restart_container(&self, name: &str, _grace: Duration) -> RuntimeResult<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("restart:{name}"));
        let Some(c) = st.containers.get_mut(name) else {
            return Err(RuntimeError::NotFound(name.to_string()));
        };
        c.running = true;
        Ok(())
    }

    async fn remove_container(&self, name: &str, force: bool) -> RuntimeResult<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("remove:{name}"));
        if st.unremovable.contains(name) {
            return Err(RuntimeError::Unavailable("daemon stopped responding".into()));
        }
        match st.containers.get(name) {
            None => Err(RuntimeError::NotFound(name.to_string())),
            Some(c) if c.running && !force => {
                Err(RuntimeError::Rejected("container is running".into()))
            }
            Some(_) => {
                st.containers.remove(name);
                Ok(())
            }
        }
    }

    async fn inspect_container(&self, name: &str) -> RuntimeResult<Option<ContainerStatus>> {
        let st = self.state.lock().unwrap();
        Ok(st.containers.get(name).map(|c| ContainerStatus {
            id: name.to_string(),
            running: c.running,
            exit_code: if c.running { None } else { Some(0) },
        }))
    }

    async fn wait_container(&self, name: &str) -> RuntimeResult<i64> {
        let blocks = {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!("wait:{name}"));
            if !st.containers.contains_key(name) {
                return Err(RuntimeError::NotFound(name.to_string()));
            }
            is_install(name) && st.install_blocks
        };
        if blocks {
            std::future::pending::<()>().await;
        }
        let mut st = self.state.lock().unwrap();
        let code = st.install_exit_code;
        if let Some(c) = st.containers.get_mut(name) {
            c.running = false;
        }
        Ok(code)
    }

    async fn exec(&self, name: &str, cmd: Vec<String>) -> RuntimeResult<ExecOutput> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("exec:{name}:{}", cmd.join(" ")));
        match st.containers.get(name) {
            None => Err(RuntimeError::NotFound(name.to_string())),
            Some(c) if !c.running => Err(RuntimeError::Rejected(format!(
                "container {name} is not running"
            ))),
            Some(_) => Ok(ExecOutput {
                exit_code: Some(0),
                output: format!("ran: {}\n", cmd.last().cloned().unwrap_or_default()),
            }),
        }
    }

    async fn tail_logs(&self, name: &str, tail: Option<usize>) -> RuntimeResult<Vec<LogRecord>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("logs:{name}"));
        let Some(c) = st.containers.get(name) else {
            return Err(RuntimeError::NotFound(name.to_string()));
        };
        let start = tail.map(|n| c.logs.len().saturating_sub(n)).unwrap_or(0);
        Ok(c.logs[start..].to_vec())
    }
}

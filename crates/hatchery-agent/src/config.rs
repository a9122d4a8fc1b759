use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONTAINER_PREFIX: &str = "game_server";
const DEFAULT_CONTAINER_USER: &str = "1000:1000";
const DEFAULT_MAX_READ_BYTES: u64 = 5 * 1024 * 1024;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_bool(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn absolute(raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };
    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub eggs_dir: PathBuf,
    pub container_prefix: String,
    pub container_user: String,
    pub console_poll_interval: Duration,
    pub console_tail_lines: usize,
    pub console_history_lines: usize,
    pub install_timeout: Duration,
    pub stop_grace: Duration,
    pub max_read_bytes: u64,
    pub fallback_chains_file: Option<PathBuf>,
    pub enforce_disk_quota: bool,
}

impl AgentConfig {
    /// Defaults rooted at `data_root`; used by tests and embedders.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            eggs_dir: data_root.join("eggs"),
            data_root,
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            container_user: DEFAULT_CONTAINER_USER.to_string(),
            console_poll_interval: Duration::from_millis(1000),
            console_tail_lines: 200,
            console_history_lines: 1000,
            install_timeout: Duration::from_secs(30 * 60),
            stop_grace: Duration::from_secs(10),
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            fallback_chains_file: None,
            enforce_disk_quota: false,
        }
    }

    pub fn from_env() -> Self {
        let data_root =
            absolute(&std::env::var("HATCHERY_DATA_ROOT").unwrap_or_else(|_| "./data".to_string()));
        let mut cfg = Self::with_data_root(data_root);

        cfg.eggs_dir =
            absolute(&std::env::var("HATCHERY_EGGS_DIR").unwrap_or_else(|_| "./eggs".to_string()));

        if let Ok(prefix) = std::env::var("HATCHERY_CONTAINER_PREFIX") {
            let prefix = prefix.trim();
            if !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            {
                cfg.container_prefix = prefix.to_string();
            }
        }
        if let Ok(user) = std::env::var("HATCHERY_CONTAINER_USER") {
            cfg.container_user = user.trim().to_string();
        }

        cfg.console_poll_interval = Duration::from_millis(
            env_u64("HATCHERY_CONSOLE_POLL_MS")
                .map(|v| v.clamp(100, 60_000))
                .unwrap_or(1000),
        );
        cfg.console_tail_lines = env_u64("HATCHERY_CONSOLE_TAIL_LINES")
            .map(|v| v.clamp(10, 5000) as usize)
            .unwrap_or(200);
        cfg.console_history_lines = env_u64("HATCHERY_CONSOLE_HISTORY_LINES")
            .map(|v| v.clamp(100, 50_000) as usize)
            .unwrap_or(1000);
        cfg.install_timeout = Duration::from_secs(
            env_u64("HATCHERY_INSTALL_TIMEOUT_SEC")
                .map(|v| v.clamp(10, 24 * 60 * 60))
                .unwrap_or(30 * 60),
        );
        cfg.stop_grace = Duration::from_secs(
            env_u64("HATCHERY_STOP_GRACE_SEC")
                .map(|v| v.clamp(1, 300))
                .unwrap_or(10),
        );
        cfg.max_read_bytes = env_u64("HATCHERY_MAX_READ_BYTES")
            .map(|v| v.clamp(4 * 1024, 256 * 1024 * 1024))
            .unwrap_or(DEFAULT_MAX_READ_BYTES);
        cfg.fallback_chains_file = std::env::var("HATCHERY_FALLBACK_CHAINS")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| absolute(v.trim()));
        cfg.enforce_disk_quota = env_bool("HATCHERY_ENFORCE_DISK_QUOTA");

        cfg
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_root.join("state")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.data_root.join("volumes")
    }

    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.volumes_dir().join(instance_id)
    }

    pub fn install_log_path(&self, instance_id: &str) -> PathBuf {
        self.state_dir().join(format!("{instance_id}.install.log"))
    }

    pub fn instance_lock_path(&self, instance_id: &str) -> PathBuf {
        self.state_dir().join(format!("{instance_id}.lock"))
    }

    /// Guards port reservation across processes.
    pub fn ports_lock_path(&self) -> PathBuf {
        self.state_dir().join("ports.lock")
    }

    pub fn container_name(&self, instance_id: &str) -> String {
        format!("{}_{}", self.container_prefix, instance_id)
    }

    pub fn install_container_name(&self, instance_id: &str) -> String {
        format!("{}_install_{}", self.container_prefix, instance_id)
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [self.state_dir(), self.volumes_dir()] {
            create_private_dir(&dir)?;
        }
        Ok(())
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750)).ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_follow_prefix() {
        let mut cfg = AgentConfig::with_data_root("/tmp/x");
        assert_eq!(cfg.container_name("abc-123"), "game_server_abc-123");
        assert_eq!(cfg.install_container_name("abc-123"), "game_server_install_abc-123");
        cfg.container_prefix = "hatch".to_string();
        assert_eq!(cfg.container_name("abc-123"), "hatch_abc-123");
    }

    #[test]
    fn layout_keeps_records_outside_instance_volumes() {
        let cfg = AgentConfig::with_data_root("/srv/hatchery");
        assert_eq!(cfg.instance_dir("a"), PathBuf::from("/srv/hatchery/volumes/a"));
        assert!(!cfg.install_log_path("a").starts_with(cfg.instance_dir("a")));
    }
}

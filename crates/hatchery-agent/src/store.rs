//! Durable instance records, one JSON file per instance.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hatchery_instance::{InstanceId, InstanceState, PortMapping, ResourceLimits};
use tokio::io::AsyncWriteExt;

use crate::blueprint::Blueprint;
use crate::error::{OrchestratorError, Result};

/// Everything needed to rebuild an instance's container from scratch.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub name: String,
    pub blueprint_ref: String,
    /// Snapshot taken at creation; later catalog edits do not apply.
    pub blueprint: Blueprint,
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub limits: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_override: Option<String>,
    /// Last compiled startup command.
    #[serde(default)]
    pub startup_command: String,
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn startup_template(&self) -> &str {
        self.startup_override
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.blueprint.startup)
    }

    pub fn primary_port(&self) -> Option<&PortMapping> {
        self.ports.first()
    }
}

#[derive(Debug, Clone)]
pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn load(&self, id: &InstanceId) -> Result<InstanceRecord> {
        let raw = match tokio::fs::read(self.path(id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OrchestratorError::not_found("instance", id.as_str()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| OrchestratorError::Internal(format!("instance record {id} is corrupt: {e}")))
    }

    pub async fn save(&self, record: &InstanceRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(record)?;

        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(&data).await?;
        f.flush().await?;
        drop(f);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn remove(&self, id: &InstanceId) -> Result<()> {
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable records, oldest first. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<InstanceRecord>> {
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let Some(id) = InstanceId::parse(stem) else {
                continue;
            };
            match self.load(&id).await {
                Ok(r) => out.push(r),
                Err(e) => tracing::warn!(instance_id = %id, error = %e, "skipping unreadable record"),
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}

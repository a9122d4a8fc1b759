//! File access confined to one instance's data directory.
//!
//! Paths are normalised lexically first, so `..` that would climb above the
//! root is refused before the filesystem is touched. What remains is checked
//! again after symlink resolution. Error messages only ever mention the
//! caller's relative path.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Dir,
    File,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileEntry {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// Lexically normalises `rel` against the root. A leading `/` means the root.
pub fn normalize_rel_path(rel: &str) -> Result<PathBuf> {
    let mut out: Vec<&std::ffi::OsStr> = Vec::new();
    for c in Path::new(rel.trim()).components() {
        match c {
            Component::CurDir | Component::RootDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                if out.pop().is_none() {
                    return Err(OrchestratorError::AccessDenied(format!(
                        "{rel} is outside the instance directory"
                    )));
                }
            }
            Component::Prefix(_) => {
                return Err(OrchestratorError::AccessDenied(format!(
                    "{rel} is not a relative path"
                )));
            }
        }
    }
    Ok(out.into_iter().collect())
}

fn shown_path(rel: &Path) -> String {
    if rel.as_os_str().is_empty() {
        "/".to_string()
    } else {
        rel.display().to_string()
    }
}

fn io_error(op: &str, rel: &Path, err: std::io::Error) -> OrchestratorError {
    match err.kind() {
        std::io::ErrorKind::NotFound => OrchestratorError::not_found("file", shown_path(rel)),
        std::io::ErrorKind::PermissionDenied => {
            OrchestratorError::AccessDenied(format!("{op} {}: permission denied", shown_path(rel)))
        }
        _ => {
            tracing::debug!(op, path = %shown_path(rel), error = %err, "file operation failed");
            OrchestratorError::Io(format!("{op} {} failed", shown_path(rel)))
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxedFs {
    root: PathBuf,
    max_read_bytes: u64,
}

impl SandboxedFs {
    pub fn new(root: impl Into<PathBuf>, max_read_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_read_bytes,
        }
    }

    /// Joins `rel` onto the root and proves the deepest existing ancestor of
    /// the result still resolves inside the root.
    async fn resolve(&self, rel: &str) -> Result<(PathBuf, PathBuf)> {
        let rel = normalize_rel_path(rel)?;
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|e| io_error("open", Path::new(""), e))?;
        let target = root.join(&rel);

        let mut probe = target.as_path();
        loop {
            match tokio::fs::symlink_metadata(probe).await {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    probe = probe.parent().unwrap_or(&root);
                    if probe == root {
                        break;
                    }
                }
                Err(e) => return Err(io_error("resolve", &rel, e)),
            }
        }
        let canon = tokio::fs::canonicalize(probe)
            .await
            .map_err(|e| io_error("resolve", &rel, e))?;
        if !canon.starts_with(&root) {
            tracing::warn!(path = %shown_path(&rel), "path resolves outside instance directory");
            return Err(OrchestratorError::AccessDenied(format!(
                "{} is outside the instance directory",
                shown_path(&rel)
            )));
        }
        Ok((target, rel))
    }

    pub async fn list(&self, rel: &str) -> Result<Vec<FileEntry>> {
        let (dir, rel) = self.resolve(rel).await?;
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error("list", &rel, e))?;
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await.map_err(|e| io_error("list", &rel, e))? {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let ft = meta.file_type();
            let kind = if ft.is_symlink() {
                FileKind::Symlink
            } else if ft.is_dir() {
                FileKind::Dir
            } else if ft.is_file() {
                FileKind::File
            } else {
                FileKind::Other
            };
            out.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                size: if kind == FileKind::File { meta.len() } else { 0 },
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        out.sort_by(|a, b| {
            (a.kind != FileKind::Dir)
                .cmp(&(b.kind != FileKind::Dir))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(out)
    }

    pub async fn read(&self, rel: &str) -> Result<Vec<u8>> {
        let (path, rel) = self.resolve(rel).await?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error("read", &rel, e))?;
        if meta.is_dir() {
            return Err(OrchestratorError::invalid(format!(
                "{} is a directory",
                shown_path(&rel)
            )));
        }
        if meta.len() > self.max_read_bytes {
            return Err(OrchestratorError::FileTooLarge {
                size: meta.len(),
                limit: self.max_read_bytes,
            });
        }
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error("read", &rel, e))
    }

    /// Replaces the file atomically, creating parent directories as needed.
    pub async fn write(&self, rel: &str, data: &[u8]) -> Result<()> {
        let (path, rel) = self.resolve(rel).await?;
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(OrchestratorError::invalid("cannot write to the instance directory itself"));
        };
        if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            return Err(OrchestratorError::invalid(format!(
                "{} is a directory",
                shown_path(&rel)
            )));
        }
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error("write", &rel, e))?;

        let tmp = parent.join(format!(
            ".{}.{}.tmp",
            name.to_string_lossy(),
            uuid::Uuid::new_v4().simple()
        ));
        let result = async {
            let mut f = tokio::fs::File::create(&tmp).await?;
            f.write_all(data).await?;
            f.flush().await?;
            f.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error("write", &rel, e));
        }
        Ok(())
    }

    pub async fn mkdir(&self, rel: &str) -> Result<()> {
        let (path, rel) = self.resolve(rel).await?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| io_error("mkdir", &rel, e))
    }

    pub async fn delete(&self, rel: &str) -> Result<()> {
        let (path, rel) = self.resolve(rel).await?;
        if rel.as_os_str().is_empty() {
            return Err(OrchestratorError::AccessDenied(
                "the instance directory itself cannot be deleted".to_string(),
            ));
        }
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| io_error("delete", &rel, e))?;
        let r = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        r.map_err(|e| io_error("delete", &rel, e))
    }
}

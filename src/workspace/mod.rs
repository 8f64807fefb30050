//! Workspace registry: the flat index of known workspaces plus per-workspace
//! configuration with legacy-location migration.
//!
//! The registry is a single JSON array at `<dataHome>/workspaces.json`;
//! per-workspace config lives in `<artifactRoot>/factory.json`. Writes use a
//! durable temp-file rename so a crashed daemon never leaves a torn file.

pub mod config;
pub mod watcher;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{FactoryError, Result};
pub use config::WorkspaceConfig;

const REGISTRY_FILE: &str = "workspaces.json";
const CONFIG_FILE: &str = "factory.json";
/// Legacy config directories inside the workspace, oldest last.
const LEGACY_DIRS: [&str; 2] = [".taskfactory", ".pi"];

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub path: PathBuf,
    pub name: String,
    pub artifact_root: PathBuf,
}

// ─── Registry ────────────────────────────────────────────────────────────────

pub struct WorkspaceRegistry {
    data_home: PathBuf,
    /// In-memory mirror of `workspaces.json`; the file is authoritative and
    /// rewritten whole on every mutation (latest write wins).
    entries: RwLock<Vec<Workspace>>,
}

impl WorkspaceRegistry {
    /// Open (or initialise) the registry under `data_home`
    /// (`~/.taskfactory` in production).
    pub async fn open(data_home: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_home).await?;
        let path = data_home.join(REGISTRY_FILE);
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<Vec<Workspace>>(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), err = %e, "registry unparseable, starting empty");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Ok(Self {
            data_home: data_home.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    pub fn data_home(&self) -> &Path {
        &self.data_home
    }

    pub async fn list_workspaces(&self) -> Vec<Workspace> {
        self.entries.read().await.clone()
    }

    pub async fn get_workspace_by_id(&self, id: &str) -> Result<Workspace> {
        self.entries
            .read()
            .await
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| FactoryError::not_found(format!("workspace {id}")))
    }

    /// Find the workspace registered for a project path.
    pub async fn load_workspace(&self, path: &Path) -> Result<Workspace> {
        self.entries
            .read()
            .await
            .iter()
            .find(|w| w.path == path)
            .cloned()
            .ok_or_else(|| FactoryError::not_found(format!("workspace at {}", path.display())))
    }

    /// Register a workspace. The project path must be unique; the artifact
    /// root is created under the data home.
    pub async fn create_workspace(&self, path: &Path, name: Option<String>) -> Result<Workspace> {
        if !path.is_absolute() {
            return Err(FactoryError::validation(format!(
                "workspace path must be absolute: {}",
                path.display()
            )));
        }
        {
            let entries = self.entries.read().await;
            if entries.iter().any(|w| w.path == path) {
                return Err(FactoryError::validation(format!(
                    "workspace already registered for {}",
                    path.display()
                )));
            }
        }

        let id = ulid::Ulid::new().to_string().to_lowercase();
        let name = name.unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "workspace".to_string())
        });
        let artifact_root = self.data_home.join("artifacts").join(&id);
        tokio::fs::create_dir_all(&artifact_root).await?;

        let workspace = Workspace {
            id,
            path: path.to_path_buf(),
            name,
            artifact_root,
        };

        let mut entries = self.entries.write().await;
        entries.push(workspace.clone());
        self.flush(&entries).await?;
        info!(id = %workspace.id, path = %path.display(), "workspace registered");
        Ok(workspace)
    }

    /// Remove a workspace from the registry and delete its artifact root.
    /// The user's project files are never touched.
    pub async fn delete_workspace(&self, id: &str) -> Result<()> {
        let workspace = self.get_workspace_by_id(id).await?;
        {
            let mut entries = self.entries.write().await;
            entries.retain(|w| w.id != id);
            self.flush(&entries).await?;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&workspace.artifact_root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(id, err = %e, "artifact root removal failed");
            }
        }
        info!(id, "workspace deleted");
        Ok(())
    }

    async fn flush(&self, entries: &[Workspace]) -> Result<()> {
        let body = serde_json::to_string_pretty(entries)
            .map_err(|e| FactoryError::validation(format!("registry serialize: {e}")))?;
        let path = self.data_home.join(REGISTRY_FILE);
        atomic_write(&path, body.into_bytes()).await
    }

    // ─── Per-workspace config ────────────────────────────────────────────────

    /// Read `<artifactRoot>/factory.json`, migrating from a legacy
    /// workspace-local location on first read. Missing or unparseable config
    /// yields the defaults.
    pub async fn read_config(&self, workspace: &Workspace) -> WorkspaceConfig {
        let path = workspace.artifact_root.join(CONFIG_FILE);
        if !path.exists() {
            self.migrate_legacy_config(workspace).await;
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "factory.json unparseable, using defaults");
                    WorkspaceConfig::default()
                }
            },
            Err(_) => WorkspaceConfig::default(),
        }
    }

    pub async fn update_workspace_config(
        &self,
        workspace: &Workspace,
        config: &WorkspaceConfig,
    ) -> Result<()> {
        let body = serde_json::to_string_pretty(config)
            .map_err(|e| FactoryError::validation(format!("config serialize: {e}")))?;
        tokio::fs::create_dir_all(&workspace.artifact_root).await?;
        atomic_write(&workspace.artifact_root.join(CONFIG_FILE), body.into_bytes()).await
    }

    /// Move config (and sibling state files) from `.taskfactory/` or `.pi/`
    /// inside the workspace into the artifact root.
    async fn migrate_legacy_config(&self, workspace: &Workspace) {
        for legacy in LEGACY_DIRS {
            let dir = workspace.path.join(legacy);
            let legacy_config = dir.join(CONFIG_FILE);
            if !legacy_config.exists() {
                continue;
            }
            info!(
                id = %workspace.id,
                from = %dir.display(),
                to = %workspace.artifact_root.display(),
                "migrating legacy workspace state"
            );
            if let Err(e) = copy_tree(&dir, &workspace.artifact_root).await {
                warn!(id = %workspace.id, err = %e, "legacy migration failed");
            }
            return;
        }
    }
}

/// Recursively copy `src` into `dst` without overwriting existing files.
async fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                stack.push((entry.path(), target));
            } else if !target.exists() {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}

async fn atomic_write(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, &bytes)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| FactoryError::validation(format!("registry write join error: {e}")))?
}

// ─── Tests ───────────────────────────────────────────────────────────────────

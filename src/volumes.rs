// src/volumes.rs
//
// =============================================================================
// SANDCELL: VOLUME MANAGER (v 0.4)
// =============================================================================
//
// Named data volumes shared between jobs.
//
// Two kinds:
// 1. Filesystem: a plain directory at `<volumes_root>/<name>/data/`.
// 2. Memory: the same path with a size-bounded tmpfs mounted over it.
//
// Volumes are created eagerly by an admin operation and bind-mounted into
// job workspaces at `volumes/<name>`. The store refuses removal while any
// job holds a reference.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::core::parse_size;
use crate::error::EngineError;
use crate::platform::{run_checked, Platform};
use crate::store::VolumeStore;

// ============================================================================
// 1. RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Filesystem,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub kind: VolumeKind,
    pub size_bytes: u64,
    pub host_path: PathBuf,
    /// Jobs currently holding a mount reference.
    pub refs: HashSet<Uuid>,
}

/// One bind mount the init process performs before entering the workspace
/// root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub source: PathBuf,
    /// Relative to the workspace root.
    pub target_rel: String,
}

// ============================================================================
// 2. THE MANAGER
// ============================================================================

pub struct VolumeManager {
    config: Arc<DaemonConfig>,
    platform: Arc<dyn Platform>,
}

impl VolumeManager {
    pub fn new(config: Arc<DaemonConfig>, platform: Arc<dyn Platform>) -> Self {
        Self { config, platform }
    }

    /// Admin create. `size_spec` bounds tmpfs volumes and is advisory for
    /// filesystem ones.
    pub async fn create(
        &self,
        store: &VolumeStore,
        name: &str,
        kind: VolumeKind,
        size_spec: &str,
    ) -> Result<Volume, EngineError> {
        validate_name(name)?;
        let size_bytes = parse_size(size_spec)?;
        let host_path = self.config.volume_data_dir(name);

        tokio::fs::create_dir_all(&host_path)
            .await
            .map_err(|e| EngineError::Internal(format!("volume dir {:?}: {}", host_path, e)))?;

        if kind == VolumeKind::Memory {
            let opt = format!("size={}", size_bytes);
            let path_str = host_path.to_string_lossy().to_string();
            run_checked(
                self.platform.as_ref(),
                "mount",
                &["-t", "tmpfs", "-o", &opt, "tmpfs", &path_str],
            )
            .await
            .map_err(|e| EngineError::Internal(format!("tmpfs mount for '{}': {}", name, e)))?;
        }

        let volume = Volume {
            name: name.to_string(),
            kind,
            size_bytes,
            host_path,
            refs: HashSet::new(),
        };
        store.insert(volume.clone())?;
        log::info!("volume '{}' ready ({:?}, {} bytes)", name, kind, size_bytes);
        Ok(volume)
    }

    /// Admin remove. Fails while referenced; unmounts tmpfs kinds.
    pub async fn remove(&self, store: &VolumeStore, name: &str) -> Result<(), EngineError> {
        let volume = store.remove(name)?;

        if volume.kind == VolumeKind::Memory {
            let path_str = volume.host_path.to_string_lossy().to_string();
            if let Err(e) = run_checked(self.platform.as_ref(), "umount", &[&path_str]).await {
                log::warn!("tmpfs umount for '{}' failed: {}", name, e);
            }
        }

        // Remove `<volumes_root>/<name>` wholesale.
        if let Some(parent) = volume.host_path.parent() {
            if let Err(e) = tokio::fs::remove_dir_all(parent).await {
                log::warn!("volume dir removal for '{}' failed: {}", name, e);
            }
        }
        log::info!("volume '{}' removed", name);
        Ok(())
    }

    /// Resolves the job's volume refs into bind-mount instructions,
    /// incrementing references all-or-nothing.
    pub fn resolve_mounts(
        &self,
        store: &VolumeStore,
        job: Uuid,
        names: &[String],
    ) -> Result<Vec<VolumeMount>, EngineError> {
        let volumes = store.ref_all(job, names)?;
        Ok(volumes
            .into_iter()
            .map(|v| VolumeMount {
                target_rel: format!("volumes/{}", v.name),
                source: v.host_path,
                name: v.name,
            })
            .collect())
    }
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !ok {
        return Err(EngineError::Validation(format!(
            "volume name '{}' must be 1-64 chars of [a-zA-Z0-9_-]",
            name
        )));
    }
    Ok(())
}

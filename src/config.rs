// src/config.rs
//
// =============================================================================
// SANDCELL: DAEMON CONFIGURATION (v 0.4)
// =============================================================================
//
// Every filesystem convention and tunable in one place, so the whole engine
// relocates under a temp directory for tests and under the systemd slice in
// production.
//
// Loaded from YAML (`sandcell.yaml`) when present; defaults otherwise.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::GpuStrategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Cgroup v2 subtree the engine owns. Per-job dirs are created directly
    /// under this path.
    pub cgroup_root: PathBuf,

    /// Parent of per-job workspaces (`<workspace_root>/<job-id8>/`).
    pub workspace_root: PathBuf,

    /// Named volumes live at `<volumes_root>/<name>/data/`.
    pub volumes_root: PathBuf,

    /// Runtime images live at `<runtimes_root>/<name>/`.
    pub runtimes_root: PathBuf,

    /// Seconds between SIGTERM and SIGKILL when stopping a job.
    pub termination_grace_secs: u64,

    /// Retained chunks per job log ring.
    pub log_ring_capacity: usize,

    /// Bytes read per chunk from the child's stdout/stderr pipes.
    pub log_chunk_bytes: usize,

    /// `MAJ:MIN` of the device `io.max` limits apply to. When absent, io
    /// limits are accepted but not enforced.
    pub io_device: Option<String>,

    /// Device selection strategy for GPU reservations.
    pub gpu_strategy: GpuStrategy,

    /// Disable GPU discovery entirely (machines without the nvidia stack).
    pub disable_gpus: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup/sandcell.slice/sandcell.service"),
            workspace_root: PathBuf::from("/var/lib/sandcell/work"),
            volumes_root: PathBuf::from("/var/lib/sandcell/volumes"),
            runtimes_root: PathBuf::from("/var/lib/sandcell/runtimes"),
            termination_grace_secs: 5,
            log_ring_capacity: 1024,
            log_chunk_bytes: 8192,
            io_device: None,
            gpu_strategy: GpuStrategy::FirstFit,
            disable_gpus: false,
        }
    }
}

impl DaemonConfig {
    /// Loads YAML config; a missing file silently falls back to defaults so
    /// `sandcell start` works on a bare machine.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("no config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_yaml::from_str(&raw)?;
        log::info!("loaded config from {:?}", path);
        Ok(cfg)
    }

    pub fn workspace_dir(&self, short_id: &str) -> PathBuf {
        self.workspace_root.join(short_id)
    }

    pub fn volume_data_dir(&self, name: &str) -> PathBuf {
        self.volumes_root.join(name).join("data")
    }

    pub fn runtime_dir(&self, name: &str) -> PathBuf {
        self.runtimes_root.join(name)
    }
}

// src/cgroup.rs
//
// =============================================================================
// SANDCELL: CGROUP v2 MANAGER (v 0.4)
// =============================================================================
//
// Per-job resource subtree: `<root>/job-<id8>/` with a `proc/` leaf.
//
// The leaf exists because of the v2 "no internal processes" rule: limits
// live on the job directory, the child pid sits in `proc/`, and the job
// directory keeps its controller files writable.
//
// The root is config-supplied, so every operation here works against a
// plain temp directory in tests.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::core::{parse_core_spec, ResourceLimits};
use crate::error::{EngineError, SetupStep};

/// cpu.max period in microseconds; quota scales off this.
const CPU_PERIOD_USEC: u64 = 100_000;

pub struct CgroupManager {
    root: PathBuf,
    io_device: Option<String>,
}

/// Live readback for metrics and get-status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CgroupUsage {
    pub cpu_usage_usec: u64,
    pub memory_current_bytes: u64,
    pub pids_current: u64,
}

impl CgroupManager {
    pub fn new(root: PathBuf, io_device: Option<String>) -> Self {
        Self { root, io_device }
    }

    pub fn job_path(&self, short_id: &str) -> PathBuf {
        self.root.join(format!("job-{}", short_id))
    }

    fn leaf(path: &Path) -> PathBuf {
        path.join("proc")
    }

    // ------------------------------------------------------------------
    // CREATE
    // ------------------------------------------------------------------

    /// Creates `<root>/job-<id8>/proc/` and writes the limit files.
    /// Returns the job cgroup path.
    pub async fn create(
        &self,
        short_id: &str,
        limits: &ResourceLimits,
    ) -> Result<PathBuf, EngineError> {
        let path = self.job_path(short_id);
        fs::create_dir_all(Self::leaf(&path))
            .await
            .map_err(|e| EngineError::setup(SetupStep::Cgroup, e))?;

        // Delegate controllers downward. Kernels without some controller
        // reject the whole write, so this is best-effort per root; the
        // limit writes below are the authoritative failures.
        for dir in [&self.root, &path] {
            let ctl = dir.join("cgroup.subtree_control");
            if ctl.exists() {
                if let Err(e) = fs::write(&ctl, "+cpu +memory +io +pids +cpuset").await {
                    log::debug!("subtree_control at {:?} not writable: {}", dir, e);
                }
            }
        }

        self.write_limits(&path, limits).await?;
        log::info!("cgroup ready at {:?}", path);
        Ok(path)
    }

    async fn write_limits(&self, path: &Path, limits: &ResourceLimits) -> Result<(), EngineError> {
        // cpu.max: "<quota> <period>" or "max <period>".
        let cpu_value = if limits.cpu_percent == 0 {
            format!("max {}", CPU_PERIOD_USEC)
        } else {
            let quota = (limits.cpu_percent as u64) * CPU_PERIOD_USEC / 100;
            format!("{} {}", quota, CPU_PERIOD_USEC)
        };
        Self::write_ctrl(path, "cpu.max", &cpu_value).await?;

        // memory.max: bytes, or the literal "max".
        let mem_value = if limits.memory_bytes == 0 {
            "max".to_string()
        } else {
            limits.memory_bytes.to_string()
        };
        Self::write_ctrl(path, "memory.max", &mem_value).await?;

        // io.max: needs a target device; silently skipped when the daemon
        // has none configured (documented behavior).
        if limits.io_bps > 0 {
            match &self.io_device {
                Some(dev) => {
                    let v = format!("{} rbps={} wbps={}", dev, limits.io_bps, limits.io_bps);
                    Self::write_ctrl(path, "io.max", &v).await?;
                }
                None => log::warn!(
                    "io limit {} B/s requested but no io_device configured; not enforced",
                    limits.io_bps
                ),
            }
        }

        // cpuset.cpus: normalized list from the validated spec.
        if let Some(spec) = &limits.cpu_cores {
            let cores = parse_core_spec(spec)?;
            let list = cores
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",");
            Self::write_ctrl(path, "cpuset.cpus", &list).await?;
        }

        Ok(())
    }

    async fn write_ctrl(path: &Path, file: &str, value: &str) -> Result<(), EngineError> {
        let target = path.join(file);
        fs::write(&target, value).await.map_err(|e| {
            EngineError::setup(SetupStep::Cgroup, format!("{} <- '{}': {}", file, value, e))
        })
    }

    // ------------------------------------------------------------------
    // ATTACH & READBACK
    // ------------------------------------------------------------------

    /// Moves a pid into the `proc/` leaf. This is the parent-side half of
    /// the ready-pipe handshake: the child stays blocked until after this.
    pub async fn attach(&self, path: &Path, pid: i32) -> Result<(), EngineError> {
        let procs = Self::leaf(path).join("cgroup.procs");
        fs::write(&procs, pid.to_string())
            .await
            .map_err(|e| EngineError::setup(SetupStep::CgroupAttach, e))
    }

    pub async fn usage(&self, path: &Path) -> Option<CgroupUsage> {
        let cpu_stat = fs::read_to_string(path.join("cpu.stat")).await.ok()?;
        let cpu_usage_usec = cpu_stat
            .lines()
            .find_map(|l| l.strip_prefix("usage_usec "))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        let memory_current_bytes = fs::read_to_string(path.join("memory.current"))
            .await
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        let pids_current = fs::read_to_string(Self::leaf(path).join("pids.current"))
            .await
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        Some(CgroupUsage {
            cpu_usage_usec,
            memory_current_bytes,
            pids_current,
        })
    }

    // ------------------------------------------------------------------
    // DESTROY
    // ------------------------------------------------------------------

    /// Kills stragglers and removes the subtree leaf-first. Idempotent: a
    /// missing directory is success.
    pub async fn destroy(&self, path: &Path) -> Result<(), EngineError> {
        if !path.exists() {
            return Ok(());
        }

        for dir in [Self::leaf(path), path.to_path_buf()] {
            let procs_file = dir.join("cgroup.procs");
            if let Ok(raw) = fs::read_to_string(&procs_file).await {
                for pid in raw.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
                    log::warn!("killing straggler pid {} in {:?}", pid, dir);
                    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                }
            }
        }

        // Give the kernel a beat to reap before rmdir.
        for attempt in 0..10 {
            let gone = Self::rmdir(&Self::leaf(path)).await && Self::rmdir(path).await;
            if gone {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(20 * (attempt + 1))).await;
        }

        Err(EngineError::Internal(format!(
            "cgroup {:?} not removable (busy)",
            path
        )))
    }

    /// rmdir that treats "already gone" as success. On a kernel cgroupfs
    /// the control files vanish with the directory; when the root is a
    /// plain directory (relocated engine) they are real files and must go
    /// first.
    async fn rmdir(dir: &Path) -> bool {
        match fs::remove_dir(dir).await {
            Ok(()) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(_) => {}
        }
        if let Ok(mut entries) = fs::read_dir(dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                    let _ = fs::remove_file(entry.path()).await;
                }
            }
        }
        match fs::remove_dir(dir).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(_) => false,
        }
    }
}

// ============================================================================
// CHILD-SIDE VERIFICATION (pure parser; the read happens in init mode)
// ============================================================================

/// Extracts the v2 group from `/proc/self/cgroup` content ("0::/path").
pub fn parse_self_cgroup(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|l| l.strip_prefix("0::"))
        .map(|s| s.trim().to_string())
}

/// The check the child performs before any user-observable action: it must
/// have been moved out of the root group and into its own job group.
pub fn verify_assignment(contents: &str, short_id: &str) -> Result<(), EngineError> {
    match parse_self_cgroup(contents) {
        None => Err(EngineError::Internal(
            "no cgroup v2 entry in /proc/self/cgroup".into(),
        )),
        Some(group) if group == "/" => Err(EngineError::Internal(
            "child still in root cgroup (0::/), parent attach did not land".into(),
        )),
        Some(group) if !group.contains(short_id) => Err(EngineError::Internal(format!(
            "child in foreign cgroup '{}'",
            group
        ))),
        Some(_) => Ok(()),
    }
}

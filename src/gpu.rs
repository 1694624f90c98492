// src/gpu.rs
//
// =============================================================================
// SANDCELL: GPU MANAGER (v 0.4)
// =============================================================================
//
// Device inventory and reservation.
//
// Responsibilities:
// 1. Discover devices at daemon start (/proc/driver/nvidia presence gate,
//    nvidia-smi for index/uuid/memory).
// 2. Reserve N devices per job under one of four strategies.
// 3. Release with a per-device reset side effect (logged, never fatal).
// 4. Emit the isolation env (CUDA_VISIBLE_DEVICES) for the child.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::GpuStrategy;
use crate::error::EngineError;
use crate::platform::Platform;
use crate::store::GpuStore;

// ============================================================================
// 1. DEVICE RECORD
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    pub index: u32,
    pub uuid: String,
    pub memory_mb: u64,
    /// Owning job while reserved. Mutated only under the GPU store lock.
    pub owner: Option<Uuid>,
}

/// Result of a strategy pick. `degraded` marks a best-fit allocation where
/// no device met the memory floor and the largest available was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuPick {
    pub indices: Vec<u32>,
    pub degraded: bool,
}

// ============================================================================
// 2. STRATEGY SELECTION (pure)
// ============================================================================

/// Chooses `want` devices out of the free list, or fails with Quota.
/// `free` contains only unowned devices; ordering is discovery order.
pub fn select_devices(
    free: &[GpuDevice],
    want: u32,
    want_mem_mb: u64,
    strategy: GpuStrategy,
) -> Result<GpuPick, EngineError> {
    let want = want as usize;
    if want == 0 {
        return Ok(GpuPick {
            indices: vec![],
            degraded: false,
        });
    }
    if free.len() < want {
        return Err(EngineError::Quota(format!(
            "insufficient GPUs: want {}, {} free",
            want,
            free.len()
        )));
    }

    match strategy {
        GpuStrategy::FirstFit => {
            let picked: Vec<u32> = free
                .iter()
                .filter(|d| d.memory_mb >= want_mem_mb)
                .take(want)
                .map(|d| d.index)
                .collect();
            if picked.len() < want {
                return Err(quota_mem(want, want_mem_mb, free));
            }
            Ok(GpuPick {
                indices: picked,
                degraded: false,
            })
        }

        GpuStrategy::Pack => {
            let mut fit: Vec<&GpuDevice> =
                free.iter().filter(|d| d.memory_mb >= want_mem_mb).collect();
            if fit.len() < want {
                return Err(quota_mem(want, want_mem_mb, free));
            }
            fit.sort_by_key(|d| d.index);
            Ok(GpuPick {
                indices: fit[..want].iter().map(|d| d.index).collect(),
                degraded: false,
            })
        }

        GpuStrategy::Spread => {
            let mut fit: Vec<&GpuDevice> =
                free.iter().filter(|d| d.memory_mb >= want_mem_mb).collect();
            if fit.len() < want {
                return Err(quota_mem(want, want_mem_mb, free));
            }
            // Descending; stride across the list when it is wide enough to
            // actually spread, plain prefix otherwise.
            fit.sort_by(|a, b| b.index.cmp(&a.index));
            let indices = if fit.len() >= 2 * want {
                let stride = fit.len() / want;
                (0..want).map(|i| fit[i * stride].index).collect()
            } else {
                fit[..want].iter().map(|d| d.index).collect()
            };
            Ok(GpuPick {
                indices,
                degraded: false,
            })
        }

        GpuStrategy::BestFit => {
            // Qualifying devices first, tightest fit first; failing devices
            // after, biggest first so a degraded pick takes the largest.
            let mut ordered: Vec<&GpuDevice> = free.iter().collect();
            ordered.sort_by(|a, b| {
                let a_fits = a.memory_mb >= want_mem_mb;
                let b_fits = b.memory_mb >= want_mem_mb;
                match (a_fits, b_fits) {
                    (true, true) => (a.memory_mb - want_mem_mb).cmp(&(b.memory_mb - want_mem_mb)),
                    (true, false) => std::cmp::Ordering::Less,
                    (false, true) => std::cmp::Ordering::Greater,
                    (false, false) => b.memory_mb.cmp(&a.memory_mb),
                }
            });
            let picked: Vec<&GpuDevice> = ordered[..want].to_vec();
            let degraded = picked.iter().any(|d| d.memory_mb < want_mem_mb);
            Ok(GpuPick {
                indices: picked.iter().map(|d| d.index).collect(),
                degraded,
            })
        }
    }
}

fn quota_mem(want: usize, want_mem_mb: u64, free: &[GpuDevice]) -> EngineError {
    EngineError::Quota(format!(
        "insufficient GPUs: want {} with >= {} MB, {} free total",
        want,
        want_mem_mb,
        free.len()
    ))
}

// ============================================================================
// 3. THE MANAGER
// ============================================================================

pub struct GpuManager {
    platform: Arc<dyn Platform>,
    strategy: GpuStrategy,
}

impl GpuManager {
    pub fn new(platform: Arc<dyn Platform>, strategy: GpuStrategy) -> Self {
        Self { platform, strategy }
    }

    /// Discovers the device inventory. `proc_root` is the path that stands
    /// for `/proc` (overridable so discovery is testable).
    pub async fn discover(&self, proc_root: &Path) -> Vec<GpuDevice> {
        let nvidia_dir = proc_root.join("driver/nvidia/gpus");
        if !nvidia_dir.exists() {
            log::info!("no nvidia driver present, GPU support disabled");
            return Vec::new();
        }

        match self.query_smi().await {
            Ok(devices) if !devices.is_empty() => {
                log::info!("discovered {} GPU(s) via nvidia-smi", devices.len());
                devices
            }
            Ok(_) | Err(_) => {
                // Driver dir exists but smi is unusable: register what the
                // kernel shows, with unknown memory.
                let count = std::fs::read_dir(&nvidia_dir)
                    .map(|d| d.count())
                    .unwrap_or(0);
                log::warn!(
                    "nvidia-smi unavailable, registering {} device(s) from {:?} with unknown memory",
                    count,
                    nvidia_dir
                );
                (0..count as u32)
                    .map(|index| GpuDevice {
                        index,
                        uuid: format!("GPU-unknown-{}", index),
                        memory_mb: 0,
                        owner: None,
                    })
                    .collect()
            }
        }
    }

    async fn query_smi(&self) -> anyhow::Result<Vec<GpuDevice>> {
        let out = crate::platform::run_checked(
            self.platform.as_ref(),
            "nvidia-smi",
            &[
                "--query-gpu=index,uuid,memory.total",
                "--format=csv,noheader,nounits",
            ],
        )
        .await?;

        let mut devices = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let parts: Vec<&str> = line.split(',').map(|p| p.trim()).collect();
            if parts.len() != 3 {
                log::warn!("unparseable nvidia-smi line: '{}'", line);
                continue;
            }
            devices.push(GpuDevice {
                index: parts[0].parse()?,
                uuid: parts[1].to_string(),
                memory_mb: parts[2].parse()?,
                owner: None,
            });
        }
        Ok(devices)
    }

    /// Reserves devices for a job under the store lock. Total-ordered: a
    /// device is observed free before it is re-reserved.
    pub fn reserve(
        &self,
        store: &GpuStore,
        job: Uuid,
        count: u32,
        mem_mb: u64,
    ) -> Result<GpuPick, EngineError> {
        let strategy = self.strategy;
        let mut degraded = false;
        let indices = store.reserve_with(job, |free| {
            let pick = select_devices(free, count, mem_mb, strategy)?;
            degraded = pick.degraded;
            Ok(pick.indices)
        })?;
        if degraded {
            log::warn!(
                "degraded GPU allocation for job {}: no device meets {} MB",
                job,
                mem_mb
            );
        }
        Ok(GpuPick { indices, degraded })
    }

    /// Frees the job's devices and fires the device-memory reset for each.
    /// Reset failures are logged, never propagated.
    pub async fn release(&self, store: &GpuStore, job: &Uuid) -> Vec<u32> {
        let freed = store.release(job);
        for idx in &freed {
            let arg = idx.to_string();
            if let Err(e) = crate::platform::run_checked(
                self.platform.as_ref(),
                "nvidia-smi",
                &["--gpu-reset", "-i", &arg],
            )
            .await
            {
                log::warn!("GPU {} reset failed: {}", idx, e);
            }
        }
        freed
    }

    /// Isolation env for the child, in the CUDA convention. An empty
    /// reservation explicitly hides every device.
    pub fn visibility_env(indices: &[u32]) -> Vec<(String, String)> {
        let list = indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        vec![
            ("CUDA_VISIBLE_DEVICES".to_string(), list.clone()),
            ("NVIDIA_VISIBLE_DEVICES".to_string(), list),
        ]
    }
}

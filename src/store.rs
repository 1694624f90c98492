// src/store.rs
//
// =============================================================================
// SANDCELL: IN-MEMORY REGISTRIES (v 0.4)
// =============================================================================
//
// The bookkeeping layer: jobs, networks, GPUs, volumes, and the allocation
// indices that tie them to jobs.
//
// Locking rules (engine-wide):
// 1. One RwLock per store. Critical sections only mutate maps; no kernel
//    call, no await, ever happens under a store lock.
// 2. Never hold two store locks at once. Two-store updates release,
//    reacquire, and re-check.
// 3. The per-network IP pool lock nests under the network store in a fixed
//    store -> pool order.
//
// Allocation records carry the owning job id only, never a back-pointer to
// the Job, so cleanup ordering stays purely data-driven.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::core::{Job, JobStatus};
use crate::error::EngineError;
use crate::gpu::GpuDevice;
use crate::network::ippool::{CidrV4, IpPool};
use crate::volumes::Volume;

// ============================================================================
// 1. JOB STORE
// ============================================================================

#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> Result<(), EngineError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(EngineError::AlreadyExists(format!("job {}", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs.read().unwrap().get(id).cloned()
    }

    /// Applies a mutation under the write lock and returns the updated copy.
    pub fn update<F>(&self, id: &Uuid, f: F) -> Result<Job, EngineError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("job {}", id)))?;
        f(job);
        Ok(job.clone())
    }

    pub fn list(&self) -> Vec<Job> {
        let mut all: Vec<Job> = self.jobs.read().unwrap().values().cloned().collect();
        all.sort_by_key(|j| j.created_at);
        all
    }

    /// Jobs not yet in a terminal state.
    pub fn list_live(&self) -> Vec<Job> {
        self.list()
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .collect()
    }

    /// Running jobs attached to the given bridge network, for hosts-file
    /// generation.
    pub fn running_on_network(&self, network: &str) -> Vec<Job> {
        self.jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Running | JobStatus::UploadingFiles)
                    && matches!(&j.spec.network,
                        crate::core::NetworkSelection::Bridged(n) if n == network)
            })
            .cloned()
            .collect()
    }
}

// ============================================================================
// 2. NETWORK STORE
// ============================================================================

/// A registered bridge network. The pool mutex nests under the store lock;
/// callers clone the Arc out of the map and release the store lock before
/// locking the pool.
pub struct NetworkRecord {
    pub name: String,
    pub bridge: String,
    pub pool: Mutex<IpPool>,
    /// Optional shaping applied to every job veth on this network.
    pub bandwidth: Option<crate::network::shaping::BandwidthLimits>,
}

impl NetworkRecord {
    pub fn cidr(&self) -> CidrV4 {
        self.pool.lock().unwrap().cidr()
    }
}

/// Per-job attachment: the network allocation record.
#[derive(Debug, Clone)]
pub struct NetworkAttachment {
    pub job_id: Uuid,
    pub network: String,
    pub ip: Ipv4Addr,
    pub prefix: u8,
    pub gateway: Ipv4Addr,
    pub veth_host: String,
    pub veth_peer: String,
    pub hostname: String,
    /// Isolated attachments have no bridge or pool behind them.
    pub isolated: bool,
}

#[derive(Default)]
pub struct NetworkStore {
    records: RwLock<HashMap<String, Arc<NetworkRecord>>>,
    attachments: RwLock<HashMap<Uuid, NetworkAttachment>>,
}

impl NetworkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: NetworkRecord) -> Result<Arc<NetworkRecord>, EngineError> {
        let mut records = self.records.write().unwrap();
        if records.contains_key(&record.name) {
            return Err(EngineError::AlreadyExists(format!(
                "network '{}'",
                record.name
            )));
        }
        let arc = Arc::new(record);
        records.insert(arc.name.clone(), arc.clone());
        Ok(arc)
    }

    pub fn get(&self, name: &str) -> Result<Arc<NetworkRecord>, EngineError> {
        self.records
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("network '{}'", name)))
    }

    /// Removal requires zero live attachments on the network.
    pub fn remove(&self, name: &str) -> Result<Arc<NetworkRecord>, EngineError> {
        let in_use = {
            let atts = self.attachments.read().unwrap();
            atts.values().any(|a| a.network == name)
        };
        if in_use {
            return Err(EngineError::Validation(format!(
                "network '{}' has attached jobs",
                name
            )));
        }
        self.records
            .write()
            .unwrap()
            .remove(name)
            .ok_or_else(|| EngineError::NotFound(format!("network '{}'", name)))
    }

    pub fn cidrs(&self) -> Vec<CidrV4> {
        self.records
            .read()
            .unwrap()
            .values()
            .map(|r| r.cidr())
            .collect()
    }

    pub fn list(&self) -> Vec<(String, CidrV4, String)> {
        self.records
            .read()
            .unwrap()
            .values()
            .map(|r| (r.name.clone(), r.cidr(), r.bridge.clone()))
            .collect()
    }

    pub fn attach(&self, att: NetworkAttachment) {
        self.attachments.write().unwrap().insert(att.job_id, att);
    }

    /// Take-once: the second detach for a job returns None.
    pub fn detach(&self, job_id: &Uuid) -> Option<NetworkAttachment> {
        self.attachments.write().unwrap().remove(job_id)
    }

    pub fn attachment(&self, job_id: &Uuid) -> Option<NetworkAttachment> {
        self.attachments.read().unwrap().get(job_id).cloned()
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.read().unwrap().len()
    }
}

// ============================================================================
// 3. GPU STORE
// ============================================================================

#[derive(Default)]
pub struct GpuStore {
    devices: RwLock<Vec<GpuDevice>>,
}

impl GpuStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the discovered inventory. Called once at daemon start.
    pub fn register(&self, devices: Vec<GpuDevice>) {
        let mut slot = self.devices.write().unwrap();
        *slot = devices;
    }

    pub fn snapshot(&self) -> Vec<GpuDevice> {
        self.devices.read().unwrap().clone()
    }

    pub fn free_count(&self) -> usize {
        self.devices
            .read()
            .unwrap()
            .iter()
            .filter(|d| d.owner.is_none())
            .count()
    }

    /// Marks the chosen indices as owned by `job`, total-ordered by this
    /// store's lock. The selection closure sees only free devices and must
    /// return a subset of them.
    pub fn reserve_with<F>(&self, job: Uuid, select: F) -> Result<Vec<u32>, EngineError>
    where
        F: FnOnce(&[GpuDevice]) -> Result<Vec<u32>, EngineError>,
    {
        let mut devices = self.devices.write().unwrap();
        let free: Vec<GpuDevice> = devices.iter().filter(|d| d.owner.is_none()).cloned().collect();
        let picked = select(&free)?;
        for idx in &picked {
            let dev = devices
                .iter_mut()
                .find(|d| d.index == *idx)
                .ok_or_else(|| EngineError::Internal(format!("unknown GPU index {}", idx)))?;
            if dev.owner.is_some() {
                return Err(EngineError::Internal(format!(
                    "GPU {} selected while owned",
                    idx
                )));
            }
            dev.owner = Some(job);
        }
        Ok(picked)
    }

    /// Frees every device owned by `job` and returns the indices. Second
    /// call for the same job returns empty (no-double-release).
    pub fn release(&self, job: &Uuid) -> Vec<u32> {
        let mut devices = self.devices.write().unwrap();
        let mut freed = Vec::new();
        for dev in devices.iter_mut() {
            if dev.owner == Some(*job) {
                dev.owner = None;
                freed.push(dev.index);
            }
        }
        freed
    }

    pub fn owned_by(&self, job: &Uuid) -> Vec<u32> {
        self.devices
            .read()
            .unwrap()
            .iter()
            .filter(|d| d.owner == Some(*job))
            .map(|d| d.index)
            .collect()
    }
}

// ============================================================================
// 4. VOLUME STORE
// ============================================================================

#[derive(Default)]
pub struct VolumeStore {
    volumes: RwLock<HashMap<String, Volume>>,
}

impl VolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, volume: Volume) -> Result<(), EngineError> {
        let mut vols = self.volumes.write().unwrap();
        if vols.contains_key(&volume.name) {
            return Err(EngineError::AlreadyExists(format!(
                "volume '{}'",
                volume.name
            )));
        }
        vols.insert(volume.name.clone(), volume);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Volume, EngineError> {
        self.volumes
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("volume '{}'", name)))
    }

    /// Removal refuses while any job still references the volume.
    pub fn remove(&self, name: &str) -> Result<Volume, EngineError> {
        let mut vols = self.volumes.write().unwrap();
        let refs = match vols.get(name) {
            None => return Err(EngineError::NotFound(format!("volume '{}'", name))),
            Some(v) => v.refs.len(),
        };
        if refs > 0 {
            return Err(EngineError::Validation(format!(
                "volume '{}' referenced by {} job(s)",
                name, refs
            )));
        }
        Ok(vols.remove(name).expect("checked above"))
    }

    /// Increments the reference of every named volume for `job`, all-or-
    /// nothing: an unknown name rolls the batch back.
    pub fn ref_all(&self, job: Uuid, names: &[String]) -> Result<Vec<Volume>, EngineError> {
        let mut vols = self.volumes.write().unwrap();
        for name in names {
            if !vols.contains_key(name) {
                return Err(EngineError::NotFound(format!("volume '{}'", name)));
            }
        }
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let v = vols.get_mut(name).expect("checked above");
            v.refs.insert(job);
            out.push(v.clone());
        }
        Ok(out)
    }

    /// Drops `job`'s reference from every volume. Idempotent per job.
    pub fn unref_all(&self, job: &Uuid) {
        let mut vols = self.volumes.write().unwrap();
        for v in vols.values_mut() {
            v.refs.remove(job);
        }
    }

    pub fn list(&self) -> Vec<Volume> {
        let mut all: Vec<Volume> = self.volumes.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn refcount(&self, name: &str) -> usize {
        self.volumes
            .read()
            .unwrap()
            .get(name)
            .map(|v| v.refs.len())
            .unwrap_or(0)
    }
}

// ============================================================================
// 5. THE BUNDLE
// ============================================================================

/// Every registry the daemon owns. Initialized at boot, shared by Arc,
/// dropped at shutdown after the executor drains. Tests build a fresh one
/// per case.
pub struct Stores {
    pub jobs: JobStore,
    pub networks: NetworkStore,
    pub gpus: GpuStore,
    pub volumes: VolumeStore,
}

impl Stores {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: JobStore::new(),
            networks: NetworkStore::new(),
            gpus: GpuStore::new(),
            volumes: VolumeStore::new(),
        })
    }
}

// src/daemon.rs
//
// =============================================================================
// SANDCELL: DAEMON SHELL (v 0.4)
// =============================================================================
//
// The wiring center: boots stores + managers + scheduler + executor and
// exposes the operations the RPC collaborator calls.
//
// Operations:
// 1. submit        -> {job_id, initial_state}
// 2. cancel / stop -> Cancelled via the normal termination path
// 3. list / get_status / stream_logs
// 4. Admin: network and volume create/remove/list
//
// Shutdown order is fixed: scheduler stop -> executor drain -> stores drop.

use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::core::{Job, JobSpec, JobStatus, JobView, NetworkSelection, SubmitReceipt};
use crate::error::EngineError;
use crate::executor::Executor;
use crate::logs::LogSubscriber;
use crate::network::ippool::CidrV4;
use crate::network::shaping::BandwidthLimits;
use crate::platform::Platform;
use crate::scheduler::Scheduler;
use crate::store::Stores;
use crate::volumes::{Volume, VolumeKind};

pub struct Daemon {
    pub config: Arc<DaemonConfig>,
    pub stores: Arc<Stores>,
    pub executor: Arc<Executor>,
    pub scheduler: Arc<Scheduler>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    // ========================================================================
    // 1. BOOT
    // ========================================================================

    pub async fn boot(
        config: DaemonConfig,
        platform: Arc<dyn Platform>,
    ) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);

        for dir in [
            &config.workspace_root,
            &config.volumes_root,
            &config.runtimes_root,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }

        // Topology banner: where we are and what we have.
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".into());
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        log::info!(
            "booting on {}: {} cores, {} MB memory",
            host,
            num_cpus::get(),
            sys.total_memory() / 1024 / 1024
        );

        let stores = Stores::new();
        let executor = Executor::new(config.clone(), stores.clone(), platform);

        // GPU inventory is registered once; ownership changes under the
        // store lock afterwards.
        if !config.disable_gpus {
            let devices = executor.gpus.discover(Path::new("/proc")).await;
            stores.gpus.register(devices);
        }

        let scheduler = Arc::new(Scheduler::new());
        let daemon = Arc::new(Self {
            config,
            stores,
            executor,
            scheduler: scheduler.clone(),
            scheduler_task: Mutex::new(None),
        });

        // The single timer task: a fired entry re-enters the lifecycle at
        // the allocation step.
        let fire_exec = daemon.executor.clone();
        let loop_sched = scheduler.clone();
        let task = tokio::spawn(async move {
            loop_sched
                .run(move |job_id| {
                    let exec = fire_exec.clone();
                    async move {
                        match exec.stores.jobs.update(&job_id, |j| {
                            if j.status == JobStatus::Scheduled {
                                j.status = JobStatus::Pending;
                            }
                        }) {
                            Ok(job) if job.status == JobStatus::Pending => {
                                log::info!("scheduled job {} firing", job.short_id());
                                exec.spawn_lifecycle(job_id);
                            }
                            Ok(job) => log::warn!(
                                "scheduled job {} fired in state {:?}, ignoring",
                                job.short_id(),
                                job.status
                            ),
                            Err(e) => log::error!("fired unknown job {}: {}", job_id, e),
                        }
                    }
                })
                .await;
        });
        *daemon.scheduler_task.lock().unwrap() = Some(task);

        log::info!("daemon ready ({} GPU(s) registered)", daemon.stores.gpus.snapshot().len());
        Ok(daemon)
    }

    // ========================================================================
    // 2. SUBMISSION
    // ========================================================================

    /// The single entry operation. Validation and quota problems return
    /// synchronously; the job record is only created past both gates.
    pub fn submit(&self, spec: JobSpec) -> Result<SubmitReceipt, EngineError> {
        spec.validate()?;
        self.check_references(&spec)?;
        self.check_quotas(&spec)?;

        let job = Job::new(spec);
        let job_id = job.id;
        let schedule = job.spec.schedule;

        match schedule {
            Some(at) if at > Utc::now() => {
                let mut job = job;
                job.status = JobStatus::Scheduled;
                self.stores.jobs.insert(job)?;
                self.scheduler.schedule(job_id, at);
                Ok(SubmitReceipt {
                    job_id,
                    initial_state: JobStatus::Scheduled,
                })
            }
            _ => {
                self.stores.jobs.insert(job)?;
                self.executor.spawn_lifecycle(job_id);
                Ok(SubmitReceipt {
                    job_id,
                    initial_state: JobStatus::Pending,
                })
            }
        }
    }

    /// Unknown network/volume/runtime names fail fast, before any record
    /// exists.
    fn check_references(&self, spec: &JobSpec) -> Result<(), EngineError> {
        if let NetworkSelection::Bridged(name) = &spec.network {
            self.stores.networks.get(name)?;
        }
        for vol in &spec.volumes {
            self.stores.volumes.get(vol)?;
        }
        if !spec.runtime.is_empty() && !self.config.runtime_dir(&spec.runtime).exists() {
            return Err(EngineError::NotFound(format!("runtime '{}'", spec.runtime)));
        }
        Ok(())
    }

    /// Synchronous exhaustion gate. Setup re-checks under the store locks;
    /// this keeps obviously doomed submissions out of Pending.
    fn check_quotas(&self, spec: &JobSpec) -> Result<(), EngineError> {
        if spec.limits.memory_bytes > 0 {
            let mut sys = sysinfo::System::new();
            sys.refresh_memory();
            let total = sys.total_memory();
            if total > 0 && spec.limits.memory_bytes > total {
                return Err(EngineError::Quota(format!(
                    "memory limit {} exceeds machine total {}",
                    spec.limits.memory_bytes, total
                )));
            }
        }

        if spec.limits.gpu_count > 0 {
            let eligible = self
                .stores
                .gpus
                .snapshot()
                .iter()
                .filter(|d| d.owner.is_none() && d.memory_mb >= spec.limits.gpu_memory_mb)
                .count();
            if eligible < spec.limits.gpu_count as usize {
                return Err(EngineError::Quota(format!(
                    "insufficient GPUs: want {} with >= {} MB, {} eligible",
                    spec.limits.gpu_count, spec.limits.gpu_memory_mb, eligible
                )));
            }
        }

        if let NetworkSelection::Bridged(name) = &spec.network {
            let record = self.stores.networks.get(name)?;
            let pool = record.pool.lock().unwrap();
            if pool.allocated_count() >= pool.cidr().capacity() {
                return Err(EngineError::Quota(format!(
                    "no available IP in network '{}' ({})",
                    name,
                    pool.cidr()
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // 3. CONTROL
    // ========================================================================

    /// Cancels a job in any non-terminal state. A Scheduled job is pulled
    /// from the heap and goes terminal without ever forking; anything live
    /// routes through the executor's termination path.
    pub fn cancel(&self, job_id: &Uuid) -> Result<(), EngineError> {
        let job = self
            .stores
            .jobs
            .get(job_id)
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))?;

        if job.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "job {} already {:?}",
                job.short_id(),
                job.status
            )));
        }

        if job.status == JobStatus::Scheduled && self.scheduler.cancel(job_id) {
            self.stores.jobs.update(job_id, |j| {
                j.status = JobStatus::Cancelled;
                j.ended_at = Some(Utc::now());
            })?;
            log::info!("scheduled job {} cancelled before firing", job.short_id());
            return Ok(());
        }

        // Popped, Pending, or already live: the lifecycle task owns it.
        match self.executor.control(job_id) {
            Some(control) => {
                control.request_stop();
                Ok(())
            }
            None => {
                // Between heap pop and task registration, or a stale record;
                // mark the intent so the lifecycle observes it at spawn.
                log::warn!("cancel for {} found no live control", job_id);
                self.stores.jobs.update(job_id, |j| {
                    if !j.status.is_terminal() {
                        j.status = JobStatus::Cancelled;
                        j.ended_at = Some(Utc::now());
                    }
                })?;
                Ok(())
            }
        }
    }

    /// Stop is cancel for a running job; same terminal state.
    pub fn stop(&self, job_id: &Uuid) -> Result<(), EngineError> {
        self.cancel(job_id)
    }

    pub fn list(&self) -> Vec<JobView> {
        self.stores
            .jobs
            .list()
            .iter()
            .map(|j| JobView::from_job(j, None))
            .collect()
    }

    pub async fn get_status(&self, job_id: &Uuid) -> Result<JobView, EngineError> {
        let job = self
            .stores
            .jobs
            .get(job_id)
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))?;

        let usage = match (&job.status, &job.cgroup_path) {
            (JobStatus::Running | JobStatus::UploadingFiles, Some(path)) => {
                self.executor.cgroups.usage(path).await
            }
            _ => None,
        };
        Ok(JobView::from_job(&job, usage))
    }

    /// Log stream: `from_start` replays the retained tail, `follow` keeps
    /// the subscriber attached for live chunks (a non-follow read drains
    /// and stops at the head observed here).
    pub fn stream_logs(
        &self,
        job_id: &Uuid,
        from_start: bool,
        follow: bool,
    ) -> Result<LogSubscriber, EngineError> {
        self.stores
            .jobs
            .get(job_id)
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))?;
        Ok(self.executor.logs.open(*job_id).subscribe(from_start, follow))
    }

    // ========================================================================
    // 4. ADMIN OPERATIONS
    // ========================================================================

    pub async fn create_network(
        &self,
        name: &str,
        cidr: &str,
        bandwidth: Option<BandwidthLimits>,
    ) -> Result<(), EngineError> {
        self.executor.network.create_network(name, cidr, bandwidth).await
    }

    pub async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.executor.network.remove_network(name).await
    }

    pub fn list_networks(&self) -> Vec<(String, CidrV4, String)> {
        self.stores.networks.list()
    }

    pub async fn create_volume(
        &self,
        name: &str,
        kind: VolumeKind,
        size: &str,
    ) -> Result<Volume, EngineError> {
        self.executor
            .volumes
            .create(&self.stores.volumes, name, kind, size)
            .await
    }

    pub async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.executor.volumes.remove(&self.stores.volumes, name).await
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        self.stores.volumes.list()
    }

    // ========================================================================
    // 5. SHUTDOWN
    // ========================================================================

    /// Scheduler stop, executor drain, stores drop with the daemon.
    pub async fn shutdown(&self) {
        log::info!("shutdown: stopping scheduler");
        self.scheduler.stop();
        let task = self.scheduler_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        log::info!("shutdown: draining executor");
        let grace = Duration::from_secs(self.config.termination_grace_secs + 5);
        self.executor.drain(grace).await;
        log::info!("shutdown complete");
    }
}

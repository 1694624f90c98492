// src/executor.rs
//
// =============================================================================
// SANDCELL: EXECUTOR (v 0.4)
// =============================================================================
//
// The job lifecycle state machine. Owns a Job's mutable state from setup
// through cleanup.
//
//          submit
// Pending ---------> Scheduled --fire--+
//    |                                 v
//    +----------------------------> UploadingFiles -> Running
//                                                    /   |   \
//                                               exit0  exit!=0  cancel/stop
//                                                 |      |        |
//                                             Completed Failed Cancelled
//
// Setup is strictly ordered (cgroup, network reservation, GPUs, volumes,
// log broadcast, ready-pipe, spawn, cgroup attach, veth attach, hosts
// file, ready byte). Cleanup is the exact reverse contract and is
// UNCONDITIONAL: it runs on child exit, on any setup failure, and on
// panic recovery. Every release step is take-once or idempotent at the
// store layer, so running cleanup twice is a no-op.
//
// Lock discipline: no store lock is ever held across a kernel call; the
// job record is re-read and re-written around each syscall-bearing step.

use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cgroup::CgroupManager;
use crate::config::DaemonConfig;
use crate::core::{Job, JobStatus};
use crate::error::{CleanupReport, EngineError, SetupStep};
use crate::gpu::GpuManager;
use crate::init;
use crate::logs::{LogRegistry, LogStream};
use crate::network::{hosts, NetworkManager};
use crate::platform::{Platform, SandboxSpawn};
use crate::store::Stores;
use crate::upload::{self, ManifestHandoff, UploadManifest};
use crate::volumes::{VolumeManager, VolumeMount};

// ============================================================================
// 1. PER-JOB CONTROL
// ============================================================================

/// Cancellation handle: a stop flag plus a wakeup, shared between the
/// lifecycle task and the control plane.
pub struct JobControl {
    stop: AtomicBool,
    notify: Notify,
}

impl JobControl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn request_stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    async fn stopped(&self) {
        loop {
            let armed = self.notify.notified();
            if self.stop_requested() {
                return;
            }
            armed.await;
        }
    }
}

// ============================================================================
// 2. THE EXECUTOR
// ============================================================================

pub struct Executor {
    pub config: Arc<DaemonConfig>,
    pub stores: Arc<Stores>,
    platform: Arc<dyn Platform>,

    pub cgroups: CgroupManager,
    pub network: NetworkManager,
    pub gpus: GpuManager,
    pub volumes: VolumeManager,
    pub logs: LogRegistry,

    controls: Mutex<HashMap<Uuid, Arc<JobControl>>>,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl Executor {
    pub fn new(
        config: Arc<DaemonConfig>,
        stores: Arc<Stores>,
        platform: Arc<dyn Platform>,
    ) -> Arc<Self> {
        let cgroups = CgroupManager::new(config.cgroup_root.clone(), config.io_device.clone());
        let network = NetworkManager::new(platform.clone(), stores.clone());
        let gpus = GpuManager::new(platform.clone(), config.gpu_strategy);
        let volumes = VolumeManager::new(config.clone(), platform.clone());
        let logs = LogRegistry::new(config.log_ring_capacity);

        Arc::new(Self {
            config,
            stores,
            platform,
            cgroups,
            network,
            gpus,
            volumes,
            logs,
            controls: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn control(&self, job_id: &Uuid) -> Option<Arc<JobControl>> {
        self.controls.lock().unwrap().get(job_id).cloned()
    }

    // ========================================================================
    // LAUNCH
    // ========================================================================

    /// Detaches the lifecycle of a Pending job into its own task. A panic
    /// in the task is caught at join and turned into Failed + cold cleanup;
    /// the daemon never dies with a job.
    pub fn spawn_lifecycle(self: &Arc<Self>, job_id: Uuid) {
        let control = JobControl::new();
        self.controls.lock().unwrap().insert(job_id, control.clone());

        let me = self.clone();
        let watcher = tokio::spawn(async move {
            let inner = tokio::spawn({
                let me = me.clone();
                let control = control.clone();
                async move { me.run_lifecycle(job_id, control).await }
            });

            if let Err(join_err) = inner.await {
                log::error!("lifecycle task for job {} panicked: {}", job_id, join_err);
                let mut report = CleanupReport::new(job_id);
                me.cleanup(job_id, None, &mut report).await;
                let _ = me.stores.jobs.update(&job_id, |j| {
                    if !j.status.is_terminal() {
                        j.status = JobStatus::Failed;
                        j.failure = Some("lifecycle task panicked".into());
                        j.ended_at = Some(Utc::now());
                    }
                });
            }

            me.controls.lock().unwrap().remove(&job_id);
            me.tasks.lock().unwrap().remove(&job_id);
        });
        self.tasks.lock().unwrap().insert(job_id, watcher);
    }

    /// Stops everything still in flight and waits for the tasks to drain.
    /// Daemon shutdown path; runs after the scheduler has stopped.
    pub async fn drain(&self, timeout: Duration) {
        let controls: Vec<Arc<JobControl>> =
            self.controls.lock().unwrap().values().cloned().collect();
        for c in &controls {
            c.request_stop();
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain().map(|(_, h)| h).collect()
        };
        log::info!("draining {} live job task(s)", handles.len());
        for h in handles {
            if tokio::time::timeout(timeout, h).await.is_err() {
                log::warn!("a lifecycle task outlived the drain window");
            }
        }
    }

    // ========================================================================
    // THE LIFECYCLE
    // ========================================================================

    async fn run_lifecycle(self: Arc<Self>, job_id: Uuid, control: Arc<JobControl>) {
        // A cancel can land between scheduler pop and this task starting;
        // a terminal record or a raised stop flag means nothing to do.
        match self.stores.jobs.get(&job_id) {
            Some(job) if job.status.is_terminal() => return,
            None => return,
            _ => {}
        }
        if control.stop_requested() {
            let mut report = CleanupReport::new(job_id);
            self.cleanup(job_id, None, &mut report).await;
            self.finalize(job_id, JobStatus::Cancelled, None, None, &report);
            return;
        }

        // A. SETUP + SPAWN
        let launched = self.setup_and_spawn(job_id).await;

        let mut report = CleanupReport::new(job_id);
        match launched {
            Err(err) => {
                log::error!("job {} setup failed: {}", job_id, err);
                self.cleanup(job_id, None, &mut report).await;
                self.finalize(job_id, JobStatus::Failed, None, Some(err.to_string()), &report);
                return;
            }
            Ok(mut child) => {
                // B. SUPERVISE
                let (exit_code, cancelled) = self.supervise(job_id, &mut child, &control).await;

                // C. CLEANUP (unconditional, ordered)
                self.cleanup(job_id, Some(&mut child), &mut report).await;

                // D. TERMINAL TRANSITION
                let status = if cancelled {
                    JobStatus::Cancelled
                } else if exit_code == Some(0) {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                let failure = match (status, exit_code) {
                    (JobStatus::Failed, Some(code)) => {
                        Some(format!("command exited with code {}", code))
                    }
                    (JobStatus::Failed, None) => Some("command killed by signal".into()),
                    _ => None,
                };
                self.finalize(job_id, status, exit_code, failure, &report);
            }
        }
    }

    /// Setup steps in contract order. Each allocation is recorded on the
    /// job/stores immediately so cleanup can find it even if a later step
    /// explodes.
    async fn setup_and_spawn(&self, job_id: Uuid) -> Result<Child, EngineError> {
        let job = self
            .stores
            .jobs
            .get(&job_id)
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))?;
        let short = job.short_id();
        let spec = job.spec.clone();

        // 3. Cgroup subtree with limits.
        let cgroup_path = self.cgroups.create(&short, &spec.limits).await?;
        self.stores
            .jobs
            .update(&job_id, |j| j.cgroup_path = Some(cgroup_path.clone()))?;

        // 4. Network reservation (IP + veth names; no interfaces yet).
        let attachment = self.network.reserve(&job_id, &spec.network)?;
        if let Some(att) = &attachment {
            self.stores.jobs.update(&job_id, |j| {
                j.ip = Some(att.ip);
                j.veth_host = Some(att.veth_host.clone());
                j.veth_peer = Some(att.veth_peer.clone());
            })?;
        }

        // 5. GPU reservation.
        if spec.limits.gpu_count > 0 {
            let pick = self.gpus.reserve(
                &self.stores.gpus,
                job_id,
                spec.limits.gpu_count,
                spec.limits.gpu_memory_mb,
            )?;
            self.stores
                .jobs
                .update(&job_id, |j| j.gpu_indices = pick.indices.clone())?;
        }

        // 6. Volume references + mount list.
        let mounts = self
            .volumes
            .resolve_mounts(&self.stores.volumes, job_id, &spec.volumes)?;

        // Workspace directory (chroot base unless a runtime is named).
        let workspace = self.config.workspace_dir(&short);
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| EngineError::setup(SetupStep::Workspace, e))?;

        let chroot_base = if spec.runtime.is_empty() {
            workspace.clone()
        } else {
            let dir = self.config.runtime_dir(&spec.runtime);
            if !dir.exists() {
                return Err(EngineError::NotFound(format!("runtime '{}'", spec.runtime)));
            }
            dir
        };

        // 7. Log broadcast.
        let _broadcast = self.logs.open(job_id);

        // 8. Ready-pipe (parent writes, child blocks).
        let (ready_read, ready_write) =
            os_pipe::pipe().map_err(|e| EngineError::setup(SetupStep::ReadyPipe, e))?;

        // Stage the upload manifest for the child.
        let manifest = UploadManifest::new(spec.uploads.clone());
        let handoff = upload::stage_manifest(&workspace, &manifest)
            .map_err(|e| EngineError::setup(SetupStep::Workspace, e))?;

        // 9. Fork + re-exec into init mode.
        use std::os::fd::AsRawFd;
        let env = self.build_child_env(&job, &workspace, &chroot_base, &mounts, &handoff,
            ready_read.as_raw_fd());
        let spawn = SandboxSpawn {
            command: spec.command.clone(),
            args: spec.args.clone(),
            env,
            workspace: workspace.clone(),
            ready_fd: Some(ready_read.as_raw_fd()),
        };
        let mut child = self
            .platform
            .spawn_sandbox(&spawn)
            .map_err(|e| EngineError::setup(SetupStep::Spawn, e))?;
        drop(ready_read); // Parent's copy; the child holds its own.

        let pid = child.id().map(|p| p as i32).ok_or_else(|| {
            EngineError::setup(SetupStep::Spawn, "child pid unavailable at spawn")
        })?;
        let uploading = !manifest.is_empty();
        self.stores.jobs.update(&job_id, |j| {
            j.pid = Some(pid);
            j.status = if uploading {
                JobStatus::UploadingFiles
            } else {
                JobStatus::Running
            };
        })?;

        // 10. Parent-side post-fork steps. The child stays parked on the
        // ready-pipe throughout; a failure here must not leak it.
        if let Err(e) = self
            .seal_envelope(job_id, &short, &attachment, &workspace, ready_write)
            .await
        {
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
            let _ = child.wait().await;
            return Err(e);
        }

        self.stores.jobs.update(&job_id, |j| {
            j.status = JobStatus::Running;
            j.started_at = Some(Utc::now());
        })?;
        log::info!("job {} running (pid {})", short, pid);

        Ok(child)
    }

    /// Steps 10a-10d: cgroup placement, veth attach, hosts file, ready
    /// byte. The ready-pipe write end is consumed here; dropping it on an
    /// early error also unblocks a real child into a clean EOF exit.
    async fn seal_envelope(
        &self,
        job_id: Uuid,
        short: &str,
        attachment: &Option<crate::store::NetworkAttachment>,
        workspace: &std::path::Path,
        ready_write: os_pipe::PipeWriter,
    ) -> Result<(), EngineError> {
        let pid = self
            .stores
            .jobs
            .get(&job_id)
            .and_then(|j| j.pid)
            .ok_or_else(|| EngineError::Internal("pid vanished during setup".into()))?;

        // 10a. Move the child into the cgroup leaf before it can run user
        // code.
        self.cgroups
            .attach(&self.cgroups.job_path(short), pid)
            .await?;

        // 10b. Network interfaces, now that the netns exists.
        if let Some(att) = attachment {
            self.network.attach(att, pid).await?;
        }

        // 10c. Hosts file into the bind-mount source.
        if let Some(att) = attachment {
            let content = self.network.render_hosts(att);
            tokio::fs::write(workspace.join(hosts::HOSTS_FILE_NAME), content)
                .await
                .map_err(|e| EngineError::setup(SetupStep::HostsFile, e))?;
        }

        // 10d. One byte on the ready-pipe releases the child. A broken
        // pipe means the child died before the barrier; the supervisor
        // will observe the exit instead of failing setup.
        let mut w = ready_write;
        match w.write_all(&[1]).and_then(|_| w.flush()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                log::warn!("job {} exited before the ready signal", short);
            }
            Err(e) => return Err(EngineError::setup(SetupStep::ReadySignal, e)),
        }
        Ok(())
    }

    fn build_child_env(
        &self,
        job: &Job,
        workspace: &std::path::Path,
        chroot_base: &std::path::Path,
        mounts: &[VolumeMount],
        handoff: &ManifestHandoff,
        ready_fd: i32,
    ) -> Vec<(String, String)> {
        let spec = &job.spec;
        let mut env: Vec<(String, String)> = vec![
            ("PATH".into(), init::DEFAULT_PATH.into()),
            ("HOME".into(), "/".into()),
            ("TERM".into(), "xterm".into()),
            ("HOSTNAME".into(), crate::core::job_hostname(&job.id)),
        ];

        // User env first, secrets after (secrets win on collision and
        // never appear in any listing).
        for (k, v) in &spec.env {
            env.push((k.clone(), v.clone()));
        }
        for (k, v) in &spec.secret_env {
            env.push((k.clone(), v.clone()));
        }

        env.extend(GpuManager::visibility_env(&job.gpu_indices));

        // Control vars for init mode; stripped before the user exec.
        env.push((init::ENV_MODE.into(), init::MODE_INIT.into()));
        env.push((init::ENV_JOB_SHORT.into(), job.short_id()));
        env.push((init::ENV_READY_FD.into(), ready_fd.to_string()));
        env.push((
            init::ENV_WORKSPACE.into(),
            workspace.to_string_lossy().into_owned(),
        ));
        env.push((
            init::ENV_ROOT.into(),
            chroot_base.to_string_lossy().into_owned(),
        ));
        env.push((init::ENV_COMMAND.into(), spec.command.clone()));
        env.push((
            init::ENV_ARGS.into(),
            serde_json::to_string(&spec.args).unwrap_or_else(|_| "[]".into()),
        ));
        env.push((
            init::ENV_MOUNTS.into(),
            serde_json::to_string(mounts).unwrap_or_else(|_| "[]".into()),
        ));
        env.push((
            init::ENV_PHASE.into(),
            if spec.uploads.is_empty() {
                init::PHASE_EXECUTE.into()
            } else {
                init::PHASE_UPLOAD.into()
            },
        ));
        match handoff {
            ManifestHandoff::File(path) => {
                env.push((init::ENV_MANIFEST_FILE.into(), path.to_string_lossy().into_owned()))
            }
            ManifestHandoff::Env(b64) => env.push((init::ENV_MANIFEST_B64.into(), b64.clone())),
            ManifestHandoff::None => {}
        }
        if !matches!(spec.network, crate::core::NetworkSelection::None) {
            env.push((
                init::ENV_HOSTS_FILE.into(),
                workspace
                    .join(hosts::HOSTS_FILE_NAME)
                    .to_string_lossy()
                    .into_owned(),
            ));
        }
        env
    }

    /// Pumps logs and waits for exit, honoring stop requests with a
    /// TERM-then-KILL escalation. Returns (exit_code, cancelled).
    async fn supervise(
        &self,
        job_id: Uuid,
        child: &mut Child,
        control: &Arc<JobControl>,
    ) -> (Option<i32>, bool) {
        let broadcast = self.logs.open(job_id);
        let chunk_bytes = self.config.log_chunk_bytes;

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let b = broadcast.clone();
            pumps.push(tokio::spawn(pump(stdout, b, LogStream::Stdout, chunk_bytes)));
        }
        if let Some(stderr) = child.stderr.take() {
            let b = broadcast.clone();
            pumps.push(tokio::spawn(pump(stderr, b, LogStream::Stderr, chunk_bytes)));
        }

        let pid = child.id().map(|p| p as i32);
        let mut waited: Option<std::io::Result<std::process::ExitStatus>> = None;
        let cancelled;
        tokio::select! {
            status = child.wait() => {
                cancelled = control.stop_requested();
                waited = Some(status);
            }
            _ = control.stopped() => {
                cancelled = true;
            }
        }
        // The wait future is dropped once the select resolves, so the
        // termination path may reborrow the child.
        let status = match waited {
            Some(status) => status,
            None => self.terminate(child, pid).await,
        };

        // Drain the pipes before anyone closes the broadcast.
        for p in pumps {
            let _ = p.await;
        }

        let exit_code = match status {
            Ok(st) => st.code(),
            Err(e) => {
                log::error!("wait() for job {} failed: {}", job_id, e);
                None
            }
        };
        (exit_code, cancelled)
    }

    /// SIGTERM to the process group, SIGKILL after the grace window.
    async fn terminate(&self, child: &mut Child, pid: Option<i32>) -> std::io::Result<std::process::ExitStatus> {
        if let Some(pid) = pid {
            log::info!("terminating pid group {} (grace {}s)", pid, self.config.termination_grace_secs);
            let _ = killpg(Pid::from_raw(pid), Signal::SIGTERM);
            let grace = Duration::from_secs(self.config.termination_grace_secs);
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return status;
            }
            log::warn!("grace expired, killing pid group {}", pid);
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
        child.wait().await
    }

    // ========================================================================
    // CLEANUP (contract order; every step take-once or idempotent)
    // ========================================================================

    /// Releases everything a job may hold. Reconstructable purely from the
    /// stores, so this also serves panic recovery and double-run tests.
    pub async fn cleanup(&self, job_id: Uuid, child: Option<&mut Child>, report: &mut CleanupReport) {
        let job = self.stores.jobs.get(&job_id);
        let short = job.as_ref().map(|j| j.short_id()).unwrap_or_default();

        // 1. Kill the process group if anything is still alive.
        if let Some(child) = child {
            if let Some(pid) = child.id().map(|p| p as i32) {
                let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
                let _ = child.wait().await;
            }
        }

        // 2-4. Network: tc rules, host veth, per-job iptables.
        let attachment = self.stores.networks.detach(&job_id);
        if let Some(att) = &attachment {
            self.network.release_interfaces(att, report).await;
        }

        // 5. Volume references.
        self.stores.volumes.unref_all(&job_id);

        // 6. GPUs (device reset side effect inside).
        let freed = self.gpus.release(&self.stores.gpus, &job_id).await;
        if !freed.is_empty() {
            log::info!("job {} released GPU(s) {:?}", short, freed);
        }

        // 7. IP back to the pool.
        if let Some(att) = &attachment {
            self.network.release_ip(att, report);
        }

        // 8. Cgroup subtree.
        if let Some(path) = job.as_ref().and_then(|j| j.cgroup_path.clone()) {
            if let Err(e) = self.cgroups.destroy(&path).await {
                report.record("cgroup-destroy", e);
            }
        }

        // Workspace directory (not an allocation, but ours to reap).
        if !short.is_empty() {
            let ws = self.config.workspace_dir(&short);
            match tokio::fs::remove_dir_all(&ws).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => report.record("workspace-remove", e),
            }
        }

        // 9. Log broadcast: subscribers drain, then EOF.
        self.logs.close(&job_id);

        // Clear live handles on the record; the terminal transition (10)
        // happens in finalize() with the exit data.
        let _ = self.stores.jobs.update(&job_id, |j| {
            j.pid = None;
            j.veth_host = None;
            j.veth_peer = None;
        });
    }

    /// Step 10: the terminal store transition.
    fn finalize(
        &self,
        job_id: Uuid,
        status: JobStatus,
        exit_code: Option<i32>,
        failure: Option<String>,
        report: &CleanupReport,
    ) {
        let updated = self.stores.jobs.update(&job_id, |j| {
            j.status = status;
            j.exit_code = exit_code;
            j.ended_at = Some(Utc::now());
            if j.failure.is_none() {
                j.failure = failure.clone();
            }
        });
        match updated {
            Ok(job) => {
                if report.is_clean() {
                    log::info!("job {} -> {:?} (exit {:?})", job.short_id(), status, exit_code);
                } else {
                    log::warn!(
                        "job {} -> {:?} with cleanup issues: {}",
                        job.short_id(),
                        status,
                        report.summary()
                    );
                }
            }
            Err(e) => log::error!("terminal transition for {} failed: {}", job_id, e),
        }
    }
}

// ============================================================================
// 3. PIPE PUMP
// ============================================================================

async fn pump(
    mut src: impl tokio::io::AsyncRead + Unpin,
    broadcast: Arc<crate::logs::LogBroadcast>,
    stream: LogStream,
    chunk_bytes: usize,
) {
    let mut buf = vec![0u8; chunk_bytes.max(512)];
    loop {
        match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => broadcast.publish(stream, buf[..n].to_vec()),
        }
    }
}

// tests/common/mod.rs
//
// Shared test harness: a scripted platform fake plus fresh-engine helpers.
//
// The fake records every external command, replays canned outputs, injects
// failures by substring match, and spawns sandbox children as plain
// processes (no namespaces, no re-exec), so the full lifecycle runs
// without root against temp-dir roots.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use uuid::Uuid;

use sandcell::config::DaemonConfig;
use sandcell::core::{JobSpec, JobStatus};
use sandcell::daemon::Daemon;
use sandcell::platform::{CmdOutput, Platform, SandboxSpawn};

// ============================================================================
// 1. THE FAKE PLATFORM
// ============================================================================

#[derive(Default)]
pub struct FakePlatform {
    /// Every `run` invocation as "program arg arg ...".
    pub calls: Mutex<Vec<String>>,
    /// Substring -> stderr; a matching command fails with exit 1.
    pub failures: Mutex<Vec<(String, String)>>,
    /// Substring -> stdout for successful commands.
    pub canned: Mutex<Vec<(String, String)>>,
    /// Commands handed to spawn_sandbox.
    pub spawns: Mutex<Vec<String>>,
    /// Dups of ready-pipe read ends, held open so the parent's ready byte
    /// always has a reader (real children block on theirs).
    held_fds: Mutex<Vec<i32>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_matching(&self, needle: &str, stderr: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((needle.to_string(), stderr.to_string()));
    }

    pub fn respond(&self, needle: &str, stdout: &str) {
        self.canned
            .lock()
            .unwrap()
            .push((needle.to_string(), stdout.to_string()));
    }

    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(needle))
            .cloned()
            .collect()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }
}

impl Drop for FakePlatform {
    fn drop(&mut self) {
        for fd in self.held_fds.lock().unwrap().drain(..) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let line = format!("{} {}", program, args.join(" "));
        self.calls.lock().unwrap().push(line.clone());

        for (needle, stderr) in self.failures.lock().unwrap().iter() {
            if line.contains(needle.as_str()) {
                return Ok(CmdOutput {
                    code: 1,
                    stdout: String::new(),
                    stderr: stderr.clone(),
                });
            }
        }
        for (needle, stdout) in self.canned.lock().unwrap().iter() {
            if line.contains(needle.as_str()) {
                return Ok(CmdOutput {
                    code: 0,
                    stdout: stdout.clone(),
                    stderr: String::new(),
                });
            }
        }
        Ok(CmdOutput {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn spawn_sandbox(&self, spawn: &SandboxSpawn) -> std::io::Result<Child> {
        self.spawns.lock().unwrap().push(spawn.command.clone());

        if let Some(fd) = spawn.ready_fd {
            let dup = unsafe { libc::dup(fd) };
            if dup >= 0 {
                self.held_fds.lock().unwrap().push(dup);
            }
        }

        let mut cmd = Command::new(&spawn.command);
        cmd.args(&spawn.args)
            .current_dir(&spawn.workspace)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        for (k, v) in &spawn.env {
            if !k.starts_with("SANDCELL_") {
                cmd.env(k, v);
            }
        }
        cmd.spawn()
    }
}

// ============================================================================
// 2. FRESH-ENGINE HELPERS
// ============================================================================

/// Relocates every engine root under the given temp dir; GPUs start empty
/// and get registered per test.
pub fn test_config(root: &Path) -> DaemonConfig {
    DaemonConfig {
        cgroup_root: root.join("cgroup"),
        workspace_root: root.join("work"),
        volumes_root: root.join("volumes"),
        runtimes_root: root.join("runtimes"),
        termination_grace_secs: 1,
        log_ring_capacity: 256,
        log_chunk_bytes: 4096,
        io_device: None,
        gpu_strategy: sandcell::core::GpuStrategy::FirstFit,
        disable_gpus: true,
    }
}

pub async fn boot(root: &Path) -> (Arc<Daemon>, Arc<FakePlatform>) {
    let platform = FakePlatform::new();
    let daemon = Daemon::boot(test_config(root), platform.clone())
        .await
        .expect("daemon boot");
    (daemon, platform)
}

pub fn echo_spec(msg: &str) -> JobSpec {
    JobSpec {
        command: "/bin/echo".into(),
        args: vec![msg.into()],
        ..Default::default()
    }
}

pub fn sh_spec(script: &str) -> JobSpec {
    JobSpec {
        command: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
        ..Default::default()
    }
}

pub fn sleep_spec(secs: &str) -> JobSpec {
    JobSpec {
        command: "/bin/sleep".into(),
        args: vec![secs.into()],
        ..Default::default()
    }
}

/// Polls until the job satisfies the predicate or the timeout trips.
pub async fn wait_for<F>(daemon: &Daemon, id: &Uuid, timeout: Duration, pred: F) -> JobStatus
where
    F: Fn(JobStatus) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = daemon
            .stores
            .jobs
            .get(id)
            .map(|j| j.status)
            .expect("job exists");
        if pred(status) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting; last status {:?}",
            status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_terminal(daemon: &Daemon, id: &Uuid) -> JobStatus {
    wait_for(daemon, id, Duration::from_secs(10), |s| s.is_terminal()).await
}

pub async fn wait_running(daemon: &Daemon, id: &Uuid) -> JobStatus {
    wait_for(daemon, id, Duration::from_secs(10), |s| {
        s == JobStatus::Running || s.is_terminal()
    })
    .await
}

// src/platform.rs
//
// =============================================================================
// SANDCELL: PLATFORM FACADE (v 0.4)
// =============================================================================
//
// Thin indirection over the two OS primitives the engine cannot fake at the
// filesystem level:
//
// 1. External command invocation with captured output (`ip`, `iptables`,
//    `tc`, `nvidia-smi`, `mount`).
// 2. Spawning the sandbox child with attribute overrides (session leader,
//    inherited ready-pipe fd, namespace unshare, re-exec into init mode).
//
// Everything else (cgroup files, hosts files, workspaces, volumes) is plain
// file I/O under config-supplied roots and needs no indirection. Tests
// implement this trait with a scripted fake and run the whole lifecycle
// without root.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

// ============================================================================
// 1. THE CONTRACT
// ============================================================================

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Everything the executor needs to start one sandbox child.
#[derive(Debug, Clone)]
pub struct SandboxSpawn {
    /// User command + argv, re-resolved inside the sandbox.
    pub command: String,
    pub args: Vec<String>,
    /// Complete child environment (init-mode control vars included).
    pub env: Vec<(String, String)>,
    pub workspace: PathBuf,
    /// Read end of the ready-pipe; inherited across the exec with CLOEXEC
    /// cleared so the init process can block on it.
    pub ready_fd: Option<i32>,
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Runs a command to completion, capturing stdout/stderr. A nonzero exit
    /// is returned in-band, not as Err; Err means the spawn itself failed.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput>;

    /// Spawns the sandbox child with stdout/stderr piped.
    fn spawn_sandbox(&self, spawn: &SandboxSpawn) -> std::io::Result<Child>;
}

/// Helper shared by every call site that requires success: surfaces the
/// stderr tail in the error, logging the rest.
pub async fn run_checked(platform: &dyn Platform, program: &str, args: &[&str]) -> Result<String> {
    let out = platform.run(program, args).await?;
    if !out.success() {
        let tail: String = out
            .stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .join(" | ");
        return Err(anyhow!(
            "'{} {}' exited {}: {}",
            program,
            args.join(" "),
            out.code,
            tail
        ));
    }
    Ok(out.stdout)
}

// ============================================================================
// 2. THE HOST IMPLEMENTATION
// ============================================================================

pub struct HostPlatform;

#[async_trait]
impl Platform for HostPlatform {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to spawn '{}'", program))?;

        Ok(CmdOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn spawn_sandbox(&self, spawn: &SandboxSpawn) -> std::io::Result<Child> {
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(exe);

        cmd.env_clear();
        for (k, v) in &spawn.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let ready_fd = spawn.ready_fd;
        // Post-fork, pre-exec. Only async-signal-safe calls belong here.
        unsafe {
            cmd.pre_exec(move || {
                // Own session => the whole sandbox is one process group, so
                // termination can signal -pgid.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                // The ready-pipe must survive the exec.
                if let Some(fd) = ready_fd {
                    if libc::fcntl(fd, libc::F_SETFD, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                // Fresh namespaces. PID namespace membership starts at the
                // init process's first fork (init forks the payload, which
                // becomes PID 1).
                let flags = libc::CLONE_NEWNS
                    | libc::CLONE_NEWUTS
                    | libc::CLONE_NEWIPC
                    | libc::CLONE_NEWNET
                    | libc::CLONE_NEWPID
                    | libc::CLONE_NEWCGROUP;
                if libc::unshare(flags) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()
    }
}

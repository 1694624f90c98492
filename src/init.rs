// src/init.rs
//
// =============================================================================
// SANDCELL: INIT MODE (v 0.4)
// =============================================================================
//
// The re-exec of this binary inside the fresh namespaces. The daemon is the
// parent; this process is the sandbox entry.
//
// Contract with the parent, in order:
// 1. Block on the inherited ready-pipe. The parent writes its single byte
//    only after cgroup placement, veth move, and hosts-file staging, so
//    nothing user-observable happens before the envelope is sealed.
// 2. Verify the cgroup assignment (exactly "0::/" means the move never
//    landed: fatal).
// 3. Filesystem isolation: private mount propagation, volume binds,
//    hosts-file bind, upload materialization, chroot.
// 4. Fork. The first child of this process is PID 1 of the new PID
//    namespace: it mounts /proc, masks /sys, strips the control
//    environment, and execs the user command (PATH-resolved).
// 5. Wait and propagate the exit code.
//
// Everything here is synchronous std + nix: no runtime starts in init mode.

use nix::mount::{mount, MsFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, execvp, fork, sethostname, ForkResult};
use std::ffi::CString;
use std::io::Read;
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};
use std::process::exit;

use crate::cgroup;
use crate::upload;
use crate::volumes::VolumeMount;

// ============================================================================
// 1. THE ENVIRONMENT CONTRACT
// ============================================================================

pub const ENV_MODE: &str = "SANDCELL_MODE";
pub const MODE_INIT: &str = "init";

pub const ENV_JOB_SHORT: &str = "SANDCELL_JOB";
pub const ENV_READY_FD: &str = "SANDCELL_READY_FD";
pub const ENV_WORKSPACE: &str = "SANDCELL_WORKSPACE";
pub const ENV_ROOT: &str = "SANDCELL_ROOT";
pub const ENV_COMMAND: &str = "SANDCELL_CMD";
pub const ENV_ARGS: &str = "SANDCELL_ARGS";
pub const ENV_MOUNTS: &str = "SANDCELL_MOUNTS";
pub const ENV_PHASE: &str = "SANDCELL_PHASE";
pub const ENV_MANIFEST_FILE: &str = "SANDCELL_MANIFEST_FILE";
pub const ENV_MANIFEST_B64: &str = "SANDCELL_MANIFEST_B64";
pub const ENV_HOSTS_FILE: &str = "SANDCELL_HOSTS_FILE";

pub const PHASE_UPLOAD: &str = "upload";
pub const PHASE_EXECUTE: &str = "execute";

pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Exit codes the parent can tell apart from user-command codes in logs.
const EXIT_SETUP: i32 = 125;
const EXIT_UPLOAD: i32 = 124;

pub fn is_init_mode() -> bool {
    std::env::var(ENV_MODE).as_deref() == Ok(MODE_INIT)
}

struct InitContext {
    job_short: String,
    ready_fd: i32,
    workspace: PathBuf,
    root: PathBuf,
    command: String,
    args: Vec<String>,
    mounts: Vec<VolumeMount>,
    phase: String,
    manifest_file: Option<String>,
    manifest_b64: Option<String>,
    hosts_file: Option<PathBuf>,
}

fn ctx_from_env() -> anyhow::Result<InitContext> {
    let get = |k: &str| std::env::var(k).map_err(|_| anyhow::anyhow!("missing {}", k));
    Ok(InitContext {
        job_short: get(ENV_JOB_SHORT)?,
        ready_fd: get(ENV_READY_FD)?.parse()?,
        workspace: PathBuf::from(get(ENV_WORKSPACE)?),
        root: PathBuf::from(get(ENV_ROOT)?),
        command: get(ENV_COMMAND)?,
        args: serde_json::from_str(&get(ENV_ARGS)?)?,
        mounts: serde_json::from_str(&get(ENV_MOUNTS)?)?,
        phase: get(ENV_PHASE)?,
        manifest_file: std::env::var(ENV_MANIFEST_FILE).ok(),
        manifest_b64: std::env::var(ENV_MANIFEST_B64).ok(),
        hosts_file: std::env::var(ENV_HOSTS_FILE).ok().map(PathBuf::from),
    })
}

// ============================================================================
// 2. ENTRY
// ============================================================================

/// Never returns. Called by main() before any runtime starts.
pub fn run() -> ! {
    let ctx = match ctx_from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sandbox init: bad environment: {}", e);
            exit(EXIT_SETUP);
        }
    };

    if let Err(e) = prepare(&ctx) {
        eprintln!("sandbox init: {}", e);
        exit(EXIT_SETUP);
    }

    if ctx.phase == PHASE_UPLOAD {
        if let Err(e) = materialize_uploads(&ctx) {
            eprintln!("sandbox init: {}", e);
            exit(EXIT_UPLOAD);
        }
    }

    if let Err(e) = enter_root(&ctx) {
        eprintln!("sandbox init: {}", e);
        exit(EXIT_SETUP);
    }

    match spawn_payload(&ctx) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("sandbox init: exec failed: {}", e);
            exit(EXIT_SETUP);
        }
    }
}

// ============================================================================
// 3. THE BARRIER + VERIFICATION
// ============================================================================

fn prepare(ctx: &InitContext) -> anyhow::Result<()> {
    // Block until the parent has sealed the envelope. EOF without a byte
    // means the parent died mid-setup; nothing to do but leave.
    let mut pipe = unsafe { std::fs::File::from_raw_fd(ctx.ready_fd) };
    let mut byte = [0u8; 1];
    let n = pipe.read(&mut byte)?;
    if n == 0 {
        anyhow::bail!("parent closed ready-pipe without signaling");
    }
    drop(pipe);

    // The parent moved us into the job cgroup before signaling; trust but
    // verify before running anything user-observable.
    let self_cgroup = std::fs::read_to_string("/proc/self/cgroup")?;
    cgroup::verify_assignment(&self_cgroup, &ctx.job_short)
        .map_err(|e| anyhow::anyhow!("cgroup verification: {}", e))?;

    sethostname(format!("job-{}", ctx.job_short))?;

    // Our mount ns still shares propagation with the host; cut it before
    // any bind lands.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;

    // Workspace appears at <root>/work when a runtime image is the root.
    if ctx.root != ctx.workspace {
        let work = ctx.root.join("work");
        std::fs::create_dir_all(&work)?;
        bind(&ctx.workspace, &work)?;
    }

    // Named volumes land under the workspace.
    for m in &ctx.mounts {
        let target = ctx.workspace.join(&m.target_rel);
        std::fs::create_dir_all(&target)?;
        bind(&m.source, &target)?;
    }

    // The staged hosts file covers /etc/hosts inside the root.
    if let Some(hosts) = &ctx.hosts_file {
        let etc = ctx.root.join("etc");
        std::fs::create_dir_all(&etc)?;
        let target = etc.join("hosts");
        if !target.exists() {
            std::fs::write(&target, b"")?;
        }
        bind(hosts, &target)?;
    }

    Ok(())
}

fn bind(source: &Path, target: &Path) -> anyhow::Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| anyhow::anyhow!("bind {:?} -> {:?}: {}", source, target, e))
}

// ============================================================================
// 4. UPLOAD PHASE
// ============================================================================

/// Writes happen in this process, already inside the job cgroup, so every
/// byte is accounted against the job's memory/io limits.
fn materialize_uploads(ctx: &InitContext) -> anyhow::Result<()> {
    let manifest = upload::load_manifest(
        ctx.manifest_file.as_deref(),
        ctx.manifest_b64.as_deref(),
    )?;
    upload::materialize(&ctx.workspace, &manifest)
}

// ============================================================================
// 5. ROOT SWITCH + EXEC
// ============================================================================

fn enter_root(ctx: &InitContext) -> anyhow::Result<()> {
    // Mount points /proc and /sys must exist before the switch; bare
    // workspaces start empty.
    for dir in ["proc", "sys", "etc", "tmp"] {
        let _ = std::fs::create_dir_all(ctx.root.join(dir));
    }

    chroot(&ctx.root)?;
    chdir(if ctx.root != ctx.workspace { "/work" } else { "/" })?;
    Ok(())
}

fn spawn_payload(ctx: &InitContext) -> anyhow::Result<i32> {
    // Control vars must not leak into the user environment.
    for (key, _) in std::env::vars() {
        if key.starts_with("SANDCELL_") {
            std::env::remove_var(&key);
        }
    }

    // The fork puts the payload into the PID namespace unshared at spawn:
    // it becomes PID 1 and its /proc shows only the sandbox.
    match unsafe { fork() }? {
        ForkResult::Child => {
            if let Err(e) = payload_mounts() {
                eprintln!("sandbox init: payload mounts: {}", e);
                exit(EXIT_SETUP);
            }
            let prog = match CString::new(ctx.command.as_str()) {
                Ok(p) => p,
                Err(_) => {
                    eprintln!("sandbox init: command contains NUL");
                    exit(EXIT_SETUP);
                }
            };
            let mut argv = vec![prog.clone()];
            for a in &ctx.args {
                match CString::new(a.as_str()) {
                    Ok(c) => argv.push(c),
                    Err(_) => {
                        eprintln!("sandbox init: argument contains NUL");
                        exit(EXIT_SETUP);
                    }
                }
            }
            // Replaces the image; PATH resolution uses the env we kept.
            // 127 is the shell convention for command-not-found.
            let err = execvp(&prog, &argv).unwrap_err();
            eprintln!("sandbox init: exec '{}': {}", ctx.command, err);
            exit(127);
        }
        ForkResult::Parent { child } => {
            let code = match waitpid(child, None)? {
                WaitStatus::Exited(_, code) => code,
                WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
                other => {
                    eprintln!("sandbox init: unexpected wait status {:?}", other);
                    EXIT_SETUP
                }
            };
            Ok(code)
        }
    }
}

/// PID-1-side mounts: a /proc scoped to the new namespace, /sys masked.
fn payload_mounts() -> anyhow::Result<()> {
    if Path::new("/proc").is_dir() {
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )?;
    }
    if Path::new("/sys").is_dir() {
        // Kernel topology stays hidden; an empty read-only tmpfs is enough.
        let _ = mount(
            Some("tmpfs"),
            "/sys",
            Some("tmpfs"),
            MsFlags::MS_RDONLY,
            Some("size=0"),
        );
    }
    Ok(())
}

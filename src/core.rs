// src/core.rs
//
// =============================================================================
// SANDCELL: CORE SCHEMA AUTHORITY (v 0.4)
// =============================================================================
//
// The common language of the engine.
// This file defines the strict data contracts between the daemon (parent),
// the sandboxed init process (child), and the control-plane callers.
//
// Design Principles:
// 1. Ids are opaque: a v4 UUID, abbreviated to 8 hex chars for kernel
//    object names (cgroup dirs, veth interfaces, hostnames).
// 2. Specs are inert: a JobSpec carries no handles, only data. Handles
//    (pids, cgroup paths, veth names) live on the Job and are written by
//    exactly one owner, the executor.
// 3. Limits use kernel units: bytes, percent-of-one-core, bytes-per-second.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::EngineError;

// ============================================================================
// 1. IDS & NAMING
// ============================================================================

/// First 8 hex chars of the UUID. Used anywhere the kernel caps name length
/// (IFNAMSIZ is 16 including NUL, so "veth-h-" + 8 fits exactly).
pub fn short_id(id: &Uuid) -> String {
    hex::encode(&id.as_bytes()[..4])
}

/// Hostname assigned to a job inside its UTS namespace.
pub fn job_hostname(id: &Uuid) -> String {
    format!("job-{}", short_id(id))
}

// ============================================================================
// 2. RESOURCE LIMITS
// ============================================================================

/// Declarative resource envelope for one job. Zero means "no limit" for
/// every numeric field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU bandwidth as percent of a single core (100 = one full core,
    /// 250 = 2.5 cores). Maps to cgroup `cpu.max` quota/period.
    #[serde(default)]
    pub cpu_percent: u32,

    /// Explicit core pinning, e.g. "0-3" or "1,3,5". Maps to `cpuset.cpus`.
    #[serde(default)]
    pub cpu_cores: Option<String>,

    /// Memory ceiling in bytes. Maps to `memory.max`.
    #[serde(default)]
    pub memory_bytes: u64,

    /// IO bandwidth ceiling in bytes/second (read and write). Maps to
    /// `io.max` on the configured device.
    #[serde(default)]
    pub io_bps: u64,

    /// Number of GPU devices to reserve.
    #[serde(default)]
    pub gpu_count: u32,

    /// Minimum per-device memory in MB a reserved GPU must have.
    #[serde(default)]
    pub gpu_memory_mb: u64,
}

impl ResourceLimits {
    /// Validates everything that can be rejected before touching the kernel.
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(spec) = &self.cpu_cores {
            parse_core_spec(spec)?;
        }
        if self.cpu_percent > 100 * num_cpus::get() as u32 {
            return Err(EngineError::Validation(format!(
                "cpu_percent {} exceeds machine capacity ({} cores)",
                self.cpu_percent,
                num_cpus::get()
            )));
        }
        Ok(())
    }
}

/// Parses a cpuset-style core list ("0-3", "1,3,5", "0,2-4") into sorted
/// unique indices. Rejects reversed ranges and cores the machine lacks.
pub fn parse_core_spec(spec: &str) -> Result<Vec<usize>, EngineError> {
    let max = num_cpus::get();
    let mut cores = Vec::new();

    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(EngineError::Validation(format!(
                "empty element in core spec '{}'",
                spec
            )));
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: usize = lo.trim().parse().map_err(|_| bad_cores(spec))?;
            let hi: usize = hi.trim().parse().map_err(|_| bad_cores(spec))?;
            if lo > hi {
                return Err(EngineError::Validation(format!(
                    "reversed range '{}' in core spec",
                    part
                )));
            }
            cores.extend(lo..=hi);
        } else {
            cores.push(part.parse().map_err(|_| bad_cores(spec))?);
        }
    }

    cores.sort_unstable();
    cores.dedup();

    if let Some(&top) = cores.last() {
        if top >= max {
            return Err(EngineError::Validation(format!(
                "core {} requested but machine has {} cores",
                top, max
            )));
        }
    }
    Ok(cores)
}

fn bad_cores(spec: &str) -> EngineError {
    EngineError::Validation(format!("malformed core spec '{}'", spec))
}

/// Parses human size specs ("512MB", "2G", "1048576") into bytes.
pub fn parse_size(spec: &str) -> Result<u64, EngineError> {
    let s = spec.trim();
    if s.is_empty() {
        return Err(EngineError::Validation("empty size spec".into()));
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| EngineError::Validation(format!("malformed size spec '{}'", spec)))?;

    let mult: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024u64.pow(4),
        other => {
            return Err(EngineError::Validation(format!(
                "unknown size unit '{}' in '{}'",
                other, spec
            )))
        }
    };

    value
        .checked_mul(mult)
        .ok_or_else(|| EngineError::Validation(format!("size spec '{}' overflows", spec)))
}

// ============================================================================
// 3. GPU STRATEGY
// ============================================================================

/// Governs which free devices satisfy a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuStrategy {
    /// First N free devices meeting the memory floor, in discovery order.
    #[default]
    FirstFit,
    /// Lowest indices first. Keeps low-numbered boards saturated so large
    /// later asks still find contiguous high-numbered boards.
    Pack,
    /// Highest indices first, strided across the free list when it is large
    /// enough to spread.
    Spread,
    /// Smallest device that still meets the memory floor. Degrades to the
    /// largest available device when nothing meets it.
    BestFit,
}

// ============================================================================
// 4. NETWORK ATTACHMENT MODES
// ============================================================================

/// How a job attaches to the network. Parsed from the submission string:
/// "none", "isolated", or the name of an admin-created network.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "name")]
pub enum NetworkSelection {
    /// Fresh empty netns, loopback only.
    #[default]
    None,
    /// Point-to-point /30 to the host with NAT; no peers visible.
    Isolated,
    /// Shared bridge network; peers on the same bridge are reachable and
    /// listed in the generated hosts file.
    Bridged(String),
}

impl NetworkSelection {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "none" => NetworkSelection::None,
            "isolated" => NetworkSelection::Isolated,
            name => NetworkSelection::Bridged(name.to_string()),
        }
    }

    /// Names that can never be admin-created networks.
    pub fn is_reserved_name(name: &str) -> bool {
        matches!(name, "none" | "isolated" | "host" | "bridge")
    }
}

// ============================================================================
// 5. UPLOADS
// ============================================================================

/// One record of the upload manifest. Content travels base64 inside the
/// JSON manifest so the whole batch stays a single self-describing file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFile {
    /// Destination relative to the job workspace.
    pub path: String,
    /// Unix permission bits applied after write.
    pub mode: u32,
    #[serde(default, with = "b64_bytes")]
    pub content: Vec<u8>,
    #[serde(default)]
    pub is_dir: bool,
    /// Declared size; checked against content length at materialization.
    #[serde(default)]
    pub size: u64,
}

pub(crate) mod b64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// 6. JOB SPECIFICATION (The Submission Contract)
// ============================================================================

/// Everything a caller provides. This is the single entry contract the RPC
/// collaborator marshals into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    /// Program to run, resolved PATH-style inside the sandbox.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Same semantics as `env` but redacted from every listing and log line.
    #[serde(default)]
    pub secret_env: HashMap<String, String>,

    #[serde(default)]
    pub limits: ResourceLimits,

    #[serde(default)]
    pub uploads: Vec<UploadFile>,

    /// Named volumes mounted into the workspace.
    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub network: NetworkSelection,

    /// Runtime image name; empty string means the bare workspace.
    #[serde(default)]
    pub runtime: String,

    /// Deferred execution: absent or in the past means run now.
    #[serde(default)]
    pub schedule: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.command.trim().is_empty() {
            return Err(EngineError::Validation("command must not be empty".into()));
        }
        self.limits.validate()?;
        for up in &self.uploads {
            let p = std::path::Path::new(&up.path);
            if p.is_absolute() || up.path.split('/').any(|c| c == "..") {
                return Err(EngineError::Validation(format!(
                    "upload path '{}' must be relative and contain no '..'",
                    up.path
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// 7. JOB STATE (The Lifecycle)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Accepted, allocation not started.
    Pending,
    /// Parked in the timer heap until its fire time.
    Scheduled,
    /// Child spawned, manifest being materialized inside the cgroup.
    UploadingFiles,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// The mutable job record. Created on submit, owned by the executor from
/// setup through cleanup, frozen after the terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub spec: JobSpec,
    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Host-side pid of the sandbox init process while alive.
    pub pid: Option<i32>,
    pub exit_code: Option<i32>,

    // Kernel handles, written during setup, cleared during cleanup.
    pub cgroup_path: Option<PathBuf>,
    pub gpu_indices: Vec<u32>,
    pub veth_host: Option<String>,
    pub veth_peer: Option<String>,
    pub ip: Option<std::net::Ipv4Addr>,

    /// Step-named failure cause when status is Failed.
    pub failure: Option<String>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            pid: None,
            exit_code: None,
            cgroup_path: None,
            gpu_indices: Vec::new(),
            veth_host: None,
            veth_peer: None,
            ip: None,
            failure: None,
        }
    }

    pub fn short_id(&self) -> String {
        short_id(&self.id)
    }
}

// ============================================================================
// 8. CONTROL-PLANE VIEWS
// ============================================================================

/// Listing row. Secret env never leaves the store; this is the only shape
/// control operations hand out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub command: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure: Option<String>,
    pub network: NetworkSelection,
    pub gpu_indices: Vec<u32>,
    /// Live cgroup readback; populated only for running jobs.
    pub usage: Option<crate::cgroup::CgroupUsage>,
}

impl JobView {
    pub fn from_job(job: &Job, usage: Option<crate::cgroup::CgroupUsage>) -> Self {
        Self {
            id: job.id,
            command: job.spec.command.clone(),
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            ended_at: job.ended_at,
            exit_code: job.exit_code,
            failure: job.failure.clone(),
            network: job.spec.network.clone(),
            gpu_indices: job.gpu_indices.clone(),
            usage,
        }
    }
}

/// Submission receipt: the only two things a caller needs synchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub initial_state: JobStatus,
}

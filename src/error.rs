// src/error.rs
//
// =============================================================================
// SANDCELL: ERROR CONTRACT (v 0.4)
// =============================================================================
//
// The failure vocabulary of the engine.
//
// Rules:
// 1. Validation and Quota surface synchronously to the submitter; the job
//    never enters Pending.
// 2. Setup errors name the step that failed and carry the OS error; the
//    partial allocation is rolled back and the job enters Failed.
// 3. A nonzero user exit is NOT an error here. It is a terminal job state
//    with the exit code preserved.
// 4. Cleanup failures are logged per step and aggregated; they never mask
//    the primary cause and never change the terminal state.

use thiserror::Error;
use uuid::Uuid;

/// The setup steps that can fail with a kernel error. Carried inside
/// `EngineError::Setup` so callers see exactly where the envelope broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    Cgroup,
    NetworkReserve,
    GpuReserve,
    Volumes,
    Workspace,
    ReadyPipe,
    Spawn,
    CgroupAttach,
    VethAttach,
    HostsFile,
    ReadySignal,
}

impl SetupStep {
    pub fn name(&self) -> &'static str {
        match self {
            SetupStep::Cgroup => "cgroup-create",
            SetupStep::NetworkReserve => "network-reserve",
            SetupStep::GpuReserve => "gpu-reserve",
            SetupStep::Volumes => "volume-resolve",
            SetupStep::Workspace => "workspace-create",
            SetupStep::ReadyPipe => "ready-pipe",
            SetupStep::Spawn => "spawn",
            SetupStep::CgroupAttach => "cgroup-attach",
            SetupStep::VethAttach => "veth-attach",
            SetupStep::HostsFile => "hosts-file",
            SetupStep::ReadySignal => "ready-signal",
        }
    }
}

impl std::fmt::Display for SetupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request: bad CIDR, reserved name, size spec, core range.
    #[error("validation: {0}")]
    Validation(String),

    /// Resource exhaustion: no GPU meeting the requirement, no free IP.
    #[error("quota: {0}")]
    Quota(String),

    /// A kernel call failed during the setup phase.
    #[error("setup step '{step}' failed: {cause}")]
    Setup { step: SetupStep, cause: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Engine-internal invariant breakage (never caused by caller input).
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn setup(step: SetupStep, cause: impl std::fmt::Display) -> Self {
        EngineError::Setup {
            step,
            cause: cause.to_string(),
        }
    }
}

// ============================================================================
// CLEANUP AGGREGATION
// ============================================================================

/// Collects per-step release failures. Cleanup always runs to the end; the
/// report is logged and attached as a secondary cause, never a primary one.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub job_id: Option<Uuid>,
    pub failures: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id: Some(job_id),
            failures: Vec::new(),
        }
    }

    /// Records one failed release step and keeps going.
    pub fn record(&mut self, step: &str, err: impl std::fmt::Display) {
        log::warn!(
            "cleanup step '{}' failed for job {}: {}",
            step,
            self.job_id.map(|id| id.to_string()).unwrap_or_default(),
            err
        );
        self.failures.push((step.to_string(), err.to_string()));
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|(step, err)| format!("{}: {}", step, err))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

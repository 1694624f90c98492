// src/upload.rs
//
// =============================================================================
// SANDCELL: UPLOAD STREAMER (v 0.4)
// =============================================================================
//
// Moves user-supplied files from the daemon into the sandbox so the writes
// are accounted to the child's cgroup, not the daemon's.
//
// Handoff: the manifest serializes to JSON in a file under the workspace
// and the child receives its path. The base64-in-env alternative is
// retained as a fallback for small batches (a primary env handoff would
// hit ARG_MAX on large uploads).
//
// Materialization happens inside the init process: chunked writes with a
// periodic fsync so a memory/io limit kills the upload promptly instead of
// letting dirty pages hide the overrun.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::core::UploadFile;

/// Chunk size for child-side writes.
pub const CHUNK_BYTES: usize = 64 * 1024;
/// fsync cadence in chunks.
pub const FSYNC_EVERY: usize = 16;
/// Largest manifest the env fallback will carry.
pub const ENV_FALLBACK_MAX: usize = 128 * 1024;

/// Manifest file name under the workspace.
pub const MANIFEST_FILE_NAME: &str = ".manifest.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadManifest {
    pub files: Vec<UploadFile>,
}

impl UploadManifest {
    pub fn new(files: Vec<UploadFile>) -> Self {
        Self { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.content.len() as u64).sum()
    }
}

// ============================================================================
// 1. PARENT SIDE: HANDOFF
// ============================================================================

/// How the child finds its manifest.
#[derive(Debug, Clone)]
pub enum ManifestHandoff {
    /// Path to the JSON file (primary).
    File(std::path::PathBuf),
    /// base64(JSON) carried in the environment (fallback).
    Env(String),
    None,
}

/// Writes the manifest under the workspace and returns the handoff the
/// parent must encode into the child environment.
pub fn stage_manifest(
    workspace: &Path,
    manifest: &UploadManifest,
) -> anyhow::Result<ManifestHandoff> {
    if manifest.is_empty() {
        return Ok(ManifestHandoff::None);
    }

    let json = serde_json::to_vec(manifest)?;
    let target = workspace.join(MANIFEST_FILE_NAME);

    match fs::write(&target, &json) {
        Ok(()) => Ok(ManifestHandoff::File(target)),
        Err(write_err) => {
            let encoded = B64.encode(&json);
            if encoded.len() <= ENV_FALLBACK_MAX {
                log::warn!(
                    "manifest file write failed ({}), falling back to env handoff",
                    write_err
                );
                Ok(ManifestHandoff::Env(encoded))
            } else {
                Err(anyhow::anyhow!(
                    "manifest write failed and batch too large for env fallback: {}",
                    write_err
                ))
            }
        }
    }
}

// ============================================================================
// 2. CHILD SIDE: LOAD + MATERIALIZE
// ============================================================================

/// Child-side decode. `file_path` and `env_b64` come from the init
/// environment; file wins when both are present.
pub fn load_manifest(
    file_path: Option<&str>,
    env_b64: Option<&str>,
) -> anyhow::Result<UploadManifest> {
    if let Some(path) = file_path {
        let raw = fs::read(path)?;
        return Ok(serde_json::from_slice(&raw)?);
    }
    if let Some(b64) = env_b64 {
        let raw = B64.decode(b64.as_bytes())?;
        return Ok(serde_json::from_slice(&raw)?);
    }
    Ok(UploadManifest::default())
}

/// Materializes every record under `root`. Runs inside the sandbox with
/// the job's cgroup limits already applied; any failure is reported as a
/// possible limit overrun because that is what it usually is.
pub fn materialize(root: &Path, manifest: &UploadManifest) -> anyhow::Result<()> {
    for record in &manifest.files {
        write_record(root, record).map_err(|e| {
            anyhow::anyhow!(
                "upload failed (possibly resource limit exceeded) at '{}': {}",
                record.path,
                e
            )
        })?;
    }
    // The staged manifest itself has no business inside the workspace.
    let _ = fs::remove_file(root.join(MANIFEST_FILE_NAME));
    Ok(())
}

fn write_record(root: &Path, record: &UploadFile) -> std::io::Result<()> {
    let target = root.join(&record.path);

    if record.is_dir {
        fs::create_dir_all(&target)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(record.mode))?;
        return Ok(());
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(&target)?;
    for (i, chunk) in record.content.chunks(CHUNK_BYTES).enumerate() {
        file.write_all(chunk)?;
        if (i + 1) % FSYNC_EVERY == 0 {
            file.sync_data()?;
        }
    }
    file.sync_data()?;
    file.set_permissions(fs::Permissions::from_mode(record.mode))?;

    if record.size > 0 && record.size != record.content.len() as u64 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "declared size {} != content length {}",
                record.size,
                record.content.len()
            ),
        ));
    }
    Ok(())
}

// tests/upload.rs
//
// Manifest handoff and child-side materialization.

use sandcell::core::UploadFile;
use sandcell::upload::{
    load_manifest, materialize, stage_manifest, ManifestHandoff, UploadManifest, CHUNK_BYTES,
};
use std::os::unix::fs::PermissionsExt;

fn file(path: &str, mode: u32, content: &[u8]) -> UploadFile {
    UploadFile {
        path: path.into(),
        mode,
        content: content.to_vec(),
        is_dir: false,
        size: content.len() as u64,
    }
}

fn dir(path: &str) -> UploadFile {
    UploadFile {
        path: path.into(),
        mode: 0o755,
        content: vec![],
        is_dir: true,
        size: 0,
    }
}

#[test]
fn stage_and_load_roundtrip_via_file() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = UploadManifest::new(vec![
        file("run.sh", 0o755, b"#!/bin/sh\necho hi\n"),
        dir("data"),
        file("data/input.txt", 0o644, b"payload"),
    ]);

    let handoff = stage_manifest(tmp.path(), &manifest).unwrap();
    let path = match handoff {
        ManifestHandoff::File(p) => p,
        other => panic!("expected file handoff, got {:?}", other),
    };

    let loaded = load_manifest(Some(path.to_str().unwrap()), None).unwrap();
    assert_eq!(loaded.files.len(), 3);
    assert_eq!(loaded.files[0].content, manifest.files[0].content);
    assert_eq!(loaded.total_bytes(), manifest.total_bytes());
}

#[test]
fn empty_manifest_stages_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let handoff = stage_manifest(tmp.path(), &UploadManifest::default()).unwrap();
    assert!(matches!(handoff, ManifestHandoff::None));
    assert!(!tmp.path().join(".manifest.json").exists());
}

#[test]
fn env_fallback_roundtrip() {
    use base64::Engine;
    let manifest = UploadManifest::new(vec![file("a.txt", 0o600, b"abc")]);
    let json = serde_json::to_vec(&manifest).unwrap();
    let b64 = base64::engine::general_purpose::STANDARD.encode(&json);

    let loaded = load_manifest(None, Some(&b64)).unwrap();
    assert_eq!(loaded.files[0].path, "a.txt");
    assert_eq!(loaded.files[0].content, b"abc".to_vec());
}

#[test]
fn materialize_writes_files_dirs_and_modes() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = UploadManifest::new(vec![
        dir("nested/deep"),
        file("nested/deep/tool.sh", 0o750, b"echo ok"),
        file("top.txt", 0o644, b"hello"),
    ]);

    materialize(tmp.path(), &manifest).unwrap();

    assert!(tmp.path().join("nested/deep").is_dir());
    let tool = tmp.path().join("nested/deep/tool.sh");
    assert_eq!(std::fs::read(&tool).unwrap(), b"echo ok");
    let mode = std::fs::metadata(&tool).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o750, "declared mode applied");
    assert_eq!(std::fs::read(tmp.path().join("top.txt")).unwrap(), b"hello");
}

#[test]
fn materialize_creates_missing_parents() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = UploadManifest::new(vec![file("a/b/c/d.txt", 0o644, b"x")]);
    materialize(tmp.path(), &manifest).unwrap();
    assert_eq!(std::fs::read(tmp.path().join("a/b/c/d.txt")).unwrap(), b"x");
}

#[test]
fn materialize_handles_multi_chunk_content() {
    let tmp = tempfile::tempdir().unwrap();
    // Three chunks plus a tail, so the chunk loop and fsync cadence run.
    let big: Vec<u8> = (0..(CHUNK_BYTES * 3 + 17)).map(|i| (i % 251) as u8).collect();
    let manifest = UploadManifest::new(vec![file("big.bin", 0o644, &big)]);

    materialize(tmp.path(), &manifest).unwrap();
    assert_eq!(std::fs::read(tmp.path().join("big.bin")).unwrap(), big);
}

#[test]
fn size_mismatch_is_an_upload_error() {
    let tmp = tempfile::tempdir().unwrap();
    let mut bad = file("lie.txt", 0o644, b"four");
    bad.size = 99;
    let err = materialize(tmp.path(), &UploadManifest::new(vec![bad]))
        .expect_err("declared size must match");
    assert!(
        err.to_string().contains("upload failed"),
        "error names the upload contract: {}",
        err
    );
}

#[test]
fn materialize_removes_staged_manifest() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = UploadManifest::new(vec![file("a.txt", 0o644, b"x")]);
    stage_manifest(tmp.path(), &manifest).unwrap();
    assert!(tmp.path().join(".manifest.json").exists());

    materialize(tmp.path(), &manifest).unwrap();
    assert!(
        !tmp.path().join(".manifest.json").exists(),
        "staging artifact must not leak into the workspace"
    );
}

// tests/volumes.rs
//
// Volume manager: directory layout, tmpfs command plumbing, naming rules.

mod common;

use common::FakePlatform;
use sandcell::config::DaemonConfig;
use sandcell::error::EngineError;
use sandcell::store::VolumeStore;
use sandcell::volumes::{VolumeKind, VolumeManager};
use std::sync::Arc;

fn manager(root: &std::path::Path) -> (VolumeManager, VolumeStore, Arc<FakePlatform>) {
    let config = Arc::new(DaemonConfig {
        volumes_root: root.join("volumes"),
        ..common::test_config(root)
    });
    let platform = FakePlatform::new();
    (
        VolumeManager::new(config, platform.clone()),
        VolumeStore::new(),
        platform,
    )
}

#[tokio::test]
async fn filesystem_volume_creates_data_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, store, platform) = manager(tmp.path());

    let vol = mgr
        .create(&store, "results", VolumeKind::Filesystem, "64MB")
        .await
        .unwrap();

    assert_eq!(vol.host_path, tmp.path().join("volumes/results/data"));
    assert!(vol.host_path.is_dir(), "data dir materialized eagerly");
    assert_eq!(vol.size_bytes, 64 * 1024 * 1024);
    assert!(
        platform.calls_matching("mount").is_empty(),
        "filesystem volumes need no mount"
    );
}

#[tokio::test]
async fn memory_volume_mounts_tmpfs_with_size() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, store, platform) = manager(tmp.path());

    mgr.create(&store, "fastscratch", VolumeKind::Memory, "8MB")
        .await
        .unwrap();

    let mounts = platform.calls_matching("mount -t tmpfs");
    assert_eq!(mounts.len(), 1, "one tmpfs mount issued");
    assert!(
        mounts[0].contains("size=8388608"),
        "size option in bytes: {}",
        mounts[0]
    );

    mgr.remove(&store, "fastscratch").await.unwrap();
    assert_eq!(platform.calls_matching("umount").len(), 1, "tmpfs unmounted");
}

#[tokio::test]
async fn volume_names_and_sizes_are_validated() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, store, _) = manager(tmp.path());

    for bad in ["", "has space", "dot.dot", "a/b"] {
        let err = mgr
            .create(&store, bad, VolumeKind::Filesystem, "1MB")
            .await
            .expect_err(bad);
        assert!(matches!(err, EngineError::Validation(_)), "'{}' -> {:?}", bad, err);
    }

    let err = mgr
        .create(&store, "ok", VolumeKind::Filesystem, "12XB")
        .await
        .expect_err("bad size unit");
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn duplicate_volume_is_already_exists() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, store, _) = manager(tmp.path());
    mgr.create(&store, "data", VolumeKind::Filesystem, "1MB").await.unwrap();
    let err = mgr
        .create(&store, "data", VolumeKind::Filesystem, "1MB")
        .await
        .expect_err("duplicate");
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn resolve_mounts_maps_names_under_workspace() {
    let tmp = tempfile::tempdir().unwrap();
    let (mgr, store, _) = manager(tmp.path());
    mgr.create(&store, "data", VolumeKind::Filesystem, "1MB").await.unwrap();

    let job = uuid::Uuid::new_v4();
    let mounts = mgr.resolve_mounts(&store, job, &["data".into()]).unwrap();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].target_rel, "volumes/data");
    assert_eq!(mounts[0].source, tmp.path().join("volumes/data/data"));
    assert_eq!(store.refcount("data"), 1, "reference taken");
}

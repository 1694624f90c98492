// tests/network.rs
//
// Network admin validation, reservation bookkeeping, kernel command
// sequences (against the scripted platform), and the hosts-file contract.

mod common;

use common::FakePlatform;
use sandcell::core::{Job, JobSpec, JobStatus, NetworkSelection};
use sandcell::error::EngineError;
use sandcell::network::NetworkManager;
use sandcell::store::Stores;
use std::net::Ipv4Addr;
use std::sync::Arc;

fn manager() -> (NetworkManager, Arc<Stores>, Arc<FakePlatform>) {
    let stores = Stores::new();
    let platform = FakePlatform::new();
    (
        NetworkManager::new(platform.clone(), stores.clone()),
        stores,
        platform,
    )
}

#[tokio::test]
async fn create_network_rejects_reserved_names_and_bad_cidrs() {
    let (mgr, _, _) = manager();

    for name in ["none", "isolated", "host", "bridge"] {
        let err = mgr.create_network(name, "10.10.0.0/24", None).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{} is reserved", name);
    }

    let err = mgr.create_network("jobs", "127.0.1.0/24", None).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "blocklisted CIDR");

    let err = mgr.create_network("jobs", "10.10.0.0", None).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "missing prefix");
}

#[tokio::test]
async fn create_network_rejects_overlap_with_registered() {
    let (mgr, _, _) = manager();
    mgr.create_network("alpha", "10.10.0.0/16", None).await.unwrap();

    let err = mgr.create_network("beta", "10.10.40.0/24", None).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "overlapping CIDR refused");

    let err = mgr.create_network("alpha", "10.50.0.0/24", None).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)), "duplicate name refused");
}

#[tokio::test]
async fn create_network_installs_bridge_nat_and_forwarding() {
    let (mgr, stores, platform) = manager();
    mgr.create_network("batch", "10.20.0.0/24", None).await.unwrap();

    assert!(
        !platform.calls_matching("link add name sc-batch type bridge").is_empty(),
        "bridge created"
    );
    assert!(
        !platform.calls_matching("addr add 10.20.0.1/24 dev sc-batch").is_empty(),
        "gateway = first host address"
    );
    assert!(
        !platform.calls_matching("MASQUERADE").is_empty(),
        "NAT installed on the CIDR"
    );
    assert!(
        !platform.calls_matching("-A FORWARD -i sc-batch -j ACCEPT").is_empty(),
        "forwarding accepted on the bridge"
    );
    assert_eq!(stores.networks.list().len(), 1);
}

#[tokio::test]
async fn bridge_name_respects_ifnamsiz() {
    let (mgr, stores, _) = manager();
    mgr.create_network("averylongnetworkname", "10.30.0.0/24", None)
        .await
        .unwrap();
    let (_, _, bridge) = stores.networks.list().pop().unwrap();
    assert!(bridge.len() <= 15, "bridge '{}' exceeds IFNAMSIZ", bridge);
    assert!(bridge.starts_with("sc-"));
}

#[tokio::test]
async fn failed_bridge_setup_rolls_back_the_record() {
    let (mgr, stores, platform) = manager();
    platform.fail_matching("type bridge", "RTNETLINK answers: Operation not permitted");

    let err = mgr.create_network("batch", "10.20.0.0/24", None).await.unwrap_err();
    assert!(matches!(err, EngineError::Setup { .. }), "setup error surfaces");
    assert!(stores.networks.list().is_empty(), "record rolled back");
}

#[tokio::test]
async fn reserve_allocates_ip_and_names_without_interfaces() {
    let (mgr, stores, platform) = manager();
    mgr.create_network("batch", "10.20.0.0/24", None).await.unwrap();
    platform.calls.lock().unwrap().clear();

    let job = uuid::Uuid::new_v4();
    let att = mgr
        .reserve(&job, &NetworkSelection::Bridged("batch".into()))
        .unwrap()
        .expect("bridged job gets an attachment");

    assert!(att.veth_host.starts_with("veth-h-") && att.veth_host.len() == 15);
    assert!(att.veth_peer.starts_with("veth-p-") && att.veth_peer.len() == 15);
    assert_eq!(att.gateway, Ipv4Addr::new(10, 20, 0, 1));
    assert_eq!(stores.networks.attachment_count(), 1);
    assert!(
        platform.calls.lock().unwrap().is_empty(),
        "reservation must not touch the kernel"
    );
}

#[tokio::test]
async fn isolated_mode_uses_fixed_point_to_point() {
    let (mgr, _, _) = manager();
    let job = uuid::Uuid::new_v4();
    let att = mgr
        .reserve(&job, &NetworkSelection::Isolated)
        .unwrap()
        .expect("attachment");
    assert!(att.isolated);
    assert_eq!(att.ip, Ipv4Addr::new(10, 255, 255, 2));
    assert_eq!(att.gateway, Ipv4Addr::new(10, 255, 255, 1));
    assert_eq!(att.prefix, 30);
}

#[tokio::test]
async fn none_mode_reserves_nothing() {
    let (mgr, stores, _) = manager();
    let job = uuid::Uuid::new_v4();
    assert!(mgr.reserve(&job, &NetworkSelection::None).unwrap().is_none());
    assert_eq!(stores.networks.attachment_count(), 0);
}

#[tokio::test]
async fn release_returns_ip_and_tolerates_missing_veth() {
    let (mgr, stores, platform) = manager();
    mgr.create_network("batch", "10.20.0.0/30", None).await.unwrap();

    let job = uuid::Uuid::new_v4();
    let att = mgr
        .reserve(&job, &NetworkSelection::Bridged("batch".into()))
        .unwrap()
        .unwrap();

    platform.fail_matching("link del", "Cannot find device \"veth-h\"");
    let mut report = sandcell::error::CleanupReport::new(job);
    let taken = stores.networks.detach(&job).expect("attachment present");
    mgr.release_interfaces(&taken, &mut report).await;
    mgr.release_ip(&taken, &mut report);

    assert!(report.is_clean(), "missing veth is not a failure: {}", report.summary());
    let record = stores.networks.get("batch").unwrap();
    assert_eq!(record.pool.lock().unwrap().allocated_count(), 0, "IP returned");

    // Releasing again finds nothing to do.
    assert!(stores.networks.detach(&job).is_none());
    // The pool stays consistent: the same address allocates again.
    let again = mgr
        .reserve(&uuid::Uuid::new_v4(), &NetworkSelection::Bridged("batch".into()))
        .unwrap()
        .unwrap();
    assert_eq!(again.ip, att.ip);
}

// ----------------------------------------------------------------------
// Hosts-file contract
// ----------------------------------------------------------------------

#[tokio::test]
async fn hosts_file_lists_running_peers_on_same_network() {
    let (mgr, stores, _) = manager();
    mgr.create_network("batch", "10.20.0.0/24", None).await.unwrap();

    // Job A: running and attached.
    let mut job_a = Job::new(JobSpec {
        command: "/bin/sleep".into(),
        network: NetworkSelection::Bridged("batch".into()),
        ..Default::default()
    });
    job_a.status = JobStatus::Running;
    stores.jobs.insert(job_a.clone()).unwrap();
    let att_a = mgr
        .reserve(&job_a.id, &NetworkSelection::Bridged("batch".into()))
        .unwrap()
        .unwrap();

    // Job B: setting up now; its hosts file must list A.
    let job_b = uuid::Uuid::new_v4();
    let att_b = mgr
        .reserve(&job_b, &NetworkSelection::Bridged("batch".into()))
        .unwrap()
        .unwrap();

    let hosts = mgr.render_hosts(&att_b);
    assert!(hosts.starts_with("127.0.0.1 localhost\n"), "loopback first");
    assert!(
        hosts.contains(&format!("{} {}", att_b.ip, att_b.hostname)),
        "own entry present"
    );
    assert!(
        hosts.contains(&format!("{} {}", att_a.ip, att_a.hostname)),
        "running peer listed:\n{}",
        hosts
    );
}

#[tokio::test]
async fn hosts_file_ignores_other_networks_and_isolated_jobs() {
    let (mgr, stores, _) = manager();
    mgr.create_network("batch", "10.20.0.0/24", None).await.unwrap();
    mgr.create_network("other", "10.21.0.0/24", None).await.unwrap();

    let mut foreign = Job::new(JobSpec {
        command: "/bin/sleep".into(),
        network: NetworkSelection::Bridged("other".into()),
        ..Default::default()
    });
    foreign.status = JobStatus::Running;
    stores.jobs.insert(foreign.clone()).unwrap();
    let foreign_att = mgr
        .reserve(&foreign.id, &NetworkSelection::Bridged("other".into()))
        .unwrap()
        .unwrap();

    let me = uuid::Uuid::new_v4();
    let att = mgr
        .reserve(&me, &NetworkSelection::Bridged("batch".into()))
        .unwrap()
        .unwrap();
    let hosts = mgr.render_hosts(&att);
    assert!(
        !hosts.contains(&foreign_att.hostname),
        "peer on another bridge must not leak into hosts:\n{}",
        hosts
    );

    let iso = mgr.reserve(&uuid::Uuid::new_v4(), &NetworkSelection::Isolated).unwrap().unwrap();
    let hosts = mgr.render_hosts(&iso);
    assert_eq!(
        hosts.lines().count(),
        2,
        "isolated job sees only localhost and itself:\n{}",
        hosts
    );
}

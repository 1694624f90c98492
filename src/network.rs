// src/network.rs
//
// =============================================================================
// SANDCELL: NETWORK MANAGER (v 0.4)
// =============================================================================
//
// Bridge and veth plumbing for job connectivity.
//
// Responsibilities:
// 1. Bridge lifecycle: create on first use, gateway at the first host
//    address, NAT + forwarding, DROP pairs against every other engine
//    bridge (cross-network isolation).
// 2. Per-job attach: veth pair, host side on the bridge, peer moved into
//    the child netns and configured there via nsenter.
// 3. Isolated mode: point-to-point /30 with NAT, no peers.
// 4. Reservation is split from interface creation: an IP and veth names
//    are reserved before the child exists; interfaces are created only
//    after the pid is known.
//
// Every kernel interaction goes through the platform facade (`ip`,
// `iptables`, `tc`, `sysctl`), so the whole module runs against a fake in
// tests.

use std::net::Ipv4Addr;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::{job_hostname, short_id, NetworkSelection};
use crate::error::{CleanupReport, EngineError, SetupStep};
use crate::platform::{run_checked, Platform};
use crate::store::{NetworkAttachment, NetworkRecord, Stores};

pub mod hosts;
pub mod ippool;
pub mod shaping;

use ippool::{CidrV4, IpPool};
use shaping::BandwidthLimits;

/// Prefix shared by every bridge this engine owns; cross-network isolation
/// enumerates interfaces by it.
pub const BRIDGE_PREFIX: &str = "sc-";

/// Isolated mode: fixed point-to-point /30.
const ISOLATED_HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 255, 255, 1);
const ISOLATED_PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 255, 255, 2);
const ISOLATED_PREFIX: u8 = 30;

pub struct NetworkManager {
    platform: Arc<dyn Platform>,
    stores: Arc<Stores>,
}

impl NetworkManager {
    pub fn new(platform: Arc<dyn Platform>, stores: Arc<Stores>) -> Self {
        Self { platform, stores }
    }

    fn bridge_name(name: &str) -> String {
        // IFNAMSIZ caps interface names at 15 visible chars.
        let mut b = format!("{}{}", BRIDGE_PREFIX, name);
        b.truncate(15);
        b
    }

    pub fn veth_names(job_id: &Uuid) -> (String, String) {
        let id8 = short_id(job_id);
        (format!("veth-h-{}", id8), format!("veth-p-{}", id8))
    }

    // ========================================================================
    // 1. BRIDGE LIFECYCLE (admin operations)
    // ========================================================================

    /// Creates a named network: validated CIDR, bridge, NAT, forwarding,
    /// isolation from every other engine bridge.
    pub async fn create_network(
        &self,
        name: &str,
        cidr_str: &str,
        bandwidth: Option<BandwidthLimits>,
    ) -> Result<(), EngineError> {
        if NetworkSelection::is_reserved_name(name) {
            return Err(EngineError::Validation(format!(
                "'{}' is a reserved network name",
                name
            )));
        }
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(EngineError::Validation(format!(
                "network name '{}' must be alphanumeric/dash",
                name
            )));
        }

        let cidr = CidrV4::parse(cidr_str)?;
        cidr.check_blocklist()?;
        for existing in self.stores.networks.cidrs() {
            if cidr.overlaps(&existing) {
                return Err(EngineError::Validation(format!(
                    "CIDR {} overlaps registered network {}",
                    cidr, existing
                )));
            }
        }

        let bridge = Self::bridge_name(name);

        // Reserve the record first so a concurrent create of the same name
        // loses fast; kernel work happens outside the store lock.
        let record = self.stores.networks.insert(NetworkRecord {
            name: name.to_string(),
            bridge: bridge.clone(),
            pool: std::sync::Mutex::new(IpPool::new(cidr)),
            bandwidth,
        })?;

        if let Err(e) = self.materialize_bridge(&record, cidr).await {
            // Roll the record back; the bridge may be half-built, removal
            // tolerates that.
            let _ = self.stores.networks.remove(name);
            let _ = self.teardown_bridge_best_effort(&bridge, cidr).await;
            return Err(EngineError::setup(SetupStep::NetworkReserve, e));
        }

        log::info!("network '{}' up: bridge {} gw {}", name, bridge, cidr.gateway());
        Ok(())
    }

    async fn materialize_bridge(
        &self,
        record: &NetworkRecord,
        cidr: CidrV4,
    ) -> anyhow::Result<()> {
        let p = &self.platform;
        let bridge = record.bridge.as_str();
        let gw = format!("{}/{}", cidr.gateway(), cidr.prefix);
        let cidr_s = cidr.to_string();

        run_checked(p.as_ref(), "ip", &["link", "add", "name", bridge, "type", "bridge"]).await?;
        run_checked(p.as_ref(), "ip", &["addr", "add", &gw, "dev", bridge]).await?;
        run_checked(p.as_ref(), "ip", &["link", "set", bridge, "up"]).await?;
        run_checked(p.as_ref(), "sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;

        // NAT for the whole CIDR leaving through anything but the bridge.
        run_checked(
            p.as_ref(),
            "iptables",
            &[
                "-t", "nat", "-A", "POSTROUTING", "-s", &cidr_s, "!", "-o", bridge, "-j",
                "MASQUERADE",
            ],
        )
        .await?;
        run_checked(p.as_ref(), "iptables", &["-A", "FORWARD", "-i", bridge, "-j", "ACCEPT"])
            .await?;
        run_checked(p.as_ref(), "iptables", &["-A", "FORWARD", "-o", bridge, "-j", "ACCEPT"])
            .await?;

        // Cross-network isolation: DROP pairs against every other engine
        // bridge currently present. Quadratic in bridge count; n stays
        // small on a single node.
        for other in self.list_engine_bridges().await? {
            if other == bridge {
                continue;
            }
            run_checked(
                p.as_ref(),
                "iptables",
                &["-I", "FORWARD", "-i", bridge, "-o", &other, "-j", "DROP"],
            )
            .await?;
            run_checked(
                p.as_ref(),
                "iptables",
                &["-I", "FORWARD", "-i", &other, "-o", bridge, "-j", "DROP"],
            )
            .await?;
        }

        Ok(())
    }

    async fn list_engine_bridges(&self) -> anyhow::Result<Vec<String>> {
        let out = run_checked(
            self.platform.as_ref(),
            "ip",
            &["-o", "link", "show", "type", "bridge"],
        )
        .await?;
        // Lines look like: "4: sc-batch: <BROADCAST,...> mtu 1500 ..."
        Ok(out
            .lines()
            .filter_map(|l| l.split(':').nth(1))
            .filter_map(|name| name.trim().split('@').next().map(str::to_string))
            .filter(|name| name.starts_with(BRIDGE_PREFIX))
            .collect())
    }

    /// Removes a network with no attached jobs. Kernel teardown is
    /// tolerant; the record removal is the authoritative gate.
    pub async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        let record = self.stores.networks.remove(name)?;
        let cidr = record.cidr();
        self.teardown_bridge_best_effort(&record.bridge, cidr).await;
        log::info!("network '{}' removed", name);
        Ok(())
    }

    async fn teardown_bridge_best_effort(&self, bridge: &str, cidr: CidrV4) {
        let p = self.platform.as_ref();
        let cidr_s = cidr.to_string();
        let rules: Vec<Vec<&str>> = vec![
            vec![
                "-t", "nat", "-D", "POSTROUTING", "-s", &cidr_s, "!", "-o", bridge, "-j",
                "MASQUERADE",
            ],
            vec!["-D", "FORWARD", "-i", bridge, "-j", "ACCEPT"],
            vec!["-D", "FORWARD", "-o", bridge, "-j", "ACCEPT"],
        ];
        for rule in rules {
            if let Ok(out) = p.run("iptables", &rule).await {
                if !out.success() {
                    log::debug!("iptables -D said: {}", out.stderr.trim());
                }
            }
        }
        if let Ok(out) = p.run("ip", &["link", "del", bridge]).await {
            if !out.success() && !out.stderr.contains("Cannot find device") {
                log::warn!("bridge {} removal said: {}", bridge, out.stderr.trim());
            }
        }
    }

    // ========================================================================
    // 2. PER-JOB RESERVATION (setup step: no interfaces yet)
    // ========================================================================

    /// Reserves an IP and veth names for the job. Interface creation waits
    /// until the child pid exists (`attach`).
    pub fn reserve(
        &self,
        job_id: &Uuid,
        selection: &NetworkSelection,
    ) -> Result<Option<NetworkAttachment>, EngineError> {
        let (veth_host, veth_peer) = Self::veth_names(job_id);
        let hostname = job_hostname(job_id);

        match selection {
            NetworkSelection::None => Ok(None),

            NetworkSelection::Isolated => {
                let att = NetworkAttachment {
                    job_id: *job_id,
                    network: "isolated".to_string(),
                    ip: ISOLATED_PEER_IP,
                    prefix: ISOLATED_PREFIX,
                    gateway: ISOLATED_HOST_IP,
                    veth_host,
                    veth_peer,
                    hostname,
                    isolated: true,
                };
                self.stores.networks.attach(att.clone());
                Ok(Some(att))
            }

            NetworkSelection::Bridged(name) => {
                let record = self.stores.networks.get(name)?;
                let (ip, prefix, gateway) = {
                    let mut pool = record.pool.lock().unwrap();
                    let ip = pool.allocate()?;
                    (ip, pool.cidr().prefix, pool.cidr().gateway())
                };
                let att = NetworkAttachment {
                    job_id: *job_id,
                    network: name.clone(),
                    ip,
                    prefix,
                    gateway,
                    veth_host,
                    veth_peer,
                    hostname,
                    isolated: false,
                };
                self.stores.networks.attach(att.clone());
                Ok(Some(att))
            }
        }
    }

    // ========================================================================
    // 3. PER-JOB ATTACH (post-fork: pid known)
    // ========================================================================

    /// Creates the veth pair, puts the host side on the bridge (or NATs it
    /// in isolated mode), moves the peer into the child's netns, and
    /// configures address + default route + loopback in there.
    pub async fn attach(&self, att: &NetworkAttachment, child_pid: i32) -> Result<(), EngineError> {
        self.attach_inner(att, child_pid)
            .await
            .map_err(|e| EngineError::setup(SetupStep::VethAttach, e))
    }

    async fn attach_inner(&self, att: &NetworkAttachment, child_pid: i32) -> anyhow::Result<()> {
        let p = self.platform.as_ref();
        let host = att.veth_host.as_str();
        let peer = att.veth_peer.as_str();
        let pid = child_pid.to_string();

        run_checked(
            p,
            "ip",
            &["link", "add", host, "type", "veth", "peer", "name", peer],
        )
        .await?;

        if att.isolated {
            // Host side owns the gateway address of the /30 and NATs the
            // single peer address.
            let gw = format!("{}/{}", att.gateway, att.prefix);
            run_checked(p, "ip", &["addr", "add", &gw, "dev", host]).await?;
            let peer_net = format!("{}/32", att.ip);
            run_checked(
                p,
                "iptables",
                &["-t", "nat", "-A", "POSTROUTING", "-s", &peer_net, "-j", "MASQUERADE"],
            )
            .await?;
            run_checked(p, "iptables", &["-A", "FORWARD", "-i", host, "-j", "ACCEPT"]).await?;
            run_checked(p, "iptables", &["-A", "FORWARD", "-o", host, "-j", "ACCEPT"]).await?;
        } else {
            let record = self.stores.networks.get(&att.network)?;
            run_checked(p, "ip", &["link", "set", host, "master", &record.bridge]).await?;
        }

        run_checked(p, "ip", &["link", "set", host, "up"]).await?;
        run_checked(p, "ip", &["link", "set", peer, "netns", &pid]).await?;

        // Configure the peer from inside the child's netns.
        let addr = format!("{}/{}", att.ip, att.prefix);
        let gw = att.gateway.to_string();
        self.in_netns(&pid, &["ip", "addr", "add", &addr, "dev", peer]).await?;
        self.in_netns(&pid, &["ip", "link", "set", peer, "up"]).await?;
        self.in_netns(&pid, &["ip", "link", "set", "lo", "up"]).await?;
        self.in_netns(&pid, &["ip", "route", "add", "default", "via", &gw]).await?;

        // Shaping is a per-network option applied to each host veth.
        if !att.isolated {
            let record = self.stores.networks.get(&att.network)?;
            if let Some(limits) = record.bandwidth {
                shaping::apply(&self.platform, host, &limits).await?;
            }
        }

        log::info!(
            "job {} attached: {} <-> {} ({} via {})",
            att.job_id,
            host,
            peer,
            att.ip,
            att.gateway
        );
        Ok(())
    }

    async fn in_netns(&self, pid: &str, cmd: &[&str]) -> anyhow::Result<()> {
        let mut args = vec!["-t", pid, "-n", "--"];
        args.extend_from_slice(cmd);
        run_checked(self.platform.as_ref(), "nsenter", &args).await?;
        Ok(())
    }

    // ========================================================================
    // 4. HOSTS FILE
    // ========================================================================

    /// Renders the hosts file for a job at its setup instant: itself plus
    /// every peer currently running on the same bridge network.
    pub fn render_hosts(&self, att: &NetworkAttachment) -> String {
        let peers: Vec<hosts::PeerEntry> = if att.isolated {
            Vec::new()
        } else {
            self.stores
                .jobs
                .running_on_network(&att.network)
                .iter()
                .filter_map(|peer| {
                    let patt = self.stores.networks.attachment(&peer.id)?;
                    Some((patt.ip, patt.hostname))
                })
                .collect()
        };
        hosts::render(att.ip, &att.hostname, &peers)
    }

    // ========================================================================
    // 5. PER-JOB RELEASE (cleanup steps 2-4 and 7)
    // ========================================================================

    /// Host-side interface unwind: shaping, host veth (the kernel reaps
    /// the peer with the namespace), then per-job iptables. The caller has
    /// already taken the attachment out of the store (take-once), so this
    /// can never run twice for the same handles.
    pub async fn release_interfaces(&self, att: &NetworkAttachment, report: &mut CleanupReport) {
        let p = self.platform.as_ref();
        let host = att.veth_host.as_str();

        if let Err(e) = shaping::remove(&self.platform, host).await {
            report.record("tc-remove", e);
        }

        match p.run("ip", &["link", "del", host]).await {
            Ok(out) if !out.success() && !out.stderr.contains("Cannot find device") => {
                report.record("veth-delete", out.stderr.trim());
            }
            Err(e) => report.record("veth-delete", e),
            _ => {}
        }

        // Per-job iptables exist in isolated mode only; bridged jobs share
        // the network-level rules.
        if att.isolated {
            let peer_net = format!("{}/32", att.ip);
            let rules: Vec<Vec<&str>> = vec![
                vec!["-t", "nat", "-D", "POSTROUTING", "-s", &peer_net, "-j", "MASQUERADE"],
                vec!["-D", "FORWARD", "-i", host, "-j", "ACCEPT"],
                vec!["-D", "FORWARD", "-o", host, "-j", "ACCEPT"],
            ];
            for rule in rules {
                if let Ok(out) = p.run("iptables", &rule).await {
                    if !out.success() {
                        log::debug!("iptables -D said: {}", out.stderr.trim());
                    }
                }
            }
        }
    }

    /// The address goes back to its pool. Isolated attachments use fixed
    /// addresses and have nothing to return.
    pub fn release_ip(&self, att: &NetworkAttachment, report: &mut CleanupReport) {
        if att.isolated {
            return;
        }
        match self.stores.networks.get(&att.network) {
            Ok(record) => {
                if let Err(e) = record.pool.lock().unwrap().release(att.ip) {
                    report.record("ip-release", e);
                }
            }
            Err(e) => report.record("ip-release", e),
        }
    }
}

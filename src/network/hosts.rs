// src/network/hosts.rs
//
// =============================================================================
// SANDCELL: IN-NETWORK NAME RESOLUTION (v 0.4)
// =============================================================================
//
// Generates the hosts file a job sees at /etc/hosts: loopback, its own
// name, and one line per running peer on the same bridge network.
//
// Regeneration is best-effort and point-in-time: a job's file lists the
// peers that were Running at its setup instant; later arrivals do not
// rewrite already-mounted files.

use std::net::Ipv4Addr;

/// (ip, hostname) of one peer.
pub type PeerEntry = (Ipv4Addr, String);

pub fn render(own_ip: Ipv4Addr, own_hostname: &str, peers: &[PeerEntry]) -> String {
    let mut out = String::with_capacity(64 + peers.len() * 32);
    out.push_str("127.0.0.1 localhost\n");
    out.push_str(&format!("{} {}\n", own_ip, own_hostname));
    for (ip, name) in peers {
        if name != own_hostname {
            out.push_str(&format!("{} {}\n", ip, name));
        }
    }
    out
}

/// Filename the parent writes under the workspace; the init process
/// bind-mounts it over the sandbox's /etc/hosts.
pub const HOSTS_FILE_NAME: &str = ".hosts";

// src/network/shaping.rs
//
// =============================================================================
// SANDCELL: BANDWIDTH SHAPING (v 0.4)
// =============================================================================
//
// Optional per-network traffic limits, applied to each job's host-side
// veth at attach time.
//
// Egress: HTB root qdisc with a single class at the configured rate.
// Ingress: ingress qdisc with a policing filter.
//
// Removal deletes both qdiscs and tolerates "Cannot find device" (the
// kernel may have already torn the veth down with the namespace).

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::platform::{run_checked, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthLimits {
    pub egress_bps: u64,
    pub ingress_bps: u64,
    pub burst_bytes: u64,
}

pub async fn apply(
    platform: &Arc<dyn Platform>,
    veth: &str,
    limits: &BandwidthLimits,
) -> anyhow::Result<()> {
    let p = platform.as_ref();

    if limits.egress_bps > 0 {
        let rate = format!("{}bit", limits.egress_bps * 8);
        let burst = format!("{}b", limits.burst_bytes.max(1600));
        run_checked(
            p,
            "tc",
            &[
                "qdisc", "add", "dev", veth, "root", "handle", "1:", "htb", "default", "10",
            ],
        )
        .await?;
        run_checked(
            p,
            "tc",
            &[
                "class", "add", "dev", veth, "parent", "1:", "classid", "1:10", "htb", "rate",
                &rate, "burst", &burst,
            ],
        )
        .await?;
    }

    if limits.ingress_bps > 0 {
        let rate = format!("{}bit", limits.ingress_bps * 8);
        let burst = format!("{}b", limits.burst_bytes.max(1600));
        run_checked(
            p,
            "tc",
            &["qdisc", "add", "dev", veth, "handle", "ffff:", "ingress"],
        )
        .await?;
        run_checked(
            p,
            "tc",
            &[
                "filter", "add", "dev", veth, "parent", "ffff:", "protocol", "ip", "u32", "match",
                "u32", "0", "0", "police", "rate", &rate, "burst", &burst, "drop", "flowid", ":1",
            ],
        )
        .await?;
    }

    log::debug!("shaping active on {}", veth);
    Ok(())
}

/// Best-effort removal; a veth the kernel already reclaimed is success.
pub async fn remove(platform: &Arc<dyn Platform>, veth: &str) -> anyhow::Result<()> {
    for args in [
        ["qdisc", "del", "dev", veth, "root"],
        ["qdisc", "del", "dev", veth, "ingress"],
    ] {
        let out = platform.run("tc", &args).await?;
        if !out.success() && !is_absent(&out.stderr) {
            log::warn!("tc removal on {} said: {}", veth, out.stderr.trim());
        }
    }
    Ok(())
}

fn is_absent(stderr: &str) -> bool {
    stderr.contains("Cannot find device")
        || stderr.contains("Invalid handle")
        || stderr.contains("No such file")
}

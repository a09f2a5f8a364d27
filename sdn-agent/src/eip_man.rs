// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Elastic-IP egress for VPC guests.
//!
//! The EIP bridge carries the public side of every bound elastic IP.
//! For each VPC subnet with a bound EIP the manager keeps a patch-port
//! pair joining the EIP bridge to the integration bridge, and publishes
//! 1:1 NAT plus a local ARP responder under the `eipman` label. Runs on
//! its own periodic loop, reading descriptors directly, so it needs no
//! coupling to the watcher.

use crate::agent::Agent;
use crate::flows;
use crate::guest::Desc;
use crate::port_cache;
use ovs_utils::flow::Flow;
use ovs_utils::ip::Ip;
use ovs_utils::vsctl::Vsctl;
use slog::{debug, info, o, warn, Logger};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const WHO_EIPMAN: &str = "eipman";

const EIP_MAN_PERIOD: Duration = Duration::from_secs(59);

#[derive(Debug, Clone, PartialEq, Eq)]
struct EipRecord {
    vm_ip: Ipv4Addr,
    eip: Ipv4Addr,
    net_id: String,
}

/// Patch-port name on the EIP bridge for one subnet; the peer gets a
/// `-p` suffix and sits on the integration bridge.
fn patch_name(net_id: &str) -> String {
    let short: String = net_id.chars().filter(|c| *c != '-').take(9).collect();
    format!("ev-{}", short)
}

/// A stable, locally-administered MAC for an elastic IP's ARP
/// responder.
fn eip_mac(eip: Ipv4Addr) -> macaddr::MacAddr6 {
    let [a, b, c, d] = eip.octets();
    macaddr::MacAddr6::new(0x0e, 0x00, a, b, c, d)
}

pub struct EipMan {
    log: Logger,
    agent: Arc<Agent>,
}

impl EipMan {
    pub fn start(log: &Logger, agent: Arc<Agent>) {
        let eip_man =
            EipMan { log: log.new(o!("component" => "EipMan")), agent };
        let mut shutdown = eip_man.agent.shutdown_rx();
        tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(EIP_MAN_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!(eip_man.log, "shutting down");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                eip_man.do_sync().await;
            }
        });
    }

    async fn do_sync(&self) {
        let config = &self.agent.config;
        let bridge = &config.ovn_eip_bridge;
        if let Err(err) = Vsctl::add_bridge(bridge).await {
            warn!(self.log, "failed to ensure eip bridge"; "err" => %err);
            return;
        }

        let records = self.scan_eips();
        let mut flows: Vec<Flow> = Vec::new();
        let mut keep: HashSet<String> = HashSet::new();

        for record in &records {
            let local = patch_name(&record.net_id);
            let peer = format!("{}-p", local);
            if let Err(err) = Vsctl::add_patch_pair(
                bridge,
                &local,
                &config.ovn_integration_bridge,
                &peer,
            )
            .await
            {
                warn!(self.log, "failed to ensure eip patch pair";
                    "port" => &local, "err" => %err);
                continue;
            }
            keep.insert(local.clone());

            match port_cache::dump_port(bridge, &local).await {
                Ok(Some(port_no)) => {
                    flows.extend(flows::nat_flows(
                        record.vm_ip,
                        record.eip,
                        &eip_mac(record.eip),
                        port_no,
                    ));
                }
                Ok(None) => {
                    debug!(self.log, "eip patch port has no ofport yet";
                        "port" => &local);
                }
                Err(err) => {
                    warn!(self.log, "eip patch port lookup failed";
                        "port" => &local, "err" => %err);
                }
            }
        }

        self.cleanup_patch_ports(bridge, &keep).await;

        let flow_man = self.agent.get_flow_man(bridge);
        if let Err(err) = flow_man.update_flows(WHO_EIPMAN, flows).await {
            warn!(self.log, "failed to publish eip flows"; "err" => %err);
        }
    }

    /// Remove `ev-*` patch ports no EIP wants anymore. A name with a
    /// live kernel link is skipped: it is not our patch port but a veth
    /// some VM just brought up under a colliding name.
    async fn cleanup_patch_ports(&self, bridge: &str, keep: &HashSet<String>) {
        let ports = match Vsctl::list_ports(bridge).await {
            Ok(ports) => ports,
            Err(err) => {
                warn!(self.log, "list-ports failed"; "err" => %err);
                return;
            }
        };
        for port in ports {
            if !port.starts_with("ev-") || keep.contains(&port) {
                continue;
            }
            if Ip::link_exists(&port).await {
                continue;
            }
            info!(self.log, "removing obsolete eip patch pair"; "port" => &port);
            let _ = Vsctl::del_port(bridge, &port).await;
            let _ = Vsctl::del_port(
                &self.agent.config.ovn_integration_bridge,
                &format!("{}-p", port),
            )
            .await;
            port_cache::invalidate(bridge, &port);
        }
    }

    fn scan_eips(&self) -> Vec<EipRecord> {
        let mut records = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.agent.config.servers_path) else {
            return records;
        };
        for entry in entries.flatten() {
            let desc_path = entry.path().join("desc");
            let Ok(contents) = std::fs::read_to_string(&desc_path) else { continue };
            let Ok(desc) = serde_json::from_str::<Desc>(&contents) else { continue };
            for nic in &desc.nics {
                let (Some(eip), Some(net_id)) = (nic.eip, &nic.net_id) else {
                    continue;
                };
                records.push(EipRecord { vm_ip: nic.ip, eip, net_id: net_id.clone() });
            }
        }
        records.sort_by_key(|r| r.eip);
        records
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_patch_name_fits_interface_limits() {
        let name = patch_name("a1b2c3d4-e5f6-7890-abcd-ef0123456789");
        assert_eq!(name, "ev-a1b2c3d4e");
        assert!(format!("{}-p", name).len() <= 15);
    }

    #[test]
    fn test_eip_mac_is_stable_and_local() {
        let mac = eip_mac("1.2.3.4".parse().unwrap());
        assert_eq!(mac, eip_mac("1.2.3.4".parse().unwrap()));
        assert_ne!(mac, eip_mac("1.2.3.5".parse().unwrap()));
        // Locally administered, unicast.
        assert_eq!(mac.as_bytes()[0] & 0x03, 0x02);
    }
}

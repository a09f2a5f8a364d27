// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Removal of leftover guest ports.
//!
//! A crashed hypervisor process can leave its veth/tun ports attached
//! to a bridge forever. The janitor periodically compares each managed
//! bridge's ports against the union of host uplinks and every
//! descriptor's wanted interfaces, and detaches the veth/tun ports
//! nobody wants. Physical interfaces and patch ports are never touched.

use crate::agent::Agent;
use crate::guest::Desc;
use ovs_utils::ip::Ip;
use ovs_utils::vsctl::Vsctl;
use slog::{info, o, warn, Logger};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const JANITOR_PERIOD: Duration = Duration::from_secs(127);

pub struct IfaceJanitor {
    log: Logger,
    agent: Arc<Agent>,
}

impl IfaceJanitor {
    pub fn start(log: &Logger, agent: Arc<Agent>) {
        let janitor =
            IfaceJanitor { log: log.new(o!("component" => "IfaceJanitor")), agent };
        let mut shutdown = janitor.agent.shutdown_rx();
        tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!(janitor.log, "shutting down");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                janitor.do_sweep().await;
            }
        });
    }

    async fn do_sweep(&self) {
        let wanted = self.wanted_ifaces();
        for network in &self.agent.config.networks {
            self.sweep_bridge(&network.bridge, &wanted).await;
        }
    }

    async fn sweep_bridge(&self, bridge: &str, wanted: &HashSet<String>) {
        let ports = match Vsctl::list_ports(bridge).await {
            Ok(ports) => ports,
            Err(err) => {
                warn!(self.log, "list-ports failed";
                    "bridge" => bridge.to_string(), "err" => %err);
                return;
            }
        };
        for port in ports {
            if wanted.contains(&port) {
                continue;
            }
            // Only ever remove guest-style links; anything whose kind we
            // cannot establish stays.
            let kind = match Ip::link_kind(&port).await {
                Ok(Some(kind)) => kind,
                Ok(None) | Err(_) => continue,
            };
            if kind != "veth" && kind != "tun" && kind != "tap" {
                continue;
            }
            info!(self.log, "removing leftover guest port";
                "bridge" => bridge.to_string(), "port" => &port, "kind" => kind);
            if let Err(err) = Vsctl::del_port(bridge, &port).await {
                warn!(self.log, "failed to remove port"; "port" => &port, "err" => %err);
            }
            crate::port_cache::invalidate(bridge, &port);
        }
    }

    /// Host uplinks plus every interface any descriptor declares,
    /// whether or not its guest currently runs.
    fn wanted_ifaces(&self) -> HashSet<String> {
        let mut wanted: HashSet<String> = self
            .agent
            .config
            .networks
            .iter()
            .map(|n| n.ifname.clone())
            .collect();

        let Ok(entries) = std::fs::read_dir(&self.agent.config.servers_path) else {
            return wanted;
        };
        for entry in entries.flatten() {
            let desc_path = entry.path().join("desc");
            let Ok(contents) = std::fs::read_to_string(&desc_path) else { continue };
            let Ok(desc) = serde_json::from_str::<Desc>(&contents) else { continue };
            for nic in &desc.nics {
                wanted.insert(nic.ifname.clone());
            }
        }
        wanted
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VPC (OVN) plumbing on the host.
//!
//! Keeps the integration and mapped bridges alive, joins them with a
//! patch-port pair, assigns the host's distributed-gateway address to
//! the mapped bridge, and installs the kernel-side MASQUERADE and
//! Geneve fast-path rules. The flows on the integration bridge itself
//! belong to ovn-controller and are never touched here; the mapped
//! bridge's patch port gets a drop rule under its own port-name label
//! until traffic is meant to flow.

use crate::agent::Agent;
use crate::config::Config;
use crate::flows;
use crate::port_cache;
use ovs_utils::ip::Ip;
use ovs_utils::iptables::Iptables;
use ovs_utils::vsctl::Vsctl;
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;

const OVN_MAN_PERIOD: Duration = Duration::from_secs(61);

/// The patch port on the mapped bridge toward the integration bridge.
fn mapped_patch_port(config: &Config) -> String {
    format!("mapped-{}", config.ovn_integration_bridge)
}

/// Its peer on the integration bridge.
fn integration_patch_port(config: &Config) -> String {
    format!("{}-mapped", config.ovn_integration_bridge)
}

pub struct OvnMan {
    log: Logger,
    agent: Arc<Agent>,
}

impl OvnMan {
    pub fn start(log: &Logger, agent: Arc<Agent>) {
        let ovn_man = OvnMan { log: log.new(o!("component" => "OvnMan")), agent };
        let mut shutdown = ovn_man.agent.shutdown_rx();
        tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(OVN_MAN_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!(ovn_man.log, "shutting down");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                ovn_man.do_sync().await;
            }
        });
    }

    async fn do_sync(&self) {
        let config = &self.agent.config;
        for bridge in [&config.ovn_integration_bridge, &config.ovn_mapped_bridge] {
            if let Err(err) = Vsctl::add_bridge(bridge).await {
                warn!(self.log, "failed to ensure bridge";
                    "bridge" => bridge.as_str(), "err" => %err);
                return;
            }
        }

        if let Err(err) = Vsctl::add_patch_pair(
            &config.ovn_mapped_bridge,
            &mapped_patch_port(config),
            &config.ovn_integration_bridge,
            &integration_patch_port(config),
        )
        .await
        {
            warn!(self.log, "failed to ensure mapped patch pair"; "err" => %err);
        }

        if let Some(mapped_ip) = &config.ovn_mapped_ip {
            if let Err(err) =
                Ip::addr_add(&config.ovn_mapped_bridge, &mapped_ip.to_string()).await
            {
                warn!(self.log, "failed to assign mapped address"; "err" => %err);
            }
            if let Err(err) = Ip::link_up(&config.ovn_mapped_bridge).await {
                warn!(self.log, "failed to bring mapped bridge up"; "err" => %err);
            }
        }

        if let Some(cidr) = &config.ovn_mapped_cidr {
            if let Err(err) = Iptables::ensure_distgw_masquerade(&cidr.to_string()).await
            {
                warn!(self.log, "failed to ensure distgw masquerade"; "err" => %err);
            }
        }
        if let Err(err) = Iptables::ensure_geneve_fast_path().await {
            warn!(self.log, "failed to ensure geneve fast path"; "err" => %err);
        }

        self.publish_patch_drop().await;
    }

    /// Drop everything entering the mapped bridge from the integration
    /// side until the gateway address routes it, published under the
    /// port's own name so other producers never touch it.
    async fn publish_patch_drop(&self) {
        let config = &self.agent.config;
        let bridge = &config.ovn_mapped_bridge;
        let port = mapped_patch_port(config);
        let port_no = match port_cache::dump_port(bridge, &port).await {
            Ok(Some(port_no)) => port_no,
            Ok(None) => {
                debug!(self.log, "mapped patch port has no ofport yet");
                return;
            }
            Err(err) => {
                warn!(self.log, "mapped patch port lookup failed"; "err" => %err);
                return;
            }
        };

        let flow_man = self.agent.get_flow_man(bridge);
        let flows = if config.ovn_mapped_ip.is_some() {
            Vec::new()
        } else {
            vec![flows::patch_port_drop_flow(port_no)]
        };
        if let Err(err) = flow_man.update_flows(&port, flows).await {
            warn!(self.log, "failed to publish patch drop"; "err" => %err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_patch_port_names_follow_config() {
        let config: Config = toml::from_str(
            r#"
            servers_path = "/srv"
            ovn_integration_bridge = "br-int"

            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        )
        .unwrap();
        assert_eq!(mapped_patch_port(&config), "mapped-br-int");
        assert_eq!(integration_patch_port(&config), "br-int-mapped");

        let defaults: Config = toml::from_str(
            r#"
            servers_path = "/srv"

            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        )
        .unwrap();
        assert_eq!(mapped_patch_port(&defaults), "mapped-brvpc");
        assert_eq!(integration_patch_port(&defaults), "brvpc-mapped");
    }
}

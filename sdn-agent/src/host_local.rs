// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host side of each managed network as a flow producer.
//!
//! Every configured network owns the `hostlocal.<bridge>` label on its
//! bridge: IPv6 drop, ARP, metadata redirect, DHCP relay, LOCAL and
//! uplink fast paths. The watcher publishes these once at startup and
//! again on every full refresh.

use crate::config::{Config, Network};
use crate::flows;
use crate::port_cache;
use ovs_utils::flow::Flow;
use ovs_utils::ip::Ip;
use ovs_utils::vsctl::Vsctl;
use slog::{warn, Logger};
use std::net::Ipv4Addr;

pub fn who(bridge: &str) -> String {
    format!("hostlocal.{}", bridge)
}

/// Make sure each managed network's bridge exists and carries its
/// uplink. Idempotent; failures are logged and retried on the next
/// refresh.
pub async fn ensure_bridges(log: &Logger, config: &Config) {
    for network in &config.networks {
        if let Err(err) = Vsctl::add_bridge(&network.bridge).await {
            warn!(log, "failed to ensure bridge";
                "bridge" => &network.bridge, "err" => %err);
            continue;
        }
        if let Err(err) = Vsctl::add_port(&network.bridge, &network.ifname).await {
            warn!(log, "failed to ensure uplink port";
                "bridge" => &network.bridge, "port" => &network.ifname, "err" => %err);
        }
    }
}

/// The flows for one network's bridge. The uplink's port number is
/// looked up through the cache; when it cannot be resolved the uplink
/// fast path is simply omitted until the next pass.
pub async fn bridge_flows(log: &Logger, config: &Config, network: &Network) -> Vec<Flow> {
    let phy_port_no = match port_cache::dump_port(&network.bridge, &network.ifname).await
    {
        Ok(port_no) => port_no,
        Err(err) => {
            warn!(log, "failed to resolve uplink port number";
                "bridge" => &network.bridge, "port" => &network.ifname, "err" => %err);
            None
        }
    };
    let service_ip = service_ip(log, config, network).await;
    flows::host_local_flows(config, network, service_ip, phy_port_no)
}

/// The address guests reach host services (metadata) at: the network's
/// configured address, falling back to the `listen_interface` address
/// for networks declared with `0.0.0.0`.
async fn service_ip(log: &Logger, config: &Config, network: &Network) -> Ipv4Addr {
    if !network.ip.is_unspecified() {
        return network.ip;
    }
    let Some(ifname) = &config.listen_interface else {
        return Ipv4Addr::UNSPECIFIED;
    };
    match Ip::addr4(ifname).await {
        Ok(Some(addr)) => addr,
        Ok(None) => {
            warn!(log, "listen interface carries no IPv4 address";
                "interface" => ifname.as_str());
            Ipv4Addr::UNSPECIFIED
        }
        Err(err) => {
            warn!(log, "failed to resolve listen interface address";
                "interface" => ifname.as_str(), "err" => %err);
            Ipv4Addr::UNSPECIFIED
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_who_label() {
        assert_eq!(who("br0"), "hostlocal.br0");
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host configuration for the SDN agent.

use camino::Utf8PathBuf;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

fn default_rpc_bind() -> SocketAddr {
    "127.0.0.1:8787".parse().unwrap()
}

fn default_dhcp_server_port() -> u16 {
    67
}

fn default_metadata_port() -> u16 {
    9885
}

fn default_ct_zone_base() -> u16 {
    1000
}

fn default_integration_bridge() -> String {
    "brvpc".to_string()
}

fn default_mapped_bridge() -> String {
    "brmapped".to_string()
}

fn default_eip_bridge() -> String {
    "breip".to_string()
}

fn default_tap_bridge() -> String {
    "brtap".to_string()
}

/// One host network the agent manages, configured with the legacy
/// three-field syntax `"<ifname>/<bridge>/<ip>"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Network {
    pub ifname: String,
    pub bridge: String,
    pub ip: Ipv4Addr,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split('/');
        let (Some(ifname), Some(bridge), Some(ip), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(ConfigError::BadNetwork { value: s.to_string() });
        };
        if ifname.is_empty() || bridge.is_empty() {
            return Err(ConfigError::BadNetwork { value: s.to_string() });
        }
        let ip = ip
            .parse()
            .map_err(|_| ConfigError::BadNetwork { value: s.to_string() })?;
        Ok(Network { ifname: ifname.to_string(), bridge: bridge.to_string(), ip })
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Agent configuration, loaded from a TOML file.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Configuration for the agent's debug log.
    pub log: dropshot::ConfigLogging,

    /// Local address the RPC facade listens on.
    #[serde(default = "default_rpc_bind")]
    pub rpc_bind_address: SocketAddr,

    /// Directory of per-guest descriptor directories.
    pub servers_path: Utf8PathBuf,

    /// Networks the agent manages, `"<ifname>/<bridge>/<ip>"` each.
    #[serde(default)]
    pub networks: Vec<Network>,

    /// Interface whose address stands in as the host's service address
    /// for networks declared with `0.0.0.0`.
    pub listen_interface: Option<String>,

    /// Port of the host metadata service that 169.254.169.254:80 is
    /// redirected to.
    #[serde(default = "default_metadata_port")]
    pub port: u16,

    /// Pod CIDR whose traffic is steered to LOCAL for kube-proxy.
    pub k8s_cluster_cidr: Option<Ipv4Network>,

    /// Permit traffic between VMs attached to the same switch.
    #[serde(default)]
    pub allow_switch_vms: bool,

    #[serde(default = "default_dhcp_server_port")]
    pub dhcp_server_port: u16,

    /// Base of the conntrack-zone id space handed to guest NICs.
    #[serde(default = "default_ct_zone_base")]
    pub ct_zone_base: u16,

    #[serde(default = "default_integration_bridge")]
    pub ovn_integration_bridge: String,

    #[serde(default = "default_mapped_bridge")]
    pub ovn_mapped_bridge: String,

    /// CIDR carried by the mapped bridge for the distributed gateway.
    pub ovn_mapped_cidr: Option<Ipv4Network>,

    /// This host's address inside the mapped CIDR, assigned to the
    /// mapped bridge. Normally fetched from the region API; configured
    /// statically here.
    pub ovn_mapped_ip: Option<Ipv4Network>,

    #[serde(default = "default_eip_bridge")]
    pub ovn_eip_bridge: String,

    #[serde(default = "default_tap_bridge")]
    pub tap_bridge: String,

    /// Addresses answered by per-subnet metadata servers.
    #[serde(default)]
    pub metadata_server_ips: Vec<Ipv4Addr>,

    #[serde(default)]
    pub metadata_server_ip6s: Vec<Ipv6Addr>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Invalid network {value:?}: want \"<ifname>/<bridge>/<ip>\"")]
    BadNetwork { value: String },
    #[error("ct_zone_base {0} leaves no zone ids")]
    CtZoneBaseTooHigh(u16),
}

impl Config {
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ct_zone_base == u16::MAX {
            return Err(ConfigError::CtZoneBaseTooHigh(self.ct_zone_base));
        }
        Ok(())
    }

    /// The network owning `bridge`, if the agent manages it.
    pub fn network_for_bridge(&self, bridge: &str) -> Option<&Network> {
        self.networks.iter().find(|n| n.bridge == bridge)
    }

    /// Every bridge the agent may install flows on, auxiliary bridges
    /// included.
    pub fn known_bridges(&self) -> Vec<String> {
        let mut bridges: Vec<String> =
            self.networks.iter().map(|n| n.bridge.clone()).collect();
        for aux in [
            &self.ovn_integration_bridge,
            &self.ovn_mapped_bridge,
            &self.ovn_eip_bridge,
            &self.tap_bridge,
        ] {
            if !bridges.contains(aux) {
                bridges.push(aux.clone());
            }
        }
        bridges
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_network_shim() {
        let n: Network = "eth0/br0/10.168.222.136".parse().unwrap();
        assert_eq!(n.ifname, "eth0");
        assert_eq!(n.bridge, "br0");
        assert_eq!(n.ip, Ipv4Addr::new(10, 168, 222, 136));

        assert!("eth0/br0".parse::<Network>().is_err());
        assert!("eth0/br0/10.0.0.1/24".parse::<Network>().is_err());
        assert!("/br0/10.0.0.1".parse::<Network>().is_err());
        assert!("eth0/br0/not-an-ip".parse::<Network>().is_err());
    }

    #[test]
    fn test_config_parse() {
        let text = r#"
            servers_path = "/cloud/workspace/servers"
            networks = ["eth0/br0/10.168.222.136"]
            k8s_cluster_cidr = "10.43.0.0/16"
            allow_switch_vms = true

            [log]
            mode = "stderr-terminal"
            level = "info"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.servers_path, "/cloud/workspace/servers");
        assert_eq!(config.networks.len(), 1);
        assert_eq!(config.dhcp_server_port, 67);
        assert_eq!(config.ct_zone_base, 1000);
        assert!(config.allow_switch_vms);
        assert_eq!(config.ovn_integration_bridge, "brvpc");
        assert!(config.listen_interface.is_none());
        let bridges = config.known_bridges();
        assert!(bridges.contains(&"br0".to_string()));
        assert!(bridges.contains(&"brtap".to_string()));
    }
}

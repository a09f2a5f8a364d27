// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One guest as seen through its descriptor directory.
//!
//! `<servers_path>/<uuid>/` holds `desc` (JSON), `pid` (ASCII pid) and,
//! for VMs, a `startvm` marker. The watcher owns the Guest map; this
//! module only models one guest and computes its declarative
//! contribution (flows per bridge, tc per interface) from resolved
//! facts.

use crate::config::Config;
use crate::flows::{self, NicFacts};
use crate::secrules::{self, SecurityRule};
use crate::tc_man::TcData;
use camino::Utf8PathBuf;
use ovs_utils::flow::Flow;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to read {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse descriptor {path}: {err}")]
    Desc {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },
    #[error("Bad security rules: {0}")]
    Rules(#[from] secrules::Error),
    #[error(transparent)]
    CtZone(#[from] crate::ct_zone::Error),
}

fn default_vlan() -> u16 {
    1
}

/// One NIC as the descriptor declares it.
#[derive(Debug, Clone, Deserialize)]
pub struct DescNic {
    pub bridge: String,
    /// Host-side interface name.
    pub ifname: String,
    /// VM-side interface name.
    #[serde(default)]
    pub interface: Option<String>,
    pub ip: Ipv4Addr,
    pub mac: macaddr::MacAddr6,
    #[serde(default)]
    pub masklen: u8,
    /// VPC subnet id, set when the NIC lives on the integration bridge.
    #[serde(default)]
    pub net_id: Option<String>,
    #[serde(default)]
    pub wire_id: Option<String>,
    #[serde(default = "default_vlan")]
    pub vlan: u16,
    /// Elastic IP mapped 1:1 onto this NIC, if one is bound.
    #[serde(default)]
    pub eip: Option<Ipv4Addr>,
    /// Bandwidth limit in Mbps; 0 means unshaped.
    #[serde(default)]
    pub bw: i64,
    #[serde(default)]
    pub driver: Option<String>,
    /// Virtual NICs have no host-side port to program.
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
}

impl DescNic {
    pub fn in_vpc(&self) -> bool {
        self.net_id.is_some()
    }
}

/// The consumed subset of the `desc` JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct Desc {
    pub name: String,
    #[serde(default)]
    pub secgroup: Option<String>,
    #[serde(default)]
    pub security_rules: String,
    #[serde(default)]
    pub admin_security_rules: String,
    #[serde(default)]
    pub nics: Vec<DescNic>,
}

impl Desc {
    /// The guest's effective rule list. Admin rules come first so they
    /// compile to higher priorities than tenant rules.
    pub fn rules(&self) -> Result<Vec<SecurityRule>, Error> {
        let mut rules = secrules::parse_rules(&self.admin_security_rules)?;
        rules.extend(secrules::parse_rules(&self.security_rules)?);
        Ok(rules)
    }
}

#[derive(Debug)]
pub struct Guest {
    pub id: Uuid,
    pub path: Utf8PathBuf,
    pub desc: Option<Desc>,
    pub pid: Option<u32>,
    /// Present when a `startvm` marker exists; distinguishes VMs from
    /// containers.
    pub is_vm: bool,
    /// Set while a port lookup keeps failing; cleared on success.
    pub last_seen_pending: Option<Instant>,
}

impl Guest {
    pub fn new(id: Uuid, servers_path: &Utf8PathBuf) -> Self {
        let path = servers_path.join(id.to_string());
        Guest { id, path, desc: None, pid: None, is_vm: false, last_seen_pending: None }
    }

    /// Producer label under which this guest publishes flows.
    pub fn who(&self) -> String {
        self.id.to_string()
    }

    /// Re-read `desc`, `pid` and the `startvm` marker from disk. A
    /// missing `pid` is not an error (the guest is stopped); a missing
    /// or unparsable `desc` is.
    pub fn reload(&mut self) -> Result<(), Error> {
        let desc_path = self.path.join("desc");
        let contents = std::fs::read_to_string(&desc_path)
            .map_err(|err| Error::Io { path: desc_path.clone(), err })?;
        self.desc = Some(
            serde_json::from_str(&contents)
                .map_err(|err| Error::Desc { path: desc_path, err })?,
        );

        self.pid = std::fs::read_to_string(self.path.join("pid"))
            .ok()
            .and_then(|s| s.trim().parse().ok());
        self.is_vm = self.path.join("startvm").exists();
        Ok(())
    }

    /// Whether the guest process is alive. A VM without a live pid is
    /// stopped; a container is considered running as soon as it has a
    /// descriptor, because its pid file may lag behind.
    pub fn is_running(&self) -> bool {
        match self.pid {
            Some(pid) => std::path::Path::new(&format!("/proc/{}", pid)).exists(),
            None => !self.is_vm && self.desc.is_some(),
        }
    }

    /// The flows this guest wants on each bridge, given the resolved
    /// per-NIC facts. Pair-commit flows between NICs sharing a bridge
    /// span guests, so the watcher computes them over all guests'
    /// facts, not here.
    pub fn compute_flows(
        &self,
        config: &Config,
        facts: &[NicFacts],
    ) -> Result<HashMap<String, Vec<Flow>>, Error> {
        let rules = match &self.desc {
            Some(desc) => desc.rules()?,
            None => Vec::new(),
        };

        let mut by_bridge: HashMap<String, Vec<Flow>> = HashMap::new();
        for nic in facts {
            by_bridge
                .entry(nic.bridge.clone())
                .or_default()
                .extend(flows::guest_nic_flows(config, nic, &rules));
        }
        Ok(by_bridge)
    }

    /// The tc state this guest wants, one entry per shaped host-side
    /// interface.
    pub fn compute_tc(&self) -> Vec<TcData> {
        let Some(desc) = &self.desc else {
            return Vec::new();
        };
        desc.nics
            .iter()
            .filter(|nic| !nic.is_virtual)
            .map(|nic| TcData::for_bandwidth(&nic.ifname, nic.bw, 64))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DESC: &str = r#"{
        "name": "vm-01",
        "secgroup": "default",
        "security_rules": "in:allow tcp 22; in:deny any; out:allow any",
        "admin_security_rules": "",
        "nics": [
            {
                "bridge": "br0",
                "ifname": "vnet0",
                "interface": "eth0",
                "ip": "10.0.0.2",
                "mac": "aa:bb:cc:dd:ee:01",
                "masklen": 24,
                "vlan": 1,
                "bw": 100,
                "driver": "virtio"
            },
            {
                "bridge": "brvpc",
                "ifname": "vnet1",
                "ip": "192.168.1.5",
                "mac": "aa:bb:cc:dd:ee:02",
                "masklen": 24,
                "net_id": "subnet-1234",
                "bw": 0
            }
        ]
    }"#;

    #[test]
    fn test_desc_parse() {
        let desc: Desc = serde_json::from_str(DESC).unwrap();
        assert_eq!(desc.name, "vm-01");
        assert_eq!(desc.nics.len(), 2);
        assert_eq!(desc.nics[0].ifname, "vnet0");
        assert_eq!(desc.nics[0].vlan, 1);
        assert!(!desc.nics[0].in_vpc());
        assert!(desc.nics[1].in_vpc());
        assert_eq!(desc.nics[1].net_id.as_deref(), Some("subnet-1234"));

        let rules = desc.rules().unwrap();
        assert_eq!(rules.len(), 3);
    }

    #[test]
    fn test_guest_lifecycle() {
        let dir = camino_tempfile::tempdir().unwrap();
        let servers_path = dir.path().to_path_buf();
        let id: Uuid = "01234567-89ab-cdef-0123-456789abcdef".parse().unwrap();
        let guest_dir = servers_path.join(id.to_string());
        std::fs::create_dir(&guest_dir).unwrap();
        std::fs::write(guest_dir.join("desc"), DESC).unwrap();

        let mut guest = Guest::new(id, &servers_path);
        guest.reload().unwrap();
        assert!(guest.desc.is_some());
        assert!(guest.pid.is_none());
        assert!(!guest.is_vm);
        // Container without a pid file counts as running.
        assert!(guest.is_running());

        // Marked as a VM it needs a live pid.
        std::fs::write(guest_dir.join("startvm"), "").unwrap();
        guest.reload().unwrap();
        assert!(guest.is_vm);
        assert!(!guest.is_running());

        std::fs::write(guest_dir.join("pid"), format!("{}\n", std::process::id()))
            .unwrap();
        guest.reload().unwrap();
        assert!(guest.is_running());
    }

    #[test]
    fn test_compute_flows_groups_by_bridge() {
        let desc: Desc = serde_json::from_str(DESC).unwrap();
        let id: Uuid = "01234567-89ab-cdef-0123-456789abcdef".parse().unwrap();
        let servers_path = Utf8PathBuf::from("/srv");
        let mut guest = Guest::new(id, &servers_path);
        guest.desc = Some(desc);

        let config: Config = toml::from_str(
            r#"
            servers_path = "/srv"
            networks = ["eth0/br0/10.168.222.136"]

            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        )
        .unwrap();

        let facts = vec![
            NicFacts {
                bridge: "br0".to_string(),
                ifname: "vnet0".to_string(),
                port_no: 2,
                mac: "aa:bb:cc:dd:ee:01".parse().unwrap(),
                ip: "10.0.0.2".parse().unwrap(),
                vlan: 1,
                ct_zone: 1042,
            },
            NicFacts {
                bridge: "br0".to_string(),
                ifname: "vnet2".to_string(),
                port_no: 3,
                mac: "aa:bb:cc:dd:ee:03".parse().unwrap(),
                ip: "10.0.0.3".parse().unwrap(),
                vlan: 1,
                ct_zone: 1043,
            },
        ];
        let by_bridge = guest.compute_flows(&config, &facts).unwrap();
        assert_eq!(by_bridge.len(), 1);
        let br0 = &by_bridge["br0"];
        // Both NICs classified into their own zones; pair commits are
        // the watcher's job, so none appear here.
        assert!(br0.iter().any(|f| f.actions.contains("zone=1042")));
        assert!(br0.iter().any(|f| f.actions.contains("zone=1043")));
        assert!(!br0.iter().any(|f| f.table == crate::flows::TABLE_LOCAL_PAIR));
    }

    #[test]
    fn test_compute_tc() {
        let desc: Desc = serde_json::from_str(DESC).unwrap();
        let id: Uuid = "01234567-89ab-cdef-0123-456789abcdef".parse().unwrap();
        let mut guest = Guest::new(id, &Utf8PathBuf::from("/srv"));
        guest.desc = Some(desc);

        let tc = guest.compute_tc();
        assert_eq!(tc.len(), 2);
        // 100 Mbps shaped on vnet0, unshaped on vnet1.
        assert_eq!(tc[0].ifname, "vnet0");
        assert_eq!(tc[0].tree.qdiscs().len(), 2);
        assert_eq!(tc[1].ifname, "vnet1");
        assert_eq!(tc[1].tree.qdiscs().len(), 1);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flow compiler: pure functions from declarative facts to flow
//! lists.
//!
//! Output is deterministic: the same inputs produce the same flows in
//! the same order on every run and across restarts, so reconciliation
//! diffs stay empty when nothing changed.
//!
//! Table layout:
//!
//! | table | role |
//! |-------|------|
//! | 0 | classification; non-IP fast paths; host service redirects |
//! | 1 | ct_state dispatch |
//! | 2 | outbound ACLs (traffic leaving a local VM) |
//! | 3 | inbound ACLs (traffic addressed to a local VM) |
//! | 4 | commit accepted traffic, NORMAL |
//! | 5 | commit + NORMAL for local VM-to-VM pairs |

use crate::config::{Config, Network};
use crate::secrules::{Action, Direction, Protocol, SecurityRule};
use ovs_utils::flow::{Flow, Match};
use std::net::Ipv4Addr;

pub const TABLE_CLASSIFY: u8 = 0;
pub const TABLE_CT_STATE: u8 = 1;
pub const TABLE_ACL_OUT: u8 = 2;
pub const TABLE_ACL_IN: u8 = 3;
pub const TABLE_COMMIT: u8 = 4;
pub const TABLE_LOCAL_PAIR: u8 = 5;

/// Highest ACL priority; rules count down from here.
pub const ACL_PRIORITY_TOP: u16 = 40000;
/// Default-policy priority under every compiled rule.
pub const ACL_PRIORITY_FLOOR: u16 = 100;

/// The reg0 bit marking packets that entered from a local VM port.
const REG0_FROM_VM: u32 = 1 << 16;

/// Everything the compiler needs to know about one guest NIC.
#[derive(Debug, Clone)]
pub struct NicFacts {
    pub bridge: String,
    pub ifname: String,
    pub port_no: u32,
    pub mac: macaddr::MacAddr6,
    pub ip: Ipv4Addr,
    pub vlan: u16,
    pub ct_zone: u16,
}

fn mac_match(mac: &macaddr::MacAddr6) -> String {
    // Canonical lower-case colon form, as ovs-ofctl prints it back.
    format!("{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac.as_bytes()[0], mac.as_bytes()[1], mac.as_bytes()[2],
        mac.as_bytes()[3], mac.as_bytes()[4], mac.as_bytes()[5])
}

fn mac_hex(mac: &macaddr::MacAddr6) -> String {
    let mut value = 0u64;
    for &byte in mac.as_bytes() {
        value = value << 8 | byte as u64;
    }
    format!("0x{:x}", value)
}

fn ip_hex(ip: Ipv4Addr) -> String {
    format!("0x{:x}", u32::from(ip))
}

/// Flows for the host side of one managed network.
///
/// `phy_port_no` is the OpenFlow number of the physical uplink on the
/// bridge, when known; the PHY fast path cannot be emitted without it.
pub fn host_local_flows(
    config: &Config,
    network: &Network,
    service_ip: Ipv4Addr,
    phy_port_no: Option<u32>,
) -> Vec<Flow> {
    let mut flows = Vec::new();

    // Guests get no IPv6 service on flat networks.
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        40000,
        vec![Match::kv("dl_type", "0x86dd")],
        "drop",
    ));

    flows.push(Flow::new(TABLE_CLASSIFY, 29400, vec![Match::flag("arp")], "normal"));

    // Metadata service: redirect the link-local answerer to the host.
    // With no resolvable service address the redirect is omitted rather
    // than black-holing metadata traffic at 0.0.0.0.
    if !service_ip.is_unspecified() {
        flows.push(Flow::new(
            TABLE_CLASSIFY,
            29310,
            vec![
                Match::flag("tcp"),
                Match::kv("nw_dst", "169.254.169.254"),
                Match::kv("tp_dst", 80),
            ],
            format!("mod_nw_dst:{},mod_tp_dst:{},LOCAL", service_ip, config.port),
        ));
    }

    if let Some(cidr) = &config.k8s_cluster_cidr {
        flows.push(Flow::new(
            TABLE_CLASSIFY,
            29200,
            vec![Match::flag("ip"), Match::kv("nw_dst", cidr)],
            "LOCAL",
        ));
    }

    // DHCP, both legs of the relay on the host.
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        28400,
        vec![
            Match::flag("udp"),
            Match::kv("in_port", "LOCAL"),
            Match::kv("tp_src", config.dhcp_server_port),
        ],
        "normal",
    ));
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        28300,
        vec![Match::flag("udp"), Match::kv("tp_dst", 67)],
        format!("mod_tp_dst:{},LOCAL", config.dhcp_server_port),
    ));

    flows.push(Flow::new(
        TABLE_CLASSIFY,
        25000,
        vec![Match::kv("in_port", "LOCAL")],
        "normal",
    ));

    // With allow_switch_vms the uplink bypasses the security pipeline
    // entirely; without it, external traffic falls through to the
    // per-VM classify flows and is conntracked like everything else.
    if config.allow_switch_vms {
        if let Some(phy) = phy_port_no {
            flows.push(Flow::new(
                TABLE_CLASSIFY,
                25100,
                vec![Match::kv("in_port", phy)],
                "normal",
            ));
        }
    }

    flows
}

/// Flows for one guest NIC: host-service fast paths, classification
/// into the NIC's conntrack zone, compiled ACLs, and commit rules.
pub fn guest_nic_flows(
    config: &Config,
    nic: &NicFacts,
    rules: &[SecurityRule],
) -> Vec<Flow> {
    let mut flows = Vec::new();
    let mac = mac_match(&nic.mac);
    let zone = nic.ct_zone;

    // DHCP from the VM to the host relay, bypassing conntrack.
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        29300,
        vec![
            Match::kv("in_port", nic.port_no),
            Match::flag("udp"),
            Match::kv("tp_src", 68),
            Match::kv("tp_dst", 67),
        ],
        format!("mod_tp_dst:{},LOCAL", config.dhcp_server_port),
    ));

    // Reverse path from the metadata service back into the VM.
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        29210,
        vec![
            Match::flag("tcp"),
            Match::kv("tp_src", config.port),
            Match::kv("dl_dst", &mac),
        ],
        format!("mod_nw_src:169.254.169.254,mod_tp_src:80,output:{}", nic.port_no),
    ));

    // Reverse path for pod-network traffic terminated on the host.
    if let Some(cidr) = &config.k8s_cluster_cidr {
        flows.push(Flow::new(
            TABLE_CLASSIFY,
            29100,
            vec![
                Match::flag("ip"),
                Match::kv("nw_src", cidr),
                Match::kv("dl_dst", &mac),
            ],
            "normal",
        ));
    }

    // Admit vlan-tagged traffic for this NIC arriving from the wire.
    if nic.vlan > 1 {
        flows.push(Flow::new(
            TABLE_CLASSIFY,
            27700,
            vec![
                Match::kv("dl_vlan", nic.vlan),
                Match::kv("dl_dst", &mac),
                Match::flag("ip"),
            ],
            format!("strip_vlan,ct(zone={},table={})", zone, TABLE_CT_STATE),
        ));
    }

    // Classification into conntrack. Outbound is tagged with the
    // from-VM reg0 bit and tracked in the source NIC's zone; inbound is
    // tracked in the destination NIC's zone.
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        27300,
        vec![Match::kv("in_port", nic.port_no), Match::flag("ip")],
        format!(
            "load:0x1->NXM_NX_REG0[16],ct(zone={},table={})",
            zone, TABLE_CT_STATE
        ),
    ));
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        27200,
        vec![Match::kv("in_port", nic.port_no)],
        "normal",
    ));
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        26900,
        vec![Match::kv("dl_dst", &mac), Match::flag("ip")],
        format!("ct(zone={},table={})", zone, TABLE_CT_STATE),
    ));
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        26800,
        vec![Match::kv("dl_dst", &mac)],
        "normal",
    ));

    // ct_state dispatch. Identical for every NIC; set-based install
    // collapses the copies.
    flows.push(Flow::new(
        TABLE_CT_STATE,
        40,
        vec![Match::kv("ct_state", "+inv+trk")],
        "drop",
    ));
    flows.push(Flow::new(
        TABLE_CT_STATE,
        30,
        vec![
            Match::kv("ct_state", "+new+trk"),
            Match::masked("reg0", REG0_FROM_VM, REG0_FROM_VM),
        ],
        format!("resubmit(,{})", TABLE_ACL_OUT),
    ));
    flows.push(Flow::new(
        TABLE_CT_STATE,
        29,
        vec![Match::kv("ct_state", "+new+trk")],
        format!("resubmit(,{})", TABLE_ACL_IN),
    ));
    flows.push(Flow::new(
        TABLE_CT_STATE,
        1,
        vec![],
        format!("resubmit(,{})", TABLE_COMMIT),
    ));

    // Compiled ACLs.
    for (idx, rule) in rules.iter().enumerate() {
        let priority = ACL_PRIORITY_TOP.saturating_sub(idx as u16);
        flows.extend(acl_flows(nic, rule, priority));
    }

    // Default policy under all compiled rules: outbound permitted,
    // inbound denied.
    flows.push(Flow::new(
        TABLE_ACL_OUT,
        ACL_PRIORITY_FLOOR,
        vec![Match::kv("dl_src", &mac), Match::flag("ip")],
        format!("resubmit(,{})", TABLE_COMMIT),
    ));
    flows.push(Flow::new(
        TABLE_ACL_IN,
        ACL_PRIORITY_FLOOR,
        vec![Match::kv("dl_dst", &mac), Match::flag("ip")],
        "drop",
    ));

    // Commit accepted traffic and forward.
    flows.push(Flow::new(
        TABLE_COMMIT,
        30,
        vec![Match::kv("dl_dst", &mac), Match::flag("ip")],
        format!("ct(commit,zone={}),normal", zone),
    ));
    flows.push(Flow::new(
        TABLE_COMMIT,
        20,
        vec![Match::kv("in_port", nic.port_no), Match::flag("ip")],
        format!("ct(commit,zone={}),normal", zone),
    ));
    flows.push(Flow::new(TABLE_COMMIT, 1, vec![], "normal"));

    flows
}

fn acl_flows(nic: &NicFacts, rule: &SecurityRule, priority: u16) -> Vec<Flow> {
    let mac = mac_match(&nic.mac);
    let (table, mac_side, net_side) = match rule.direction {
        Direction::Out => (TABLE_ACL_OUT, "dl_src", "nw_dst"),
        Direction::In => (TABLE_ACL_IN, "dl_dst", "nw_src"),
    };

    let mut base = vec![Match::kv(mac_side, &mac)];
    match rule.protocol {
        Protocol::Any => base.push(Match::flag("ip")),
        Protocol::Tcp => base.push(Match::flag("tcp")),
        Protocol::Udp => base.push(Match::flag("udp")),
        Protocol::Icmp => base.push(Match::flag("icmp")),
    }
    if let Some(net) = &rule.net {
        base.push(Match::kv(net_side, net));
    }

    let actions = match rule.action {
        Action::Allow => format!("resubmit(,{})", TABLE_COMMIT),
        Action::Deny => "drop".to_string(),
    };

    if rule.ports.is_empty() {
        return vec![Flow::new(table, priority, base, actions.clone())];
    }

    // One flow per (value, mask) pair of each port expression.
    let mut flows = Vec::new();
    for spec in &rule.ports {
        for (value, mask) in spec.to_masks() {
            let mut matches = base.clone();
            if mask == 0xffff {
                matches.push(Match::kv("tp_dst", value));
            } else {
                matches.push(Match::kv("tp_dst", format!("0x{:x}/0x{:x}", value, mask)));
            }
            flows.push(Flow::new(table, priority, matches, actions.clone()));
        }
    }
    flows
}

/// Flows routing traffic between two NICs that share a bridge through
/// the pair-commit table, so both conntrack zones see the connection.
pub fn local_pair_flows(a: &NicFacts, b: &NicFacts) -> Vec<Flow> {
    let mut flows = Vec::new();
    for (src, dst) in [(a, b), (b, a)] {
        flows.push(Flow::new(
            TABLE_COMMIT,
            40,
            vec![
                Match::kv("dl_src", mac_match(&src.mac)),
                Match::kv("dl_dst", mac_match(&dst.mac)),
                Match::flag("ip"),
            ],
            format!("resubmit(,{})", TABLE_LOCAL_PAIR),
        ));
        flows.push(Flow::new(
            TABLE_LOCAL_PAIR,
            30,
            vec![
                Match::kv("dl_src", mac_match(&src.mac)),
                Match::kv("dl_dst", mac_match(&dst.mac)),
                Match::flag("ip"),
            ],
            format!(
                "ct(commit,zone={}),ct(commit,zone={}),normal",
                src.ct_zone, dst.ct_zone
            ),
        ));
    }
    flows
}

/// 1:1 NAT between a VM address and a public address on an auxiliary
/// bridge, plus a local ARP responder for the public address.
///
/// `patch_port_no` is the patch port leading back toward the
/// integration bridge; `uplink` the port toward the outside.
pub fn nat_flows(
    vm_ip: Ipv4Addr,
    public_ip: Ipv4Addr,
    public_mac: &macaddr::MacAddr6,
    patch_port_no: u32,
) -> Vec<Flow> {
    let mut flows = Vec::new();

    // ARP responder: answer "who-has <public_ip>" locally.
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        30000,
        vec![
            Match::flag("arp"),
            Match::kv("arp_op", 1),
            Match::kv("arp_tpa", public_ip),
        ],
        format!(
            "move:NXM_OF_ETH_SRC[]->NXM_OF_ETH_DST[],\
             mod_dl_src:{mac},\
             load:0x2->NXM_OF_ARP_OP[],\
             move:NXM_NX_ARP_SHA[]->NXM_NX_ARP_THA[],\
             load:{mac_hex}->NXM_NX_ARP_SHA[],\
             move:NXM_OF_ARP_SPA[]->NXM_OF_ARP_TPA[],\
             load:{ip_hex}->NXM_OF_ARP_SPA[],\
             in_port",
            mac = mac_match(public_mac),
            mac_hex = mac_hex(public_mac),
            ip_hex = ip_hex(public_ip),
        ),
    ));

    // Ingress DNAT toward the VM.
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        29000,
        vec![Match::flag("ip"), Match::kv("nw_dst", public_ip)],
        format!("mod_nw_dst:{},output:{}", vm_ip, patch_port_no),
    ));

    // Egress SNAT from the VM.
    flows.push(Flow::new(
        TABLE_CLASSIFY,
        29000,
        vec![
            Match::flag("ip"),
            Match::kv("in_port", patch_port_no),
            Match::kv("nw_src", vm_ip),
        ],
        format!("mod_nw_src:{},normal", public_ip),
    ));

    flows
}

/// The drop rule installed under a patch port's own producer label
/// until the overlay controller claims the port.
pub fn patch_port_drop_flow(port_no: u32) -> Flow {
    Flow::new(TABLE_CLASSIFY, 20, vec![Match::kv("in_port", port_no)], "drop")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::secrules::parse_rules;

    fn test_config() -> Config {
        toml::from_str(
            r#"
            servers_path = "/srv"
            networks = ["eth0/br0/10.168.222.136"]
            k8s_cluster_cidr = "10.43.0.0/16"

            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        )
        .unwrap()
    }

    fn test_nic() -> NicFacts {
        NicFacts {
            bridge: "br0".to_string(),
            ifname: "vnet0".to_string(),
            port_no: 2,
            mac: "aa:bb:cc:dd:ee:01".parse().unwrap(),
            ip: "10.0.0.2".parse().unwrap(),
            vlan: 1,
            ct_zone: 1042,
        }
    }

    #[test]
    fn test_compiler_is_deterministic() {
        let config = test_config();
        let nic = test_nic();
        let rules = parse_rules("in:allow tcp 22; in:deny any; out:allow any").unwrap();
        let a = guest_nic_flows(&config, &nic, &rules);
        let b = guest_nic_flows(&config, &nic, &rules);
        let a: Vec<String> = a.iter().map(|f| f.add_line()).collect();
        let b: Vec<String> = b.iter().map(|f| f.add_line()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_guest_flows_classify_into_zone() {
        let config = test_config();
        let nic = test_nic();
        let flows = guest_nic_flows(&config, &nic, &[]);

        let outbound = flows
            .iter()
            .find(|f| f.table == TABLE_CLASSIFY && f.priority == 27300)
            .unwrap();
        assert!(outbound.actions.contains("load:0x1->NXM_NX_REG0[16]"));
        assert!(outbound.actions.contains("ct(zone=1042,table=1)"));

        let inbound = flows
            .iter()
            .find(|f| f.table == TABLE_CLASSIFY && f.priority == 26900)
            .unwrap();
        assert!(inbound
            .matches()
            .iter()
            .any(|m| m.as_str() == "dl_dst=aa:bb:cc:dd:ee:01"));
        assert_eq!(inbound.actions, "ct(zone=1042,table=1)");
    }

    #[test]
    fn test_acl_rules_descend_from_top_priority() {
        let config = test_config();
        let nic = test_nic();
        let rules =
            parse_rules("in:allow tcp 22; in:allow udp 53; in:deny any").unwrap();
        let flows = guest_nic_flows(&config, &nic, &rules);

        let acl_in: Vec<&Flow> =
            flows.iter().filter(|f| f.table == TABLE_ACL_IN).collect();
        let prios: Vec<u16> = acl_in.iter().map(|f| f.priority).collect();
        assert!(prios.contains(&40000));
        assert!(prios.contains(&39999));
        assert!(prios.contains(&39998));
        // Default inbound deny at the floor.
        assert!(acl_in
            .iter()
            .any(|f| f.priority == ACL_PRIORITY_FLOOR && f.actions == "drop"));
    }

    #[test]
    fn test_acl_port_range_expands_to_masks() {
        let config = test_config();
        let nic = test_nic();
        let rules = parse_rules("in:allow tcp 8000-8003").unwrap();
        let flows = guest_nic_flows(&config, &nic, &rules);

        let range_flows: Vec<&Flow> = flows
            .iter()
            .filter(|f| f.table == TABLE_ACL_IN && f.priority == 40000)
            .collect();
        // 8000..=8003 is one aligned power-of-two block.
        assert_eq!(range_flows.len(), 1);
        assert!(range_flows[0]
            .matches()
            .iter()
            .any(|m| m.as_str() == "tp_dst=0x1f40/0xfffc"));
    }

    #[test]
    fn test_host_local_metadata_redirect() {
        let config = test_config();
        let network = &config.networks[0];
        let flows = host_local_flows(&config, network, network.ip, Some(1));

        let md = flows
            .iter()
            .find(|f| f.matches().iter().any(|m| m.as_str() == "nw_dst=169.254.169.254"))
            .unwrap();
        assert_eq!(md.actions, "mod_nw_dst:10.168.222.136,mod_tp_dst:9885,LOCAL");

        // IPv6 dropped ahead of everything else.
        assert_eq!(flows[0].priority, 40000);
        assert_eq!(flows[0].actions, "drop");

        // allow_switch_vms defaults off: no PHY fast path.
        assert!(!flows
            .iter()
            .any(|f| f.matches().iter().any(|m| m.as_str() == "in_port=1")));
    }

    #[test]
    fn test_host_local_unresolved_service_ip_omits_redirect() {
        let config = test_config();
        let network = &config.networks[0];
        let flows =
            host_local_flows(&config, network, Ipv4Addr::UNSPECIFIED, Some(1));
        assert!(!flows
            .iter()
            .any(|f| f.matches().iter().any(|m| m.as_str() == "nw_dst=169.254.169.254")));
    }

    #[test]
    fn test_host_local_switch_vms_toggle() {
        let mut config = test_config();
        config.allow_switch_vms = true;
        let network = config.networks[0].clone();
        let flows = host_local_flows(&config, &network, network.ip, Some(7));
        assert!(flows
            .iter()
            .any(|f| f.priority == 25100
                && f.matches().iter().any(|m| m.as_str() == "in_port=7")));
    }

    #[test]
    fn test_local_pair_commits_both_zones() {
        let a = test_nic();
        let mut b = test_nic();
        b.mac = "aa:bb:cc:dd:ee:02".parse().unwrap();
        b.ct_zone = 1043;
        b.port_no = 3;

        let flows = local_pair_flows(&a, &b);
        assert_eq!(flows.len(), 4);
        let pair = flows
            .iter()
            .find(|f| f.table == TABLE_LOCAL_PAIR
                && f.matches().iter().any(|m| m.as_str() == "dl_src=aa:bb:cc:dd:ee:01"))
            .unwrap();
        assert!(pair.actions.contains("ct(commit,zone=1042)"));
        assert!(pair.actions.contains("ct(commit,zone=1043)"));
    }

    #[test]
    fn test_nat_flows() {
        let mac = "0e:00:00:00:00:01".parse().unwrap();
        let flows =
            nat_flows("192.168.1.5".parse().unwrap(), "1.2.3.4".parse().unwrap(), &mac, 9);
        assert_eq!(flows.len(), 3);
        let arp = &flows[0];
        assert!(arp.actions.contains("load:0x1020304->NXM_OF_ARP_SPA[]"));
        assert!(arp.actions.contains("load:0xe0000000001->NXM_NX_ARP_SHA[]"));
        let dnat = &flows[1];
        assert_eq!(dnat.actions, "mod_nw_dst:192.168.1.5,output:9");
        let snat = &flows[2];
        assert_eq!(snat.actions, "mod_nw_src:1.2.3.4,normal");
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-resident SDN agent.
//!
//! Watches a directory of guest descriptors and programs Open vSwitch
//! flows, bridge ports, conntrack zones and Linux tc state so the
//! datapath matches what the descriptors declare. A local HTTP RPC
//! surface exposes imperative flow and port operations.

pub mod agent;
pub mod config;
pub mod ct_zone;
pub mod eip_man;
pub mod flow_man;
pub mod flows;
pub mod forwarder;
pub mod guest;
pub mod host_local;
pub mod http_entrypoints;
pub mod iface_janitor;
pub mod md_man;
pub mod ovn_man;
pub mod port_cache;
pub mod secrules;
pub mod tap_man;
pub mod tc_man;
pub mod watcher;

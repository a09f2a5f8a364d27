// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridge and port lifecycle operations, via `ovs-vsctl`.
//!
//! Every mutation is expressed idempotently (`--may-exist` /
//! `--if-exists`), so reconcilers can re-apply their wanted state on
//! every pass without tracking what they already did.

use crate::{execute_async, ExecutionError, OVS_VSCTL};

/// Wraps `ovs-vsctl` invocations.
pub struct Vsctl {}

impl Vsctl {
    async fn run(args: &[&str]) -> Result<std::process::Output, ExecutionError> {
        let mut cmd = tokio::process::Command::new(OVS_VSCTL);
        cmd.args(args);
        execute_async(&mut cmd).await
    }

    pub async fn add_bridge(bridge: &str) -> Result<(), ExecutionError> {
        Self::run(&["--", "--may-exist", "add-br", bridge]).await.map(|_| ())
    }

    pub async fn del_bridge(bridge: &str) -> Result<(), ExecutionError> {
        Self::run(&["--", "--if-exists", "del-br", bridge]).await.map(|_| ())
    }

    pub async fn add_port(bridge: &str, port: &str) -> Result<(), ExecutionError> {
        Self::run(&["--", "--may-exist", "add-port", bridge, port]).await.map(|_| ())
    }

    pub async fn del_port(bridge: &str, port: &str) -> Result<(), ExecutionError> {
        Self::run(&["--", "--if-exists", "del-port", bridge, port]).await.map(|_| ())
    }

    pub async fn list_bridges() -> Result<Vec<String>, ExecutionError> {
        let output = Self::run(&["list-br"]).await?;
        Ok(lines(&output))
    }

    pub async fn list_ports(bridge: &str) -> Result<Vec<String>, ExecutionError> {
        let output = Self::run(&["list-ports", bridge]).await?;
        Ok(lines(&output))
    }

    /// The OpenFlow port number of `port` on `bridge`, or None when the
    /// interface exists but has not been assigned one yet (ofport -1).
    pub async fn dump_port(bridge: &str, port: &str) -> Result<Option<u32>, ExecutionError> {
        // Guard against the port being attached to a different bridge.
        let ports = Self::list_ports(bridge).await?;
        if !ports.iter().any(|p| p == port) {
            return Ok(None);
        }
        let output = Self::run(&["get", "Interface", port, "ofport"]).await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let ofport: i64 = text.trim().parse().map_err(|_| {
            ExecutionError::ParseFailure(format!("ofport of {}: {:?}", port, text.trim()))
        })?;
        if ofport < 0 {
            return Ok(None);
        }
        Ok(Some(ofport as u32))
    }

    /// Create both halves of a patch-port pair joining two bridges.
    pub async fn add_patch_pair(
        bridge_a: &str,
        port_a: &str,
        bridge_b: &str,
        port_b: &str,
    ) -> Result<(), ExecutionError> {
        Self::run(&[
            "--",
            "--may-exist",
            "add-port",
            bridge_a,
            port_a,
            "--",
            "set",
            "Interface",
            port_a,
            "type=patch",
            &format!("options:peer={}", port_b),
            "--",
            "--may-exist",
            "add-port",
            bridge_b,
            port_b,
            "--",
            "set",
            "Interface",
            port_b,
            "type=patch",
            &format!("options:peer={}", port_a),
        ])
        .await
        .map(|_| ())
    }

    /// Attach a port and set its `external_ids:iface-id` in one
    /// transaction, as OVN interface binding requires.
    pub async fn add_port_with_iface_id(
        bridge: &str,
        port: &str,
        iface_id: &str,
    ) -> Result<(), ExecutionError> {
        Self::run(&[
            "--",
            "--may-exist",
            "add-port",
            bridge,
            port,
            "--",
            "set",
            "Interface",
            port,
            &format!("external_ids:iface-id={}", iface_id),
        ])
        .await
        .map(|_| ())
    }

    pub async fn get_interface_type(port: &str) -> Result<String, ExecutionError> {
        let output = Self::run(&["get", "Interface", port, "type"]).await?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.trim().trim_matches('"').to_string())
    }
}

fn lines(output: &std::process::Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

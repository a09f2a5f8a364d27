// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two iptables rules the agent owns: distributed-gateway
//! masquerading and the Geneve fast path.

use crate::{execute_async, ExecutionError, IPTABLES};

const DISTGW_COMMENT: &str = "sdnagent: ovn distgw";

/// Wraps `iptables` invocations. All mutations are check-then-apply so
/// that reconcilers can call them every pass.
pub struct Iptables {}

impl Iptables {
    async fn run(args: &[&str]) -> Result<std::process::Output, ExecutionError> {
        let mut cmd = tokio::process::Command::new(IPTABLES);
        cmd.args(args);
        execute_async(&mut cmd).await
    }

    async fn ensure(table: &str, insert: bool, chain: &str, spec: &[&str]) -> Result<(), ExecutionError> {
        let mut check = vec!["-t", table, "-C", chain];
        check.extend_from_slice(spec);
        if Self::run(&check).await.is_ok() {
            return Ok(());
        }
        let mut apply = vec!["-t", table, if insert { "-I" } else { "-A" }, chain];
        apply.extend_from_slice(spec);
        Self::run(&apply).await.map(|_| ())
    }

    /// `POSTROUTING` MASQUERADE for the mapped (distributed gateway)
    /// CIDR, excluding traffic staying inside it.
    pub async fn ensure_distgw_masquerade(cidr: &str) -> Result<(), ExecutionError> {
        Self::ensure(
            "nat",
            false,
            "POSTROUTING",
            &[
                "-s",
                cidr,
                "!",
                "-d",
                cidr,
                "-m",
                "comment",
                "--comment",
                DISTGW_COMMENT,
                "-j",
                "MASQUERADE",
            ],
        )
        .await
    }

    /// Accept Geneve (udp/6081) early in both filter INPUT and OUTPUT so
    /// overlay traffic never traverses the host's slower rule chains.
    pub async fn ensure_geneve_fast_path() -> Result<(), ExecutionError> {
        for chain in ["INPUT", "OUTPUT"] {
            Self::ensure(
                "filter",
                true,
                chain,
                &["-p", "udp", "--dport", "6081", "-j", "ACCEPT"],
            )
            .await?;
        }
        Ok(())
    }
}

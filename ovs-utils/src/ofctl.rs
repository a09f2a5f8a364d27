// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OpenFlow-level operations, via `ovs-ofctl`.

use crate::flow::Flow;
use crate::{execute_async, execute_with_stdin, ExecutionError, OVS_OFCTL};

/// Wraps `ovs-ofctl` invocations against a single bridge.
pub struct Ofctl {}

impl Ofctl {
    /// Dump the bridge's installed flows in canonical form. Hidden flows
    /// are not reported by `dump-flows` and so never appear in a diff.
    pub async fn dump_flows(bridge: &str) -> Result<Vec<Flow>, ExecutionError> {
        let mut cmd = tokio::process::Command::new(OVS_OFCTL);
        cmd.args(["dump-flows", bridge]);
        let output = execute_async(&mut cmd).await?;
        let text = String::from_utf8_lossy(&output.stdout);

        let mut flows = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("NXST_FLOW") || line.starts_with("OFPST_FLOW") {
                continue;
            }
            flows.push(Flow::parse_dump_line(line)?);
        }
        Ok(flows)
    }

    /// Commit deletions and additions as a single OpenFlow bundle.
    ///
    /// Strict deletes go first with the cookie wildcarded, so they hit
    /// the installed flow regardless of its cookie; then the adds. The
    /// switch applies the bundle atomically, so no intermediate state is
    /// ever observable.
    pub async fn commit_bundle(
        bridge: &str,
        dels: &[Flow],
        adds: &[Flow],
    ) -> Result<(), ExecutionError> {
        if dels.is_empty() && adds.is_empty() {
            return Ok(());
        }

        let mut script = String::new();
        for flow in dels {
            script.push_str("delete_strict ");
            script.push_str(&flow.del_line());
            script.push('\n');
        }
        for flow in adds {
            script.push_str("add ");
            script.push_str(&flow.add_line());
            script.push('\n');
        }

        let mut cmd = tokio::process::Command::new(OVS_OFCTL);
        cmd.args(["bundle", bridge, "-"]);
        execute_with_stdin(&mut cmd, script).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flow::Match;

    #[test]
    fn test_bundle_script_shape() {
        // The script builder is exercised through commit_bundle at
        // runtime; pin the per-line renderers it relies on here.
        let del = Flow::new(0, 100, vec![Match::flag("tcp")], "drop");
        let add = Flow::new(0, 100, vec![Match::flag("tcp")], "normal").with_cookie(0x20);
        assert_eq!(del.del_line(), "table=0,priority=100,tcp");
        assert_eq!(add.add_line(), "cookie=0x20,table=0,priority=100,tcp,actions=normal");
    }
}

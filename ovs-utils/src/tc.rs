// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Batched `tc` execution.

use crate::qdisc::QdiscTree;
use crate::{execute_with_stdin, ExecutionError, TC};

/// Wraps `tc -batch` invocations.
pub struct Tc {}

impl Tc {
    /// Run a batch script on stdin and return its combined stdout.
    ///
    /// `-force` keeps the batch going past individual command failures,
    /// matching the reconciler's retry-next-tick policy.
    pub async fn batch(script: String) -> Result<String, ExecutionError> {
        let mut cmd = tokio::process::Command::new(TC);
        cmd.args(["-force", "-batch", "-"]);
        let output = execute_with_stdin(&mut cmd, script).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Replace `ifname`'s qdisc tree with `want`, returning the tree the
    /// kernel reports back after the replace.
    pub async fn replace_tree(
        ifname: &str,
        want: &QdiscTree,
    ) -> Result<QdiscTree, ExecutionError> {
        let output = Self::batch(want.batch_replace_lines(ifname)).await?;
        QdiscTree::parse_show_output(&output)
    }

    /// Remove any configured root qdisc, reverting to the kernel default.
    pub async fn clear(ifname: &str) -> Result<(), ExecutionError> {
        let script = format!("qdisc del dev {} root\n", ifname);
        // Deleting an absent root fails; -force already swallows that,
        // and a failure here means there is nothing to clear anyway.
        let _ = Self::batch(script).await;
        Ok(())
    }
}

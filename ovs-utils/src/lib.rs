// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around the external commands the SDN agent drives (ovs-vsctl,
//! ovs-ofctl, tc, ip, iptables), plus the data types whose textual form
//! those commands speak.

use std::process::Stdio;

pub mod flow;
pub mod ip;
pub mod iptables;
pub mod netns;
pub mod ofctl;
pub mod qdisc;
pub mod tc;
pub mod vsctl;

pub const OVS_VSCTL: &str = "/usr/bin/ovs-vsctl";
pub const OVS_OFCTL: &str = "/usr/bin/ovs-ofctl";
pub const TC: &str = "/sbin/tc";
pub const IP: &str = "/sbin/ip";
pub const IPTABLES: &str = "/sbin/iptables";

#[derive(Debug)]
pub struct CommandFailureInfo {
    command: String,
    status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("Failed to write stdin of [{command}]: {err}")]
    StdinWrite { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("Failed to parse command output: {0}")]
    ParseFailure(String),
}

fn command_to_string(command: &std::process::Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into())
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn output_to_exec_error(
    command: &std::process::Command,
    output: &std::process::Output,
) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(command),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}

/// Run a command to completion, failing on a non-zero exit status. The
/// child inherits the caller's cancellation scope: dropping the future
/// kills the child.
pub async fn execute_async(
    command: &mut tokio::process::Command,
) -> Result<std::process::Output, ExecutionError> {
    let std_command = command.as_std();
    let command_str = command_to_string(std_command);

    let output = command.kill_on_drop(true).output().await.map_err(|err| {
        ExecutionError::ExecutionStart { command: command_str, err }
    })?;

    if !output.status.success() {
        let std_command = command.as_std();
        return Err(output_to_exec_error(std_command, &output));
    }

    Ok(output)
}

/// Run a command feeding `input` on its stdin, returning combined stdout.
///
/// Used for batched scripts (`tc -batch -`, `ovs-ofctl bundle <br> -`)
/// where the whole mutation must reach the tool as one unit.
pub async fn execute_with_stdin(
    command: &mut tokio::process::Command,
    input: String,
) -> Result<std::process::Output, ExecutionError> {
    let command_str = command_to_string(command.as_std());

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| ExecutionError::ExecutionStart {
            command: command_str.clone(),
            err,
        })?;

    {
        use tokio::io::AsyncWriteExt;
        let mut stdin = child.stdin.take().expect("piped stdin");
        stdin.write_all(input.as_bytes()).await.map_err(|err| {
            ExecutionError::StdinWrite { command: command_str.clone(), err }
        })?;
        // Dropping stdin closes it so the tool sees EOF.
    }

    let output = child.wait_with_output().await.map_err(|err| {
        ExecutionError::ExecutionStart { command: command_str.clone(), err }
    })?;

    if !output.status.success() {
        return Err(ExecutionError::CommandFailure(Box::new(
            CommandFailureInfo {
                command: command_str,
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            },
        )));
    }

    Ok(output)
}

pub fn output_to_string(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CLI client for the agent's RPC surface.
//!
//! Exits 0 only when the RPC round-trips and the agent answers code 0.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "sdnadm", about = "SDN agent admin client")]
struct Args {
    /// Base URL of the agent's RPC listener.
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install a flow under the imperative producer.
    AddFlow {
        bridge: String,
        #[arg(long, default_value_t = 0)]
        table: u8,
        #[arg(long)]
        priority: u16,
        /// Match predicate, repeatable (e.g. --match tcp --match nw_dst=10.0.0.1).
        #[arg(long = "match")]
        matches: Vec<String>,
        #[arg(long)]
        actions: String,
        #[arg(long, default_value_t = 0)]
        cookie: u64,
    },
    /// Remove a flow from the imperative producer.
    DelFlow {
        bridge: String,
        #[arg(long, default_value_t = 0)]
        table: u8,
        #[arg(long)]
        priority: u16,
        #[arg(long = "match")]
        matches: Vec<String>,
        #[arg(long)]
        actions: String,
    },
    /// Force one reconciliation of a bridge.
    SyncFlows { bridge: String },
    /// Print the OpenFlow number of a port.
    DumpBridgePort { bridge: String, port: String },
    AddBridge { bridge: String },
    DelBridge { bridge: String },
    AddBridgePort { bridge: String, port: String },
    DelBridgePort { bridge: String, port: String },
    /// Open a TCP forward inside a subnet's metadata namespace.
    OpenForward {
        net_id: String,
        #[arg(long, default_value = "tcp")]
        proto: String,
        #[arg(long, default_value = "0.0.0.0")]
        bind_addr: String,
        #[arg(long, default_value_t = 0)]
        bind_port: u16,
        #[arg(long)]
        remote_addr: String,
        #[arg(long)]
        remote_port: u16,
    },
    CloseForward {
        net_id: String,
        #[arg(long, default_value = "tcp")]
        proto: String,
        #[arg(long)]
        bind_addr: String,
        #[arg(long)]
        bind_port: u16,
    },
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    code: i32,
    mesg: String,
    port_no: Option<u32>,
}

fn request(command: &Command) -> (&'static str, serde_json::Value) {
    match command {
        Command::AddFlow { bridge, table, priority, matches, actions, cookie } => (
            "add-flow",
            json!({
                "bridge": bridge, "table": table, "priority": priority,
                "matches": matches, "actions": actions, "cookie": cookie,
            }),
        ),
        Command::DelFlow { bridge, table, priority, matches, actions } => (
            "del-flow",
            json!({
                "bridge": bridge, "table": table, "priority": priority,
                "matches": matches, "actions": actions,
            }),
        ),
        Command::SyncFlows { bridge } => ("sync-flows", json!({ "bridge": bridge })),
        Command::DumpBridgePort { bridge, port } => {
            ("dump-bridge-port", json!({ "bridge": bridge, "port": port }))
        }
        Command::AddBridge { bridge } => ("add-bridge", json!({ "bridge": bridge })),
        Command::DelBridge { bridge } => ("del-bridge", json!({ "bridge": bridge })),
        Command::AddBridgePort { bridge, port } => {
            ("add-bridge-port", json!({ "bridge": bridge, "port": port }))
        }
        Command::DelBridgePort { bridge, port } => {
            ("del-bridge-port", json!({ "bridge": bridge, "port": port }))
        }
        Command::OpenForward {
            net_id,
            proto,
            bind_addr,
            bind_port,
            remote_addr,
            remote_port,
        } => (
            "open-forward",
            json!({
                "proto": proto, "bind_addr": bind_addr, "bind_port": bind_port,
                "net_id": net_id, "remote_addr": remote_addr,
                "remote_port": remote_port,
            }),
        ),
        Command::CloseForward { net_id, proto, bind_addr, bind_port } => (
            "close-forward",
            json!({
                "proto": proto, "bind_addr": bind_addr, "bind_port": bind_port,
                "net_id": net_id,
            }),
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (path, body) = request(&args.command);
    let url = format!("{}/{}", args.server.trim_end_matches('/'), path);

    let response: AgentResponse = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("POST {}", url))?
        .error_for_status()
        .with_context(|| format!("POST {}", url))?
        .json()
        .await
        .context("parsing agent response")?;

    if let Some(port_no) = response.port_no {
        println!("{}", port_no);
    }
    if response.code != 0 {
        eprintln!("error: {}", response.mesg);
        std::process::exit(1);
    }
    Ok(())
}

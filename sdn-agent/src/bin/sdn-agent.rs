// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SDN agent daemon.

use anyhow::{anyhow, Context};
use clap::Parser;
use dropshot::{ConfigDropshot, HttpServerStarter};
use sdn_agent::agent::Agent;
use sdn_agent::config::Config;
use sdn_agent::eip_man::EipMan;
use sdn_agent::http_entrypoints::{self, ServerContext};
use sdn_agent::iface_janitor::IfaceJanitor;
use sdn_agent::md_man::MdMan;
use sdn_agent::ovn_man::OvnMan;
use sdn_agent::tap_man::TapMan;
use sdn_agent::watcher::Watcher;
use slog::{info, o};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

#[derive(Debug, Parser)]
#[command(name = "sdn-agent", about = "Host SDN agent")]
struct Args {
    /// Path to the agent configuration file.
    #[arg(long)]
    config: camino::Utf8PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Arc::new(
        Config::from_file(&args.config)
            .with_context(|| format!("loading config {}", args.config))?,
    );

    let log = config
        .log
        .to_logger("sdn-agent")
        .map_err(|err| anyhow!("initializing logger: {}", err))?;
    info!(log, "starting"; "servers_path" => config.servers_path.as_str());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent = Agent::new(&log, Arc::clone(&config), shutdown_rx.clone());
    let md_man = MdMan::new(&log, Arc::clone(&config));
    md_man.start_orphan_sweep(shutdown_rx.clone());

    // Inotify failure is fatal; the supervisor restarts the process.
    let watcher = Watcher::new(&log, Arc::clone(&agent), Arc::clone(&md_man))
        .context("starting descriptor watcher")?;
    let mut watcher_task = tokio::task::spawn(watcher.run());

    EipMan::start(&log, Arc::clone(&agent));
    OvnMan::start(&log, Arc::clone(&agent));
    TapMan::start(&log, Arc::clone(&agent));
    IfaceJanitor::start(&log, Arc::clone(&agent));

    let context = Arc::new(ServerContext { agent, md_man });
    let server = HttpServerStarter::new(
        &ConfigDropshot {
            bind_address: config.rpc_bind_address,
            ..Default::default()
        },
        http_entrypoints::api(),
        context,
        &log.new(o!("component" => "dropshot")),
    )
    .map_err(|err| anyhow!("starting RPC server: {}", err))?
    .start();
    let mut server_task = tokio::task::spawn(server);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!(log, "SIGTERM received; shutting down"),
        _ = sigint.recv() => info!(log, "SIGINT received; shutting down"),
        result = &mut watcher_task => {
            let _ = shutdown_tx.send(true);
            return Err(anyhow!("watcher exited: {:?}", result));
        }
        result = &mut server_task => {
            let _ = shutdown_tx.send(true);
            return Err(anyhow!("RPC server exited: {:?}", result));
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = watcher_task.await;
    Ok(())
}

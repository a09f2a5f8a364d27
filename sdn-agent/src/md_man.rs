// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-subnet metadata servers for VPC guests.
//!
//! Each VPC subnet with a live guest NIC gets one server: a private
//! network namespace, a veth pair whose peer end sits on the
//! integration bridge bound as `subnet-md/<net_id>`, and an HTTP
//! service inside the namespace that answers metadata lookups keyed by
//! the connection's source address. Servers are refcounted by NIC and
//! torn down when the last NIC leaves the subnet. The same namespace
//! hosts any TCP forwards opened for the subnet.

use crate::config::Config;
use crate::forwarder::{ForwardKey, NetnsForwarder};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use ovs_utils::ip::Ip;
use ovs_utils::netns::{self, NetnsWorker};
use ovs_utils::vsctl::Vsctl;
use ovs_utils::ExecutionError;
use serde::Serialize;
use slog::{debug, info, o, warn, Logger};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

const MD_HTTP_PORT: u16 = 80;
const ORPHAN_SWEEP_PERIOD: Duration = Duration::from_secs(300);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no metadata server for subnet {0}")]
    UnknownSubnet(String),

    #[error("forward {0:?} not found")]
    UnknownForward(ForwardKey),

    #[error("bad forward address {0:?}")]
    BadAddress(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("metadata listener setup failed: {0}")]
    Listener(std::io::Error),

    #[error(transparent)]
    Netns(#[from] netns::Error),

    #[error(transparent)]
    Forward(#[from] crate::forwarder::Error),
}

/// What the metadata service knows about one guest address. Written by
/// the watcher on every pass, read by the HTTP handlers.
#[derive(Debug, Clone, Serialize)]
pub struct GuestMeta {
    pub id: Uuid,
    pub name: String,
    pub net_id: String,
}

pub type GuestRegistry = Arc<RwLock<HashMap<Ipv4Addr, GuestMeta>>>;

/// Owner of every per-subnet metadata server.
pub struct MdMan {
    log: Logger,
    config: Arc<Config>,
    registry: GuestRegistry,
    servers: Mutex<HashMap<String, MdServer>>,
}

struct MdServer {
    refcount: usize,
    netns: String,
    peer_port: String,
    worker: Arc<NetnsWorker>,
    stop: watch::Sender<bool>,
    forwards: HashMap<ForwardKey, NetnsForwarder>,
}

/// Interface-facing names for a subnet's plumbing. Kernel interface
/// names cap at 15 bytes, so the net id is truncated.
fn netns_name(net_id: &str) -> String {
    let short: String = net_id.chars().filter(|c| *c != '-').take(9).collect();
    format!("md-{}", short)
}

impl MdMan {
    pub fn new(log: &Logger, config: Arc<Config>) -> Arc<Self> {
        Arc::new(MdMan {
            log: log.new(o!("component" => "MdMan")),
            config,
            registry: Arc::new(RwLock::new(HashMap::new())),
            servers: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> GuestRegistry {
        Arc::clone(&self.registry)
    }

    /// Reconcile the running servers against `wanted`, a map of subnet
    /// id to live-NIC count. Missing servers are started, servers whose
    /// subnet lost its last NIC are torn down.
    pub async fn sync_subnets(&self, wanted: &HashMap<String, usize>) {
        let mut servers = self.servers.lock().await;

        for (net_id, &count) in wanted {
            if count == 0 {
                continue;
            }
            match servers.get_mut(net_id) {
                Some(server) => server.refcount = count,
                None => match self.start_server(net_id).await {
                    Ok(mut server) => {
                        server.refcount = count;
                        info!(self.log, "metadata server started";
                            "net_id" => net_id, "netns" => &server.netns);
                        servers.insert(net_id.clone(), server);
                    }
                    Err(err) => {
                        warn!(self.log, "failed to start metadata server; will retry";
                            "net_id" => net_id, "err" => %err);
                    }
                },
            }
        }

        let gone: Vec<String> = servers
            .keys()
            .filter(|net_id| wanted.get(*net_id).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();
        for net_id in gone {
            if let Some(server) = servers.remove(&net_id) {
                info!(self.log, "metadata server stopping"; "net_id" => &net_id);
                self.stop_server(server).await;
            }
        }
    }

    async fn start_server(&self, net_id: &str) -> Result<MdServer, Error> {
        let ns = netns_name(net_id);
        let local = ns.clone();
        let peer = format!("{}-p", ns);

        Ip::netns_add(&ns).await?;
        Ip::veth_add(&local, &peer).await?;
        Ip::link_set_netns(&local, &ns).await?;
        Ip::link_up(&peer).await?;
        Ip::netns_exec(&ns, &["link", "set", "lo", "up"]).await?;
        Ip::netns_exec(&ns, &["link", "set", &local, "up"]).await?;
        for ip in &self.config.metadata_server_ips {
            Ip::netns_addr_add(&ns, &local, &format!("{}/32", ip)).await?;
        }
        for ip6 in &self.config.metadata_server_ip6s {
            Ip::netns_addr_add(&ns, &local, &format!("{}/128", ip6)).await?;
        }
        Vsctl::add_port_with_iface_id(
            &self.config.ovn_integration_bridge,
            &peer,
            &format!("subnet-md/{}", net_id),
        )
        .await?;

        let worker = Arc::new(NetnsWorker::new(&ns)?);
        let (stop, stop_rx) = watch::channel(false);
        self.spawn_http(&ns, Arc::clone(&worker), stop_rx).await?;

        Ok(MdServer {
            refcount: 0,
            netns: ns,
            peer_port: peer,
            worker,
            stop,
            forwards: HashMap::new(),
        })
    }

    async fn spawn_http(
        &self,
        ns: &str,
        worker: Arc<NetnsWorker>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), MD_HTTP_PORT);
        let listener =
            netns::listen_in_netns(&worker, bind).await?.map_err(Error::Listener)?;
        let listener =
            tokio::net::TcpListener::from_std(listener).map_err(Error::Listener)?;

        let log = self.log.new(o!("netns" => ns.to_string()));
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = stop.changed() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(log, "metadata accept failed"; "err" => %err);
                        continue;
                    }
                };
                let registry = Arc::clone(&registry);
                let log = log.clone();
                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_md_request(registry, peer.ip(), req) }
                    });
                    let conn = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service);
                    if let Err(err) = conn.await {
                        debug!(log, "metadata connection error"; "err" => %err);
                    }
                });
            }
        });
        Ok(())
    }

    async fn stop_server(&self, server: MdServer) {
        let _ = server.stop.send(true);
        for (_, forward) in server.forwards {
            forward.close();
        }
        if let Err(err) =
            Vsctl::del_port(&self.config.ovn_integration_bridge, &server.peer_port).await
        {
            warn!(self.log, "failed to detach metadata peer port";
                "port" => &server.peer_port, "err" => %err);
        }
        let _ = Ip::link_del(&server.peer_port).await;
        if let Err(err) = Ip::netns_del(&server.netns).await {
            warn!(self.log, "failed to delete metadata netns";
                "netns" => &server.netns, "err" => %err);
        }
    }

    /// Open a TCP forward inside the subnet's namespace; returns the
    /// actually-bound port.
    pub async fn open_forward(
        &self,
        net_id: &str,
        key: ForwardKey,
        remote_addr: &str,
        remote_port: u16,
    ) -> Result<u16, Error> {
        let bind: SocketAddr = format!("{}:{}", key.bind_addr, key.bind_port)
            .parse()
            .map_err(|_| Error::BadAddress(key.bind_addr.clone()))?;
        let remote: SocketAddr = format!("{}:{}", remote_addr, remote_port)
            .parse()
            .map_err(|_| Error::BadAddress(remote_addr.to_string()))?;

        let mut servers = self.servers.lock().await;
        let server = servers
            .get_mut(net_id)
            .ok_or_else(|| Error::UnknownSubnet(net_id.to_string()))?;

        let forward =
            NetnsForwarder::open(&self.log, Arc::clone(&server.worker), bind, remote)
                .await?;
        let bound_port = forward.bound().port();
        server.forwards.insert(key, forward);
        Ok(bound_port)
    }

    pub async fn close_forward(&self, net_id: &str, key: &ForwardKey) -> Result<(), Error> {
        let mut servers = self.servers.lock().await;
        let server = servers
            .get_mut(net_id)
            .ok_or_else(|| Error::UnknownSubnet(net_id.to_string()))?;
        match server.forwards.remove(key) {
            Some(forward) => {
                forward.close();
                Ok(())
            }
            None => Err(Error::UnknownForward(key.clone())),
        }
    }

    /// Periodically drop `md-*-p` peer ports on the integration bridge
    /// that no running server owns, left behind by unclean exits.
    pub fn start_orphan_sweep(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let md_man = Arc::clone(self);
        tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(ORPHAN_SWEEP_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                md_man.sweep_orphans().await;
            }
        });
    }

    async fn sweep_orphans(&self) {
        let bridge = &self.config.ovn_integration_bridge;
        let ports = match Vsctl::list_ports(bridge).await {
            Ok(ports) => ports,
            Err(err) => {
                warn!(self.log, "orphan sweep: list-ports failed"; "err" => %err);
                return;
            }
        };
        let servers = self.servers.lock().await;
        let live: Vec<&str> = servers.values().map(|s| s.peer_port.as_str()).collect();
        for port in ports {
            if !port.starts_with("md-") || !port.ends_with("-p") {
                continue;
            }
            if live.contains(&port.as_str()) {
                continue;
            }
            info!(self.log, "removing orphan metadata port"; "port" => &port);
            let _ = Vsctl::del_port(bridge, &port).await;
            let _ = Ip::link_del(&port).await;
        }
    }
}

fn handle_md_request(
    registry: GuestRegistry,
    peer: IpAddr,
    _req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let IpAddr::V4(peer) = peer else {
        return Ok(not_found());
    };
    let meta = registry.read().unwrap().get(&peer).cloned();
    let response = match meta {
        Some(meta) => {
            let body = serde_json::to_vec(&meta).unwrap_or_default();
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
        None => not_found(),
    };
    Ok(response)
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_netns_name_fits_interface_limits() {
        let name = netns_name("a1b2c3d4-e5f6-7890-abcd-ef0123456789");
        assert_eq!(name, "md-a1b2c3d4e");
        // Peer name must fit IFNAMSIZ (15 chars + NUL).
        assert!(format!("{}-p", name).len() <= 15);

        assert_eq!(netns_name("short"), "md-short");
    }
}

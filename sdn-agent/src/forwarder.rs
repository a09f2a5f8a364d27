// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TCP port forwarding through a private network namespace.
//!
//! A forwarder listens on `(bind_addr, bind_port)` inside a namespace,
//! dials `(remote_addr, remote_port)` inside the same namespace for
//! each accepted connection and splices both directions. The listener
//! socket and the outbound connects are created on the namespace's
//! pinned worker thread; everything after that is ordinary async IO.

use ovs_utils::netns::{self, NetnsWorker};
use slog::{debug, info, o, warn, Logger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

/// A splice direction that moves no data for this long is cut.
const DIRECTION_DEADLINE: Duration = Duration::from_secs(3600);
/// A listener with no new connection for this long closes itself.
const LISTENER_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 3600);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Netns(#[from] netns::Error),

    #[error("Failed to bind {addr} in netns: {err}")]
    Bind { addr: SocketAddr, err: std::io::Error },

    #[error("Listener setup failed: {0}")]
    Listener(std::io::Error),
}

/// Identity of one forward, as the RPC surface addresses it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardKey {
    pub proto: String,
    pub bind_addr: String,
    pub bind_port: u16,
}

/// A running forward. Dropping the handle, or calling [`close`], stops
/// the accept loop; in-flight splices run to completion or deadline.
///
/// [`close`]: NetnsForwarder::close
pub struct NetnsForwarder {
    bound: SocketAddr,
    stop: watch::Sender<bool>,
}

impl NetnsForwarder {
    pub async fn open(
        log: &Logger,
        worker: Arc<NetnsWorker>,
        bind: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Self, Error> {
        let listener = netns::listen_in_netns(&worker, bind)
            .await?
            .map_err(|err| Error::Bind { addr: bind, err })?;
        let listener =
            tokio::net::TcpListener::from_std(listener).map_err(Error::Listener)?;
        let bound = listener.local_addr().map_err(Error::Listener)?;

        let (stop, stop_rx) = watch::channel(false);
        let log = log.new(o!(
            "component" => "NetnsForwarder",
            "netns" => worker.netns().to_string(),
            "bind" => bound.to_string(),
            "remote" => remote.to_string(),
        ));
        tokio::task::spawn(accept_loop(log, worker, listener, remote, stop_rx));

        Ok(NetnsForwarder { bound, stop })
    }

    /// The address actually bound; differs from the requested one when
    /// the caller asked for port 0.
    pub fn bound(&self) -> SocketAddr {
        self.bound
    }

    pub fn close(&self) {
        let _ = self.stop.send(true);
    }
}

impl Drop for NetnsForwarder {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    log: Logger,
    worker: Arc<NetnsWorker>,
    listener: tokio::net::TcpListener,
    remote: SocketAddr,
    mut stop: watch::Receiver<bool>,
) {
    info!(log, "forward open");
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => {
                info!(log, "forward closed");
                return;
            }
            _ = tokio::time::sleep(LISTENER_IDLE_TIMEOUT) => {
                info!(log, "forward idle too long; closing");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        let (client, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(log, "accept failed"; "err" => %err);
                continue;
            }
        };
        debug!(log, "accepted"; "peer" => %peer);

        let upstream = match netns::connect_in_netns(&worker, remote, CONNECT_TIMEOUT)
            .await
        {
            Ok(Ok(stream)) => match tokio::net::TcpStream::from_std(stream) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(log, "failed to register upstream socket"; "err" => %err);
                    continue;
                }
            },
            Ok(Err(err)) => {
                warn!(log, "dial failed"; "err" => %err);
                continue;
            }
            Err(err) => {
                warn!(log, "netns worker gone"; "err" => %err);
                return;
            }
        };

        tokio::task::spawn(splice(log.clone(), client, upstream));
    }
}

/// Copy both directions until EOF, error or deadline; report the two
/// halves' outcomes as one aggregated log line.
async fn splice(log: Logger, client: tokio::net::TcpStream, upstream: tokio::net::TcpStream) {
    let (mut cr, mut cw) = client.into_split();
    let (mut ur, mut uw) = upstream.into_split();

    let up = async {
        let res = tokio::time::timeout(
            DIRECTION_DEADLINE,
            tokio::io::copy(&mut cr, &mut uw),
        )
        .await;
        let _ = uw.shutdown().await;
        res
    };
    let down = async {
        let res = tokio::time::timeout(
            DIRECTION_DEADLINE,
            tokio::io::copy(&mut ur, &mut cw),
        )
        .await;
        let _ = cw.shutdown().await;
        res
    };
    let (up, down) = tokio::join!(up, down);

    let mut errs = Vec::new();
    for (dir, res) in [("up", up), ("down", down)] {
        match res {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => errs.push(format!("{}: {}", dir, err)),
            Err(_) => errs.push(format!("{}: deadline exceeded", dir)),
        }
    }
    if errs.is_empty() {
        debug!(log, "splice done");
    } else {
        warn!(log, "splice ended with errors"; "errs" => errs.join("; "));
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker threads for code that must run inside a non-default network
//! namespace.
//!
//! Joining a namespace is thread-local state, so every namespace-scoped
//! operation is dispatched to a dedicated OS thread that enters the
//! namespace for the duration of the closure and restores the host
//! namespace before picking up the next job. Sockets created by a
//! closure keep the namespace they were created in, so the returned
//! listener/stream can then be driven from ordinary async tasks.

use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::os::fd::AsFd;
use std::sync::mpsc;

pub const NETNS_RUN_DIR: &str = "/run/netns";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to open netns {path}: {err}")]
    OpenNetns { path: String, err: std::io::Error },

    #[error("setns({netns}) failed: {err}")]
    Setns { netns: String, err: nix::Error },

    #[error("netns worker for {0} is gone")]
    WorkerGone(String),
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A worker thread bound to one named network namespace.
pub struct NetnsWorker {
    netns: String,
    tx: mpsc::Sender<Job>,
}

impl NetnsWorker {
    /// Spawn the worker. The namespace must already exist; opening it is
    /// verified eagerly so callers learn about a missing namespace here
    /// rather than on first use.
    pub fn new(netns: &str) -> Result<Self, Error> {
        let path = format!("{}/{}", NETNS_RUN_DIR, netns);
        // Eager check only; the thread re-opens per job in case the
        // namespace is recreated underneath us.
        File::open(&path)
            .map_err(|err| Error::OpenNetns { path: path.clone(), err })?;

        let (tx, rx) = mpsc::channel::<Job>();
        let name = netns.to_string();
        std::thread::Builder::new()
            .name(format!("netns-{}", name))
            .spawn(move || worker_loop(name, rx))
            .expect("spawn netns worker thread");

        Ok(NetnsWorker { netns: netns.to_string(), tx })
    }

    /// Run `f` inside the namespace, waiting asynchronously for its
    /// result.
    pub async fn run<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(f());
        });
        self.tx
            .send(job)
            .map_err(|_| Error::WorkerGone(self.netns.clone()))?;
        rx.await.map_err(|_| Error::WorkerGone(self.netns.clone()))
    }

    pub fn netns(&self) -> &str {
        &self.netns
    }
}

fn worker_loop(netns: String, rx: mpsc::Receiver<Job>) {
    // The host namespace, for restoring after each job.
    let host = match File::open("/proc/self/ns/net") {
        Ok(f) => f,
        Err(_) => return,
    };

    while let Ok(job) = rx.recv() {
        let path = format!("{}/{}", NETNS_RUN_DIR, netns);
        let target = match File::open(&path) {
            Ok(f) => f,
            // Namespace vanished; drop the job. The sender observes
            // this as a closed oneshot.
            Err(_) => continue,
        };
        if setns(target.as_fd(), CloneFlags::CLONE_NEWNET).is_err() {
            continue;
        }
        job();
        // Restore before the next job no matter what the job did.
        let _ = setns(host.as_fd(), CloneFlags::CLONE_NEWNET);
    }
}

/// Create a std TCP listener bound inside `netns`, ready for conversion
/// into a tokio listener by the caller.
pub async fn listen_in_netns(
    worker: &NetnsWorker,
    addr: std::net::SocketAddr,
) -> Result<std::io::Result<std::net::TcpListener>, Error> {
    worker
        .run(move || {
            let listener = std::net::TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            Ok(listener)
        })
        .await
}

/// Open a std TCP connection from inside `netns`. The connect itself
/// blocks the worker thread, never the async runtime.
pub async fn connect_in_netns(
    worker: &NetnsWorker,
    addr: std::net::SocketAddr,
    timeout: std::time::Duration,
) -> Result<std::io::Result<std::net::TcpStream>, Error> {
    worker
        .run(move || {
            let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
            stream.set_nonblocking(true)?;
            Ok(stream)
        })
        .await
}

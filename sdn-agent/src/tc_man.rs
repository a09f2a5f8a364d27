// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Traffic-control reconciliation.
//!
//! One task owns all qdisc state, keyed by producer label the same way
//! FlowMan keys flows. Each label owns a section of per-interface pages
//! `{want, got}`; whenever a page's wanted tree differs from the cached
//! kernel tree, the reconciler emits one batched `tc` script ending in
//! `qdisc show`, parses the reply and caches it as the new `got`.

use ovs_utils::qdisc::QdiscTree;
use ovs_utils::tc::Tc;
use slog::{debug, info, o, warn, Logger};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

const TC_MAN_IDLE_CHECK: Duration = Duration::from_secs(37);
const QUEUE_SIZE: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to send request to TcMan: channel closed")]
    FailedSendTcManClosed,

    #[error("TcMan dropped our request")]
    RequestDropped(#[from] oneshot::error::RecvError),
}

/// Wanted tc state for one interface.
#[derive(Debug, Clone)]
pub struct TcData {
    pub ifname: String,
    pub tree: QdiscTree,
}

impl TcData {
    /// Shaping for a guest NIC: `bw_mbps` zero or negative means no
    /// limit, just sane queueing.
    pub fn for_bandwidth(ifname: &str, bw_mbps: i64, mpu: u64) -> Self {
        let tree = if bw_mbps > 0 {
            QdiscTree::shaped(bw_mbps as u64, mpu)
        } else {
            QdiscTree::unshaped()
        };
        TcData { ifname: ifname.to_string(), tree }
    }
}

enum TcManRequest {
    AddIfaces { who: String, data: Vec<TcData>, tx: oneshot::Sender<()> },
    ClearIfaces { who: String, tx: oneshot::Sender<()> },
}

/// Handle to the tc reconciler task.
#[derive(Clone)]
pub struct TcMan {
    tx: mpsc::Sender<TcManRequest>,
}

impl TcMan {
    pub fn new(log: &Logger, shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let runner = TcManRunner {
            log: log.new(o!("component" => "TcMan")),
            rx,
            shutdown,
            sections: HashMap::new(),
        };
        tokio::task::spawn(async move { runner.run().await });
        TcMan { tx }
    }

    /// Declare `who`'s wanted state for the given interfaces. Interfaces
    /// `who` previously declared but no longer lists are cleared.
    pub async fn add_ifaces(&self, who: &str, data: Vec<TcData>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(TcManRequest::AddIfaces { who: who.to_string(), data, tx })
            .await
            .map_err(|_| Error::FailedSendTcManClosed)?;
        rx.await.map_err(Error::from)
    }

    /// Drop everything `who` declared, reverting those interfaces to
    /// kernel defaults.
    pub async fn clear_ifaces(&self, who: &str) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(TcManRequest::ClearIfaces { who: who.to_string(), tx })
            .await
            .map_err(|_| Error::FailedSendTcManClosed)?;
        rx.await.map_err(Error::from)
    }
}

#[derive(Debug)]
struct Page {
    ifname: String,
    want: QdiscTree,
    got: Option<QdiscTree>,
}

struct TcManRunner {
    log: Logger,
    rx: mpsc::Receiver<TcManRequest>,
    shutdown: watch::Receiver<bool>,
    /// who → ifname → page.
    sections: HashMap<String, HashMap<String, Page>>,
}

impl TcManRunner {
    async fn run(mut self) {
        let mut idle = tokio::time::interval(TC_MAN_IDLE_CHECK);
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!(self.log, "shutting down");
                    break;
                }
                _ = idle.tick() => {
                    self.reconcile().await;
                }
                request = self.rx.recv() => {
                    let Some(request) = request else {
                        warn!(self.log, "request channel closed; shutting down");
                        break;
                    };
                    self.handle_request(request).await;
                    idle.reset();
                }
            }
        }
    }

    async fn handle_request(&mut self, request: TcManRequest) {
        match request {
            TcManRequest::AddIfaces { who, data, tx } => {
                let section = self.sections.entry(who).or_default();
                let keep: Vec<String> = data.iter().map(|d| d.ifname.clone()).collect();
                let dropped: Vec<String> = section
                    .keys()
                    .filter(|ifname| !keep.contains(ifname))
                    .cloned()
                    .collect();
                for ifname in dropped {
                    section.remove(&ifname);
                    let _ = Tc::clear(&ifname).await;
                }
                for TcData { ifname, tree } in data {
                    match section.get_mut(&ifname) {
                        Some(page) if page.want == tree => {}
                        Some(page) => {
                            page.want = tree;
                        }
                        None => {
                            section.insert(
                                ifname.clone(),
                                Page { ifname, want: tree, got: None },
                            );
                        }
                    }
                }
                self.reconcile().await;
                let _ = tx.send(());
            }
            TcManRequest::ClearIfaces { who, tx } => {
                if let Some(section) = self.sections.remove(&who) {
                    for (ifname, _) in section {
                        let _ = Tc::clear(&ifname).await;
                    }
                }
                let _ = tx.send(());
            }
        }
    }

    /// Visit every page; re-apply wherever the cached kernel state does
    /// not match the wanted tree.
    async fn reconcile(&mut self) {
        for section in self.sections.values_mut() {
            for page in section.values_mut() {
                if page.got.as_ref() == Some(&page.want) {
                    continue;
                }
                debug!(self.log, "replacing qdisc tree"; "ifname" => &page.ifname);
                match Tc::replace_tree(&page.ifname, &page.want).await {
                    Ok(got) => {
                        if got != page.want {
                            // The kernel accepted something other than
                            // what we asked for; keep its answer so we
                            // do not re-batch every tick.
                            warn!(self.log, "kernel qdisc state differs from wanted";
                                "ifname" => &page.ifname);
                        }
                        page.got = Some(got);
                    }
                    Err(err) => {
                        warn!(self.log, "tc batch failed; will retry";
                            "ifname" => &page.ifname, "err" => %err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tc_data_for_bandwidth() {
        let shaped = TcData::for_bandwidth("vnet0", 100, 64);
        assert_eq!(shaped.tree.qdiscs().len(), 2);
        let unshaped = TcData::for_bandwidth("vnet0", 0, 0);
        assert_eq!(unshaped.tree.qdiscs().len(), 1);
        assert_ne!(shaped.tree, unshaped.tree);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-bridge OpenFlow reconciliation.
//!
//! Each bridge gets one [`FlowMan`]: a single-writer task owning the
//! authoritative flow state as per-producer subsets. Producers address
//! their subset by label (`who`); the imperative RPC surface operates on
//! the reserved `THEMAN` label. Reconciliation dumps the live switch,
//! diffs it against the union of all subsets and commits the delta as
//! one OpenFlow bundle, so no intermediate state is ever observable.

use ovs_utils::flow::{Flow, FlowSet};
use ovs_utils::ofctl::Ofctl;
use slog::{debug, info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Producer label for imperative RPC operations.
pub const WHO_THEMAN: &str = "THEMAN";
/// Producer label owning the permanent normal-action fallback.
pub const WHO_FAILSAFE: &str = "FAILSAFE";

/// Reconcile this often when idle.
pub const FLOW_MAN_IDLE_CHECK: Duration = Duration::from_secs(13);

const QUEUE_SIZE: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to send request to FlowMan: channel closed")]
    FailedSendFlowManClosed,

    #[error("FlowMan dropped our request")]
    RequestDropped(#[from] oneshot::error::RecvError),
}

enum FlowManRequest {
    AddFlow { flow: Flow, tx: oneshot::Sender<()> },
    DelFlow { flow: Flow, tx: oneshot::Sender<()> },
    SyncFlows { tx: Option<oneshot::Sender<()>> },
    UpdateFlows { who: String, flows: Vec<Flow>, tx: Option<oneshot::Sender<()>> },
}

struct FlowManInner {
    bridge: String,
    tx: mpsc::Sender<FlowManRequest>,
    wait_count: AtomicI32,
}

/// Handle to one bridge's reconciler task.
#[derive(Clone)]
pub struct FlowMan {
    inner: Arc<FlowManInner>,
}

impl FlowMan {
    pub fn new(log: &Logger, bridge: &str, shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let inner = Arc::new(FlowManInner {
            bridge: bridge.to_string(),
            tx,
            wait_count: AtomicI32::new(0),
        });

        let mut flow_sets = HashMap::new();
        let mut failsafe = FlowSet::new();
        failsafe.add(Flow::failsafe());
        flow_sets.insert(WHO_FAILSAFE.to_string(), failsafe);

        let runner = FlowManRunner {
            log: log.new(o!("component" => "FlowMan", "bridge" => bridge.to_string())),
            inner: Arc::clone(&inner),
            rx,
            shutdown,
            flow_sets,
        };
        tokio::task::spawn(async move { runner.run().await });

        FlowMan { inner }
    }

    pub fn bridge(&self) -> &str {
        &self.inner.bridge
    }

    /// Add a flow under the imperative `THEMAN` label and reconcile.
    pub async fn add_flow(&self, flow: Flow) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(FlowManRequest::AddFlow { flow, tx })
            .await
            .map_err(|_| Error::FailedSendFlowManClosed)?;
        rx.await.map_err(Error::from)
    }

    /// Remove a flow from the `THEMAN` label and reconcile.
    pub async fn del_flow(&self, flow: Flow) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(FlowManRequest::DelFlow { flow, tx })
            .await
            .map_err(|_| Error::FailedSendFlowManClosed)?;
        rx.await.map_err(Error::from)
    }

    /// Force a reconciliation, waiting for it to complete.
    pub async fn sync_flows(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(FlowManRequest::SyncFlows { tx: Some(tx) })
            .await
            .map_err(|_| Error::FailedSendFlowManClosed)?;
        rx.await.map_err(Error::from)
    }

    /// Replace `who`'s entire subset and reconcile.
    pub async fn update_flows(&self, who: &str, flows: Vec<Flow>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(FlowManRequest::UpdateFlows {
                who: who.to_string(),
                flows,
                tx: Some(tx),
            })
            .await
            .map_err(|_| Error::FailedSendFlowManClosed)?;
        rx.await.map_err(Error::from)
    }

    /// Replace `who`'s subset inside a watcher barrier pass: the wait
    /// count is raised first, so reconciliation stays parked until the
    /// pass ends with [`FlowMan::wait_decr`] and a sync.
    pub async fn update_flows_deferred(
        &self,
        who: &str,
        flows: Vec<Flow>,
    ) -> Result<(), Error> {
        self.inner.wait_count.fetch_add(1, Ordering::SeqCst);
        self.inner
            .tx
            .send(FlowManRequest::UpdateFlows { who: who.to_string(), flows, tx: None })
            .await
            .map_err(|_| Error::FailedSendFlowManClosed)
    }

    /// End-of-pass accounting: drop `count` outstanding barriers. The
    /// count may overshoot the number of pending syncs when a producer
    /// published the same bridge twice in one pass; the subtraction
    /// still zeroes the counter, which is all reconciliation needs.
    pub fn wait_decr(&self, count: i32) {
        self.inner.wait_count.fetch_sub(count, Ordering::SeqCst);
    }

    pub fn wait_count(&self) -> i32 {
        self.inner.wait_count.load(Ordering::SeqCst)
    }
}

struct FlowManRunner {
    log: Logger,
    inner: Arc<FlowManInner>,
    rx: mpsc::Receiver<FlowManRequest>,
    shutdown: watch::Receiver<bool>,
    flow_sets: HashMap<String, FlowSet>,
}

impl FlowManRunner {
    async fn run(mut self) {
        let mut idle = tokio::time::interval(FLOW_MAN_IDLE_CHECK);
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!(self.log, "shutting down");
                    break;
                }
                _ = idle.tick() => {
                    self.do_check().await;
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

    async fn handle_request(&mut self, request: FlowManRequest) {
        match request {
            FlowManRequest::AddFlow { flow, tx } => {
                let set = self.flow_sets.entry(WHO_THEMAN.to_string()).or_default();
                if !set.add(flow.clone()) {
                    // Lenient on replay: the caller must not break.
                    warn!(self.log, "add of duplicate flow"; "flow" => %flow);
                }
                self.do_check().await;
                let _ = tx.send(());
            }
            FlowManRequest::DelFlow { flow, tx } => {
                let set = self.flow_sets.entry(WHO_THEMAN.to_string()).or_default();
                if !set.remove(&flow) {
                    warn!(self.log, "del of unknown flow"; "flow" => %flow);
                }
                self.do_check().await;
                let _ = tx.send(());
            }
            FlowManRequest::SyncFlows { tx } => {
                self.do_check().await;
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
            }
            FlowManRequest::UpdateFlows { who, flows, tx } => {
                debug!(self.log, "update flows"; "who" => &who, "count" => flows.len());
                self.flow_sets.insert(who, FlowSet::from_flows(flows));
                self.do_check().await;
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
            }
        }
    }

    /// Converge the switch onto ⋃ producer subsets.
    async fn do_check(&mut self) {
        let waiting = self.inner.wait_count.load(Ordering::SeqCst);
        if waiting > 0 {
            // A multi-producer pass is still publishing; converging now
            // would race the switch with half-updated state.
            debug!(self.log, "check deferred"; "wait_count" => waiting);
            return;
        }

        let dumped = match Ofctl::dump_flows(&self.inner.bridge).await {
            Ok(flows) => FlowSet::from_flows(flows),
            Err(err) => {
                warn!(self.log, "failed to dump flows; will retry";
                    "err" => %err);
                return;
            }
        };

        let union = union_flow_sets(&self.flow_sets);
        let (adds, dels) = union.diff(&dumped);
        if adds.is_empty() && dels.is_empty() {
            return;
        }

        info!(self.log, "committing flow delta";
            "adds" => adds.len(), "dels" => dels.len());
        if let Err(err) = Ofctl::commit_bundle(&self.inner.bridge, &dels, &adds).await {
            warn!(self.log, "bundle commit failed; will retry"; "err" => %err);
        }
    }
}

/// The union of all producer subsets. Duplicate keys across producers
/// collapse; the result still contains the failsafe as long as any set
/// does, so recovery from a wiped bridge always restores baseline
/// forwarding.
fn union_flow_sets(flow_sets: &HashMap<String, FlowSet>) -> FlowSet {
    let mut union = FlowSet::new();
    // Deterministic order keeps bundle contents stable across runs.
    let mut whos: Vec<&String> = flow_sets.keys().collect();
    whos.sort();
    for who in whos {
        for flow in flow_sets[who].iter() {
            union.add(flow.clone());
        }
    }
    union
}

#[cfg(test)]
mod test {
    use super::*;
    use ovs_utils::flow::Match;

    fn flow(table: u8, priority: u16, m: &str, actions: &str) -> Flow {
        Flow::new(table, priority, vec![Match::flag(m)], actions)
    }

    #[test]
    fn test_union_includes_failsafe_and_collapses_duplicates() {
        let mut sets = HashMap::new();
        let mut failsafe = FlowSet::new();
        failsafe.add(Flow::failsafe());
        sets.insert(WHO_FAILSAFE.to_string(), failsafe);

        let shared = flow(1, 40, "ct_state=+inv+trk", "drop");
        sets.insert(
            "guest-a".to_string(),
            FlowSet::from_flows(vec![shared.clone(), flow(0, 100, "g=a", "x")]),
        );
        sets.insert(
            "guest-b".to_string(),
            FlowSet::from_flows(vec![shared.clone(), flow(0, 100, "g=b", "x")]),
        );

        let union = union_flow_sets(&sets);
        assert!(union.contains(&Flow::failsafe()));
        assert_eq!(union.iter().filter(|f| **f == shared).count(), 1);
        assert_eq!(union.len(), 4);
    }

    #[test]
    fn test_delta_restores_wiped_bridge() {
        let mut sets = HashMap::new();
        let mut failsafe = FlowSet::new();
        failsafe.add(Flow::failsafe());
        sets.insert(WHO_FAILSAFE.to_string(), failsafe);
        sets.insert(
            "guest".to_string(),
            FlowSet::from_flows(vec![flow(0, 27300, "ip", "ct(zone=7,table=1)")]),
        );

        // The switch was wiped externally: dump comes back empty.
        let union = union_flow_sets(&sets);
        let (adds, dels) = union.diff(&FlowSet::new());
        assert!(dels.is_empty());
        assert_eq!(adds.len(), 2);
        assert!(adds.iter().any(|f| *f == Flow::failsafe()));
    }

    #[tokio::test]
    async fn test_barrier_accounting() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let log = slog::Logger::root(slog::Discard, o!());
        let fm = FlowMan::new(&log, "br-test", shutdown_rx);

        fm.update_flows_deferred("a", vec![]).await.unwrap();
        fm.update_flows_deferred("b", vec![]).await.unwrap();
        fm.update_flows_deferred("a", vec![]).await.unwrap();
        assert_eq!(fm.wait_count(), 3);

        // One producer published twice; the carrier counted 3 and the
        // single decrement still zeroes the counter.
        fm.wait_decr(3);
        assert_eq!(fm.wait_count(), 0);
    }
}

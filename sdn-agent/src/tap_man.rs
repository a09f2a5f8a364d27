// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The traffic-capture (tap) bridge.
//!
//! Port mirrors dump into this bridge; nothing should ever be forwarded
//! back out of it. The manager keeps the bridge alive and publishes a
//! drop rule above the failsafe so mirrored frames terminate here.

use crate::agent::Agent;
use ovs_utils::flow::Flow;
use ovs_utils::vsctl::Vsctl;
use slog::{info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;

pub const WHO_TAPMAN: &str = "tapman";

const TAP_MAN_PERIOD: Duration = Duration::from_secs(67);

pub struct TapMan {
    log: Logger,
    agent: Arc<Agent>,
}

impl TapMan {
    pub fn start(log: &Logger, agent: Arc<Agent>) {
        let tap_man = TapMan { log: log.new(o!("component" => "TapMan")), agent };
        let mut shutdown = tap_man.agent.shutdown_rx();
        tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(TAP_MAN_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!(tap_man.log, "shutting down");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                tap_man.do_sync().await;
            }
        });
    }

    async fn do_sync(&self) {
        let bridge = &self.agent.config.tap_bridge;
        if let Err(err) = Vsctl::add_bridge(bridge).await {
            warn!(self.log, "failed to ensure tap bridge"; "err" => %err);
            return;
        }

        let flow_man = self.agent.get_flow_man(bridge);
        let flows = vec![Flow::new(0, 5, vec![], "drop")];
        if let Err(err) = flow_man.update_flows(WHO_TAPMAN, flows).await {
            warn!(self.log, "failed to publish tap flows"; "err" => %err);
        }
    }
}

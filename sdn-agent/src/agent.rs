// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide wiring: the FlowMan registry and the shared handles
//! every component gets injected with.

use crate::config::Config;
use crate::flow_man::FlowMan;
use crate::tc_man::TcMan;
use slog::{o, Logger};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

/// The agent's shared state. Constructed once in the daemon binary and
/// injected into the watcher, the managers and the RPC facade.
pub struct Agent {
    log: Logger,
    pub config: Arc<Config>,
    shutdown: watch::Receiver<bool>,
    flow_mans: RwLock<HashMap<String, FlowMan>>,
    pub tc_man: TcMan,
}

impl Agent {
    pub fn new(
        log: &Logger,
        config: Arc<Config>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let log = log.new(o!("component" => "Agent"));
        let tc_man = TcMan::new(&log, shutdown.clone());
        Arc::new(Agent {
            log,
            config,
            shutdown,
            flow_mans: RwLock::new(HashMap::new()),
            tc_man,
        })
    }

    /// The FlowMan for `bridge`, starting one on first use.
    pub fn get_flow_man(&self, bridge: &str) -> FlowMan {
        if let Some(fm) = self.flow_mans.read().unwrap().get(bridge) {
            return fm.clone();
        }
        let mut flow_mans = self.flow_mans.write().unwrap();
        // Somebody may have raced us between the locks.
        flow_mans
            .entry(bridge.to_string())
            .or_insert_with(|| FlowMan::new(&self.log, bridge, self.shutdown.clone()))
            .clone()
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config() -> Arc<Config> {
        Arc::new(
            toml::from_str(
                r#"
                servers_path = "/srv"
                networks = ["eth0/br0/10.168.222.136"]

                [log]
                mode = "stderr-terminal"
                level = "info"
                "#,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_get_flow_man_is_lazy_and_stable() {
        let (_tx, rx) = watch::channel(false);
        let log = Logger::root(slog::Discard, o!());
        let agent = Agent::new(&log, test_config(), rx);

        let a = agent.get_flow_man("br0");
        let b = agent.get_flow_man("br0");
        assert_eq!(a.bridge(), b.bridge());
        assert_eq!(agent.flow_mans.read().unwrap().len(), 1);

        agent.get_flow_man("br1");
        assert_eq!(agent.flow_mans.read().unwrap().len(), 2);
    }
}

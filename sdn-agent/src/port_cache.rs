// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Short-TTL cache of OpenFlow port numbers.
//!
//! A watcher pass can look up the same (bridge, port) many times in a
//! burst; a 3 second TTL absorbs that without letting the agent act on
//! stale numbers for long. Only successful lookups are cached so a port
//! appearing on the bridge is observed on the next query.

use ovs_utils::vsctl::Vsctl;
use ovs_utils::ExecutionError;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const PORT_CACHE_TTL: Duration = Duration::from_secs(3);
const PORT_CACHE_CAP: usize = 2048;

static CACHE: RwLock<Option<HashMap<(String, String), (u32, Instant)>>> =
    RwLock::new(None);

/// The OpenFlow port number of `port` on `bridge`, through the cache.
pub async fn dump_port(bridge: &str, port: &str) -> Result<Option<u32>, ExecutionError> {
    let key = (bridge.to_string(), port.to_string());

    {
        let cache = CACHE.read().unwrap();
        if let Some(map) = cache.as_ref() {
            if let Some((port_no, at)) = map.get(&key) {
                if at.elapsed() < PORT_CACHE_TTL {
                    return Ok(Some(*port_no));
                }
            }
        }
    }

    let port_no = Vsctl::dump_port(bridge, port).await?;

    if let Some(port_no) = port_no {
        let mut cache = CACHE.write().unwrap();
        let map = cache.get_or_insert_with(HashMap::new);
        let now = Instant::now();
        if map.len() >= PORT_CACHE_CAP {
            map.retain(|_, (_, at)| at.elapsed() < PORT_CACHE_TTL);
            // Still full of fresh entries: drop the map rather than
            // grow without bound.
            if map.len() >= PORT_CACHE_CAP {
                map.clear();
            }
        }
        map.insert(key, (port_no, now));
    }

    Ok(port_no)
}

/// Drop any cached entry for (bridge, port); used after port deletion.
pub fn invalidate(bridge: &str, port: &str) {
    let mut cache = CACHE.write().unwrap();
    if let Some(map) = cache.as_mut() {
        map.remove(&(bridge.to_string(), port.to_string()));
    }
}

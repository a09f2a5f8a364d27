// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The descriptor-directory watcher.
//!
//! Owns the Guest map and the conntrack-zone book, turns inotify events
//! and periodic ticks into barrier passes over the FlowMen, and keeps
//! the per-subnet metadata servers in step with the live NICs.
//!
//! A pass may publish to many bridges through many producers. To keep
//! the switch from ever seeing a half-updated pass, every publish goes
//! through a [`WaitData`] carrier: each deferred update raises the
//! bridge's wait count (parking its reconciler), and the pass ends by
//! dropping the counts and forcing exactly one sync per touched bridge.

use crate::agent::Agent;
use crate::ct_zone::CtZoneBook;
use crate::flows::NicFacts;
use crate::guest::Guest;
use crate::host_local;
use crate::md_man::{GuestMeta, MdMan};
use crate::port_cache;
use crate::tc_man::TcData;
use ovs_utils::flow::Flow;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Full refresh of host-local and every guest.
pub const WATCHER_REFRESH_RATE: Duration = Duration::from_secs(31);
/// Retry cadence while any guest is pending.
pub const WATCHER_REFRESH_RATE_ON_ERROR: Duration = Duration::from_secs(7);
/// A guest pending longer than this stops being fast-retried; the full
/// refresh still picks it up.
pub const WATCHER_RECENT_PENDING_TIME: Duration = Duration::from_secs(120);

const EVENT_QUEUE_SIZE: usize = 256;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("inotify setup failed: {0}")]
    Inotify(#[from] nix::Error),

    #[error("descriptor scan of {path} failed: {err}")]
    Scan {
        path: String,
        #[source]
        err: std::io::Error,
    },

    #[error("watch event channel closed")]
    ChannelClosed,
}

fn uuid_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            "^[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$",
        )
        .unwrap()
    })
}

/// A filesystem change, already classified by the inotify thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// `<uuid>/` created: a new guest.
    AddServerDir(Uuid),
    /// `<uuid>/` removed: the guest is gone for good.
    DelServerDir(Uuid),
    /// `desc`, `pid` or `startvm` written: resync the guest.
    UpdServer(Uuid),
    /// `pid` removed: the guest stopped but may restart.
    DelServer(Uuid),
}

/// Per-pass accounting of deferred updates, one entry per touched
/// bridge.
struct WaitData {
    entries: HashMap<String, (crate::flow_man::FlowMan, i32)>,
}

impl WaitData {
    fn new() -> Self {
        WaitData { entries: HashMap::new() }
    }

    async fn update_flows(
        &mut self,
        agent: &Agent,
        bridge: &str,
        who: &str,
        flows: Vec<Flow>,
    ) {
        let (flow_man, count) = self
            .entries
            .entry(bridge.to_string())
            .or_insert_with(|| (agent.get_flow_man(bridge), 0));
        if flow_man.update_flows_deferred(who, flows).await.is_ok() {
            *count += 1;
        }
    }

    /// End the pass: unpark every touched reconciler and force one
    /// consolidated sync per bridge.
    async fn finish(self, log: &Logger) {
        for (bridge, (flow_man, count)) in self.entries {
            flow_man.wait_decr(count);
            if let Err(err) = flow_man.sync_flows().await {
                warn!(log, "end-of-pass sync failed"; "bridge" => bridge, "err" => %err);
            }
        }
    }
}

struct GuestEntry {
    guest: Guest,
    /// Bridges this guest currently publishes flows on, for clearing.
    published: HashSet<String>,
    /// MACs holding conntrack zones, for freeing on change or removal.
    macs: Vec<String>,
    /// Resolved NIC facts from the last successful publish; pair-commit
    /// flows between guests are computed from these.
    facts: Vec<NicFacts>,
}

/// Producer label for the pair-commit flows of one bridge.
fn pair_who(bridge: &str) -> String {
    format!("localpair.{}", bridge)
}

/// Pair-commit flows between every two resolved NICs sharing a bridge,
/// across guests. Both conntrack zones must see an intra-host
/// connection or the second zone drops the reply as untracked.
fn pair_flows_by_bridge<'a>(
    entries: impl Iterator<Item = &'a GuestEntry>,
) -> HashMap<String, Vec<Flow>> {
    let mut nics: HashMap<&str, Vec<&NicFacts>> = HashMap::new();
    for entry in entries {
        for nic in &entry.facts {
            nics.entry(nic.bridge.as_str()).or_default().push(nic);
        }
    }

    let mut by_bridge = HashMap::new();
    for (bridge, nics) in nics {
        let mut flows = Vec::new();
        for (i, a) in nics.iter().enumerate() {
            for b in &nics[i + 1..] {
                flows.extend(crate::flows::local_pair_flows(a, b));
            }
        }
        if !flows.is_empty() {
            by_bridge.insert(bridge.to_string(), flows);
        }
    }
    by_bridge
}

pub struct Watcher {
    log: Logger,
    agent: std::sync::Arc<Agent>,
    md_man: std::sync::Arc<MdMan>,
    zones: CtZoneBook,
    guests: HashMap<Uuid, GuestEntry>,
    /// Bridges currently carrying published pair-commit flows.
    pair_bridges: HashSet<String>,
    rx: mpsc::Receiver<WatchEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Watcher {
    /// Build the watcher and start its inotify thread. An inotify setup
    /// failure here is fatal; without events the agent would run on
    /// stale state.
    pub fn new(
        log: &Logger,
        agent: std::sync::Arc<Agent>,
        md_man: std::sync::Arc<MdMan>,
    ) -> Result<Self, Error> {
        let log = log.new(o!("component" => "Watcher"));
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        inotify_thread::spawn(&log, agent.config.servers_path.as_str(), tx)?;

        let zones = CtZoneBook::new(agent.config.ct_zone_base);
        let shutdown = agent.shutdown_rx();
        Ok(Watcher {
            log,
            agent,
            md_man,
            zones,
            guests: HashMap::new(),
            pair_bridges: HashSet::new(),
            rx,
            shutdown,
        })
    }

    pub async fn run(mut self) -> Result<(), Error> {
        self.scan_existing()?;
        host_local::ensure_bridges(&self.log, &self.agent.config).await;
        self.full_pass().await;

        let mut full = tokio::time::interval(WATCHER_REFRESH_RATE);
        full.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        full.reset();
        let mut pending = tokio::time::interval(WATCHER_REFRESH_RATE_ON_ERROR);
        pending.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!(self.log, "shutting down");
                    return Ok(());
                }
                _ = full.tick() => {
                    self.full_pass().await;
                }
                _ = pending.tick() => {
                    let ids = self.recent_pending();
                    if !ids.is_empty() {
                        debug!(self.log, "retrying pending guests"; "count" => ids.len());
                        self.pass(&ids, false).await;
                    }
                }
                event = self.rx.recv() => {
                    let Some(event) = event else {
                        error!(self.log, "inotify thread died");
                        return Err(Error::ChannelClosed);
                    };
                    self.handle_event(event).await;
                }
            }
        }
    }

    fn scan_existing(&mut self) -> Result<(), Error> {
        let path = &self.agent.config.servers_path;
        let entries = std::fs::read_dir(path)
            .map_err(|err| Error::Scan { path: path.to_string(), err })?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !uuid_regex().is_match(name) {
                continue;
            }
            let Ok(id) = name.parse::<Uuid>() else { continue };
            self.ensure_guest(id);
        }
        info!(self.log, "initial descriptor scan"; "guests" => self.guests.len());
        Ok(())
    }

    fn ensure_guest(&mut self, id: Uuid) -> &mut GuestEntry {
        let servers_path = self.agent.config.servers_path.clone();
        self.guests.entry(id).or_insert_with(|| GuestEntry {
            guest: Guest::new(id, &servers_path),
            published: HashSet::new(),
            macs: Vec::new(),
            facts: Vec::new(),
        })
    }

    fn recent_pending(&self) -> Vec<Uuid> {
        self.guests
            .iter()
            .filter(|(_, e)| match e.guest.last_seen_pending {
                Some(at) => at.elapsed() < WATCHER_RECENT_PENDING_TIME,
                None => false,
            })
            .map(|(id, _)| *id)
            .collect()
    }

    async fn handle_event(&mut self, event: WatchEvent) {
        debug!(self.log, "watch event"; "event" => ?event);
        match event {
            WatchEvent::AddServerDir(id) | WatchEvent::UpdServer(id) => {
                self.ensure_guest(id);
                self.pass(&[id], false).await;
            }
            WatchEvent::DelServer(id) => {
                // Stopped, not gone: clear the datapath, keep watching.
                let mut wait = WaitData::new();
                if let Some(entry) = self.guests.get_mut(&id) {
                    entry.guest.pid = None;
                    entry.guest.last_seen_pending = None;
                    clear_guest(&self.log, &self.agent, entry, &mut wait).await;
                }
                self.publish_pair_flows(&mut wait).await;
                wait.finish(&self.log).await;
                self.sync_metadata().await;
            }
            WatchEvent::DelServerDir(id) => {
                let mut wait = WaitData::new();
                if let Some(mut entry) = self.guests.remove(&id) {
                    clear_guest(&self.log, &self.agent, &mut entry, &mut wait).await;
                    for mac in &entry.macs {
                        self.zones.free(mac);
                    }
                }
                self.publish_pair_flows(&mut wait).await;
                wait.finish(&self.log).await;
                self.sync_metadata().await;
            }
        }
    }

    /// One barrier pass over the given guests; with `with_host_local`,
    /// the host-side flows of every configured network are republished
    /// too.
    async fn pass(&mut self, ids: &[Uuid], with_host_local: bool) {
        let mut wait = WaitData::new();

        if with_host_local {
            let config = std::sync::Arc::clone(&self.agent.config);
            for network in &config.networks {
                let flows = host_local::bridge_flows(&self.log, &config, network).await;
                wait.update_flows(
                    &self.agent,
                    &network.bridge,
                    &host_local::who(&network.bridge),
                    flows,
                )
                .await;
            }
        }

        for id in ids {
            self.update_guest(*id, &mut wait).await;
        }

        self.publish_pair_flows(&mut wait).await;
        wait.finish(&self.log).await;
        self.sync_metadata().await;
    }

    /// Republish the cross-guest pair-commit flows of every bridge
    /// whose NIC population changed, and clear bridges that lost their
    /// last pair.
    async fn publish_pair_flows(&mut self, wait: &mut WaitData) {
        let by_bridge = pair_flows_by_bridge(self.guests.values());
        for bridge in &self.pair_bridges {
            if !by_bridge.contains_key(bridge) {
                wait.update_flows(&self.agent, bridge, &pair_who(bridge), Vec::new())
                    .await;
            }
        }
        self.pair_bridges = by_bridge.keys().cloned().collect();
        for (bridge, flows) in by_bridge {
            wait.update_flows(&self.agent, &bridge, &pair_who(&bridge), flows).await;
        }
    }

    async fn full_pass(&mut self) {
        let ids: Vec<Uuid> = self.guests.keys().copied().collect();
        self.pass(&ids, true).await;
    }

    /// Reload one guest from disk and publish its wanted state. A guest
    /// whose port numbers cannot be resolved yet keeps its previous
    /// flows and is marked pending for fast retry.
    async fn update_guest(&mut self, id: Uuid, wait: &mut WaitData) {
        let config = std::sync::Arc::clone(&self.agent.config);
        let Some(entry) = self.guests.get_mut(&id) else { return };

        if let Err(err) = entry.guest.reload() {
            warn!(self.log, "failed to load guest; skipping";
                "guest" => %id, "err" => %err);
            return;
        }

        // Free zones of MACs that left the descriptor.
        let desc = entry.guest.desc.as_ref().unwrap();
        let macs: Vec<String> = desc
            .nics
            .iter()
            .filter(|nic| !nic.is_virtual)
            .map(|nic| nic.mac.to_string().to_lowercase())
            .collect();
        for old in &entry.macs {
            if !macs.contains(old) {
                self.zones.free(old);
            }
        }
        entry.macs = macs;

        if !entry.guest.is_running() {
            // A stopped VM is not pending; it waits for a pid write.
            entry.guest.last_seen_pending = None;
            clear_guest(&self.log, &self.agent, entry, wait).await;
            return;
        }

        let mut facts = Vec::new();
        let desc = entry.guest.desc.as_ref().unwrap();
        for nic in &desc.nics {
            if nic.is_virtual || config.network_for_bridge(&nic.bridge).is_none() {
                continue;
            }
            let port_no = match port_cache::dump_port(&nic.bridge, &nic.ifname).await {
                Ok(Some(port_no)) => port_no,
                Ok(None) => {
                    debug!(self.log, "port not in bridge yet; guest pending";
                        "guest" => %id, "bridge" => &nic.bridge, "port" => &nic.ifname);
                    entry.guest.last_seen_pending.get_or_insert_with(Instant::now);
                    return;
                }
                Err(err) => {
                    warn!(self.log, "port lookup failed; guest pending";
                        "guest" => %id, "port" => &nic.ifname, "err" => %err);
                    entry.guest.last_seen_pending.get_or_insert_with(Instant::now);
                    return;
                }
            };
            let mac = nic.mac.to_string().to_lowercase();
            let ct_zone = match self.zones.alloc(&mac) {
                Ok(zone) => zone,
                Err(err) => {
                    warn!(self.log, "conntrack zone allocation failed; guest pending";
                        "guest" => %id, "err" => %err);
                    entry.guest.last_seen_pending.get_or_insert_with(Instant::now);
                    return;
                }
            };
            facts.push(NicFacts {
                bridge: nic.bridge.clone(),
                ifname: nic.ifname.clone(),
                port_no,
                mac: nic.mac,
                ip: nic.ip,
                vlan: nic.vlan,
                ct_zone,
            });
        }

        let by_bridge = match entry.guest.compute_flows(&config, &facts) {
            Ok(by_bridge) => by_bridge,
            Err(err) => {
                warn!(self.log, "failed to compile guest flows; skipping";
                    "guest" => %id, "err" => %err);
                return;
            }
        };

        let who = entry.guest.who();
        // Clear bridges the guest no longer touches before publishing
        // the new state.
        let current: HashSet<String> = by_bridge.keys().cloned().collect();
        for bridge in entry.published.difference(&current) {
            wait.update_flows(&self.agent, bridge, &who, Vec::new()).await;
        }
        for (bridge, flows) in by_bridge {
            wait.update_flows(&self.agent, &bridge, &who, flows).await;
        }
        entry.published = current;

        let tc: Vec<TcData> = entry.guest.compute_tc();
        if let Err(err) = self.agent.tc_man.add_ifaces(&who, tc).await {
            warn!(self.log, "tc update failed"; "guest" => %id, "err" => %err);
        }

        entry.facts = facts;
        entry.guest.last_seen_pending = None;
    }

    /// Rebuild the metadata registry and reconcile per-subnet servers
    /// from the current guest map.
    async fn sync_metadata(&self) {
        let mut registry = HashMap::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for entry in self.guests.values() {
            if !entry.guest.is_running() {
                continue;
            }
            let Some(desc) = &entry.guest.desc else { continue };
            for nic in &desc.nics {
                let Some(net_id) = &nic.net_id else { continue };
                *counts.entry(net_id.clone()).or_default() += 1;
                registry.insert(
                    nic.ip,
                    GuestMeta {
                        id: entry.guest.id,
                        name: desc.name.clone(),
                        net_id: net_id.clone(),
                    },
                );
            }
        }
        *self.md_man.registry().write().unwrap() = registry;
        self.md_man.sync_subnets(&counts).await;
    }
}

/// Publish empty sets on every bridge the guest owns flows on and drop
/// its tc state.
async fn clear_guest(
    log: &Logger,
    agent: &Agent,
    entry: &mut GuestEntry,
    wait: &mut WaitData,
) {
    let who = entry.guest.who();
    for bridge in entry.published.drain() {
        wait.update_flows(agent, &bridge, &who, Vec::new()).await;
    }
    entry.facts.clear();
    if let Err(err) = agent.tc_man.clear_ifaces(&who).await {
        warn!(log, "tc clear failed"; "guest" => %entry.guest.id, "err" => %err);
    }
}

mod inotify_thread {
    //! The blocking inotify reader. Classification happens here so the
    //! async side only ever sees typed [`WatchEvent`]s.

    use super::{uuid_regex, Error, WatchEvent};
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
    use slog::{debug, warn, Logger};
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    pub(super) fn spawn(
        log: &Logger,
        servers_path: &str,
        tx: mpsc::Sender<WatchEvent>,
    ) -> Result<(), Error> {
        let inotify = Inotify::init(InitFlags::empty())?;
        let root_mask = AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_MOVED_TO
            | AddWatchFlags::IN_MOVED_FROM;
        let root = inotify.add_watch(servers_path, root_mask)?;

        let log = log.new(slog::o!("thread" => "inotify"));
        let path = servers_path.to_string();
        std::thread::Builder::new()
            .name("inotify".to_string())
            .spawn(move || reader_loop(log, inotify, root, path, tx))
            .expect("spawn inotify thread");
        Ok(())
    }

    fn guest_mask() -> AddWatchFlags {
        AddWatchFlags::IN_CLOSE_WRITE
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_MOVED_TO
    }

    fn reader_loop(
        log: Logger,
        inotify: Inotify,
        root: WatchDescriptor,
        path: String,
        tx: mpsc::Sender<WatchEvent>,
    ) {
        let mut dirs: HashMap<WatchDescriptor, Uuid> = HashMap::new();

        // Watch guest directories that already exist; the async side
        // does its own initial scan for guest creation.
        if let Ok(entries) = std::fs::read_dir(&path) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(id) = parse_uuid(name) {
                        if let Ok(wd) = inotify
                            .add_watch(&entry.path(), guest_mask())
                        {
                            dirs.insert(wd, id);
                        }
                    }
                }
            }
        }

        loop {
            let events = match inotify.read_events() {
                Ok(events) => events,
                Err(err) => {
                    warn!(log, "inotify read failed"; "err" => %err);
                    // Dropping tx closes the channel; the watcher
                    // treats that as fatal.
                    return;
                }
            };

            for event in events {
                let name = event.name.as_ref().and_then(|n| n.to_str());

                if event.mask.contains(AddWatchFlags::IN_IGNORED) {
                    dirs.remove(&event.wd);
                    continue;
                }

                let classified = if event.wd == root {
                    classify_root(&log, &inotify, &path, &mut dirs, &event.mask, name)
                } else if let Some(&id) = dirs.get(&event.wd) {
                    classify_guest(&event.mask, name, id)
                } else {
                    None
                };

                if let Some(watch_event) = classified {
                    debug!(log, "classified"; "event" => ?watch_event);
                    if tx.blocking_send(watch_event).is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn parse_uuid(name: &str) -> Option<Uuid> {
        if !uuid_regex().is_match(name) {
            return None;
        }
        name.parse().ok()
    }

    fn classify_root(
        log: &Logger,
        inotify: &Inotify,
        path: &str,
        dirs: &mut HashMap<WatchDescriptor, Uuid>,
        mask: &AddWatchFlags,
        name: Option<&str>,
    ) -> Option<WatchEvent> {
        let id = parse_uuid(name?)?;

        if mask.intersects(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO) {
            if !mask.contains(AddWatchFlags::IN_ISDIR) {
                return None;
            }
            let dir = format!("{}/{}", path, id);
            match inotify.add_watch(dir.as_str(), guest_mask()) {
                Ok(wd) => {
                    dirs.insert(wd, id);
                }
                Err(err) => {
                    // The directory may already be gone again.
                    warn!(log, "failed to watch guest dir";
                        "guest" => %id, "err" => %err);
                }
            }
            return Some(WatchEvent::AddServerDir(id));
        }
        if mask.intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MOVED_FROM) {
            return Some(WatchEvent::DelServerDir(id));
        }
        None
    }

    fn classify_guest(
        mask: &AddWatchFlags,
        name: Option<&str>,
        id: Uuid,
    ) -> Option<WatchEvent> {
        match name? {
            "desc" | "startvm" => {
                if mask
                    .intersects(AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO)
                {
                    Some(WatchEvent::UpdServer(id))
                } else {
                    None
                }
            }
            "pid" => {
                if mask.contains(AddWatchFlags::IN_DELETE) {
                    Some(WatchEvent::DelServer(id))
                } else if mask
                    .intersects(AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO)
                {
                    Some(WatchEvent::UpdServer(id))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        fn id() -> Uuid {
            "01234567-89ab-cdef-0123-456789abcdef".parse().unwrap()
        }

        #[test]
        fn test_classify_guest_events() {
            let upd = classify_guest(&AddWatchFlags::IN_CLOSE_WRITE, Some("desc"), id());
            assert_eq!(upd, Some(WatchEvent::UpdServer(id())));

            let del = classify_guest(&AddWatchFlags::IN_DELETE, Some("pid"), id());
            assert_eq!(del, Some(WatchEvent::DelServer(id())));

            // A desc removal is not an event; the guest dir removal is
            // what clears the guest.
            assert_eq!(classify_guest(&AddWatchFlags::IN_DELETE, Some("desc"), id()), None);
            assert_eq!(
                classify_guest(&AddWatchFlags::IN_CLOSE_WRITE, Some("console.log"), id()),
                None
            );
        }

        #[test]
        fn test_uuid_regex() {
            assert!(parse_uuid("01234567-89ab-cdef-0123-456789abcdef").is_some());
            // Uppercase and non-uuid names are not guests.
            assert!(parse_uuid("01234567-89AB-CDEF-0123-456789ABCDEF").is_none());
            assert!(parse_uuid("lost+found").is_none());
            assert!(parse_uuid("01234567-89ab-cdef-0123").is_none());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry_with_facts(id: &str, facts: Vec<NicFacts>) -> GuestEntry {
        let id: Uuid = id.parse().unwrap();
        GuestEntry {
            guest: Guest::new(id, &camino::Utf8PathBuf::from("/srv")),
            published: HashSet::new(),
            macs: Vec::new(),
            facts,
        }
    }

    fn nic(bridge: &str, port_no: u32, last_octet: u8, ct_zone: u16) -> NicFacts {
        NicFacts {
            bridge: bridge.to_string(),
            ifname: format!("vnet{}", port_no),
            port_no,
            mac: format!("aa:bb:cc:dd:ee:{:02x}", last_octet).parse().unwrap(),
            ip: format!("10.0.0.{}", last_octet).parse().unwrap(),
            vlan: 1,
            ct_zone,
        }
    }

    #[test]
    fn test_pair_flows_span_guests() {
        // Two single-NIC guests on one bridge still get the dual-zone
        // pair commits; a lone NIC on another bridge gets none.
        let entries = [
            entry_with_facts(
                "01234567-89ab-cdef-0123-456789abcdef",
                vec![nic("br0", 2, 1, 1042)],
            ),
            entry_with_facts(
                "11234567-89ab-cdef-0123-456789abcdef",
                vec![nic("br0", 3, 2, 1043)],
            ),
            entry_with_facts(
                "21234567-89ab-cdef-0123-456789abcdef",
                vec![nic("br1", 4, 3, 1044)],
            ),
        ];

        let by_bridge = pair_flows_by_bridge(entries.iter());
        assert_eq!(by_bridge.keys().collect::<Vec<_>>(), vec!["br0"]);
        let br0 = &by_bridge["br0"];
        assert!(br0
            .iter()
            .any(|f| f.actions.contains("ct(commit,zone=1042)")
                && f.actions.contains("ct(commit,zone=1043)")));
    }

    #[test]
    fn test_pair_flows_include_multi_nic_guest() {
        // Two NICs of the same guest on a shared bridge pair up too.
        let entries = [entry_with_facts(
            "01234567-89ab-cdef-0123-456789abcdef",
            vec![nic("br0", 2, 1, 1042), nic("br0", 3, 2, 1043)],
        )];
        let by_bridge = pair_flows_by_bridge(entries.iter());
        assert!(!by_bridge["br0"].is_empty());
    }

    #[tokio::test]
    async fn test_wait_data_counts_per_bridge() {
        let (_tx, rx) = watch::channel(false);
        let log = Logger::root(slog::Discard, o!());
        let config: crate::config::Config = toml::from_str(
            r#"
            servers_path = "/srv"
            networks = ["eth0/br0/10.168.222.136"]

            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        )
        .unwrap();
        let agent = Agent::new(&log, std::sync::Arc::new(config), rx);

        let mut wait = WaitData::new();
        wait.update_flows(&agent, "br0", "a", vec![]).await;
        wait.update_flows(&agent, "br0", "b", vec![]).await;
        wait.update_flows(&agent, "br1", "a", vec![]).await;

        assert_eq!(wait.entries["br0"].1, 2);
        assert_eq!(wait.entries["br1"].1, 1);
        assert_eq!(agent.get_flow_man("br0").wait_count(), 2);
        assert_eq!(agent.get_flow_man("br1").wait_count(), 1);

        wait.finish(&log).await;
        assert_eq!(agent.get_flow_man("br0").wait_count(), 0);
        assert_eq!(agent.get_flow_man("br1").wait_count(), 0);
    }
}

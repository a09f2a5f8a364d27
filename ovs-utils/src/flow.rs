// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical OpenFlow rule representation and set semantics.
//!
//! A [`Flow`] is keyed on (table, priority, canonical match set, actions).
//! The match set is unordered; canonicalization sorts the rendered
//! predicates lexically so that flows compare equal regardless of the
//! order a producer (or `ovs-ofctl dump-flows`) listed them in. The
//! cookie is advisory: it is rendered on adds but never participates in
//! equality, and delete lines omit it entirely so the deletion matches
//! an installed flow regardless of who installed it.
//!
//! The switch rewrites flows on install: `actions=normal` dumps back as
//! `NORMAL`, `ct(...)` arguments come back in the switch's own order,
//! and `dl_type` matches for well-known ethertypes come back as their
//! shorthand (`ip`, `ipv6`, `arp`). Equality therefore compares a
//! normalized form of matches and actions, while adds render exactly
//! what the producer wrote.

use crate::ExecutionError;
use std::collections::HashSet;
use std::fmt;

/// A single match predicate in its `ovs-ofctl` textual form, e.g.
/// `nw_src=10.0.0.0/24`, `tcp`, or `ct_state=+trk+new`. Stored in the
/// normalized form `dump-flows` reports: lowercase, with well-known
/// `dl_type` values folded into their shorthand.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Match(String);

impl Match {
    /// A bare protocol/flag predicate such as `ip`, `tcp`, `arp`.
    pub fn flag<S: Into<String>>(name: S) -> Self {
        Match(normalize_match(&name.into()))
    }

    /// A `key=value` predicate.
    pub fn kv<K: fmt::Display, V: fmt::Display>(key: K, value: V) -> Self {
        Match(normalize_match(&format!("{}={}", key, value)))
    }

    /// A `key=value/mask` predicate.
    pub fn masked<K: fmt::Display>(key: K, value: u32, mask: u32) -> Self {
        Match(format!("{}=0x{:x}/0x{:x}", key, value, mask))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Fold a match predicate into the form `dump-flows` reports it in.
/// Lowercasing also covers MAC addresses, which formatters render
/// uppercase but the switch dumps lowercase.
fn normalize_match(token: &str) -> String {
    let token = token.trim().to_ascii_lowercase();
    match token.as_str() {
        "dl_type=0x0800" => "ip".to_string(),
        "dl_type=0x0806" => "arp".to_string(),
        "dl_type=0x86dd" => "ipv6".to_string(),
        _ => token,
    }
}

/// Split an action list on top-level commas, leaving parenthesized
/// arguments (`resubmit(,1)`, `ct(commit,zone=17)`) intact.
fn split_actions(actions: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in actions.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// The comparison form of an action list. Case is folded (the switch
/// dumps `NORMAL`, `IN_PORT` and friends uppercase) and `ct(...)`
/// arguments are sorted, because the switch reorders them on install.
fn normalize_actions(actions: &str) -> String {
    split_actions(actions)
        .iter()
        .map(|token| {
            let token = token.to_ascii_lowercase();
            match token.strip_prefix("ct(").and_then(|t| t.strip_suffix(')')) {
                Some(args) => {
                    let mut args = split_actions(args);
                    args.sort();
                    format!("ct({})", args.join(","))
                }
                None => token,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Flow {
    pub table: u8,
    pub priority: u16,
    matches: Vec<Match>,
    pub actions: String,
    pub cookie: u64,
}

impl Flow {
    pub fn new<A: Into<String>>(
        table: u8,
        priority: u16,
        matches: Vec<Match>,
        actions: A,
    ) -> Self {
        let mut flow = Flow {
            table,
            priority,
            matches,
            actions: actions.into(),
            cookie: 0,
        };
        flow.canonicalize();
        flow
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    /// The failsafe rule: `table=0 priority=0 actions=normal`.
    pub fn failsafe() -> Self {
        Flow::new(0, 0, vec![], "normal")
    }

    fn canonicalize(&mut self) {
        self.matches.sort();
        self.matches.dedup();
    }

    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    /// Key uniquely identifying this flow within a switch table: the
    /// cookie is deliberately excluded.
    pub fn key(&self) -> FlowKey {
        FlowKey {
            table: self.table,
            priority: self.priority,
            matches: self.matches.clone(),
            actions: normalize_actions(&self.actions),
        }
    }

    /// Key identifying the match side only, as a strict delete would.
    pub fn match_key(&self) -> String {
        format!("table={},priority={},{}", self.table, self.priority, self.render_matches())
    }

    fn render_matches(&self) -> String {
        self.matches
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Render in `ovs-ofctl add-flow` syntax.
    pub fn add_line(&self) -> String {
        let mut out = format!(
            "cookie=0x{:x},table={},priority={}",
            self.cookie, self.table, self.priority
        );
        let matches = self.render_matches();
        if !matches.is_empty() {
            out.push(',');
            out.push_str(&matches);
        }
        out.push_str(",actions=");
        out.push_str(&self.actions);
        out
    }

    /// Render in strict-delete syntax. No cookie is emitted, which in
    /// OpenFlow terms wildcards the cookie: the deletion hits whatever
    /// flow occupies this (table, priority, match) slot, whoever
    /// installed it and with whatever cookie.
    pub fn del_line(&self) -> String {
        let mut out = format!("table={},priority={}", self.table, self.priority);
        let matches = self.render_matches();
        if !matches.is_empty() {
            out.push(',');
            out.push_str(&matches);
        }
        out
    }

    /// Parse one line of `ovs-ofctl dump-flows` output into canonical
    /// form. Statistics annotations are stripped; the remaining tokens
    /// before ` actions=` are the match set.
    pub fn parse_dump_line(line: &str) -> Result<Flow, ExecutionError> {
        let line = line.trim();
        let (lhs, actions) = line.split_once("actions=").ok_or_else(|| {
            ExecutionError::ParseFailure(format!("no actions in flow: {:?}", line))
        })?;

        let mut table = 0u8;
        let mut priority = 0u16;
        let mut cookie = 0u64;
        let mut matches = Vec::new();

        for token in lhs.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };
            match (key, value) {
                ("cookie", Some(v)) => {
                    let v = v.trim_start_matches("0x");
                    cookie = u64::from_str_radix(v, 16).map_err(|_| {
                        ExecutionError::ParseFailure(format!("bad cookie: {:?}", token))
                    })?;
                }
                ("table", Some(v)) => {
                    table = v.parse().map_err(|_| {
                        ExecutionError::ParseFailure(format!("bad table: {:?}", token))
                    })?;
                }
                ("priority", Some(v)) => {
                    priority = v.parse().map_err(|_| {
                        ExecutionError::ParseFailure(format!("bad priority: {:?}", token))
                    })?;
                }
                // Statistics and timeouts reported by the switch; not
                // part of flow identity.
                ("duration", _)
                | ("n_packets", _)
                | ("n_bytes", _)
                | ("idle_age", _)
                | ("hard_age", _)
                | ("idle_timeout", _)
                | ("hard_timeout", _)
                | ("send_flow_rem", None)
                | ("reset_counts", None) => {}
                _ => matches.push(Match::flag(token)),
            }
        }

        Ok(Flow::new(table, priority, matches, actions.trim()).with_cookie(cookie))
    }
}

impl PartialEq for Flow {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table
            && self.priority == other.priority
            && self.matches == other.matches
            && normalize_actions(&self.actions) == normalize_actions(&other.actions)
    }
}

impl Eq for Flow {}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.add_line())
    }
}

/// The identity of a flow for set membership and diffing. Matches and
/// actions are held in normalized form so that a flow compares equal to
/// its own `dump-flows` rendition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    table: u8,
    priority: u16,
    matches: Vec<Match>,
    actions: String,
}

/// A set of flows ordered by priority descending, insertion order within
/// a priority class.
#[derive(Debug, Clone, Default)]
pub struct FlowSet {
    flows: Vec<Flow>,
}

impl FlowSet {
    pub fn new() -> Self {
        FlowSet { flows: Vec::new() }
    }

    pub fn from_flows(flows: Vec<Flow>) -> Self {
        let mut set = FlowSet::new();
        for flow in flows {
            set.add(flow);
        }
        set
    }

    /// Insert a flow, keeping priority-descending order. Returns false
    /// if an equal flow was already present.
    pub fn add(&mut self, flow: Flow) -> bool {
        if self.contains(&flow) {
            return false;
        }
        let pos = self
            .flows
            .partition_point(|f| f.priority >= flow.priority);
        self.flows.insert(pos, flow);
        true
    }

    /// Remove the flow equal to `flow`, returning whether it existed.
    pub fn remove(&mut self, flow: &Flow) -> bool {
        match self.flows.iter().position(|f| f == flow) {
            Some(idx) => {
                self.flows.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, flow: &Flow) -> bool {
        self.flows.iter().any(|f| f == flow)
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.flows.iter()
    }

    /// Compute the delta turning `other` into `self`: flows to add
    /// (present here, absent there) and flows to delete (the reverse).
    pub fn diff(&self, other: &FlowSet) -> (Vec<Flow>, Vec<Flow>) {
        let ours: HashSet<FlowKey> = self.flows.iter().map(|f| f.key()).collect();
        let theirs: HashSet<FlowKey> = other.flows.iter().map(|f| f.key()).collect();

        let adds = self
            .flows
            .iter()
            .filter(|f| !theirs.contains(&f.key()))
            .cloned()
            .collect();
        let dels = other
            .flows
            .iter()
            .filter(|f| !ours.contains(&f.key()))
            .cloned()
            .collect();
        (adds, dels)
    }
}

impl Extend<Flow> for FlowSet {
    fn extend<T: IntoIterator<Item = Flow>>(&mut self, iter: T) {
        for flow in iter {
            self.add(flow);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn flow(table: u8, priority: u16, matches: &[&str], actions: &str) -> Flow {
        Flow::new(
            table,
            priority,
            matches.iter().map(|m| Match::flag(*m)).collect(),
            actions,
        )
    }

    #[test]
    fn test_match_order_is_canonical() {
        let a = flow(0, 100, &["tcp", "nw_dst=10.0.0.1"], "drop");
        let b = flow(0, 100, &["nw_dst=10.0.0.1", "tcp"], "drop");
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_cookie_not_part_of_identity() {
        let a = flow(0, 100, &["tcp"], "drop").with_cookie(0x1234);
        let b = flow(0, 100, &["tcp"], "drop").with_cookie(0xcafe);
        assert_eq!(a, b);
    }

    #[test]
    fn test_del_line_wildcards_cookie() {
        let f = flow(2, 40000, &["tcp", "tp_dst=80"], "drop").with_cookie(0xdead);
        assert!(f.add_line().starts_with("cookie=0xdead,"));
        assert!(!f.del_line().contains("cookie"));
        assert_eq!(f.del_line(), "table=2,priority=40000,tcp,tp_dst=80");
    }

    #[test]
    fn test_failsafe_render() {
        let f = Flow::failsafe();
        assert_eq!(f.add_line(), "cookie=0x0,table=0,priority=0,actions=normal");
        assert_eq!(f.del_line(), "table=0,priority=0");
    }

    #[test]
    fn test_parse_dump_line() {
        let line = " cookie=0xbeef, duration=10.550s, table=0, n_packets=4, \
                    n_bytes=280, idle_age=7, priority=29300,in_port=2,tcp \
                    actions=resubmit(,1)";
        let f = Flow::parse_dump_line(line).unwrap();
        assert_eq!(f.table, 0);
        assert_eq!(f.priority, 29300);
        assert_eq!(f.cookie, 0xbeef);
        assert_eq!(f.actions, "resubmit(,1)");
        // Canonical order: lexical.
        assert_eq!(
            f.matches().iter().map(|m| m.as_str()).collect::<Vec<_>>(),
            vec!["in_port=2", "tcp"],
        );
        // Round trip through the dump format preserves identity.
        assert_eq!(f, flow(0, 29300, &["tcp", "in_port=2"], "resubmit(,1)"));
    }

    #[test]
    fn test_parse_priority_zero() {
        let line = " cookie=0x0, duration=1.0s, table=0, n_packets=0, \
                    n_bytes=0, priority=0 actions=NORMAL";
        let f = Flow::parse_dump_line(line).unwrap();
        assert_eq!(f.priority, 0);
        assert!(f.matches().is_empty());
    }

    #[test]
    fn test_equal_to_own_dump_rendition() {
        // The switch rewrites flows on install; the dumped form of every
        // emitted flow must still compare equal to the original, or the
        // reconciler would commit a bundle on every idle tick forever.
        let cases = [
            (flow(0, 0, &[], "normal"), " table=0, priority=0 actions=NORMAL"),
            (
                flow(0, 29400, &["arp"], "NORMAL"),
                " table=0, priority=29400,arp actions=normal",
            ),
            (
                flow(4, 100, &["ct_state=+trk+new"], "ct(commit,zone=1042),normal"),
                " table=4, priority=100,ct_state=+trk+new \
                 actions=ct(zone=1042,commit),NORMAL",
            ),
            (
                flow(1, 50, &["tcp"], "ct(table=1,zone=17)"),
                " table=1, priority=50,tcp actions=ct(zone=17,table=1)",
            ),
            (
                flow(0, 40000, &["dl_type=0x86dd"], "drop"),
                " table=0, priority=40000,ipv6 actions=drop",
            ),
            (
                flow(0, 200, &["dl_src=0E:00:0A:0B:0C:0D"], "drop"),
                " table=0, priority=200,dl_src=0e:00:0a:0b:0c:0d actions=drop",
            ),
            (
                flow(0, 30000, &["arp"], "mod_dl_src:0E:00:01:02:03:04,IN_PORT"),
                " table=0, priority=30000,arp \
                 actions=mod_dl_src:0e:00:01:02:03:04,in_port",
            ),
        ];
        for (want, dumped) in cases {
            let got = Flow::parse_dump_line(dumped).unwrap();
            assert_eq!(want, got, "dumped form drifted: {:?}", dumped);
            assert_eq!(want.key(), got.key());
        }
    }

    #[test]
    fn test_diff_quiescent_against_dump() {
        let want = FlowSet::from_flows(vec![
            Flow::failsafe(),
            flow(0, 40000, &["dl_type=0x86dd"], "drop"),
            flow(4, 100, &["ct_state=+trk"], "ct(commit,zone=5),normal"),
        ]);
        let got = FlowSet::from_flows(vec![
            Flow::parse_dump_line(
                " cookie=0x0, duration=9.1s, table=0, n_packets=3, n_bytes=180, \
                 priority=0 actions=NORMAL",
            )
            .unwrap(),
            Flow::parse_dump_line(
                " cookie=0x0, duration=9.1s, table=0, n_packets=0, n_bytes=0, \
                 priority=40000,ipv6 actions=drop",
            )
            .unwrap(),
            Flow::parse_dump_line(
                " cookie=0x0, duration=9.1s, table=4, n_packets=0, n_bytes=0, \
                 priority=100,ct_state=+trk actions=ct(zone=5,commit),NORMAL",
            )
            .unwrap(),
        ]);

        let (adds, dels) = want.diff(&got);
        assert!(adds.is_empty(), "spurious adds: {:?}", adds);
        assert!(dels.is_empty(), "spurious dels: {:?}", dels);
    }

    #[test]
    fn test_add_line_preserves_producer_text() {
        // Normalization is a comparison concern; adds render the exact
        // text the producer wrote, NXM field names included.
        let f = flow(0, 30000, &["arp"], "load:0x2->NXM_OF_ARP_OP[],IN_PORT");
        assert!(f.add_line().ends_with("actions=load:0x2->NXM_OF_ARP_OP[],IN_PORT"));
    }

    #[test]
    fn test_set_add_idempotent() {
        let mut set = FlowSet::new();
        assert!(set.add(flow(0, 0, &[], "normal")));
        assert!(!set.add(flow(0, 0, &[], "normal")));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_set_ordering_stable() {
        let mut set = FlowSet::new();
        set.add(flow(0, 100, &["a=1"], "x"));
        set.add(flow(0, 200, &["b=1"], "x"));
        set.add(flow(0, 100, &["c=1"], "x"));
        set.add(flow(0, 200, &["d=1"], "x"));

        let prios: Vec<u16> = set.iter().map(|f| f.priority).collect();
        assert_eq!(prios, vec![200, 200, 100, 100]);
        // Insertion order within a priority class.
        let within: Vec<&str> = set
            .iter()
            .filter(|f| f.priority == 200)
            .map(|f| f.matches()[0].as_str())
            .collect();
        assert_eq!(within, vec!["b=1", "d=1"]);

        // Removal does not disturb relative order of the survivors.
        assert!(set.remove(&flow(0, 200, &["b=1"], "x")));
        let within: Vec<&str> = set
            .iter()
            .filter(|f| f.priority == 200)
            .map(|f| f.matches()[0].as_str())
            .collect();
        assert_eq!(within, vec!["d=1"]);
    }

    #[test]
    fn test_diff() {
        let mut want = FlowSet::new();
        want.add(flow(0, 0, &[], "normal"));
        want.add(flow(0, 100, &["tcp"], "drop"));

        let mut got = FlowSet::new();
        got.add(flow(0, 0, &[], "normal"));
        got.add(flow(1, 50, &["udp"], "drop"));

        let (adds, dels) = want.diff(&got);
        assert_eq!(adds, vec![flow(0, 100, &["tcp"], "drop")]);
        assert_eq!(dels, vec![flow(1, 50, &["udp"], "drop")]);

        let (adds, dels) = want.diff(&want);
        assert!(adds.is_empty());
        assert!(dels.is_empty());
    }

    #[test]
    fn test_diff_same_match_different_actions() {
        // An externally modified flow (same match, new actions) must show
        // up as one delete plus one add.
        let mut want = FlowSet::new();
        want.add(flow(0, 100, &["tcp"], "drop"));
        let mut got = FlowSet::new();
        got.add(flow(0, 100, &["tcp"], "normal"));

        let (adds, dels) = want.diff(&got);
        assert_eq!(adds.len(), 1);
        assert_eq!(dels.len(), 1);
        assert_eq!(adds[0].match_key(), dels[0].match_key());
    }
}

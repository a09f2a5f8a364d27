// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declarative qdisc trees and the `tc` textual codec for them.
//!
//! A [`QdiscTree`] describes the wanted traffic-control state of one
//! interface. Reconciliation renders it as a batch of `qdisc replace`
//! lines whose final line is `qdisc show dev <if>`, so the freshly
//! applied state can be parsed back out of the same batch run and cached
//! as the interface's last-known state.

use crate::ExecutionError;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Kernel tick rate in ticks per microsecond, read once from
/// `/proc/net/psched`. The fallback matches a PSCHED_TICKS_PER_SEC
/// kernel built with 1000/64 scaling.
pub fn tick_in_usec() -> f64 {
    static TICK: OnceLock<f64> = OnceLock::new();
    *TICK.get_or_init(|| {
        read_tick_in_usec("/proc/net/psched").unwrap_or(1000.0 / 64.0)
    })
}

fn read_tick_in_usec(path: &str) -> Option<f64> {
    let text = std::fs::read_to_string(path).ok()?;
    let mut fields = text.split_whitespace();
    let t2us = u64::from_str_radix(fields.next()?, 16).ok()?;
    let us2t = u64::from_str_radix(fields.next()?, 16).ok()?;
    if us2t == 0 {
        return None;
    }
    Some(t2us as f64 / us2t as f64)
}

/// Round-trip a tbf burst through the kernel's rate→time→buffer→rate
/// conversion so the wanted value compares equal to what `qdisc show`
/// will report back.
pub fn normalized_burst(rate_bytes_per_sec: u64, burst_bytes: u64) -> u64 {
    if rate_bytes_per_sec == 0 || burst_bytes == 0 {
        return burst_bytes;
    }
    let tick = tick_in_usec();
    let time_usec = burst_bytes as f64 * 1_000_000.0 / rate_bytes_per_sec as f64;
    let ticks = (time_usec * tick).floor();
    let time_usec = ticks / tick;
    (time_usec * rate_bytes_per_sec as f64 / 1_000_000.0).floor() as u64
}

/// A qdisc handle, `major:minor`. The canonical textual form of a
/// classful handle is `major:` (minor zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u32);

impl Handle {
    pub fn new(major: u16, minor: u16) -> Self {
        Handle((major as u32) << 16 | minor as u32)
    }

    pub fn major(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn minor(&self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.minor() == 0 {
            write!(f, "{:x}:", self.major())
        } else {
            write!(f, "{:x}:{:x}", self.major(), self.minor())
        }
    }
}

impl FromStr for Handle {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.split_once(':').ok_or_else(|| {
            ExecutionError::ParseFailure(format!("bad handle: {:?}", s))
        })?;
        let major = u16::from_str_radix(major, 16).map_err(|_| {
            ExecutionError::ParseFailure(format!("bad handle major: {:?}", s))
        })?;
        let minor = if minor.is_empty() {
            0
        } else {
            u16::from_str_radix(minor, 16).map_err(|_| {
                ExecutionError::ParseFailure(format!("bad handle minor: {:?}", s))
            })?
        };
        Ok(Handle::new(major, minor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QdiscKind {
    Tbf {
        /// Bytes per second.
        rate: u64,
        /// Bucket size in bytes, already normalized through
        /// [`normalized_burst`].
        burst: u64,
        /// Microseconds.
        latency: u64,
        /// Minimum packet unit in bytes; zero means unset.
        mpu: u64,
    },
    FqCodel,
    /// Anything else found on the interface. Parameters are not modeled;
    /// an unexpected kind simply never compares equal to a wanted one,
    /// which forces a replace.
    Other(String),
}

impl QdiscKind {
    fn name(&self) -> &str {
        match self {
            QdiscKind::Tbf { .. } => "tbf",
            QdiscKind::FqCodel => "fq_codel",
            QdiscKind::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qdisc {
    pub kind: QdiscKind,
    pub handle: Handle,
    /// None for the root qdisc.
    pub parent: Option<Handle>,
}

impl Qdisc {
    pub fn tbf(
        handle: Handle,
        parent: Option<Handle>,
        rate: u64,
        burst: u64,
        latency: u64,
        mpu: u64,
    ) -> Self {
        Qdisc {
            kind: QdiscKind::Tbf {
                rate,
                burst: normalized_burst(rate, burst),
                latency,
                mpu,
            },
            handle,
            parent,
        }
    }

    pub fn fq_codel(handle: Handle, parent: Option<Handle>) -> Self {
        Qdisc { kind: QdiscKind::FqCodel, handle, parent }
    }

    fn replace_line(&self, ifname: &str) -> String {
        let mut line = format!("qdisc replace dev {} ", ifname);
        match self.parent {
            None => line.push_str("root "),
            Some(parent) => {
                line.push_str(&format!("parent {} ", parent));
            }
        }
        line.push_str(&format!("handle {} {}", self.handle, self.kind.name()));
        if let QdiscKind::Tbf { rate, burst, latency, mpu } = &self.kind {
            line.push_str(&format!(
                " rate {}bit burst {}b latency {}us",
                rate * 8,
                burst,
                latency
            ));
            if *mpu > 0 {
                line.push_str(&format!(" mpu {}b", mpu));
            }
        }
        line
    }

    /// Parse one line of `tc qdisc show dev <if>` output.
    pub fn parse_show_line(line: &str) -> Result<Qdisc, ExecutionError> {
        let mut tokens = line.split_whitespace();
        let bad = |msg: &str| ExecutionError::ParseFailure(format!("{}: {:?}", msg, line));

        match tokens.next() {
            Some("qdisc") => {}
            _ => return Err(bad("expected qdisc line")),
        }
        let kind_name = tokens.next().ok_or_else(|| bad("missing kind"))?;
        let handle: Handle = tokens.next().ok_or_else(|| bad("missing handle"))?.parse()?;

        let parent = match tokens.next() {
            Some("root") => None,
            Some("parent") => {
                Some(tokens.next().ok_or_else(|| bad("missing parent handle"))?.parse()?)
            }
            _ => return Err(bad("expected root or parent")),
        };

        let kind = match kind_name {
            "tbf" => {
                let mut rate = 0u64;
                let mut burst = 0u64;
                let mut latency = 0u64;
                let mut mpu = 0u64;
                while let Some(key) = tokens.next() {
                    match key {
                        "rate" => {
                            let v = tokens.next().ok_or_else(|| bad("missing rate"))?;
                            rate = parse_rate(v)? / 8;
                        }
                        "burst" => {
                            let v = tokens.next().ok_or_else(|| bad("missing burst"))?;
                            // The kernel may report "16000b/8"; the cell
                            // log after the slash is derived state.
                            let v = v.split('/').next().unwrap_or(v);
                            burst = parse_size(v)?;
                        }
                        "lat" | "latency" => {
                            let v = tokens.next().ok_or_else(|| bad("missing latency"))?;
                            latency = parse_time_usec(v)?;
                        }
                        "mpu" => {
                            let v = tokens.next().ok_or_else(|| bad("missing mpu"))?;
                            mpu = parse_size(v)?;
                        }
                        // refcnt, peakrate and anything else: skip the
                        // value if it looks like one.
                        _ => {}
                    }
                }
                QdiscKind::Tbf { rate, burst, latency, mpu }
            }
            "fq_codel" => QdiscKind::FqCodel,
            other => QdiscKind::Other(other.to_string()),
        };

        Ok(Qdisc { kind, handle, parent })
    }
}

/// The wanted (or observed) qdisc state of one interface.
///
/// Equality is structural: same root, and for every node the same
/// children multiset keyed by handle. Because nodes are normalized into
/// (parent, handle) order, plain vector equality gives exactly that.
#[derive(Debug, Clone, Default)]
pub struct QdiscTree {
    qdiscs: Vec<Qdisc>,
}

impl QdiscTree {
    pub fn new(mut qdiscs: Vec<Qdisc>) -> Self {
        qdiscs.sort_by_key(|q| (q.parent.map(|h| h.0).unwrap_or(0), q.handle.0));
        QdiscTree { qdiscs }
    }

    /// A bandwidth-shaped tree: tbf at the root with an fq_codel leaf.
    /// `rate_mbps` is the link limit in megabits per second.
    pub fn shaped(rate_mbps: u64, mpu: u64) -> Self {
        let rate = rate_mbps * 1_000_000 / 8;
        // Bucket sized for ~20ms at rate, floor 64KB.
        let burst = std::cmp::max(rate / 50, 64 * 1024);
        let root = Handle::new(1, 0);
        QdiscTree::new(vec![
            Qdisc::tbf(root, None, rate, burst, 50_000, mpu),
            Qdisc::fq_codel(Handle::new(8, 0), Some(root)),
        ])
    }

    /// An unshaped tree: fq_codel at the root.
    pub fn unshaped() -> Self {
        QdiscTree::new(vec![Qdisc::fq_codel(Handle::new(1, 0), None)])
    }

    pub fn is_empty(&self) -> bool {
        self.qdiscs.is_empty()
    }

    pub fn qdiscs(&self) -> &[Qdisc] {
        &self.qdiscs
    }

    /// The batched replace script for this tree. The trailing `qdisc
    /// show` lets the caller parse back what the kernel actually
    /// installed.
    pub fn batch_replace_lines(&self, ifname: &str) -> String {
        let mut script = String::new();
        // Root first: replacing the root drops the old children, then
        // each child line reattaches under the fresh parent.
        for qdisc in self.qdiscs.iter().filter(|q| q.parent.is_none()) {
            script.push_str(&qdisc.replace_line(ifname));
            script.push('\n');
        }
        for qdisc in self.qdiscs.iter().filter(|q| q.parent.is_some()) {
            script.push_str(&qdisc.replace_line(ifname));
            script.push('\n');
        }
        script.push_str(&format!("qdisc show dev {}\n", ifname));
        script
    }

    /// Parse the `qdisc show dev <if>` section of a batch run's output.
    pub fn parse_show_output(text: &str) -> Result<Self, ExecutionError> {
        let mut qdiscs = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if !line.starts_with("qdisc ") {
                continue;
            }
            let qdisc = Qdisc::parse_show_line(line)?;
            // `noqueue` on an empty interface is the kernel default, not
            // state anyone asked for.
            if matches!(&qdisc.kind, QdiscKind::Other(name) if name == "noqueue") {
                continue;
            }
            qdiscs.push(qdisc);
        }
        Ok(QdiscTree::new(qdiscs))
    }
}

impl PartialEq for QdiscTree {
    fn eq(&self, other: &Self) -> bool {
        self.qdiscs == other.qdiscs
    }
}

impl Eq for QdiscTree {}

fn parse_scaled(s: &str, suffixes: &[(&str, u64)]) -> Result<u64, ExecutionError> {
    let lower = s.to_ascii_lowercase();
    for (suffix, mult) in suffixes {
        if let Some(num) = lower.strip_suffix(suffix) {
            let value: f64 = num.parse().map_err(|_| {
                ExecutionError::ParseFailure(format!("bad number: {:?}", s))
            })?;
            return Ok((value * *mult as f64).round() as u64);
        }
    }
    lower
        .parse::<f64>()
        .map(|v| v.round() as u64)
        .map_err(|_| ExecutionError::ParseFailure(format!("bad value: {:?}", s)))
}

/// Parse a tc rate into bits per second.
pub fn parse_rate(s: &str) -> Result<u64, ExecutionError> {
    parse_scaled(
        s,
        &[
            ("gbit", 1_000_000_000),
            ("mbit", 1_000_000),
            ("kbit", 1_000),
            ("gbps", 8_000_000_000),
            ("mbps", 8_000_000),
            ("kbps", 8_000),
            ("bit", 1),
        ],
    )
}

/// Parse a tc size into bytes.
pub fn parse_size(s: &str) -> Result<u64, ExecutionError> {
    parse_scaled(
        s,
        &[("gb", 1 << 30), ("mb", 1 << 20), ("kb", 1 << 10), ("g", 1 << 30), ("m", 1 << 20), ("k", 1 << 10), ("b", 1)],
    )
}

/// Parse a tc time into microseconds.
pub fn parse_time_usec(s: &str) -> Result<u64, ExecutionError> {
    parse_scaled(s, &[("ms", 1_000), ("us", 1), ("s", 1_000_000)])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        let h = Handle::new(1, 0);
        assert_eq!(h.to_string(), "1:");
        assert_eq!("1:".parse::<Handle>().unwrap(), h);

        let h = Handle::new(0x8001, 2);
        assert_eq!(h.to_string(), "8001:2");
        assert_eq!("8001:2".parse::<Handle>().unwrap(), h);
        assert_eq!("8001:0".parse::<Handle>().unwrap(), Handle::new(0x8001, 0));
    }

    #[test]
    fn test_units() {
        assert_eq!(parse_rate("1Mbit").unwrap(), 1_000_000);
        assert_eq!(parse_rate("8000bit").unwrap(), 8000);
        assert_eq!(parse_rate("1000Kbit").unwrap(), 1_000_000);
        assert_eq!(parse_size("16000b").unwrap(), 16000);
        assert_eq!(parse_size("16Kb").unwrap(), 16384);
        assert_eq!(parse_time_usec("50ms").unwrap(), 50_000);
        assert_eq!(parse_time_usec("50000us").unwrap(), 50_000);
        assert_eq!(parse_time_usec("1.5ms").unwrap(), 1_500);
    }

    #[test]
    fn test_normalized_burst_is_fixed_point() {
        // Normalizing twice changes nothing: the wanted tree stays equal
        // to the tree parsed back from the kernel.
        for rate in [125_000u64, 1_250_000, 12_500_000, 1_000_000_000] {
            for burst in [16_000u64, 64 * 1024, 1 << 20] {
                let once = normalized_burst(rate, burst);
                let twice = normalized_burst(rate, once);
                assert_eq!(once, twice, "rate={} burst={}", rate, burst);
                assert!(once <= burst);
            }
        }
    }

    #[test]
    fn test_parse_tbf_show_line() {
        let q = Qdisc::parse_show_line(
            "qdisc tbf 1: root refcnt 2 rate 1Mbit burst 16000b lat 50ms",
        )
        .unwrap();
        assert_eq!(q.handle, Handle::new(1, 0));
        assert_eq!(q.parent, None);
        assert_eq!(
            q.kind,
            QdiscKind::Tbf { rate: 125_000, burst: 16000, latency: 50_000, mpu: 0 }
        );
    }

    #[test]
    fn test_parse_fq_codel_ignores_params() {
        let q = Qdisc::parse_show_line(
            "qdisc fq_codel 8001: parent 1: limit 10240p flows 1024 quantum 1514 \
             target 5ms interval 100ms memory_limit 32Mb ecn drop_batch 64",
        )
        .unwrap();
        assert_eq!(q.kind, QdiscKind::FqCodel);
        assert_eq!(q.parent, Some(Handle::new(1, 0)));
    }

    #[test]
    fn test_tree_equality_ignores_listing_order() {
        let root = Handle::new(1, 0);
        let a = QdiscTree::new(vec![
            Qdisc::fq_codel(Handle::new(8, 0), Some(root)),
            Qdisc::tbf(root, None, 125_000, 16_000, 50_000, 0),
        ]);
        let b = QdiscTree::new(vec![
            Qdisc::tbf(root, None, 125_000, 16_000, 50_000, 0),
            Qdisc::fq_codel(Handle::new(8, 0), Some(root)),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_batch_then_parse_roundtrip() {
        let tree = QdiscTree::shaped(1000, 64);
        let script = tree.batch_replace_lines("vnet0");
        assert!(script.ends_with("qdisc show dev vnet0\n"));
        let mut lines = script.lines();
        let root_line = lines.next().unwrap();
        assert!(root_line.starts_with("qdisc replace dev vnet0 root handle 1: tbf rate 1000000000bit"));
        let child_line = lines.next().unwrap();
        assert!(child_line.starts_with("qdisc replace dev vnet0 parent 1: handle 8: fq_codel"));

        // Feed the equivalent `qdisc show` output back through the
        // parser and compare structurally.
        let QdiscKind::Tbf { rate, burst, latency, .. } = tree.qdiscs()[0].kind.clone() else {
            panic!("root must be tbf");
        };
        let show = format!(
            "qdisc tbf 1: root refcnt 2 rate {}bit burst {}b lat {}us mpu 64b\n\
             qdisc fq_codel 8: parent 1: limit 10240p flows 1024\n",
            rate * 8,
            burst,
            latency,
        );
        let parsed = QdiscTree::parse_show_output(&show).unwrap();
        assert_eq!(parsed, tree);
    }

    #[test]
    fn test_parse_skips_noqueue() {
        let parsed =
            QdiscTree::parse_show_output("qdisc noqueue 0: root refcnt 2\n").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_unshaped_differs_from_shaped() {
        assert_ne!(QdiscTree::unshaped(), QdiscTree::shaped(100, 0));
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Security-rule syntax and port-range masking.
//!
//! A descriptor carries its rules as a `;`-separated string, each rule
//! `direction:action [proto [cidr] [ports]]`, e.g.
//! `in:allow tcp 192.168.0.0/16 80,443,8000-8080; in:deny any; out:allow any`.
//! Rules are ordered: earlier rules compile to higher OpenFlow
//! priorities.

use ipnetwork::Ipv4Network;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("invalid security rule {0:?}: {1}")]
    Invalid(String, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Any,
    Tcp,
    Udp,
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Protocol::Any => "any",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        };
        f.write_str(s)
    }
}

/// A single port or inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
}

impl PortSpec {
    pub fn contains(&self, port: u16) -> bool {
        match self {
            PortSpec::Single(p) => *p == port,
            PortSpec::Range(start, end) => (*start..=*end).contains(&port),
        }
    }

    /// The `(value, mask)` pairs covering this spec.
    pub fn to_masks(&self) -> Vec<(u16, u16)> {
        match self {
            PortSpec::Single(p) => vec![(*p, 0xffff)],
            PortSpec::Range(start, end) => port_range_to_masks(*start, *end),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityRule {
    pub direction: Direction,
    pub action: Action,
    pub protocol: Protocol,
    pub net: Option<Ipv4Network>,
    pub ports: Vec<PortSpec>,
}

impl FromStr for SecurityRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |msg| Error::Invalid(s.to_string(), msg);

        let (head, rest) = s.split_once(':').ok_or_else(|| bad("missing ':'"))?;
        let direction = match head.trim() {
            "in" => Direction::In,
            "out" => Direction::Out,
            _ => return Err(bad("direction must be in or out")),
        };

        let mut words = rest.split_whitespace();
        let action = match words.next() {
            Some("allow") => Action::Allow,
            Some("deny") => Action::Deny,
            _ => return Err(bad("action must be allow or deny")),
        };

        let protocol = match words.next() {
            None | Some("any") => Protocol::Any,
            Some("tcp") => Protocol::Tcp,
            Some("udp") => Protocol::Udp,
            Some("icmp") => Protocol::Icmp,
            Some(_) => return Err(bad("unknown protocol")),
        };

        let mut net = None;
        let mut ports = Vec::new();
        for word in words {
            if word.contains('.') || word.contains('/') {
                if net.is_some() {
                    return Err(bad("more than one network"));
                }
                net = Some(word.parse().map_err(|_| bad("bad network"))?);
            } else {
                if !matches!(protocol, Protocol::Tcp | Protocol::Udp) {
                    return Err(bad("ports need tcp or udp"));
                }
                for part in word.split(',') {
                    ports.push(parse_port_spec(part).ok_or_else(|| bad("bad ports"))?);
                }
            }
        }

        Ok(SecurityRule { direction, action, protocol, net, ports })
    }
}

fn parse_port_spec(s: &str) -> Option<PortSpec> {
    match s.split_once('-') {
        Some((start, end)) => {
            let start: u16 = start.parse().ok()?;
            let end: u16 = end.parse().ok()?;
            if start > end {
                return None;
            }
            if start == end {
                Some(PortSpec::Single(start))
            } else {
                Some(PortSpec::Range(start, end))
            }
        }
        None => Some(PortSpec::Single(s.parse().ok()?)),
    }
}

/// Parse a `;`-separated rule string. Empty segments are skipped.
pub fn parse_rules(s: &str) -> Result<Vec<SecurityRule>, Error> {
    s.split(';')
        .map(str::trim)
        .filter(|seg| !seg.is_empty())
        .map(str::parse)
        .collect()
}

/// Cover `[start, end]` with a minimal set of `(value, mask)` pairs.
///
/// Greedy power-of-two covering: repeatedly pick the largest block size
/// `b` such that `start` is `b`-aligned and the block fits in the
/// remaining range, emit `(start, !(b-1))`, advance. A degenerate range
/// (`start == end`) is a single exact-match pair.
pub fn port_range_to_masks(start: u16, end: u16) -> Vec<(u16, u16)> {
    if start == end {
        return vec![(start, 0xffff)];
    }

    let mut out = Vec::new();
    let mut cur = start as u32;
    let end = end as u32;
    while cur <= end {
        let mut block = 1u32;
        loop {
            let next = block << 1;
            if cur & (next - 1) == 0 && cur + next <= end + 1 {
                block = next;
            } else {
                break;
            }
        }
        out.push((cur as u16, !(block - 1) as u16));
        cur += block;
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn masks_match(masks: &[(u16, u16)], port: u16) -> usize {
        masks.iter().filter(|(value, mask)| port & mask == value & mask).count()
    }

    #[test]
    fn test_parse_rule() {
        let rule: SecurityRule =
            "in:allow tcp 192.168.0.0/16 80,443,8000-8080".parse().unwrap();
        assert_eq!(rule.direction, Direction::In);
        assert_eq!(rule.action, Action::Allow);
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert_eq!(rule.net.unwrap().to_string(), "192.168.0.0/16");
        assert_eq!(
            rule.ports,
            vec![
                PortSpec::Single(80),
                PortSpec::Single(443),
                PortSpec::Range(8000, 8080),
            ],
        );
    }

    #[test]
    fn test_parse_rule_minimal() {
        let rule: SecurityRule = "out:deny any".parse().unwrap();
        assert_eq!(rule.direction, Direction::Out);
        assert_eq!(rule.action, Action::Deny);
        assert_eq!(rule.protocol, Protocol::Any);
        assert!(rule.net.is_none());
        assert!(rule.ports.is_empty());

        // Bare action implies any protocol.
        let rule: SecurityRule = "in:allow".parse().unwrap();
        assert_eq!(rule.protocol, Protocol::Any);
    }

    #[test]
    fn test_parse_rules_string() {
        let rules = parse_rules("in:allow tcp 22; in:deny any; out:allow any").unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].ports, vec![PortSpec::Single(22)]);

        assert!(parse_rules("sideways:allow any").is_err());
        assert!(parse_rules("in:allow icmp 80").is_err());
        assert!(parse_rules("in:allow tcp 443-80").is_err());
        assert!(parse_rules("").unwrap().is_empty());
    }

    #[test]
    fn test_single_port_mask() {
        assert_eq!(port_range_to_masks(443, 443), vec![(443, 0xffff)]);
    }

    #[test]
    fn test_range_81_443_exact_cover() {
        let masks = port_range_to_masks(81, 443);
        for port in 0..=u16::MAX {
            let expected = (81..=443).contains(&port) as usize;
            assert_eq!(
                masks_match(&masks, port),
                expected,
                "port {} miscovered by {:?}",
                port,
                masks,
            );
        }
    }

    #[test]
    fn test_range_cover_property() {
        // Every port in range matched exactly once, nothing outside.
        for (start, end) in
            [(0u16, 65535u16), (0, 1023), (1024, 65535), (1, 65534), (1000, 2000), (32767, 32769)]
        {
            let masks = port_range_to_masks(start, end);
            for port in 0..=u16::MAX {
                let expected = (start..=end).contains(&port) as usize;
                assert_eq!(masks_match(&masks, port), expected, "range {}-{}", start, end);
            }
        }
    }

    #[test]
    fn test_full_range_is_one_mask() {
        assert_eq!(port_range_to_masks(0, 65535), vec![(0, 0)]);
        assert_eq!(port_range_to_masks(1024, 2047), vec![(1024, 0xfc00)]);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link, address and namespace plumbing, via `ip`.

use crate::{execute_async, ExecutionError, IP};

/// Wraps `ip` invocations.
pub struct Ip {}

impl Ip {
    async fn run(args: &[&str]) -> Result<std::process::Output, ExecutionError> {
        let mut cmd = tokio::process::Command::new(IP);
        cmd.args(args);
        execute_async(&mut cmd).await
    }

    pub async fn link_exists(name: &str) -> bool {
        Self::run(&["-o", "link", "show", "dev", name]).await.is_ok()
    }

    /// The link kind (`veth`, `tun`, ...) or None for physical links,
    /// parsed out of the `ip -d -o link show` detail line.
    pub async fn link_kind(name: &str) -> Result<Option<String>, ExecutionError> {
        let output = Self::run(&["-d", "-o", "link", "show", "dev", name]).await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let mut tokens = text.split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            if token == "link/ether" || token == "link/none" {
                // Kind follows the address block on detail lines, e.g.
                // "... link/ether aa:bb .. brd ff:ff .. promiscuity 0 veth ..."
                continue;
            }
            if matches!(token, "veth" | "tun" | "tap" | "bridge" | "openvswitch" | "dummy" | "vlan" | "geneve" | "vxlan")
            {
                return Ok(Some(token.to_string()));
            }
        }
        Ok(None)
    }

    pub async fn veth_add(name: &str, peer: &str) -> Result<(), ExecutionError> {
        if Self::link_exists(name).await {
            return Ok(());
        }
        Self::run(&["link", "add", name, "type", "veth", "peer", "name", peer])
            .await
            .map(|_| ())
    }

    pub async fn link_del(name: &str) -> Result<(), ExecutionError> {
        if !Self::link_exists(name).await {
            return Ok(());
        }
        Self::run(&["link", "del", name]).await.map(|_| ())
    }

    pub async fn link_up(name: &str) -> Result<(), ExecutionError> {
        Self::run(&["link", "set", name, "up"]).await.map(|_| ())
    }

    pub async fn link_set_netns(name: &str, netns: &str) -> Result<(), ExecutionError> {
        Self::run(&["link", "set", name, "netns", netns]).await.map(|_| ())
    }

    pub async fn netns_add(name: &str) -> Result<(), ExecutionError> {
        let list = Self::run(&["netns", "list"]).await?;
        let text = String::from_utf8_lossy(&list.stdout);
        if text.lines().any(|l| l.split_whitespace().next() == Some(name)) {
            return Ok(());
        }
        Self::run(&["netns", "add", name]).await.map(|_| ())
    }

    pub async fn netns_del(name: &str) -> Result<(), ExecutionError> {
        Self::run(&["netns", "delete", name]).await.map(|_| ())
    }

    /// The first IPv4 address assigned to a host link, if any.
    pub async fn addr4(ifname: &str) -> Result<Option<std::net::Ipv4Addr>, ExecutionError> {
        let output = Self::run(&["-4", "-o", "addr", "show", "dev", ifname]).await?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_addr4(&text))
    }

    /// Add an address to a host link, tolerating "already assigned".
    pub async fn addr_add(ifname: &str, cidr: &str) -> Result<(), ExecutionError> {
        match Self::run(&["addr", "add", cidr, "dev", ifname]).await {
            Ok(_) => Ok(()),
            Err(ExecutionError::CommandFailure(info))
                if info.stderr.contains("File exists") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run an arbitrary `ip` subcommand inside a named namespace.
    pub async fn netns_exec(netns: &str, args: &[&str]) -> Result<(), ExecutionError> {
        let mut full = vec!["netns", "exec", netns, IP];
        full.extend_from_slice(args);
        Self::run(&full).await.map(|_| ())
    }

    /// Add an address inside a namespace, tolerating "already assigned".
    pub async fn netns_addr_add(
        netns: &str,
        ifname: &str,
        cidr: &str,
    ) -> Result<(), ExecutionError> {
        match Self::netns_exec(netns, &["addr", "add", cidr, "dev", ifname]).await {
            Ok(()) => Ok(()),
            Err(ExecutionError::CommandFailure(info))
                if info.stderr.contains("File exists") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Pull the first `inet a.b.c.d/len` out of `ip -4 -o addr show` output.
fn parse_addr4(text: &str) -> Option<std::net::Ipv4Addr> {
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "inet" {
            let addr = tokens.next()?;
            return addr.split('/').next()?.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_addr4() {
        let line = "2: eth0    inet 10.168.222.136/24 brd 10.168.222.255 \
                    scope global eth0\\       valid_lft forever preferred_lft forever\n";
        assert_eq!(parse_addr4(line), Some("10.168.222.136".parse().unwrap()));
        assert_eq!(parse_addr4(""), None);
        assert_eq!(parse_addr4("3: eth1    inet6 fe80::1/64 scope link\n"), None);
    }
}

//! [`Kernel`] implementation on top of `ip(8)`.
//!
//! Reads use `ip -j` and are decoded with serde. Writes are plain `ip`
//! invocations built by the `build_*` functions below, with every
//! user-supplied value shell-quoted.

use std::net::IpAddr;

use async_trait::async_trait;
use fabric_types::{IpFamily, IpPrefix};
use serde::Deserialize;
use tracing::{debug, trace};

#[cfg(test)]
use parking_lot::Mutex;
#[cfg(test)]
use std::collections::VecDeque;

use crate::error::{KernelError, KernelResult};
use crate::kernel::{
    Address, Kernel, Link, Route, RouteKind, Rule, Scope, DEFAULT_TABLE, LOCAL_TABLE, MAIN_TABLE,
};
use crate::shell::{self, shellquote, IpFailure, IpOutput, IP_CMD};

/// Returns the `ip` family switch.
pub fn family_flag(family: IpFamily) -> &'static str {
    match family {
        IpFamily::Ipv4 => "-4",
        IpFamily::Ipv6 => "-6",
    }
}

/// Build link listing command
pub fn build_show_links_cmd() -> String {
    format!("{} -j link show", IP_CMD)
}

/// Build single link lookup command
pub fn build_show_link_cmd(name: &str) -> String {
    format!("{} -j link show dev {}", IP_CMD, shellquote(name))
}

/// Build route listing command for one table
pub fn build_show_routes_cmd(family: IpFamily, table: u32) -> String {
    format!(
        "{} {} -j route show table {}",
        IP_CMD,
        family_flag(family),
        table
    )
}

/// Build route replace command
///
/// Unicast routes always carry an explicit scope, since `ip` would
/// otherwise pick link scope for device-only routes.
pub fn build_replace_route_cmd(route: &Route) -> String {
    let mut cmd = format!("{} {} route replace", IP_CMD, family_flag(route.family()));
    if route.kind != RouteKind::Unicast {
        cmd.push(' ');
        cmd.push_str(route.kind.as_str());
    }
    cmd.push(' ');
    cmd.push_str(&shellquote(&route.dst.to_string()));
    if let Some(gw) = &route.gateway {
        cmd.push_str(&format!(" via {}", shellquote(&gw.to_string())));
    }
    if let Some(dev) = &route.dev {
        cmd.push_str(&format!(" dev {}", shellquote(dev)));
    }
    if let Some(src) = &route.src {
        cmd.push_str(&format!(" src {}", shellquote(&src.to_string())));
    }
    if route.kind == RouteKind::Unicast {
        cmd.push_str(&format!(" scope {}", route.scope));
    }
    cmd.push_str(&format!(" table {}", route.table));
    cmd
}

/// Build route delete command
pub fn build_del_route_cmd(route: &Route) -> String {
    let mut cmd = format!("{} {} route del", IP_CMD, family_flag(route.family()));
    if route.kind != RouteKind::Unicast {
        cmd.push(' ');
        cmd.push_str(route.kind.as_str());
    }
    cmd.push_str(&format!(
        " {} table {}",
        shellquote(&route.dst.to_string()),
        route.table
    ));
    cmd
}

/// Build rule listing command
pub fn build_show_rules_cmd(family: IpFamily) -> String {
    format!("{} {} -j rule show", IP_CMD, family_flag(family))
}

fn rule_selector(rule: &Rule) -> String {
    let mut args = match &rule.src {
        Some(src) => format!("from {}", shellquote(&src.to_string())),
        None => "from all".to_string(),
    };
    if let Some(mark) = rule.fwmark {
        args.push_str(&format!(" fwmark {:#x}", mark));
        if let Some(mask) = rule.fwmask {
            args.push_str(&format!("/{:#x}", mask));
        }
    }
    args.push_str(&format!(" lookup {} pref {}", rule.table, rule.priority));
    args
}

/// Build rule add command
pub fn build_add_rule_cmd(rule: &Rule) -> String {
    format!(
        "{} {} rule add {}",
        IP_CMD,
        family_flag(rule.family),
        rule_selector(rule)
    )
}

/// Build rule delete command
pub fn build_del_rule_cmd(rule: &Rule) -> String {
    format!(
        "{} {} rule del {}",
        IP_CMD,
        family_flag(rule.family),
        rule_selector(rule)
    )
}

/// Build address listing command
pub fn build_show_addrs_cmd(family: IpFamily, link: Option<&str>) -> String {
    match link {
        Some(name) => format!(
            "{} {} -j addr show dev {}",
            IP_CMD,
            family_flag(family),
            shellquote(name)
        ),
        None => format!("{} {} -j addr show", IP_CMD, family_flag(family)),
    }
}

/// Build address replace command
pub fn build_replace_addr_cmd(address: &Address) -> String {
    let mut cmd = format!(
        "{} {} addr replace {} dev {} scope {}",
        IP_CMD,
        family_flag(address.family()),
        shellquote(&address.address.to_string()),
        shellquote(&address.link),
        address.scope
    );
    if address.no_prefix_route {
        cmd.push_str(" noprefixroute");
    }
    cmd
}

/// Build address delete command
pub fn build_del_addr_cmd(address: &Address) -> String {
    format!(
        "{} {} addr del {} dev {}",
        IP_CMD,
        family_flag(address.family()),
        shellquote(&address.address.to_string()),
        shellquote(&address.link)
    )
}

/// A JSON field `ip` prints either as a number or as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumOrText {
    Num(u64),
    Text(String),
}

impl NumOrText {
    fn as_hex_u32(&self) -> Option<u32> {
        match self {
            NumOrText::Num(n) => u32::try_from(*n).ok(),
            NumOrText::Text(s) => match s.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            },
        }
    }

    fn as_table(&self) -> u32 {
        match self {
            NumOrText::Num(n) => u32::try_from(*n).unwrap_or(0),
            NumOrText::Text(s) => match s.as_str() {
                "local" => LOCAL_TABLE,
                "main" => MAIN_TABLE,
                "default" => DEFAULT_TABLE,
                other => other.parse().unwrap_or(0),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawLink {
    ifindex: u32,
    ifname: String,
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    #[serde(rename = "type")]
    kind: Option<String>,
    dst: String,
    gateway: Option<String>,
    dev: Option<String>,
    prefsrc: Option<String>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    priority: u32,
    src: Option<String>,
    srclen: Option<u8>,
    table: Option<NumOrText>,
    fwmark: Option<NumOrText>,
    fwmask: Option<NumOrText>,
}

#[derive(Debug, Deserialize)]
struct RawLinkAddrs {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<RawAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct RawAddrInfo {
    family: Option<String>,
    local: Option<String>,
    prefixlen: Option<u8>,
    scope: Option<String>,
    #[serde(default)]
    noprefixroute: bool,
}

fn decode<T: for<'de> Deserialize<'de>>(cmd: &str, output: &str) -> KernelResult<Vec<T>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(output).map_err(|e| KernelError::invalid_output(cmd, e.to_string()))
}

fn parse_ip(cmd: &str, s: &str) -> KernelResult<IpAddr> {
    s.parse()
        .map_err(|_| KernelError::invalid_output(cmd, format!("bad address '{}'", s)))
}

fn parse_scope(cmd: &str, s: Option<&str>) -> KernelResult<Scope> {
    match s {
        None => Ok(Scope::Universe),
        Some(s) => s
            .parse()
            .map_err(|e: String| KernelError::invalid_output(cmd, e)),
    }
}

/// Parses a destination as `ip` prints it: `default`, `a.b.c.d/len`, or a
/// bare host address.
fn parse_dst(cmd: &str, family: IpFamily, s: &str) -> KernelResult<IpPrefix> {
    if s == "default" {
        return Ok(IpPrefix::default_route(family));
    }
    if s.contains('/') {
        return s
            .parse()
            .map_err(|e| KernelError::invalid_output(cmd, format!("bad prefix '{}': {}", s, e)));
    }
    Ok(IpPrefix::host(parse_ip(cmd, s)?))
}

/// Decodes `ip -j link show`.
pub fn parse_links(cmd: &str, output: &str) -> KernelResult<Vec<Link>> {
    let raw: Vec<RawLink> = decode(cmd, output)?;
    Ok(raw
        .into_iter()
        .map(|l| Link::new(l.ifindex, l.ifname))
        .collect())
}

/// Decodes `ip -j route show table N`.
pub fn parse_routes(
    cmd: &str,
    family: IpFamily,
    table: u32,
    output: &str,
) -> KernelResult<Vec<Route>> {
    let raw: Vec<RawRoute> = decode(cmd, output)?;
    raw.into_iter()
        .map(|r| -> KernelResult<Route> {
            Ok(Route {
                table,
                dst: parse_dst(cmd, family, &r.dst)?,
                gateway: r.gateway.as_deref().map(|g| parse_ip(cmd, g)).transpose()?,
                dev: r.dev,
                src: r.prefsrc.as_deref().map(|s| parse_ip(cmd, s)).transpose()?,
                scope: parse_scope(cmd, r.scope.as_deref())?,
                kind: r.kind.as_deref().map(RouteKind::from).unwrap_or_default(),
            })
        })
        .collect()
}

/// Decodes `ip -j rule show`.
pub fn parse_rules(cmd: &str, family: IpFamily, output: &str) -> KernelResult<Vec<Rule>> {
    let raw: Vec<RawRule> = decode(cmd, output)?;
    raw.into_iter()
        .map(|r| -> KernelResult<Rule> {
            let src = match r.src.as_deref() {
                None | Some("all") => None,
                Some(s) => {
                    let addr = parse_ip(cmd, s)?;
                    let len = r.srclen.unwrap_or_else(|| family.bits());
                    Some(IpPrefix::new(addr, len).map_err(|e| {
                        KernelError::invalid_output(cmd, format!("bad rule source: {}", e))
                    })?)
                }
            };
            Ok(Rule {
                family,
                priority: r.priority,
                src,
                table: r.table.as_ref().map(NumOrText::as_table).unwrap_or(0),
                fwmark: r.fwmark.as_ref().and_then(NumOrText::as_hex_u32),
                fwmask: r.fwmask.as_ref().and_then(NumOrText::as_hex_u32),
            })
        })
        .collect()
}

/// Decodes `ip -j addr show`, keeping addresses of `family` only.
pub fn parse_addresses(cmd: &str, family: IpFamily, output: &str) -> KernelResult<Vec<Address>> {
    let wanted = match family {
        IpFamily::Ipv4 => "inet",
        IpFamily::Ipv6 => "inet6",
    };
    let raw: Vec<RawLinkAddrs> = decode(cmd, output)?;

    let mut addresses = Vec::new();
    for link in raw {
        for info in link.addr_info {
            if info.family.as_deref().is_some_and(|f| f != wanted) {
                continue;
            }
            let (Some(local), Some(len)) = (info.local.as_deref(), info.prefixlen) else {
                continue;
            };
            let ip = parse_ip(cmd, local)?;
            if IpFamily::of(&ip) != family {
                continue;
            }
            let address = IpPrefix::new(ip, len)
                .map_err(|e| KernelError::invalid_output(cmd, e.to_string()))?;
            addresses.push(Address {
                link: link.ifname.clone(),
                address,
                scope: parse_scope(cmd, info.scope.as_deref())?,
                no_prefix_route: info.noprefixroute,
            });
        }
    }
    Ok(addresses)
}

/// Programs the kernel by running `/sbin/ip`.
pub struct IpCommandKernel {
    /// Testing support
    #[cfg(test)]
    mock_mode: bool,
    #[cfg(test)]
    captured_commands: Mutex<Vec<String>>,
    #[cfg(test)]
    mock_results: Mutex<VecDeque<(i32, String, String)>>,
}

impl IpCommandKernel {
    pub fn new() -> Self {
        Self {
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: Mutex::new(Vec::new()),
            #[cfg(test)]
            mock_results: Mutex::new(VecDeque::new()),
        }
    }

    /// Execute an `ip` command (with mock mode support)
    async fn run(&self, cmd: &str) -> KernelResult<IpOutput> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.lock().push(cmd.to_string());
            let (exit_code, stdout, stderr) = self
                .mock_results
                .lock()
                .pop_front()
                .unwrap_or((0, String::new(), String::new()));
            return Ok(IpOutput {
                command: cmd.to_string(),
                exit_code,
                stdout,
                stderr,
            });
        }

        shell::run_ip(cmd).await
    }

    async fn query(&self, cmd: &str) -> KernelResult<String> {
        self.run(cmd).await?.into_stdout()
    }

    async fn apply(&self, cmd: &str) -> KernelResult<()> {
        self.query(cmd).await?;
        Ok(())
    }

    /// Runs a delete, treating "already gone" as success.
    async fn remove(&self, cmd: &str) -> KernelResult<()> {
        let result = self.run(cmd).await?;
        if result.failure() == Some(IpFailure::Absent) {
            trace!(command = %cmd, "Object already absent");
            return Ok(());
        }
        result.into_stdout()?;
        Ok(())
    }

    /// Runs a read against one device, mapping a missing device to
    /// [`KernelError::LinkNotFound`].
    async fn query_dev(&self, cmd: &str, name: &str) -> KernelResult<String> {
        let result = self.run(cmd).await?;
        if result.failure() == Some(IpFailure::NoDevice) {
            return Err(KernelError::link_not_found(name));
        }
        result.into_stdout()
    }

    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.mock_mode = true;
        self
    }

    #[cfg(test)]
    pub fn push_mock_result(&self, exit_code: i32, stdout: &str, stderr: &str) {
        self.mock_results
            .lock()
            .push_back((exit_code, stdout.to_string(), stderr.to_string()));
    }

    #[cfg(test)]
    pub fn captured_commands(&self) -> Vec<String> {
        self.captured_commands.lock().clone()
    }
}

impl Default for IpCommandKernel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Kernel for IpCommandKernel {
    async fn link_by_name(&self, name: &str) -> KernelResult<Link> {
        let cmd = build_show_link_cmd(name);
        let output = self.query_dev(&cmd, name).await?;
        parse_links(&cmd, &output)?
            .into_iter()
            .next()
            .ok_or_else(|| KernelError::link_not_found(name))
    }

    async fn links(&self) -> KernelResult<Vec<Link>> {
        let cmd = build_show_links_cmd();
        let output = self.query(&cmd).await?;
        parse_links(&cmd, &output)
    }

    async fn routes(&self, family: IpFamily, table: u32) -> KernelResult<Vec<Route>> {
        let cmd = build_show_routes_cmd(family, table);
        let result = self.run(&cmd).await?;
        // tables come into existence with their first route
        if result.failure() == Some(IpFailure::Absent) {
            trace!(%family, table, "Route table does not exist yet");
            return Ok(Vec::new());
        }
        let output = result.into_stdout()?;
        parse_routes(&cmd, family, table, &output)
    }

    async fn replace_route(&self, route: &Route) -> KernelResult<()> {
        debug!(route = %route, "Replacing route");
        self.apply(&build_replace_route_cmd(route)).await
    }

    async fn delete_route(&self, route: &Route) -> KernelResult<()> {
        debug!(route = %route, "Deleting route");
        self.remove(&build_del_route_cmd(route)).await
    }

    async fn rules(&self, family: IpFamily) -> KernelResult<Vec<Rule>> {
        let cmd = build_show_rules_cmd(family);
        let output = self.query(&cmd).await?;
        parse_rules(&cmd, family, &output)
    }

    async fn add_rule(&self, rule: &Rule) -> KernelResult<()> {
        debug!(rule = %rule, "Adding rule");
        self.apply(&build_add_rule_cmd(rule)).await
    }

    async fn delete_rule(&self, rule: &Rule) -> KernelResult<()> {
        debug!(rule = %rule, "Deleting rule");
        self.remove(&build_del_rule_cmd(rule)).await
    }

    async fn addresses(&self, family: IpFamily, link: Option<&str>) -> KernelResult<Vec<Address>> {
        let cmd = build_show_addrs_cmd(family, link);
        let output = match link {
            Some(name) => self.query_dev(&cmd, name).await?,
            None => self.query(&cmd).await?,
        };
        parse_addresses(&cmd, family, &output)
    }

    async fn replace_address(&self, address: &Address) -> KernelResult<()> {
        debug!(address = %address, "Replacing address");
        self.apply(&build_replace_addr_cmd(address)).await
    }

    async fn delete_address(&self, address: &Address) -> KernelResult<()> {
        debug!(address = %address, "Deleting address");
        self.remove(&build_del_addr_cmd(address)).await
    }
}

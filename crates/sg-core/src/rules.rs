//! Typed form of the ingress rule list handed down by the orchestrator.
//!
//! The wire encoding is `proto:start:end:cidr1,cidr2,;proto:...`. Entries
//! are separated by `;`, CIDRs by `,`, and both lists may carry a trailing
//! separator. A CIDR of `0.0.0.0/0` is not programmed as a source match;
//! it sets [`RuleIntent::allow_any`] instead.

use crate::error::{FirewallError, Result};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

pub const ANY_CIDR: &str = "0.0.0.0/0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpMatch {
    Any,
    Type(u8),
    TypeCode(u8, u8),
}

impl fmt::Display for IcmpMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpMatch::Any => f.write_str("any"),
            IcmpMatch::Type(t) => write!(f, "{}", t),
            IcmpMatch::TypeCode(t, c) => write!(f, "{}/{}", t, c),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    All,
    Tcp(PortRange),
    Udp(PortRange),
    Icmp(IcmpMatch),
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::All => "all",
            Protocol::Tcp(_) => "tcp",
            Protocol::Udp(_) => "udp",
            Protocol::Icmp(_) => "icmp",
        }
    }
}

/// One ingress allowance: a protocol shape plus the sources it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleIntent {
    pub protocol: Protocol,
    pub cidrs: Vec<IpNet>,
    pub allow_any: bool,
}

impl RuleIntent {
    pub fn parse_entry(entry: &str) -> Result<Self> {
        let tokens: Vec<&str> = entry.split(':').collect();
        if tokens.len() != 4 {
            return Err(FirewallError::malformed(
                entry,
                format!("expected 4 ':'-separated fields, found {}", tokens.len()),
            ));
        }

        let start = parse_port_field(entry, "start", tokens[1])?;
        let end = parse_port_field(entry, "end", tokens[2])?;

        let protocol = match tokens[0].trim().to_ascii_lowercase().as_str() {
            "all" => Protocol::All,
            "tcp" => Protocol::Tcp(port_range(entry, start, end)?),
            "udp" => Protocol::Udp(port_range(entry, start, end)?),
            "icmp" => Protocol::Icmp(icmp_match(entry, start, end)?),
            other => {
                return Err(FirewallError::malformed(
                    entry,
                    format!("unsupported protocol '{}'", other),
                ));
            }
        };

        let mut cidrs = Vec::new();
        let mut allow_any = false;
        for cidr in tokens[3].split(',').map(str::trim).filter(|c| !c.is_empty()) {
            if cidr == ANY_CIDR {
                allow_any = true;
                continue;
            }
            cidrs.push(parse_cidr(entry, cidr)?);
        }

        Ok(Self {
            protocol,
            cidrs,
            allow_any,
        })
    }
}

/// Result of lenient parsing: the usable entries and the rejected ones.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub rules: Vec<RuleIntent>,
    pub rejected: Vec<FirewallError>,
}

impl RuleSet {
    /// Parses every entry, setting malformed ones aside instead of failing.
    pub fn parse(encoded: &str) -> Self {
        let mut set = RuleSet::default();
        for entry in entries(encoded) {
            match RuleIntent::parse_entry(entry) {
                Ok(rule) => set.rules.push(rule),
                Err(e) => set.rejected.push(e),
            }
        }
        set
    }

    /// Parses every entry, failing on the first malformed one.
    pub fn parse_strict(encoded: &str) -> Result<Vec<RuleIntent>> {
        entries(encoded).map(RuleIntent::parse_entry).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn entries(encoded: &str) -> impl Iterator<Item = &str> {
    encoded.split(';').map(str::trim).filter(|e| !e.is_empty())
}

fn parse_port_field(entry: &str, which: &str, value: &str) -> Result<i32> {
    value.trim().parse().map_err(|_| {
        FirewallError::malformed(entry, format!("{} '{}' is not a number", which, value))
    })
}

fn port_range(entry: &str, start: i32, end: i32) -> Result<PortRange> {
    let to_port = |value: i32| u16::try_from(value).ok();
    match (to_port(start), to_port(end)) {
        (Some(start), Some(end)) if start <= end => Ok(PortRange { start, end }),
        _ => Err(FirewallError::malformed(
            entry,
            format!("invalid port range {}:{}", start, end),
        )),
    }
}

fn icmp_match(entry: &str, icmp_type: i32, code: i32) -> Result<IcmpMatch> {
    if icmp_type == -1 {
        return Ok(IcmpMatch::Any);
    }

    let icmp_type = u8::try_from(icmp_type)
        .map_err(|_| FirewallError::malformed(entry, format!("invalid icmp type {}", icmp_type)))?;
    if code == -1 {
        return Ok(IcmpMatch::Type(icmp_type));
    }
    let code = u8::try_from(code)
        .map_err(|_| FirewallError::malformed(entry, format!("invalid icmp code {}", code)))?;
    Ok(IcmpMatch::TypeCode(icmp_type, code))
}

fn parse_cidr(entry: &str, value: &str) -> Result<IpNet> {
    let net = value
        .parse::<IpNet>()
        .or_else(|_| value.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| FirewallError::malformed(entry, format!("invalid CIDR '{}'", value)))?;

    match net {
        IpNet::V4(_) => Ok(net),
        IpNet::V6(_) => Err(FirewallError::malformed(
            entry,
            format!("IPv6 source '{}' cannot be programmed with iptables", value),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trailing_separators() {
        let set = RuleSet::parse("tcp:22:22:10.0.0.0/8,192.168.1.0/24,;udp:53:53:10.0.0.0/8,;");
        assert!(set.rejected.is_empty());
        assert_eq!(set.rules.len(), 2);
        assert_eq!(
            set.rules[0].protocol,
            Protocol::Tcp(PortRange { start: 22, end: 22 })
        );
        assert_eq!(set.rules[0].cidrs.len(), 2);
        assert!(!set.rules[0].allow_any);
    }

    #[test]
    fn any_cidr_becomes_a_flag() {
        let rule = RuleIntent::parse_entry("tcp:22:22:10.0.0.0/8,0.0.0.0/0,").unwrap();
        assert!(rule.allow_any);
        assert_eq!(rule.cidrs, vec!["10.0.0.0/8".parse::<IpNet>().unwrap()]);
    }

    #[test]
    fn icmp_ports_become_type_and_code() {
        let any = RuleIntent::parse_entry("icmp:-1:-1:0.0.0.0/0,").unwrap();
        assert_eq!(any.protocol, Protocol::Icmp(IcmpMatch::Any));
        assert!(any.cidrs.is_empty());

        let echo = RuleIntent::parse_entry("icmp:8:0:10.0.0.0/8,").unwrap();
        assert_eq!(echo.protocol, Protocol::Icmp(IcmpMatch::TypeCode(8, 0)));

        let type_only = RuleIntent::parse_entry("icmp:3:-1:10.0.0.0/8,").unwrap();
        assert_eq!(type_only.protocol, Protocol::Icmp(IcmpMatch::Type(3)));
        assert_eq!(IcmpMatch::TypeCode(8, 0).to_string(), "8/0");
    }

    #[test]
    fn bare_addresses_are_host_routes() {
        let rule = RuleIntent::parse_entry("all:0:0:10.1.1.5,").unwrap();
        assert_eq!(rule.protocol, Protocol::All);
        assert_eq!(rule.cidrs[0].to_string(), "10.1.1.5/32");
    }

    #[test]
    fn malformed_entries_are_set_aside() {
        let set = RuleSet::parse("tcp:80:80:10.0.0.0/8,;udp:53:10.0.0.0/8,;");
        assert_eq!(set.rules.len(), 1);
        assert_eq!(set.rejected.len(), 1);
        assert!(matches!(
            set.rejected[0],
            FirewallError::MalformedRuleEntry { ref entry, .. } if entry == "udp:53:10.0.0.0/8,"
        ));
    }

    #[test]
    fn strict_parsing_surfaces_the_error() {
        assert!(RuleSet::parse_strict("tcp:80:80:10.0.0.0/8,").is_ok());
        for bad in [
            "tcp:80:10.0.0.0/8,",
            "sctp:1:2:10.0.0.0/8,",
            "tcp:90:80:10.0.0.0/8,",
            "tcp:1:70000:10.0.0.0/8,",
            "udp:a:b:10.0.0.0/8,",
            "tcp:22:22:10.0.0.300/8,",
            "tcp:22:22:fd00::/8,",
        ] {
            assert!(
                matches!(
                    RuleSet::parse_strict(bad),
                    Err(FirewallError::MalformedRuleEntry { .. })
                ),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn empty_input_has_no_rules() {
        let set = RuleSet::parse(";;");
        assert!(set.is_empty());
        assert!(set.rejected.is_empty());
    }
}

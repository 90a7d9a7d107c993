//! Rule specifications, as argument vectors following `-A <chain>`/`-I <chain>`.

use sg_core::exec::args;
use sg_core::{MacAddr, Protocol, RuleIntent, VmNetwork};
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

pub type RuleSpec = Vec<String>;

pub const FILTER: &str = "filter";
pub const NAT: &str = "nat";
pub const FORWARD: &str = "FORWARD";
pub const PREROUTING: &str = "PREROUTING";
pub const POSTROUTING: &str = "POSTROUTING";

const DHCP_SERVER_PORT: &str = "67";
const DHCP_CLIENT_PORT: &str = "68";

/// Chain names of the hook installed once per bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeChains {
    pub bridge: String,
    pub main: String,
    pub inbound: String,
    pub outbound: String,
}

impl BridgeChains {
    pub fn new(bridge: &str) -> Self {
        let main = format!("BF-{}", bridge);
        Self {
            bridge: bridge.to_string(),
            inbound: format!("{}-IN", main),
            outbound: format!("{}-OUT", main),
            main,
        }
    }

    /// FORWARD rules, in insertion order. Inserting each at the head leaves
    /// the bridged jumps ahead of the drops.
    pub fn forward_rules(&self) -> Vec<RuleSpec> {
        vec![
            args(["-i", &self.bridge, "-j", "DROP"]),
            args(["-o", &self.bridge, "-j", "DROP"]),
            args([
                "-i",
                &self.bridge,
                "-m",
                "physdev",
                "--physdev-is-bridged",
                "-j",
                &self.main,
            ]),
            args([
                "-o",
                &self.bridge,
                "-m",
                "physdev",
                "--physdev-is-bridged",
                "-j",
                &self.main,
            ]),
        ]
    }

    /// Rules appended to `BF-<bridge>`.
    pub fn main_rules(&self, physdev: Option<&str>) -> Vec<RuleSpec> {
        let mut rules = Vec::new();
        if let Some(physdev) = physdev {
            rules.push(uplink_accept(physdev));
        }
        rules.push(args([
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]));
        rules.push(args([
            "-m",
            "physdev",
            "--physdev-is-bridged",
            "--physdev-is-out",
            "-j",
            &self.outbound,
        ]));
        rules.push(args([
            "-m",
            "physdev",
            "--physdev-is-bridged",
            "--physdev-is-in",
            "-j",
            &self.inbound,
        ]));
        rules
    }

    /// Jump from `BF-<bridge>-OUT` into the default chain for traffic
    /// leaving the bridge towards `vif`.
    pub fn outbound_jump(&self, vif: &str, default_chain: &str) -> RuleSpec {
        args([
            "-m",
            "physdev",
            "--physdev-is-bridged",
            "--physdev-out",
            vif,
            "-j",
            default_chain,
        ])
    }

    pub fn inbound_jump(&self, vif: &str, default_chain: &str) -> RuleSpec {
        args([
            "-m",
            "physdev",
            "--physdev-is-bridged",
            "--physdev-in",
            vif,
            "-j",
            default_chain,
        ])
    }
}

/// Lets bridged traffic leave through the physical uplink unfiltered.
pub fn uplink_accept(physdev: &str) -> RuleSpec {
    args([
        "-m",
        "physdev",
        "--physdev-is-bridged",
        "--physdev-out",
        physdev,
        "-j",
        "ACCEPT",
    ])
}

/// IPv4 address usable for source and ARP matches.
pub fn vm_ipv4(net: &VmNetwork) -> Option<Ipv4Addr> {
    match net.vm_ip {
        Some(IpAddr::V4(ip)) => Some(ip),
        _ => None,
    }
}

/// Contents of the VM's default chain, in order.
pub fn default_chain_rules(net: &VmNetwork) -> Vec<RuleSpec> {
    let vif = net.vif.as_str();
    let mut rules = vec![
        args([
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]),
        args([
            "-p",
            "udp",
            "-m",
            "physdev",
            "--physdev-is-bridged",
            "--physdev-in",
            vif,
            "-m",
            "udp",
            "--dport",
            DHCP_SERVER_PORT,
            "-j",
            "ACCEPT",
        ]),
        args([
            "-p",
            "udp",
            "-m",
            "physdev",
            "--physdev-is-bridged",
            "--physdev-out",
            vif,
            "-m",
            "udp",
            "--dport",
            DHCP_CLIENT_PORT,
            "-j",
            "ACCEPT",
        ]),
    ];

    if let Some(ip) = vm_ipv4(net) {
        rules.push(args([
            "-s",
            &ip.to_string(),
            "-m",
            "physdev",
            "--physdev-is-bridged",
            "--physdev-in",
            vif,
            "-j",
            "ACCEPT",
        ]));
    }

    rules.push(args(["-j", net.vm_name.chain()]));
    rules
}

pub fn drop_all() -> RuleSpec {
    args(["-j", "DROP"])
}

/// Inbound bridge-filter chain: only frames and ARP claiming the VM's own
/// addresses get through.
pub fn ebtables_in_rules(mac: &MacAddr, ip: Option<Ipv4Addr>) -> Vec<RuleSpec> {
    let mac = mac.to_string();
    let mut rules = vec![
        args(["-s", "!", &mac, "-j", "DROP"]),
        args(["-p", "ARP", "--arp-mac-src", "!", &mac, "-j", "DROP"]),
    ];
    if let Some(ip) = ip {
        rules.push(args([
            "-p",
            "ARP",
            "--arp-ip-src",
            "!",
            &ip.to_string(),
            "-j",
            "DROP",
        ]));
    }
    rules.extend(arp_tail());
    rules
}

pub fn ebtables_out_rules(mac: &MacAddr, ip: Option<Ipv4Addr>) -> Vec<RuleSpec> {
    let mac = mac.to_string();
    let mut rules = vec![args([
        "-p",
        "ARP",
        "--arp-op",
        "Reply",
        "--arp-mac-dst",
        "!",
        &mac,
        "-j",
        "DROP",
    ])];
    if let Some(ip) = ip {
        rules.push(args([
            "-p",
            "ARP",
            "--arp-ip-dst",
            "!",
            &ip.to_string(),
            "-j",
            "DROP",
        ]));
    }
    rules.extend(arp_tail());
    rules
}

fn arp_tail() -> [RuleSpec; 3] {
    [
        args(["-p", "ARP", "--arp-op", "Request", "-j", "ACCEPT"]),
        args(["-p", "ARP", "--arp-op", "Reply", "-j", "ACCEPT"]),
        args(["-p", "ARP", "-j", "DROP"]),
    ]
}

pub fn prerouting_jump(vif: &str, chain: &str) -> RuleSpec {
    args(["-i", vif, "-j", chain])
}

pub fn postrouting_jump(vif: &str, chain: &str) -> RuleSpec {
    args(["-o", vif, "-j", chain])
}

/// ACCEPT rules for one ingress intent: one per explicit source, plus an
/// unscoped one when any source is allowed.
///
/// `all` with the any-source sentinel yields no unscoped rule.
pub fn ingress_rules(intent: &RuleIntent) -> Vec<RuleSpec> {
    let mut sources: Vec<Option<String>> =
        intent.cidrs.iter().map(|c| Some(c.to_string())).collect();

    if intent.allow_any {
        if intent.protocol == Protocol::All {
            debug!("any-source sentinel on an 'all' rule adds no unscoped accept");
        } else {
            sources.push(None);
        }
    }

    sources
        .into_iter()
        .map(|source| ingress_rule(&intent.protocol, source.as_deref()))
        .collect()
}

fn ingress_rule(protocol: &Protocol, source: Option<&str>) -> RuleSpec {
    let mut spec = Vec::new();
    if let Some(source) = source {
        spec.extend(args(["-s", source]));
    }

    match protocol {
        Protocol::All => {
            spec.extend(args(["-m", "state", "--state", "NEW"]));
        }
        Protocol::Tcp(ports) | Protocol::Udp(ports) => {
            let name = protocol.name();
            spec.extend(args([
                "-p",
                name,
                "-m",
                name,
                "--dport",
                &ports.to_string(),
                "-m",
                "state",
                "--state",
                "NEW",
            ]));
        }
        Protocol::Icmp(icmp) => {
            spec.extend(args(["-p", "icmp", "-m", "icmp", "--icmp-type", &icmp.to_string()]));
        }
    }

    spec.extend(args(["-j", "ACCEPT"]));
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(rules: &[RuleSpec]) -> Vec<String> {
        rules.iter().map(|r| r.join(" ")).collect()
    }

    fn network(ip: Option<&str>) -> VmNetwork {
        VmNetwork {
            vm_name: "i-2-10-VM".parse().unwrap(),
            vm_id: 10,
            vm_ip: ip.map(|ip| ip.parse().unwrap()),
            vm_mac: "06:aa:bb:cc:dd:ee".parse().unwrap(),
            vif: "vif3.0".into(),
            bridge_name: "cloudbr0".into(),
        }
    }

    #[test]
    fn bridge_chain_names() {
        let chains = BridgeChains::new("cloudbr0");
        assert_eq!(chains.main, "BF-cloudbr0");
        assert_eq!(chains.inbound, "BF-cloudbr0-IN");
        assert_eq!(chains.outbound, "BF-cloudbr0-OUT");
        assert_eq!(chains.main_rules(None).len(), 3);
        assert_eq!(
            chains.main_rules(Some("eth0"))[0].join(" "),
            "-m physdev --physdev-is-bridged --physdev-out eth0 -j ACCEPT"
        );
    }

    #[test]
    fn default_chain_ends_with_vm_jump() {
        let rules = joined(&default_chain_rules(&network(Some("10.1.1.23"))));
        assert_eq!(rules.len(), 5);
        assert!(rules[1].contains("--physdev-in vif3.0") && rules[1].ends_with("--dport 67 -j ACCEPT"));
        assert!(rules[2].contains("--physdev-out vif3.0") && rules[2].ends_with("--dport 68 -j ACCEPT"));
        assert!(rules[3].starts_with("-s 10.1.1.23 "));
        assert_eq!(rules[4], "-j i-2-10-VM");

        assert_eq!(default_chain_rules(&network(None)).len(), 4);
    }

    #[test]
    fn ingress_rules_per_protocol() {
        let tcp = RuleIntent::parse_entry("tcp:22:22:10.0.0.0/8,0.0.0.0/0,").unwrap();
        assert_eq!(
            joined(&ingress_rules(&tcp)),
            vec![
                "-s 10.0.0.0/8 -p tcp -m tcp --dport 22:22 -m state --state NEW -j ACCEPT",
                "-p tcp -m tcp --dport 22:22 -m state --state NEW -j ACCEPT",
            ]
        );

        let icmp = RuleIntent::parse_entry("icmp:-1:-1:10.0.0.0/8,").unwrap();
        assert_eq!(
            joined(&ingress_rules(&icmp)),
            vec!["-s 10.0.0.0/8 -p icmp -m icmp --icmp-type any -j ACCEPT"]
        );

        let all = RuleIntent::parse_entry("all:0:0:10.0.0.0/8,0.0.0.0/0,").unwrap();
        assert_eq!(
            joined(&ingress_rules(&all)),
            vec!["-s 10.0.0.0/8 -m state --state NEW -j ACCEPT"]
        );
    }

    #[test]
    fn arp_rules_without_ip_skip_address_match() {
        let mac: MacAddr = "06:aa:bb:cc:dd:ee".parse().unwrap();
        let inbound = joined(&ebtables_in_rules(&mac, None));
        assert_eq!(inbound.len(), 5);
        assert!(inbound.iter().all(|r| !r.contains("--arp-ip-src")));
        assert_eq!(inbound.last().unwrap(), "-p ARP -j DROP");

        let outbound = joined(&ebtables_out_rules(&mac, Some("10.1.1.23".parse().unwrap())));
        assert_eq!(outbound[1], "-p ARP --arp-ip-dst ! 10.1.1.23 -j DROP");
    }
}

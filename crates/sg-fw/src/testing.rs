//! In-memory stand-ins for the host tools and the hypervisor.
//!
//! [`FakeHost`] interprets the argument vectors of `iptables`,
//! `iptables-save`, `ebtables`, `sysctl` and `brctl` against a small model
//! of the kernel tables, so reconciler behaviour can be asserted on the
//! resulting chains rather than on command strings.

use sg_core::exec::render_command;
use sg_core::{CommandOutput, CommandRunner, FilterKind, FirewallError, Hypervisor, Result, VmName};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const IPTABLES_TARGETS: &[&str] = &["ACCEPT", "DROP", "RETURN", "REJECT", "LOG", "MASQUERADE"];
const EBTABLES_TARGETS: &[&str] = &["ACCEPT", "DROP", "RETURN", "CONTINUE"];

/// One command the fake received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// True for commands that change firewall or kernel state.
    pub fn is_mutation(&self) -> bool {
        match tool_name(&self.program) {
            "iptables" | "ebtables" => self
                .args
                .iter()
                .any(|a| matches!(a.as_str(), "-N" | "-F" | "-X" | "-A" | "-I" | "-D" | "-P")),
            "sysctl" => self.args.iter().any(|a| a == "-w"),
            _ => false,
        }
    }

    pub fn render(&self) -> String {
        render_command(&self.program, &self.args)
    }
}

#[derive(Debug, Clone, Default)]
struct Chain {
    builtin: bool,
    rules: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
struct Table {
    chains: BTreeMap<String, Chain>,
}

impl Table {
    fn with_builtins(names: &[&str]) -> Self {
        let chains = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    Chain {
                        builtin: true,
                        rules: vec![],
                    },
                )
            })
            .collect();
        Self { chains }
    }

    fn references(&self, chain: &str) -> usize {
        self.chains
            .values()
            .flat_map(|c| c.rules.iter())
            .filter(|rule| jump_target(rule) == Some(chain))
            .count()
    }
}

#[derive(Debug, Default)]
struct HostState {
    iptables: BTreeMap<String, Table>,
    ebtables: BTreeMap<String, Table>,
    sysctls: BTreeMap<String, String>,
    bridges: BTreeMap<String, Vec<String>>,
    failures: Vec<(String, String)>,
    log: Vec<Invocation>,
}

/// Stateful fake of the host's packet-filter tooling.
#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        let mut iptables = BTreeMap::new();
        iptables.insert(
            "filter".to_string(),
            Table::with_builtins(&["INPUT", "FORWARD", "OUTPUT"]),
        );
        iptables.insert(
            "nat".to_string(),
            Table::with_builtins(&["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]),
        );

        let mut ebtables = BTreeMap::new();
        ebtables.insert(
            "filter".to_string(),
            Table::with_builtins(&["INPUT", "FORWARD", "OUTPUT"]),
        );
        ebtables.insert(
            "nat".to_string(),
            Table::with_builtins(&["PREROUTING", "OUTPUT", "POSTROUTING"]),
        );

        Self {
            state: Mutex::new(HostState {
                iptables,
                ebtables,
                ..HostState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a bridge and its member interfaces for `brctl show`.
    pub fn with_bridge(self, bridge: &str, interfaces: &[&str]) -> Self {
        self.state().bridges.insert(
            bridge.to_string(),
            interfaces.iter().map(|i| i.to_string()).collect(),
        );
        self
    }

    pub fn set_sysctl(&self, key: &str, value: &str) {
        self.state()
            .sysctls
            .insert(key.to_string(), value.to_string());
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.state().sysctls.get(key).cloned()
    }

    /// Makes every later command of `tool` whose rendering contains
    /// `needle` exit with status 1.
    pub fn fail_matching(&self, tool: &str, needle: &str) {
        self.state()
            .failures
            .push((tool.to_string(), needle.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state().log.clone()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.state()
            .log
            .iter()
            .filter(|i| i.is_mutation())
            .map(Invocation::render)
            .collect()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    /// Rules of a chain joined with spaces, or `None` when it does not exist.
    pub fn rules(&self, kind: FilterKind, table: &str, chain: &str) -> Option<Vec<String>> {
        let state = self.state();
        let tables = match kind {
            FilterKind::Iptables => &state.iptables,
            FilterKind::Ebtables => &state.ebtables,
        };
        tables
            .get(table)?
            .chains
            .get(chain)
            .map(|c| c.rules.iter().map(|r| r.join(" ")).collect())
    }

    pub fn has_chain(&self, kind: FilterKind, table: &str, chain: &str) -> bool {
        self.rules(kind, table, chain).is_some()
    }

    /// Non-builtin chains of a table.
    pub fn user_chains(&self, kind: FilterKind, table: &str) -> Vec<String> {
        let state = self.state();
        let tables = match kind {
            FilterKind::Iptables => &state.iptables,
            FilterKind::Ebtables => &state.ebtables,
        };
        tables
            .get(table)
            .map(|t| {
                t.chains
                    .iter()
                    .filter(|(_, c)| !c.builtin)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut state = self.state();
        let invocation = Invocation {
            program: program.to_string(),
            args: args.to_vec(),
        };
        let rendered = invocation.render();
        state.log.push(invocation);

        let tool = tool_name(program);
        if state
            .failures
            .iter()
            .any(|(t, needle)| t == tool && rendered.contains(needle.as_str()))
        {
            return Ok(CommandOutput::failed(1, "injected failure"));
        }

        let output = match tool {
            "iptables-save" | "iptables" | "ebtables" | "sysctl" | "brctl"
                if matches!(args, [flag] if flag == "--version") =>
            {
                CommandOutput::ok(format!("{} (fake) 1.0\n", tool))
            }
            "iptables-save" => iptables_save(&state, args),
            "iptables" => filter_command(&mut state.iptables, FilterKind::Iptables, args),
            "ebtables" => filter_command(&mut state.ebtables, FilterKind::Ebtables, args),
            "sysctl" => sysctl(&mut state.sysctls, args),
            "brctl" => brctl(&state.bridges, args),
            _ => {
                return Err(FirewallError::CommandSpawn {
                    command: rendered,
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
        };
        Ok(output)
    }
}

fn tool_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}

fn jump_target(rule: &[String]) -> Option<&str> {
    rule.iter()
        .position(|a| a == "-j")
        .and_then(|i| rule.get(i + 1))
        .map(String::as_str)
}

fn split_table(args: &[String]) -> (&str, Vec<&str>) {
    let mut table = "filter";
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-t" => {
                if let Some(t) = iter.next() {
                    table = t;
                }
            }
            "-n" => {}
            other => rest.push(other),
        }
    }
    (table, rest)
}

fn missing_chain() -> CommandOutput {
    CommandOutput::failed(1, "No chain/target/match by that name.\n")
}

fn filter_command(
    tables: &mut BTreeMap<String, Table>,
    kind: FilterKind,
    args: &[String],
) -> CommandOutput {
    let (table_name, rest) = split_table(args);
    let Some(table) = tables.get_mut(table_name) else {
        return CommandOutput::failed(3, format!("can't initialize table '{}'\n", table_name));
    };
    let Some((&op, rest)) = rest.split_first() else {
        return CommandOutput::failed(2, "no command specified\n");
    };
    let chain = rest.first().copied();
    let spec: Vec<String> = rest.iter().skip(1).map(|s| s.to_string()).collect();

    match (op, chain) {
        ("-N", Some(chain)) => {
            if table.chains.contains_key(chain) {
                return CommandOutput::failed(1, "Chain already exists.\n");
            }
            table.chains.insert(chain.to_string(), Chain::default());
            CommandOutput::ok("")
        }
        ("-F", Some(chain)) => match table.chains.get_mut(chain) {
            Some(c) => {
                c.rules.clear();
                CommandOutput::ok("")
            }
            None => missing_chain(),
        },
        ("-X", Some(chain)) => {
            let Some(c) = table.chains.get(chain) else {
                return missing_chain();
            };
            if c.builtin {
                return CommandOutput::failed(2, "Can't delete built-in chain.\n");
            }
            if !c.rules.is_empty() {
                return CommandOutput::failed(1, "Directory not empty.\n");
            }
            if table.references(chain) > 0 {
                return CommandOutput::failed(1, "Too many links.\n");
            }
            table.chains.remove(chain);
            CommandOutput::ok("")
        }
        ("-A" | "-I", Some(chain)) => {
            if let Some(target) = jump_target(&spec) {
                let standard = match kind {
                    FilterKind::Iptables => IPTABLES_TARGETS,
                    FilterKind::Ebtables => EBTABLES_TARGETS,
                };
                if !standard.contains(&target) && !table.chains.contains_key(target) {
                    return missing_chain();
                }
            }
            let Some(c) = table.chains.get_mut(chain) else {
                return missing_chain();
            };
            if op == "-A" {
                c.rules.push(spec);
            } else {
                c.rules.insert(0, spec);
            }
            CommandOutput::ok("")
        }
        ("-D", Some(chain)) => {
            let Some(c) = table.chains.get_mut(chain) else {
                return missing_chain();
            };
            match c.rules.iter().position(|r| *r == spec) {
                Some(i) => {
                    c.rules.remove(i);
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(
                    1,
                    "Bad rule (does a matching rule exist in that chain?).\n",
                ),
            }
        }
        ("-C", Some(chain)) => match table.chains.get(chain) {
            Some(c) if c.rules.contains(&spec) => CommandOutput::ok(""),
            Some(_) => CommandOutput::failed(1, "Bad rule.\n"),
            None => missing_chain(),
        },
        ("-S", Some(chain)) => {
            let Some(c) = table.chains.get(chain) else {
                return missing_chain();
            };
            let mut out = if c.builtin {
                format!("-P {} ACCEPT\n", chain)
            } else {
                format!("-N {}\n", chain)
            };
            for rule in &c.rules {
                out.push_str(&format!("-A {} {}\n", chain, rule.join(" ")));
            }
            CommandOutput::ok(out)
        }
        ("-L", chain) => match kind {
            FilterKind::Iptables => iptables_list(table, chain),
            FilterKind::Ebtables => ebtables_list(table, table_name, chain),
        },
        _ => CommandOutput::failed(2, "unsupported command\n"),
    }
}

fn iptables_list(table: &Table, chain: Option<&str>) -> CommandOutput {
    let render = |name: &str, c: &Chain| {
        let header = if c.builtin {
            format!("Chain {} (policy ACCEPT)\n", name)
        } else {
            format!("Chain {} ({} references)\n", name, table.references(name))
        };
        let mut out = header;
        out.push_str("target     prot opt source               destination\n");
        for rule in &c.rules {
            out.push_str(&rule.join(" "));
            out.push('\n');
        }
        out
    };

    match chain {
        Some(name) => match table.chains.get(name) {
            Some(c) => CommandOutput::ok(render(name, c)),
            None => missing_chain(),
        },
        None => CommandOutput::ok(
            table
                .chains
                .iter()
                .map(|(name, c)| render(name, c))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    }
}

fn ebtables_list(table: &Table, table_name: &str, arg: Option<&str>) -> CommandOutput {
    if arg == Some("--Lx") {
        let mut out = String::new();
        for (name, c) in &table.chains {
            if !c.builtin {
                out.push_str(&format!("ebtables -t {} -N {}\n", table_name, name));
            }
        }
        for (name, c) in &table.chains {
            for rule in &c.rules {
                out.push_str(&format!(
                    "ebtables -t {} -A {} {}\n",
                    table_name,
                    name,
                    rule.join(" ")
                ));
            }
        }
        return CommandOutput::ok(out);
    }

    let render = |name: &str, c: &Chain| {
        let policy = if c.builtin { "ACCEPT" } else { "RETURN" };
        let mut out = format!(
            "Bridge chain: {}, entries: {}, policy: {}\n",
            name,
            c.rules.len(),
            policy
        );
        for rule in &c.rules {
            out.push_str(&rule.join(" "));
            out.push('\n');
        }
        out
    };

    let mut out = format!("Bridge table: {}\n\n", table_name);
    match arg {
        Some(name) => match table.chains.get(name) {
            Some(c) => out.push_str(&render(name, c)),
            None => return missing_chain(),
        },
        None => {
            let chains: Vec<String> = table
                .chains
                .iter()
                .map(|(name, c)| render(name, c))
                .collect();
            out.push_str(&chains.join("\n"));
        }
    }
    CommandOutput::ok(out)
}

fn iptables_save(state: &HostState, args: &[String]) -> CommandOutput {
    let (only, _) = split_table(args);
    let explicit = args.iter().any(|a| a == "-t");

    let mut out = String::new();
    for (name, table) in &state.iptables {
        if explicit && name != only {
            continue;
        }
        out.push_str(&format!("*{}\n", name));
        for (chain, c) in &table.chains {
            let policy = if c.builtin { "ACCEPT" } else { "-" };
            out.push_str(&format!(":{} {} [0:0]\n", chain, policy));
        }
        for (chain, c) in &table.chains {
            for rule in &c.rules {
                out.push_str(&format!("-A {} {}\n", chain, rule.join(" ")));
            }
        }
        out.push_str("COMMIT\n");
    }
    CommandOutput::ok(out)
}

fn sysctl(sysctls: &mut BTreeMap<String, String>, args: &[String]) -> CommandOutput {
    match args {
        [flag, assignment] if flag == "-w" => match assignment.split_once('=') {
            Some((key, value)) => {
                sysctls.insert(key.to_string(), value.to_string());
                CommandOutput::ok(format!("{} = {}\n", key, value))
            }
            None => CommandOutput::failed(255, "sysctl: malformed setting\n"),
        },
        [flag, key] if flag == "-n" => match sysctls.get(key) {
            Some(value) => CommandOutput::ok(format!("{}\n", value)),
            None => CommandOutput::failed(
                255,
                format!("sysctl: cannot stat /proc/sys/{}: No such file or directory\n", key),
            ),
        },
        _ => CommandOutput::failed(255, "sysctl: unsupported arguments\n"),
    }
}

fn brctl(bridges: &BTreeMap<String, Vec<String>>, args: &[String]) -> CommandOutput {
    let mut out = String::from("bridge name\tbridge id\t\tSTP enabled\tinterfaces\n");
    let render = |out: &mut String, name: &str, ifaces: &[String]| {
        let first = ifaces.first().map(String::as_str).unwrap_or("");
        out.push_str(&format!("{}\t\t8000.001e4f1a2b3c\tno\t\t{}\n", name, first));
        for iface in ifaces.iter().skip(1) {
            out.push_str(&format!("\t\t\t\t\t\t\t{}\n", iface));
        }
    };

    match args {
        [show] if show == "show" => {
            for (name, ifaces) in bridges {
                render(&mut out, name, ifaces);
            }
            CommandOutput::ok(out)
        }
        [show, bridge] if show == "show" => match bridges.get(bridge) {
            Some(ifaces) => {
                render(&mut out, bridge, ifaces);
                CommandOutput::ok(out)
            }
            None => CommandOutput::failed(1, format!("bridge {} does not exist!\n", bridge)),
        },
        _ => CommandOutput::failed(1, "unsupported brctl command\n"),
    }
}

/// Hypervisor with a fixed set of running domains.
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    domains: Mutex<BTreeMap<String, u32>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vm(self, name: &str, dom_id: u32) -> Self {
        self.start(name, dom_id);
        self
    }

    pub fn start(&self, name: &str, dom_id: u32) {
        self.domains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), dom_id);
    }

    pub fn stop(&self, name: &str) {
        self.domains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }
}

impl Hypervisor for FakeHypervisor {
    fn dom_id(&self, vm_name: &VmName) -> Result<u32> {
        self.domains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(vm_name.as_str())
            .copied()
            .ok_or_else(|| FirewallError::Hypervisor {
                vm_name: vm_name.to_string(),
                message: "domain is not running".to_string(),
            })
    }

    fn running_vms(&self) -> Result<Vec<String>> {
        Ok(self
            .domains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_core::exec::args;

    #[test]
    fn jump_to_missing_chain_is_rejected() {
        let host = FakeHost::new();
        let out = host
            .run("iptables", &args(["-t", "filter", "-A", "FORWARD", "-j", "nope"]))
            .unwrap();
        assert!(!out.success());

        host.run("iptables", &args(["-N", "nope"])).unwrap();
        let out = host
            .run("iptables", &args(["-A", "FORWARD", "-j", "nope"]))
            .unwrap();
        assert!(out.success());

        let out = host.run("iptables", &args(["-X", "nope"])).unwrap();
        assert!(!out.success(), "referenced chain must not be deletable");
    }

    #[test]
    fn mutations_are_classified() {
        let host = FakeHost::new().with_bridge("cloudbr0", &["eth0", "vif3.0"]);
        host.run("iptables-save", &args(["-t", "filter"])).unwrap();
        host.run("brctl", &args(["show", "cloudbr0"])).unwrap();
        host.run("iptables", &args(["-N", "x"])).unwrap();
        host.run("sysctl", &args(["-w", "net.bridge.bridge-nf-call-iptables=1"]))
            .unwrap();

        assert_eq!(
            host.mutations(),
            vec!["iptables -N x", "sysctl -w net.bridge.bridge-nf-call-iptables=1"]
        );
        assert_eq!(
            host.sysctl("net.bridge.bridge-nf-call-iptables").as_deref(),
            Some("1")
        );
    }

    #[test]
    fn injected_failures_exit_non_zero() {
        let host = FakeHost::new();
        host.fail_matching("iptables", "-N bad");
        assert!(!host.run("iptables", &args(["-N", "bad"])).unwrap().success());
        assert!(host.run("iptables", &args(["-N", "good"])).unwrap().success());
        assert!(!host.has_chain(FilterKind::Iptables, "filter", "bad"));
    }

    #[test]
    fn fake_hypervisor_tracks_domains() {
        let hv = FakeHypervisor::new().with_vm("i-2-10-VM", 7);
        let name = VmName::new("i-2-10-VM").unwrap();
        assert_eq!(hv.dom_id(&name).unwrap(), 7);
        assert!(hv.is_running("i-2-10-VM").unwrap());
        hv.stop("i-2-10-VM");
        assert!(hv.dom_id(&name).is_err());
    }
}

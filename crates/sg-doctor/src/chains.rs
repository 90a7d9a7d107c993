use crate::diagnostics::{DiagnosticLevel, DiagnosticResult};
use regex::Regex;
use sg_core::{CommandRunner, Hypervisor, VmName};
use sg_fw::SecurityGroupManager;
use sg_fw::specs::FILTER;
use std::sync::LazyLock;
use tracing::debug;

static TRAILING_DROP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-A \S+ -j DROP$").expect("valid regex"));

/// Audits VM isolation chains against the rule-log store and the hypervisor.
pub struct ChainDiagnostics<'a, R, H> {
    sg: &'a SecurityGroupManager<R, H>,
}

impl<'a, R: CommandRunner, H: Hypervisor> ChainDiagnostics<'a, R, H> {
    pub fn new(sg: &'a SecurityGroupManager<R, H>) -> Self {
        Self { sg }
    }

    pub fn diagnose(&self) -> Vec<DiagnosticResult> {
        let chains = match self.sg.iptables().list_chains(FILTER) {
            Ok(chains) => chains,
            Err(e) => {
                return vec![
                    DiagnosticResult::new(
                        DiagnosticLevel::Error,
                        "Failed to list filter chains",
                        e.to_string(),
                    )
                    .with_command("sudo iptables-save -t filter"),
                ];
            }
        };
        let vm_chains: Vec<String> = chains
            .into_iter()
            .filter(|chain| VmName::is_isolation_chain(chain))
            .collect();
        debug!(count = vm_chains.len(), "auditing VM chains");

        let mut results = self.check_default_deny(&vm_chains);
        results.extend(self.check_stale_records(&vm_chains));
        results.extend(self.check_orphans(&vm_chains));
        results
    }

    fn check_default_deny(&self, vm_chains: &[String]) -> Vec<DiagnosticResult> {
        let ipt = self.sg.iptables();
        let mut results = Vec::new();
        let mut closed = 0;

        for chain in vm_chains {
            let rules = match ipt.list_rules(FILTER, chain) {
                Ok(rules) => rules,
                Err(e) => {
                    results.push(DiagnosticResult::new(
                        DiagnosticLevel::Error,
                        format!("Cannot read chain {}", chain),
                        e.to_string(),
                    ));
                    continue;
                }
            };

            match rules.last() {
                Some(last) if TRAILING_DROP.is_match(last) => closed += 1,
                last => {
                    results.push(
                        DiagnosticResult::new(
                            DiagnosticLevel::Critical,
                            format!("{} is not default-deny", chain),
                            match last {
                                Some(rule) => format!("Last rule is '{}'", rule),
                                None => "Chain is empty".to_string(),
                            },
                        )
                        .with_suggestion("Re-run the VM's rule programming to restore the trailing DROP")
                        .with_command(format!("sudo iptables -A {} -j DROP", chain)),
                    );
                }
            }
        }

        if !vm_chains.is_empty() {
            results.push(DiagnosticResult::new(
                DiagnosticLevel::Info,
                "VM chains audited",
                format!("{} of {} VM chain(s) end with DROP", closed, vm_chains.len()),
            ));
        }

        results
    }

    fn check_stale_records(&self, vm_chains: &[String]) -> Vec<DiagnosticResult> {
        let store = self.sg.store();
        let names = match store.list() {
            Ok(names) => names,
            Err(e) => {
                return vec![DiagnosticResult::new(
                    DiagnosticLevel::Error,
                    "Cannot read rule log records",
                    format!("{}: {}", store.run_dir().display(), e),
                )];
            }
        };

        names
            .into_iter()
            .filter(|name| !vm_chains.iter().any(|chain| chain == name.chain()))
            .map(|name| {
                DiagnosticResult::new(
                    DiagnosticLevel::Warning,
                    format!("Stale record for {}", name),
                    format!(
                        "{} exists but the chain does not; the next apply would be skipped if nothing changed",
                        store.record_path(&name).display()
                    ),
                )
                .with_command(format!("sgwarden vm delete --name {}", name))
            })
            .collect()
    }

    fn check_orphans(&self, vm_chains: &[String]) -> Vec<DiagnosticResult> {
        let running = match self.sg.hypervisor().running_vms() {
            Ok(running) => running,
            Err(e) => {
                return vec![
                    DiagnosticResult::new(
                        DiagnosticLevel::Error,
                        "Cannot query hypervisor",
                        e.to_string(),
                    )
                    .with_suggestion("Orphan detection needs the list of running domains"),
                ];
            }
        };

        let orphans: Vec<&String> = vm_chains
            .iter()
            .filter(|chain| !running.contains(chain))
            .collect();
        if orphans.is_empty() {
            return Vec::new();
        }

        vec![
            DiagnosticResult::new(
                DiagnosticLevel::Warning,
                format!("{} orphaned VM chain(s)", orphans.len()),
                format!(
                    "No running domain for: {}",
                    orphans.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", ")
                ),
            )
            .with_command("sgwarden cleanup"),
        ]
    }
}

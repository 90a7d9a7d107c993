use crate::iptables::{mentions, saved_rule};
use crate::reconciler::SecurityGroupManager;
use crate::specs::{FILTER, NAT};
use sg_core::{CommandRunner, FilterKind, Hypervisor, Result, VmName};
use tracing::{debug, info, warn};

/// What a teardown did. Failures are informational; teardown never fails.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub vm_name: String,
    pub removed: Vec<String>,
    pub failures: Vec<String>,
}

impl TeardownReport {
    fn new(vm_name: &VmName) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            ..Self::default()
        }
    }

    fn step<T>(&mut self, what: String, result: Result<T>) {
        match result {
            Ok(_) => self.removed.push(what),
            Err(e) => {
                debug!(vm = %self.vm_name, error = %e, "ignoring failure: {}", what);
                self.failures.push(format!("{}: {}", what, e));
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub scanned: usize,
    pub removed: Vec<TeardownReport>,
}

impl<R: CommandRunner, H: Hypervisor> SecurityGroupManager<R, H> {
    /// Removes everything the reconciler placed for `vm_name`: hook rules,
    /// isolation chains, bridge-filter chains, optionally NAT rules on `vif`,
    /// and the stored record. Every step is best-effort.
    pub fn delete_all_rules_for_vm(&self, vm_name: &VmName, vif: Option<&str>) -> TeardownReport {
        let mut report = TeardownReport::new(vm_name);

        report.failures.extend(self.reset_vm_references(vm_name));

        if let Some(vif) = vif {
            self.remove_nat_rules(vif, &mut report);
        }

        let ipt = self.iptables();
        let filter_chains = ipt.list_chains(FILTER).unwrap_or_else(|e| {
            warn!(vm = %vm_name, error = %e, "could not list filter chains");
            Vec::new()
        });
        let default_chain = vm_name.default_chain();
        let owned: Vec<&str> = [default_chain.as_str(), vm_name.chain()]
            .into_iter()
            .filter(|chain| filter_chains.iter().any(|c| c == *chain))
            .collect();
        // Flush both before deleting: the default chain jumps into the VM chain.
        for chain in &owned {
            report.step(format!("flush {}", chain), ipt.flush(FILTER, chain));
        }
        for chain in &owned {
            report.step(format!("delete chain {}", chain), ipt.delete_chain(FILTER, chain));
        }

        let ebt = self.ebtables();
        let bridge_chains = ebt.list_chains(NAT).unwrap_or_else(|e| {
            warn!(vm = %vm_name, error = %e, "could not list bridge-filter chains");
            Vec::new()
        });
        for chain in [vm_name.ebtables_in_chain(), vm_name.ebtables_out_chain()] {
            if !bridge_chains.contains(&chain) {
                continue;
            }
            report.step(format!("flush ebtables {}", chain), ebt.flush(NAT, &chain));
            report.step(
                format!("delete ebtables chain {}", chain),
                ebt.delete_chain(NAT, &chain),
            );
        }

        report.step("remove rule log record".to_string(), self.store.remove(vm_name));
        report.step("remove rule ledger".to_string(), self.store.remove_ledger(vm_name));
        self.count(|c| c.teardowns += 1);

        info!(
            vm = %vm_name,
            removed = report.removed.len(),
            failures = report.failures.len(),
            "tore down VM rules"
        );
        report
    }

    /// Deletes the rules this VM placed in chains it does not own, without
    /// touching its own chains. Returns the failures.
    pub(crate) fn reset_vm_references(&self, vm_name: &VmName) -> Vec<String> {
        match self.store.load_ledger(vm_name) {
            Ok(Some(ledger)) => {
                let mut failures = Vec::new();
                if !ledger.authoritative {
                    debug!(vm = %vm_name, "rule ledger is partial, scanning live rules too");
                }
                for rule in ledger.removal_order() {
                    let removed = match rule.kind {
                        FilterKind::Iptables => {
                            self.iptables().delete_rule(&rule.table, &rule.chain, &rule.spec)
                        }
                        FilterKind::Ebtables => {
                            self.ebtables().delete_rule(&rule.table, &rule.chain, &rule.spec)
                        }
                    };
                    if let Err(e) = removed {
                        failures.push(format!("{}: {}", rule.render(), e));
                    }
                }
                if !ledger.authoritative {
                    failures.extend(self.scan_vm_references(vm_name));
                }
                if let Err(e) = self.store.remove_ledger(vm_name) {
                    failures.push(format!("remove rule ledger: {}", e));
                }
                failures
            }
            Ok(None) => self.scan_vm_references(vm_name),
            Err(e) => {
                warn!(vm = %vm_name, error = %e, "unreadable rule ledger, scanning live rules");
                let mut failures = self.scan_vm_references(vm_name);
                if let Err(e) = self.store.remove_ledger(vm_name) {
                    failures.push(format!("remove rule ledger: {}", e));
                }
                failures
            }
        }
    }

    /// Fallback for VMs without an authoritative ledger: deletes bridged rules
    /// that jump to the VM's chains from anywhere else.
    fn scan_vm_references(&self, vm_name: &VmName) -> Vec<String> {
        let mut failures = Vec::new();
        let default_chain = vm_name.default_chain();
        let filter_owned = [vm_name.chain(), default_chain.as_str()];

        let ipt = self.iptables();
        match ipt.save(Some(FILTER)) {
            Ok(lines) => {
                for line in lines {
                    if !mentions(&line, "--physdev-is-bridged")
                        || !filter_owned.iter().any(|chain| mentions(&line, chain))
                    {
                        continue;
                    }
                    let Some((chain, spec)) = saved_rule(&line) else {
                        continue;
                    };
                    if filter_owned.contains(&chain.as_str()) {
                        continue;
                    }
                    if let Err(e) = ipt.delete_rule(FILTER, &chain, &spec) {
                        failures.push(format!("{}: {}", line, e));
                    }
                }
            }
            Err(e) => failures.push(format!("iptables-save: {}", e)),
        }

        let in_chain = vm_name.ebtables_in_chain();
        let out_chain = vm_name.ebtables_out_chain();
        let bridge_owned = [in_chain.as_str(), out_chain.as_str()];

        let ebt = self.ebtables();
        match ebt.save(NAT) {
            Ok(lines) => {
                for line in lines {
                    if !bridge_owned.iter().any(|chain| mentions(&line, chain)) {
                        continue;
                    }
                    let Some((chain, spec)) = saved_rule(&line) else {
                        continue;
                    };
                    if bridge_owned.contains(&chain.as_str()) {
                        continue;
                    }
                    if let Err(e) = ebt.delete_rule(NAT, &chain, &spec) {
                        failures.push(format!("{}: {}", line, e));
                    }
                }
            }
            Err(e) => failures.push(format!("ebtables --Lx: {}", e)),
        }

        failures
    }

    fn remove_nat_rules(&self, vif: &str, report: &mut TeardownReport) {
        let ipt = self.iptables();
        let lines = match ipt.save(Some(NAT)) {
            Ok(lines) => lines,
            Err(e) => {
                report.failures.push(format!("iptables-save -t nat: {}", e));
                return;
            }
        };

        for line in lines.iter().filter(|line| mentions(line, vif)) {
            if let Some((chain, spec)) = saved_rule(line) {
                report.step(format!("nat {}", line), ipt.delete_rule(NAT, &chain, &spec));
            }
        }
    }

    /// Tears down isolation chains whose VM is no longer running. Fails only
    /// when the chain listing or the hypervisor cannot be read.
    pub fn cleanup_orphan_chains(&self) -> Result<CleanupReport> {
        let chains: Vec<String> = self
            .iptables()
            .list_chains(FILTER)?
            .into_iter()
            .filter(|chain| VmName::is_isolation_chain(chain))
            .collect();
        let running = self.hypervisor.running_vms()?;

        let mut report = CleanupReport {
            scanned: chains.len(),
            ..CleanupReport::default()
        };
        for chain in chains {
            if running.contains(&chain) {
                continue;
            }
            let vm_name = match VmName::new(chain.as_str()) {
                Ok(name) => name,
                Err(e) => {
                    warn!(chain = %chain, error = %e, "skipping chain with unusable name");
                    continue;
                }
            };
            info!(vm = %vm_name, "removing orphaned isolation chain");
            report.removed.push(self.delete_all_rules_for_vm(&vm_name, None));
        }

        if !report.removed.is_empty() {
            let removed = report.removed.len() as u64;
            self.count(|c| c.orphans_removed += removed);
        }
        Ok(report)
    }
}

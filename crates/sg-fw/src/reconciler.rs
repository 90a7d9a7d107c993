use crate::ebtables::Ebtables;
use crate::iptables::{Iptables, saved_rule};
use crate::specs::{self, BridgeChains, FILTER, NAT, POSTROUTING, PREROUTING};
use sg_core::{
    AgentConfig, AppliedRule, CommandRunner, FilterKind, FirewallError, Hypervisor,
    OperationCounters, RecordDiff, Result, RuleLedger, RuleLogRecord, RuleLogStore, RuleSet,
    ToolPaths, VmNetwork,
};
use tracing::{debug, error, info, warn};

/// Result of [`SecurityGroupManager::apply_rules`].
#[derive(Debug)]
pub enum ApplyOutcome {
    /// Stored record matched; the firewall was not touched.
    Unchanged,
    Applied {
        /// Record fields that differed from the stored record.
        changed_fields: Vec<&'static str>,
        defaults_reapplied: bool,
        /// ACCEPT rules placed in the VM chain.
        rules_programmed: usize,
        /// Entries of the rule string that could not be parsed.
        rejected: Vec<FirewallError>,
    },
}

impl ApplyOutcome {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, ApplyOutcome::Unchanged)
    }
}

/// Per-host reconciler for VM isolation chains.
///
/// All operations run their external commands synchronously and in order.
/// Callers serialize work per VM and per bridge.
pub struct SecurityGroupManager<R, H> {
    pub(crate) runner: R,
    pub(crate) hypervisor: H,
    pub(crate) store: RuleLogStore,
    pub(crate) tools: ToolPaths,
    pub(crate) bridge_sysctls: Vec<String>,
}

impl<R: CommandRunner, H: Hypervisor> SecurityGroupManager<R, H> {
    pub fn new(runner: R, hypervisor: H, config: &AgentConfig) -> Self {
        Self {
            runner,
            hypervisor,
            store: RuleLogStore::new(&config.run_dir),
            tools: config.tools.clone(),
            bridge_sysctls: config.bridge_sysctls.clone(),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    pub fn store(&self) -> &RuleLogStore {
        &self.store
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    pub fn bridge_sysctls(&self) -> &[String] {
        &self.bridge_sysctls
    }

    pub fn iptables(&self) -> Iptables<'_> {
        Iptables::new(&self.runner, &self.tools)
    }

    pub fn ebtables(&self) -> Ebtables<'_> {
        Ebtables::new(&self.runner, &self.tools)
    }

    /// Builds the VM's isolation chains and wires them into the bridge hook.
    ///
    /// Bridge-filter programming and the initial record are best-effort;
    /// everything before them is fatal.
    pub fn apply_default_rules(&self, net: &VmNetwork) -> Result<()> {
        let vm = &net.vm_name;
        self.ensure_bridge_firewall(&net.bridge_name)?;

        for failure in self.reset_vm_references(vm) {
            debug!(vm = %vm, "reset: {}", failure);
        }

        let mut ledger = RuleLedger::authoritative(vm.clone());
        if let Err(e) = self.program_default_chains(net, &mut ledger) {
            error!(vm = %vm, error = %e, "failed to program default rules");
            return Err(e);
        }

        if let Err(e) = self.program_ebtables(net, &mut ledger) {
            warn!(vm = %vm, error = %e, "failed to program bridge-filter defaults");
        }

        if net.vm_ip.is_some() {
            let initial = self
                .hypervisor
                .dom_id(vm)
                .map(|dom_id| RuleLogRecord::initial(vm.clone(), net.vm_id, net.vm_ip, dom_id))
                .and_then(|record| self.store.write(&record));
            if let Err(e) = initial {
                warn!(vm = %vm, error = %e, "failed to persist initial rule log record");
            }
        }

        info!(vm = %vm, vif = %net.vif, bridge = %net.bridge_name, "default rules in place");
        Ok(())
    }

    fn program_default_chains(&self, net: &VmNetwork, ledger: &mut RuleLedger) -> Result<()> {
        let ipt = self.iptables();
        let vm_chain = net.vm_name.chain();
        let default_chain = net.vm_name.default_chain();

        ipt.reset_chain(FILTER, vm_chain)?;
        ipt.reset_chain(FILTER, &default_chain)?;

        let bridge = BridgeChains::new(&net.bridge_name);
        let jumps = [
            (&bridge.outbound, bridge.outbound_jump(&net.vif, &default_chain)),
            (&bridge.inbound, bridge.inbound_jump(&net.vif, &default_chain)),
        ];
        for (chain, spec) in jumps {
            self.place(ledger, FilterKind::Iptables, FILTER, chain, spec)?;
        }

        for spec in specs::default_chain_rules(net) {
            ipt.append(FILTER, &default_chain, &spec)?;
        }
        ipt.append(FILTER, vm_chain, &specs::drop_all())
    }

    /// MAC and ARP anti-spoofing for the VM's port. Partial chains are left
    /// behind on failure; teardown removes them.
    ///
    /// A ledger started here only covers the bridge-filter hooks, so teardown
    /// still scans for iptables jumps placed before it existed.
    pub fn apply_default_ebtables_rules(&self, net: &VmNetwork) -> Result<()> {
        let mut ledger = match self.store.load_ledger(&net.vm_name) {
            Ok(Some(ledger)) => ledger,
            Ok(None) => RuleLedger::new(net.vm_name.clone()),
            Err(e) => {
                warn!(vm = %net.vm_name, error = %e, "discarding unreadable rule ledger");
                RuleLedger::new(net.vm_name.clone())
            }
        };
        self.program_ebtables(net, &mut ledger)
    }

    fn program_ebtables(&self, net: &VmNetwork, ledger: &mut RuleLedger) -> Result<()> {
        let ebt = self.ebtables();
        let vm = &net.vm_name;
        let in_chain = vm.ebtables_in_chain();
        let out_chain = vm.ebtables_out_chain();
        let ip = specs::vm_ipv4(net);

        ebt.reset_chain(NAT, &in_chain)?;
        ebt.reset_chain(NAT, &out_chain)?;

        let live = ebt.save(NAT)?;
        let hooks = [
            (PREROUTING, specs::prerouting_jump(&net.vif, &in_chain)),
            (POSTROUTING, specs::postrouting_jump(&net.vif, &out_chain)),
        ];
        for (chain, spec) in hooks {
            let present = live
                .iter()
                .filter_map(|line| saved_rule(line))
                .any(|(c, s)| c == chain && s == spec);
            if present {
                ebt.delete_rule(NAT, chain, &spec)?;
            }
            self.place(ledger, FilterKind::Ebtables, NAT, chain, spec)?;
        }

        for spec in specs::ebtables_in_rules(&net.vm_mac, ip) {
            ebt.append(NAT, &in_chain, &spec)?;
        }
        for spec in specs::ebtables_out_rules(&net.vm_mac, ip) {
            ebt.append(NAT, &out_chain, &spec)?;
        }

        debug!(vm = %vm, mac = %net.vm_mac, "bridge-filter anti-spoofing in place");
        Ok(())
    }

    /// Bumps the persisted operation counters. Counting never fails an
    /// operation.
    pub(crate) fn count(&self, bump: impl FnOnce(&mut OperationCounters)) {
        if let Err(e) = self.store.update_counters(bump) {
            warn!(error = %e, "failed to update operation counters");
        }
    }

    /// Appends a rule to a chain the VM does not own and records it in the
    /// VM's ledger.
    fn place(
        &self,
        ledger: &mut RuleLedger,
        kind: FilterKind,
        table: &str,
        chain: &str,
        spec: Vec<String>,
    ) -> Result<()> {
        match kind {
            FilterKind::Iptables => self.iptables().append(table, chain, &spec)?,
            FilterKind::Ebtables => self.ebtables().append(table, chain, &spec)?,
        }
        ledger.record(AppliedRule {
            kind,
            table: table.to_string(),
            chain: chain.to_string(),
            spec,
        });
        if let Err(e) = self.store.save_ledger(ledger) {
            warn!(vm = %ledger.vm_name, error = %e, "failed to persist rule ledger");
        }
        Ok(())
    }

    /// Reconciles the VM chain with `rules`, skipping all work when the
    /// stored record already matches.
    pub fn apply_rules(
        &self,
        net: &VmNetwork,
        signature: &str,
        seqno: i64,
        rules: &str,
    ) -> Result<ApplyOutcome> {
        let result = self.reconcile(net, signature, seqno, rules);
        self.count(|c| match &result {
            Ok(ApplyOutcome::Unchanged) => c.reconcile_unchanged += 1,
            Ok(ApplyOutcome::Applied { .. }) => c.reconcile_applied += 1,
            Err(_) => c.reconcile_failed += 1,
        });
        result
    }

    fn reconcile(
        &self,
        net: &VmNetwork,
        signature: &str,
        seqno: i64,
        rules: &str,
    ) -> Result<ApplyOutcome> {
        let vm = &net.vm_name;
        let dom_id = self.hypervisor.dom_id(vm)?;
        let desired = RuleLogRecord {
            vm_name: vm.clone(),
            vm_id: net.vm_id,
            vm_ip: net.vm_ip,
            dom_id,
            signature: signature.to_string(),
            seqno,
        };
        // Catch an unstorable record before touching the firewall.
        desired.to_line()?;

        let stored = self.store.load_or_absent(vm);
        let diff = RecordDiff::between(stored.as_ref(), &desired);
        if !diff.any() {
            debug!(vm = %vm, signature, seqno, "rules unchanged");
            return Ok(ApplyOutcome::Unchanged);
        }

        let defaults_reapplied = diff.identity_changed();
        if defaults_reapplied {
            self.apply_default_rules(net)?;
        }

        let set = RuleSet::parse(rules);
        for rejected in &set.rejected {
            warn!(vm = %vm, error = %rejected, "skipping rule entry");
        }

        let ipt = self.iptables();
        let rules_programmed = match self.program_vm_chain(&ipt, vm.chain(), &set) {
            Ok(count) => count,
            Err(e) => {
                error!(vm = %vm, error = %e, "failed to program rules");
                // Fail closed, and make the next call reprogram from scratch.
                if let Err(e) = ipt.append(FILTER, vm.chain(), &specs::drop_all()) {
                    warn!(vm = %vm, error = %e, "failed to restore default deny");
                }
                if let Err(e) = self.store.remove(vm) {
                    warn!(vm = %vm, error = %e, "failed to invalidate rule log record");
                }
                return Err(e);
            }
        };

        self.store.write(&desired)?;
        info!(
            vm = %vm,
            signature,
            seqno,
            rules = rules_programmed,
            changed = ?diff.changed_fields(),
            "applied rules"
        );

        Ok(ApplyOutcome::Applied {
            changed_fields: diff.changed_fields(),
            defaults_reapplied,
            rules_programmed,
            rejected: set.rejected,
        })
    }

    /// Flushes the VM chain, inserts the ACCEPT rules and closes it with
    /// DROP. Returns the number of ACCEPT rules.
    fn program_vm_chain(&self, ipt: &Iptables<'_>, vm_chain: &str, set: &RuleSet) -> Result<usize> {
        ipt.reset_chain(FILTER, vm_chain)?;

        let mut count = 0;
        for intent in &set.rules {
            for spec in specs::ingress_rules(intent) {
                ipt.insert(FILTER, vm_chain, &spec)?;
                count += 1;
            }
        }
        ipt.append(FILTER, vm_chain, &specs::drop_all())?;

        Ok(count)
    }
}

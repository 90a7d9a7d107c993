use crate::vm::VmName;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Iptables,
    Ebtables,
}

impl FilterKind {
    pub fn program(&self) -> &'static str {
        match self {
            FilterKind::Iptables => "iptables",
            FilterKind::Ebtables => "ebtables",
        }
    }
}

/// A rule the reconciler placed into a chain the VM does not own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppliedRule {
    pub kind: FilterKind,
    pub table: String,
    pub chain: String,
    pub spec: Vec<String>,
}

impl AppliedRule {
    pub fn render(&self) -> String {
        format!(
            "{} -t {} -A {} {}",
            self.kind.program(),
            self.table,
            self.chain,
            self.spec.join(" ")
        )
    }
}

/// Everything the reconciler must undo for one VM beyond deleting its own
/// chains. Entries are removed in reverse insertion order on teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleLedger {
    pub vm_name: VmName,
    /// Set when a full default-rules pass started this ledger. Anything else
    /// may have been placed before the ledger existed, so teardown also
    /// scans the live rules.
    #[serde(default)]
    pub authoritative: bool,
    #[serde(default)]
    pub rules: Vec<AppliedRule>,
}

impl RuleLedger {
    pub fn new(vm_name: VmName) -> Self {
        Self {
            vm_name,
            authoritative: false,
            rules: Vec::new(),
        }
    }

    pub fn authoritative(vm_name: VmName) -> Self {
        Self {
            authoritative: true,
            ..Self::new(vm_name)
        }
    }

    pub fn record(&mut self, rule: AppliedRule) {
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
    }

    pub fn forget(&mut self, rule: &AppliedRule) {
        self.rules.retain(|r| r != rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Rules in the order they must be removed.
    pub fn removal_order(&self) -> impl Iterator<Item = &AppliedRule> {
        self.rules.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jump(chain: &str, target: &str) -> AppliedRule {
        AppliedRule {
            kind: FilterKind::Iptables,
            table: "filter".into(),
            chain: chain.into(),
            spec: vec!["-j".into(), target.into()],
        }
    }

    #[test]
    fn records_once_and_removes_in_reverse() {
        let mut ledger = RuleLedger::new(VmName::new("i-2-10-VM").unwrap());
        ledger.record(jump("BF-cloudbr0-OUT", "i-2-10-def"));
        ledger.record(jump("BF-cloudbr0-IN", "i-2-10-def"));
        ledger.record(jump("BF-cloudbr0-OUT", "i-2-10-def"));

        assert_eq!(ledger.len(), 2);
        let order: Vec<_> = ledger.removal_order().map(|r| r.chain.as_str()).collect();
        assert_eq!(order, vec!["BF-cloudbr0-IN", "BF-cloudbr0-OUT"]);

        ledger.forget(&jump("BF-cloudbr0-IN", "i-2-10-def"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn serializes_as_json() {
        let mut ledger = RuleLedger::new(VmName::new("i-2-10-VM").unwrap());
        ledger.record(jump("BF-cloudbr0-OUT", "i-2-10-def"));

        let json = serde_json::to_string(&ledger).unwrap();
        assert!(json.contains("\"kind\":\"iptables\""));
        let back: RuleLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ledger);
        assert_eq!(
            back.rules[0].render(),
            "iptables -t filter -A BF-cloudbr0-OUT -j i-2-10-def"
        );
    }

    #[test]
    fn ledgers_without_the_flag_are_not_trusted() {
        let json = r#"{"vm_name":"i-2-10-VM","rules":[]}"#;
        let ledger: RuleLedger = serde_json::from_str(json).unwrap();
        assert!(!ledger.authoritative);

        let full = RuleLedger::authoritative(VmName::new("i-2-10-VM").unwrap());
        let back: RuleLedger = serde_json::from_str(&serde_json::to_string(&full).unwrap()).unwrap();
        assert!(back.authoritative);
    }
}

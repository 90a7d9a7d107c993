use crate::reconciler::SecurityGroupManager;
use crate::specs::{self, FILTER};
use regex::Regex;
use sg_core::{CommandRunner, Hypervisor, Result, RuleSet, VmName};
use similar::{ChangeTag, TextDiff};
use std::sync::LazyLock;

static SINGLE_PORT_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--dport (\d+):(\d+)\b").expect("valid regex"));

/// Desired versus live contents of a VM chain, in `iptables -S` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDiff {
    pub chain: String,
    pub chain_exists: bool,
    pub desired: Vec<String>,
    pub live: Vec<String>,
}

impl ChainDiff {
    pub fn matches(&self) -> bool {
        self.chain_exists && self.desired == self.live
    }

    /// Line diff with `+` for rules the next apply would add and `-` for
    /// rules it would remove.
    pub fn render(&self) -> String {
        let live = join_lines(&self.live);
        let desired = join_lines(&self.desired);
        let diff = TextDiff::from_lines(&live, &desired);

        let mut output = String::new();
        for change in diff.iter_all_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => '-',
                ChangeTag::Insert => '+',
                ChangeTag::Equal => ' ',
            };
            output.push(sign);
            output.push_str(change.value());
        }
        output
    }
}

fn join_lines(lines: &[String]) -> String {
    lines.iter().map(|l| format!("{}\n", l)).collect()
}

/// iptables prints a single-port range as one number.
fn normalize(line: &str) -> String {
    SINGLE_PORT_RANGE
        .replace_all(line, |caps: &regex::Captures| {
            if caps[1] == caps[2] {
                format!("--dport {}", &caps[1])
            } else {
                format!("--dport {}:{}", &caps[1], &caps[2])
            }
        })
        .into_owned()
}

/// Chain contents `apply_rules` would leave behind. Rules are inserted at
/// the head one by one, so the chain lists them in reverse.
pub fn desired_vm_chain(vm_name: &VmName, set: &RuleSet) -> Vec<String> {
    let chain = vm_name.chain();
    let mut lines: Vec<String> = set
        .rules
        .iter()
        .flat_map(specs::ingress_rules)
        .map(|spec| normalize(&format!("-A {} {}", chain, spec.join(" "))))
        .collect();
    lines.reverse();
    lines.push(format!("-A {} {}", chain, specs::drop_all().join(" ")));
    lines
}

impl<R: CommandRunner, H: Hypervisor> SecurityGroupManager<R, H> {
    pub fn diff_vm_chain(&self, vm_name: &VmName, rules: &str) -> Result<ChainDiff> {
        let ipt = self.iptables();
        let chain = vm_name.chain();
        let chain_exists = ipt.chain_exists(FILTER, chain)?;
        let live = if chain_exists {
            ipt.list_rules(FILTER, chain)?
                .iter()
                .map(|line| normalize(line))
                .collect()
        } else {
            Vec::new()
        };

        Ok(ChainDiff {
            chain: chain.to_string(),
            chain_exists,
            desired: desired_vm_chain(vm_name, &RuleSet::parse(rules)),
            live,
        })
    }
}

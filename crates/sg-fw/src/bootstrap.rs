use crate::iptables::Iptables;
use crate::reconciler::SecurityGroupManager;
use crate::specs::{self, BridgeChains, FILTER, FORWARD, RuleSpec};
use sg_core::exec::args;
use sg_core::{CommandRunner, Hypervisor, Result};
use tracing::{debug, error, info, warn};

const VIRTUAL_PORT_PREFIXES: &[&str] = &["vif", "vnet", "tap"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    /// The FORWARD hook block was installed by this call. Without an uplink
    /// the physdev-out ACCEPT was left out of `BF-<bridge>`.
    Installed { uplink: Option<String> },
    /// `BF-<bridge>` was already referenced; nothing was inserted.
    AlreadyInstalled,
}

impl<R: CommandRunner, H: Hypervisor> SecurityGroupManager<R, H> {
    /// Prepares a bridge for per-VM filtering. Safe to call for every VM
    /// attached to the bridge; the FORWARD hooks go in only while nothing
    /// references `BF-<bridge>`.
    pub fn ensure_bridge_firewall(&self, bridge: &str) -> Result<BridgeStatus> {
        for key in &self.bridge_sysctls {
            let setting = format!("{}=1", key);
            if let Err(e) = self
                .runner
                .run_checked(&self.tools.sysctl, &args(["-w", &setting]))
            {
                error!(bridge, key = %key, error = %e, "failed to enable bridge netfilter");
                return Err(e);
            }
        }

        let chains = BridgeChains::new(bridge);
        let ipt = self.iptables();
        for chain in [&chains.main, &chains.inbound, &chains.outbound] {
            ipt.ensure_chain(FILTER, chain)?;
        }

        let references = ipt.references(FILTER, &chains.main)?;
        if references > 0 {
            debug!(bridge, references, "bridge firewall hook already in place");
            return Ok(BridgeStatus::AlreadyInstalled);
        }

        let uplink = self.bridge_uplink(bridge);
        if uplink.is_none() {
            warn!(
                bridge,
                "no uplink port found, omitting `-A {} {}`",
                chains.main,
                specs::uplink_accept("<uplink>").join(" ")
            );
        }
        let mut inserted = Vec::new();
        match install_hook(&ipt, &chains, uplink.as_deref(), &mut inserted) {
            Ok(()) => {
                info!(bridge, uplink = ?uplink, "installed bridge firewall hook");
                Ok(BridgeStatus::Installed { uplink })
            }
            Err(e) => {
                error!(bridge, error = %e, "failed to install bridge firewall hook");
                for spec in inserted.iter().rev() {
                    if let Err(e) = ipt.delete_rule(FILTER, FORWARD, spec) {
                        warn!(bridge, error = %e, "failed to roll back FORWARD rule");
                    }
                }
                if let Err(e) = ipt.flush(FILTER, &chains.main) {
                    warn!(bridge, error = %e, "failed to flush {}", chains.main);
                }
                Err(e)
            }
        }
    }

    /// First non-virtual port of the bridge, per `brctl show`.
    fn bridge_uplink(&self, bridge: &str) -> Option<String> {
        match self.runner.run_checked(&self.tools.brctl, &args(["show", bridge])) {
            Ok(output) => {
                parse_uplink(&output.stdout)
            }
            Err(e) => {
                warn!(bridge, error = %e, "could not list bridge ports");
                None
            }
        }
    }
}

fn install_hook(
    ipt: &Iptables<'_>,
    chains: &BridgeChains,
    uplink: Option<&str>,
    inserted: &mut Vec<RuleSpec>,
) -> Result<()> {
    for spec in chains.forward_rules() {
        ipt.insert(FILTER, FORWARD, &spec)?;
        inserted.push(spec);
    }
    for spec in chains.main_rules(uplink) {
        ipt.append(FILTER, &chains.main, &spec)?;
    }
    Ok(())
}

/// Interface list of a single-bridge `brctl show` table: the fourth column
/// of the bridge row, then one name per continuation row.
fn parse_uplink(output: &str) -> Option<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.len() {
                4 => Some(fields[3]),
                1 => Some(fields[0]),
                _ => None,
            }
        })
        .find(|iface| !VIRTUAL_PORT_PREFIXES.iter().any(|p| iface.starts_with(p)))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, FakeHypervisor};
    use sg_core::{AgentConfig, FilterKind};

    fn manager(host: FakeHost) -> (tempfile::TempDir, SecurityGroupManager<FakeHost, FakeHypervisor>) {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            run_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let sg = SecurityGroupManager::new(host, FakeHypervisor::new(), &config);
        (dir, sg)
    }

    #[test]
    fn uplink_skips_guest_ports() {
        let out = "bridge name\tbridge id\t\tSTP enabled\tinterfaces\n\
                   cloudbr0\t\t8000.001e4f1a2b3c\tno\t\tvif3.0\n\
                   \t\t\t\t\t\t\tvnet0\n\
                   \t\t\t\t\t\t\tbond0\n";
        assert_eq!(parse_uplink(out).as_deref(), Some("bond0"));
        assert_eq!(
            parse_uplink("bridge name\tbridge id\t\tSTP enabled\tinterfaces\ncloudbr0\t\t8000.0\tno\n"),
            None
        );
    }

    #[test]
    fn bootstrap_applies_forward_block_once() {
        let (_dir, sg) = manager(FakeHost::new().with_bridge("cloudbr0", &["eth0", "vif3.0"]));

        assert_eq!(
            sg.ensure_bridge_firewall("cloudbr0").unwrap(),
            BridgeStatus::Installed {
                uplink: Some("eth0".into())
            }
        );
        assert_eq!(
            sg.ensure_bridge_firewall("cloudbr0").unwrap(),
            BridgeStatus::AlreadyInstalled
        );

        let forward = sg.runner().rules(FilterKind::Iptables, "filter", "FORWARD").unwrap();
        assert_eq!(forward.len(), 4);
        assert_eq!(forward.iter().filter(|r| r.ends_with("-j DROP")).count(), 2);
        assert_eq!(
            forward.iter().filter(|r| r.ends_with("-j BF-cloudbr0")).count(),
            2
        );
        assert!(forward[0].ends_with("-j BF-cloudbr0"), "jumps precede drops");

        let main = sg.runner().rules(FilterKind::Iptables, "filter", "BF-cloudbr0").unwrap();
        assert_eq!(main.len(), 4);
        assert_eq!(
            main[0],
            "-m physdev --physdev-is-bridged --physdev-out eth0 -j ACCEPT"
        );

        for key in &AgentConfig::default().bridge_sysctls {
            assert_eq!(sg.runner().sysctl(key).as_deref(), Some("1"));
        }
    }

    #[test]
    fn sysctl_failure_is_fatal() {
        let host = FakeHost::new().with_bridge("cloudbr0", &["eth0"]);
        host.fail_matching("sysctl", "bridge-nf-call-iptables");
        let (_dir, sg) = manager(host);

        let err = sg.ensure_bridge_firewall("cloudbr0").unwrap_err();
        assert!(err.is_command_failure());
        assert!(err.to_string().contains("bridge-nf-call-iptables=1"));
        assert!(!sg.runner().has_chain(FilterKind::Iptables, "filter", "BF-cloudbr0"));
        assert!(
            sg.runner()
                .invocations()
                .iter()
                .all(|i| i.program != "iptables"),
            "nothing is programmed after a failed sysctl"
        );
    }

    #[test]
    fn failed_install_is_rolled_back() {
        let host = FakeHost::new().with_bridge("cloudbr0", &["eth0"]);
        host.fail_matching("iptables", "--physdev-is-in");
        let (_dir, sg) = manager(host);

        assert!(sg.ensure_bridge_firewall("cloudbr0").is_err());
        assert!(
            sg.runner()
                .rules(FilterKind::Iptables, "filter", "FORWARD")
                .unwrap()
                .is_empty()
        );
        assert!(
            sg.runner()
                .rules(FilterKind::Iptables, "filter", "BF-cloudbr0")
                .unwrap()
                .is_empty()
        );

        sg.runner().clear_failures();
        assert!(matches!(
            sg.ensure_bridge_firewall("cloudbr0").unwrap(),
            BridgeStatus::Installed { .. }
        ));
    }

    #[test]
    fn bridge_without_uplink_reports_missing_accept() {
        let (_dir, sg) = manager(FakeHost::new().with_bridge("cloudbr0", &["vif3.0"]));

        assert_eq!(
            sg.ensure_bridge_firewall("cloudbr0").unwrap(),
            BridgeStatus::Installed { uplink: None }
        );
        let main = sg.runner().rules(FilterKind::Iptables, "filter", "BF-cloudbr0").unwrap();
        assert_eq!(main.len(), 3);
        assert!(main.iter().all(|r| !r.contains("--physdev-out")));
    }
}

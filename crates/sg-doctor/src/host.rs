use crate::diagnostics::{DiagnosticLevel, DiagnosticResult};
use sg_core::exec::args;
use sg_core::{CommandRunner, Hypervisor};
use sg_fw::SecurityGroupManager;
use sg_fw::specs::{BridgeChains, FILTER};

/// Host prerequisites: tools, bridge-nf switches and bridge hooks.
pub struct HostDiagnostics<'a, R, H> {
    sg: &'a SecurityGroupManager<R, H>,
}

impl<'a, R: CommandRunner, H: Hypervisor> HostDiagnostics<'a, R, H> {
    pub fn new(sg: &'a SecurityGroupManager<R, H>) -> Self {
        Self { sg }
    }

    pub fn diagnose(&self, bridges: &[String]) -> Vec<DiagnosticResult> {
        let mut results = self.check_tools();
        results.extend(self.check_sysctls());
        for bridge in bridges {
            results.push(self.check_bridge_hook(bridge));
        }
        results
    }

    fn check_tools(&self) -> Vec<DiagnosticResult> {
        let tools = self.sg.tools();
        let required = [
            (&tools.iptables, "iptables", DiagnosticLevel::Critical),
            (&tools.iptables_save, "iptables", DiagnosticLevel::Critical),
            (&tools.ebtables, "ebtables", DiagnosticLevel::Critical),
            (&tools.sysctl, "procps", DiagnosticLevel::Critical),
            (&tools.virsh, "libvirt-clients", DiagnosticLevel::Error),
            (&tools.brctl, "bridge-utils", DiagnosticLevel::Warning),
        ];

        required
            .into_iter()
            .map(|(program, package, level)| {
                let available = self
                    .sg
                    .runner()
                    .run(program, &args(["--version"]))
                    .map(|o| o.success())
                    .unwrap_or(false);

                if available {
                    DiagnosticResult::new(
                        DiagnosticLevel::Info,
                        format!("{} available", program),
                        format!("'{} --version' succeeded", program),
                    )
                } else {
                    DiagnosticResult::new(
                        level,
                        format!("{} not found", program),
                        format!("The '{}' command is not runnable on this host", program),
                    )
                    .with_suggestion(format!("Install the {} package or fix tools in agent.yaml", package))
                }
            })
            .collect()
    }

    fn check_sysctls(&self) -> Vec<DiagnosticResult> {
        let program = &self.sg.tools().sysctl;
        let mut results = Vec::new();

        for key in self.sg.bridge_sysctls() {
            match self.sg.runner().run_checked(program, &args(["-n", key.as_str()])) {
                Ok(output) if output.stdout.trim() == "1" => {
                    results.push(DiagnosticResult::new(
                        DiagnosticLevel::Info,
                        format!("{} enabled", key),
                        "Bridged frames traverse the packet filter",
                    ));
                }
                Ok(output) => {
                    results.push(
                        DiagnosticResult::new(
                            DiagnosticLevel::Error,
                            format!("{} disabled", key),
                            format!(
                                "Value is {}; bridged traffic bypasses VM chains",
                                output.stdout.trim()
                            ),
                        )
                        .with_command(format!("sudo sysctl -w {}=1", key)),
                    );
                }
                Err(e) => {
                    results.push(
                        DiagnosticResult::new(
                            DiagnosticLevel::Warning,
                            format!("Cannot read {}", key),
                            e.to_string(),
                        )
                        .with_suggestion("br_netfilter module may not be loaded")
                        .with_command("sudo modprobe br_netfilter"),
                    );
                }
            }
        }

        results
    }

    fn check_bridge_hook(&self, bridge: &str) -> DiagnosticResult {
        let chains = BridgeChains::new(bridge);
        let fix = format!("sgwarden bridge ensure --bridge {}", bridge);

        match self.sg.iptables().references(FILTER, &chains.main) {
            Ok(0) => DiagnosticResult::new(
                DiagnosticLevel::Error,
                format!("Bridge {} not hooked", bridge),
                format!("{} exists but FORWARD does not jump to it", chains.main),
            )
            .with_command(fix),
            Ok(references) => DiagnosticResult::new(
                DiagnosticLevel::Info,
                format!("Bridge {} hooked", bridge),
                format!("{} has {} reference(s)", chains.main, references),
            ),
            Err(e) => DiagnosticResult::new(
                DiagnosticLevel::Error,
                format!("Bridge {} has no firewall chains", bridge),
                e.to_string(),
            )
            .with_command(fix),
        }
    }
}

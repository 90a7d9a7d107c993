pub mod chains;
pub mod diagnostics;
pub mod host;

pub use chains::ChainDiagnostics;
pub use diagnostics::{DiagnosticLevel, DiagnosticReport, DiagnosticResult};
pub use host::HostDiagnostics;

use sg_core::{CommandRunner, Hypervisor};
use sg_fw::SecurityGroupManager;

/// Main diagnostics interface
pub struct Doctor<'a, R, H> {
    host: HostDiagnostics<'a, R, H>,
    chains: ChainDiagnostics<'a, R, H>,
    bridges: Vec<String>,
}

impl<'a, R: CommandRunner, H: Hypervisor> Doctor<'a, R, H> {
    /// `bridges` are checked for an installed FORWARD hook; the other
    /// checks cover every VM on the host.
    pub fn new(sg: &'a SecurityGroupManager<R, H>, bridges: Vec<String>) -> Self {
        Self {
            host: HostDiagnostics::new(sg),
            chains: ChainDiagnostics::new(sg),
            bridges,
        }
    }

    /// Run all diagnostics and generate comprehensive report
    pub fn run_all(&self) -> DiagnosticReport {
        let mut report = DiagnosticReport::new();
        report.add_section("Host Prerequisites", self.check_host());
        report.add_section("VM Isolation Chains", self.check_chains());
        report
    }

    pub fn check_host(&self) -> Vec<DiagnosticResult> {
        self.host.diagnose(&self.bridges)
    }

    pub fn check_chains(&self) -> Vec<DiagnosticResult> {
        self.chains.diagnose()
    }
}

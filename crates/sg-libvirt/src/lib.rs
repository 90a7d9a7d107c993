use sg_core::exec::args;
use sg_core::{CommandRunner, FirewallError, Hypervisor, Result, VmName};
use tracing::debug;

/// Domain state as reported by `virsh list --all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub id: Option<u32>,
    pub name: String,
    pub state: String,
}

/// [`Hypervisor`] backed by the `virsh` command line.
pub struct VirshHypervisor<R> {
    runner: R,
    program: String,
    uri: Option<String>,
}

impl<R: CommandRunner> VirshHypervisor<R> {
    pub fn new(runner: R, program: impl Into<String>, uri: Option<String>) -> Self {
        Self {
            runner,
            program: program.into(),
            uri,
        }
    }

    fn virsh(&self, rest: &[&str]) -> Result<String> {
        let mut argv = Vec::new();
        if let Some(uri) = &self.uri {
            argv.extend(args(["-c", uri.as_str()]));
        }
        argv.extend(args(rest.iter().copied()));
        Ok(self.runner.run_checked(&self.program, &argv)?.stdout)
    }

    /// Every defined domain, running or not.
    pub fn list_domains(&self) -> Result<Vec<DomainInfo>> {
        let stdout = self.virsh(&["list", "--all"])?;
        Ok(parse_domain_list(&stdout))
    }
}

impl<R: CommandRunner> Hypervisor for VirshHypervisor<R> {
    fn dom_id(&self, vm_name: &VmName) -> Result<u32> {
        let stdout = self
            .virsh(&["domid", vm_name.as_str()])
            .map_err(|e| FirewallError::Hypervisor {
                vm_name: vm_name.to_string(),
                message: e.to_string(),
            })?;

        let id = stdout.trim();
        id.parse().map_err(|_| FirewallError::Hypervisor {
            vm_name: vm_name.to_string(),
            message: format!("domain is not running (domid '{}')", id),
        })
    }

    fn running_vms(&self) -> Result<Vec<String>> {
        let stdout = self.virsh(&["list", "--name"])?;
        let names: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(count = names.len(), "listed running domains");
        Ok(names)
    }
}

fn parse_domain_list(stdout: &str) -> Vec<DomainInfo> {
    stdout
        .lines()
        .skip(2)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return None;
            }
            Some(DomainInfo {
                id: parts[0].parse().ok(),
                name: parts[1].to_string(),
                state: parts[2..].join(" "),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_core::CommandOutput;
    use std::sync::Mutex;

    /// Replies with canned output per subcommand and records arguments.
    #[derive(Default)]
    struct Virsh {
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl CommandRunner for Virsh {
        fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            let sub: Vec<&str> = args
                .iter()
                .map(String::as_str)
                .skip_while(|a| *a == "-c" || a.contains("://"))
                .collect();
            Ok(match sub.as_slice() {
                ["domid", "i-2-10-VM"] => CommandOutput::ok("7\n\n"),
                ["domid", "i-2-11-VM"] => CommandOutput::ok("-\n"),
                ["domid", _] => CommandOutput::failed(1, "error: failed to get domain\n"),
                ["list", "--name"] => CommandOutput::ok("i-2-10-VM\nr-4-VM\n\n"),
                ["list", "--all"] => CommandOutput::ok(
                    " Id   Name        State\n\
                     ----------------------------\n \
                     7    i-2-10-VM   running\n \
                     -    i-2-11-VM   shut off\n",
                ),
                _ => CommandOutput::failed(1, "unexpected"),
            })
        }
    }

    #[test]
    fn dom_id_parses_running_domain() {
        let hv = VirshHypervisor::new(Virsh::default(), "virsh", None);
        assert_eq!(hv.dom_id(&"i-2-10-VM".parse().unwrap()).unwrap(), 7);

        for stopped in ["i-2-11-VM", "i-9-99-VM"] {
            assert!(matches!(
                hv.dom_id(&stopped.parse().unwrap()),
                Err(FirewallError::Hypervisor { .. })
            ));
        }
    }

    #[test]
    fn running_vms_and_uri() {
        let hv = VirshHypervisor::new(
            Virsh::default(),
            "virsh",
            Some("qemu:///system".to_string()),
        );
        assert_eq!(hv.running_vms().unwrap(), vec!["i-2-10-VM", "r-4-VM"]);
        assert!(hv.is_running("r-4-VM").unwrap());

        let calls = hv.runner.calls.lock().unwrap();
        assert_eq!(calls[0][..2], ["-c".to_string(), "qemu:///system".to_string()]);
    }

    #[test]
    fn lists_all_domains() {
        let hv = VirshHypervisor::new(Virsh::default(), "virsh", None);
        let domains = hv.list_domains().unwrap();
        assert_eq!(domains.len(), 2);
        assert_eq!(domains[0].id, Some(7));
        assert_eq!(domains[1].id, None);
        assert_eq!(domains[1].state, "shut off");
    }
}

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sg_core::{AgentConfig, MacAddr, SystemRunner, VmName, VmNetwork};
use sg_fw::{ApplyOutcome, BridgeStatus, SecurityGroupManager};
use sg_libvirt::VirshHypervisor;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

type HostManager = SecurityGroupManager<SystemRunner, VirshHypervisor<SystemRunner>>;

#[derive(Parser)]
#[command(name = "sgwarden")]
#[command(version, about = "Per-host security group enforcement", long_about = None)]
struct Cli {
    /// Agent configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `sg_fw=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bridge firewall hooks
    Bridge {
        #[command(subcommand)]
        action: BridgeAction,
    },
    /// Per-VM isolation rules
    Vm {
        #[command(subcommand)]
        action: VmAction,
    },
    /// Remove isolation chains of VMs that are no longer running
    Cleanup,
    /// Host diagnostics
    Doctor {
        /// Bridges whose FORWARD hook should be checked
        #[arg(long = "bridge")]
        bridges: Vec<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Metrics server
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
    /// Agent configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BridgeAction {
    /// Route bridged traffic through the packet filter and install the hook chains
    Ensure {
        #[arg(long)]
        bridge: String,
    },
}

#[derive(Args)]
struct VmNetworkArgs {
    #[arg(long)]
    name: VmName,
    #[arg(long)]
    id: u64,
    #[arg(long)]
    ip: Option<IpAddr>,
    #[arg(long)]
    mac: MacAddr,
    #[arg(long)]
    vif: String,
    #[arg(long)]
    bridge: String,
}

impl From<VmNetworkArgs> for VmNetwork {
    fn from(args: VmNetworkArgs) -> Self {
        VmNetwork {
            vm_name: args.name,
            vm_id: args.id,
            vm_ip: args.ip,
            vm_mac: args.mac,
            vif: args.vif,
            bridge_name: args.bridge,
        }
    }
}

#[derive(Subcommand)]
enum VmAction {
    /// Program default chains and anti-spoofing for a new VM
    Defaults {
        #[command(flatten)]
        net: VmNetworkArgs,
    },
    /// Reconcile a VM's ingress rules
    Apply {
        #[command(flatten)]
        net: VmNetworkArgs,
        #[arg(long)]
        signature: String,
        #[arg(long, allow_hyphen_values = true)]
        seqno: i64,
        /// `proto:start:end:cidr,cidr,;...`
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        rules: String,
    },
    /// Remove every rule and chain placed for a VM
    Delete {
        #[arg(long)]
        name: VmName,
        /// Also remove NAT rules mentioning this interface
        #[arg(long)]
        vif: Option<String>,
    },
    /// Show the stored record, ledger and live VM chain
    Show {
        #[arg(long)]
        name: VmName,
    },
    /// Compare the VM chain with what a rules string would program
    Diff {
        #[arg(long)]
        name: VmName,
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        rules: String,
    },
}

#[derive(Subcommand)]
enum MetricsAction {
    /// Start metrics server
    Serve {
        /// Defaults to metrics.port from the configuration
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = AgentConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Bridge { action } => handle_bridge_action(&manager(&config), action)?,
        Commands::Vm { action } => handle_vm_action(&manager(&config), action)?,
        Commands::Cleanup => run_cleanup(&manager(&config))?,
        Commands::Doctor { bridges, json } => run_doctor(&manager(&config), bridges, json)?,
        Commands::Metrics { action } => {
            tokio::runtime::Runtime::new()?.block_on(async {
                handle_metrics_action(&config, action).await
            })?;
        }
        Commands::Config { action: ConfigAction::Show } => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn manager(config: &AgentConfig) -> HostManager {
    let hypervisor = VirshHypervisor::new(
        SystemRunner::new(),
        config.tools.virsh.clone(),
        config.hypervisor.uri.clone(),
    );
    SecurityGroupManager::new(SystemRunner::new(), hypervisor, config)
}

fn handle_bridge_action(sg: &HostManager, action: BridgeAction) -> anyhow::Result<()> {
    match action {
        BridgeAction::Ensure { bridge } => {
            let status = sg
                .ensure_bridge_firewall(&bridge)
                .with_context(|| format!("Failed to prepare bridge {}", bridge))?;
            match status {
                BridgeStatus::Installed { uplink: Some(uplink) } => {
                    println!("✅ Installed firewall hook for {} (uplink {})", bridge, uplink)
                }
                BridgeStatus::Installed { uplink: None } => {
                    println!("✅ Installed firewall hook for {}", bridge);
                    println!("  ⚠️  No uplink port found; the uplink ACCEPT rule was left out");
                }
                BridgeStatus::AlreadyInstalled => {
                    println!("✅ Firewall hook for {} already in place", bridge)
                }
            }
        }
    }
    Ok(())
}

fn handle_vm_action(sg: &HostManager, action: VmAction) -> anyhow::Result<()> {
    match action {
        VmAction::Defaults { net } => {
            let net = VmNetwork::from(net);
            sg.apply_default_rules(&net)
                .with_context(|| format!("Failed to program default rules for {}", net.vm_name))?;
            println!("✅ Default rules programmed for {}", net.vm_name);
        }
        VmAction::Apply {
            net,
            signature,
            seqno,
            rules,
        } => {
            let net = VmNetwork::from(net);
            let outcome = sg
                .apply_rules(&net, &signature, seqno, &rules)
                .with_context(|| format!("Failed to apply rules for {}", net.vm_name))?;
            print_outcome(&net.vm_name, &outcome);
        }
        VmAction::Delete { name, vif } => {
            let report = sg.delete_all_rules_for_vm(&name, vif.as_deref());
            println!("🗑️  Removed {} item(s) for {}", report.removed.len(), name);
            for failure in &report.failures {
                println!("  ⚠️  {}", failure);
            }
        }
        VmAction::Show { name } => show_vm(sg, &name)?,
        VmAction::Diff { name, rules } => {
            let diff = sg.diff_vm_chain(&name, &rules)?;
            if diff.matches() {
                println!("✅ {} matches the given rules", diff.chain);
            } else {
                if !diff.chain_exists {
                    println!("Chain {} does not exist\n", diff.chain);
                }
                print!("{}", diff.render());
            }
        }
    }
    Ok(())
}

fn print_outcome(vm_name: &VmName, outcome: &ApplyOutcome) {
    match outcome {
        ApplyOutcome::Unchanged => println!("✅ {} already up to date", vm_name),
        ApplyOutcome::Applied {
            changed_fields,
            defaults_reapplied,
            rules_programmed,
            rejected,
        } => {
            println!(
                "✅ Programmed {} rule(s) for {} (changed: {})",
                rules_programmed,
                vm_name,
                changed_fields.join(", ")
            );
            if *defaults_reapplied {
                println!("   Default rules were reapplied");
            }
            for entry in rejected {
                println!("  ⚠️  Skipped {}", entry);
            }
        }
    }
}

fn show_vm(sg: &HostManager, name: &VmName) -> anyhow::Result<()> {
    let store = sg.store();

    println!("📋 {}\n", name);
    match store.load(name)? {
        Some(record) => println!("Record: {}", record.to_line()?),
        None => println!("Record: (none)"),
    }

    match store.load_ledger(name)? {
        Some(ledger) if !ledger.is_empty() => {
            println!("\nHook rules ({}):", ledger.len());
            for rule in &ledger.rules {
                println!("  {}", rule.render());
            }
        }
        _ => println!("\nHook rules: (none recorded)"),
    }

    let ipt = sg.iptables();
    if ipt.chain_exists(sg_fw::specs::FILTER, name.chain())? {
        println!("\nChain {}:", name.chain());
        for rule in ipt.list_rules(sg_fw::specs::FILTER, name.chain())? {
            println!("  {}", rule);
        }
    } else {
        println!("\nChain {}: (absent)", name.chain());
    }

    Ok(())
}

fn run_cleanup(sg: &HostManager) -> anyhow::Result<()> {
    let report = sg
        .cleanup_orphan_chains()
        .context("Failed to sweep orphaned chains")?;

    println!(
        "🧹 Scanned {} VM chain(s), removed {}",
        report.scanned,
        report.removed.len()
    );
    for teardown in &report.removed {
        println!("  • {}", teardown.vm_name);
        for failure in &teardown.failures {
            println!("    ⚠️  {}", failure);
        }
    }
    Ok(())
}

fn run_doctor(sg: &HostManager, bridges: Vec<String>, json: bool) -> anyhow::Result<()> {
    use sg_doctor::Doctor;

    if !json {
        println!("🩺 Running host diagnostics...\n");
    }
    let report = Doctor::new(sg, bridges).run_all();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.display();
    }

    if report.has_errors() {
        anyhow::bail!("diagnostics found errors");
    }
    Ok(())
}

async fn handle_metrics_action(config: &AgentConfig, action: MetricsAction) -> anyhow::Result<()> {
    match action {
        MetricsAction::Serve { port } => {
            use sg_metrics::{MetricsCollector, MetricsServer};

            let port = port.unwrap_or(config.metrics.port);
            println!("🚀 Starting metrics server on port {}...", port);

            let collector = MetricsCollector::new()?;
            let server = MetricsServer::new(collector, manager(config), port);
            server.serve().await?;
        }
    }
    Ok(())
}

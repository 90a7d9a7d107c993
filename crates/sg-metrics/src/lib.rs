use anyhow::{Context, Result};
use axum::{Router, routing::get};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use sg_core::{CommandRunner, Hypervisor, OperationCounters, VmName};
use sg_fw::specs::FILTER;
use sg_fw::SecurityGroupManager;
use std::sync::Arc;
use tracing::{info, warn};

/// Metrics collector for sgwarden
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Host state, refreshed from the firewall on each scrape
    vm_chains: IntGauge,
    rule_records: IntGauge,
    bridge_hooks: IntGaugeVec,

    // Operation counters, mirrored from the run directory
    reconcile_total: IntCounterVec,
    teardown_total: IntCounter,
    orphans_removed_total: IntCounter,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let vm_chains = IntGauge::new("sgwarden_vm_chains", "Number of VM isolation chains")?;
        registry.register(Box::new(vm_chains.clone()))?;

        let rule_records = IntGauge::new(
            "sgwarden_rule_records",
            "Number of per-VM rule log records on disk",
        )?;
        registry.register(Box::new(rule_records.clone()))?;

        let bridge_hooks = IntGaugeVec::new(
            Opts::new(
                "sgwarden_bridge_hooks",
                "References to the bridge firewall chain (0 = not hooked)",
            ),
            &["bridge"],
        )?;
        registry.register(Box::new(bridge_hooks.clone()))?;

        let reconcile_total = IntCounterVec::new(
            Opts::new("sgwarden_reconcile_total", "Rule reconciliations by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(reconcile_total.clone()))?;

        let teardown_total = IntCounter::new("sgwarden_teardown_total", "Total VM teardowns")?;
        registry.register(Box::new(teardown_total.clone()))?;

        let orphans_removed_total = IntCounter::new(
            "sgwarden_orphans_removed_total",
            "Isolation chains removed by the orphan sweep",
        )?;
        registry.register(Box::new(orphans_removed_total.clone()))?;

        Ok(Self {
            registry,
            vm_chains,
            rule_records,
            bridge_hooks,
            reconcile_total,
            teardown_total,
            orphans_removed_total,
        })
    }

    /// Refresh gauges from the live firewall and the record store.
    pub fn update_host_metrics<R: CommandRunner, H: Hypervisor>(
        &self,
        sg: &SecurityGroupManager<R, H>,
    ) -> Result<()> {
        let ipt = sg.iptables();
        let chains = ipt
            .list_chains(FILTER)
            .context("Failed to list filter chains")?;

        let vm_chains = chains
            .iter()
            .filter(|chain| VmName::is_isolation_chain(chain))
            .count();
        self.vm_chains.set(vm_chains as i64);

        let records = sg
            .store()
            .list()
            .with_context(|| format!("Failed to read records in {:?}", sg.store().run_dir()))?;
        self.rule_records.set(records.len() as i64);

        for bridge in chains.iter().filter_map(|chain| bridge_of(chain)) {
            let main = format!("BF-{}", bridge);
            match ipt.references(FILTER, &main) {
                Ok(references) => self
                    .bridge_hooks
                    .with_label_values(&[bridge])
                    .set(i64::from(references)),
                Err(e) => warn!(bridge, error = %e, "could not read bridge hook references"),
            }
        }

        let counters = sg
            .store()
            .load_counters()
            .with_context(|| format!("Failed to read {:?}", sg.store().counters_path()))?;
        self.update_operation_counters(&counters);

        Ok(())
    }

    /// Copy persisted totals into the exported counters
    pub fn update_operation_counters(&self, counters: &OperationCounters) {
        for (outcome, total) in counters.reconcile_by_outcome() {
            set_counter(&self.reconcile_total.with_label_values(&[outcome]), total);
        }
        set_counter(&self.teardown_total, counters.teardowns);
        set_counter(&self.orphans_removed_total, counters.orphans_removed);
    }

    /// Render metrics in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn set_counter(counter: &IntCounter, total: u64) {
    counter.reset();
    counter.inc_by(total);
}

/// Bridge name of a `BF-<bridge>` hook chain, skipping its `-IN`/`-OUT`
/// children.
fn bridge_of(chain: &str) -> Option<&str> {
    let bridge = chain.strip_prefix("BF-")?;
    if bridge.ends_with("-IN") || bridge.ends_with("-OUT") {
        return None;
    }
    Some(bridge)
}

/// HTTP server for Prometheus metrics endpoint
pub struct MetricsServer<R, H> {
    collector: Arc<MetricsCollector>,
    sg: Arc<SecurityGroupManager<R, H>>,
    addr: std::net::SocketAddr,
}

impl<R, H> MetricsServer<R, H>
where
    R: CommandRunner + 'static,
    H: Hypervisor + 'static,
{
    pub fn new(collector: MetricsCollector, sg: SecurityGroupManager<R, H>, port: u16) -> Self {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        Self {
            collector: Arc::new(collector),
            sg: Arc::new(sg),
            addr,
        }
    }

    /// Start the metrics HTTP server
    pub async fn serve(self) -> Result<()> {
        let collector = self.collector.clone();
        let sg = self.sg.clone();

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let collector = collector.clone();
                let sg = sg.clone();
                async move {
                    // Refreshing runs iptables; keep it off the async workers.
                    let rendered = tokio::task::spawn_blocking(move || {
                        collector.update_host_metrics(&sg)?;
                        collector.render_metrics()
                    })
                    .await;
                    match rendered {
                        Ok(Ok(metrics)) => metrics,
                        Ok(Err(e)) => format!("# Error rendering metrics: {}", e),
                        Err(e) => format!("# Error rendering metrics: {}", e),
                    }
                }
            }),
        );

        info!(addr = %self.addr, "metrics server listening on http://{}/metrics", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.addr))?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_core::{AgentConfig, VmNetwork};
    use sg_fw::testing::{FakeHost, FakeHypervisor};

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new();
        assert!(collector.is_ok());
    }

    #[test]
    fn bridge_hook_chains_are_recognized() {
        assert_eq!(bridge_of("BF-cloudbr0"), Some("cloudbr0"));
        assert_eq!(bridge_of("BF-cloudbr0-IN"), None);
        assert_eq!(bridge_of("BF-cloudbr0-OUT"), None);
        assert_eq!(bridge_of("i-2-10-VM"), None);
    }

    #[test]
    fn host_metrics_reflect_firewall_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            run_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let host = FakeHost::new().with_bridge("cloudbr0", &["eth0"]);
        let hv = FakeHypervisor::new().with_vm("i-2-10-VM", 3);
        let sg = SecurityGroupManager::new(host, hv, &config);
        let net = network("i-2-10-VM");

        let collector = MetricsCollector::new().unwrap();
        sg.apply_rules(&net, "abc", 1, "tcp:22:22:0.0.0.0/0,").unwrap();
        sg.apply_rules(&net, "abc", 1, "tcp:22:22:0.0.0.0/0,").unwrap();
        assert!(sg.apply_rules(&network("i-9-99-VM"), "abc", 1, "").is_err());
        collector.update_host_metrics(&sg).unwrap();

        let output = collector.render_metrics().unwrap();
        assert!(output.contains("sgwarden_vm_chains 1"));
        assert!(output.contains("sgwarden_rule_records 1"));
        assert!(output.contains("sgwarden_bridge_hooks{bridge=\"cloudbr0\"} 2"));
        assert!(output.contains("sgwarden_reconcile_total{outcome=\"applied\"} 1"));
        assert!(output.contains("sgwarden_reconcile_total{outcome=\"unchanged\"} 1"));
        assert!(output.contains("sgwarden_reconcile_total{outcome=\"failed\"} 1"));

        assert!(sg.delete_all_rules_for_vm(&net.vm_name, Some("vif3.0")).is_clean());
        collector.update_host_metrics(&sg).unwrap();
        let output = collector.render_metrics().unwrap();
        assert!(output.contains("sgwarden_vm_chains 0"));
        assert!(output.contains("sgwarden_teardown_total 1"));

        sg.apply_default_rules(&net).unwrap();
        sg.hypervisor().stop("i-2-10-VM");
        sg.cleanup_orphan_chains().unwrap();
        collector.update_host_metrics(&sg).unwrap();
        let output = collector.render_metrics().unwrap();
        assert!(output.contains("sgwarden_orphans_removed_total 1"));
        assert!(output.contains("sgwarden_teardown_total 2"));
    }

    #[test]
    fn counters_come_from_earlier_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            run_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };

        // One process reconciles and exits.
        {
            let sg = SecurityGroupManager::new(
                FakeHost::new().with_bridge("cloudbr0", &["eth0"]),
                FakeHypervisor::new().with_vm("i-2-10-VM", 3),
                &config,
            );
            sg.apply_rules(&network("i-2-10-VM"), "abc", 1, "").unwrap();
            sg.delete_all_rules_for_vm(&network("i-2-10-VM").vm_name, None);
        }

        // The metrics server runs in another.
        let sg = SecurityGroupManager::new(FakeHost::new(), FakeHypervisor::new(), &config);
        let collector = MetricsCollector::new().unwrap();
        collector.update_host_metrics(&sg).unwrap();
        collector.update_host_metrics(&sg).unwrap();

        let output = collector.render_metrics().unwrap();
        assert!(output.contains("sgwarden_reconcile_total{outcome=\"applied\"} 1"));
        assert!(output.contains("sgwarden_teardown_total 1"));
        assert!(output.contains("sgwarden_orphans_removed_total 0"));
    }

    fn network(name: &str) -> VmNetwork {
        VmNetwork {
            vm_name: name.parse().unwrap(),
            vm_id: 10,
            vm_ip: Some("10.1.1.23".parse().unwrap()),
            vm_mac: "06:aa:bb:cc:dd:ee".parse().unwrap(),
            vif: "vif3.0".into(),
            bridge_name: "cloudbr0".into(),
        }
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sgwarden/agent.yaml";

/// Host agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding per-VM rule log records and ledgers.
    pub run_dir: PathBuf,
    pub tools: ToolPaths,
    /// Kernel switches that route bridged frames through iptables.
    pub bridge_sysctls: Vec<String>,
    pub hypervisor: HypervisorConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub iptables: String,
    pub iptables_save: String,
    pub ebtables: String,
    pub brctl: String,
    pub sysctl: String,
    pub virsh: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Passed to `virsh -c` when set.
    pub uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("/var/run/cloud"),
            tools: ToolPaths::default(),
            bridge_sysctls: vec![
                "net.bridge.bridge-nf-call-arptables".to_string(),
                "net.bridge.bridge-nf-call-iptables".to_string(),
                "net.bridge.bridge-nf-call-ip6tables".to_string(),
            ],
            hypervisor: HypervisorConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            iptables: "iptables".to_string(),
            iptables_save: "iptables-save".to_string(),
            ebtables: "ebtables".to_string(),
            brctl: "brctl".to_string(),
            sysctl: "sysctl".to_string(),
            virsh: "virsh".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { port: 9139 }
    }
}

impl AgentConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse agent config YAML")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read agent config from {:?}", path))?;
        Self::from_yaml(&content)
    }

    /// Loads `path`, or the default location when none is given. A missing
    /// default file yields the built-in defaults; a missing explicit path is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

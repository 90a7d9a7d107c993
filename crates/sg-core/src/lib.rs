pub mod config;
pub mod counters;
pub mod error;
pub mod exec;
pub mod hypervisor;
pub mod ledger;
pub mod record;
pub mod rules;
pub mod store;
pub mod vm;

pub use config::{AgentConfig, HypervisorConfig, MetricsConfig, ToolPaths};
pub use counters::OperationCounters;
pub use error::{FirewallError, Result};
pub use exec::{CommandOutput, CommandRunner, SystemRunner};
pub use hypervisor::Hypervisor;
pub use ledger::{AppliedRule, FilterKind, RuleLedger};
pub use record::{RecordDiff, RuleLogRecord, INITIAL_SEQNO, INITIAL_SIGNATURE};
pub use rules::{IcmpMatch, PortRange, Protocol, RuleIntent, RuleSet};
pub use store::RuleLogStore;
pub use vm::{MacAddr, VmName, VmNetwork, VmRole};

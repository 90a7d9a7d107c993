pub mod bootstrap;
pub mod diff;
pub mod ebtables;
pub mod iptables;
pub mod reconciler;
pub mod specs;
pub mod teardown;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bootstrap::BridgeStatus;
pub use diff::ChainDiff;
pub use ebtables::Ebtables;
pub use iptables::{ChainStatus, Iptables};
pub use reconciler::{ApplyOutcome, SecurityGroupManager};
pub use teardown::{CleanupReport, TeardownReport};

// iptables/ebtables programming for per-VM isolation chains

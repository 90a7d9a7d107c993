use thiserror::Error;

/// Failure kinds surfaced by the reconciler and its collaborators.
#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("command `{command}` failed with exit code {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to spawn `{command}`: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("chain {chain} not found in table {table}")]
    ChainNotFound { table: String, chain: String },

    #[error("malformed rule entry '{entry}': {reason}")]
    MalformedRuleEntry { entry: String, reason: String },

    #[error("invalid value for record field {field}: {value:?}")]
    InvalidRecordField { field: &'static str, value: String },

    #[error("invalid rule log record: {0}")]
    InvalidRecord(String),

    #[error("invalid VM name '{name}': {reason}")]
    InvalidVmName { name: String, reason: String },

    #[error("hypervisor query failed for {vm_name}: {message}")]
    Hypervisor { vm_name: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FirewallError>;

impl FirewallError {
    pub fn malformed(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRuleEntry {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    /// True when the failure came from a firewall tool exiting non-zero.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Self::CommandFailed { .. })
    }
}

use serde::{Deserialize, Serialize};

/// Host-wide operation totals. They live in the run directory next to the
/// records, so every short-lived invocation adds to the same counts.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationCounters {
    pub reconcile_applied: u64,
    pub reconcile_unchanged: u64,
    pub reconcile_failed: u64,
    pub teardowns: u64,
    pub orphans_removed: u64,
}

impl OperationCounters {
    /// Reconciliations keyed by outcome label.
    pub fn reconcile_by_outcome(&self) -> [(&'static str, u64); 3] {
        [
            ("applied", self.reconcile_applied),
            ("unchanged", self.reconcile_unchanged),
            ("failed", self.reconcile_failed),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_read_as_zero() {
        let counters: OperationCounters = serde_json::from_str(r#"{"teardowns":4}"#).unwrap();
        assert_eq!(counters.teardowns, 4);
        assert_eq!(counters.reconcile_applied, 0);
        assert_eq!(counters.reconcile_by_outcome()[2], ("failed", 0));
    }
}

use crate::counters::OperationCounters;
use crate::error::{FirewallError, Result};
use crate::ledger::RuleLedger;
use crate::record::RuleLogRecord;
use crate::vm::VmName;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const RECORD_EXT: &str = "log";
const LEDGER_SUFFIX: &str = ".rules.json";
const COUNTERS_FILE: &str = "counters.json";

/// One-file-per-VM store for rule-log records and applied-rule ledgers.
#[derive(Debug, Clone)]
pub struct RuleLogStore {
    run_dir: PathBuf,
}

impl RuleLogStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn record_path(&self, vm_name: &VmName) -> PathBuf {
        self.run_dir.join(format!("{}.{}", vm_name, RECORD_EXT))
    }

    pub fn ledger_path(&self, vm_name: &VmName) -> PathBuf {
        self.run_dir.join(format!("{}{}", vm_name, LEDGER_SUFFIX))
    }

    pub fn load(&self, vm_name: &VmName) -> Result<Option<RuleLogRecord>> {
        let content = match fs::read_to_string(self.record_path(vm_name)) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let line = content.lines().next().unwrap_or_default();
        RuleLogRecord::parse_line(line).map(Some)
    }

    /// Like [`load`](Self::load), but an unreadable or corrupt record is
    /// reported and treated as absent.
    pub fn load_or_absent(&self, vm_name: &VmName) -> Option<RuleLogRecord> {
        match self.load(vm_name) {
            Ok(record) => record,
            Err(e) => {
                warn!(vm = %vm_name, error = %e, "ignoring unusable rule log record");
                None
            }
        }
    }

    pub fn write(&self, record: &RuleLogRecord) -> Result<()> {
        let line = record.to_line()?;
        write_atomic(&self.record_path(&record.vm_name), line.as_bytes())?;
        debug!(vm = %record.vm_name, signature = %record.signature, seqno = record.seqno, "wrote rule log record");
        Ok(())
    }

    /// Removes the record; returns whether one existed.
    pub fn remove(&self, vm_name: &VmName) -> Result<bool> {
        remove_if_exists(&self.record_path(vm_name))
    }

    /// Names of all VMs that currently have a record.
    pub fn list(&self) -> Result<Vec<VmName>> {
        let entries = match fs::read_dir(&self.run_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(name) = VmName::new(stem) {
                names.push(name);
            }
        }
        names.sort();

        Ok(names)
    }

    pub fn load_ledger(&self, vm_name: &VmName) -> Result<Option<RuleLedger>> {
        match fs::read_to_string(self.ledger_path(vm_name)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_ledger(&self, ledger: &RuleLedger) -> Result<()> {
        let json = serde_json::to_vec_pretty(ledger)?;
        write_atomic(&self.ledger_path(&ledger.vm_name), &json)
    }

    pub fn remove_ledger(&self, vm_name: &VmName) -> Result<bool> {
        remove_if_exists(&self.ledger_path(vm_name))
    }

    pub fn counters_path(&self) -> PathBuf {
        self.run_dir.join(COUNTERS_FILE)
    }

    pub fn load_counters(&self) -> Result<OperationCounters> {
        match fs::read_to_string(self.counters_path()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(OperationCounters::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies `bump` to the stored counters. A corrupt counters file starts
    /// over from zero.
    pub fn update_counters(&self, bump: impl FnOnce(&mut OperationCounters)) -> Result<()> {
        let mut counters = match self.load_counters() {
            Ok(counters) => counters,
            Err(FirewallError::Serde(e)) => {
                warn!(error = %e, "resetting unreadable operation counters");
                OperationCounters::default()
            }
            Err(e) => return Err(e),
        };
        bump(&mut counters);
        let json = serde_json::to_vec_pretty(&counters)?;
        write_atomic(&self.counters_path(), &json)
    }
}

/// Writes `contents` next to `path` and renames it into place.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = dir.join(format!(".{}.tmp", file_name));

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AppliedRule, FilterKind};

    fn name() -> VmName {
        VmName::new("i-2-10-VM").unwrap()
    }

    fn record(signature: &str, seqno: i64) -> RuleLogRecord {
        RuleLogRecord {
            vm_name: name(),
            vm_id: 10,
            vm_ip: Some("10.1.1.23".parse().unwrap()),
            dom_id: 3,
            signature: signature.into(),
            seqno,
        }
    }

    #[test]
    fn write_overwrites_single_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleLogStore::new(dir.path().join("run"));

        assert!(store.load(&name()).unwrap().is_none());

        store.write(&record("aaa", 1)).unwrap();
        store.write(&record("bbb", 2)).unwrap();

        let on_disk = fs::read_to_string(store.record_path(&name())).unwrap();
        assert_eq!(on_disk, "i-2-10-VM,10,10.1.1.23,3,bbb,2");
        assert_eq!(store.load(&name()).unwrap(), Some(record("bbb", 2)));

        let leftovers: Vec<_> = fs::read_dir(store.run_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupt_record_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleLogStore::new(dir.path());
        fs::write(store.record_path(&name()), "garbage").unwrap();

        assert!(store.load(&name()).is_err());
        assert!(store.load_or_absent(&name()).is_none());
    }

    #[test]
    fn remove_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleLogStore::new(dir.path());
        store.write(&record("aaa", 1)).unwrap();

        assert!(store.remove(&name()).unwrap());
        assert!(!store.remove(&name()).unwrap());
        assert!(!store.record_path(&name()).exists());
    }

    #[test]
    fn list_only_returns_record_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleLogStore::new(dir.path());
        store.write(&record("aaa", 1)).unwrap();
        store
            .save_ledger(&RuleLedger::new(VmName::new("r-4-VM").unwrap()))
            .unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(store.list().unwrap(), vec![name()]);
    }

    #[test]
    fn counters_accumulate_across_stores() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            RuleLogStore::new(dir.path()).load_counters().unwrap(),
            OperationCounters::default()
        );

        RuleLogStore::new(dir.path())
            .update_counters(|c| c.teardowns += 1)
            .unwrap();
        RuleLogStore::new(dir.path())
            .update_counters(|c| c.teardowns += 2)
            .unwrap();
        assert_eq!(RuleLogStore::new(dir.path()).load_counters().unwrap().teardowns, 3);

        fs::write(dir.path().join(COUNTERS_FILE), "not json").unwrap();
        let store = RuleLogStore::new(dir.path());
        store.update_counters(|c| c.orphans_removed += 1).unwrap();
        let counters = store.load_counters().unwrap();
        assert_eq!(counters.teardowns, 0);
        assert_eq!(counters.orphans_removed, 1);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn ledger_round_trip_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleLogStore::new(dir.path());
        let mut ledger = RuleLedger::new(name());
        ledger.record(AppliedRule {
            kind: FilterKind::Ebtables,
            table: "nat".into(),
            chain: "PREROUTING".into(),
            spec: vec!["-i".into(), "vif3.0".into(), "-j".into(), "i-2-10-VM-in".into()],
        });

        store.save_ledger(&ledger).unwrap();
        assert_eq!(store.load_ledger(&name()).unwrap(), Some(ledger));
        assert!(store.remove_ledger(&name()).unwrap());
        assert!(store.load_ledger(&name()).unwrap().is_none());
    }
}

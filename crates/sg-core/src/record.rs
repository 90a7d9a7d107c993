use crate::error::{FirewallError, Result};
use crate::vm::VmName;
use std::net::IpAddr;

/// Signature written when only the default rules are in place.
pub const INITIAL_SIGNATURE: &str = "_initial_";
/// Sequence number written alongside [`INITIAL_SIGNATURE`].
pub const INITIAL_SEQNO: i64 = -1;

const FIELD_COUNT: usize = 6;

/// Last successfully applied identity and rule version for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLogRecord {
    pub vm_name: VmName,
    pub vm_id: u64,
    pub vm_ip: Option<IpAddr>,
    pub dom_id: u32,
    pub signature: String,
    pub seqno: i64,
}

impl RuleLogRecord {
    pub fn initial(vm_name: VmName, vm_id: u64, vm_ip: Option<IpAddr>, dom_id: u32) -> Self {
        Self {
            vm_name,
            vm_id,
            vm_ip,
            dom_id,
            signature: INITIAL_SIGNATURE.to_string(),
            seqno: INITIAL_SEQNO,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.signature == INITIAL_SIGNATURE && self.seqno == INITIAL_SEQNO
    }

    /// Renders `vm_name,vm_id,vm_ip,dom_id,signature,seqno`.
    pub fn to_line(&self) -> Result<String> {
        if self.signature.is_empty()
            || self
                .signature
                .chars()
                .any(|c| c == ',' || c == '\n' || c == '\r')
        {
            return Err(FirewallError::InvalidRecordField {
                field: "signature",
                value: self.signature.clone(),
            });
        }

        let vm_ip = self.vm_ip.map(|ip| ip.to_string()).unwrap_or_default();
        Ok(format!(
            "{},{},{},{},{},{}",
            self.vm_name, self.vm_id, vm_ip, self.dom_id, self.signature, self.seqno
        ))
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != FIELD_COUNT {
            return Err(FirewallError::InvalidRecord(format!(
                "expected {} fields, found {}",
                FIELD_COUNT,
                fields.len()
            )));
        }

        let invalid = |what: &str, value: &str| {
            FirewallError::InvalidRecord(format!("bad {} '{}'", what, value))
        };

        let vm_name = VmName::new(fields[0])?;
        let vm_id = fields[1]
            .parse()
            .map_err(|_| invalid("vm_id", fields[1]))?;
        let vm_ip = match fields[2] {
            "" | "None" => None,
            ip => Some(ip.parse().map_err(|_| invalid("vm_ip", ip))?),
        };
        let dom_id = fields[3]
            .parse()
            .map_err(|_| invalid("dom_id", fields[3]))?;
        let signature = fields[4].to_string();
        if signature.is_empty() {
            return Err(invalid("signature", fields[4]));
        }
        let seqno = fields[5]
            .parse()
            .map_err(|_| invalid("seqno", fields[5]))?;

        Ok(Self {
            vm_name,
            vm_id,
            vm_ip,
            dom_id,
            signature,
            seqno,
        })
    }
}

/// Per-field comparison between the stored record and the desired state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordDiff {
    pub vm_name: bool,
    pub vm_id: bool,
    pub vm_ip: bool,
    pub dom_id: bool,
    pub signature: bool,
    pub seqno: bool,
}

impl RecordDiff {
    pub fn all_changed() -> Self {
        Self {
            vm_name: true,
            vm_id: true,
            vm_ip: true,
            dom_id: true,
            signature: true,
            seqno: true,
        }
    }

    /// A missing record counts as every field changed.
    pub fn between(stored: Option<&RuleLogRecord>, desired: &RuleLogRecord) -> Self {
        match stored {
            None => Self::all_changed(),
            Some(stored) => Self {
                vm_name: stored.vm_name != desired.vm_name,
                vm_id: stored.vm_id != desired.vm_id,
                vm_ip: stored.vm_ip != desired.vm_ip,
                dom_id: stored.dom_id != desired.dom_id,
                signature: stored.signature != desired.signature,
                seqno: stored.seqno != desired.seqno,
            },
        }
    }

    pub fn any(&self) -> bool {
        self.identity_changed() || self.signature || self.seqno
    }

    /// Name, id, address or domain changed: default wiring is stale.
    pub fn identity_changed(&self) -> bool {
        self.vm_name || self.vm_id || self.vm_ip || self.dom_id
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        [
            ("vm_name", self.vm_name),
            ("vm_id", self.vm_id),
            ("vm_ip", self.vm_ip),
            ("dom_id", self.dom_id),
            ("signature", self.signature),
            ("seqno", self.seqno),
        ]
        .into_iter()
        .filter_map(|(name, changed)| changed.then_some(name))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RuleLogRecord {
        RuleLogRecord {
            vm_name: VmName::new("i-2-10-VM").unwrap(),
            vm_id: 10,
            vm_ip: Some("10.1.1.23".parse().unwrap()),
            dom_id: 7,
            signature: "5f4dcc3b5aa765d61d8327deb882cf99".into(),
            seqno: 42,
        }
    }

    #[test]
    fn line_format_is_fixed_order() {
        let line = record().to_line().unwrap();
        assert_eq!(
            line,
            "i-2-10-VM,10,10.1.1.23,7,5f4dcc3b5aa765d61d8327deb882cf99,42"
        );
        assert_eq!(RuleLogRecord::parse_line(&format!("{}\n", line)).unwrap(), record());
    }

    #[test]
    fn missing_ip_is_an_empty_field() {
        let mut rec = RuleLogRecord::initial(VmName::new("r-4-VM").unwrap(), 4, None, 1);
        assert!(rec.is_initial());
        assert_eq!(rec.to_line().unwrap(), "r-4-VM,4,,1,_initial_,-1");
        assert_eq!(RuleLogRecord::parse_line("r-4-VM,4,None,1,_initial_,-1").unwrap(), rec);

        rec.signature = "a,b".into();
        assert!(matches!(
            rec.to_line(),
            Err(FirewallError::InvalidRecordField { field: "signature", .. })
        ));
    }

    #[test]
    fn corrupt_lines_are_rejected() {
        assert!(RuleLogRecord::parse_line("").is_err());
        assert!(RuleLogRecord::parse_line("i-2-10-VM,10,10.1.1.23,7,sig").is_err());
        assert!(RuleLogRecord::parse_line("i-2-10-VM,ten,10.1.1.23,7,sig,1").is_err());
        assert!(RuleLogRecord::parse_line("i-2-10-VM,10,10.1.1.x,7,sig,1").is_err());
        assert!(RuleLogRecord::parse_line("i-2-10-VM,10,10.1.1.23,7,sig,1,extra").is_err());
    }

    #[test]
    fn every_field_combination_is_detected() {
        let stored = record();
        for mask in 0u8..64 {
            let mut desired = stored.clone();
            if mask & 0b000001 != 0 {
                desired.vm_name = VmName::new("i-2-11-VM").unwrap();
            }
            if mask & 0b000010 != 0 {
                desired.vm_id += 1;
            }
            if mask & 0b000100 != 0 {
                desired.vm_ip = None;
            }
            if mask & 0b001000 != 0 {
                desired.dom_id += 1;
            }
            if mask & 0b010000 != 0 {
                desired.signature.push('x');
            }
            if mask & 0b100000 != 0 {
                desired.seqno += 1;
            }

            let diff = RecordDiff::between(Some(&stored), &desired);
            assert_eq!(diff.any(), mask != 0, "mask {:06b}", mask);
            assert_eq!(diff.identity_changed(), mask & 0b001111 != 0, "mask {:06b}", mask);
            assert_eq!(diff.changed_fields().len(), mask.count_ones() as usize);
        }
    }

    #[test]
    fn absent_record_means_everything_changed() {
        let diff = RecordDiff::between(None, &record());
        assert_eq!(diff, RecordDiff::all_changed());
        assert!(diff.identity_changed());
    }
}

use crate::error::{FirewallError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// iptables refuses chain names longer than this.
pub const MAX_IPTABLES_CHAIN_LEN: usize = 28;
/// ebtables refuses chain names longer than this.
pub const MAX_EBTABLES_CHAIN_LEN: usize = 31;

/// Role encoded in the first segment of a VM name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmRole {
    Instance,
    Router,
    SystemVm,
    Vpc,
}

impl VmRole {
    pub fn from_prefix(name: &str) -> Option<Self> {
        match name.get(..2)? {
            "i-" => Some(Self::Instance),
            "r-" => Some(Self::Router),
            "s-" => Some(Self::SystemVm),
            "v-" => Some(Self::Vpc),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Instance => "i-",
            Self::Router => "r-",
            Self::SystemVm => "s-",
            Self::Vpc => "v-",
        }
    }
}

/// Validated VM name; doubles as the name of the VM's isolation chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VmName(String);

impl VmName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let invalid = |reason: &str| FirewallError::InvalidVmName {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if name.len() > MAX_IPTABLES_CHAIN_LEN {
            return Err(invalid("name does not fit in an iptables chain name"));
        }
        if name
            .chars()
            .any(|c| c.is_whitespace() || c == ',' || c == '/' || c == ':')
        {
            return Err(invalid("name contains whitespace, ',', '/' or ':'"));
        }
        if name.ends_with("-def") {
            return Err(invalid("name collides with default chain naming"));
        }

        let vm = Self(name.clone());
        if vm.default_chain().len() > MAX_IPTABLES_CHAIN_LEN {
            return Err(invalid("default chain name does not fit in an iptables chain name"));
        }
        if vm.ebtables_out_chain().len() > MAX_EBTABLES_CHAIN_LEN {
            return Err(invalid("bridge-filter chain names do not fit in an ebtables chain name"));
        }

        Ok(vm)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn role(&self) -> Option<VmRole> {
        VmRole::from_prefix(&self.0)
    }

    /// Packet-filter chain holding the VM's ingress rules.
    pub fn chain(&self) -> &str {
        &self.0
    }

    /// Chain shared by the VM's default rules: the name without its last
    /// `-segment`, suffixed with `-def`.
    pub fn default_chain(&self) -> String {
        match self.0.rsplit_once('-') {
            Some((head, _)) if !head.is_empty() => format!("{}-def", head),
            _ => format!("{}-def", self.0),
        }
    }

    pub fn ebtables_in_chain(&self) -> String {
        format!("{}-in", self.0)
    }

    pub fn ebtables_out_chain(&self) -> String {
        format!("{}-out", self.0)
    }

    /// Whether a packet-filter chain name follows the VM isolation chain
    /// convention (role prefix, not a `-def` chain).
    pub fn is_isolation_chain(chain: &str) -> bool {
        VmRole::from_prefix(chain).is_some() && !chain.ends_with("-def")
    }
}

impl fmt::Display for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VmName {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for VmName {
    type Error = FirewallError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<VmName> for String {
    fn from(value: VmName) -> Self {
        value.0
    }
}

/// Ethernet address, rendered lowercase colon-separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FirewallError::InvalidRecordField {
            field: "vm_mac",
            value: s.to_string(),
        };

        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Network attributes of a guest, supplied fresh on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmNetwork {
    pub vm_name: VmName,
    pub vm_id: u64,
    pub vm_ip: Option<IpAddr>,
    pub vm_mac: MacAddr,
    pub vif: String,
    pub bridge_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_chain_drops_last_segment() {
        let name = VmName::new("i-2-10-VM").unwrap();
        assert_eq!(name.default_chain(), "i-2-10-def");
        assert_eq!(name.ebtables_in_chain(), "i-2-10-VM-in");
        assert_eq!(name.ebtables_out_chain(), "i-2-10-VM-out");

        let router = VmName::new("r-4-VM").unwrap();
        assert_eq!(router.default_chain(), "r-4-def");
        assert_eq!(router.role(), Some(VmRole::Router));
    }

    #[test]
    fn rejects_names_that_break_records_or_chains() {
        assert!(VmName::new("").is_err());
        assert!(VmName::new("i-2,10-VM").is_err());
        assert!(VmName::new("i-2 10").is_err());
        assert!(VmName::new("i-2-10-def").is_err());
        assert!(VmName::new("i-".repeat(15)).is_err());
    }

    #[test]
    fn derived_chain_names_stay_within_tool_limits() {
        // 28 characters: fits iptables, but `-out` would be 32.
        let long = format!("i-2-10-{}", "V".repeat(21));
        assert_eq!(long.len(), 28);
        assert!(VmName::new(long).is_err());

        let longest = format!("i-2-10-{}", "V".repeat(20));
        let name = VmName::new(longest).unwrap();
        assert_eq!(name.ebtables_out_chain().len(), MAX_EBTABLES_CHAIN_LEN);
        assert!(name.default_chain().len() <= MAX_IPTABLES_CHAIN_LEN);

        // A one-character last segment makes `-def` longer than the name.
        let tail = format!("i-{}-X", "2".repeat(22));
        assert_eq!(VmName::new(tail).unwrap().default_chain().len(), 28);
        let tail = format!("i-{}-X", "2".repeat(23));
        assert_eq!(tail.len(), 27);
        assert!(VmName::new(tail).is_err());
    }

    #[test]
    fn isolation_chain_convention() {
        assert!(VmName::is_isolation_chain("i-2-10-VM"));
        assert!(VmName::is_isolation_chain("v-7-VM"));
        assert!(!VmName::is_isolation_chain("i-2-10-def"));
        assert!(!VmName::is_isolation_chain("BF-cloudbr0"));
        assert!(!VmName::is_isolation_chain("FORWARD"));
    }

    #[test]
    fn mac_parses_and_normalizes() {
        let mac: MacAddr = "06:AB:00:12:34:5f".parse().unwrap();
        assert_eq!(mac.to_string(), "06:ab:00:12:34:5f");

        assert!("06:ab:00:12:34".parse::<MacAddr>().is_err());
        assert!("06:ab:00:12:34:5f:00".parse::<MacAddr>().is_err());
        assert!("06-ab-00-12-34-5f".parse::<MacAddr>().is_err());
    }
}

use crate::error::Result;
use crate::vm::VmName;

/// Read-only view of the domains running on this host.
pub trait Hypervisor: Send + Sync {
    /// Current domain id of a running VM. Changes when the VM restarts.
    fn dom_id(&self, vm_name: &VmName) -> Result<u32>;

    /// Names of all running domains.
    fn running_vms(&self) -> Result<Vec<String>>;

    fn is_running(&self, vm_name: &str) -> Result<bool> {
        Ok(self.running_vms()?.iter().any(|name| name == vm_name))
    }
}

impl<T: Hypervisor + ?Sized> Hypervisor for &T {
    fn dom_id(&self, vm_name: &VmName) -> Result<u32> {
        (**self).dom_id(vm_name)
    }

    fn running_vms(&self) -> Result<Vec<String>> {
        (**self).running_vms()
    }
}

impl<T: Hypervisor + ?Sized> Hypervisor for std::sync::Arc<T> {
    fn dom_id(&self, vm_name: &VmName) -> Result<u32> {
        (**self).dom_id(vm_name)
    }

    fn running_vms(&self) -> Result<Vec<String>> {
        (**self).running_vms()
    }
}

use std::collections::BTreeSet;

use anyhow::Error;
use serde_json::Value;

use proxmox_section_config::SectionConfigData;

use crate::cluster::GuestType;

/// Access to the configuration and file systems of one guest type.
///
/// Guest configuration stays opaque to the storage layer, apart from the
/// `replicate` flag set when replication is enabled.
pub trait GuestAccessor: Send + Sync {
    fn guest_type(&self) -> GuestType;

    fn load_config(&self, vmid: u32) -> Result<Value, Error>;

    fn write_config(&self, vmid: u32, config: &Value) -> Result<(), Error>;

    /// Volume IDs of all volumes of the guest which should be replicated.
    fn get_replicatable_volumes(
        &self,
        storage_cfg: &SectionConfigData,
        vmid: u32,
        config: &Value,
    ) -> Result<BTreeSet<String>, Error>;

    /// Flush and freeze guest file systems (e.g. through a guest agent).
    fn freeze_filesystem(&self, _vmid: u32) -> Result<(), Error> {
        Ok(())
    }

    fn thaw_filesystem(&self, _vmid: u32) -> Result<(), Error> {
        Ok(())
    }
}

//! Cluster membership and guest placement, as seen by the storage layer.

use std::collections::BTreeMap;

use anyhow::Error;
use serde::{Deserialize, Serialize};

/// Guest type, selects the matching [`GuestAccessor`](crate::replication::GuestAccessor).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    /// QEMU virtual machine
    Qemu,
    /// LXC container
    Lxc,
}

serde_plain::derive_display_from_serialize!(GuestType);
serde_plain::derive_fromstr_from_deserialize!(GuestType);

/// Entry of the cluster wide guest list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmListEntry {
    #[serde(rename = "type")]
    pub guest_type: GuestType,
    /// Node the guest currently lives on.
    pub node: String,
}

/// Read mostly cluster metadata.
pub trait ClusterInfo: Send + Sync {
    /// Name of this node.
    fn local_node(&self) -> &str;

    /// All guests of the cluster.
    fn get_vmlist(&self) -> Result<BTreeMap<u32, VmListEntry>, Error>;

    /// Address used to reach `node` (e.g. via SSH).
    fn remote_node_ip(&self, node: &str) -> Result<String, Error>;
}

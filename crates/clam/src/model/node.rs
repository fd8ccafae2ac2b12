//! Execution nodes and the image/profile catalog.

use serde::{Deserialize, Serialize};

/// Maintenance status of a node.
///
/// This column is operator-controlled. Liveness comes from heartbeat keys in
/// the ephemeral store, never from this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Accepting new sandboxes.
    Online,
    /// Known to be down.
    Offline,
    /// Finishing existing sandboxes, accepting none.
    Draining,
    /// Administratively removed.
    Disabled,
}

/// An execution host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Identifier.
    pub id: String,
    /// Maintenance status.
    pub status: NodeStatus,
    /// Maximum concurrent VMs.
    pub slots_total: u32,
}

/// A bootable VM image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Identifier.
    pub id: String,
    /// Name callers refer to, e.g. `ubuntu-22.04`.
    pub name: String,
}

/// A VM resource shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Identifier.
    pub id: String,
    /// Name callers refer to, e.g. `small`.
    pub name: String,
    /// Virtual CPUs.
    pub vcpu_count: u32,
    /// Guest memory.
    pub memory_mib: u32,
    /// Root disk.
    pub disk_gib: u32,
}

impl Profile {
    /// The built-in `small`, `medium` and `large` shapes.
    pub fn builtin() -> Vec<Profile> {
        [("small", 2, 4096, 10), ("medium", 4, 8192, 20), ("large", 8, 16384, 40)]
            .into_iter()
            .map(|(name, vcpu_count, memory_mib, disk_gib)| Profile {
                id: format!("{}{name}", crate::ids::PROFILE_PREFIX),
                name: name.to_string(),
                vcpu_count,
                memory_mib,
                disk_gib,
            })
            .collect()
    }
}

//! Fork tree construction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Sandbox, SandboxStatus};

/// One sandbox in a fork tree, with its direct children by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkTreeNode {
    /// Sandbox id.
    pub sandbox_id: String,
    /// Current status.
    pub status: SandboxStatus,
    /// Parent id, `None` for the root.
    pub forked_from: Option<String>,
    /// When the fork was created, `None` for the root.
    pub forked_at: Option<DateTime<Utc>>,
    /// Direct children, oldest first.
    pub children: Vec<String>,
}

/// Every sandbox sharing a root, keyed at that root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkTree {
    /// The root sandbox id.
    pub root: String,
    /// All members, root first, then in creation order.
    pub tree: Vec<ForkTreeNode>,
}

impl ForkTree {
    /// Look up a member.
    pub fn node(&self, sandbox_id: &str) -> Option<&ForkTreeNode> {
        self.tree.iter().find(|node| node.sandbox_id == sandbox_id)
    }
}

/// Children of every parent, each list in creation order.
pub(crate) fn children_index(members: &[Sandbox]) -> HashMap<&str, Vec<&Sandbox>> {
    let mut index: HashMap<&str, Vec<&Sandbox>> = HashMap::with_capacity(members.len());
    for sandbox in members {
        if let Some(parent) = sandbox.forked_from.as_deref() {
            index.entry(parent).or_default().push(sandbox);
        }
    }
    for children in index.values_mut() {
        children.sort_by(|a, b| a.id.cmp(&b.id));
    }
    index
}

/// Find the member with no parent.
pub(crate) fn find_root(members: &[Sandbox]) -> Option<&Sandbox> {
    members.iter().find(|sandbox| sandbox.is_root())
}

/// Build the flat tree from every member of one fork tree.
///
/// Returns `None` if no member is a root.
pub(crate) fn build(members: &[Sandbox]) -> Option<ForkTree> {
    let root = find_root(members)?;
    let index = children_index(members);

    let mut ordered: Vec<&Sandbox> = members.iter().collect();
    ordered.sort_by(|a, b| (!a.is_root(), &a.id).cmp(&(!b.is_root(), &b.id)));

    let tree = ordered
        .into_iter()
        .map(|sandbox| ForkTreeNode {
            sandbox_id: sandbox.id.clone(),
            status: sandbox.status,
            forked_from: sandbox.forked_from.clone(),
            forked_at: sandbox.forked_from.as_ref().map(|_| sandbox.created_at),
            children: index
                .get(sandbox.id.as_str())
                .map(|children| children.iter().map(|c| c.id.clone()).collect())
                .unwrap_or_default(),
        })
        .collect();

    Some(ForkTree {
        root: root.id.clone(),
        tree,
    })
}

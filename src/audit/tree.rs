//! Version Tree
//!
//! In-memory view of the audit log entries stored for one document. Every
//! version of the document shares the prefix of history it has in common with
//! the other versions; versions diverge where their edits differ. Nodes live in
//! an arena and reference each other by index, so reachability questions are
//! set operations over node ids.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::models::{TreeRow, VersionPointerRow};

/// Parent hash stored for the first entry of every chain.
pub const NULL_SENTINEL: &str = "(null)";

pub type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Surrogate key of the persisted entry; 0 for the synthetic root.
    pub entry_id: i64,
    pub entry_hash: String,
    pub parent: Option<NodeId>,
    pub depth: usize,
    children: HashMap<String, NodeId>,
    versions: Vec<i64>,
}

impl TreeNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Versions whose history terminates at this node.
    pub fn versions(&self) -> &[i64] {
        &self.versions
    }
}

#[derive(Debug, Clone)]
pub struct VersionTree {
    document_guid: Uuid,
    nodes: Vec<TreeNode>,
    by_hash: HashMap<String, NodeId>,
    by_entry_id: HashMap<i64, NodeId>,
    version_index: BTreeMap<i64, NodeId>,
}

impl VersionTree {
    /// A tree holding only the root.
    pub fn new(document_guid: Uuid) -> Self {
        let root = TreeNode {
            entry_id: 0,
            entry_hash: NULL_SENTINEL.to_string(),
            parent: None,
            depth: 0,
            children: HashMap::new(),
            versions: Vec::new(),
        };
        Self {
            document_guid,
            nodes: vec![root],
            by_hash: HashMap::new(),
            by_entry_id: HashMap::new(),
            version_index: BTreeMap::new(),
        }
    }

    /// Rebuild the tree from stored rows and version pointers.
    ///
    /// Rows are attached in depth order; a row whose parent cannot be
    /// resolved is left out.
    pub fn from_rows(
        document_guid: Uuid,
        mut rows: Vec<TreeRow>,
        pointers: Vec<VersionPointerRow>,
    ) -> Self {
        let mut tree = Self::new(document_guid);
        rows.sort_by_key(|row| row.depth);

        for row in rows {
            if tree.by_hash.contains_key(&row.entry_hash) {
                continue;
            }
            let parent = if row.parent_entry_hash == NULL_SENTINEL {
                Some(ROOT)
            } else {
                tree.find_by_hash(&row.parent_entry_hash)
            };
            match parent {
                Some(parent) => {
                    tree.add_child(parent, row.entry_id, &row.entry_hash);
                }
                None => warn!(
                    "Audit log entry {} references unknown parent {}; leaving it out of the tree",
                    row.entry_id, row.parent_entry_hash
                ),
            }
        }

        for pointer in pointers {
            match tree.find_by_entry_id(pointer.entry_id) {
                Some(node) => tree.tag_version(node, pointer.version_id),
                None => warn!(
                    "Version {} points at audit log entry {} which is not in the tree",
                    pointer.version_id, pointer.entry_id
                ),
            }
        }

        debug!(
            "Rebuilt audit log tree for {}: {} nodes, {} versions",
            document_guid,
            tree.tree_size(),
            tree.version_index.len()
        );
        tree
    }

    pub fn document_guid(&self) -> Uuid {
        self.document_guid
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id]
    }

    /// Number of nodes including the root.
    pub fn tree_size(&self) -> usize {
        self.nodes.len()
    }

    pub fn child_by_hash(&self, parent: NodeId, entry_hash: &str) -> Option<NodeId> {
        self.nodes[parent].children.get(entry_hash).copied()
    }

    pub fn find_by_hash(&self, entry_hash: &str) -> Option<NodeId> {
        self.by_hash.get(entry_hash).copied()
    }

    pub fn find_by_entry_id(&self, entry_id: i64) -> Option<NodeId> {
        self.by_entry_id.get(&entry_id).copied()
    }

    /// Children of `id` ordered by entry id.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut children: Vec<NodeId> = self.nodes[id].children.values().copied().collect();
        children.sort_by_key(|child| self.nodes[*child].entry_id);
        children
    }

    /// Attach a node under `parent`. An existing child with the same hash is returned as is.
    pub fn add_child(&mut self, parent: NodeId, entry_id: i64, entry_hash: &str) -> NodeId {
        if let Some(existing) = self.child_by_hash(parent, entry_hash) {
            return existing;
        }
        let id = self.nodes.len();
        let depth = self.nodes[parent].depth + 1;
        self.nodes.push(TreeNode {
            entry_id,
            entry_hash: entry_hash.to_string(),
            parent: Some(parent),
            depth,
            children: HashMap::new(),
            versions: Vec::new(),
        });
        self.nodes[parent].children.insert(entry_hash.to_string(), id);
        self.by_hash.insert(entry_hash.to_string(), id);
        self.by_entry_id.insert(entry_id, id);
        id
    }

    /// Point `version_id` at `node`, moving it off any node it pointed at before.
    pub fn tag_version(&mut self, node: NodeId, version_id: i64) {
        if let Some(previous) = self.version_index.insert(version_id, node) {
            self.nodes[previous].versions.retain(|v| *v != version_id);
        }
        if !self.nodes[node].versions.contains(&version_id) {
            self.nodes[node].versions.push(version_id);
        }
    }

    pub fn version_terminal(&self, version_id: i64) -> Option<NodeId> {
        self.version_index.get(&version_id).copied()
    }

    /// All version pointers, ordered by version id.
    pub fn versions(&self) -> impl Iterator<Item = (i64, NodeId)> + '_ {
        self.version_index.iter().map(|(v, n)| (*v, *n))
    }

    pub fn version_count(&self) -> usize {
        self.version_index.len()
    }

    /// Node ids from the root down to `id`, both included.
    pub fn path_to(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(parent) = self.nodes[current].parent {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }

    pub fn version_path(&self, version_id: i64) -> Option<Vec<NodeId>> {
        self.version_terminal(version_id).map(|terminal| self.path_to(terminal))
    }

    /// Entry hashes along a version's history, oldest first, root excluded.
    pub fn path_hashes(&self, version_id: i64) -> Option<Vec<&str>> {
        self.version_path(version_id).map(|path| {
            path.into_iter()
                .skip(1)
                .map(|id| self.nodes[id].entry_hash.as_str())
                .collect()
        })
    }

    /// Nodes referenced by `version_id` and by no other version, deepest first.
    ///
    /// A node is referenced by a version when it lies on the path from the
    /// root to that version's terminal node. Unreferenced descendants of an
    /// exclusive node are included so that no subtree is left without a parent.
    pub fn exclusive_nodes(&self, version_id: i64) -> Vec<NodeId> {
        let Some(terminal) = self.version_terminal(version_id) else {
            return Vec::new();
        };

        let shared: HashSet<NodeId> = self
            .version_index
            .iter()
            .filter(|(v, _)| **v != version_id)
            .flat_map(|(_, node)| self.path_to(*node))
            .collect();

        let mut stack: Vec<NodeId> = self
            .path_to(terminal)
            .into_iter()
            .filter(|id| *id != ROOT && !shared.contains(id))
            .collect();
        let mut seen = HashSet::new();
        let mut exclusive = Vec::new();

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            exclusive.push(id);
            stack.extend(
                self.nodes[id]
                    .children
                    .values()
                    .copied()
                    .filter(|child| !shared.contains(child)),
            );
        }

        exclusive.sort_by(|a, b| self.nodes[*b].depth.cmp(&self.nodes[*a].depth));
        exclusive
    }

    /// Number of entries that lie on the history of two or more versions.
    pub fn shared_entry_count(&self) -> usize {
        let mut references: HashMap<NodeId, usize> = HashMap::new();
        for (_, terminal) in self.versions() {
            for id in self.path_to(terminal).into_iter().skip(1) {
                *references.entry(id).or_insert(0) += 1;
            }
        }
        references.values().filter(|count| **count > 1).count()
    }

    /// Leaves that no version points at. These indicate interrupted writes or corruption.
    pub fn dangling_leaves(&self) -> Vec<NodeId> {
        (1..self.nodes.len())
            .filter(|id| self.nodes[*id].children.is_empty() && self.nodes[*id].versions.is_empty())
            .collect()
    }

    /// Depth-first walk from the root without recursion.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            order.push(id);
            let mut children = self.children(id);
            children.reverse();
            stack.extend(children);
        }
        order
    }
}

//! In-memory model of a VM's snapshot forest.
//!
//! The tree is rebuilt from a flat remote listing and then patched after each
//! successful mutation. Both paths end in `check_invariants`: no cycles, every
//! non-root has its parent present, at most one current node.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use vm_core::error::{ObjectKind, Result, VmError};
use vm_provider::{InventoryRef, RawSnapshot};

/// One point-in-time state of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotNode {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub includes_memory: bool,
    pub quiesced: bool,
    pub owner_vm: InventoryRef,
    pub parent_id: Option<String>,
    /// Creation order, oldest first
    pub child_ids: Vec<String>,
    pub is_current: bool,
}

impl SnapshotNode {
    fn from_raw(vm: &InventoryRef, raw: RawSnapshot) -> Self {
        Self {
            id: raw.id,
            name: raw.name,
            description: raw.description,
            created_at: raw.created_at,
            includes_memory: raw.includes_memory,
            quiesced: raw.quiesced,
            owner_vm: vm.clone(),
            parent_id: raw.parent_id,
            child_ids: Vec::new(),
            is_current: raw.is_current,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A node together with its depth in a pre-order walk.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TreeEntry<'a> {
    pub depth: usize,
    pub node: &'a SnapshotNode,
}

/// Structural view of one node, used to compare two trees for drift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeShape {
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
    pub is_current: bool,
}

/// Snapshot forest of a single VM.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotTree {
    vm: InventoryRef,
    nodes: HashMap<String, SnapshotNode>,
    roots: Vec<String>,
    current: Option<String>,
}

impl SnapshotTree {
    /// An empty tree for `vm`.
    pub fn empty(vm: InventoryRef) -> Self {
        Self {
            vm,
            nodes: HashMap::new(),
            roots: Vec::new(),
            current: None,
        }
    }

    /// Rebuild the forest from a flat remote listing.
    ///
    /// Fails with `CorruptTree` on duplicate ids, dangling parents, cycles or
    /// more than one current marker. Nothing is repaired.
    pub fn from_raw(vm: InventoryRef, raw: Vec<RawSnapshot>) -> Result<Self> {
        let mut tree = Self::empty(vm);

        for snapshot in raw {
            if tree.nodes.contains_key(&snapshot.id) {
                return Err(tree.corrupt(format!("duplicate snapshot id '{}'", snapshot.id)));
            }
            let node = SnapshotNode::from_raw(&tree.vm, snapshot);
            tree.nodes.insert(node.id.clone(), node);
        }

        let mut current: Vec<String> = tree
            .nodes
            .values()
            .filter(|n| n.is_current)
            .map(|n| n.id.clone())
            .collect();
        if current.len() > 1 {
            current.sort();
            return Err(tree.corrupt(format!(
                "{} snapshots marked current: {}",
                current.len(),
                current.join(", ")
            )));
        }
        tree.current = current.pop();

        for node in tree.nodes.values() {
            if let Some(parent_id) = &node.parent_id {
                if !tree.nodes.contains_key(parent_id) {
                    return Err(tree.corrupt(format!(
                        "snapshot '{}' references missing parent '{}'",
                        node.id, parent_id
                    )));
                }
            }
        }
        tree.detect_cycles()?;

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut roots = Vec::new();
        for node in tree.nodes.values() {
            match &node.parent_id {
                Some(parent_id) => children
                    .entry(parent_id.clone())
                    .or_default()
                    .push(node.id.clone()),
                None => roots.push(node.id.clone()),
            }
        }
        for (parent_id, mut child_ids) in children {
            tree.order(&mut child_ids);
            if let Some(parent) = tree.nodes.get_mut(&parent_id) {
                parent.child_ids = child_ids;
            }
        }
        tree.order(&mut roots);
        tree.roots = roots;

        tree.check_invariants()?;
        Ok(tree)
    }

    pub fn vm(&self) -> &InventoryRef {
        &self.vm
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&SnapshotNode> {
        self.nodes.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn current(&self) -> Option<&SnapshotNode> {
        self.current.as_deref().and_then(|id| self.nodes.get(id))
    }

    /// Root nodes in creation order.
    pub fn roots(&self) -> impl Iterator<Item = &SnapshotNode> {
        self.roots.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Append `node` under the current node (or as a new root when there is
    /// no current node) and make it current.
    pub fn apply_create(&mut self, mut node: SnapshotNode) -> Result<&SnapshotNode> {
        if self.nodes.contains_key(&node.id) {
            return Err(self.corrupt(format!("snapshot '{}' already present", node.id)));
        }

        let id = node.id.clone();
        node.owner_vm = self.vm.clone();
        node.parent_id = self.current.clone();
        node.child_ids.clear();
        node.is_current = true;

        if let Some(previous) = self.current.take() {
            if let Some(prev) = self.nodes.get_mut(&previous) {
                prev.is_current = false;
            }
        }

        let parent_id = node.parent_id.clone();
        self.nodes.insert(id.clone(), node);
        self.attach(parent_id.as_deref(), std::slice::from_ref(&id));
        self.current = Some(id.clone());

        Ok(&self.nodes[&id])
    }

    /// Remove a snapshot.
    ///
    /// Without `cascade` exactly one node goes and its children move up to
    /// the former parent (roots when there is none). With `cascade` the whole
    /// subtree goes. A removed current marker moves to the former parent, or
    /// is unset when the removed node was a root. Returns the removed nodes
    /// in pre-order.
    pub fn apply_delete(&mut self, id: &str, cascade: bool) -> Result<Vec<SnapshotNode>> {
        let target = self
            .nodes
            .get(id)
            .ok_or_else(|| VmError::not_found(ObjectKind::Snapshot, id))?;
        let parent_id = target.parent_id.clone();
        let orphans = target.child_ids.clone();

        let removed_ids = if cascade {
            self.subtree_ids(id)
        } else {
            vec![id.to_string()]
        };
        let current_removed = self
            .current
            .as_ref()
            .is_some_and(|current| removed_ids.contains(current));

        self.detach(parent_id.as_deref(), id);

        let mut removed = Vec::with_capacity(removed_ids.len());
        for removed_id in &removed_ids {
            if let Some(node) = self.nodes.remove(removed_id) {
                removed.push(node);
            }
        }

        if !cascade {
            for child_id in &orphans {
                if let Some(child) = self.nodes.get_mut(child_id) {
                    child.parent_id = parent_id.clone();
                }
            }
            self.attach(parent_id.as_deref(), &orphans);
        }

        if current_removed {
            self.current = parent_id.clone();
            if let Some(parent) = parent_id.and_then(|p| self.nodes.get_mut(&p)) {
                parent.is_current = true;
            }
        }

        Ok(removed)
    }

    /// Drop every node. Current becomes unset.
    pub fn clear(&mut self) -> Vec<SnapshotNode> {
        self.roots.clear();
        self.current = None;
        let mut removed: Vec<SnapshotNode> = self.nodes.drain().map(|(_, n)| n).collect();
        removed.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        removed
    }

    /// Move the current marker without touching the shape.
    pub fn apply_revert(&mut self, id: &str) -> Result<&SnapshotNode> {
        if !self.nodes.contains_key(id) {
            return Err(VmError::not_found(ObjectKind::Snapshot, id));
        }
        if let Some(previous) = self.current.take() {
            if let Some(prev) = self.nodes.get_mut(&previous) {
                prev.is_current = false;
            }
        }
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| VmError::not_found(ObjectKind::Snapshot, id))?;
        node.is_current = true;
        self.current = Some(id.to_string());
        Ok(node)
    }

    /// Exact-name lookup. Snapshot names are not unique, so several matches
    /// are an error listing every candidate rather than a guess.
    pub fn find_by_name(&self, name: &str) -> Result<Option<&SnapshotNode>> {
        let mut matches: Vec<&SnapshotNode> =
            self.nodes.values().filter(|n| n.name == name).collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            _ => {
                matches.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
                Err(VmError::Ambiguous {
                    kind: ObjectKind::Snapshot,
                    name: name.to_string(),
                    candidates: matches.iter().map(|n| n.id.clone()).collect(),
                })
            }
        }
    }

    /// The node itself first, its root last.
    pub fn path_to_root(&self, id: &str) -> Result<Vec<&SnapshotNode>> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(current_id) = cursor {
            let node = self
                .nodes
                .get(current_id)
                .ok_or_else(|| VmError::not_found(ObjectKind::Snapshot, current_id))?;
            if path.len() > self.nodes.len() {
                return Err(self.corrupt(format!("cycle through '{}'", current_id)));
            }
            path.push(node);
            cursor = node.parent_id.as_deref();
        }
        Ok(path)
    }

    /// Ids of `id` and all its descendants, pre-order.
    pub fn subtree_ids(&self, id: &str) -> Vec<String> {
        let mut ids = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.get(&next) {
                stack.extend(node.child_ids.iter().rev().cloned());
                ids.push(next);
            }
        }
        ids
    }

    /// Pre-order walk, roots and children oldest first.
    pub fn walk(&self) -> Vec<TreeEntry<'_>> {
        let mut entries = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(usize, &str)> =
            self.roots.iter().rev().map(|id| (0, id.as_str())).collect();
        while let Some((depth, id)) = stack.pop() {
            if let Some(node) = self.nodes.get(id) {
                entries.push(TreeEntry { depth, node });
                stack.extend(node.child_ids.iter().rev().map(|c| (depth + 1, c.as_str())));
            }
        }
        entries
    }

    /// All nodes sorted by creation time.
    pub fn chronological(&self) -> Vec<&SnapshotNode> {
        let mut nodes: Vec<&SnapshotNode> = self.nodes.values().collect();
        nodes.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        nodes
    }

    pub fn shape(&self) -> BTreeMap<String, NodeShape> {
        self.nodes
            .values()
            .map(|n| {
                (
                    n.id.clone(),
                    NodeShape {
                        parent_id: n.parent_id.clone(),
                        child_ids: n.child_ids.clone(),
                        is_current: n.is_current,
                    },
                )
            })
            .collect()
    }

    pub fn same_shape(&self, other: &SnapshotTree) -> bool {
        self.roots == other.roots && self.current == other.current && self.shape() == other.shape()
    }

    /// Verify every structural invariant. Shared by `from_raw` and by every
    /// incremental patch before it is committed.
    pub fn check_invariants(&self) -> Result<()> {
        let marked: Vec<&str> = self
            .nodes
            .values()
            .filter(|n| n.is_current)
            .map(|n| n.id.as_str())
            .collect();
        if marked.len() > 1 {
            return Err(self.corrupt(format!("{} snapshots marked current", marked.len())));
        }
        if marked.first().copied() != self.current.as_deref() {
            return Err(self.corrupt("current pointer disagrees with node markers"));
        }

        for node in self.nodes.values() {
            match &node.parent_id {
                Some(parent_id) => {
                    let parent = self.nodes.get(parent_id).ok_or_else(|| {
                        self.corrupt(format!(
                            "snapshot '{}' references missing parent '{}'",
                            node.id, parent_id
                        ))
                    })?;
                    if !parent.child_ids.contains(&node.id) {
                        return Err(self.corrupt(format!(
                            "snapshot '{}' is not listed under its parent '{}'",
                            node.id, parent_id
                        )));
                    }
                }
                None => {
                    if !self.roots.contains(&node.id) {
                        return Err(self.corrupt(format!("root '{}' is not listed", node.id)));
                    }
                }
            }
            for child_id in &node.child_ids {
                let child = self.nodes.get(child_id).ok_or_else(|| {
                    self.corrupt(format!("'{}' lists missing child '{}'", node.id, child_id))
                })?;
                if child.parent_id.as_deref() != Some(node.id.as_str()) {
                    return Err(self.corrupt(format!(
                        "'{}' lists '{}' whose parent is elsewhere",
                        node.id, child_id
                    )));
                }
            }
        }

        for root_id in &self.roots {
            match self.nodes.get(root_id) {
                Some(root) if root.parent_id.is_none() => {}
                _ => return Err(self.corrupt(format!("'{}' is listed as a root", root_id))),
            }
        }

        self.detect_cycles()
    }

    fn detect_cycles(&self) -> Result<()> {
        let mut acyclic: HashSet<&str> = HashSet::new();
        for start in self.nodes.keys() {
            let mut path: HashSet<&str> = HashSet::new();
            let mut cursor = Some(start.as_str());
            while let Some(id) = cursor {
                if acyclic.contains(id) {
                    break;
                }
                if !path.insert(id) {
                    return Err(self.corrupt(format!("parent cycle through '{}'", id)));
                }
                cursor = self.nodes.get(id).and_then(|n| n.parent_id.as_deref());
            }
            acyclic.extend(path);
        }
        Ok(())
    }

    // Child lists and roots are kept in creation order; ties break on id so
    // repeated loads of the same state render identically.
    fn order(&self, ids: &mut [String]) {
        ids.sort_by(|a, b| {
            let key = |id: &String| self.nodes.get(id).map(|n| n.created_at);
            key(a).cmp(&key(b)).then_with(|| a.cmp(b))
        });
    }

    fn attach(&mut self, parent_id: Option<&str>, ids: &[String]) {
        let mut list = match parent_id {
            Some(p) => self
                .nodes
                .get_mut(p)
                .map(|n| std::mem::take(&mut n.child_ids))
                .unwrap_or_default(),
            None => std::mem::take(&mut self.roots),
        };
        list.extend(ids.iter().cloned());
        self.order(&mut list);
        match parent_id {
            Some(p) => {
                if let Some(parent) = self.nodes.get_mut(p) {
                    parent.child_ids = list;
                }
            }
            None => self.roots = list,
        }
    }

    fn detach(&mut self, parent_id: Option<&str>, id: &str) {
        match parent_id.and_then(|p| self.nodes.get_mut(p)) {
            Some(parent) => parent.child_ids.retain(|c| c != id),
            None => self.roots.retain(|r| r != id),
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> VmError {
        VmError::corrupt_tree(self.vm.id.clone(), reason)
    }
}

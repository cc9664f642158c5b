//! Hierarchical view arena.
//!
//! Nodes are stored flat, keyed by id, with parent and child links. Child
//! lists are reconciled against fresh query results by id so local-only
//! attributes, expansion in particular, survive a refresh. A row that
//! vanished from the result cascades its whole subtree out of the arena and
//! the removed ids are reported so selection mirrors can drop them.
//!
//! Collapsing is purely local: the children are discarded and the next
//! expand queries them again.

use std::collections::{HashMap, HashSet};

use crate::node::{self, IndexRow};
use crate::types::{IndexState, NodeId, SortKey, SortOrder};

pub struct TreeNode {
    pub row: IndexRow,
    pub parent: Option<NodeId>,
    pub expanded: bool,
    children: Vec<NodeId>,
}

impl TreeNode {
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileDelta {
    pub inserted: usize,
    pub updated: usize,
    /// Ids dropped from the arena, descendants included.
    pub removed: Vec<NodeId>,
}

/// One visible line of the rendered tree.
pub struct VisibleRow<'a> {
    pub depth: usize,
    pub node: &'a TreeNode,
}

#[derive(Default)]
pub struct TreeArena {
    nodes: HashMap<NodeId, TreeNode>,
    roots: Vec<NodeId>,
}

impl TreeArena {
    pub fn new() -> TreeArena {
        TreeArena::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    pub fn row(&self, id: NodeId) -> Option<&IndexRow> {
        self.nodes.get(&id).map(|n| &n.row)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Replace the child list of `parent` (`None` for the root level) with
    /// `fresh`, keyed by id. Existing nodes keep their expansion state and
    /// any already-loaded descendants; nodes missing from `fresh` are
    /// removed together with their subtrees. A row that arrives under a new
    /// parent is reattached and leaves its previous child list.
    pub fn reconcile_children(
        &mut self,
        parent: Option<NodeId>,
        mut fresh: Vec<IndexRow>,
        key: SortKey,
        order: SortOrder,
    ) -> ReconcileDelta {
        let mut delta = ReconcileDelta::default();
        if let Some(p) = parent {
            if !self.nodes.contains_key(&p) {
                return delta;
            }
        }

        fresh.sort_by(|a, b| node::compare(a, b, key, order));
        let fresh_ids: HashSet<NodeId> = fresh.iter().map(|r| r.id()).collect();

        let existing: Vec<NodeId> = match parent {
            None => self.roots.clone(),
            Some(p) => self.nodes[&p].children.clone(),
        };
        for id in existing {
            if !fresh_ids.contains(&id) {
                self.remove_subtree(id, &mut delta.removed);
            }
        }

        let ordered: Vec<NodeId> = fresh.iter().map(|r| r.id()).collect();
        for row in fresh {
            let id = row.id();
            match self.nodes.get_mut(&id) {
                Some(existing) => {
                    let previous = existing.parent;
                    existing.row = row;
                    existing.parent = parent;
                    delta.updated += 1;
                    if previous != parent {
                        self.detach(previous, id);
                    }
                }
                None => {
                    self.nodes.insert(
                        id,
                        TreeNode {
                            row,
                            parent,
                            expanded: false,
                            children: Vec::new(),
                        },
                    );
                    delta.inserted += 1;
                }
            }
        }

        match parent {
            None => self.roots = ordered,
            Some(p) => {
                if let Some(node) = self.nodes.get_mut(&p) {
                    node.children = ordered;
                }
            }
        }
        delta
    }

    fn remove_subtree(&mut self, id: NodeId, removed: &mut Vec<NodeId>) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                removed.push(current);
                stack.extend(node.children);
            }
        }
    }

    /// Drop `id` from its former holder's child list (or the roots) without
    /// touching the node itself.
    fn detach(&mut self, holder: Option<NodeId>, id: NodeId) {
        let list = match holder {
            None => &mut self.roots,
            Some(p) => match self.nodes.get_mut(&p) {
                Some(node) => &mut node.children,
                None => return,
            },
        };
        list.retain(|c| *c != id);
    }

    /// Mark `id` expanded. Returns false when the node is unknown. The
    /// caller queries the children afterwards; collapse discards them, so
    /// every expand fetches fresh data.
    pub fn expand(&mut self, id: NodeId) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.expanded = true;
                true
            }
            None => false,
        }
    }

    /// Collapse `id`, dropping its loaded descendants. Local only: no
    /// removal delta is reported and selections are untouched.
    pub fn collapse(&mut self, id: NodeId) {
        let children = match self.nodes.get_mut(&id) {
            Some(node) => {
                node.expanded = false;
                std::mem::take(&mut node.children)
            }
            None => return,
        };
        let mut discarded = Vec::new();
        for child in children {
            self.remove_subtree(child, &mut discarded);
        }
    }

    /// Depth-first visible rows, descending only into expanded nodes.
    pub fn visible(&self) -> Vec<VisibleRow<'_>> {
        let mut out = Vec::new();
        let mut stack: Vec<(usize, NodeId)> =
            self.roots.iter().rev().map(|id| (0, *id)).collect();
        while let Some((depth, id)) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                out.push(VisibleRow { depth, node });
                if node.expanded {
                    stack.extend(node.children.iter().rev().map(|c| (depth + 1, *c)));
                }
            }
        }
        out
    }

    /// Apply an optimistic state to every arena row in `ids`.
    pub fn set_state(&mut self, ids: &[NodeId], state: IndexState) {
        for node in self.nodes.values_mut() {
            if ids.contains(&node.row.id()) {
                node.row.set_state(state);
            }
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
    }
}

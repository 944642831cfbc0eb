//! The per-session thought tree (C4, §3, §4.1).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

pub type NodeId = String;

/// A single reasoning step, owned by the tree it lives in.
#[derive(Debug, Clone, Serialize)]
pub struct ThoughtNode {
    pub node_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub depth: u32,
    pub thought_number: u64,
    pub thought: String,
    pub is_terminal: bool,
    pub visit_count: u64,
    pub total_value: f64,
    pub branch_id: Option<String>,
    pub is_revision: bool,
    pub revises_thought: Option<u64>,
    pub branch_from_thought: Option<u64>,
    pub created_at: DateTime<Utc>,
    /// Monotonic insertion index, used to break ties deterministically
    /// wherever the spec says "earlier insertion".
    pub(crate) seq: u64,
}

impl ThoughtNode {
    pub fn average_value(&self) -> f64 {
        if self.visit_count > 0 {
            self.total_value / self.visit_count as f64
        } else {
            0.0
        }
    }
}

/// Input to `ThoughtTree::add_thought`.
#[derive(Debug, Clone)]
pub struct AddThoughtData {
    pub thought: String,
    pub thought_number: u64,
    pub next_thought_needed: bool,
    pub is_revision: bool,
    pub revises_thought: Option<u64>,
    pub branch_from_thought: Option<u64>,
    pub branch_id: Option<String>,
}

/// A compact, truncated view of a node, used by `toJSON` and the MCTS path
/// summaries — never the full (unsanitized-length) thought text.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub thought: String,
    pub depth: u32,
    pub visit_count: u64,
    pub average_value: f64,
    pub is_terminal: bool,
    pub is_cursor: bool,
    pub child_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<NodeView>>,
}

fn truncate_display(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}

/// Per-session search tree with a moving cursor.
pub struct ThoughtTree {
    pub session_id: String,
    nodes: HashMap<NodeId, ThoughtNode>,
    root_id: Option<NodeId>,
    cursor_id: Option<NodeId>,
    thought_number_index: HashMap<u64, Vec<NodeId>>,
    pub last_accessed_at: DateTime<Utc>,
    max_nodes: usize,
    next_seq: u64,
}

impl ThoughtTree {
    pub fn new(session_id: impl Into<String>, max_nodes: usize) -> Self {
        Self {
            session_id: session_id.into(),
            nodes: HashMap::new(),
            root_id: None,
            cursor_id: None,
            thought_number_index: HashMap::new(),
            last_accessed_at: Utc::now(),
            max_nodes,
            next_seq: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    pub fn cursor_id(&self) -> Option<&str> {
        self.cursor_id.as_deref()
    }

    pub fn get_node(&self, node_id: &str) -> Option<&ThoughtNode> {
        self.nodes.get(node_id)
    }

    pub fn get_node_mut(&mut self, node_id: &str) -> Option<&mut ThoughtNode> {
        self.nodes.get_mut(node_id)
    }

    fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    /// Resolve the parent for a new node per §4.1's branch/revision/sequential rules.
    fn resolve_parent(&self, data: &AddThoughtData) -> Option<NodeId> {
        if self.nodes.is_empty() {
            return None;
        }

        if let Some(bft) = data.branch_from_thought {
            if let Some(node) = self.find_node_by_thought_number(bft) {
                return Some(node.node_id.clone());
            }
        } else if data.is_revision {
            if let Some(rt) = data.revises_thought {
                if let Some(revised) = self.find_node_by_thought_number(rt) {
                    return Some(match &revised.parent_id {
                        Some(parent) => parent.clone(),
                        None => revised.node_id.clone(),
                    });
                }
            }
        }

        // Sequential default, and the fallback for a failed branch/revision lookup.
        self.cursor_id.clone()
    }

    pub fn add_thought(&mut self, data: AddThoughtData) -> EngineResult<ThoughtNode> {
        let parent_id = self.resolve_parent(&data);
        let depth = match &parent_id {
            None => 0,
            Some(p) => {
                self.nodes
                    .get(p)
                    .ok_or_else(|| EngineError::tree(format!("parent node {p} not found")))?
                    .depth
                    + 1
            }
        };

        let node_id = uuid::Uuid::new_v4().to_string();
        let seq = self.next_seq;
        self.next_seq += 1;

        let node = ThoughtNode {
            node_id: node_id.clone(),
            parent_id: parent_id.clone(),
            children: Vec::new(),
            depth,
            thought_number: data.thought_number,
            thought: data.thought,
            is_terminal: !data.next_thought_needed,
            visit_count: 0,
            total_value: 0.0,
            branch_id: data.branch_id,
            is_revision: data.is_revision,
            revises_thought: data.revises_thought,
            branch_from_thought: data.branch_from_thought,
            created_at: Utc::now(),
            seq,
        };

        if let Some(parent) = &parent_id {
            self.nodes
                .get_mut(parent)
                .expect("parent existence already checked")
                .children
                .push(node_id.clone());
        } else {
            self.root_id = Some(node_id.clone());
        }

        self.thought_number_index
            .entry(node.thought_number)
            .or_default()
            .push(node_id.clone());

        self.nodes.insert(node_id.clone(), node.clone());
        self.cursor_id = Some(node_id);
        self.touch();

        if self.size() > self.max_nodes {
            self.prune();
        }

        Ok(node)
    }

    pub fn set_cursor(&mut self, node_id: &str) -> EngineResult<ThoughtNode> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| EngineError::tree(format!("node {node_id} not found")))?
            .clone();
        self.cursor_id = Some(node_id.to_string());
        self.touch();
        Ok(node)
    }

    /// Ancestor ids of `node_id`, nearest root first, not including `node_id`.
    fn ancestor_ids(&self, node_id: &str) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut current = self.nodes.get(node_id).and_then(|n| n.parent_id.clone());
        while let Some(id) = current {
            ids.push(id.clone());
            current = self.nodes.get(&id).and_then(|n| n.parent_id.clone());
        }
        ids.reverse();
        ids
    }

    pub fn find_node_by_thought_number(&self, thought_number: u64) -> Option<&ThoughtNode> {
        let candidates = self.thought_number_index.get(&thought_number)?;
        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return self.nodes.get(&candidates[0]);
        }

        if let Some(cursor) = &self.cursor_id {
            let mut on_path: Vec<&NodeId> = vec![cursor];
            let ancestors = self.ancestor_ids(cursor);
            on_path.extend(ancestors.iter());
            for candidate in candidates {
                if on_path.contains(&candidate) {
                    return self.nodes.get(candidate);
                }
            }
        }

        // First inserted match.
        candidates
            .iter()
            .min_by_key(|id| self.nodes.get(*id).map(|n| n.seq).unwrap_or(u64::MAX))
            .and_then(|id| self.nodes.get(id))
    }

    pub fn get_ancestor_path(&self, node_id: &str) -> EngineResult<Vec<ThoughtNode>> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| EngineError::tree(format!("node {node_id} not found")))?;
        let mut path: Vec<ThoughtNode> = self
            .ancestor_ids(node_id)
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).cloned())
            .collect();
        path.push(node.clone());
        Ok(path)
    }

    pub fn get_children(&self, node_id: &str) -> EngineResult<Vec<ThoughtNode>> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| EngineError::tree(format!("node {node_id} not found")))?;
        Ok(node
            .children
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect())
    }

    pub fn get_leaf_nodes(&self) -> Vec<&ThoughtNode> {
        self.nodes.values().filter(|n| n.children.is_empty()).collect()
    }

    pub fn get_expandable_nodes(&self) -> Vec<&ThoughtNode> {
        self.nodes.values().filter(|n| !n.is_terminal).collect()
    }

    pub fn get_all_nodes(&self) -> Vec<&ThoughtNode> {
        self.nodes.values().collect()
    }

    /// Count of nodes already tagged with `branch_id`, for enforcing the
    /// per-branch thought cap (§6 `MAX_THOUGHTS_PER_BRANCH`).
    pub fn branch_thought_count(&self, branch_id: &str) -> usize {
        self.nodes
            .values()
            .filter(|n| n.branch_id.as_deref() == Some(branch_id))
            .count()
    }

    fn build_view(&self, node: &ThoughtNode, max_depth: Option<u32>) -> NodeView {
        let include_children = max_depth.map(|d| node.depth < d).unwrap_or(true);
        NodeView {
            node_id: node.node_id.clone(),
            thought: truncate_display(&node.thought, 100),
            depth: node.depth,
            visit_count: node.visit_count,
            average_value: node.average_value(),
            is_terminal: node.is_terminal,
            is_cursor: self.cursor_id.as_deref() == Some(node.node_id.as_str()),
            child_count: node.children.len(),
            children: if include_children {
                Some(
                    node.children
                        .iter()
                        .filter_map(|id| self.nodes.get(id))
                        .map(|child| self.build_view(child, max_depth))
                        .collect(),
                )
            } else {
                None
            },
        }
    }

    pub fn to_json(&self, max_depth: Option<u32>) -> Option<serde_json::Value> {
        let root = self.root_id.as_ref().and_then(|id| self.nodes.get(id))?;
        serde_json::to_value(self.build_view(root, max_depth)).ok()
    }

    /// Remove worst-scoring leaves until the tree is back under `max_nodes`,
    /// never touching the root or the cursor (§4.1).
    pub fn prune(&mut self) {
        while self.size() > self.max_nodes {
            let root = self.root_id.clone();
            let cursor = self.cursor_id.clone();

            let mut candidates: Vec<&ThoughtNode> = self
                .nodes
                .values()
                .filter(|n| {
                    n.children.is_empty()
                        && Some(n.node_id.as_str()) != root.as_deref()
                        && Some(n.node_id.as_str()) != cursor.as_deref()
                })
                .collect();

            if candidates.is_empty() {
                break;
            }

            candidates.sort_by(|a, b| {
                a.average_value()
                    .partial_cmp(&b.average_value())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.visit_count.cmp(&b.visit_count))
                    .then(a.seq.cmp(&b.seq))
            });

            let victim_id = candidates[0].node_id.clone();
            self.remove_node(&victim_id);
        }
    }

    fn remove_node(&mut self, node_id: &str) {
        let Some(node) = self.nodes.remove(node_id) else {
            return;
        };
        if let Some(parent_id) = &node.parent_id {
            if let Some(parent) = self.nodes.get_mut(parent_id) {
                parent.children.retain(|c| c != node_id);
            }
        }
        if let Some(bucket) = self.thought_number_index.get_mut(&node.thought_number) {
            bucket.retain(|id| id != node_id);
            if bucket.is_empty() {
                self.thought_number_index.remove(&node.thought_number);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(n: u64, next: bool) -> AddThoughtData {
        AddThoughtData {
            thought: format!("thought {n}"),
            thought_number: n,
            next_thought_needed: next,
            is_revision: false,
            revises_thought: None,
            branch_from_thought: None,
            branch_id: None,
        }
    }

    #[test]
    fn first_thought_becomes_root() {
        let mut tree = ThoughtTree::new("s1", 500);
        let node = tree.add_thought(data(1, true)).unwrap();
        assert_eq!(node.depth, 0);
        assert_eq!(tree.root_id(), Some(node.node_id.as_str()));
        assert_eq!(tree.cursor_id(), Some(node.node_id.as_str()));
    }

    #[test]
    fn sequential_thoughts_form_a_straight_path() {
        let mut tree = ThoughtTree::new("s1", 500);
        tree.add_thought(data(1, true)).unwrap();
        tree.add_thought(data(2, true)).unwrap();
        let third = tree.add_thought(data(3, false)).unwrap();
        assert_eq!(third.depth, 2);
        assert!(third.is_terminal);
        assert_eq!(tree.size(), 3);
    }

    #[test]
    fn branch_from_thought_attaches_to_named_ancestor() {
        let mut tree = ThoughtTree::new("s1", 500);
        let t1 = tree.add_thought(data(1, true)).unwrap();
        tree.add_thought(data(2, true)).unwrap();
        tree.add_thought(data(3, true)).unwrap();

        let mut branch = data(4, true);
        branch.branch_from_thought = Some(1);
        branch.branch_id = Some("alt".to_string());
        let node = tree.add_thought(branch).unwrap();

        assert_eq!(node.parent_id.as_deref(), Some(t1.node_id.as_str()));
        assert_eq!(tree.size(), 4);
    }

    #[test]
    fn revision_of_non_root_is_sibling_not_descendant() {
        let mut tree = ThoughtTree::new("s1", 500);
        let t1 = tree.add_thought(data(1, true)).unwrap();
        let t2 = tree.add_thought(data(2, true)).unwrap();

        let mut revision = data(2, true);
        revision.is_revision = true;
        revision.revises_thought = Some(2);
        let node = tree.add_thought(revision).unwrap();

        assert_eq!(node.parent_id, t2.parent_id);
        assert_eq!(node.parent_id.as_deref(), Some(t1.node_id.as_str()));
    }

    #[test]
    fn revision_of_root_becomes_child_of_root() {
        let mut tree = ThoughtTree::new("s1", 500);
        let root = tree.add_thought(data(1, true)).unwrap();

        let mut revision = data(1, true);
        revision.is_revision = true;
        revision.revises_thought = Some(1);
        let node = tree.add_thought(revision).unwrap();

        assert_eq!(node.parent_id.as_deref(), Some(root.node_id.as_str()));
    }

    #[test]
    fn set_cursor_is_idempotent() {
        let mut tree = ThoughtTree::new("s1", 500);
        let root = tree.add_thought(data(1, true)).unwrap();
        tree.add_thought(data(2, true)).unwrap();

        let a = tree.set_cursor(&root.node_id).unwrap();
        let b = tree.set_cursor(&root.node_id).unwrap();
        assert_eq!(a.node_id, b.node_id);
        assert_eq!(tree.cursor_id(), Some(root.node_id.as_str()));
    }

    #[test]
    fn set_cursor_rejects_unknown_node() {
        let mut tree = ThoughtTree::new("s1", 500);
        tree.add_thought(data(1, true)).unwrap();
        assert!(tree.set_cursor("does-not-exist").is_err());
    }

    #[test]
    fn thought_number_collision_prefers_cursor_ancestor_path() {
        let mut tree = ThoughtTree::new("s1", 500);
        tree.add_thought(data(1, true)).unwrap();
        let original_two = tree.add_thought(data(2, true)).unwrap();
        tree.add_thought(data(3, true)).unwrap();

        let mut branch = data(2, true);
        branch.branch_from_thought = Some(1);
        let branch_two = tree.add_thought(branch).unwrap();
        assert_ne!(branch_two.node_id, original_two.node_id);

        // Cursor sits under the branch path, so a lookup for thought #2
        // should resolve to the branch copy, not the original.
        let found = tree.find_node_by_thought_number(2).unwrap();
        assert_eq!(found.node_id, branch_two.node_id);
    }

    #[test]
    fn prune_never_removes_root_or_cursor() {
        let mut tree = ThoughtTree::new("s1", 3);
        let root = tree.add_thought(data(1, true)).unwrap();
        tree.add_thought(data(2, true)).unwrap();
        tree.add_thought(data(3, true)).unwrap();
        let cursor = tree.add_thought(data(4, true)).unwrap();

        assert!(tree.size() <= 3);
        assert!(tree.get_node(&root.node_id).is_some());
        assert!(tree.get_node(&cursor.node_id).is_some());
    }

    #[test]
    fn prune_removes_worst_average_value_leaf_first() {
        let mut tree = ThoughtTree::new("s1", 500);
        let root = tree.add_thought(data(1, true)).unwrap();
        let good = tree.set_cursor(&root.node_id)
            .and_then(|_| tree.add_thought(data(2, true)))
            .unwrap();
        tree.set_cursor(&root.node_id).unwrap();
        let bad = tree.add_thought(data(3, true)).unwrap();

        tree.get_node(&good.node_id); // sanity: exists before scoring
        // Manually weight scores: good has higher average value.
        {
            let n = tree_node_mut_for_test(&mut tree, &good.node_id);
            n.visit_count = 2;
            n.total_value = 1.8;
        }
        {
            let n = tree_node_mut_for_test(&mut tree, &bad.node_id);
            n.visit_count = 2;
            n.total_value = 0.2;
        }
        tree.set_cursor(&root.node_id).unwrap();

        // Force a cap below current size to trigger a prune pass.
        tree.max_nodes = 2;
        tree.prune();

        assert!(tree.get_node(&bad.node_id).is_none());
        assert!(tree.get_node(&good.node_id).is_some());
    }

    fn tree_node_mut_for_test<'a>(tree: &'a mut ThoughtTree, node_id: &str) -> &'a mut ThoughtNode {
        tree.nodes.get_mut(node_id).unwrap()
    }

    #[test]
    fn branch_thought_count_only_counts_matching_branch_id() {
        let mut tree = ThoughtTree::new("s1", 500);
        tree.add_thought(data(1, true)).unwrap();

        let mut alt = data(2, true);
        alt.branch_id = Some("alt".to_string());
        tree.add_thought(alt).unwrap();

        let mut other = data(3, true);
        other.branch_id = Some("other".to_string());
        tree.add_thought(other).unwrap();

        assert_eq!(tree.branch_thought_count("alt"), 1);
        assert_eq!(tree.branch_thought_count("other"), 1);
        assert_eq!(tree.branch_thought_count("nonexistent"), 0);
    }
}

//! Stateless MCTS policy helpers over a `ThoughtTree` (C5, §4.2).

use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::tree::ThoughtTree;

/// `suggestNext`'s exploration/exploitation balance, independent of the
/// mode engine's own `explorationConstant` override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Exploit,
    Balanced,
    Explore,
}

impl Strategy {
    /// `balanced_default` is the mode engine's (or `MCTS_EXPLORATION_CONSTANT`
    /// config's) own exploration constant, substituted in for `Balanced`;
    /// `Exploit`/`Explore` keep the spec's fixed 0.5/2.0 regardless.
    pub fn exploration_constant(self, balanced_default: f64) -> f64 {
        match self {
            Strategy::Exploit => 0.5,
            Strategy::Balanced => balanced_default,
            Strategy::Explore => 2.0,
        }
    }
}

/// One step of `extractBestPath`, root to leaf.
#[derive(Debug, Clone, Serialize)]
pub struct PathStep {
    pub node_id: String,
    pub thought_number: u64,
    pub depth: u32,
    pub average_value: f64,
    pub visit_count: u64,
}

/// A candidate for the next thought to expand.
#[derive(Debug, Clone, Serialize)]
pub struct NextSuggestion {
    pub node_id: String,
    pub thought_number: u64,
    pub average_value: f64,
    pub visit_count: u64,
    pub ucb1_score: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SuggestResult {
    pub suggestion: Option<NextSuggestion>,
    pub alternatives: Vec<NextSuggestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeStats {
    pub total_nodes: usize,
    pub max_depth: u32,
    pub terminal_count: usize,
    pub unexplored_count: usize,
    pub leaf_count: usize,
}

/// Propagate a terminal evaluation up the ancestor chain from `node_id` to
/// the root, incrementing visit counts and accumulating value. Returns the
/// number of nodes updated (the path length, root inclusive).
pub fn backpropagate(tree: &mut ThoughtTree, node_id: &str, value: f64) -> EngineResult<usize> {
    if !(0.0..=1.0).contains(&value) {
        return Err(EngineError::business_logic(
            "backpropagate value must be within [0, 1]",
        ));
    }
    if tree.get_node(node_id).is_none() {
        return Err(EngineError::tree(format!("node {node_id} not found")));
    }

    let mut updated = 0usize;
    let mut current = Some(node_id.to_string());
    while let Some(id) = current {
        let parent_id = {
            let node = tree
                .get_node_mut(&id)
                .ok_or_else(|| EngineError::tree(format!("node {id} not found")))?;
            node.visit_count += 1;
            node.total_value += value;
            node.parent_id.clone()
        };
        updated += 1;
        current = parent_id;
    }
    Ok(updated)
}

/// Walk from the root choosing the highest-`averageValue` child at each step
/// (ties: higher `visitCount`, then earlier insertion). Stops at a leaf.
pub fn extract_best_path(tree: &ThoughtTree) -> Vec<PathStep> {
    let Some(root_id) = tree.root_id().map(|s| s.to_string()) else {
        return Vec::new();
    };

    let mut path = Vec::new();
    let mut current_id = root_id;
    loop {
        let Some(node) = tree.get_node(&current_id) else {
            break;
        };
        path.push(PathStep {
            node_id: node.node_id.clone(),
            thought_number: node.thought_number,
            depth: node.depth,
            average_value: node.average_value(),
            visit_count: node.visit_count,
        });

        let children = tree.get_children(&current_id).unwrap_or_default();
        let Some(best_child) = children.into_iter().max_by(|a, b| {
            a.average_value()
                .partial_cmp(&b.average_value())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.visit_count.cmp(&b.visit_count))
                .then(b.seq.cmp(&a.seq))
        }) else {
            break;
        };
        current_id = best_child.node_id;
    }
    path
}

/// UCB1-ranked suggestion among non-terminal, non-root nodes with a living
/// parent. Unvisited nodes always win (treated as having infinite score).
pub fn suggest_next(tree: &ThoughtTree, strategy: Strategy, balanced_default: f64) -> SuggestResult {
    let c = strategy.exploration_constant(balanced_default);

    let mut scored: Vec<(NextSuggestion, f64, u64)> = tree
        .get_expandable_nodes()
        .into_iter()
        .filter_map(|node| {
            let parent_id = node.parent_id.as_ref()?;
            let parent_visits = tree.get_node(parent_id)?.visit_count;
            let score = if node.visit_count == 0 {
                f64::INFINITY
            } else {
                node.average_value()
                    + c * (((parent_visits + 1) as f64).ln() / node.visit_count as f64).sqrt()
            };
            Some((
                NextSuggestion {
                    node_id: node.node_id.clone(),
                    thought_number: node.thought_number,
                    average_value: node.average_value(),
                    visit_count: node.visit_count,
                    ucb1_score: score,
                },
                score,
                node.seq,
            ))
        })
        .collect();

    // Ties on score (e.g. several unvisited nodes) break toward earlier
    // insertion, matching extract_best_path's and prune's convention.
    scored.sort_by(|(_, a, a_seq), (_, b, b_seq)| {
        b.partial_cmp(a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a_seq.cmp(b_seq))
    });

    let mut iter = scored.into_iter().map(|(s, _, _)| s);
    let suggestion = iter.next();
    let alternatives = iter.take(2).collect();

    SuggestResult {
        suggestion,
        alternatives,
    }
}

pub fn tree_stats(tree: &ThoughtTree) -> TreeStats {
    let nodes = tree.get_all_nodes();
    TreeStats {
        total_nodes: nodes.len(),
        max_depth: nodes.iter().map(|n| n.depth).max().unwrap_or(0),
        terminal_count: nodes.iter().filter(|n| n.is_terminal).count(),
        unexplored_count: nodes.iter().filter(|n| n.visit_count == 0).count(),
        leaf_count: tree.get_leaf_nodes().len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::AddThoughtData;

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
    fn backpropagate_updates_every_ancestor() {
        let mut tree = ThoughtTree::new("s1", 500);
        let root = tree.add_thought(data(1, true)).unwrap();
        let leaf = tree.add_thought(data(2, false)).unwrap();

        let updated = backpropagate(&mut tree, &leaf.node_id, 1.0).unwrap();

        assert_eq!(updated, 2);
        assert_eq!(tree.get_node(&root.node_id).unwrap().visit_count, 1);
        assert_eq!(tree.get_node(&leaf.node_id).unwrap().visit_count, 1);
    }

    #[test]
    fn backpropagate_rejects_out_of_range_value() {
        let mut tree = ThoughtTree::new("s1", 500);
        let root = tree.add_thought(data(1, true)).unwrap();
        assert!(backpropagate(&mut tree, &root.node_id, 1.5).is_err());
        assert!(backpropagate(&mut tree, &root.node_id, -0.1).is_err());
    }

    #[test]
    fn backpropagate_rejects_unknown_node() {
        let mut tree = ThoughtTree::new("s1", 500);
        tree.add_thought(data(1, true)).unwrap();
        assert!(backpropagate(&mut tree, "missing", 1.0).is_err());
    }

    #[test]
    fn extract_best_path_prefers_higher_average_value_child() {
        let mut tree = ThoughtTree::new("s1", 500);
        let root = tree.add_thought(data(1, true)).unwrap();
        let weak = tree.add_thought(data(2, false)).unwrap();
        tree.set_cursor(&root.node_id).unwrap();
        let strong = tree.add_thought(data(3, false)).unwrap();

        backpropagate(&mut tree, &weak.node_id, 0.1).unwrap();
        backpropagate(&mut tree, &strong.node_id, 0.9).unwrap();

        let path = extract_best_path(&tree);
        assert_eq!(path.last().unwrap().node_id, strong.node_id);
    }

    #[test]
    fn suggest_next_prefers_unvisited_nodes() {
        let mut tree = ThoughtTree::new("s1", 500);
        tree.add_thought(data(1, true)).unwrap();
        let visited = tree.add_thought(data(2, true)).unwrap();
        backpropagate(&mut tree, &visited.node_id, 0.5).unwrap();
        tree.set_cursor(tree.root_id().unwrap().to_string().as_str())
            .unwrap();
        let unvisited = tree.add_thought(data(3, true)).unwrap();

        let result = suggest_next(&tree, Strategy::Balanced, std::f64::consts::SQRT_2);
        assert_eq!(result.suggestion.unwrap().node_id, unvisited.node_id);
    }

    #[test]
    fn suggest_next_excludes_root() {
        let mut tree = ThoughtTree::new("s1", 500);
        let root = tree.add_thought(data(1, true)).unwrap();
        let result = suggest_next(&tree, Strategy::Balanced, std::f64::consts::SQRT_2);
        assert!(result.suggestion.as_ref().map(|s| s.node_id != root.node_id).unwrap_or(true));
    }

    #[test]
    fn tree_stats_reports_counts() {
        let mut tree = ThoughtTree::new("s1", 500);
        tree.add_thought(data(1, true)).unwrap();
        tree.add_thought(data(2, false)).unwrap();
        let stats = tree_stats(&tree);
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.leaf_count, 1);
        assert_eq!(stats.terminal_count, 1);
        assert_eq!(stats.unexplored_count, 2);
    }
}

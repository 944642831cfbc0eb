//! Preset-driven mode engine (C6, §4.3). Stateless: everything it needs
//! comes from the `ModeConfig` and the current `ThoughtTree`.

use serde::Serialize;

use crate::mcts::{self, Strategy};
use crate::metacognition::{self, ComplexityBucket, HistoryEntry, ReasoningGap};
use crate::tree::ThoughtTree;

/// Balance label thresholds for the critique (§9 open question: heuristic,
/// not load-bearing).
const BALANCE_ONE_SIDED: f64 = 0.8;
const BALANCE_MODERATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModePreset {
    Fast,
    Expert,
    Deep,
}

impl ModePreset {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(ModePreset::Fast),
            "expert" => Some(ModePreset::Expert),
            "deep" => Some(ModePreset::Deep),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModePreset::Fast => "fast",
            ModePreset::Expert => "expert",
            ModePreset::Deep => "deep",
        }
    }

    pub fn params(self) -> ModeParams {
        match self {
            ModePreset::Fast => ModeParams {
                exploration_constant: 0.5,
                suggest_strategy: Strategy::Exploit,
                max_branching_factor: 1,
                target_depth_min: 3,
                target_depth_max: 5,
                auto_evaluate: true,
                auto_eval_value: Some(0.7),
                enable_backtracking: false,
                min_evaluations_before_converge: 0,
                convergence_threshold: 0.0,
                progress_overview_interval: 3,
                enable_critique: false,
                backtrack_threshold: 0.0,
                branch_min_depth: None,
                use_mcts_for_branching: false,
                max_thought_display_length: 150,
            },
            ModePreset::Expert => ModeParams {
                exploration_constant: std::f64::consts::SQRT_2,
                suggest_strategy: Strategy::Balanced,
                max_branching_factor: 3,
                target_depth_min: 5,
                target_depth_max: 10,
                auto_evaluate: false,
                auto_eval_value: None,
                enable_backtracking: true,
                min_evaluations_before_converge: 3,
                convergence_threshold: 0.7,
                progress_overview_interval: 4,
                enable_critique: true,
                backtrack_threshold: 0.4,
                branch_min_depth: Some(2),
                use_mcts_for_branching: false,
                max_thought_display_length: 250,
            },
            ModePreset::Deep => ModeParams {
                exploration_constant: 2.0,
                suggest_strategy: Strategy::Explore,
                max_branching_factor: 5,
                target_depth_min: 10,
                target_depth_max: 20,
                auto_evaluate: false,
                auto_eval_value: None,
                enable_backtracking: true,
                min_evaluations_before_converge: 5,
                convergence_threshold: 0.85,
                progress_overview_interval: 5,
                enable_critique: true,
                backtrack_threshold: 0.5,
                branch_min_depth: Some(0),
                use_mcts_for_branching: true,
                max_thought_display_length: 300,
            },
        }
    }
}

/// Constant parameters for one mode preset (§4.3 table). `branch_min_depth`
/// of `None` represents the fast preset's `∞` (branching never triggers).
#[derive(Debug, Clone, Copy)]
pub struct ModeParams {
    pub exploration_constant: f64,
    pub suggest_strategy: Strategy,
    pub max_branching_factor: usize,
    pub target_depth_min: u32,
    pub target_depth_max: u32,
    pub auto_evaluate: bool,
    pub auto_eval_value: Option<f64>,
    pub enable_backtracking: bool,
    pub min_evaluations_before_converge: usize,
    pub convergence_threshold: f64,
    pub progress_overview_interval: usize,
    pub enable_critique: bool,
    pub backtrack_threshold: f64,
    pub branch_min_depth: Option<u32>,
    pub use_mcts_for_branching: bool,
    pub max_thought_display_length: usize,
}

#[derive(Debug, Clone)]
pub struct ModeConfig {
    pub preset: ModePreset,
}

impl ModeConfig {
    pub fn new(preset: ModePreset) -> Self {
        Self { preset }
    }

    pub fn params(&self) -> ModeParams {
        self.preset.params()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Exploring,
    Evaluating,
    Converging,
    Concluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Continue,
    Branch,
    Evaluate,
    Backtrack,
    Conclude,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceStatus {
    pub score: f64,
    pub is_converged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Critique {
    pub weakest_node_id: Option<String>,
    pub weakest_average_value: f64,
    pub unchallenged_step_ratio: f64,
    pub branch_coverage: f64,
    pub balance: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeGuidance {
    pub mode: String,
    pub current_phase: Phase,
    pub recommended_action: Action,
    pub backtrack_target: Option<String>,
    pub branch_from: Option<String>,
    pub thought_prompt: String,
    pub convergence_status: Option<ConvergenceStatus>,
    pub progress_overview: Option<String>,
    pub critique: Option<Critique>,
    pub circularity_warning: Option<String>,
    pub confidence_score: f64,
    pub domain: String,
    pub cognitive_process: String,
    pub meta_state: String,
    pub reasoning_gaps: Vec<ReasoningGap>,
    pub complexity: ComplexityBucket,
}

fn compress_thought(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }

    let sentences: Vec<&str> = text
        .split(|c| c == '.' || c == '!' || c == '?')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    if sentences.len() > 1 {
        let first = sentences.first().unwrap();
        let last = sentences.last().unwrap();
        let combined = format!("{first} [...] {last}");
        if combined.chars().count() <= limit {
            return combined;
        }
        let short = format!("{first} [...]");
        if short.chars().count() <= limit {
            return short;
        }
    }

    let budget = limit.saturating_sub(3).max(1);
    let mut truncated = String::new();
    for word in text.split_whitespace() {
        let candidate = if truncated.is_empty() {
            word.to_string()
        } else {
            format!("{truncated} {word}")
        };
        if candidate.chars().count() > budget {
            break;
        }
        truncated = candidate;
    }
    if truncated.is_empty() {
        truncated = text.chars().take(budget).collect();
    }
    format!("{truncated}...")
}

fn history_from_ancestor_path(tree: &ThoughtTree) -> Vec<HistoryEntry> {
    let Some(cursor) = tree.cursor_id() else {
        return Vec::new();
    };
    tree.get_ancestor_path(cursor)
        .map(|path| {
            path.into_iter()
                .map(|n| HistoryEntry {
                    thought_number: n.thought_number,
                    text: n.thought,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn render_prompt(
    mode: ModePreset,
    action: Action,
    tree: &ThoughtTree,
    params: &ModeParams,
    stats: &mcts::TreeStats,
    best_path: &[mcts::PathStep],
    convergence: &Option<ConvergenceStatus>,
) -> String {
    let cursor = tree.cursor_id().and_then(|id| tree.get_node(id));
    let parent_thought = cursor
        .and_then(|c| c.parent_id.as_deref())
        .and_then(|p| tree.get_node(p))
        .map(|p| compress_thought(&p.thought, params.max_thought_display_length))
        .unwrap_or_else(|| "(none)".to_string());
    let current_thought = cursor
        .map(|c| compress_thought(&c.thought, params.max_thought_display_length))
        .unwrap_or_default();
    let path_summary = best_path
        .iter()
        .map(|s| s.thought_number.to_string())
        .collect::<Vec<_>>()
        .join(" -> ");
    let cursor_average = cursor.map(|c| c.average_value()).unwrap_or(0.0);
    let convergence_score = convergence.as_ref().map(|c| c.score).unwrap_or(0.0);

    let template = match (mode, action) {
        (_, Action::Conclude) => {
            "The reasoning path ({path}) appears sufficient (depth {depth}/{max_depth}). \
             Summarize the conclusion and stop."
        }
        (_, Action::Backtrack) => {
            "Thought #{thought_number} (avg {avg:.2}) underperforms. Backtrack toward a \
             stronger ancestor and try a different approach."
        }
        (ModePreset::Deep, Action::Branch) => {
            "At depth {depth}, explore an alternative to thought #{thought_number} (parent: \
             \"{parent}\"). Consider what the MCTS suggestion implies before branching."
        }
        (_, Action::Branch) => {
            "Branch from thought #{thought_number} (\"{current}\") with a distinct approach; \
             {branch_count}/{max_branches} branches explored so far."
        }
        (_, Action::Evaluate) => {
            "Evaluate the unexplored branches before continuing; convergence score is \
             currently {convergence:.2}."
        }
        (_, Action::Continue) => {
            "Continue from thought #{thought_number} (\"{current}\", parent: \"{parent}\") \
             toward depth {min_depth}-{max_depth}. {unexplored} nodes remain unexplored."
        }
    };

    template
        .replace("{thought_number}", &cursor.map(|c| c.thought_number).unwrap_or(0).to_string())
        .replace("{depth}", &stats.max_depth.to_string())
        .replace("{min_depth}", &params.target_depth_min.to_string())
        .replace("{max_depth}", &params.target_depth_max.to_string())
        .replace("{total_nodes}", &stats.total_nodes.to_string())
        .replace("{unexplored}", &stats.unexplored_count.to_string())
        .replace("{parent}", &parent_thought)
        .replace("{current}", &current_thought)
        .replace("{path}", &path_summary)
        .replace("{avg}", &format!("{cursor_average:.2}"))
        .replace("{branch_count}", &cursor.map(|c| c.children.len()).unwrap_or(0).to_string())
        .replace("{max_branches}", &params.max_branching_factor.to_string())
        .replace("{convergence}", &format!("{convergence_score:.2}"))
}

fn build_progress_overview(
    tree: &ThoughtTree,
    stats: &mcts::TreeStats,
    best_path: &[mcts::PathStep],
    history: &[HistoryEntry],
) -> String {
    let path_summary = best_path
        .iter()
        .map(|s| s.thought_number.to_string())
        .collect::<Vec<_>>()
        .join(" -> ");
    let single_child_points = tree
        .get_all_nodes()
        .iter()
        .filter(|n| !n.children.is_empty() && n.children.len() == 1)
        .count();
    let reasoning_gaps = metacognition::analyze_reasoning_gaps(history);
    let (complexity, suggested_mode) = metacognition::analyze_complexity(history);

    format!(
        "nodes={total} leaves={leaves} unscored={unscored}\nbest path: {path}\n\
         gaps: {single_child} single-child branch points, {gap_count} reasoning gaps\n\
         complexity: {complexity:?} (suggested mode: {suggested_mode})",
        total = stats.total_nodes,
        leaves = stats.leaf_count,
        unscored = stats.unexplored_count,
        path = path_summary,
        single_child = single_child_points,
        gap_count = reasoning_gaps.len(),
    )
}

fn build_critique(
    tree: &ThoughtTree,
    params: &ModeParams,
    best_path: &[mcts::PathStep],
) -> Critique {
    let visited_on_path: Vec<&mcts::PathStep> =
        best_path.iter().filter(|s| s.visit_count > 0).collect();
    let weakest = visited_on_path
        .iter()
        .min_by(|a, b| a.average_value.partial_cmp(&b.average_value).unwrap());

    let all_nodes = tree.get_all_nodes();
    let parents_with_children: Vec<_> = all_nodes.iter().filter(|n| !n.children.is_empty()).collect();
    let single_child_parents = parents_with_children
        .iter()
        .filter(|n| n.children.len() == 1)
        .count();
    let unchallenged_step_ratio = if parents_with_children.is_empty() {
        0.0
    } else {
        single_child_parents as f64 / parents_with_children.len() as f64
    };

    let denominator = (best_path.len() * params.max_branching_factor).max(1) as f64;
    let total_children: usize = all_nodes.iter().map(|n| n.children.len()).sum();
    let branch_coverage = (total_children as f64 / denominator).min(1.0);

    let balance = if unchallenged_step_ratio > BALANCE_ONE_SIDED {
        "one-sided"
    } else if unchallenged_step_ratio > BALANCE_MODERATE {
        "moderate"
    } else {
        "well-balanced"
    };

    Critique {
        weakest_node_id: weakest.map(|s| s.node_id.clone()),
        weakest_average_value: weakest.map(|s| s.average_value).unwrap_or(0.0),
        unchallenged_step_ratio,
        branch_coverage,
        balance: balance.to_string(),
    }
}

/// `generateGuidance(config, tree, engine)`, per §4.3's eight-step recipe.
pub fn generate_guidance(config: &ModeConfig, tree: &ThoughtTree) -> ModeGuidance {
    let params = config.params();
    let stats = mcts::tree_stats(tree);
    let best_path = mcts::extract_best_path(tree);
    let current_depth = stats.max_depth;
    let total_evaluated = stats.total_nodes.saturating_sub(stats.unexplored_count);

    // Step 2: convergence status.
    let convergence_status = if params.convergence_threshold == 0.0 {
        None
    } else {
        let visited: Vec<&mcts::PathStep> = best_path.iter().filter(|s| s.visit_count > 0).collect();
        let score = if visited.is_empty() {
            0.0
        } else {
            let avg = visited.iter().map(|s| s.average_value).sum::<f64>() / visited.len() as f64;
            avg * (visited.len() as f64 / best_path.len().max(1) as f64)
        };
        let is_converged =
            total_evaluated >= params.min_evaluations_before_converge && score >= params.convergence_threshold;
        Some(ConvergenceStatus { score, is_converged })
    };

    // Step 3: phase.
    let is_converged = convergence_status.as_ref().map(|c| c.is_converged).unwrap_or(false);
    let phase = if is_converged || (config.preset == ModePreset::Fast && current_depth >= params.target_depth_max) {
        Phase::Concluded
    } else if params.convergence_threshold > 0.0 && total_evaluated >= params.min_evaluations_before_converge {
        Phase::Converging
    } else if total_evaluated > 0 && current_depth >= params.target_depth_min {
        Phase::Evaluating
    } else {
        Phase::Exploring
    };

    let cursor = tree.cursor_id().and_then(|id| tree.get_node(id).cloned());

    // Step 4: recommended action.
    let mut backtrack_target = None;
    let mut branch_from = None;
    let recommended_action = if phase == Phase::Concluded
        || (params.convergence_threshold == 0.0 && current_depth >= params.target_depth_max)
    {
        Action::Conclude
    } else if cursor.is_none() {
        Action::Continue
    } else {
        let cursor = cursor.as_ref().unwrap();
        let can_backtrack = params.enable_backtracking
            && cursor.visit_count > 0
            && params.backtrack_threshold > 0.0
            && cursor.average_value() < params.backtrack_threshold;

        let better_ancestor = if can_backtrack {
            tree.get_ancestor_path(&cursor.node_id)
                .ok()
                .and_then(|path| {
                    path.into_iter()
                        .rev()
                        .skip(1) // skip the cursor itself
                        .find(|n| !n.is_terminal || n.children.len() < params.max_branching_factor)
                })
        } else {
            None
        };

        let branch_min_depth_met = params
            .branch_min_depth
            .map(|min_depth| current_depth >= min_depth)
            .unwrap_or(false);

        if let Some(ancestor) = &better_ancestor {
            backtrack_target = Some(ancestor.node_id.clone());
            Action::Backtrack
        } else if cursor.children.len() < params.max_branching_factor && !cursor.is_terminal && branch_min_depth_met {
            branch_from = Some(if config.preset == ModePreset::Deep && params.use_mcts_for_branching {
                mcts::suggest_next(tree, params.suggest_strategy, params.exploration_constant)
                    .suggestion
                    .map(|s| s.node_id)
                    .unwrap_or_else(|| cursor.node_id.clone())
            } else {
                cursor.node_id.clone()
            });
            Action::Branch
        } else if !params.auto_evaluate && tree.get_leaf_nodes().iter().any(|n| n.visit_count == 0) {
            Action::Evaluate
        } else {
            Action::Continue
        }
    };

    // Step 5: thought prompt.
    let thought_prompt = render_prompt(
        config.preset,
        recommended_action,
        tree,
        &params,
        &stats,
        &best_path,
        &convergence_status,
    );

    let history = history_from_ancestor_path(tree);

    // Step 6: progress overview.
    let progress_overview = if stats.total_nodes > 0 && stats.total_nodes % params.progress_overview_interval == 0 {
        Some(build_progress_overview(tree, &stats, &best_path, &history))
    } else {
        None
    };

    // Step 7: critique.
    let critique = if params.enable_critique && best_path.len() >= 2 {
        Some(build_critique(tree, &params, &best_path))
    } else {
        None
    };

    // Step 8: metacognitive overlays.
    let circularity_warning = metacognition::detect_circularity(&history);
    let latest_text = history.last().map(|e| e.text.as_str()).unwrap_or("");
    let confidence = metacognition::confidence_score(latest_text);
    let domain = metacognition::detect_domain(latest_text);
    let cognitive_process = metacognition::detect_cognitive_process(latest_text);
    let meta_state = metacognition::detect_meta_state(latest_text);
    let reasoning_gaps = metacognition::analyze_reasoning_gaps(&history);
    let (complexity, _) = metacognition::analyze_complexity(&history);

    ModeGuidance {
        mode: config.preset.as_str().to_string(),
        current_phase: phase,
        recommended_action,
        backtrack_target,
        branch_from,
        thought_prompt,
        convergence_status,
        progress_overview,
        critique,
        circularity_warning,
        confidence_score: confidence,
        domain,
        cognitive_process,
        meta_state,
        reasoning_gaps,
        complexity,
    }
}

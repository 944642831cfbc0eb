//! Runtime configuration, loaded from environment variables (§6).

use std::env;
use std::time::Duration;

/// Runtime limits and thresholds for the engine.
///
/// Every field has a documented default; `EngineConfig::from_env` reads the
/// environment variables named in §6 and falls back to the default for any
/// that are absent, unset, or fail to parse.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub disable_thought_logging: bool,
    pub max_thought_length: usize,
    pub max_history_size: usize,
    pub max_thoughts_per_min: u32,
    pub max_thoughts_per_branch: u32,
    pub cleanup_interval: Duration,
    pub mcts_max_nodes: usize,
    pub mcts_max_tree_age: Duration,
    pub mcts_exploration_constant: f64,
    pub mcts_disable_auto_tree: bool,
    pub blocked_patterns: Vec<String>,
    pub max_concurrent_trees: usize,
}

const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    r"(?i)<script[^>]*>",
    r"(?i)javascript:",
    r"(?i)\bdrop\s+table\b",
    r"(?i)\bunion\s+select\b",
];

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            disable_thought_logging: false,
            max_thought_length: 5000,
            max_history_size: 1000,
            max_thoughts_per_min: 60,
            max_thoughts_per_branch: 100,
            cleanup_interval: Duration::from_millis(300_000),
            mcts_max_nodes: 500,
            mcts_max_tree_age: Duration::from_millis(3_600_000),
            mcts_exploration_constant: std::f64::consts::SQRT_2,
            mcts_disable_auto_tree: false,
            blocked_patterns: DEFAULT_BLOCKED_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_concurrent_trees: 100,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            disable_thought_logging: env_bool(
                "DISABLE_THOUGHT_LOGGING",
                defaults.disable_thought_logging,
            ),
            max_thought_length: env_usize("MAX_THOUGHT_LENGTH", defaults.max_thought_length),
            max_history_size: env_usize("MAX_HISTORY_SIZE", defaults.max_history_size),
            max_thoughts_per_min: env_u32("MAX_THOUGHTS_PER_MIN", defaults.max_thoughts_per_min),
            max_thoughts_per_branch: env_u32(
                "MAX_THOUGHTS_PER_BRANCH",
                defaults.max_thoughts_per_branch,
            ),
            cleanup_interval: env_millis("CLEANUP_INTERVAL", defaults.cleanup_interval),
            mcts_max_nodes: env_usize("MCTS_MAX_NODES", defaults.mcts_max_nodes),
            mcts_max_tree_age: env_millis("MCTS_MAX_TREE_AGE", defaults.mcts_max_tree_age),
            mcts_exploration_constant: env_f64(
                "MCTS_EXPLORATION_CONSTANT",
                defaults.mcts_exploration_constant,
            ),
            mcts_disable_auto_tree: env_bool(
                "MCTS_DISABLE_AUTO_TREE",
                defaults.mcts_disable_auto_tree,
            ),
            blocked_patterns: env::var("BLOCKED_PATTERNS")
                .ok()
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
                .filter(|v: &Vec<String>| !v.is_empty())
                .unwrap_or(defaults.blocked_patterns),
            max_concurrent_trees: defaults.max_concurrent_trees,
        }
    }

    /// Validate internal consistency. Called once at startup; a malformed
    /// `BLOCKED_PATTERNS` regex is the only way this can fail, since every
    /// other field has a total parse-or-default fallback.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_thought_length == 0 {
            return Err("max_thought_length must be greater than zero".to_string());
        }
        if self.mcts_max_nodes == 0 {
            return Err("mcts_max_nodes must be greater than zero".to_string());
        }
        for pattern in &self.blocked_patterns {
            regex::Regex::new(pattern)
                .map_err(|e| format!("invalid blocked pattern {pattern:?}: {e}"))?;
        }
        Ok(())
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

//! Tree/Mode Manager (C8, §4.4): owns the per-session tree and mode
//! registries, the cleanup timer, and LRU/TTL eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::mcts::{self, SuggestResult};
use crate::mode::{ModeConfig, ModeGuidance, ModePreset};
use crate::tree::{AddThoughtData, ThoughtNode, ThoughtTree};

pub struct SessionState {
    pub tree: ThoughtTree,
    pub mode: Option<ModeConfig>,
}

pub struct RecordOutcome {
    pub node: ThoughtNode,
    pub mode_guidance: Option<ModeGuidance>,
}

/// Owns every live session's tree and mode config behind a registry lock
/// that is only ever held for lookup/insert — never across a session's own
/// critical section, so two different sessions never block each other.
pub struct Manager {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
    config: EngineConfig,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Manager {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            cleanup_handle: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    fn check_alive(&self) -> EngineResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(EngineError::internal("engine has been destroyed"));
        }
        Ok(())
    }

    async fn get_or_create(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        if let Some(existing) = self.sessions.read().await.get(session_id) {
            return existing.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionState {
                    tree: ThoughtTree::new(session_id, self.config.mcts_max_nodes),
                    mode: None,
                }))
            })
            .clone()
    }

    async fn get_existing(&self, session_id: &str) -> EngineResult<Arc<Mutex<SessionState>>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::tree(format!("no tree for session {session_id}")))
    }

    pub async fn record_thought(
        &self,
        session_id: &str,
        data: AddThoughtData,
    ) -> EngineResult<RecordOutcome> {
        self.check_alive()?;
        if self.config.mcts_disable_auto_tree {
            return Err(EngineError::business_logic(
                "automatic tree recording is disabled",
            ));
        }
        if session_id.is_empty() {
            return Err(EngineError::validation("session id must not be empty"));
        }

        let state = self.get_or_create(session_id).await;
        let mut state = state.lock().await;

        if let Some(branch_id) = &data.branch_id {
            if state.tree.branch_thought_count(branch_id) >= self.config.max_thoughts_per_branch as usize {
                return Err(EngineError::tree(format!(
                    "branch {branch_id} has reached the {}-thought cap",
                    self.config.max_thoughts_per_branch
                )));
            }
        }

        let node = state.tree.add_thought(data)?;

        let mode_guidance = if let Some(mode) = &state.mode {
            let params = mode.params();
            if let Some(auto_value) = params.auto_eval_value {
                if params.auto_evaluate {
                    mcts::backpropagate(&mut state.tree, &node.node_id, auto_value)?;
                }
            }
            Some(crate::mode::generate_guidance(mode, &state.tree))
        } else {
            None
        };

        Ok(RecordOutcome { node, mode_guidance })
    }

    pub async fn backtrack(&self, session_id: &str, node_id: &str) -> EngineResult<ThoughtNode> {
        self.check_alive()?;
        let state = self.get_existing(session_id).await?;
        let mut state = state.lock().await;
        state.tree.set_cursor(node_id)
    }

    pub async fn evaluate(&self, session_id: &str, node_id: &str, value: f64) -> EngineResult<usize> {
        self.check_alive()?;
        let state = self.get_existing(session_id).await?;
        let mut state = state.lock().await;
        mcts::backpropagate(&mut state.tree, node_id, value)
    }

    pub async fn suggest(&self, session_id: &str, strategy: mcts::Strategy) -> EngineResult<SuggestResult> {
        self.check_alive()?;
        let state = self.get_existing(session_id).await?;
        let state = state.lock().await;
        Ok(mcts::suggest_next(&state.tree, strategy, self.config.mcts_exploration_constant))
    }

    pub async fn tree_stats(&self, session_id: &str) -> EngineResult<mcts::TreeStats> {
        self.check_alive()?;
        let state = self.get_existing(session_id).await?;
        let state = state.lock().await;
        Ok(mcts::tree_stats(&state.tree))
    }

    pub async fn get_summary(
        &self,
        session_id: &str,
        max_depth: Option<u32>,
    ) -> EngineResult<serde_json::Value> {
        self.check_alive()?;
        let state = self.get_existing(session_id).await?;
        let state = state.lock().await;
        state
            .tree
            .to_json(max_depth)
            .ok_or_else(|| EngineError::tree("tree has no root yet"))
    }

    pub async fn set_mode(&self, session_id: &str, preset: ModePreset) -> EngineResult<()> {
        self.check_alive()?;
        let state = self.get_or_create(session_id).await;
        let mut state = state.lock().await;
        state.mode = Some(ModeConfig::new(preset));
        Ok(())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove idle trees, then enforce the concurrent-tree cap by evicting
    /// least-recently-accessed sessions. Skips any session currently held by
    /// an in-flight critical section (`try_lock` failure) so cleanup never
    /// races a live request.
    pub async fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut evicted = 0usize;

        let candidate_ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        let mut idle_ages: HashMap<String, chrono::DateTime<Utc>> = HashMap::new();

        for id in &candidate_ids {
            let Some(state) = self.sessions.read().await.get(id).cloned() else {
                continue;
            };
            let Ok(guard) = state.try_lock() else {
                continue;
            };
            let age = now.signed_duration_since(guard.tree.last_accessed_at);
            if age.num_milliseconds() as u128 > self.config.mcts_max_tree_age.as_millis() {
                drop(guard);
                self.sessions.write().await.remove(id);
                evicted += 1;
            } else {
                idle_ages.insert(id.clone(), guard.tree.last_accessed_at);
            }
        }

        let remaining = self.sessions.read().await.len();
        if remaining > self.config.max_concurrent_trees {
            let mut by_age: Vec<(String, chrono::DateTime<Utc>)> = idle_ages.into_iter().collect();
            by_age.sort_by_key(|(_, accessed_at)| *accessed_at);
            let overflow = remaining - self.config.max_concurrent_trees;
            for (id, _) in by_age.into_iter().take(overflow) {
                let Some(state) = self.sessions.read().await.get(&id).cloned() else {
                    continue;
                };
                if state.try_lock().is_ok() {
                    self.sessions.write().await.remove(&id);
                    evicted += 1;
                }
            }
        }

        evicted
    }

    pub fn spawn_cleanup_timer(self: &Arc<Self>, interval: Duration) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if manager.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                let evicted = manager.cleanup().await;
                if evicted > 0 {
                    log::debug!("cleanup timer evicted {evicted} idle session(s)");
                }
            }
        });
        // Intentionally fire-and-forget: we only keep the handle to abort it
        // on destroy, the caller never awaits it directly.
        if let Ok(mut slot) = self.cleanup_handle.try_lock() {
            *slot = Some(handle);
        }
    }

    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.cleanup_handle.lock().await.take() {
            handle.abort();
        }
        self.sessions.write().await.clear();
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

    #[tokio::test]
    async fn record_thought_creates_session_lazily() {
        let manager = Manager::new(EngineConfig::default());
        let outcome = manager.record_thought("s1", data(1, true)).await.unwrap();
        assert_eq!(outcome.node.depth, 0);
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn set_mode_drives_auto_evaluation_in_fast_mode() {
        let manager = Manager::new(EngineConfig::default());
        manager.set_mode("s1", ModePreset::Fast).await.unwrap();
        let outcome = manager.record_thought("s1", data(1, true)).await.unwrap();
        let guidance = outcome.mode_guidance.expect("fast mode always returns guidance");
        assert_eq!(guidance.mode, "fast");

        let stats_node = manager
            .get_summary("s1", None)
            .await
            .unwrap();
        assert!(stats_node.is_object());
    }

    #[tokio::test]
    async fn operations_on_unknown_session_are_tree_errors() {
        let manager = Manager::new(EngineConfig::default());
        assert!(manager.backtrack("ghost", "node").await.is_err());
        assert!(manager.evaluate("ghost", "node", 0.5).await.is_err());
    }

    #[tokio::test]
    async fn branch_thought_cap_rejects_once_reached() {
        let mut config = EngineConfig::default();
        config.max_thoughts_per_branch = 2;
        let manager = Manager::new(config);

        let mut first = data(1, true);
        first.branch_id = Some("alt".to_string());
        manager.record_thought("s1", first).await.unwrap();

        let mut second = data(2, true);
        second.branch_id = Some("alt".to_string());
        manager.record_thought("s1", second).await.unwrap();

        let mut third = data(3, true);
        third.branch_id = Some("alt".to_string());
        let result = manager.record_thought("s1", third).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn destroy_makes_subsequent_operations_fail_cleanly() {
        let manager = Manager::new(EngineConfig::default());
        manager.record_thought("s1", data(1, true)).await.unwrap();
        manager.destroy().await;

        let result = manager.record_thought("s1", data(2, true)).await;
        assert!(result.is_err());
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn cleanup_evicts_over_capacity_sessions_by_lru() {
        let mut config = EngineConfig::default();
        config.max_concurrent_trees = 1;
        let manager = Manager::new(config);

        manager.record_thought("old", data(1, true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.record_thought("new", data(1, true)).await.unwrap();

        manager.cleanup().await;
        assert_eq!(manager.session_count().await, 1);
        assert!(manager.get_existing("new").await.is_ok());
    }
}

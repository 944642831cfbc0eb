//! Server / Request Pipeline (C9, §4.5): validate -> security -> record
//! thought -> assemble response, wired to C2/C3/C8.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::manager::Manager;
use crate::mcts::{self, Strategy};
use crate::mode::{ModeGuidance, ModePreset};
use crate::security::{self, BlockList, RateLimiter};
use crate::tree::AddThoughtData;

#[derive(Debug, Clone, Default)]
pub struct SequentialThinkingRequest {
    pub thought: String,
    pub thought_number: u64,
    pub total_thoughts: u64,
    pub next_thought_needed: bool,
    pub is_revision: Option<bool>,
    pub revises_thought: Option<u64>,
    pub branch_from_thought: Option<u64>,
    pub branch_id: Option<String>,
    pub needs_more_thoughts: Option<bool>,
    pub session_id: Option<String>,
    pub thinking_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SequentialThinkingResponse {
    pub thought_number: u64,
    pub total_thoughts: u64,
    pub next_thought_needed: bool,
    pub session_id: String,
    pub thought_history_length: u64,
    pub branches: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    pub parent_node_id: Option<String>,
    pub tree_stats: mcts::TreeStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_guidance: Option<ModeGuidance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub error: &'static str,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<EngineError> for ErrorPayload {
    fn from(e: EngineError) -> Self {
        ErrorPayload {
            error: e.kind.as_str(),
            message: e.message,
            timestamp: Utc::now(),
        }
    }
}

pub type PipelineResult<T> = Result<T, ErrorPayload>;

#[derive(Debug, Clone)]
struct HistoryRecord {
    session_id: String,
    node_id: String,
    thought_number: u64,
}

pub struct Pipeline {
    manager: Arc<Manager>,
    config: EngineConfig,
    metrics: crate::metrics::MetricsCollector,
    block_list: BlockList,
    rate_limiter: Mutex<RateLimiter>,
    history: Mutex<VecDeque<HistoryRecord>>,
    branches: Mutex<VecDeque<String>>,
    thought_history_length: AtomicU64,
    destroyed: AtomicBool,
}

impl Pipeline {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, String> {
        config.validate()?;
        let block_list = BlockList::compile(&config.blocked_patterns)?;
        let rate_limiter = RateLimiter::new(config.max_thoughts_per_min);
        let manager = Manager::new(config.clone());
        manager.spawn_cleanup_timer(config.cleanup_interval);

        Ok(Arc::new(Self {
            manager,
            config,
            metrics: crate::metrics::MetricsCollector::new(),
            block_list,
            rate_limiter: Mutex::new(rate_limiter),
            history: Mutex::new(VecDeque::new()),
            branches: Mutex::new(VecDeque::new()),
            thought_history_length: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }))
    }

    fn validate_shape(req: &SequentialThinkingRequest, max_len: usize) -> Result<u64, EngineError> {
        if req.thought.trim().is_empty() {
            return Err(EngineError::validation("thought must not be empty"));
        }
        if req.thought.chars().count() > max_len {
            return Err(EngineError::validation(format!(
                "thought exceeds max length of {max_len} characters"
            )));
        }
        if req.thought_number == 0 {
            return Err(EngineError::validation("thoughtNumber must be >= 1"));
        }
        if req.total_thoughts == 0 {
            return Err(EngineError::validation("totalThoughts must be >= 1"));
        }
        Ok(req.total_thoughts.max(req.thought_number))
    }

    fn validate_business_logic(req: &SequentialThinkingRequest) -> Result<(), EngineError> {
        if req.is_revision.unwrap_or(false) && req.revises_thought.is_none() {
            return Err(EngineError::business_logic(
                "isRevision requires revisesThought",
            ));
        }
        if req.branch_from_thought.is_some() && req.branch_id.is_none() {
            return Err(EngineError::business_logic(
                "branchFromThought requires branchId",
            ));
        }
        Ok(())
    }

    /// Shared §4.5/§6 bound ("Each validates session id"): 1-100 characters.
    /// Used both when a fresh `sequentialthinking` request supplies a client
    /// session id and at the head of every auxiliary operation, so an
    /// oversized id surfaces as `SECURITY_ERROR` everywhere, not just here.
    fn validate_session_id_bounds(id: &str) -> Result<(), EngineError> {
        if id.is_empty() || id.chars().count() > 100 {
            return Err(EngineError::security(
                "sessionId must be between 1 and 100 characters",
            ));
        }
        Ok(())
    }

    fn resolve_session_id(req: &SequentialThinkingRequest) -> Result<String, EngineError> {
        match &req.session_id {
            Some(id) => {
                Self::validate_session_id_bounds(id)?;
                Ok(id.clone())
            }
            None => Ok(uuid::Uuid::new_v4().to_string()),
        }
    }

    async fn record_branch(&self, branch_id: &str) {
        let mut branches = self.branches.lock().await;
        if !branches.contains(&branch_id.to_string()) {
            branches.push_back(branch_id.to_string());
            if branches.len() > 100 {
                branches.pop_front();
            }
        }
    }

    async fn record_history(&self, session_id: &str, node_id: &str, thought_number: u64) {
        let mut history = self.history.lock().await;
        history.push_back(HistoryRecord {
            session_id: session_id.to_string(),
            node_id: node_id.to_string(),
            thought_number,
        });
        if history.len() > self.config.max_history_size {
            history.pop_front();
        }
    }

    pub async fn process_thought(
        &self,
        req: SequentialThinkingRequest,
    ) -> PipelineResult<SequentialThinkingResponse> {
        // Steps 1-3: shape, business-logic and session-id validation happen
        // entirely before the session critical section, and before metrics
        // or the rate limiter are touched at all (§4.5, §7).
        let total_thoughts = Self::validate_shape(&req, self.config.max_thought_length)?;
        Self::validate_business_logic(&req)?;
        let session_id = Self::resolve_session_id(&req)?;

        // Step 4 onward: the session critical section begins here.
        self.metrics.record_request_started();

        let result = self.process_thought_inner(&req, total_thoughts, &session_id).await;
        match result {
            Ok(response) => {
                self.metrics.record_request_succeeded();
                self.metrics.record_thought_added();
                Ok(response)
            }
            Err(err) => {
                if matches!(err.kind, crate::error::ErrorKind::Security)
                    && err.message.contains("rate limit")
                {
                    self.metrics.record_rate_limited();
                }
                self.metrics.record_request_failed();
                Err(err.into())
            }
        }
    }

    async fn process_thought_inner(
        &self,
        req: &SequentialThinkingRequest,
        total_thoughts: u64,
        session_id: &str,
    ) -> Result<SequentialThinkingResponse, EngineError> {
        let sanitized = security::sanitize_and_check(&req.thought, &self.block_list)?;

        {
            let mut limiter = self.rate_limiter.lock().await;
            limiter.check_and_record(session_id)?;
        }

        if let Some(mode_str) = &req.thinking_mode {
            let preset = ModePreset::parse(mode_str)
                .ok_or_else(|| EngineError::validation(format!("unknown thinking mode {mode_str}")))?;
            self.manager.set_mode(session_id, preset).await?;
        }

        let data = AddThoughtData {
            thought: sanitized,
            thought_number: req.thought_number,
            next_thought_needed: req.next_thought_needed,
            is_revision: req.is_revision.unwrap_or(false),
            revises_thought: req.revises_thought,
            branch_from_thought: req.branch_from_thought,
            branch_id: req.branch_id.clone(),
        };

        let outcome = self.manager.record_thought(session_id, data).await?;

        if let Some(branch_id) = &req.branch_id {
            self.record_branch(branch_id).await;
        }
        self.record_history(session_id, &outcome.node.node_id, req.thought_number).await;

        let history_length = self.thought_history_length.fetch_add(1, Ordering::Relaxed) + 1;
        let tree_stats = self.manager.tree_stats(session_id).await?;

        let branches = self.branches.lock().await.iter().cloned().collect();

        Ok(SequentialThinkingResponse {
            thought_number: req.thought_number,
            total_thoughts,
            next_thought_needed: req.next_thought_needed,
            session_id: session_id.to_string(),
            thought_history_length: history_length,
            branches,
            timestamp: Utc::now(),
            node_id: outcome.node.node_id,
            parent_node_id: outcome.node.parent_id,
            tree_stats,
            mode_guidance: outcome.mode_guidance,
        })
    }

    pub async fn backtrack(&self, session_id: &str, node_id: &str) -> PipelineResult<serde_json::Value> {
        Self::validate_session_id_bounds(session_id)?;
        self.metrics.record_request_started();
        match self.manager.backtrack(session_id, node_id).await {
            Ok(node) => {
                self.metrics.record_request_succeeded();
                Ok(serde_json::json!({ "nodeId": node.node_id, "cursorMovedTo": node.node_id }))
            }
            Err(err) => {
                self.metrics.record_request_failed();
                Err(err.into())
            }
        }
    }

    pub async fn evaluate_thought(
        &self,
        session_id: &str,
        node_id: &str,
        value: f64,
    ) -> PipelineResult<serde_json::Value> {
        Self::validate_session_id_bounds(session_id)?;
        if !(0.0..=1.0).contains(&value) {
            return Err(EngineError::validation("value must be within [0, 1]").into());
        }
        self.metrics.record_request_started();
        match self.manager.evaluate(session_id, node_id, value).await {
            Ok(updated) => {
                self.metrics.record_request_succeeded();
                Ok(serde_json::json!({ "nodesUpdated": updated }))
            }
            Err(err) => {
                self.metrics.record_request_failed();
                Err(err.into())
            }
        }
    }

    pub async fn suggest_next_thought(
        &self,
        session_id: &str,
        strategy: Option<String>,
    ) -> PipelineResult<serde_json::Value> {
        Self::validate_session_id_bounds(session_id)?;
        let strategy = match strategy.as_deref() {
            Some("exploit") => Strategy::Exploit,
            Some("explore") => Strategy::Explore,
            Some("balanced") | None => Strategy::Balanced,
            Some(other) => {
                return Err(EngineError::validation(format!("unknown strategy {other}")).into())
            }
        };
        self.metrics.record_request_started();
        match self.manager.suggest(session_id, strategy).await {
            Ok(result) => {
                self.metrics.record_request_succeeded();
                Ok(serde_json::to_value(result).unwrap_or(serde_json::Value::Null))
            }
            Err(err) => {
                self.metrics.record_request_failed();
                Err(err.into())
            }
        }
    }

    pub async fn get_thinking_summary(
        &self,
        session_id: &str,
        max_depth: Option<u32>,
    ) -> PipelineResult<serde_json::Value> {
        Self::validate_session_id_bounds(session_id)?;
        self.metrics.record_request_started();
        match self.manager.get_summary(session_id, max_depth).await {
            Ok(summary) => {
                self.metrics.record_request_succeeded();
                Ok(summary)
            }
            Err(err) => {
                self.metrics.record_request_failed();
                Err(err.into())
            }
        }
    }

    pub async fn set_thinking_mode(&self, session_id: &str, mode: &str) -> PipelineResult<serde_json::Value> {
        Self::validate_session_id_bounds(session_id)?;
        let preset = ModePreset::parse(mode)
            .ok_or_else(|| EngineError::validation(format!("unknown thinking mode {mode}")))?;
        self.metrics.record_request_started();
        match self.manager.set_mode(session_id, preset).await {
            Ok(()) => {
                self.metrics.record_request_succeeded();
                Ok(serde_json::json!({ "sessionId": session_id, "mode": preset.as_str() }))
            }
            Err(err) => {
                self.metrics.record_request_failed();
                Err(err.into())
            }
        }
    }

    /// Legacy compatibility operation: after `destroy`, returns an empty
    /// result and logs a warning instead of erroring (§4.5).
    pub async fn get_thought_history(&self) -> serde_json::Value {
        if self.destroyed.load(Ordering::SeqCst) {
            log::warn!("getThoughtHistory called after pipeline destroy");
            return serde_json::json!({ "history": [] });
        }
        let history = self.history.lock().await;
        let entries: Vec<_> = history
            .iter()
            .map(|h| {
                serde_json::json!({
                    "sessionId": h.session_id,
                    "nodeId": h.node_id,
                    "thoughtNumber": h.thought_number,
                })
            })
            .collect();
        serde_json::json!({ "history": entries })
    }

    pub async fn get_branches(&self) -> serde_json::Value {
        if self.destroyed.load(Ordering::SeqCst) {
            log::warn!("getBranches called after pipeline destroy");
            return serde_json::json!({ "branches": [] });
        }
        let branches: Vec<String> = self.branches.lock().await.iter().cloned().collect();
        serde_json::json!({ "branches": branches })
    }

    pub async fn metrics_snapshot(&self) -> crate::metrics::MetricsSnapshot {
        let active_sessions = self.manager.session_count().await as u64;
        self.metrics.snapshot(active_sessions)
    }

    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.manager.destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(n: u64, next: bool, session: Option<&str>) -> SequentialThinkingRequest {
        SequentialThinkingRequest {
            thought: format!("thought number {n}"),
            thought_number: n,
            total_thoughts: 3,
            next_thought_needed: next,
            session_id: session.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fresh_session_three_sequential_thoughts() {
        let pipeline = Pipeline::new(EngineConfig::default()).unwrap();
        pipeline.process_thought(request(1, true, Some("s1"))).await.unwrap();
        pipeline.process_thought(request(2, true, Some("s1"))).await.unwrap();
        let response = pipeline
            .process_thought(request(3, false, Some("s1")))
            .await
            .unwrap();

        assert_eq!(response.tree_stats.total_nodes, 3);
        assert_eq!(response.thought_history_length, 3);
        assert!(response.branches.is_empty());
    }

    #[tokio::test]
    async fn empty_thought_is_a_validation_error_before_metrics() {
        let pipeline = Pipeline::new(EngineConfig::default()).unwrap();
        let result = pipeline
            .process_thought(SequentialThinkingRequest {
                thought: "   ".to_string(),
                thought_number: 1,
                total_thoughts: 1,
                next_thought_needed: true,
                ..Default::default()
            })
            .await;
        assert!(result.is_err());
        let snapshot = pipeline.metrics_snapshot().await;
        assert_eq!(snapshot.total_requests, 0);
    }

    #[tokio::test]
    async fn revision_without_revises_thought_is_business_logic_error() {
        let pipeline = Pipeline::new(EngineConfig::default()).unwrap();
        let mut req = request(1, true, Some("s1"));
        req.is_revision = Some(true);
        let result = pipeline.process_thought(req).await;
        assert_eq!(result.unwrap_err().error, "BUSINESS_LOGIC_ERROR");
    }

    #[tokio::test]
    async fn thought_number_greater_than_total_widens_total() {
        let pipeline = Pipeline::new(EngineConfig::default()).unwrap();
        let mut req = request(5, true, Some("s1"));
        req.total_thoughts = 2;
        let response = pipeline.process_thought(req).await.unwrap();
        assert_eq!(response.total_thoughts, 5);
    }

    #[tokio::test]
    async fn rate_limit_cutoff_matches_scenario_six() {
        let mut config = EngineConfig::default();
        config.max_thoughts_per_min = 2;
        let pipeline = Pipeline::new(config).unwrap();

        pipeline.process_thought(request(1, true, Some("s1"))).await.unwrap();
        pipeline.process_thought(request(2, true, Some("s1"))).await.unwrap();
        let third = pipeline.process_thought(request(3, true, Some("s1"))).await;

        assert!(third.is_err());
        assert!(third.unwrap_err().message.to_lowercase().contains("rate limit"));

        let snapshot = pipeline.metrics_snapshot().await;
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
    }

    #[tokio::test]
    async fn branching_in_expert_mode_matches_scenario_three() {
        let pipeline = Pipeline::new(EngineConfig::default()).unwrap();
        pipeline.set_thinking_mode("s1", "expert").await.unwrap();
        pipeline.process_thought(request(1, true, Some("s1"))).await.unwrap();
        pipeline.process_thought(request(2, true, Some("s1"))).await.unwrap();
        pipeline.process_thought(request(3, true, Some("s1"))).await.unwrap();

        let mut branch_req = request(4, true, Some("s1"));
        branch_req.branch_from_thought = Some(1);
        branch_req.branch_id = Some("alt".to_string());
        let response = pipeline.process_thought(branch_req).await.unwrap();

        assert_eq!(response.tree_stats.total_nodes, 4);
        assert!(response.branches.contains(&"alt".to_string()));
    }

    #[tokio::test]
    async fn oversized_session_id_on_backtrack_is_a_security_error() {
        let pipeline = Pipeline::new(EngineConfig::default()).unwrap();
        let long_id = "s".repeat(101);
        let result = pipeline.backtrack(&long_id, "n1").await;
        assert_eq!(result.unwrap_err().error, "SECURITY_ERROR");
    }

    #[tokio::test]
    async fn operations_after_destroy_never_panic() {
        let pipeline = Pipeline::new(EngineConfig::default()).unwrap();
        pipeline.process_thought(request(1, true, Some("s1"))).await.unwrap();
        pipeline.destroy().await;

        assert!(pipeline.process_thought(request(2, true, Some("s1"))).await.is_err());
        let history = pipeline.get_thought_history().await;
        assert_eq!(history["history"].as_array().unwrap().len(), 0);
    }
}

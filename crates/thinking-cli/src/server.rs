//! MCP stdio server exposing the sequential-thinking engine's six
//! operations (§6) as tools, grounded on `FluentMcpAdapter`'s tool-schema
//! shape and on `FluentMcpServer::start_stdio`'s transport wiring.

use std::sync::Arc;

use rmcp::model::{CallToolRequestParam, CallToolResult, Content, ServerInfo, Tool};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{Error as McpError, ServerHandler, ServiceExt};
use serde_json::{json, Map, Value};

use thinking_engine::pipeline::{ErrorPayload, PipelineResult, SequentialThinkingRequest};
use thinking_engine::EngineConfig;
use thinking_engine::Pipeline;

/// MCP adapter wrapping the engine pipeline; cloned per connection since the
/// pipeline itself is reference-counted and all state lives behind it.
#[derive(Clone)]
pub struct ThinkingMcpServer {
    pipeline: Arc<Pipeline>,
}

impl ThinkingMcpServer {
    pub fn new(config: EngineConfig) -> Result<Self, String> {
        Ok(Self {
            pipeline: Pipeline::new(config)?,
        })
    }

    pub async fn start_stdio(self) -> anyhow::Result<()> {
        let service = self.serve(rmcp::transport::stdio()).await?;
        tokio::select! {
            result = service.waiting() => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("received ctrl-c, shutting down sequential-thinking server");
            }
        }
        Ok(())
    }

    fn tool(name: &str, description: &str, schema: Map<String, Value>) -> Tool {
        Tool {
            name: name.to_string().into(),
            description: description.to_string().into(),
            input_schema: Arc::new(schema),
        }
    }

    fn sequential_thinking_schema() -> Map<String, Value> {
        object_schema(
            json!({
                "thought": {"type": "string", "description": "The current reasoning step"},
                "thoughtNumber": {"type": "integer", "minimum": 1, "description": "Index of this thought, 1-based"},
                "totalThoughts": {"type": "integer", "minimum": 1, "description": "Current estimate of how many thoughts are needed"},
                "nextThoughtNeeded": {"type": "boolean", "description": "Whether another thought should follow this one"},
                "isRevision": {"type": "boolean", "description": "Whether this thought revises an earlier one"},
                "revisesThought": {"type": "integer", "description": "Thought number being revised"},
                "branchFromThought": {"type": "integer", "description": "Thought number this branch forks from"},
                "branchId": {"type": "string", "description": "Identifier for this branch"},
                "needsMoreThoughts": {"type": "boolean", "description": "Hint that totalThoughts should grow"},
                "sessionId": {"type": "string", "description": "Session to attach this thought to; a new one is created if omitted"},
                "thinkingMode": {"type": "string", "enum": ["fast", "expert", "deep"]},
            }),
            &["thought", "thoughtNumber", "totalThoughts", "nextThoughtNeeded"],
        )
    }

    fn backtrack_schema() -> Map<String, Value> {
        object_schema(
            json!({
                "sessionId": {"type": "string"},
                "nodeId": {"type": "string", "description": "Node to move the cursor to"},
            }),
            &["sessionId", "nodeId"],
        )
    }

    fn evaluate_thought_schema() -> Map<String, Value> {
        object_schema(
            json!({
                "sessionId": {"type": "string"},
                "nodeId": {"type": "string"},
                "value": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            }),
            &["sessionId", "nodeId", "value"],
        )
    }

    fn suggest_next_thought_schema() -> Map<String, Value> {
        object_schema(
            json!({
                "sessionId": {"type": "string"},
                "strategy": {"type": "string", "enum": ["exploit", "balanced", "explore"]},
            }),
            &["sessionId"],
        )
    }

    fn get_thinking_summary_schema() -> Map<String, Value> {
        object_schema(
            json!({
                "sessionId": {"type": "string"},
                "maxDepth": {"type": "integer", "minimum": 0},
            }),
            &["sessionId"],
        )
    }

    fn set_thinking_mode_schema() -> Map<String, Value> {
        object_schema(
            json!({
                "sessionId": {"type": "string"},
                "mode": {"type": "string", "enum": ["fast", "expert", "deep"]},
            }),
            &["sessionId", "mode"],
        )
    }

    async fn dispatch(&self, name: &str, arguments: Map<String, Value>) -> Result<Value, McpError> {
        match name {
            "sequentialthinking" => self
                .call_sequential_thinking(arguments)
                .await
                .map(|r| serde_json::to_value(r).unwrap_or(Value::Null)),
            "backtrack" => {
                let session_id = required_str(&arguments, "sessionId")?;
                let node_id = required_str(&arguments, "nodeId")?;
                to_mcp(self.pipeline.backtrack(&session_id, &node_id).await)
            }
            "evaluate_thought" => {
                let session_id = required_str(&arguments, "sessionId")?;
                let node_id = required_str(&arguments, "nodeId")?;
                let value = arguments
                    .get("value")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| McpError::invalid_params("missing field value".to_string(), None))?;
                to_mcp(self.pipeline.evaluate_thought(&session_id, &node_id, value).await)
            }
            "suggest_next_thought" => {
                let session_id = required_str(&arguments, "sessionId")?;
                let strategy = arguments.get("strategy").and_then(Value::as_str).map(str::to_string);
                to_mcp(self.pipeline.suggest_next_thought(&session_id, strategy).await)
            }
            "get_thinking_summary" => {
                let session_id = required_str(&arguments, "sessionId")?;
                let max_depth = arguments.get("maxDepth").and_then(Value::as_u64).map(|v| v as u32);
                to_mcp(self.pipeline.get_thinking_summary(&session_id, max_depth).await)
            }
            "set_thinking_mode" => {
                let session_id = required_str(&arguments, "sessionId")?;
                let mode = required_str(&arguments, "mode")?;
                to_mcp(self.pipeline.set_thinking_mode(&session_id, &mode).await)
            }
            _other => Err(McpError::method_not_found::<rmcp::model::CallToolRequestMethod>()),
        }
    }

    async fn call_sequential_thinking(&self, arguments: Map<String, Value>) -> Result<thinking_engine::SequentialThinkingResponse, McpError> {
        let req: SequentialThinkingRequest = parse_sequential_thinking_request(&arguments)
            .map_err(|e| McpError::invalid_params(e, None))?;
        self.pipeline
            .process_thought(req)
            .await
            .map_err(payload_to_mcp_error)
    }
}

fn object_schema(properties: Value, required: &[&str]) -> Map<String, Value> {
    let mut schema = Map::new();
    schema.insert("type".to_string(), json!("object"));
    schema.insert("properties".to_string(), properties);
    schema.insert("required".to_string(), json!(required));
    schema
}

fn required_str(arguments: &Map<String, Value>, field: &str) -> Result<String, McpError> {
    arguments
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| McpError::invalid_params(format!("missing field {field}"), None))
}

fn parse_sequential_thinking_request(arguments: &Map<String, Value>) -> Result<SequentialThinkingRequest, String> {
    let thought = arguments
        .get("thought")
        .and_then(Value::as_str)
        .ok_or("missing field thought")?
        .to_string();
    let thought_number = arguments
        .get("thoughtNumber")
        .and_then(Value::as_u64)
        .ok_or("missing field thoughtNumber")?;
    let total_thoughts = arguments
        .get("totalThoughts")
        .and_then(Value::as_u64)
        .ok_or("missing field totalThoughts")?;
    let next_thought_needed = arguments
        .get("nextThoughtNeeded")
        .and_then(Value::as_bool)
        .ok_or("missing field nextThoughtNeeded")?;

    Ok(SequentialThinkingRequest {
        thought,
        thought_number,
        total_thoughts,
        next_thought_needed,
        is_revision: arguments.get("isRevision").and_then(Value::as_bool),
        revises_thought: arguments.get("revisesThought").and_then(Value::as_u64),
        branch_from_thought: arguments.get("branchFromThought").and_then(Value::as_u64),
        branch_id: arguments.get("branchId").and_then(Value::as_str).map(str::to_string),
        needs_more_thoughts: arguments.get("needsMoreThoughts").and_then(Value::as_bool),
        session_id: arguments.get("sessionId").and_then(Value::as_str).map(str::to_string),
        thinking_mode: arguments.get("thinkingMode").and_then(Value::as_str).map(str::to_string),
    })
}

fn payload_to_mcp_error(payload: ErrorPayload) -> McpError {
    McpError::invalid_params(format!("{}: {}", payload.error, payload.message), None)
}

fn to_mcp<T: serde::Serialize>(result: PipelineResult<T>) -> Result<Value, McpError> {
    result
        .map(|v| serde_json::to_value(v).unwrap_or(Value::Null))
        .map_err(payload_to_mcp_error)
}

impl ServerHandler for ThinkingMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Sequential-thinking engine. Use `sequentialthinking` to add a reasoning step; \
                 `backtrack`, `evaluate_thought` and `suggest_next_thought` to steer the search tree; \
                 `get_thinking_summary` and `set_thinking_mode` to inspect or reconfigure a session."
                    .to_string(),
            ),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<rmcp::model::PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<rmcp::model::ListToolsResult, McpError> {
        let tools = vec![
            Self::tool(
                "sequentialthinking",
                "Record one step of sequential reasoning and get back the updated tree state and, if a thinking mode is active, guidance for the next step.",
                Self::sequential_thinking_schema(),
            ),
            Self::tool(
                "backtrack",
                "Move a session's cursor to an earlier node so the next thought attaches there.",
                Self::backtrack_schema(),
            ),
            Self::tool(
                "evaluate_thought",
                "Backpropagate a value in [0, 1] from a node up to the root, updating visit counts and average values along the path.",
                Self::evaluate_thought_schema(),
            ),
            Self::tool(
                "suggest_next_thought",
                "Ask the MCTS policy which expandable node to continue from next, using the given exploration strategy.",
                Self::suggest_next_thought_schema(),
            ),
            Self::tool(
                "get_thinking_summary",
                "Render the current thought tree as JSON, optionally truncated to a maximum depth.",
                Self::get_thinking_summary_schema(),
            ),
            Self::tool(
                "set_thinking_mode",
                "Switch a session's thinking mode preset (fast, expert or deep), changing its MCTS parameters and guidance.",
                Self::set_thinking_mode_schema(),
            ),
        ];
        Ok(rmcp::model::ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request.arguments.unwrap_or_default();
        match self.dispatch(request.name.as_ref(), arguments).await {
            Ok(value) => Ok(CallToolResult {
                content: vec![Content::text(
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
                )],
                is_error: Some(false),
            }),
            Err(err) => Ok(CallToolResult {
                content: vec![Content::text(err.to_string())],
                is_error: Some(true),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_thinking_tool_round_trips_through_dispatch() {
        let server = ThinkingMcpServer::new(EngineConfig::default()).unwrap();
        let mut arguments = Map::new();
        arguments.insert("thought".to_string(), json!("first step"));
        arguments.insert("thoughtNumber".to_string(), json!(1));
        arguments.insert("totalThoughts".to_string(), json!(3));
        arguments.insert("nextThoughtNeeded".to_string(), json!(true));
        arguments.insert("sessionId".to_string(), json!("test-session"));

        let value = server.dispatch("sequentialthinking", arguments).await.unwrap();
        assert_eq!(value["sessionId"], json!("test-session"));
        assert_eq!(value["thoughtNumber"], json!(1));
    }

    #[tokio::test]
    async fn unknown_session_id_on_backtrack_becomes_an_error_result() {
        let server = ThinkingMcpServer::new(EngineConfig::default()).unwrap();
        let mut arguments = Map::new();
        arguments.insert("sessionId".to_string(), json!("ghost"));
        arguments.insert("nodeId".to_string(), json!("node"));
        assert!(server.dispatch("backtrack", arguments).await.is_err());
    }

    #[test]
    fn list_tools_names_match_external_interface_table() {
        let schema = ThinkingMcpServer::sequential_thinking_schema();
        assert_eq!(schema["type"], json!("object"));
        assert!(schema["required"].as_array().unwrap().contains(&json!("thought")));
    }
}

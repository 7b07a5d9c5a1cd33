//! Tools the model may call during a generation.
//!
//! Every tool implements [`Tool`]; the engine converts them to API-level
//! definitions with [`to_definitions`] and dispatches calls by name.

pub mod todo;

use async_trait::async_trait;
use convoy_protocol::TodoItem;

use crate::provider::ToolDefinition;

/// Result of executing a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    pub is_error: bool,
    /// Full todo list when the tool replaced it; forwarded to viewers.
    pub todos: Option<Vec<TodoItem>>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            todos: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            todos: None,
        }
    }

    pub fn with_todos(mut self, todos: Vec<TodoItem>) -> Self {
        self.todos = Some(todos);
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "todo_write").
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// Tools every conversation gets.
pub fn builtin_tools() -> Vec<Box<dyn Tool>> {
    vec![Box::new(todo::TodoWriteTool)]
}

pub fn to_definitions(tools: &[Box<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
        })
        .collect()
}

/// Find and run the named tool. Unknown names yield an error result.
pub async fn execute_tool(tools: &[Box<dyn Tool>], name: &str, input: serde_json::Value) -> ToolResult {
    match tools.iter().find(|t| t.name() == name) {
        Some(tool) => {
            tracing::debug!(tool = %name, "executing tool");
            tool.execute(input).await
        }
        None => ToolResult::error(format!("unknown tool: {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let tools = builtin_tools();
        let result = execute_tool(&tools, "rm_rf", serde_json::json!({})).await;
        assert!(result.is_error);
        assert!(result.content.contains("rm_rf"));
    }

    #[test]
    fn definitions_cover_builtins() {
        let defs = to_definitions(&builtin_tools());
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "todo_write");
        assert_eq!(defs[0].input_schema["type"], "object");
    }
}

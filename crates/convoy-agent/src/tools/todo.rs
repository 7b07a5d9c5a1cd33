//! `todo_write`: the model publishes its working plan as a checklist.

use async_trait::async_trait;
use convoy_protocol::{TodoItem, TodoStatus};
use serde::Deserialize;

use super::{Tool, ToolResult};

/// Stateless: each call carries the complete list, which replaces the last one.
pub struct TodoWriteTool;

#[derive(Deserialize)]
struct TodoInput {
    todos: Vec<TodoItem>,
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Replace the task checklist shown to the user. Send the full list every time, \
         marking at most one item in_progress."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "content": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            }
                        },
                        "required": ["id", "content", "status"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let parsed: TodoInput = match serde_json::from_value(input) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("invalid todo list: {e}")),
        };

        let in_progress = parsed
            .todos
            .iter()
            .filter(|t| t.status == TodoStatus::InProgress)
            .count();
        if in_progress > 1 {
            return ToolResult::error("only one todo may be in_progress at a time");
        }

        let done = parsed
            .todos
            .iter()
            .filter(|t| t.status == TodoStatus::Completed)
            .count();
        ToolResult::success(format!(
            "Todo list updated ({done}/{} completed)",
            parsed.todos.len()
        ))
        .with_todos(parsed.todos)
    }
}

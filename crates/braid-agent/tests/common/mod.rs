//! Tools shared by the integration tests.

#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use braid_agent::{ParamExt, Result, Tool, ToolResult, ToolRuntime};

/// Adds or multiplies two numbers.
#[derive(Default)]
pub struct CalculatorTool {
    executions: AtomicUsize,
}

impl CalculatorTool {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate a binary arithmetic operation"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "op": {"type": "string", "enum": ["add", "mul"]},
                "a": {"type": "number"},
                "b": {"type": "number"}
            },
            "required": ["op", "a", "b"]
        })
    }

    async fn execute(&self, params: Value, _runtime: &ToolRuntime) -> Result<ToolResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let a = params.required_f64("a", "first operand")?;
        let b = params.required_f64("b", "second operand")?;
        let value = match params.required_str("op", "add or mul")? {
            "mul" => a * b,
            _ => a + b,
        };
        Ok(ToolResult::text(value.to_string()))
    }
}

/// Pretends to delete a file and counts how often it ran.
#[derive(Default)]
pub struct DeleteFileTool {
    deleted: Mutex<Vec<String>>,
}

impl DeleteFileTool {
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, _runtime: &ToolRuntime) -> Result<ToolResult> {
        let path = params.required_str("path", "file to delete")?.to_string();
        self.deleted.lock().unwrap().push(path.clone());
        Ok(ToolResult::text(format!("deleted {path}")))
    }
}

//! Task tools run by specialist agents
//!
//! A tool turns structured JSON arguments into a JSON result. Arguments are
//! validated against the schema returned by [`Tool::describe`] before the
//! tool runs; the orchestrator never calls tools directly, it only sees the
//! specialist's reply.

use crate::observability::metrics::metrics;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

pub mod builtin;

#[async_trait]
pub trait Tool: Send + Sync {
    /// Name, description and JSON Schema for the arguments
    fn describe(&self) -> ToolDescription;

    /// Called once before the tool is registered
    async fn initialize(&mut self, config: Option<&Value>) -> Result<(), ToolError>;

    /// Run with arguments that already passed schema validation
    async fn execute(&self, parameters: &Value) -> Result<Value, ToolError>;

    async fn shutdown(&mut self) -> Result<(), ToolError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Registry of initialized tools, keyed by name
pub struct ToolSystem {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolSystem {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Initialize `tool` with `config` and make it callable by name
    pub async fn register(
        &mut self,
        mut tool: Box<dyn Tool>,
        config: Option<&Value>,
    ) -> Result<(), ToolError> {
        tool.initialize(config).await?;
        let name = tool.describe().name;
        debug!(tool = %name, "Tool registered");
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Register a builtin tool by name
    pub async fn register_builtin(
        &mut self,
        tool_name: &str,
        config: Option<&Value>,
    ) -> Result<(), ToolError> {
        let tool = create_builtin_tool(tool_name)?;
        self.register(tool, config).await
    }

    pub fn describe_tool(&self, tool_name: &str) -> Option<ToolDescription> {
        self.tools.get(tool_name).map(|tool| tool.describe())
    }

    /// Validate `parameters` and run the tool, recording timing metrics
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        parameters: &Value,
    ) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;

        validate_parameters(&tool.describe(), parameters)?;

        let started = Instant::now();
        let result = tool.execute(parameters).await;
        metrics().tool_executed(tool_name, started.elapsed(), result.is_ok());

        if let Err(e) = &result {
            warn!(tool = tool_name, error = %e, "Tool execution failed");
        }
        result
    }

    /// Registered tool names, sorted
    pub fn list_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn shutdown(&mut self) -> Result<(), ToolError> {
        for tool in self.tools.values_mut() {
            tool.shutdown().await?;
        }
        Ok(())
    }
}

impl Default for ToolSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Instantiate a builtin tool (uninitialized)
pub fn create_builtin_tool(tool_name: &str) -> Result<Box<dyn Tool>, ToolError> {
    match tool_name {
        builtin::CHECKOUT_TOOL => Ok(Box::new(builtin::CheckoutTool::new())),
        builtin::PR_DIFF_TOOL => Ok(Box::new(builtin::PullRequestDiffTool::new())),
        builtin::TEST_RUNNER_TOOL => Ok(Box::new(builtin::TestRunnerTool::new())),
        _ => Err(ToolError::UnknownTool(tool_name.to_string())),
    }
}

/// Check `parameters` against the tool's JSON Schema
pub fn validate_parameters(
    description: &ToolDescription,
    parameters: &Value,
) -> Result<(), ToolError> {
    let validator = jsonschema::validator_for(&description.parameters)
        .map_err(|e| ToolError::SchemaError(format!("Schema compilation error: {e}")))?;

    validator.validate(parameters).map_err(|errors| {
        let error_messages: Vec<String> = errors
            .map(|e| format!("At '{}': {}", e.instance_path, e))
            .collect();
        ToolError::ValidationError(error_messages.join("; "))
    })
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Tool initialization failed: {0}")]
    InitializationError(String),
    #[error("Parameter validation failed: {0}")]
    ValidationError(String),
    #[error("Schema error: {0}")]
    SchemaError(String),
    #[error("Tool execution failed: {0}")]
    ExecutionError(String),
    #[error("Tool shutdown failed: {0}")]
    ShutdownError(String),
}

impl ToolError {
    pub fn execution<S: Into<String>>(message: S) -> Self {
        ToolError::ExecutionError(message.into())
    }
}

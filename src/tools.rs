//! Tool definitions and execution.
//!
//! Two shapes live here:
//!
//! - [`ToolSpec`]: a tool *definition* (name, description, JSON schema) with
//!   no behavior attached. Workflow tools are advertised to backends as
//!   specs; their execution is intercepted by the agent runtime.
//! - [`Tool`]: a spec plus an async handler. Client tools registered on an
//!   agent are executed by the runtime between backend turns, wrapped in
//!   PreToolUse/PostToolUse hooks.
//!
//! Handlers use the pinned-boxed-future pattern so handlers of different
//! concrete types can live in one registry and cross thread boundaries.
//!
//! # Examples
//!
//! ```rust
//! use massgen::tool;
//! use serde_json::json;
//!
//! let weather = tool("get_weather", "Get current weather for a location")
//!     .param("location", "string")
//!     .build(|args| async move {
//!         let location = args["location"].as_str().unwrap_or("Unknown");
//!         Ok(json!({"location": location, "temperature": 22}))
//!     });
//! ```

use crate::Result;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Async tool handler: JSON arguments in, JSON result out.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// A tool definition without behavior: what gets advertised on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// OpenAI function-calling wire shape.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A tool definition plus its async handler.
#[derive(Clone)]
pub struct Tool {
    spec: ToolSpec,
    handler: ToolHandler,
}

impl Tool {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            spec: ToolSpec::new(name, description, parameters),
            handler: Arc::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn description(&self) -> &str {
        &self.spec.description
    }

    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    /// Execute the tool with the given arguments.
    pub async fn execute(&self, args: Value) -> Result<Value> {
        (self.handler)(args).await
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.spec.name)
            .field("description", &self.spec.description)
            .finish()
    }
}

/// Builder for [`Tool`] with simple `name: type` parameter notation.
pub struct ToolBuilder {
    name: String,
    description: String,
    properties: serde_json::Map<String, Value>,
    required: Vec<String>,
}

/// Start building a tool.
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder {
        name: name.into(),
        description: description.into(),
        properties: serde_json::Map::new(),
        required: Vec::new(),
    }
}

impl ToolBuilder {
    /// Add a required parameter with a simple JSON-schema type
    /// (`"string"`, `"number"`, `"integer"`, `"boolean"`).
    pub fn param(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let name = name.into();
        self.properties
            .insert(name.clone(), json!({"type": type_name.into()}));
        self.required.push(name);
        self
    }

    /// Add an optional parameter with a description.
    pub fn optional_param(
        mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.properties.insert(
            name.into(),
            json!({"type": type_name.into(), "description": description.into()}),
        );
        self
    }

    /// Finish with an async handler.
    pub fn build<F, Fut>(self, handler: F) -> Arc<Tool>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let parameters = json!({
            "type": "object",
            "properties": Value::Object(self.properties),
            "required": self.required,
        });
        Arc::new(Tool::new(
            self.name,
            self.description,
            parameters,
            move |args| Box::pin(handler(args)),
        ))
    }
}

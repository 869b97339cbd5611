//! Operation Schemas
//!
//! Every operation the gateway accepts is declared here: the fixed
//! sub-command prefix passed to the wrapped tool, the shape of each
//! positional argument, and the side-effect flags the executor uses to
//! manage the result cache. Requests for undeclared operations are rejected.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Rate class shared by every undeclared operation
pub const UNKNOWN_RATE_CLASS: &str = "unknown";

/// Shape an argument must match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    /// MCP server name: lowercase alphanumerics plus `.`, `_`, `-`
    ServerName,
    /// Generic identifier (catalog refs, image names)
    Identifier,
    /// Tool name exposed by an MCP server
    ToolName,
    /// `key=value` pair passed to a tool call
    KeyValue,
    /// JSON object with bounded nesting
    JsonObject,
    /// One of the declared `allowed` flags
    Flag,
}

/// A single positional parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ArgKind,
    /// Accepted values when `kind` is [`ArgKind::Flag`]
    #[serde(default)]
    pub allowed: Vec<String>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            allowed: Vec::new(),
        }
    }

    pub fn flag(name: impl Into<String>, allowed: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: ArgKind::Flag,
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Trailing repeated parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariadicSpec {
    pub param: ParamSpec,
    #[serde(default)]
    pub min: usize,
    pub max: usize,
}

/// Declared operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSchema {
    /// Operation name; filled from the table key when loaded from config
    #[serde(default)]
    pub name: String,

    /// Fixed sub-command prefix (e.g. `["mcp", "server", "ls"]`)
    pub argv: Vec<String>,

    /// Required positional parameters
    #[serde(default)]
    pub params: Vec<ParamSpec>,

    /// Optional positional parameters following the required ones
    #[serde(default)]
    pub optional: Vec<ParamSpec>,

    /// Optional trailing repeated parameter
    #[serde(default)]
    pub variadic: Option<VariadicSpec>,

    /// Changes server state
    #[serde(default)]
    pub mutating: bool,

    /// Successful output may be served from the result cache
    #[serde(default)]
    pub cacheable: bool,

    /// stdout is consumed as structured data
    #[serde(default)]
    pub protocol_output: bool,

    /// Operations whose cached results go stale when this one succeeds
    #[serde(default)]
    pub invalidates: Vec<String>,

    /// Rate-limit class; defaults to the operation name
    #[serde(default)]
    pub rate_class: Option<String>,
}

impl OperationSchema {
    /// Create a schema with a sub-command prefix and no parameters
    pub fn new(name: impl Into<String>, argv: &[&str]) -> Self {
        Self {
            name: name.into(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            params: Vec::new(),
            optional: Vec::new(),
            variadic: None,
            mutating: false,
            cacheable: false,
            protocol_output: false,
            invalidates: Vec::new(),
            rate_class: None,
        }
    }

    pub fn param(mut self, name: &str, kind: ArgKind) -> Self {
        self.params.push(ParamSpec::new(name, kind));
        self
    }

    pub fn optional_param(mut self, name: &str, kind: ArgKind) -> Self {
        self.optional.push(ParamSpec::new(name, kind));
        self
    }

    pub fn variadic(mut self, name: &str, kind: ArgKind, min: usize, max: usize) -> Self {
        self.variadic = Some(VariadicSpec {
            param: ParamSpec::new(name, kind),
            min,
            max,
        });
        self
    }

    pub fn mutating(mut self, invalidates: &[&str]) -> Self {
        self.mutating = true;
        self.invalidates = invalidates.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn protocol(mut self) -> Self {
        self.protocol_output = true;
        self
    }

    pub fn rate_class(mut self, class: &str) -> Self {
        self.rate_class = Some(class.to_string());
        self
    }

    /// Smallest accepted argument count
    pub fn min_args(&self) -> usize {
        self.params.len() + self.variadic.as_ref().map_or(0, |v| v.min)
    }

    /// Largest accepted argument count
    pub fn max_args(&self) -> usize {
        self.params.len() + self.optional.len() + self.variadic.as_ref().map_or(0, |v| v.max)
    }

    /// Parameter governing the argument at `index`
    pub fn param_for(&self, index: usize) -> Option<&ParamSpec> {
        if index < self.params.len() {
            return self.params.get(index);
        }
        let index = index - self.params.len();
        if index < self.optional.len() {
            return self.optional.get(index);
        }
        let index = index - self.optional.len();
        match &self.variadic {
            Some(v) if index < v.max => Some(&v.param),
            _ => None,
        }
    }

    /// Rate-limit class for this operation
    pub fn rate_class_name(&self) -> &str {
        self.rate_class.as_deref().unwrap_or(&self.name)
    }

    /// Full argument vector for the wrapped tool
    pub fn command_line(&self, args: &[String]) -> Vec<String> {
        self.argv.iter().chain(args.iter()).cloned().collect()
    }
}

/// Registry of declared operations
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, OperationSchema>,
}

impl SchemaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in operations for the `docker mcp` plugin
    pub fn docker_mcp() -> Self {
        const SERVER_STATE: &[&str] = &["list-servers", "inspect-server", "list-tools"];

        let mut registry = Self::new();
        registry.register(
            OperationSchema::new("list-servers", &["mcp", "server", "ls", "--json"])
                .cacheable()
                .protocol(),
        );
        registry.register(
            OperationSchema::new("inspect-server", &["mcp", "server", "inspect"])
                .param("server", ArgKind::ServerName)
                .cacheable()
                .protocol(),
        );
        registry.register(
            OperationSchema::new("enable-server", &["mcp", "server", "enable"])
                .variadic("server", ArgKind::ServerName, 1, 16)
                .mutating(SERVER_STATE)
                .rate_class("server-state"),
        );
        registry.register(
            OperationSchema::new("disable-server", &["mcp", "server", "disable"])
                .variadic("server", ArgKind::ServerName, 1, 16)
                .mutating(SERVER_STATE)
                .rate_class("server-state"),
        );
        registry.register(
            OperationSchema::new("reset-servers", &["mcp", "server", "reset"])
                .mutating(SERVER_STATE)
                .rate_class("server-state"),
        );
        registry.register(
            OperationSchema::new("list-tools", &["mcp", "tools", "ls", "--format=json"])
                .cacheable()
                .protocol(),
        );
        registry.register(
            OperationSchema::new("call-tool", &["mcp", "tools", "call"])
                .param("tool", ArgKind::ToolName)
                .variadic("argument", ArgKind::KeyValue, 0, 32),
        );
        registry.register(
            OperationSchema::new("catalog-show", &["mcp", "catalog", "show", "--format=json"])
                .optional_param("catalog", ArgKind::Identifier)
                .cacheable()
                .protocol(),
        );
        registry
    }

    /// Add or replace a schema
    pub fn register(&mut self, schema: OperationSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Look up a schema by operation name
    pub fn get(&self, operation: &str) -> Option<&OperationSchema> {
        self.schemas.get(operation)
    }

    /// Rate class for an operation; unknown operations share [`UNKNOWN_RATE_CLASS`]
    pub fn rate_class(&self, operation: &str) -> String {
        self.get(operation)
            .map(|s| s.rate_class_name().to_string())
            .unwrap_or_else(|| UNKNOWN_RATE_CLASS.to_string())
    }

    /// Sorted operation names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

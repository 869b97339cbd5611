//! Command Validation Module
//!
//! Inspects a [`CommandRequest`] before anything is allocated for it. The
//! check is a pure function of the request and the schema registry.
//!
//! Validation runs in two phases:
//!
//! 1. **Injection** (fail-fast): arguments are scanned left to right for shell
//!    chaining/substitution patterns; the first hit stops validation.
//! 2. **Schema** (collected): arity, per-argument shape, JSON nesting, context
//!    shape and timeout bounds. All violations are reported together.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::request::CommandRequest;
use super::schema::{ArgKind, ParamSpec, SchemaRegistry};

/// Default maximum nesting depth for JSON object arguments
pub const DEFAULT_MAX_JSON_DEPTH: usize = 4;

/// Default maximum length of a single argument in bytes
pub const DEFAULT_MAX_ARG_LEN: usize = 4096;

/// Default ceiling on a requested timeout
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(600);

/// Patterns that enable command chaining or substitution when a shell is involved.
///
/// Ordered so multi-character patterns win over their single-character prefix.
const INJECTION_PATTERNS: &[(&str, &str)] = &[
    ("&&", "command chaining"),
    ("||", "command chaining"),
    ("$(", "command substitution"),
    ("${", "parameter expansion"),
    ("`", "command substitution"),
    (";", "command separator"),
    ("|", "pipe"),
    ("&", "background execution"),
    ("\n", "newline"),
    ("\r", "carriage return"),
    ("\0", "NUL byte"),
    (">", "redirection"),
    ("<", "redirection"),
];

lazy_static! {
    static ref SERVER_NAME: Regex = Regex::new(r"^[a-z0-9][a-z0-9._-]{0,62}$").unwrap();
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/:@-]{0,127}$").unwrap();
    static ref TOOL_NAME: Regex = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,63}$").unwrap();
    static ref KV_KEY: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]{0,63}$").unwrap();
}

/// Which phase rejected the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionClass {
    Injection,
    Schema,
}

impl fmt::Display for RejectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionClass::Injection => write!(f, "injection"),
            RejectionClass::Schema => write!(f, "schema"),
        }
    }
}

/// A single validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Zero-based argument index, `None` for request-level fields
    pub index: Option<usize>,

    /// Field that failed (parameter name, "context", "timeout", ...)
    pub field: String,

    /// Human-readable reason
    pub reason: String,
}

impl Violation {
    fn at(index: usize, field: &str, reason: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    fn field(field: &str, reason: impl Into<String>) -> Self {
        Self {
            index: None,
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "argument {} ({}): {}", index, self.field, self.reason),
            None => write!(f, "{}: {}", self.field, self.reason),
        }
    }
}

/// Why a request was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub class: RejectionClass,
    pub violations: Vec<Violation>,
}

impl Rejection {
    fn injection(violation: Violation) -> Self {
        Self {
            class: RejectionClass::Injection,
            violations: vec![violation],
        }
    }

    /// First (leftmost) violation
    pub fn first(&self) -> Option<&Violation> {
        self.violations.first()
    }

    /// Index of the first offending argument, if the failure is argument-level
    pub fn offending_index(&self) -> Option<usize> {
        self.first().and_then(|v| v.index)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} violation: ", self.class)?;
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", violation)?;
        }
        Ok(())
    }
}

/// Outcome of validating a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Accepted,
    Rejected(Rejection),
}

impl ValidationResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationResult::Accepted)
    }
}

/// Command validator that enforces the declared operation schemas
///
/// # Security Principles
///
/// 1. **Declared Operations Only**: undeclared operations never reach a process
/// 2. **No Shell Injection**: chaining/substitution patterns are refused outright
/// 3. **Shape Checking**: every argument must match its parameter's character class
/// 4. **No Flag Smuggling**: positional values may not start with `-`
#[derive(Debug, Clone)]
pub struct CommandValidator {
    registry: Arc<SchemaRegistry>,
    max_json_depth: usize,
    max_arg_len: usize,
    max_timeout: Duration,
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::new(Arc::new(SchemaRegistry::docker_mcp()))
    }
}

impl CommandValidator {
    /// Create a validator over a schema registry with default limits
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            max_json_depth: DEFAULT_MAX_JSON_DEPTH,
            max_arg_len: DEFAULT_MAX_ARG_LEN,
            max_timeout: DEFAULT_MAX_TIMEOUT,
        }
    }

    pub fn with_max_json_depth(mut self, depth: usize) -> Self {
        self.max_json_depth = depth;
        self
    }

    pub fn with_max_arg_len(mut self, len: usize) -> Self {
        self.max_arg_len = len;
        self
    }

    pub fn with_max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = timeout;
        self
    }

    /// Validate a request
    ///
    /// # Example
    ///
    /// ```
    /// use execgate::command::{CommandRequest, CommandValidator};
    /// use execgate::identity::Identity;
    ///
    /// let validator = CommandValidator::default();
    /// let request = CommandRequest::new(Identity::new("alice"), "inspect-server", ["github"]);
    /// assert!(validator.validate(&request).is_accepted());
    /// ```
    pub fn validate(&self, request: &CommandRequest) -> ValidationResult {
        if let Err(violation) = self.check_injection(request) {
            return ValidationResult::Rejected(Rejection::injection(violation));
        }

        let violations = self.check_schema(request);
        if violations.is_empty() {
            ValidationResult::Accepted
        } else {
            ValidationResult::Rejected(Rejection {
                class: RejectionClass::Schema,
                violations,
            })
        }
    }

    /// Phase 1: stop at the first argument carrying an injection pattern
    fn check_injection(&self, request: &CommandRequest) -> Result<(), Violation> {
        for (index, arg) in request.args().iter().enumerate() {
            if let Some(reason) = find_injection(arg) {
                return Err(Violation::at(index, "argument", reason));
            }
        }
        if let Some(context) = request.context() {
            if let Some(reason) = find_injection(context) {
                return Err(Violation::field("context", reason));
            }
        }
        Ok(())
    }

    /// Phase 2: collect every schema violation
    fn check_schema(&self, request: &CommandRequest) -> Vec<Violation> {
        let mut violations = Vec::new();

        let Some(schema) = self.registry.get(request.operation()) else {
            violations.push(Violation::field(
                "operation",
                format!("unknown operation '{}'", request.operation().escape_debug()),
            ));
            return violations;
        };

        let count = request.args().len();
        if count < schema.min_args() || count > schema.max_args() {
            violations.push(Violation::field(
                "arguments",
                format!(
                    "expected between {} and {} arguments, got {}",
                    schema.min_args(),
                    schema.max_args(),
                    count
                ),
            ));
        }

        for (index, arg) in request.args().iter().enumerate() {
            let Some(param) = schema.param_for(index) else {
                continue;
            };
            if let Err(reason) = self.check_shape(arg, param) {
                violations.push(Violation::at(index, &param.name, reason));
            }
        }

        if let Some(context) = request.context() {
            if !SERVER_NAME.is_match(context) {
                violations.push(Violation::field("context", "not a valid server name"));
            }
        }

        if let Some(timeout) = request.timeout() {
            if timeout.is_zero() {
                violations.push(Violation::field("timeout", "must be greater than zero"));
            } else if timeout > self.max_timeout {
                violations.push(Violation::field(
                    "timeout",
                    format!("exceeds maximum of {}s", self.max_timeout.as_secs()),
                ));
            }
        }

        violations
    }

    /// Check a single argument against its parameter's declared shape
    fn check_shape(&self, arg: &str, param: &ParamSpec) -> Result<(), String> {
        if arg.len() > self.max_arg_len {
            return Err(format!("longer than {} bytes", self.max_arg_len));
        }
        if param.kind != ArgKind::Flag && arg.starts_with('-') {
            return Err("positional value may not start with '-'".to_string());
        }

        match param.kind {
            ArgKind::ServerName => {
                if !SERVER_NAME.is_match(arg) {
                    return Err("not a valid server name".to_string());
                }
            }
            ArgKind::Identifier => {
                if !IDENTIFIER.is_match(arg) {
                    return Err("not a valid identifier".to_string());
                }
                if arg.contains("..") {
                    return Err("contains directory traversal".to_string());
                }
            }
            ArgKind::ToolName => {
                if !TOOL_NAME.is_match(arg) {
                    return Err("not a valid tool name".to_string());
                }
            }
            ArgKind::KeyValue => {
                let Some((key, value)) = arg.split_once('=') else {
                    return Err("expected key=value".to_string());
                };
                if !KV_KEY.is_match(key) {
                    return Err("invalid key".to_string());
                }
                if value.chars().any(char::is_control) {
                    return Err("value contains control characters".to_string());
                }
            }
            ArgKind::JsonObject => {
                let value: serde_json::Value =
                    serde_json::from_str(arg).map_err(|_| "not valid JSON".to_string())?;
                if !value.is_object() {
                    return Err("expected a JSON object".to_string());
                }
                let depth = json_depth(&value);
                if depth > self.max_json_depth {
                    return Err(format!(
                        "nesting depth {} exceeds maximum of {}",
                        depth, self.max_json_depth
                    ));
                }
            }
            ArgKind::Flag => {
                if !param.allowed.iter().any(|allowed| allowed == arg) {
                    return Err("flag is not allowed".to_string());
                }
            }
        }
        Ok(())
    }

    /// Check if an operation is declared
    pub fn is_known(&self, operation: &str) -> bool {
        self.registry.get(operation).is_some()
    }

    /// Get the schema registry
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }
}

/// Return a description of the first injection pattern found in `input`
fn find_injection(input: &str) -> Option<String> {
    INJECTION_PATTERNS
        .iter()
        .filter_map(|(pattern, label)| input.find(pattern).map(|pos| (pos, *pattern, *label)))
        .min_by_key(|(pos, pattern, _)| (*pos, usize::MAX - pattern.len()))
        .map(|(_, pattern, label)| {
            format!(
                "contains shell metacharacter '{}' ({})",
                pattern.escape_debug(),
                label
            )
        })
}

fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        serde_json::Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::schema::OperationSchema;
    use crate::identity::Identity;
    use proptest::prelude::*;

    fn request(operation: &str, args: &[&str]) -> CommandRequest {
        CommandRequest::new(Identity::new("alice"), operation, args.iter().copied())
    }

    fn rejection(result: ValidationResult) -> Rejection {
        match result {
            ValidationResult::Rejected(r) => r,
            ValidationResult::Accepted => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_accepts_valid_requests() {
        let validator = CommandValidator::default();
        let cases: Vec<(&str, Vec<&str>)> = vec![
            ("list-servers", vec![]),
            ("inspect-server", vec!["github"]),
            ("enable-server", vec!["github", "slack", "brave-search"]),
            ("call-tool", vec!["search", "query=rust async", "limit=10"]),
            ("catalog-show", vec![]),
            ("catalog-show", vec!["docker-mcp"]),
        ];
        for (operation, args) in cases {
            let result = validator.validate(&request(operation, &args));
            assert!(result.is_accepted(), "Should accept: {} {:?}", operation, args);
        }
    }

    #[test]
    fn test_rejects_injection_at_offending_index() {
        let validator = CommandValidator::default();
        let result = validator.validate(&request("enable-server", &["github", "server; rm -rf /"]));
        let rejection = rejection(result);

        assert_eq!(rejection.class, RejectionClass::Injection);
        assert_eq!(rejection.offending_index(), Some(1));
        assert!(rejection.to_string().contains("command separator"));
    }

    #[test]
    fn test_injection_is_fail_fast_left_to_right() {
        let validator = CommandValidator::default();
        let result = validator.validate(&request(
            "enable-server",
            &["ok", "a|b", "c;d", "$(whoami)"],
        ));
        let rejection = rejection(result);
        assert_eq!(rejection.violations.len(), 1);
        assert_eq!(rejection.offending_index(), Some(1));
    }

    #[test]
    fn test_minimum_injection_patterns() {
        let validator = CommandValidator::default();
        let dangerous = vec![
            ("x;y", "command separator"),
            ("x&&y", "command chaining"),
            ("x|y", "pipe"),
            ("x`id`", "command substitution"),
            ("x$(id)", "command substitution"),
            ("x&y", "background execution"),
            ("x\ny", "newline"),
            ("x>y", "redirection"),
            ("x${HOME}", "parameter expansion"),
        ];
        for (arg, label) in dangerous {
            let rejection = rejection(validator.validate(&request("call-tool", &["search", arg])));
            assert_eq!(rejection.class, RejectionClass::Injection, "arg {:?}", arg);
            assert!(
                rejection.to_string().contains(label),
                "arg {:?} should be reported as {}: {}",
                arg,
                label,
                rejection
            );
        }
    }

    #[test]
    fn test_double_ampersand_reported_as_chaining() {
        let validator = CommandValidator::default();
        let rejection = rejection(validator.validate(&request("inspect-server", &["a&&b"])));
        assert!(rejection.to_string().contains("chaining"));
    }

    #[test]
    fn test_rejects_injection_in_context() {
        let validator = CommandValidator::default();
        let req = request("inspect-server", &["github"]).with_context("github;reboot");
        let rejection = rejection(validator.validate(&req));
        assert_eq!(rejection.class, RejectionClass::Injection);
        assert_eq!(rejection.offending_index(), None);
        assert_eq!(rejection.first().unwrap().field, "context");
    }

    #[test]
    fn test_unknown_operation() {
        let validator = CommandValidator::default();
        let rejection = rejection(validator.validate(&request("rm", &["-rf"])));
        assert_eq!(rejection.class, RejectionClass::Schema);
        assert_eq!(rejection.first().unwrap().field, "operation");
    }

    #[test]
    fn test_schema_errors_are_collected() {
        let validator = CommandValidator::default();
        let req = request("enable-server", &["GitHub", "ok-server", "Bad_Name"])
            .with_context("Not Valid")
            .with_timeout(Duration::from_secs(3600));
        let rejection = rejection(validator.validate(&req));

        assert_eq!(rejection.class, RejectionClass::Schema);
        let indices: Vec<Option<usize>> = rejection.violations.iter().map(|v| v.index).collect();
        assert_eq!(indices, vec![Some(0), Some(2), None, None]);
        assert_eq!(rejection.violations[2].field, "context");
        assert_eq!(rejection.violations[3].field, "timeout");
    }

    #[test]
    fn test_arity_violations() {
        let validator = CommandValidator::default();

        let rejection = rejection(validator.validate(&request("inspect-server", &[])));
        assert_eq!(rejection.first().unwrap().field, "arguments");

        let rejection = self::rejection(validator.validate(&request("list-servers", &["extra"])));
        assert_eq!(rejection.first().unwrap().field, "arguments");
    }

    #[test]
    fn test_rejects_flag_smuggling() {
        let validator = CommandValidator::default();
        let rejection = rejection(validator.validate(&request("call-tool", &["--config=/etc/x"])));
        assert!(rejection.first().unwrap().reason.contains("may not start with '-'"));
    }

    #[test]
    fn test_rejects_directory_traversal_identifier() {
        let validator = CommandValidator::default();
        let rejection = rejection(validator.validate(&request("catalog-show", &["a/../../etc"])));
        assert!(rejection.first().unwrap().reason.contains("traversal"));
    }

    #[test]
    fn test_key_value_shape() {
        let validator = CommandValidator::default();
        assert!(!validator
            .validate(&request("call-tool", &["search", "noequals"]))
            .is_accepted());
        assert!(!validator
            .validate(&request("call-tool", &["search", "9bad=1"]))
            .is_accepted());
        assert!(validator
            .validate(&request("call-tool", &["search", "q=a=b"]))
            .is_accepted());
    }

    #[test]
    fn test_json_object_nesting() {
        let mut registry = SchemaRegistry::new();
        registry.register(
            OperationSchema::new("configure", &["mcp", "config", "write"])
                .param("config", ArgKind::JsonObject),
        );
        let validator = CommandValidator::new(Arc::new(registry)).with_max_json_depth(2);

        assert!(validator
            .validate(&request("configure", &[r#"{"github": {"token_ref": "x"}}"#]))
            .is_accepted());

        let rejection = rejection(
            validator.validate(&request("configure", &[r#"{"a": {"b": {"c": 1}}}"#])),
        );
        assert!(rejection.first().unwrap().reason.contains("nesting depth 3"));

        let rejection = self::rejection(validator.validate(&request("configure", &["[1, 2]"])));
        assert!(rejection.first().unwrap().reason.contains("JSON object"));
    }

    #[test]
    fn test_flag_param() {
        let mut registry = SchemaRegistry::new();
        let mut schema = OperationSchema::new("logs", &["mcp", "gateway", "logs"]);
        schema.optional.push(ParamSpec::flag("follow", &["--follow"]));
        registry.register(schema);
        let validator = CommandValidator::new(Arc::new(registry));

        assert!(validator.validate(&request("logs", &["--follow"])).is_accepted());
        assert!(!validator.validate(&request("logs", &["--all"])).is_accepted());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let validator = CommandValidator::default();
        let req = request("list-servers", &[]).with_timeout(Duration::ZERO);
        assert!(!validator.validate(&req).is_accepted());
    }

    #[test]
    fn test_is_known() {
        let validator = CommandValidator::default();
        assert!(validator.is_known("list-servers"));
        assert!(!validator.is_known("exec"));
    }

    proptest! {
        #[test]
        fn prop_injection_always_rejected(
            prefix in "[a-z0-9]{0,8}",
            pattern in prop::sample::select(vec![";", "&&", "|", "`", "$(", "&"]),
            suffix in "[a-z0-9 ]{0,8}",
        ) {
            let validator = CommandValidator::default();
            let arg = format!("{}{}{}", prefix, pattern, suffix);
            let result = validator.validate(&request("enable-server", &["github", &arg]));
            match result {
                ValidationResult::Rejected(r) => {
                    prop_assert_eq!(r.class, RejectionClass::Injection);
                    prop_assert_eq!(r.offending_index(), Some(1));
                }
                ValidationResult::Accepted => prop_assert!(false, "accepted {:?}", arg),
            }
        }

        #[test]
        fn prop_valid_server_names_accepted(name in "[a-z0-9][a-z0-9._-]{0,30}") {
            let validator = CommandValidator::default();
            prop_assert!(validator.validate(&request("inspect-server", &[&name])).is_accepted());
        }
    }
}

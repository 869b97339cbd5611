//! Command Model
//!
//! Requests, the declared operation schemas, and the validator that every
//! request must pass before it reaches a process.

pub mod request;
pub mod schema;
pub mod validator;

pub use request::CommandRequest;
pub use schema::{ArgKind, OperationSchema, ParamSpec, SchemaRegistry, VariadicSpec, UNKNOWN_RATE_CLASS};
pub use validator::{CommandValidator, Rejection, RejectionClass, ValidationResult, Violation};

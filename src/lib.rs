//! ExecGate Library
//!
//! A security gateway in front of a container-orchestration CLI. Every
//! command request is rate limited, validated against a declared schema,
//! executed with a scrubbed environment and a fresh credential, and written
//! to an encrypted audit trail.

pub mod audit;
pub mod cache;
pub mod command;
pub mod config;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod identity;
pub mod metrics;
pub mod oauth;
pub mod rate_limit;

pub use error::GatewayError;
pub use gateway::{CommandResponse, Gateway};

//! OAuth Credential Refresh
//!
//! Keeps each session's bearer credential valid for the whole life of a
//! request.
//!
//! # Features
//!
//! - Proactive refresh of expired credentials (with configurable skew)
//! - Refresh-and-retry-once on downstream authorization failures
//! - Single-flight refresh per session: concurrent callers share one call
//! - `VALID` / `REFRESHING` / `FAILED` state machine; failed sessions stay
//!   failed until re-authenticated
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   call(session, op)   ┌──────────────────┐
//! │  OAuthInterceptor│──────────────────────▶│  wrapped op      │
//! │                  │◀── Completed/Unauth ──│  (executor run)  │
//! └────────┬─────────┘                       └──────────────────┘
//!          │ refresh (single-flight per session)
//!          ▼
//! ┌──────────────────┐                       ┌──────────────────┐
//! │  RefreshClient   │──── refresh_token ───▶│  token endpoint  │
//! └──────────────────┘                       └──────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod interceptor;
pub mod session;

pub use client::{DisabledRefreshClient, HttpRefreshClient, RefreshClient, RefreshError, TokenGrant};
pub use config::OAuthConfig;
pub use interceptor::{Attempt, OAuthInterceptor};
pub use session::{RefreshState, Session, SessionRegistry};

//! Rate Limiting Module
//!
//! Per-principal admission control over fixed windows, scoped by operation
//! class.
//!
//! # Features
//!
//! - Fixed window per `(principal, class)`, opened by the first admitted call
//! - Atomic check-and-increment under a single lock
//! - Retry-after equal to the time left in the window
//! - Per-class limit overrides and exempt principals
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                RateLimiter                   │
//! │   admit(identity, class) -> Allow | Deny     │
//! ├─────────────────────────────────────────────┤
//! │  ┌───────────────────────────────────────┐  │
//! │  │  WindowStore: Mutex<Scope -> Window>  │  │
//! │  └───────────────────────────────────────┘  │
//! └─────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod manager;
pub mod store;
pub mod window;

pub use config::RateLimitConfig;
pub use manager::{RateLimitDecision, RateLimiter};
pub use store::WindowStore;
pub use window::{RateScope, WindowStats};

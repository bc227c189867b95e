//! PostgreSQL-backed access-control policy manager.
//!
//! # Purpose
//! Tulip keeps authorization rules durable in Postgres and answers
//! enforcement queries from a sorted in-memory cache, never touching the
//! database on the request path.
//!
//! # How it fits
//! Mutations write through to storage; a row-level trigger posts a change
//! notification that the manager replays into the cache, and a periodic full
//! reload reconciles anything the notification channel lost. Decisions are
//! made by a pluggable [`Matcher`]; the reference matcher implements
//! RBAC with domains.
//!
//! # Key invariants
//! - Rule sets are sorted, duplicate-free, and mutated only under the cache
//!   mutex, which is never held across I/O.
//! - Storage writes are idempotent under the content id, so change events
//!   and reload scans can interleave in any order.
//! - Mutations are eventually consistent with the cache, bounded by
//!   notification latency or one sync interval.
//!
//! # Examples
//! ```no_run
//! use tulip::{Manager, ManagerOptions, rbac_with_domain};
//!
//! # async fn run() -> tulip::Result<()> {
//! let manager = Manager::connect(
//!     "postgres://tulip@localhost/postgres",
//!     rbac_with_domain,
//!     ManagerOptions::default(),
//! )
//! .await?;
//! manager
//!     .add_policy(tulip::PolicyType::P, &["alice", "uni", "class_a", "teach"])
//!     .await?;
//! // ...the cache catches up via the change notification...
//! assert!(manager.enforce(&["alice", "uni", "class_a", "teach"]));
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod errors;
mod manager;
mod matcher;
mod rules;
pub mod store;

pub use config::{
    ConnectionSpec, ManagerOptions, DEFAULT_DATABASE_NAME, DEFAULT_SYNC_INTERVAL,
    DEFAULT_TABLE_NAME, DEFAULT_TIMEOUT,
};
pub use errors::{Error, Result};
pub use manager::Manager;
pub use matcher::{rbac_with_domain, Matcher, PolicyView};
pub use rules::{rule_id, PolicyType, Rule, RuleSet, RULE_WIDTH};

//! Durable storage behind the policy cache.
//!
//! The manager never reads rules from storage on the request path; it only
//! writes through this trait and replays the change stream (plus a periodic
//! full scan) into its in-memory cache. Two backends implement the trait:
//! Postgres ([`postgres::PostgresPolicyStore`]) for real deployments, and an
//! in-memory twin ([`memory::InMemoryPolicyStore`]) for tests, demos, and
//! embeddings that do not need durability.

use async_trait::async_trait;
use thiserror::Error;

use crate::rules::{PolicyType, Rule};

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error("storage is closed")]
    Closed,
    #[error("connect: {0}")]
    Connect(String),
    #[error("decode notification: {0}")]
    Decode(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// How a committed row change is surfaced on the change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOp {
    Insert,
    Delete,
}

/// One committed row change.
///
/// `ptype` is carried raw: the stream can deliver rows written by other
/// writers with policy types this manager does not cache, and the consumer
/// decides to drop those, not the transport.
#[derive(Debug, Clone)]
pub struct PolicyEvent {
    pub op: PolicyOp,
    pub ptype: String,
    pub rule: Rule,
}

/// A subscription to the change stream.
#[async_trait]
pub trait PolicyEvents: Send {
    /// Wait for the next committed change.
    ///
    /// Returns `Ok(None)` once the stream has shut down cleanly (the
    /// underlying connection or sender is gone). An `Err` is a transient
    /// fault: the consumer may keep calling.
    async fn next_event(&mut self) -> StoreResult<Option<PolicyEvent>>;
}

/// Rule storage: durable writes, a full scan, and a change stream.
///
/// All writes are idempotent under the content id ([`crate::rule_id`]):
/// re-inserting an existing rule and deleting a missing rule both succeed
/// without emitting a change event, which is what lets the cache replay
/// events and reload scans in any interleaving.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Every stored rule. Order is unspecified; callers sort.
    async fn scan_all(&self) -> StoreResult<Vec<(PolicyType, Rule)>>;

    /// Insert one rule. No-op when the id already exists.
    async fn insert_rule(&self, ptype: PolicyType, rule: &Rule) -> StoreResult<()>;

    /// Insert a batch of rules in a single transaction.
    async fn insert_batch(&self, rules: &[(PolicyType, Rule)]) -> StoreResult<()>;

    /// Delete one rule by content id. Missing rows are success.
    async fn delete_rule(&self, ptype: PolicyType, rule: &Rule) -> StoreResult<()>;

    /// Delete a batch of rules in a single transaction.
    async fn delete_batch(&self, rules: &[(PolicyType, Rule)]) -> StoreResult<()>;

    /// Open a subscription to committed row changes.
    async fn subscribe(&self) -> StoreResult<Box<dyn PolicyEvents>>;

    /// Release connections. Mutations issued afterwards fail with
    /// [`StoreError::Closed`]; open subscriptions end cleanly.
    async fn close(&self) -> StoreResult<()>;

    fn backend_name(&self) -> &'static str;
}

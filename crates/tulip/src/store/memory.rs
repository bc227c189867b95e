//! In-memory implementation of the policy store.
//!
//! Rows live in a `HashMap` keyed by content id, guarded by
//! `tokio::sync::RwLock`; the change stream is a `tokio::sync::broadcast`
//! channel. An event is sent only when a row actually changes, mirroring the
//! Postgres trigger, which fires per committed row change and therefore stays
//! silent for `ON CONFLICT DO NOTHING` inserts and deletes of missing rows.
//!
//! Not durable: all state is lost on drop. Slow subscribers can lag past the
//! channel capacity and lose events; the manager's periodic reload reconciles
//! exactly as it does for lost Postgres notifications.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use super::{PolicyEvent, PolicyEvents, PolicyOp, PolicyStore, StoreError, StoreResult};
use crate::rules::{rule_id, PolicyType, Rule};

/// Capacity of the broadcast channel backing subscriptions.
const EVENT_BUFFER: usize = 64;

/// Volatile policy store for tests, demos, and non-durable embeddings.
pub struct InMemoryPolicyStore {
    rows: RwLock<HashMap<String, (PolicyType, Rule)>>,
    /// `None` once closed; doubles as the closed flag for mutations.
    events: RwLock<Option<broadcast::Sender<PolicyEvent>>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            rows: RwLock::new(HashMap::new()),
            events: RwLock::new(Some(sender)),
        }
    }

    async fn publish(&self, op: PolicyOp, ptype: PolicyType, rule: &Rule) -> StoreResult<()> {
        let events = self.events.read().await;
        let sender = events.as_ref().ok_or(StoreError::Closed)?;
        // A send error just means nobody is subscribed right now.
        let _ = sender.send(PolicyEvent {
            op,
            ptype: ptype.as_str().to_string(),
            rule: rule.clone(),
        });
        Ok(())
    }

    async fn ensure_open(&self) -> StoreResult<()> {
        if self.events.read().await.is_none() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn insert_row(&self, ptype: PolicyType, rule: &Rule) -> StoreResult<bool> {
        self.ensure_open().await?;
        let mut rows = self.rows.write().await;
        let id = rule_id(ptype, rule);
        if rows.contains_key(&id) {
            return Ok(false);
        }
        rows.insert(id, (ptype, rule.clone()));
        Ok(true)
    }

    async fn delete_row(&self, ptype: PolicyType, rule: &Rule) -> StoreResult<bool> {
        self.ensure_open().await?;
        let mut rows = self.rows.write().await;
        Ok(rows.remove(&rule_id(ptype, rule)).is_some())
    }

    /// Insert a row without emitting a change event, as if the notification
    /// had been lost in transit. Only the periodic reload can surface it.
    #[cfg(test)]
    pub(crate) async fn insert_unnotified(&self, ptype: PolicyType, rule: &Rule) {
        self.insert_row(ptype, rule).await.expect("store open");
    }
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn scan_all(&self) -> StoreResult<Vec<(PolicyType, Rule)>> {
        self.ensure_open().await?;
        let rows = self.rows.read().await;
        Ok(rows.values().cloned().collect())
    }

    async fn insert_rule(&self, ptype: PolicyType, rule: &Rule) -> StoreResult<()> {
        if self.insert_row(ptype, rule).await? {
            self.publish(PolicyOp::Insert, ptype, rule).await?;
        }
        Ok(())
    }

    async fn insert_batch(&self, rules: &[(PolicyType, Rule)]) -> StoreResult<()> {
        for (ptype, rule) in rules {
            self.insert_rule(*ptype, rule).await?;
        }
        Ok(())
    }

    async fn delete_rule(&self, ptype: PolicyType, rule: &Rule) -> StoreResult<()> {
        if self.delete_row(ptype, rule).await? {
            self.publish(PolicyOp::Delete, ptype, rule).await?;
        }
        Ok(())
    }

    async fn delete_batch(&self, rules: &[(PolicyType, Rule)]) -> StoreResult<()> {
        for (ptype, rule) in rules {
            self.delete_rule(*ptype, rule).await?;
        }
        Ok(())
    }

    async fn subscribe(&self) -> StoreResult<Box<dyn PolicyEvents>> {
        let events = self.events.read().await;
        let sender = events.as_ref().ok_or(StoreError::Closed)?;
        Ok(Box::new(BroadcastEvents {
            receiver: sender.subscribe(),
        }))
    }

    async fn close(&self) -> StoreResult<()> {
        // Dropping the sender ends every subscription after it drains.
        self.events.write().await.take();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct BroadcastEvents {
    receiver: broadcast::Receiver<PolicyEvent>,
}

#[async_trait]
impl PolicyEvents for BroadcastEvents {
    async fn next_event(&mut self) -> StoreResult<Option<PolicyEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "policy event subscriber lagged; reload will reconcile");
                }
            }
        }
    }
}

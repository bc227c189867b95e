//! The policy manager: cached rule sets, write-through mutations, and the
//! background tasks that keep the cache coherent.
//!
//! Two rule sets (base and grouping policies) sit behind one mutex. Mutations
//! write through to storage and return once the row is durable; the cache
//! catches up when the change notification arrives, or at the latest on the
//! next periodic full reload. Enforcement and filtering read only the cache.
//!
//! The mutex is held only across in-memory operations, never across storage
//! I/O or awaits. Two background tasks run per manager: the notification
//! consumer and the periodic reloader. [`Manager::close`] signals both,
//! joins them, and only then releases the store's connections.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{ConnectionSpec, ManagerOptions};
use crate::errors::Result;
use crate::matcher::{Matcher, PolicyView};
use crate::rules::{PolicyType, Rule, RuleSet, RULE_WIDTH};
use crate::store::postgres::PostgresPolicyStore;
use crate::store::{PolicyEvent, PolicyEvents, PolicyOp, PolicyStore};

#[derive(Default)]
struct CachedPolicies {
    p: RuleSet,
    g: RuleSet,
}

struct ManagerInner {
    cache: Mutex<CachedPolicies>,
    store: Arc<dyn PolicyStore>,
    matcher: Matcher,
}

/// Access-control policy manager.
///
/// Created with [`Manager::connect`] (Postgres) or [`Manager::with_store`]
/// (any [`PolicyStore`]). Reads are synchronous and served from memory;
/// mutations are async and eventually consistent with the cache, bounded by
/// notification latency or one sync interval.
pub struct Manager {
    inner: Arc<ManagerInner>,
    shutdown: watch::Sender<bool>,
    listener: JoinHandle<()>,
    reloader: JoinHandle<()>,
}

impl Manager {
    /// Connect to Postgres, bootstrap per `options`, load the cache, and
    /// start the background tasks.
    pub async fn connect(
        conn: impl Into<ConnectionSpec>,
        matcher: Matcher,
        options: ManagerOptions,
    ) -> Result<Self> {
        let store = PostgresPolicyStore::connect(&conn.into(), &options).await?;
        Self::with_store(Arc::new(store), matcher, options).await
    }

    /// Run the manager over an already-constructed store.
    pub async fn with_store(
        store: Arc<dyn PolicyStore>,
        matcher: Matcher,
        options: ManagerOptions,
    ) -> Result<Self> {
        options.validate()?;
        // Subscribe before the initial load so no committed change can fall
        // between the scan and the first received event.
        let events = store.subscribe().await?;
        let inner = Arc::new(ManagerInner {
            cache: Mutex::new(CachedPolicies::default()),
            store,
            matcher,
        });
        reload(&inner).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(notification_loop(
            inner.clone(),
            events,
            shutdown_rx.clone(),
        ));
        let reloader = tokio::spawn(reload_loop(
            inner.clone(),
            options.sync_interval,
            shutdown_rx,
        ));
        tracing::debug!(
            backend = inner.store.backend_name(),
            sync_interval = ?options.sync_interval,
            "policy manager started"
        );
        Ok(Self {
            inner,
            shutdown,
            listener,
            reloader,
        })
    }

    /// Write one rule through to storage.
    ///
    /// # Panics
    /// Panics when the rule is wider than [`RULE_WIDTH`] or contains empty
    /// values; both are programmer errors in the caller.
    pub async fn add_policy(&self, ptype: PolicyType, rule: &[&str]) -> Result<()> {
        let rule = writable_rule(ptype, rule);
        self.inner.store.insert_rule(ptype, &rule).await?;
        Ok(())
    }

    /// Write base and grouping rules through in a single transaction.
    pub async fn add_policies(&self, p_rules: &[&[&str]], g_rules: &[&[&str]]) -> Result<()> {
        let batch = batch_of(p_rules, g_rules, writable_rule);
        self.inner.store.insert_batch(&batch).await?;
        Ok(())
    }

    /// Delete one rule from storage. Missing rules are success.
    pub async fn remove_policy(&self, ptype: PolicyType, rule: &[&str]) -> Result<()> {
        self.inner
            .store
            .delete_rule(ptype, &Rule::from_parts(rule))
            .await?;
        Ok(())
    }

    /// Delete base and grouping rules in a single transaction.
    pub async fn remove_policies(&self, p_rules: &[&[&str]], g_rules: &[&[&str]]) -> Result<()> {
        let batch = batch_of(p_rules, g_rules, |_, rule| Rule::from_parts(rule));
        self.inner.store.delete_batch(&batch).await?;
        Ok(())
    }

    /// Delete every cached rule matching the given patterns.
    ///
    /// The match runs against the current cache, then the ids are deleted in
    /// one transaction. Rules inserted between the read and the delete
    /// survive.
    pub async fn remove_filtered_policies(
        &self,
        p_pattern: Option<&[&str]>,
        g_pattern: Option<&[&str]>,
    ) -> Result<()> {
        let (p_rules, g_rules) = {
            let cache = self.lock_cache();
            (
                p_pattern.map(|pattern| cache.p.filter(pattern)),
                g_pattern.map(|pattern| cache.g.filter(pattern)),
            )
        };
        let mut batch = Vec::new();
        batch.extend(
            p_rules
                .unwrap_or_default()
                .into_iter()
                .map(|rule| (PolicyType::P, rule)),
        );
        batch.extend(
            g_rules
                .unwrap_or_default()
                .into_iter()
                .map(|rule| (PolicyType::G, rule)),
        );
        self.inner.store.delete_batch(&batch).await?;
        Ok(())
    }

    /// Evaluate the configured matcher against the cached policies.
    pub fn enforce(&self, request: &[&str]) -> bool {
        let cache = self.lock_cache();
        let view = PolicyView::new(&cache.p, &cache.g);
        (self.inner.matcher)(&view, request)
    }

    /// Base policies matching a wildcard pattern.
    pub fn filter(&self, pattern: &[&str]) -> Vec<Rule> {
        self.lock_cache().p.filter(pattern)
    }

    /// Grouping policies matching a wildcard pattern.
    pub fn filter_groups(&self, pattern: &[&str]) -> Vec<Rule> {
        self.lock_cache().g.filter(pattern)
    }

    /// The base policy whose leading positions equal `rule`, if any.
    pub fn find_exact(&self, rule: &[&str]) -> Option<Rule> {
        self.lock_cache().p.find(rule).cloned()
    }

    /// See [`PolicyView::filter_with_groups`].
    pub fn filter_with_groups(
        &self,
        policy_value_index: usize,
        groups: &[Rule],
        group_value_index: usize,
    ) -> Vec<Rule> {
        let cache = self.lock_cache();
        PolicyView::new(&cache.p, &cache.g).filter_with_groups(
            policy_value_index,
            groups,
            group_value_index,
        )
    }

    pub fn policy_count(&self) -> usize {
        self.lock_cache().p.len()
    }

    pub fn grouping_policy_count(&self) -> usize {
        self.lock_cache().g.len()
    }

    /// Replace the cache from a full storage scan.
    ///
    /// Runs periodically in the background; callers only need it to force a
    /// reconciliation without waiting for the next tick.
    pub async fn load_policies(&self) -> Result<()> {
        reload(&self.inner).await
    }

    /// Shut down: stop both background tasks, wait for them to exit, then
    /// release the store's connections.
    ///
    /// Consumes the manager, so it can only be closed once. Mutations still
    /// in flight on other handles of the same store fail with a
    /// storage-closed error once this returns.
    pub async fn close(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if self.listener.await.is_err() {
            tracing::error!("notification task panicked during shutdown");
        }
        if self.reloader.await.is_err() {
            tracing::error!("reload task panicked during shutdown");
        }
        self.inner.store.close().await?;
        tracing::debug!("policy manager closed");
        Ok(())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, CachedPolicies> {
        self.inner.cache.lock().expect("policy cache lock")
    }
}

/// Validate a writer-supplied rule and pad it to storage width.
///
/// Empty values are forbidden anywhere in the supplied slice: padding is
/// always trailing, and the storage id only covers the non-empty prefix.
fn writable_rule(ptype: PolicyType, rule: &[&str]) -> Rule {
    assert!(
        rule.len() <= RULE_WIDTH,
        "can't insert policy with more than {RULE_WIDTH} values: ptype was {ptype:?}, rule was {rule:?}"
    );
    assert!(
        rule.iter().all(|value| !value.is_empty()),
        "can't insert policy with empty value: ptype was {ptype:?}, rule was {rule:?}"
    );
    Rule::from_parts(rule)
}

fn batch_of(
    p_rules: &[&[&str]],
    g_rules: &[&[&str]],
    build: fn(PolicyType, &[&str]) -> Rule,
) -> Vec<(PolicyType, Rule)> {
    let mut batch = Vec::with_capacity(p_rules.len() + g_rules.len());
    batch.extend(
        p_rules
            .iter()
            .map(|rule| (PolicyType::P, build(PolicyType::P, rule))),
    );
    batch.extend(
        g_rules
            .iter()
            .map(|rule| (PolicyType::G, build(PolicyType::G, rule))),
    );
    batch
}

/// Scan storage and swap both rule sets in one short critical section.
///
/// The scan and sort run outside the lock; a notification applied while the
/// scan is in flight can be shadowed by the swap and is re-established by
/// the next event or tick, the same way re-delivered events are absorbed.
async fn reload(inner: &ManagerInner) -> Result<()> {
    let rows = inner.store.scan_all().await?;
    let mut p = RuleSet::new();
    let mut g = RuleSet::new();
    for (ptype, rule) in rows {
        match ptype {
            PolicyType::P => p.push_unsorted(rule),
            PolicyType::G => g.push_unsorted(rule),
        }
    }
    p.sort();
    g.sort();
    let (policy_count, group_count) = (p.len(), g.len());
    {
        let mut cache = inner.cache.lock().expect("policy cache lock");
        cache.p = p;
        cache.g = g;
    }
    tracing::debug!(policy_count, group_count, "loaded policies");
    Ok(())
}

async fn notification_loop(
    inner: Arc<ManagerInner>,
    mut events: Box<dyn PolicyEvents>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = events.next_event() => match next {
                Ok(Some(event)) => apply_event(&inner, event),
                Ok(None) => {
                    tracing::debug!("policy notification stream closed");
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "error waiting for policy notification");
                }
            },
        }
    }
}

fn apply_event(inner: &ManagerInner, event: PolicyEvent) {
    let Some(ptype) = PolicyType::from_tag(&event.ptype) else {
        tracing::warn!(ptype = %event.ptype, "dropping notification for unknown policy type");
        return;
    };
    tracing::debug!(op = ?event.op, %ptype, rule = %event.rule, "applying policy notification");
    let mut cache = inner.cache.lock().expect("policy cache lock");
    let set = match ptype {
        PolicyType::P => &mut cache.p,
        PolicyType::G => &mut cache.g,
    };
    match event.op {
        PolicyOp::Insert => set.insert(&event.rule),
        PolicyOp::Delete => set.remove(&event.rule),
    }
}

async fn reload_loop(
    inner: Arc<ManagerInner>,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(err) = reload(&inner).await {
                    tracing::error!(error = %err, "error while refreshing policies");
                }
            }
        }
    }
}

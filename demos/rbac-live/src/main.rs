//! # Purpose
//! Demonstrate a full live RBAC mutation flow in tulip: policy changes made
//! through the manager take effect for enforcement via the change stream,
//! with no restart and no cache flush.
//!
//! # What this demo proves
//! - Enforcement decisions come from the in-memory cache and flip once the
//!   change notification for a mutation has been applied.
//! - Role-based access works through grouping policies with domains.
//! - Filtered removal revokes a whole role's grants in one call.
//! - `close` shuts the manager down and releases the store.
//!
//! # High-level flow
//! 1. Start a manager over the in-memory store with the RBAC-with-domain
//!    matcher.
//! 2. Verify alice is denied before any policy exists.
//! 3. Grant alice directly; wait for the decision to flip to allow.
//! 4. Grant the `teacher` role and enrol aaron in it; verify role access.
//! 5. Revoke every `teacher` policy with a filtered removal; verify denial.
//! 6. Close the manager and verify the store refuses further writes.
//!
//! # Notes on determinism
//! Mutations are eventually consistent with the cache, so every assertion
//! polls with a bounded retry loop instead of sleeping a fixed time.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tulip::store::memory::InMemoryPolicyStore;
use tulip::store::{PolicyStore, StoreError};
use tulip::{rbac_with_domain, Manager, ManagerOptions, PolicyType, Rule};

const DOMAIN: &str = "uni";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    run_demo().await
}

async fn run_demo() -> Result<()> {
    println!("== Tulip Demo: Live RBAC Policy Change ==");

    let store = Arc::new(InMemoryPolicyStore::new());
    let manager = Manager::with_store(
        store.clone(),
        rbac_with_domain,
        ManagerOptions::new().with_sync_interval(Duration::from_secs(5)),
    )
    .await?;
    println!("STEP 0 manager up: PASS (backend=memory)");

    let alice_request = ["alice", DOMAIN, "class_a", "teach"];
    if manager.enforce(&alice_request) {
        bail!("alice must be denied before any policy exists");
    }
    println!("STEP 1 deny before grant: PASS");

    manager
        .add_policy(PolicyType::P, &["alice", DOMAIN, "class_a", "teach"])
        .await?;
    wait_until(&manager, &alice_request, true).await?;
    println!("STEP 2 direct grant takes effect: PASS");

    manager
        .add_policies(
            &[
                &["teacher", DOMAIN, "class_a", "teach"],
                &["teacher", DOMAIN, "class_b", "teach"],
            ],
            &[&["aaron", "teacher", DOMAIN]],
        )
        .await?;
    let aaron_request = ["aaron", DOMAIN, "class_b", "teach"];
    wait_until(&manager, &aaron_request, true).await?;
    wait_until(&manager, &["aaron", DOMAIN, "class_a", "teach"], true).await?;
    if manager.enforce(&["aaron", "work", "class_b", "teach"]) {
        bail!("aaron's teacher role is scoped to {DOMAIN:?}");
    }
    println!("STEP 3 role grant through grouping: PASS");

    let teacher_policies = manager.filter(&["teacher"]);
    if teacher_policies.len() != 2 {
        bail!("expected 2 teacher policies, found {}", teacher_policies.len());
    }
    manager
        .remove_filtered_policies(Some(&["teacher"]), None)
        .await?;
    wait_until(&manager, &aaron_request, false).await?;
    wait_until(&manager, &alice_request, true).await?;
    println!("STEP 4 filtered revocation: PASS");

    manager.close().await?;
    let err = store
        .insert_rule(PolicyType::P, &Rule::from_parts(&["bob", DOMAIN, "class_a", "teach"]))
        .await
        .expect_err("store must be closed");
    if !matches!(err, StoreError::Closed) {
        bail!("expected a storage-closed error, got: {err}");
    }
    println!("STEP 5 close releases the store: PASS");

    println!("DEMO COMPLETE");
    Ok(())
}

/// Poll until the enforcement decision matches, bounded so a lost
/// notification fails loudly instead of hanging.
async fn wait_until(manager: &Manager, request: &[&str], want: bool) -> Result<()> {
    for _ in 0..50 {
        if manager.enforce(request) == want {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("enforce({request:?}) never became {want}");
}

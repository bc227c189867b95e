//! End-to-end tests against a real Postgres server.
//!
//! Set `TULIP_TEST_DATABASE_URL` (or `DATABASE_URL`) to run; otherwise every
//! test skips with a note. Each test bootstraps its own uniquely named rule
//! table in the URL's database and drops it afterwards, so the suite can run
//! in parallel and repeatedly against the same server.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use tulip::{rbac_with_domain, Manager, ManagerOptions, PolicyType, Rule};

fn unique_name(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}_{}_{nanos}", std::process::id())
}

fn base_url() -> Option<String> {
    match std::env::var("TULIP_TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("skipping pg tests: set TULIP_TEST_DATABASE_URL or DATABASE_URL");
            None
        }
    }
}

struct PgFixture {
    url: String,
    table: String,
    options: ManagerOptions,
}

/// Build options that stay inside the database the URL names, with a short
/// sync interval so reload-driven tests converge quickly.
fn fixture() -> Option<PgFixture> {
    let url = base_url()?;
    let database = match PgConnectOptions::from_str(&url) {
        Ok(options) => options.get_database().unwrap_or("postgres").to_string(),
        Err(err) => {
            eprintln!("skipping pg tests: invalid database url: {err}");
            return None;
        }
    };
    let table = unique_name("tulip_test");
    let options = ManagerOptions::new()
        .with_table_name(&table)
        .with_database_name(database)
        .with_skip_database_create()
        .with_timeout(Duration::from_secs(5))
        .with_sync_interval(Duration::from_secs(1));
    Some(PgFixture {
        url,
        table,
        options,
    })
}

async fn connect_manager(fixture: &PgFixture) -> Option<Manager> {
    match Manager::connect(
        fixture.url.as_str(),
        rbac_with_domain,
        fixture.options.clone(),
    )
    .await
    {
        Ok(manager) => Some(manager),
        Err(err) => {
            eprintln!("skipping pg tests: cannot connect manager: {err}");
            None
        }
    }
}

async fn drop_table(fixture: &PgFixture) {
    let Ok(mut conn) = PgConnection::connect(&fixture.url).await else {
        return;
    };
    let table = &fixture.table;
    let _ = sqlx::raw_sql(&format!(
        "DROP TABLE IF EXISTS {table}; DROP FUNCTION IF EXISTS tg_notify_{table}() CASCADE"
    ))
    .execute(&mut conn)
    .await;
    let _ = conn.close().await;
}

/// Mutations are eventually consistent with the cache; poll with a bound
/// covering both the notification path and one sync interval.
async fn wait_for_counts(manager: &Manager, policies: usize, groups: usize) {
    for _ in 0..100 {
        if manager.policy_count() == policies && manager.grouping_policy_count() == groups {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!(
        "cache never reached p={policies} g={groups}; got p={} g={}",
        manager.policy_count(),
        manager.grouping_policy_count()
    );
}

#[tokio::test]
async fn pg_add_enforce_remove_round_trip() {
    let Some(fixture) = fixture() else { return };
    let Some(manager) = connect_manager(&fixture).await else {
        return;
    };

    manager
        .add_policy(PolicyType::P, &["alice", "uni", "class_a", "teach"])
        .await
        .expect("add policy");
    wait_for_counts(&manager, 1, 0).await;
    assert!(manager.enforce(&["alice", "uni", "class_a", "teach"]));

    manager
        .add_policies(
            &[
                &["teacher", "uni", "class_a", "teach"],
                &["teacher", "uni", "class_b", "teach"],
            ],
            &[&["aaron", "teacher", "uni"], &["adam", "teacher", "uni"]],
        )
        .await
        .expect("add policies");
    wait_for_counts(&manager, 3, 2).await;
    assert!(manager.enforce(&["aaron", "uni", "class_a", "teach"]));
    assert!(manager.enforce(&["adam", "uni", "class_b", "teach"]));

    manager
        .remove_policy(PolicyType::P, &["alice", "uni", "class_a", "teach"])
        .await
        .expect("remove policy");
    wait_for_counts(&manager, 2, 2).await;
    assert!(!manager.enforce(&["alice", "uni", "class_a", "teach"]));

    manager
        .remove_policies(
            &[&["teacher", "uni", "class_a", "teach"]],
            &[&["aaron", "teacher", "uni"]],
        )
        .await
        .expect("remove policies");
    wait_for_counts(&manager, 1, 1).await;
    assert!(!manager.enforce(&["aaron", "uni", "class_a", "teach"]));
    assert!(manager.enforce(&["adam", "uni", "class_b", "teach"]));

    manager.close().await.expect("close");
    drop_table(&fixture).await;
}

#[tokio::test]
async fn pg_filter_surface() {
    let Some(fixture) = fixture() else { return };
    let Some(manager) = connect_manager(&fixture).await else {
        return;
    };

    manager
        .add_policies(
            &[&["a", "b", "c"], &["a", "b", "d"], &["b", "a", "d"]],
            &[
                &["a", "b", "c"],
                &["a", "d", "c"],
                &["b", "e", "f"],
                &["a", "f", "g"],
            ],
        )
        .await
        .expect("add policies");
    wait_for_counts(&manager, 3, 4).await;

    assert!(manager.find_exact(&["a", "b", "d"]).is_some());
    assert!(manager.find_exact(&["a", "c", "d"]).is_none());

    assert_eq!(
        manager.filter_groups(&["a", "", "c"]),
        vec![
            Rule::from_parts(&["a", "b", "c"]),
            Rule::from_parts(&["a", "d", "c"]),
        ]
    );

    let groups = vec![
        Rule::from_parts(&["a", "b", "c"]),
        Rule::from_parts(&["b", "e", "f"]),
    ];
    assert_eq!(
        manager.filter_with_groups(0, &groups, 1),
        vec![Rule::from_parts(&["b", "a", "d"])]
    );

    manager.close().await.expect("close");
    drop_table(&fixture).await;
}

#[tokio::test]
async fn pg_mutations_propagate_across_managers() {
    let Some(fixture) = fixture() else { return };
    let Some(writer) = connect_manager(&fixture).await else {
        return;
    };
    // Second manager on the same table; skip the DDL it would repeat.
    let reader_fixture = PgFixture {
        url: fixture.url.clone(),
        table: fixture.table.clone(),
        options: fixture.options.clone().with_skip_table_create(),
    };
    let Some(reader) = connect_manager(&reader_fixture).await else {
        return;
    };

    writer
        .add_policy(PolicyType::P, &["alice", "uni", "class_a", "teach"])
        .await
        .expect("add policy");
    wait_for_counts(&reader, 1, 0).await;
    assert!(reader.enforce(&["alice", "uni", "class_a", "teach"]));

    writer
        .remove_policy(PolicyType::P, &["alice", "uni", "class_a", "teach"])
        .await
        .expect("remove policy");
    wait_for_counts(&reader, 0, 0).await;
    assert!(!reader.enforce(&["alice", "uni", "class_a", "teach"]));

    writer.close().await.expect("close writer");
    reader.close().await.expect("close reader");
    drop_table(&fixture).await;
}

#[tokio::test]
async fn pg_reload_recovers_missed_notifications() {
    let Some(fixture) = fixture() else { return };
    let Some(manager) = connect_manager(&fixture).await else {
        return;
    };

    // Silence the notification channel, then mutate: the change reaches the
    // table but no event reaches the manager.
    let mut conn = PgConnection::connect(&fixture.url)
        .await
        .expect("admin connection");
    let table = &fixture.table;
    sqlx::raw_sql(&format!("DROP TRIGGER notify_{table} ON {table}"))
        .execute(&mut conn)
        .await
        .expect("drop trigger");

    manager
        .add_policy(PolicyType::P, &["alice", "uni", "class_a", "teach"])
        .await
        .expect("add policy");

    // Only the periodic reload (1s here) can surface the row.
    wait_for_counts(&manager, 1, 0).await;
    assert!(manager.enforce(&["alice", "uni", "class_a", "teach"]));

    let _ = conn.close().await;
    manager.close().await.expect("close");
    drop_table(&fixture).await;
}

#[tokio::test]
async fn pg_bootstrap_creates_database() {
    let Some(url) = base_url() else { return };
    let database = unique_name("tulip_test_db");
    let options = ManagerOptions::new()
        .with_table_name(unique_name("tulip_test"))
        .with_database_name(&database)
        .with_timeout(Duration::from_secs(5))
        .with_sync_interval(Duration::from_secs(1));

    // CREATE DATABASE needs elevated rights; treat a refusal as a skip, not
    // a failure.
    let manager = match Manager::connect(url.as_str(), rbac_with_domain, options).await {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("skipping pg bootstrap test: {err}");
            return;
        }
    };
    manager
        .add_policy(PolicyType::P, &["alice", "uni", "class_a", "teach"])
        .await
        .expect("add policy");
    wait_for_counts(&manager, 1, 0).await;
    manager.close().await.expect("close");

    if let Ok(mut conn) = PgConnection::connect(&url).await {
        let _ = sqlx::raw_sql(&format!("DROP DATABASE {database}"))
            .execute(&mut conn)
            .await;
        let _ = conn.close().await;
    }
}

//! Postgres-backed implementation of the policy store.
//!
//! One table holds every rule, keyed by the content id so writes are
//! idempotent: inserts are `ON CONFLICT (id) DO NOTHING`, deletes target the
//! id and tolerate missing rows. A row-level trigger posts a JSON payload on
//! the `<table>_rules` channel after each committed INSERT or DELETE, and
//! [`PolicyStore::subscribe`] exposes that channel through
//! [`sqlx::postgres::PgListener`].
//!
//! Bootstrap runs at connect time, before anything else touches the pool:
//! optionally probe/create the database, optionally create the rule table,
//! and (re)install the notify trigger. Table and database names are
//! interpolated into this DDL with `format!`; they come from validated
//! [`ManagerOptions`](crate::ManagerOptions) identifiers, never from request
//! data.
//!
//! Every statement runs under the configured per-operation deadline. A
//! database that stops answering surfaces as [`StoreError::Timeout`] on the
//! triggering call instead of a hang.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgExecutor, PgListener, PgPoolOptions};
use sqlx::{Connection, FromRow, PgConnection, PgPool};

use super::{PolicyEvent, PolicyEvents, PolicyOp, PolicyStore, StoreError, StoreResult};
use crate::config::{ConnectionSpec, ManagerOptions};
use crate::errors::{Error, Result};
use crate::rules::{rule_id, PolicyType, Rule, RULE_WIDTH};

/// Connections kept by the statement pool. The listener holds one more.
const POOL_SIZE: u32 = 4;

/// Durable policy store on Postgres.
pub struct PostgresPolicyStore {
    pool: PgPool,
    channel: String,
    timeout: Duration,
    insert_sql: String,
    delete_sql: String,
    scan_sql: String,
}

/// Row shape of the rule table. Kept separate from [`Rule`] so the schema's
/// nullable columns stay a storage detail.
#[derive(Debug, FromRow)]
struct RuleRow {
    ptype: Option<String>,
    v0: Option<String>,
    v1: Option<String>,
    v2: Option<String>,
    v3: Option<String>,
    v4: Option<String>,
    v5: Option<String>,
}

impl RuleRow {
    fn into_rule(self) -> (Option<String>, Rule) {
        let values = [
            self.v0.unwrap_or_default(),
            self.v1.unwrap_or_default(),
            self.v2.unwrap_or_default(),
            self.v3.unwrap_or_default(),
            self.v4.unwrap_or_default(),
            self.v5.unwrap_or_default(),
        ];
        (self.ptype, Rule::from_parts(&values))
    }
}

/// Payload posted by the notify trigger: `row_to_json` over
/// `(op, p_type, rule)` where `rule` is the six value columns, NULLs allowed.
#[derive(Debug, Deserialize)]
struct NotificationPayload {
    op: String,
    p_type: String,
    rule: Vec<Option<String>>,
}

impl PostgresPolicyStore {
    /// Connect and bootstrap: create the database and table unless the
    /// options skip them, then install the notify trigger.
    pub async fn connect(spec: &ConnectionSpec, options: &ManagerOptions) -> Result<Self> {
        options.validate()?;
        let connect_options = spec.connect_options()?;
        let timeout = options.timeout;

        if !options.skip_database_create {
            create_database(&connect_options, &options.database_name, timeout).await?;
        }

        let pool = PgPoolOptions::new()
            .max_connections(POOL_SIZE)
            .acquire_timeout(timeout)
            .connect_with(connect_options.database(&options.database_name))
            .await
            .map_err(|err| StoreError::Connect(err.to_string()))?;

        let table = &options.table_name;
        let store = Self {
            pool,
            channel: format!("{table}_rules"),
            timeout,
            insert_sql: format!(
                "INSERT INTO {table} (id, ptype, v0, v1, v2, v3, v4, v5) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (id) DO NOTHING"
            ),
            delete_sql: format!("DELETE FROM {table} WHERE id = $1"),
            scan_sql: format!("SELECT ptype, v0, v1, v2, v3, v4, v5 FROM {table}"),
        };

        if !options.skip_table_create {
            tracing::info!(%table, "creating rule table");
            store
                .run(sqlx::raw_sql(&create_table_sql(table)).execute(&store.pool))
                .await?;
        }
        store
            .run(sqlx::raw_sql(&create_trigger_sql(table, &store.channel)).execute(&store.pool))
            .await?;

        Ok(store)
    }

    /// Apply the per-operation deadline and fold sqlx errors into
    /// [`StoreError`].
    async fn run<T>(
        &self,
        operation: impl Future<Output = sqlx::Result<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(sqlx::Error::PoolClosed)) => Err(StoreError::Closed),
            Ok(Err(err)) => Err(StoreError::Unexpected(err.into())),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    async fn exec_insert(
        executor: impl PgExecutor<'_>,
        sql: &str,
        ptype: PolicyType,
        rule: &Rule,
    ) -> sqlx::Result<()> {
        let mut query = sqlx::query(sql)
            .bind(rule_id(ptype, rule))
            .bind(ptype.as_str());
        for value in column_values(rule) {
            query = query.bind(value);
        }
        query.execute(executor).await.map(|_| ())
    }
}

#[async_trait]
impl PolicyStore for PostgresPolicyStore {
    async fn scan_all(&self) -> StoreResult<Vec<(PolicyType, Rule)>> {
        let rows = self
            .run(sqlx::query_as::<_, RuleRow>(&self.scan_sql).fetch_all(&self.pool))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let (ptype, rule) = row.into_rule();
                let ptype = PolicyType::from_tag(ptype.as_deref().unwrap_or_default())?;
                Some((ptype, rule))
            })
            .collect())
    }

    async fn insert_rule(&self, ptype: PolicyType, rule: &Rule) -> StoreResult<()> {
        self.run(Self::exec_insert(&self.pool, &self.insert_sql, ptype, rule))
            .await
    }

    async fn insert_batch(&self, rules: &[(PolicyType, Rule)]) -> StoreResult<()> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            for (ptype, rule) in rules {
                Self::exec_insert(&mut *tx, &self.insert_sql, *ptype, rule).await?;
            }
            tx.commit().await
        })
        .await
    }

    async fn delete_rule(&self, ptype: PolicyType, rule: &Rule) -> StoreResult<()> {
        self.run(
            sqlx::query(&self.delete_sql)
                .bind(rule_id(ptype, rule))
                .execute(&self.pool),
        )
        .await
        .map(|_| ())
    }

    async fn delete_batch(&self, rules: &[(PolicyType, Rule)]) -> StoreResult<()> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            for (ptype, rule) in rules {
                sqlx::query(&self.delete_sql)
                    .bind(rule_id(*ptype, rule))
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .await
    }

    async fn subscribe(&self) -> StoreResult<Box<dyn PolicyEvents>> {
        let mut listener = self
            .run(PgListener::connect_with(&self.pool))
            .await?;
        self.run(listener.listen(&self.channel)).await?;
        Ok(Box::new(PgEvents { listener }))
    }

    async fn close(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

struct PgEvents {
    listener: PgListener,
}

#[async_trait]
impl PolicyEvents for PgEvents {
    async fn next_event(&mut self) -> StoreResult<Option<PolicyEvent>> {
        loop {
            let notification = match self.listener.recv().await {
                Ok(notification) => notification,
                Err(sqlx::Error::PoolClosed) => return Ok(None),
                Err(err) => return Err(StoreError::Unexpected(err.into())),
            };
            match decode_notification(notification.payload()) {
                Ok(event) => return Ok(Some(event)),
                Err(err) => {
                    // The reload will pick the change up; drop the payload.
                    tracing::warn!(error = %err, "dropping undecodable policy notification");
                }
            }
        }
    }
}

fn decode_notification(payload: &str) -> StoreResult<PolicyEvent> {
    let wire: NotificationPayload =
        serde_json::from_str(payload).map_err(|err| StoreError::Decode(err.to_string()))?;
    let op = match wire.op.as_str() {
        "INSERT" => PolicyOp::Insert,
        "DELETE" => PolicyOp::Delete,
        other => return Err(StoreError::Decode(format!("unknown op {other:?}"))),
    };
    let mut values: Vec<String> = wire
        .rule
        .into_iter()
        .take(RULE_WIDTH)
        .map(Option::unwrap_or_default)
        .collect();
    values.resize(RULE_WIDTH, String::new());
    Ok(PolicyEvent {
        op,
        ptype: wire.p_type,
        rule: Rule::from_parts(&values),
    })
}

/// NULL out the trailing padding so the row mirrors the logical rule length.
fn column_values(rule: &Rule) -> [Option<&str>; RULE_WIDTH] {
    let logical = rule.logical_len();
    std::array::from_fn(|index| (index < logical).then(|| rule.get(index)))
}

async fn create_database(
    connect_options: &PgConnectOptions,
    database: &str,
    timeout: Duration,
) -> Result<()> {
    let result = tokio::time::timeout(timeout, async {
        let mut conn = PgConnection::connect_with(connect_options)
            .await
            .map_err(|err| StoreError::Connect(err.to_string()))?;
        let exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
                .bind(database)
                .fetch_optional(&mut conn)
                .await
                .map_err(|err| StoreError::Unexpected(err.into()))?;
        if exists.is_none() {
            tracing::info!(database, "creating database");
            sqlx::raw_sql(&format!("CREATE DATABASE {database}"))
                .execute(&mut conn)
                .await
                .map_err(|err| StoreError::Unexpected(err.into()))?;
        }
        conn.close()
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        Ok::<_, StoreError>(())
    })
    .await;
    match result {
        Ok(inner) => inner.map_err(Error::from),
        Err(_) => Err(Error::from(StoreError::Timeout(timeout))),
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id    text PRIMARY KEY,
            ptype text,
            v0 text,
            v1 text,
            v2 text,
            v3 text,
            v4 text,
            v5 text
        )"
    )
}

/// The trigger re-install is unconditional so a table that predates this
/// manager version still notifies on the expected channel.
fn create_trigger_sql(table: &str, channel: &str) -> String {
    format!(
        r#"
DROP TRIGGER IF EXISTS notify_{table} ON {table};
CREATE OR REPLACE FUNCTION tg_notify_{table}()
RETURNS trigger
LANGUAGE plpgsql
AS $$
    declare
        channel text := TG_ARGV[0];
    begin
        IF (TG_OP = 'DELETE') THEN
            PERFORM (
                with payload(op, p_type, rule) as
                (
                    select TG_OP, OLD.ptype, ARRAY[OLD.v0, OLD.v1, OLD.v2, OLD.v3, OLD.v4, OLD.v5]
                )
                select pg_notify(channel, row_to_json(payload)::text)
                from payload
            );
        ELSIF (TG_OP = 'INSERT') THEN
            PERFORM (
                with payload(op, p_type, rule) as
                (
                    select TG_OP, NEW.ptype, ARRAY[NEW.v0, NEW.v1, NEW.v2, NEW.v3, NEW.v4, NEW.v5]
                )
                select pg_notify(channel, row_to_json(payload)::text)
                from payload
            );
        END IF;
        RETURN NULL;
    end;
$$;
CREATE TRIGGER notify_{table}
AFTER INSERT OR DELETE
ON {table}
FOR EACH ROW
EXECUTE PROCEDURE tg_notify_{table}('{channel}');
"#
    )
}

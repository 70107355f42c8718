//! Postgres-backed outbox, attempt log and retention targets.
//!
//! The store traits are synchronous while sqlx is async. `PostgresStore`
//! keeps the runtime handle it was created on and drives each query with
//! `Handle::block_on`. That is only valid off the runtime's worker threads,
//! which holds for the scheduler's task threads.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | Mapped To |
//! |------------|-----------------|-----------|
//! | Database (foreign key violation) on enqueue | `23503` | `OutboxStoreError::UnknownRecipient` |
//! | Anything else | any | `Storage` variant with the operation name |

use std::future::Future;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use identityd_auth::{AttemptLog, AttemptLogError, AttemptRecord, NewAttempt};
use identityd_core::{AccountId, AliasId, AttemptId, OutboxItemId};

use crate::outbox::{
    DeliveryPolicy, NewOutboxItem, OutboxItem, OutboxStore, OutboxStoreError, PendingDelivery, Recipient,
};
use crate::retention::RetentionTarget;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS aliases (
        id UUID PRIMARY KEY,
        address TEXT NOT NULL,
        confirmed_at TIMESTAMPTZ NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox_items (
        id UUID PRIMARY KEY,
        alias_id UUID NOT NULL REFERENCES aliases (id),
        from_address TEXT NOT NULL,
        reply_to TEXT NULL,
        subject TEXT NOT NULL,
        body_text TEXT NULL,
        body_html TEXT NULL,
        send_if_unconfirmed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        last_attempt_at TIMESTAMPTZ NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS outbox_items_created_at_idx ON outbox_items (created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS login_attempts (
        sequence BIGSERIAL PRIMARY KEY,
        id UUID NOT NULL UNIQUE,
        account_id UUID NOT NULL,
        alias_id UUID NOT NULL,
        client TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        success BOOLEAN NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS login_attempts_account_idx ON login_attempts (account_id, created_at)",
];

/// Postgres storage shared by the outbox, the attempt log and retention.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresStore {
    /// Wrap an existing pool; queries will run on `handle`.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Connect a small pool and bind it to the current runtime.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, Handle::current()))
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("schema ready");
        Ok(())
    }

    /// Retention target for one of the swept tables.
    pub fn retention(&self, table: RetainedTable) -> PostgresRetention {
        PostgresRetention {
            store: self.clone(),
            table,
        }
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }

    #[instrument(skip(self, recipient), fields(alias_id = %recipient.id), err)]
    async fn upsert_recipient_async(&self, recipient: Recipient) -> Result<(), OutboxStoreError> {
        sqlx::query(
            r#"
            INSERT INTO aliases (id, address, confirmed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
                SET address = EXCLUDED.address, confirmed_at = EXCLUDED.confirmed_at
            "#,
        )
        .bind(recipient.id.as_uuid())
        .bind(&recipient.address)
        .bind(recipient.confirmed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| outbox_error("upsert_recipient", e))?;
        Ok(())
    }

    #[instrument(skip(self, item), fields(alias_id = %item.recipient), err)]
    async fn enqueue_async(
        &self,
        item: NewOutboxItem,
        created_at: DateTime<Utc>,
    ) -> Result<OutboxItem, OutboxStoreError> {
        let item = OutboxItem::from_new(item, created_at);
        sqlx::query(
            r#"
            INSERT INTO outbox_items (
                id, alias_id, from_address, reply_to, subject,
                body_text, body_html, send_if_unconfirmed, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.recipient.as_uuid())
        .bind(&item.from)
        .bind(&item.reply_to)
        .bind(&item.subject)
        .bind(&item.body_text)
        .bind(&item.body_html)
        .bind(item.send_if_unconfirmed)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                OutboxStoreError::UnknownRecipient(item.recipient)
            } else {
                outbox_error("enqueue", e)
            }
        })?;
        Ok(item)
    }

    async fn get_async(&self, id: OutboxItemId) -> Result<Option<OutboxItem>, OutboxStoreError> {
        let row = sqlx::query("SELECT * FROM outbox_items WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| outbox_error("get", e))?;
        row.map(|row| outbox_item_from_row(&row))
            .transpose()
            .map_err(|e| outbox_error("decode_item", e))
    }

    #[instrument(skip(self), err)]
    async fn due_items_async(&self, policy: &DeliveryPolicy) -> Result<Vec<PendingDelivery>, OutboxStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT o.*, a.address, a.confirmed_at
            FROM outbox_items o
            JOIN aliases a ON a.id = o.alias_id
            WHERE o.last_attempt_at IS NULL
               OR (COALESCE(o.last_error, '') <> '' AND o.attempt_count < $1)
            ORDER BY o.created_at ASC, o.id ASC
            "#,
        )
        .bind(i64::from(policy.permanent_failure_threshold))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| outbox_error("due_items", e))?;

        rows.iter()
            .map(|row| -> Result<PendingDelivery, sqlx::Error> {
                let item = outbox_item_from_row(row)?;
                let recipient = Recipient {
                    id: item.recipient,
                    address: row.try_get("address")?,
                    confirmed_at: row.try_get("confirmed_at")?,
                };
                Ok(PendingDelivery { item, recipient })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| outbox_error("decode_due_item", e))
    }

    #[instrument(skip(self, item), fields(item_id = %item.id), err)]
    async fn save_attempt_async(&self, item: &OutboxItem) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_items
            SET last_attempt_at = $2, attempt_count = $3, last_error = $4
            WHERE id = $1
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.last_attempt_at)
        .bind(i32::try_from(item.attempt_count).unwrap_or(i32::MAX))
        .bind(&item.last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| outbox_error("save_attempt", e))?;

        if result.rows_affected() == 0 {
            return Err(OutboxStoreError::NotFound(item.id));
        }
        Ok(())
    }

    async fn append_attempt_async(&self, attempt: NewAttempt) -> Result<AttemptRecord, AttemptLogError> {
        let id = AttemptId::new();
        let row = sqlx::query(
            r#"
            INSERT INTO login_attempts (id, account_id, alias_id, client, created_at, success)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING sequence
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempt.account_id.as_uuid())
        .bind(attempt.alias_id.as_uuid())
        .bind(&attempt.client)
        .bind(attempt.created_at)
        .bind(attempt.success)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| attempt_error("append", e))?;

        let sequence: i64 = row.try_get("sequence").map_err(|e| attempt_error("append", e))?;
        Ok(AttemptRecord {
            id,
            sequence: sequence as u64,
            account_id: attempt.account_id,
            alias_id: attempt.alias_id,
            client: attempt.client,
            created_at: attempt.created_at,
            success: attempt.success,
        })
    }

    async fn attempts_since_async(
        &self,
        account_id: AccountId,
        client: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>, AttemptLogError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, id, account_id, alias_id, client, created_at, success
            FROM login_attempts
            WHERE account_id = $1
              AND ($2::text IS NULL OR client = $2)
              AND created_at >= $3
            ORDER BY created_at ASC, sequence ASC
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(client)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| attempt_error("attempts_since", e))?;

        rows.iter()
            .map(attempt_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| attempt_error("decode_attempt", e))
    }
}

impl OutboxStore for PostgresStore {
    fn upsert_recipient(&self, recipient: Recipient) -> Result<(), OutboxStoreError> {
        self.block_on(self.upsert_recipient_async(recipient))
    }

    fn enqueue(&self, item: NewOutboxItem, created_at: DateTime<Utc>) -> Result<OutboxItem, OutboxStoreError> {
        self.block_on(self.enqueue_async(item, created_at))
    }

    fn get(&self, id: OutboxItemId) -> Result<Option<OutboxItem>, OutboxStoreError> {
        self.block_on(self.get_async(id))
    }

    fn due_items(&self, policy: &DeliveryPolicy) -> Result<Vec<PendingDelivery>, OutboxStoreError> {
        self.block_on(self.due_items_async(policy))
    }

    fn save_attempt(&self, item: &OutboxItem) -> Result<(), OutboxStoreError> {
        self.block_on(self.save_attempt_async(item))
    }
}

impl AttemptLog for PostgresStore {
    fn append(&self, attempt: NewAttempt) -> Result<AttemptRecord, AttemptLogError> {
        self.block_on(self.append_attempt_async(attempt))
    }

    fn attempts_since(
        &self,
        account_id: AccountId,
        client: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>, AttemptLogError> {
        self.block_on(self.attempts_since_async(account_id, client, since))
    }
}

/// Tables the retention sweeper may delete from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainedTable {
    LoginAttempts,
    OutboxItems,
}

impl RetainedTable {
    pub fn entity(self) -> &'static str {
        match self {
            Self::LoginAttempts => "login_attempts",
            Self::OutboxItems => "outbox_items",
        }
    }

    fn delete_sql(self) -> &'static str {
        match self {
            Self::LoginAttempts => "DELETE FROM login_attempts WHERE created_at < $1",
            Self::OutboxItems => "DELETE FROM outbox_items WHERE created_at < $1",
        }
    }
}

/// One table of a `PostgresStore`, viewed as a retention target.
#[derive(Debug, Clone)]
pub struct PostgresRetention {
    store: PostgresStore,
    table: RetainedTable,
}

impl RetentionTarget for PostgresRetention {
    fn entity(&self) -> &'static str {
        self.table.entity()
    }

    fn delete_created_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = self.store.block_on(
            sqlx::query(self.table.delete_sql())
                .bind(cutoff)
                .execute(&self.store.pool),
        )?;
        Ok(result.rows_affected())
    }
}

fn outbox_item_from_row(row: &PgRow) -> Result<OutboxItem, sqlx::Error> {
    let attempt_count: i32 = row.try_get("attempt_count")?;
    Ok(OutboxItem {
        id: OutboxItemId::from_uuid(row.try_get("id")?),
        recipient: AliasId::from_uuid(row.try_get("alias_id")?),
        from: row.try_get("from_address")?,
        reply_to: row.try_get("reply_to")?,
        subject: row.try_get("subject")?,
        body_text: row.try_get("body_text")?,
        body_html: row.try_get("body_html")?,
        send_if_unconfirmed: row.try_get("send_if_unconfirmed")?,
        created_at: row.try_get("created_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        attempt_count: attempt_count.max(0) as u32,
        last_error: row.try_get("last_error")?,
    })
}

fn attempt_from_row(row: &PgRow) -> Result<AttemptRecord, sqlx::Error> {
    let sequence: i64 = row.try_get("sequence")?;
    Ok(AttemptRecord {
        id: AttemptId::from_uuid(row.try_get("id")?),
        sequence: sequence as u64,
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        alias_id: AliasId::from_uuid(row.try_get("alias_id")?),
        client: row.try_get("client")?,
        created_at: row.try_get("created_at")?,
        success: row.try_get("success")?,
    })
}

fn outbox_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    OutboxStoreError::Storage(format!("{operation}: {err}"))
}

fn attempt_error(operation: &str, err: sqlx::Error) -> AttemptLogError {
    AttemptLogError::Storage(format!("{operation}: {err}"))
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23503";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retained_tables_map_to_fixed_statements() {
        assert_eq!(RetainedTable::LoginAttempts.entity(), "login_attempts");
        assert_eq!(RetainedTable::OutboxItems.entity(), "outbox_items");
        assert!(RetainedTable::OutboxItems.delete_sql().starts_with("DELETE FROM outbox_items"));
        assert!(RetainedTable::LoginAttempts.delete_sql().ends_with("created_at < $1"));
    }

    #[test]
    fn schema_declares_every_table() {
        let ddl = SCHEMA.join("\n");
        for table in ["aliases", "outbox_items", "login_attempts"] {
            assert!(ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
    }
}

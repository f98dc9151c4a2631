//! PostgreSQL history store.
//!
//! History lives in a table next to the service's own tables. The migration
//! lock is a session-level advisory lock held on a dedicated connection; if the
//! process dies the server drops the session and the lock with it.

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tracing::debug;

use crate::config::redact_url;
use crate::error::{CurtainError, MigrationError, Result};
use crate::schema::{quote_ident, ColumnDef, SchemaModel};

use super::script::RevisionScript;
use super::store::{LockGuard, MigrationStore};

#[derive(Debug, Clone)]
pub struct PostgresMigrationStore {
    url: String,
    schema: String,
    table: String,
    lock_key: i64,
}

impl PostgresMigrationStore {
    pub fn new(url: &str, schema: &str, table: &str, lock_key: Option<i64>) -> Self {
        Self {
            url: url.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
            lock_key: lock_key.unwrap_or_else(|| derive_lock_key(schema, table)),
        }
    }

    pub fn lock_key(&self) -> i64 {
        self.lock_key
    }

    fn history_table(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    async fn connect(&self) -> Result<PgConnection> {
        PgConnection::connect(&self.url).await.map_err(store_err)
    }

    async fn ensure_history(&self, conn: &mut PgConnection) -> Result<()> {
        for stmt in history_ddl(&self.schema, &self.table) {
            sqlx::query(&stmt)
                .execute(&mut *conn)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> CurtainError {
    MigrationError::Store(e.to_string()).into()
}

/// FNV-1a of `schema.table`, reinterpreted as the signed key Postgres expects.
pub fn derive_lock_key(schema: &str, table: &str) -> i64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in format!("{schema}.{table}").bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash as i64
}

fn history_ddl(schema: &str, table: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (\
             version TEXT PRIMARY KEY, \
             name TEXT NOT NULL, \
             applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
            quote_ident(schema),
            quote_ident(table)
        ),
    ]
}

#[async_trait]
impl MigrationStore for PostgresMigrationStore {
    async fn try_lock(&self) -> Result<Option<Box<dyn LockGuard>>> {
        let mut conn = self.connect().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.lock_key)
            .fetch_one(&mut conn)
            .await
            .map_err(store_err)?;
        if !acquired {
            let _ = conn.close().await;
            return Ok(None);
        }
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut conn)
            .await
            .map_err(store_err)?;
        debug!(key = self.lock_key, pid, "advisory lock acquired");
        Ok(Some(Box::new(AdvisoryLock {
            conn: Some(conn),
            key: self.lock_key,
            holder: format!("backend pid {pid}"),
        })))
    }

    async fn applied(&self) -> Result<Vec<String>> {
        let mut conn = self.connect().await?;
        // read-only: a missing history table means nothing has been applied yet
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(self.history_table())
            .fetch_one(&mut conn)
            .await
            .map_err(store_err)?;
        let versions = if exists {
            let sql = format!(
                "SELECT version FROM {} ORDER BY applied_at, version",
                self.history_table()
            );
            sqlx::query_scalar(&sql)
                .fetch_all(&mut conn)
                .await
                .map_err(store_err)?
        } else {
            Vec::new()
        };
        let _ = conn.close().await;
        Ok(versions)
    }

    async fn apply(&self, script: &RevisionScript) -> Result<()> {
        let apply_err = |e: sqlx::Error| -> CurtainError {
            MigrationError::Apply {
                version: script.version.clone(),
                reason: e.to_string(),
            }
            .into()
        };

        let mut conn = self.connect().await?;
        self.ensure_history(&mut conn).await?;
        let mut tx = conn.begin().await.map_err(store_err)?;
        for change in &script.changes {
            for stmt in change.to_sql(&self.schema) {
                debug!(version = %script.version, sql = %stmt, "executing");
                sqlx::query(&stmt)
                    .execute(&mut *tx)
                    .await
                    .map_err(apply_err)?;
            }
        }
        let insert = format!(
            "INSERT INTO {} (version, name) VALUES ($1, $2)",
            self.history_table()
        );
        sqlx::query(&insert)
            .bind(&script.version)
            .bind(&script.name)
            .execute(&mut *tx)
            .await
            .map_err(apply_err)?;
        tx.commit().await.map_err(apply_err)?;
        let _ = conn.close().await;
        Ok(())
    }

    async fn live_schema(&self) -> Result<SchemaModel> {
        let mut conn = self.connect().await?;
        // format_type keeps length, precision, scale and array brackets
        let rows: Vec<(String, String, String, bool)> = sqlx::query_as(
            "SELECT c.relname::text, a.attname::text, \
                    format_type(a.atttypid, a.atttypmod), NOT a.attnotnull \
             FROM pg_attribute a \
             JOIN pg_class c ON c.oid = a.attrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relname <> $2 \
               AND c.relkind IN ('r', 'p') \
               AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY c.relname, a.attnum",
        )
        .bind(&self.schema)
        .bind(&self.table)
        .fetch_all(&mut conn)
        .await
        .map_err(store_err)?;
        let _ = conn.close().await;

        let mut model = SchemaModel::default();
        for (table, column, sql_type, nullable) in rows {
            model
                .tables
                .entry(table)
                .or_default()
                .columns
                .insert(column, ColumnDef::new(sql_type, nullable));
        }
        Ok(model)
    }

    async fn lock_holder(&self) -> Option<String> {
        let mut conn = self.connect().await.ok()?;
        // classid/objid split the bigint key into its high and low halves
        let pid: Option<i32> = sqlx::query_scalar(
            "SELECT pid FROM pg_locks \
             WHERE locktype = 'advisory' AND granted \
               AND classid::bigint = ($1 >> 32) & 4294967295 \
               AND objid::bigint = $1 & 4294967295 \
             LIMIT 1",
        )
        .bind(self.lock_key)
        .fetch_optional(&mut conn)
        .await
        .ok()
        .flatten();
        let _ = conn.close().await;
        pid.map(|p| format!("backend pid {p}"))
    }

    fn describe(&self) -> String {
        format!(
            "postgres {} ({}.{})",
            redact_url(&self.url),
            self.schema,
            self.table
        )
    }
}

/// Session advisory lock. Dropping it closes the connection, which releases the lock.
struct AdvisoryLock {
    conn: Option<PgConnection>,
    key: i64,
    holder: String,
}

#[async_trait]
impl LockGuard for AdvisoryLock {
    fn holder(&self) -> String {
        self.holder.clone()
    }

    async fn release(mut self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut conn)
            .await
            .map_err(store_err)?;
        conn.close().await.map_err(store_err)
    }
}

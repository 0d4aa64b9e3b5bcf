//! PostgreSQL backend (sqlx).
//!
//! PostgreSQL cannot change database on an open connection, so
//! `use_database` always fails and the manager reopens with the new
//! database name instead.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::{Column, Connection, Row};
use tracing::{debug, warn};

use super::{ConnectionConfig, QueryRows, ServerInfo, SqlConnection};

/// Statements PostgreSQL refuses to run inside a transaction block.
const NO_TRANSACTION_PREFIXES: &[&str] = &[
    "CREATE DATABASE",
    "DROP DATABASE",
    "VACUUM",
    "CREATE INDEX CONCURRENTLY",
    "REINDEX",
];

pub struct PgBackend {
    conn: PgConnection,
}

impl PgBackend {
    pub async fn open(config: &ConnectionConfig) -> Result<Self> {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port())
            .username(&config.user)
            .password(&config.password);

        if let Some(ref database) = config.database {
            options = options.database(database);
        }

        for (key, value) in &config.options {
            match key.as_str() {
                "sslmode" | "ssl_mode" => {
                    let mode: PgSslMode = value
                        .parse()
                        .map_err(|e| anyhow!("invalid sslmode '{value}': {e}"))?;
                    options = options.ssl_mode(mode);
                }
                "application_name" => options = options.application_name(value),
                other => warn!("Ignoring unknown PostgreSQL option '{other}'"),
            }
        }

        debug!("Opening PostgreSQL connection to {}:{}", config.host, config.port());
        let conn = PgConnection::connect_with(&options).await?;
        Ok(Self { conn })
    }
}

fn needs_autocommit(sql: &str) -> bool {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
    NO_TRANSACTION_PREFIXES
        .iter()
        .any(|prefix| normalized.starts_with(prefix))
}

#[async_trait]
impl SqlConnection for PgBackend {
    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    async fn ping(&mut self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&mut self.conn).await?;
        Ok(())
    }

    async fn fetch(&mut self, sql: &str) -> Result<QueryRows> {
        let rows = sqlx::query(sql).fetch_all(&mut self.conn).await?;
        Ok(collect_rows(&rows))
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        if needs_autocommit(sql) {
            let done = sqlx::query(sql).execute(&mut self.conn).await?;
            return Ok(done.rows_affected());
        }
        let mut tx = self.conn.begin().await?;
        let done = sqlx::query(sql).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(done.rows_affected())
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let rows = self
            .fetch(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
            )
            .await?;
        Ok(rows.first_column())
    }

    async fn describe_table(&mut self, table: &str) -> Result<QueryRows> {
        let rows = sqlx::query(
            "SELECT column_name::text AS \"Field\", data_type::text AS \"Type\", \
                    is_nullable::text AS \"Null\", column_default::text AS \"Default\" \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&mut self.conn)
        .await?;
        if rows.is_empty() {
            bail!("relation \"{table}\" does not exist");
        }
        Ok(collect_rows(&rows))
    }

    async fn server_info(&mut self) -> Result<ServerInfo> {
        let row = sqlx::query("SELECT current_database()::text, version()::text, current_user::text")
            .fetch_one(&mut self.conn)
            .await?;
        Ok(ServerInfo {
            database: row.try_get::<Option<String>, _>(0).ok().flatten(),
            version: cell(&row, 1),
            user: cell(&row, 2),
        })
    }

    async fn use_database(&mut self, name: &str) -> Result<()> {
        bail!("PostgreSQL cannot switch to '{name}' on an open connection")
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

fn collect_rows(rows: &[PgRow]) -> QueryRows {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = rows
        .iter()
        .map(|row| (0..row.len()).map(|i| cell(row, i)).collect())
        .collect();
    QueryRows { columns, rows }
}

/// Renders one cell as text. Prepared statements return binary values, so
/// every common type is decoded explicitly; NULL renders as `NULL`.
fn cell(row: &PgRow, idx: usize) -> String {
    macro_rules! try_as {
        ($($ty:ty),* $(,)?) => {
            $(
                if let Ok(value) = row.try_get::<Option<$ty>, _>(idx) {
                    return value.map_or_else(|| "NULL".to_string(), |v| v.to_string());
                }
            )*
        };
    }

    try_as!(
        String,
        i64,
        i32,
        i16,
        f64,
        f32,
        bool,
        sqlx::types::BigDecimal,
        sqlx::types::Uuid,
        chrono::NaiveDateTime,
        chrono::DateTime<chrono::Utc>,
        chrono::NaiveDate,
        chrono::NaiveTime,
        sqlx::types::JsonValue,
    );

    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return value.map_or_else(
            || "NULL".to_string(),
            |bytes| String::from_utf8_lossy(&bytes).into_owned(),
        );
    }
    "<unreadable>".to_string()
}

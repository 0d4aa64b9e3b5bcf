//! MySQL backend (sqlx).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::{Column, Connection, Row};
use tracing::{debug, warn};

use super::{ConnectionConfig, QueryRows, ServerInfo, SqlConnection};

/// Base tables only; views are left out so table loops cover the same set
/// on every backend.
const LIST_TABLES_SQL: &str = "SHOW FULL TABLES WHERE Table_type = 'BASE TABLE'";

pub struct MySqlBackend {
    conn: MySqlConnection,
}

impl MySqlBackend {
    pub async fn open(config: &ConnectionConfig) -> Result<Self> {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port())
            .username(&config.user)
            .password(&config.password);

        if let Some(ref database) = config.database {
            options = options.database(database);
        }

        for (key, value) in &config.options {
            match key.as_str() {
                "charset" => options = options.charset(value),
                "ssl_mode" | "sslmode" => {
                    let mode: MySqlSslMode = value
                        .parse()
                        .map_err(|e| anyhow!("invalid ssl_mode '{value}': {e}"))?;
                    options = options.ssl_mode(mode);
                }
                other => warn!("Ignoring unknown MySQL option '{other}'"),
            }
        }

        debug!("Opening MySQL connection to {}:{}", config.host, config.port());
        let conn = MySqlConnection::connect_with(&options).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SqlConnection for MySqlBackend {
    fn quote_ident(&self, name: &str) -> String {
        quote_mysql_ident(name)
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
        let mut tx = self.conn.begin().await?;
        let done = sqlx::query(sql).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(done.rows_affected())
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let rows = self.fetch(LIST_TABLES_SQL).await?;
        let mut tables = rows.first_column();
        tables.sort();
        Ok(tables)
    }

    async fn describe_table(&mut self, table: &str) -> Result<QueryRows> {
        let sql = format!("SHOW COLUMNS FROM {}", self.quote_ident(table));
        self.fetch(&sql).await
    }

    async fn server_info(&mut self) -> Result<ServerInfo> {
        let row = sqlx::query("SELECT DATABASE(), VERSION(), CURRENT_USER()")
            .fetch_one(&mut self.conn)
            .await?;
        Ok(ServerInfo {
            database: row.try_get::<Option<String>, _>(0).ok().flatten(),
            version: cell(&row, 1),
            user: cell(&row, 2),
        })
    }

    async fn use_database(&mut self, name: &str) -> Result<()> {
        // USE is not allowed as a prepared statement; a bare &str goes over
        // the text protocol
        let sql = format!("USE {}", self.quote_ident(name));
        sqlx::Executor::execute(&mut self.conn, sql.as_str()).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

fn quote_mysql_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn collect_rows(rows: &[MySqlRow]) -> QueryRows {
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

/// Renders one cell as text, trying the decodings MySQL columns commonly
/// need. NULL renders as `NULL`.
fn cell(row: &MySqlRow, idx: usize) -> String {
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
        u64,
        i32,
        u32,
        i16,
        u16,
        i8,
        u8,
        f64,
        f32,
        bool,
        sqlx::types::BigDecimal,
        chrono::NaiveDateTime,
        chrono::DateTime<chrono::Utc>,
        chrono::NaiveDate,
        chrono::NaiveTime,
        sqlx::types::JsonValue,
    );

    if let Ok(value) = row.try_get_unchecked::<Option<String>, _>(idx) {
        return value.unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return value.map_or_else(
            || "NULL".to_string(),
            |bytes| String::from_utf8_lossy(&bytes).into_owned(),
        );
    }
    "<unreadable>".to_string()
}

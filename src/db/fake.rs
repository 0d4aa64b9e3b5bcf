//! In-memory backend for tests.
//!
//! A [`FakeServer`] holds tables and counters shared by every connection the
//! [`FakeConnector`] opens, so tests can kill the "transport", refuse new
//! connections and inspect what was executed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{BackendKind, ConnectionConfig, Connector, QueryRows, ServerInfo, SqlConnection};

pub struct FakeServer {
    tables: Mutex<BTreeMap<String, QueryRows>>,
    databases: Mutex<Vec<String>>,
    executed: Mutex<Vec<String>>,
    open_delay: Mutex<Duration>,
    info_delay: Mutex<Duration>,
    count_overrides: Mutex<BTreeMap<String, String>>,
    pub alive: AtomicBool,
    pub refuse: AtomicBool,
    pub close_fails: AtomicBool,
    pub opens: AtomicUsize,
    pub open_attempts: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(BTreeMap::new()),
            databases: Mutex::new(vec!["shop".to_string()]),
            executed: Mutex::new(Vec::new()),
            open_delay: Mutex::new(Duration::ZERO),
            info_delay: Mutex::new(Duration::ZERO),
            count_overrides: Mutex::new(BTreeMap::new()),
            alive: AtomicBool::new(true),
            refuse: AtomicBool::new(false),
            close_fails: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            open_attempts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn add_table(&self, name: &str, columns: &[&str], rows: &[&[&str]]) {
        let table = QueryRows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| v.to_string()).collect())
                .collect(),
        };
        self.tables.lock().unwrap().insert(name.to_string(), table);
    }

    pub fn add_database(&self, name: &str) {
        self.databases.lock().unwrap().push(name.to_string());
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    /// Stalls `server_info` on every new connection.
    pub fn set_info_delay(&self, delay: Duration) {
        *self.info_delay.lock().unwrap() = delay;
    }

    /// Makes `SELECT COUNT(*)` on `table` return `value` verbatim.
    pub fn set_count_override(&self, table: &str, value: &str) {
        self.count_overrides
            .lock()
            .unwrap()
            .insert(table.to_string(), value.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn has_database(&self, name: &str) -> bool {
        self.databases.lock().unwrap().iter().any(|d| d == name)
    }

    fn table(&self, name: &str) -> Result<QueryRows> {
        self.tables
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("Table '{name}' doesn't exist"))
    }
}

pub struct FakeConnector {
    server: Arc<FakeServer>,
}

impl FakeConnector {
    pub fn new(server: Arc<FakeServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn SqlConnection>> {
        let server = &self.server;
        server.open_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *server.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if config.host == "bad-host" || server.refuse.load(Ordering::SeqCst) {
            bail!("Can't connect to server on '{}'", config.host);
        }
        if let Some(ref db) = config.database {
            if !server.has_database(db) {
                bail!("Unknown database '{db}'");
            }
        }

        server.opens.fetch_add(1, Ordering::SeqCst);
        server.alive.store(true, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            server: server.clone(),
            backend: config.backend,
            database: config.database.clone(),
        }))
    }
}

pub struct FakeConnection {
    server: Arc<FakeServer>,
    backend: BackendKind,
    database: Option<String>,
}

fn unquote(ident: &str) -> &str {
    ident.trim_matches(|c| c == '`' || c == '"' || c == ';')
}

#[async_trait]
impl SqlConnection for FakeConnection {
    fn quote_ident(&self, name: &str) -> String {
        format!("`{name}`")
    }

    async fn ping(&mut self) -> Result<()> {
        if self.server.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            bail!("server has gone away")
        }
    }

    async fn fetch(&mut self, sql: &str) -> Result<QueryRows> {
        self.ping().await?;
        let words: Vec<&str> = sql.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();

        match upper.as_slice() {
            ["SHOW", "TABLES"] => Ok(QueryRows {
                columns: vec!["Tables_in_shop".to_string()],
                rows: self.list_tables().await?.into_iter().map(|t| vec![t]).collect(),
            }),
            ["SHOW", "DATABASES"] => Ok(QueryRows {
                columns: vec!["Database".to_string()],
                rows: self
                    .server
                    .databases
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|d| vec![d.clone()])
                    .collect(),
            }),
            ["SELECT", "1"] => Ok(QueryRows {
                columns: vec!["1".to_string()],
                rows: vec![vec!["1".to_string()]],
            }),
            ["SELECT", "COUNT(*)", "FROM", _] => {
                let name = unquote(words[3]);
                let table = self.server.table(name)?;
                let count = match self.server.count_overrides.lock().unwrap().get(name) {
                    Some(value) => value.clone(),
                    None => table.rows.len().to_string(),
                };
                Ok(QueryRows {
                    columns: vec!["COUNT(*)".to_string()],
                    rows: vec![vec![count]],
                })
            }
            ["SELECT", "*", "FROM", _, rest @ ..] => {
                let mut table = self.server.table(unquote(words[3]))?;
                if let ["LIMIT", n] = rest {
                    let n: usize = unquote(n).parse()?;
                    table.rows.truncate(n);
                }
                Ok(table)
            }
            _ => bail!("You have an error in your SQL syntax near '{sql}'"),
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.ping().await?;
        if sql.contains("bad_table") {
            bail!("Table 'shop.bad_table' doesn't exist");
        }
        self.server.executed.lock().unwrap().push(sql.to_string());
        Ok(1)
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        Ok(self.server.tables.lock().unwrap().keys().cloned().collect())
    }

    async fn describe_table(&mut self, table: &str) -> Result<QueryRows> {
        let table = self.server.table(unquote(table))?;
        Ok(QueryRows {
            columns: vec!["Field".to_string(), "Type".to_string()],
            rows: table
                .columns
                .iter()
                .map(|c| vec![c.clone(), "text".to_string()])
                .collect(),
        })
    }

    async fn server_info(&mut self) -> Result<ServerInfo> {
        let delay = *self.server.info_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(ServerInfo {
            database: self.database.clone(),
            version: "8.0.36-fake".to_string(),
            user: "root@localhost".to_string(),
        })
    }

    async fn use_database(&mut self, name: &str) -> Result<()> {
        if self.backend == BackendKind::Postgres {
            bail!("PostgreSQL cannot switch database in place");
        }
        if !self.server.has_database(name) {
            bail!("Unknown database '{name}'");
        }
        self.database = Some(name.to_string());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.server.closes.fetch_add(1, Ordering::SeqCst);
        if self.server.close_fails.load(Ordering::SeqCst) {
            bail!("connection reset while closing");
        }
        Ok(())
    }
}

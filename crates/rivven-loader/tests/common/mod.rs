//! In-memory recording destination for integration tests
//!
//! Statements run inside a transaction are staged on the connection's
//! session and only published to the committed log when a transaction on
//! that session commits. A transaction dropped without commit or rollback
//! leaves its statements on the session, the way a server keeps an open
//! `BEGIN`. Failures and stalls are injected by predicates over the statement
//! text. Introspection queries are answered from tables registered with
//! [`MemoryDatabase::add_table`].

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once};

use rivven_loader::prelude::*;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_loader=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// A statement and the values bound to it
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub sql: String,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
struct TableDef {
    columns: Vec<(String, String)>,
    constraint: String,
    pk: Vec<String>,
}

type Matcher = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Failure {
    matches: Matcher,
    message: String,
    remaining: usize,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<(String, String), TableDef>,
    committed: Vec<Executed>,
    attempted: Vec<Executed>,
    failures: Vec<Failure>,
    stalls: Vec<Matcher>,
    commits: usize,
    rollbacks: usize,
    opened: usize,
    closed: usize,
}

/// Shared state behind every connection of a [`MemoryFactory`]
#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a live table answered by introspection queries
    pub fn add_table(
        &self,
        schema: &str,
        name: &str,
        columns: &[(&str, &str)],
        constraint: &str,
        pk: &[&str],
    ) {
        let def = TableDef {
            columns: columns
                .iter()
                .map(|(c, t)| (c.to_string(), t.to_string()))
                .collect(),
            constraint: constraint.to_string(),
            pk: pk.iter().map(|c| c.to_string()).collect(),
        };
        self.lock()
            .tables
            .insert((schema.to_string(), name.to_string()), def);
    }

    /// Fail every statement matching `matches`
    pub fn fail_when(
        &self,
        matches: impl Fn(&str) -> bool + Send + Sync + 'static,
        message: &str,
    ) {
        self.push_failure(matches, message, usize::MAX);
    }

    /// Fail the first statement matching `matches`, then let it through
    pub fn fail_once(
        &self,
        matches: impl Fn(&str) -> bool + Send + Sync + 'static,
        message: &str,
    ) {
        self.push_failure(matches, message, 1);
    }

    fn push_failure(
        &self,
        matches: impl Fn(&str) -> bool + Send + Sync + 'static,
        message: &str,
        remaining: usize,
    ) {
        self.lock().failures.push(Failure {
            matches: Box::new(matches),
            message: message.to_string(),
            remaining,
        });
    }

    /// Never complete statements matching `matches`, like a server stuck on a lock
    pub fn stall_when(&self, matches: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.lock().stalls.push(Box::new(matches));
    }

    pub fn clear_stalls(&self) {
        self.lock().stalls.clear();
    }

    /// Connections opened by the factory
    pub fn opened_connections(&self) -> usize {
        self.lock().opened
    }

    /// Connections closed by the pool
    pub fn closed_connections(&self) -> usize {
        self.lock().closed
    }

    /// Statements visible after commit (or run outside a transaction)
    pub fn committed(&self) -> Vec<Executed> {
        self.lock().committed.clone()
    }

    /// SQL text of the committed statements
    pub fn committed_sql(&self) -> Vec<String> {
        self.committed().into_iter().map(|e| e.sql).collect()
    }

    /// Every statement issued, including failed and rolled back ones
    pub fn attempted_sql(&self) -> Vec<String> {
        self.lock().attempted.iter().map(|e| e.sql.clone()).collect()
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    /// Forget recorded statements, keeping tables and failures
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.committed.clear();
        state.attempted.clear();
        state.commits = 0;
        state.rollbacks = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    async fn stall_if_matched(&self, sql: &str) {
        let stalled = self.lock().stalls.iter().any(|matches| matches(sql));
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    fn run(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut state = self.lock();
        state.attempted.push(Executed {
            sql: sql.to_string(),
            values: params.to_vec(),
        });

        for failure in state.failures.iter_mut() {
            if failure.remaining > 0 && (failure.matches)(sql) {
                failure.remaining = failure.remaining.saturating_sub(1);
                return Err(Error::query(failure.message.clone()));
            }
        }

        let key = match params {
            [Value::String(schema), Value::String(name), ..] => Some((schema.clone(), name.clone())),
            _ => None,
        };

        if sql.contains("information_schema.columns") {
            let def = key.and_then(|k| state.tables.get(&k).cloned()).unwrap_or_default();
            return Ok(def
                .columns
                .into_iter()
                .map(|(c, t)| {
                    Row::new(
                        vec!["column_name".into(), "data_type".into()],
                        vec![Value::String(c), Value::String(t)],
                    )
                })
                .collect());
        }

        if sql.contains("key_column_usage") {
            let def = key.and_then(|k| state.tables.get(&k).cloned()).unwrap_or_default();
            return Ok(def
                .pk
                .into_iter()
                .map(|c| {
                    Row::new(
                        vec!["constraint_name".into(), "column_name".into()],
                        vec![Value::String(def.constraint.clone()), Value::String(c)],
                    )
                })
                .collect());
        }

        if sql.starts_with("TRUNCATE") {
            let known = state
                .tables
                .keys()
                .any(|(schema, name)| sql.contains(&format!("\"{schema}\".\"{name}\"")));
            if !known {
                return Err(Error::query(format!(
                    "relation referenced by {sql:?} does not exist"
                )));
            }
        }

        Ok(Vec::new())
    }

    fn publish(&self, sql: &str, params: &[Value]) {
        self.lock().committed.push(Executed {
            sql: sql.to_string(),
            values: params.to_vec(),
        });
    }
}

/// Statements of the transaction open on one connection
type Session = Arc<Mutex<Vec<Executed>>>;

/// Autocommit connection
pub struct MemoryConnection {
    db: Arc<MemoryDatabase>,
    session: Session,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.db.run(sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.db.stall_if_matched(sql).await;
        self.db.run(sql, params)?;
        self.db.publish(sql, params);
        Ok(1)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        // BEGIN inside an open transaction is a no-op, so leftovers stay staged
        Ok(Box::new(MemoryTransaction {
            db: Arc::clone(&self.db),
            session: Arc::clone(&self.session),
        }))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        self.session.lock().unwrap().clear();
        self.db.lock().closed += 1;
        Ok(())
    }
}

/// Stages statements on its session until commit
pub struct MemoryTransaction {
    db: Arc<MemoryDatabase>,
    session: Session,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.db.run(sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.db.stall_if_matched(sql).await;
        self.db.run(sql, params)?;
        self.session.lock().unwrap().push(Executed {
            sql: sql.to_string(),
            values: params.to_vec(),
        });
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let staged = std::mem::take(&mut *self.session.lock().unwrap());
        let mut state = self.db.lock();
        state.committed.extend(staged);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.session.lock().unwrap().clear();
        self.db.lock().rollbacks += 1;
        Ok(())
    }
}

/// Factory handing out connections to one [`MemoryDatabase`]
pub struct MemoryFactory {
    db: Arc<MemoryDatabase>,
    destination: DestinationType,
}

impl MemoryFactory {
    pub fn new(db: &Arc<MemoryDatabase>, destination: DestinationType) -> Arc<Self> {
        init_test_logging();
        Arc::new(Self {
            db: Arc::clone(db),
            destination,
        })
    }
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        self.db.lock().opened += 1;
        Ok(Box::new(MemoryConnection {
            db: Arc::clone(&self.db),
            session: Session::default(),
        }))
    }

    fn destination_type(&self) -> DestinationType {
        self.destination
    }
}

/// Adapter over a memory database with the dialect of `destination`
pub async fn adapter(db: &Arc<MemoryDatabase>, destination: DestinationType) -> SqlAdapter {
    adapter_with_dialect(db, dialect_for(destination)).await
}

/// Adapter over a memory database with a custom dialect
pub async fn adapter_with_dialect(
    db: &Arc<MemoryDatabase>,
    dialect: Box<dyn SqlDialect>,
) -> SqlAdapter {
    let factory = MemoryFactory::new(db, dialect.destination());
    let pool = SimpleConnectionPool::new(PoolConfig::new("memory://test"), factory)
        .await
        .unwrap();
    SqlAdapter::new(dialect, pool, "public")
}

/// Build an event row from `(column, value)` pairs
pub fn row<const N: usize>(pairs: [(&str, Value); N]) -> EventRow {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

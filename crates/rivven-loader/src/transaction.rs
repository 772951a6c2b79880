//! Transaction wrapper used by every write path
//!
//! [`Tx`] pairs a native transaction with the pooled connection it runs on
//! and the destination it belongs to. Statement failures are re-wrapped with
//! the SQL text and bound values; commit comes in a best-effort and a direct
//! flavor; rollback is always best-effort.
//!
//! A `Tx` dropped while still open (a cancelled write, a panic) closes its
//! connection instead of returning it, so no caller ever inherits an
//! unfinished transaction.

use tracing::{debug, warn};

use crate::connection::{DestinationType, Transaction};
use crate::error::Result;
use crate::pool::PooledConnection;
use crate::types::{Row, Value};

/// An open transaction, closed exactly once by `commit`, `direct_commit` or
/// `rollback`.
pub struct Tx {
    destination: DestinationType,
    inner: Option<Box<dyn Transaction>>,
    // Returned to the pool, or closed, only after the transaction ends
    conn: Option<PooledConnection>,
}

impl Tx {
    /// Begin a transaction on a pooled connection
    pub async fn begin(destination: DestinationType, conn: PooledConnection) -> Result<Self> {
        let inner = conn.begin().await?;
        Ok(Self {
            destination,
            inner: Some(inner),
            conn: Some(conn),
        })
    }

    /// Wrap an already started transaction
    pub fn from_transaction(destination: DestinationType, inner: Box<dyn Transaction>) -> Self {
        Self {
            destination,
            inner: Some(inner),
            conn: None,
        }
    }

    /// Destination this transaction runs against
    pub fn destination(&self) -> DestinationType {
        self.destination
    }

    fn native(&self) -> Result<&dyn Transaction> {
        self.inner
            .as_deref()
            .ok_or_else(|| crate::Error::transaction("transaction already closed"))
    }

    /// Execute a statement; failures carry the statement and its values
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        debug!(destination = %self.destination, sql, params = params.len(), "executing statement");
        self.native()?
            .execute(sql, params)
            .await
            .map_err(|e| e.statement(sql, params))
    }

    /// Run a query inside the transaction
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.native()?
            .query(sql, params)
            .await
            .map_err(|e| e.statement(sql, params))
    }

    fn set_discard(&mut self, discard: bool) {
        if let Some(conn) = self.conn.as_mut() {
            conn.set_discard(discard);
        }
    }

    /// Commit and report the failure to the caller
    pub async fn direct_commit(mut self) -> Result<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        // Stays set if the commit fails or is cancelled midway
        self.set_discard(true);
        inner.commit().await?;
        self.set_discard(false);
        Ok(())
    }

    /// Commit, logging a failure instead of returning it
    pub async fn commit(self) {
        let destination = self.destination;
        if let Err(e) = self.direct_commit().await {
            warn!(%destination, error = %e, "unable to commit transaction");
        }
    }

    /// Roll back, logging a failure instead of returning it
    pub async fn rollback(mut self) {
        if let Some(inner) = self.inner.take() {
            self.set_discard(true);
            match inner.rollback().await {
                Ok(()) => self.set_discard(false),
                Err(e) => {
                    warn!(destination = %self.destination, error = %e, "unable to rollback transaction");
                }
            }
        }
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if self.inner.is_some() {
            warn!(
                destination = %self.destination,
                "transaction dropped without commit or rollback, closing its connection"
            );
            self.set_discard(true);
        }
    }
}

//! Scoped connection guards.

use std::ops::Deref;
use std::sync::Arc;

use tidepool_core::{Connector, DriverError, PoolError};

use crate::connection::PooledConnection;
use crate::pool::{PoolShared, ReleaseOutcome};

/// A connection travelling from the releasing side to an enrolled waiter.
///
/// If the waiter vanished before taking the connection out (its deadline
/// fired or its future was dropped between the pool's liveness check and
/// the receive), the drop guard re-parks the connection in the pool, so a
/// delivery can never leak a connection and a dead waiter never observes
/// one.
pub(crate) struct Handoff<C: Connector> {
    conn: Option<PooledConnection<C::Session>>,
    shared: Arc<PoolShared<C>>,
}

impl<C: Connector> Handoff<C> {
    pub(crate) fn new(conn: PooledConnection<C::Session>, shared: Arc<PoolShared<C>>) -> Self {
        Self {
            conn: Some(conn),
            shared,
        }
    }

    /// Take the connection out, defusing the drop guard.
    pub(crate) fn into_connection(mut self) -> PooledConnection<C::Session> {
        self.conn.take().expect("handoff already consumed")
    }

    /// Finish the checkout on the receiving side.
    pub(crate) fn checkout(self) -> Result<PoolGuard<C>, PoolError> {
        let shared = Arc::clone(&self.shared);
        let conn = self.into_connection();
        shared.checkout_delivered(conn)
    }
}

impl<C: Connector> Drop for Handoff<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            PoolShared::repark(Arc::clone(&self.shared), conn);
        }
    }
}

/// A borrowed pool connection with guaranteed return.
///
/// Derefs to the session. Dropping the guard returns the connection on a
/// background task whatever the exit path, including unwinding;
/// [`PoolGuard::release`] is the deterministic alternative.
///
/// A caller that observes a transport failure reports it with
/// [`PoolGuard::invalidate`] (or [`PoolGuard::report`]) so the pool retires
/// the connection instead of recycling it.
pub struct PoolGuard<C: Connector> {
    conn: Option<PooledConnection<C::Session>>,
    shared: Arc<PoolShared<C>>,
    failed: bool,
}

impl<C: Connector> std::fmt::Debug for PoolGuard<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").finish_non_exhaustive()
    }
}

impl<C: Connector> PoolGuard<C> {
    pub(crate) fn new(conn: PooledConnection<C::Session>, shared: Arc<PoolShared<C>>) -> Self {
        Self {
            conn: Some(conn),
            shared,
            failed: false,
        }
    }

    fn conn(&self) -> &PooledConnection<C::Session> {
        self.conn.as_ref().expect("connection already released")
    }

    /// The session held by this guard.
    #[must_use]
    pub fn session(&self) -> &C::Session {
        self.conn().session()
    }

    /// Stable identifier of the underlying connection, for logs.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.conn().id()
    }

    /// Report that the session failed; the pool will retire it on return.
    pub fn invalidate(&mut self) {
        self.failed = true;
    }

    /// Inspect a driver error and invalidate the connection if the error
    /// means the session is unusable. Query-level errors are left alone.
    pub fn report(&mut self, error: &DriverError) {
        if error.is_fatal() {
            self.failed = true;
        }
    }

    /// Return the connection to the pool now.
    ///
    /// Equivalent to dropping the guard, but the return has completed when
    /// this resolves, which makes pool state deterministic for callers that
    /// immediately re-acquire.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            let outcome = if self.failed {
                ReleaseOutcome::Failed
            } else {
                ReleaseOutcome::Ok
            };
            Arc::clone(&self.shared).release(conn, outcome).await;
        }
    }
}

impl<C: Connector> Deref for PoolGuard<C> {
    type Target = C::Session;

    fn deref(&self) -> &C::Session {
        self.session()
    }
}

impl<C: Connector> Drop for PoolGuard<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let outcome = if self.failed {
                ReleaseOutcome::Failed
            } else {
                ReleaseOutcome::Ok
            };
            PoolShared::spawn_release(Arc::clone(&self.shared), conn, outcome);
        }
    }
}

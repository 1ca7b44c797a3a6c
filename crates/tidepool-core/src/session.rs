//! Transport contracts consumed by the pool.
//!
//! The pool is generic over these traits: [`Connector`] opens sessions,
//! [`Session`] is one live, internally synchronized channel to the server.
//! The concrete WebSocket implementation lives in `tidepool-driver`; tests
//! substitute in-memory mocks.

use std::future::Future;

use serde_json::Value;

use crate::config::PoolConfig;
use crate::credentials::Credentials;
use crate::error::DriverError;

/// A live transport session to the database server.
///
/// Methods take `&self`: implementations are internally synchronized so a
/// session can be driven from behind a shared reference.
pub trait Session: Send + Sync + 'static {
    /// Authenticate the session.
    fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Select the working namespace and database.
    fn select(
        &self,
        namespace: &str,
        database: &str,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Execute a statement with parameters and return the raw result.
    fn execute(
        &self,
        statement: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, DriverError>> + Send;

    /// Lightweight liveness probe.
    fn ping(&self) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Terminate the session. Idempotent, best-effort.
    fn close(&self) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Whether the transport still considers itself connected.
    fn is_connected(&self) -> bool;
}

/// Opens new [`Session`]s for a pool.
pub trait Connector: Send + Sync + 'static {
    /// The session type this connector produces.
    type Session: Session;

    /// Open one session to the endpoint described by `config`.
    ///
    /// This is a single attempt; the pool applies `connection_timeout` and
    /// the retry policy around it. Authentication and namespace selection
    /// are the pool's responsibility, not the connector's.
    fn connect(
        &self,
        config: &PoolConfig,
    ) -> impl Future<Output = Result<Self::Session, DriverError>> + Send;
}

//! # tidepool
//!
//! Connection pool for a document/graph database reached over a
//! WebSocket-based RPC protocol.
//!
//! Opening a session is expensive: TCP handshake, optional TLS, an RPC
//! authentication round-trip, namespace/database selection, and possibly a
//! one-time schema bootstrap. The pool amortizes that cost across many
//! short-lived logical operations while enforcing bounded resource usage:
//!
//! - **Elastic sizing** between `min_size` and `max_size`, with idle
//!   reaping and lifetime/usage retirement
//! - **Fair admission**: acquirers beyond capacity wait in a strict FIFO
//!   queue with per-waiter deadlines and cancellation
//! - **Health maintenance**: a background task probes idle connections,
//!   retires the dead, and refills toward the minimum
//! - **Scoped borrowing**: [`PoolGuard`] returns the connection on every
//!   exit path, including unwinding
//!
//! The pool is generic over the [`Connector`]/[`Session`] contracts from
//! `tidepool-core`; the WebSocket implementation lives in
//! `tidepool-driver`.
//!
//! # Example
//!
//! ```no_run
//! use tidepool::{Pool, PoolConfig, Credentials};
//! use tidepool_core::Session;
//! use tidepool_driver::WireConnector;
//!
//! # async fn example() -> Result<(), tidepool::PoolError> {
//! let config = PoolConfig::new("ws://localhost:8000/rpc")
//!     .credentials(Credentials::root("root", "root"))
//!     .namespace("app")
//!     .database("main")
//!     .min_size(2)
//!     .max_size(10);
//!
//! let pool = Pool::initialize(config, WireConnector::new()).await?;
//!
//! {
//!     let conn = pool.acquire().await?;
//!     let _rows = conn
//!         .execute("SELECT * FROM widget", serde_json::json!({}))
//!         .await;
//!     // Returned to the pool here, whatever happened above.
//! }
//!
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

mod connection;
mod guard;
mod maintainer;
mod pool;
mod registry;
mod stats;

pub use guard::PoolGuard;
pub use pool::Pool;
pub use registry::PoolRegistry;
pub use stats::PoolStats;

// Re-export the core contracts so most users depend on one crate.
pub use tidepool_core::{Connector, Credentials, DriverError, PoolConfig, PoolError, Session};

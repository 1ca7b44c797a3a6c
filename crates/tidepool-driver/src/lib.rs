//! # tidepool-driver
//!
//! WebSocket RPC driver for tidepool: the concrete [`Session`] and
//! [`Connector`] implementation the pool hands out.
//!
//! The driver speaks a JSON text-frame protocol over `tokio-tungstenite`:
//! numbered requests (`signin`, `use`, `query`, `ping`) and id-correlated
//! responses routed by a background reader task. TLS endpoints (`wss://`)
//! are handled through rustls with webpki roots.
//!
//! # Example
//!
//! ```no_run
//! use tidepool_core::{Credentials, PoolConfig, Session};
//! use tidepool_driver::WireSession;
//!
//! # async fn example() -> Result<(), tidepool_core::DriverError> {
//! let config = PoolConfig::new("ws://localhost:8000/rpc");
//! let session = WireSession::connect(&config).await?;
//! session.authenticate(&Credentials::root("root", "root")).await?;
//! session.select("app", "main").await?;
//! session.ping().await?;
//! session.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Session`]: tidepool_core::Session
//! [`Connector`]: tidepool_core::Connector

pub mod rpc;
pub mod session;

pub use session::{WireConnector, WireSession};

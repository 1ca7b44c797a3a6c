//! # tidepool-core
//!
//! Core types and contracts for the tidepool connection pool:
//!
//! - **Configuration**: [`PoolConfig`] with builder-style setters and a
//!   validation gate
//! - **Credentials**: [`Credentials`] in the wire shape the `signin` RPC
//!   expects, with password-redacting `Debug`
//! - **Errors**: [`PoolError`] for pool operations, [`DriverError`] for the
//!   transport
//! - **Transport contracts**: the [`Session`] and [`Connector`] traits the
//!   pool is generic over
//!
//! This crate performs no I/O and does not depend on an async runtime.

pub mod config;
pub mod credentials;
pub mod error;
pub mod session;

pub use config::PoolConfig;
pub use credentials::Credentials;
pub use error::{DriverError, PoolError};
pub use session::{Connector, Session};

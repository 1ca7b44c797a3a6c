//! Shared test support: an in-memory connector with failure injection.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tidepool_core::{Connector, Credentials, DriverError, PoolConfig, Session};

/// Observable counters plus failure switches shared by every session a
/// connector produces.
#[derive(Default)]
pub struct MockState {
    pub connects: AtomicU64,
    pub closes: AtomicU64,
    pub pings: AtomicU64,
    pub selects: AtomicU64,
    pub executed: Mutex<Vec<String>>,
    /// Fail the next N connection attempts.
    pub fail_connects: AtomicUsize,
    /// Reject every authentication attempt.
    pub reject_auth: AtomicBool,
    /// Fail every probe.
    pub fail_pings: AtomicBool,
    /// Fail every namespace/database selection.
    pub fail_selects: AtomicBool,
    /// Delay applied to each connection attempt, in milliseconds.
    pub connect_delay_ms: AtomicU64,
}

/// One in-memory session.
pub struct MockSession {
    /// Creation order, starting at 1.
    pub serial: u64,
    state: Arc<MockState>,
    alive: AtomicBool,
    closed: AtomicBool,
}

impl MockSession {
    /// Simulate the server side dying under this session.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::NotConnected);
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionClosed);
        }
        Ok(())
    }
}

impl Session for MockSession {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), DriverError> {
        self.check()?;
        if self.state.reject_auth.load(Ordering::SeqCst) {
            return Err(DriverError::AuthenticationRejected {
                message: "denied".to_string(),
            });
        }
        Ok(())
    }

    async fn select(&self, _namespace: &str, _database: &str) -> Result<(), DriverError> {
        self.check()?;
        self.state.selects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_selects.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionClosed);
        }
        Ok(())
    }

    async fn execute(&self, statement: &str, _params: Value) -> Result<Value, DriverError> {
        self.check()?;
        self.state
            .executed
            .lock()
            .expect("executed mutex")
            .push(statement.to_string());
        Ok(Value::Null)
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        if self.state.fail_pings.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionClosed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }
}

/// Connector producing [`MockSession`]s against shared [`MockState`].
#[derive(Clone, Default)]
pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, _config: &PoolConfig) -> Result<MockSession, DriverError> {
        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        loop {
            let pending = self.state.fail_connects.load(Ordering::SeqCst);
            if pending == 0 {
                break;
            }
            if self
                .state
                .fail_connects
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(DriverError::connection("injected connect failure"));
            }
        }
        let serial = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockSession {
            serial,
            state: Arc::clone(&self.state),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }
}

/// Base configuration for pool tests: fast retries, no reset side effect
/// (no namespace/database configured), generous maintenance interval so
/// ticks do not interfere unless a test shortens it.
pub fn test_config(min: usize, max: usize) -> PoolConfig {
    PoolConfig::new("ws://localhost:8000/rpc")
        .min_size(min)
        .max_size(max)
        .retry_attempts(1)
        .retry_delay(Duration::from_millis(10))
        .health_check_interval(Duration::from_secs(60))
}

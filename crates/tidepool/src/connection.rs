//! Pooled connection bookkeeping.

use std::time::{Duration, Instant};

use tidepool_core::{PoolConfig, Session};

/// Why a connection left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetireReason {
    /// A probe or a caller-observed failure invalidated the session.
    Unhealthy,
    /// The connection served its configured number of acquisitions.
    Usage,
    /// The connection outlived `max_lifetime`.
    Lifetime,
    /// The connection sat idle past `max_idle_time` with the pool above
    /// its minimum size.
    Idle,
}

/// One live session plus the metadata the pool tracks about it.
pub(crate) struct PooledConnection<S> {
    session: S,
    id: u64,
    created_at: Instant,
    last_used_at: Instant,
    usage_count: u64,
    in_use: bool,
    healthy: bool,
}

impl<S> PooledConnection<S> {
    pub(crate) fn new(session: S, id: u64) -> Self {
        let now = Instant::now();
        Self {
            session,
            id,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
            in_use: false,
            healthy: true,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn session(&self) -> &S {
        &self.session
    }

    pub(crate) fn usage_count(&self) -> u64 {
        self.usage_count
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy
    }

    #[cfg(test)]
    pub(crate) fn is_in_use(&self) -> bool {
        self.in_use
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn idle_duration(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub(crate) fn mark_used(&mut self) {
        self.in_use = true;
        self.usage_count += 1;
        self.last_used_at = Instant::now();
    }

    pub(crate) fn mark_free(&mut self) {
        self.in_use = false;
        self.last_used_at = Instant::now();
    }

    /// One-way: a connection never becomes healthy again.
    pub(crate) fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Check the retirement criteria against `config`.
    ///
    /// The idle criterion only applies while the pool is above its minimum
    /// size, so callers pass `above_min` from the current pool state.
    pub(crate) fn retire_reason(
        &self,
        config: &PoolConfig,
        above_min: bool,
    ) -> Option<RetireReason> {
        if !self.healthy {
            Some(RetireReason::Unhealthy)
        } else if self.usage_count >= config.max_usage_count {
            Some(RetireReason::Usage)
        } else if self.age() >= config.max_lifetime {
            Some(RetireReason::Lifetime)
        } else if above_min && self.idle_duration() >= config.max_idle_time {
            Some(RetireReason::Idle)
        } else {
            None
        }
    }
}

impl<S: Session> PooledConnection<S> {
    /// Terminate the session. Consumes the connection so it is closed by
    /// exactly one actor; the driver's close is idempotent best-effort.
    pub(crate) async fn close(self) {
        if let Err(error) = self.session.close().await {
            tracing::debug!(id = self.id, %error, "session close reported an error");
        }
    }
}

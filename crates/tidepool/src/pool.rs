//! Pool core: the state machine behind acquire, release, and close.
//!
//! A single synchronous mutex guards the pool state; every lock section is
//! pure bookkeeping. Network I/O (establishment, probes, resets, closes)
//! always happens outside the lock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use tidepool_core::{Connector, PoolConfig, PoolError, Session};

use crate::connection::{PooledConnection, RetireReason};
use crate::guard::{Handoff, PoolGuard};
use crate::maintainer;
use crate::stats::{PoolStats, StatsRecorder};

/// Caller-reported outcome of a borrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseOutcome {
    Ok,
    Failed,
}

/// The delivery slot a waiter holds the receiving end of.
type Waiter<C> = oneshot::Sender<Result<Handoff<C>, PoolError>>;

/// State guarded by the pool lock.
pub(crate) struct PoolState<C: Connector> {
    /// Idle connections, most recently released at the front.
    pub(crate) idle: VecDeque<PooledConnection<C::Session>>,
    /// FIFO of enrolled acquirers. Dead entries (receiver dropped) are
    /// skipped at dequeue.
    waiters: VecDeque<Waiter<C>>,
    /// All live connections: idle, borrowed, or under probe.
    pub(crate) size: usize,
    /// In-flight constructions; counts against `max_size`.
    creating: usize,
    /// Idle connections temporarily withdrawn by the maintainer.
    pub(crate) checking: usize,
    pub(crate) closed: bool,
    bootstrapped: bool,
    pub(crate) stats: StatsRecorder,
}

impl<C: Connector> PoolState<C> {
    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }
}

/// What one locked pass over the state decided an acquirer should do.
enum Attempt<C: Connector> {
    /// An idle connection was ready.
    Ready(PoolGuard<C>),
    /// Capacity is available; a `creating` slot has been reserved.
    Build,
    /// The pool is saturated; the acquirer is enrolled.
    Wait(oneshot::Receiver<Result<Handoff<C>, PoolError>>),
}

/// Shared pool internals; `Pool` is a cheap handle around an `Arc` of this.
pub(crate) struct PoolShared<C: Connector> {
    pub(crate) config: PoolConfig,
    connector: C,
    state: Mutex<PoolState<C>>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    maintainer: Mutex<Option<JoinHandle<()>>>,
}

/// Decrements the reserved `creating` slot if an acquirer's build future is
/// dropped mid-establishment, so cancellation cannot leak capacity.
struct CreatingGuard<C: Connector>(Option<Arc<PoolShared<C>>>);

impl<C: Connector> CreatingGuard<C> {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl<C: Connector> Drop for CreatingGuard<C> {
    fn drop(&mut self) {
        if let Some(shared) = self.0.take() {
            let mut state = shared.lock_state();
            state.creating -= 1;
            // The freed slot may unblock a refill or a parked waiter.
            shared.spawn_builds_locked(&mut state);
        }
    }
}

impl<C: Connector> PoolShared<C> {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn store_maintainer(&self, handle: JoinHandle<()>) {
        *self
            .maintainer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn spawn_close(conn: PooledConnection<C::Session>) {
        tokio::spawn(async move { conn.close().await });
    }

    /// Finish a checkout: the connection is leaving the free set.
    fn checkout_locked(
        self: &Arc<Self>,
        state: &mut PoolState<C>,
        mut conn: PooledConnection<C::Session>,
    ) -> PoolGuard<C> {
        conn.mark_used();
        state.stats.record_acquisition();
        PoolGuard::new(conn, Arc::clone(self))
    }

    /// Finish a checkout on the receiving side of a handoff.
    pub(crate) fn checkout_delivered(
        self: &Arc<Self>,
        conn: PooledConnection<C::Session>,
    ) -> Result<PoolGuard<C>, PoolError> {
        let mut state = self.lock_state();
        if state.closed {
            state.size -= 1;
            state.stats.connections_closed += 1;
            drop(state);
            Self::spawn_close(conn);
            return Err(PoolError::PoolClosed);
        }
        Ok(self.checkout_locked(&mut state, conn))
    }

    /// Hand a free connection to the first live waiter, else park it idle.
    ///
    /// Dead waiters are skipped at dequeue; a receiver that vanishes
    /// between the liveness check and the send hands its payload straight
    /// back, and the next waiter is considered.
    pub(crate) fn route_released(
        self: &Arc<Self>,
        state: &mut PoolState<C>,
        mut conn: PooledConnection<C::Session>,
    ) {
        while let Some(tx) = state.waiters.pop_front() {
            if tx.is_closed() {
                continue;
            }
            match tx.send(Ok(Handoff::new(conn, Arc::clone(self)))) {
                Ok(()) => return,
                Err(rejected) => {
                    conn = match rejected {
                        Ok(handoff) => handoff.into_connection(),
                        // Only Ok values are ever sent on this channel.
                        Err(_) => return,
                    };
                }
            }
        }
        state.idle.push_front(conn);
    }

    /// Re-park a connection recovered from an undelivered handoff.
    pub(crate) fn repark(shared: Arc<Self>, conn: PooledConnection<C::Session>) {
        tokio::spawn(async move {
            // Lock confined to this block so the guard never coexists with
            // the `.await` below.
            let to_close = {
                let mut state = shared.lock_state();
                if state.closed {
                    state.size -= 1;
                    state.stats.connections_closed += 1;
                    Some(conn)
                } else {
                    shared.route_released(&mut state, conn);
                    None
                }
            };
            if let Some(conn) = to_close {
                conn.close().await;
            }
        });
    }

    /// Reserve capacity and launch background constructions: enough to get
    /// back to `min_size`, plus one per live waiter while capacity allows.
    pub(crate) fn spawn_builds_locked(self: &Arc<Self>, state: &mut PoolState<C>) {
        if state.closed {
            return;
        }
        let occupied = state.size + state.creating;
        let headroom = self.config.max_size.saturating_sub(occupied);
        let refill = self.config.min_size.saturating_sub(occupied);
        let serve = state.live_waiters().saturating_sub(state.creating);
        let wanted = refill.max(serve).min(headroom);
        state.creating += wanted;
        for _ in 0..wanted {
            let shared = Arc::clone(self);
            tokio::spawn(async move { shared.add_connection().await });
        }
    }

    /// Background construction. Failures are recorded and logged, never
    /// raised; the slot reserved by the caller is always returned.
    async fn add_connection(self: Arc<Self>) {
        match self.establish().await {
            Ok(session) => {
                let conn = PooledConnection::new(session, self.next_id());
                // Lock confined to this block so the guard never coexists
                // with the `.await` below.
                let to_close = {
                    let mut state = self.lock_state();
                    state.creating -= 1;
                    if state.closed {
                        Some(conn)
                    } else {
                        state.size += 1;
                        state.stats.connections_created += 1;
                        let size = state.size;
                        state.stats.note_size(size);
                        tracing::debug!(id = conn.id(), size, "connection added in background");
                        self.route_released(&mut state, conn);
                        None
                    }
                };
                if let Some(conn) = to_close {
                    conn.close().await;
                }
            }
            Err(error) => {
                let mut state = self.lock_state();
                state.creating -= 1;
                state.stats.errors += 1;
                drop(state);
                tracing::warn!(%error, "background connection construction failed");
            }
        }
    }

    /// Construct one fully prepared session: connect, authenticate, select
    /// the namespace/database, and run the schema bootstrap on the first
    /// connection. Applies the retry policy; each attempt is bounded by
    /// `connection_timeout` and authentication rejections are terminal.
    async fn establish(&self) -> Result<C::Session, PoolError> {
        let attempts = self.config.attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.connection_timeout, self.try_establish()).await
            {
                Ok(Ok(session)) => return Ok(session),
                Ok(Err(error @ PoolError::AuthenticationFailed { .. })) => return Err(error),
                Ok(Err(error)) => {
                    tracing::warn!(attempt, attempts, %error, "connection attempt failed");
                    last_error = Some(error);
                }
                Err(_) => {
                    tracing::warn!(attempt, attempts, "connection attempt timed out");
                    last_error = Some(PoolError::create_failed(format!(
                        "attempt timed out after {:?}",
                        self.config.connection_timeout
                    )));
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| PoolError::create_failed("no attempts made")))
    }

    async fn try_establish(&self) -> Result<C::Session, PoolError> {
        let session = self.connector.connect(&self.config).await?;
        match self.prepare(&session).await {
            Ok(()) => Ok(session),
            Err(error) => {
                let _ = session.close().await;
                Err(error)
            }
        }
    }

    async fn prepare(&self, session: &C::Session) -> Result<(), PoolError> {
        if let Some(credentials) = &self.config.credentials {
            session.authenticate(credentials).await?;
        }
        if let (Some(namespace), Some(database)) = (&self.config.namespace, &self.config.database)
        {
            session.select(namespace, database).await?;
        }
        self.bootstrap_if_first(session).await
    }

    /// Run the schema bootstrap exactly once, on whichever construction
    /// claims it first. A failed bootstrap fails that construction and
    /// releases the claim for the next one.
    async fn bootstrap_if_first(&self, session: &C::Session) -> Result<(), PoolError> {
        let Some(statement) = &self.config.schema_bootstrap else {
            return Ok(());
        };
        let claimed = {
            let mut state = self.lock_state();
            if state.bootstrapped {
                false
            } else {
                state.bootstrapped = true;
                true
            }
        };
        if !claimed {
            return Ok(());
        }
        match session.execute(statement, serde_json::Value::Null).await {
            Ok(_) => {
                tracing::info!("schema bootstrap executed");
                Ok(())
            }
            Err(error) => {
                self.lock_state().bootstrapped = false;
                Err(PoolError::create_failed(format!(
                    "schema bootstrap failed: {error}"
                )))
            }
        }
    }

    /// One pass over the pool state. No I/O; retired connections are handed
    /// back for the caller to close outside the lock.
    #[allow(clippy::type_complexity)]
    fn plan_acquire(
        self: &Arc<Self>,
    ) -> (
        Result<Attempt<C>, PoolError>,
        Vec<PooledConnection<C::Session>>,
    ) {
        let mut retired = Vec::new();
        let mut state = self.lock_state();

        if state.closed {
            return (Err(PoolError::PoolClosed), retired);
        }

        // Most-recently-used first: keeps a small working set hot and lets
        // the tail age out through idle reaping.
        while let Some(conn) = state.idle.pop_front() {
            let above_min = state.size > self.config.min_size;
            if let Some(reason) = conn.retire_reason(&self.config, above_min) {
                tracing::debug!(id = conn.id(), ?reason, "retiring connection at acquire");
                state.size -= 1;
                state.stats.connections_closed += 1;
                if reason == RetireReason::Unhealthy {
                    state.stats.unhealthy_detected += 1;
                }
                retired.push(conn);
                continue;
            }
            if !retired.is_empty() {
                self.spawn_builds_locked(&mut state);
            }
            let guard = self.checkout_locked(&mut state, conn);
            return (Ok(Attempt::Ready(guard)), retired);
        }

        if !retired.is_empty() {
            self.spawn_builds_locked(&mut state);
        }

        if state.size + state.creating < self.config.max_size {
            state.creating += 1;
            return (Ok(Attempt::Build), retired);
        }

        // Saturated: enroll. Enrollment and deadline arming are atomic with
        // the capacity check above because the lock is still held.
        let (tx, rx) = oneshot::channel();
        let live = state.live_waiters() + 1;
        state.stats.note_waiters(live);
        state.waiters.push_back(tx);
        (Ok(Attempt::Wait(rx)), retired)
    }

    /// Borrow a connection, waiting at most `limit`.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        limit: Duration,
    ) -> Result<PoolGuard<C>, PoolError> {
        let start = Instant::now();
        let deadline = start + limit;

        let (attempt, retired) = self.plan_acquire();
        for conn in retired {
            conn.close().await;
        }

        match attempt? {
            Attempt::Ready(guard) => Ok(guard),
            Attempt::Build => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.build_for_acquirer(remaining, start).await
            }
            Attempt::Wait(rx) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, rx).await {
                    Ok(Ok(Ok(handoff))) => handoff.checkout(),
                    Ok(Ok(Err(error))) => Err(error),
                    // Sender dropped without a delivery: the pool went away.
                    Ok(Err(_)) => Err(PoolError::PoolClosed),
                    Err(_) => {
                        // Dropping the receiver marked this waiter dead; a
                        // racing delivery is re-parked by the handoff guard.
                        let mut state = self.lock_state();
                        state.stats.timeouts += 1;
                        drop(state);
                        Err(PoolError::AcquireTimeout {
                            waited: start.elapsed(),
                        })
                    }
                }
            }
        }
    }

    /// Acquire step for the caller that reserved a build slot: construct a
    /// connection inline and hand it straight out.
    async fn build_for_acquirer(
        self: &Arc<Self>,
        remaining: Duration,
        start: Instant,
    ) -> Result<PoolGuard<C>, PoolError> {
        let slot = CreatingGuard(Some(Arc::clone(self)));
        let result = match tokio::time::timeout(remaining, self.establish()).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::AcquireTimeout {
                waited: start.elapsed(),
            }),
        };
        // Past the suspension point: bookkeeping below is synchronous.
        slot.disarm();

        match result {
            Ok(session) => {
                let conn = PooledConnection::new(session, self.next_id());
                // Lock confined to this block so the guard never coexists
                // with the `.await` below.
                let outcome = {
                    let mut state = self.lock_state();
                    state.creating -= 1;
                    if state.closed {
                        Err(conn)
                    } else {
                        state.size += 1;
                        state.stats.connections_created += 1;
                        let size = state.size;
                        state.stats.note_size(size);
                        tracing::debug!(
                            id = conn.id(),
                            size,
                            "connection established for acquirer"
                        );
                        Ok(self.checkout_locked(&mut state, conn))
                    }
                };
                match outcome {
                    Ok(guard) => Ok(guard),
                    Err(conn) => {
                        conn.close().await;
                        Err(PoolError::PoolClosed)
                    }
                }
            }
            Err(error) => {
                let mut state = self.lock_state();
                state.creating -= 1;
                match &error {
                    PoolError::AcquireTimeout { .. } => {
                        state.stats.timeouts += 1;
                        // The slot freed up; let a background build serve
                        // anyone still waiting.
                        self.spawn_builds_locked(&mut state);
                    }
                    _ => {
                        state.stats.errors += 1;
                        // The head waiter would otherwise keep waiting for
                        // capacity that just failed to materialize.
                        while let Some(tx) = state.waiters.pop_front() {
                            if tx.is_closed() {
                                continue;
                            }
                            let _ =
                                tx.send(Err(PoolError::create_failed(error.to_string())));
                            break;
                        }
                    }
                }
                drop(state);
                Err(error)
            }
        }
    }

    /// Return a borrowed connection with the caller's outcome report.
    pub(crate) async fn release(
        self: Arc<Self>,
        mut conn: PooledConnection<C::Session>,
        outcome: ReleaseOutcome,
    ) {
        if outcome == ReleaseOutcome::Failed {
            conn.mark_unhealthy();
        }

        // Decision made under one continuous lock hold, pure bookkeeping
        // only: the guard never coexists with an `.await`. `Close`/`Reset`
        // defer their I/O to outside the block; the direct-route path needs
        // no I/O, so it finishes here, atomically with the checks above it.
        enum Step<C: Connector> {
            Close(PooledConnection<C::Session>),
            Reset(PooledConnection<C::Session>, String, String),
        }

        let step: Option<Step<C>> = {
            let mut state = self.lock_state();
            state.stats.record_release();
            conn.mark_free();

            if state.closed {
                state.size -= 1;
                state.stats.connections_closed += 1;
                Some(Step::Close(conn))
            } else if let Some(reason) = conn.retire_reason(&self.config, false) {
                state.size -= 1;
                state.stats.connections_closed += 1;
                if reason == RetireReason::Unhealthy {
                    state.stats.unhealthy_detected += 1;
                }
                self.spawn_builds_locked(&mut state);
                tracing::debug!(id = conn.id(), ?reason, "retiring connection at release");
                Some(Step::Close(conn))
            } else if self.config.reset_on_return {
                match (self.config.namespace.clone(), self.config.database.clone()) {
                    (Some(namespace), Some(database)) => {
                        Some(Step::Reset(conn, namespace, database))
                    }
                    _ => {
                        self.route_released(&mut state, conn);
                        None
                    }
                }
            } else {
                self.route_released(&mut state, conn);
                None
            }
        };

        match step {
            None => {}
            Some(Step::Close(conn)) => {
                conn.close().await;
            }
            // Reset side effect happens outside the lock; a failed reset
            // means the session's state is unknown, so it is retired.
            Some(Step::Reset(mut conn, namespace, database)) => {
                if let Err(error) = conn.session().select(&namespace, &database).await {
                    tracing::warn!(id = conn.id(), %error, "reset on return failed");
                    conn.mark_unhealthy();
                    {
                        let mut state = self.lock_state();
                        state.size -= 1;
                        state.stats.connections_closed += 1;
                        state.stats.unhealthy_detected += 1;
                        self.spawn_builds_locked(&mut state);
                    }
                    conn.close().await;
                    return;
                }

                let to_close = {
                    let mut state = self.lock_state();
                    if state.closed {
                        state.size -= 1;
                        state.stats.connections_closed += 1;
                        Some(conn)
                    } else {
                        self.route_released(&mut state, conn);
                        None
                    }
                };
                if let Some(conn) = to_close {
                    conn.close().await;
                }
            }
        }
    }

    pub(crate) fn spawn_release(
        shared: Arc<Self>,
        conn: PooledConnection<C::Session>,
        outcome: ReleaseOutcome,
    ) {
        tokio::spawn(async move { shared.release(conn, outcome).await });
    }

    /// Close the pool: drain waiters, close idle connections, stop the
    /// maintainer. Idempotent; borrowed connections are closed when their
    /// guards return them.
    pub(crate) async fn close(self: &Arc<Self>) {
        let (drained_conns, drained_waiters) = {
            let mut state = self.lock_state();
            if state.closed {
                // The first close did the work.
                (VecDeque::new(), Vec::new())
            } else {
                state.closed = true;
                let conns = std::mem::take(&mut state.idle);
                state.size -= conns.len();
                state.stats.connections_closed += conns.len() as u64;
                let waiters: Vec<_> = std::mem::take(&mut state.waiters).into_iter().collect();
                (conns, waiters)
            }
        };

        for waiter in drained_waiters {
            let _ = waiter.send(Err(PoolError::PoolClosed));
        }
        for conn in drained_conns {
            conn.close().await;
        }

        let _ = self.shutdown.send(true);
        if let Some(handle) = self
            .maintainer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        tracing::info!("pool closed");
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        state
            .stats
            .snapshot(state.size, state.idle.len(), state.live_waiters())
    }
}

/// A connection pool over a [`Connector`].
///
/// Cheap to clone; all clones share the same state. The pool is closed
/// explicitly with [`Pool::close`]; dropping the last handle does not
/// close connections, though the maintainer stops once no handle remains.
pub struct Pool<C: Connector> {
    shared: Arc<PoolShared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pool({:p})", self.shared)
    }
}

impl<C: Connector> Pool<C> {
    /// Validate `config`, establish `min_size` connections concurrently,
    /// and start the health maintainer.
    ///
    /// If any of the initial connections fails after exhausting its
    /// retries, the ones that succeeded are torn down and the error is
    /// returned.
    pub async fn initialize(config: PoolConfig, connector: C) -> Result<Self, PoolError> {
        config.validate()?;

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(PoolShared {
            config,
            connector,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                size: 0,
                creating: 0,
                checking: 0,
                closed: false,
                bootstrapped: false,
                stats: StatsRecorder::default(),
            }),
            next_id: AtomicU64::new(1),
            shutdown,
            maintainer: Mutex::new(None),
        });

        let min = shared.config.min_size;
        let results =
            futures::future::join_all((0..min).map(|_| shared.establish())).await;

        let mut sessions = Vec::with_capacity(min);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(session) => sessions.push(session),
                Err(error) if first_error.is_none() => first_error = Some(error),
                Err(_) => {}
            }
        }
        if let Some(error) = first_error {
            for session in sessions {
                let _ = session.close().await;
            }
            return Err(error);
        }

        {
            let mut state = shared.lock_state();
            for session in sessions {
                let conn = PooledConnection::new(session, shared.next_id());
                state.size += 1;
                state.stats.connections_created += 1;
                state.idle.push_front(conn);
            }
            let size = state.size;
            state.stats.note_size(size);
        }

        maintainer::spawn(&shared);
        tracing::info!(
            min = shared.config.min_size,
            max = shared.config.max_size,
            "pool initialized"
        );
        Ok(Self { shared })
    }

    /// Borrow a connection, waiting up to the configured
    /// `acquisition_timeout`.
    ///
    /// The returned [`PoolGuard`] gives the connection back on every exit
    /// path.
    pub async fn acquire(&self) -> Result<PoolGuard<C>, PoolError> {
        self.shared
            .acquire(self.shared.config.acquisition_timeout)
            .await
    }

    /// Borrow a connection with a caller deadline. Deadlines beyond the
    /// configured `acquisition_timeout` are clamped down to it.
    pub async fn acquire_within(&self, limit: Duration) -> Result<PoolGuard<C>, PoolError> {
        self.shared
            .acquire(limit.min(self.shared.config.acquisition_timeout))
            .await
    }

    /// Close the pool. Idempotent. In-flight waiters fail with
    /// `PoolClosed`, idle connections are closed now, borrowed ones when
    /// their guards return them. Every operation after close fails with
    /// `PoolClosed` except close itself and [`Pool::stats`].
    pub async fn close(&self) {
        self.shared.close().await;
    }

    /// Whether [`Pool::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// A consistent snapshot of the pool's counters and gauges.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// The validated configuration this pool runs with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

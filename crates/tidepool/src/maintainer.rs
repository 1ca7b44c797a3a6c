//! Background health maintenance.
//!
//! One task per pool, started at initialization and stopped by close. Each
//! tick probes idle connections that have not been exercised recently,
//! reaps idle connections above the minimum size, and refills toward the
//! minimum. The task holds only a weak pool handle, so it never keeps a
//! pool alive on its own.

use std::collections::VecDeque;
use std::sync::Arc;

use tidepool_core::{Connector, Session};

use crate::pool::PoolShared;

pub(crate) fn spawn<C: Connector>(shared: &Arc<PoolShared<C>>) {
    let weak = Arc::downgrade(shared);
    let mut shutdown = shared.shutdown_receiver();
    let interval = shared.config.health_check_interval;

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; a fresh
        // pool does not need probing yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            // Upgrade per tick only: between ticks the task must not keep
            // the pool alive.
            let Some(shared) = weak.upgrade() else { break };
            if shared.is_closed() {
                break;
            }
            run_once(&shared).await;
        }
    });

    shared.store_maintainer(handle);
}

/// One maintenance pass. Never holds the pool lock across I/O.
pub(crate) async fn run_once<C: Connector>(shared: &Arc<PoolShared<C>>) {
    let interval = shared.config.health_check_interval;
    let max_lifetime = shared.config.max_lifetime;

    // Phase 1, under the lock: reap stale idles from the cold end of the
    // queue, then withdraw probe candidates into a transient checking set.
    let (reaped, candidates) = {
        let mut state = shared.lock_state();
        if state.closed {
            return;
        }

        let mut reaped = Vec::new();
        while state.size > shared.config.min_size {
            let stale = state
                .idle
                .back()
                .is_some_and(|conn| conn.idle_duration() >= shared.config.max_idle_time);
            if !stale {
                break;
            }
            if let Some(conn) = state.idle.pop_back() {
                state.size -= 1;
                state.stats.connections_closed += 1;
                reaped.push(conn);
            }
        }

        // Probe whatever has sat idle for half an interval, plus anything
        // within one interval of its lifetime limit.
        let mut candidates = Vec::new();
        let mut keep = VecDeque::with_capacity(state.idle.len());
        while let Some(conn) = state.idle.pop_front() {
            let due_idle = conn.idle_duration() >= interval / 2;
            let due_age = conn.age() + interval >= max_lifetime;
            if due_idle || due_age {
                candidates.push(conn);
            } else {
                keep.push_back(conn);
            }
        }
        state.idle = keep;
        state.checking += candidates.len();
        (reaped, candidates)
    };

    for conn in reaped {
        tracing::debug!(id = conn.id(), "reaping idle connection");
        conn.close().await;
    }

    // Phase 2: probe each candidate outside the lock, bounded like any
    // other driver round-trip.
    for mut conn in candidates {
        let healthy =
            tokio::time::timeout(shared.config.connection_timeout, conn.session().ping())
                .await
                .map_or(false, |result| result.is_ok());

        // The lock is confined to this block, pure bookkeeping only, so the
        // guard never coexists with the `.await` below.
        let to_close = {
            let mut state = shared.lock_state();
            state.checking -= 1;
            state.stats.health_checks += 1;

            if state.closed {
                state.size -= 1;
                state.stats.connections_closed += 1;
                Some(conn)
            } else if healthy {
                shared.route_released(&mut state, conn);
                None
            } else {
                conn.mark_unhealthy();
                state.size -= 1;
                state.stats.connections_closed += 1;
                state.stats.unhealthy_detected += 1;
                Some(conn)
            }
        };

        if let Some(conn) = to_close {
            if !healthy {
                tracing::warn!(id = conn.id(), "probe failed, retiring connection");
            }
            conn.close().await;
        }
    }

    // Phase 3: refill toward the minimum in the background.
    {
        let mut state = shared.lock_state();
        if !state.closed {
            shared.spawn_builds_locked(&mut state);
        }
    }
}

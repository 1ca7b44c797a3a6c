//! Pool statistics.

/// Point-in-time snapshot of pool counters and gauges.
///
/// Counters are monotonic for the lifetime of the pool; gauges reflect the
/// moment the snapshot was taken. All fields are updated under the pool
/// lock, so a snapshot is internally consistent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Successful checkouts handed to callers.
    pub acquisitions: u64,
    /// Connections returned by callers.
    pub releases: u64,
    /// Acquires that failed on their deadline.
    pub timeouts: u64,
    /// Construction and background failures.
    pub errors: u64,
    /// Connections established over the pool's lifetime.
    pub connections_created: u64,
    /// Connections retired over the pool's lifetime.
    pub connections_closed: u64,
    /// Liveness probes executed by the maintainer.
    pub health_checks: u64,
    /// Connections found unhealthy by probes or caller reports.
    pub unhealthy_detected: u64,
    /// Live connections right now (idle plus borrowed).
    pub current_size: usize,
    /// Connections currently borrowed.
    pub current_in_use: usize,
    /// Connections currently idle.
    pub current_idle: usize,
    /// Acquirers currently enrolled and still waiting.
    pub current_waiters: usize,
    /// Largest `current_size` ever observed.
    pub peak_size: usize,
    /// Largest `current_in_use` ever observed.
    pub peak_in_use: usize,
    /// Largest `current_waiters` ever observed.
    pub peak_waiters: usize,
}

/// Counter state maintained under the pool lock.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    pub(crate) acquisitions: u64,
    pub(crate) releases: u64,
    pub(crate) timeouts: u64,
    pub(crate) errors: u64,
    pub(crate) connections_created: u64,
    pub(crate) connections_closed: u64,
    pub(crate) health_checks: u64,
    pub(crate) unhealthy_detected: u64,
    current_in_use: usize,
    peak_in_use: usize,
    peak_size: usize,
    peak_waiters: usize,
}

impl StatsRecorder {
    pub(crate) fn record_acquisition(&mut self) {
        self.acquisitions += 1;
        self.current_in_use += 1;
        if self.current_in_use > self.peak_in_use {
            self.peak_in_use = self.current_in_use;
        }
    }

    pub(crate) fn record_release(&mut self) {
        self.releases += 1;
        self.current_in_use = self.current_in_use.saturating_sub(1);
    }

    pub(crate) fn note_size(&mut self, size: usize) {
        if size > self.peak_size {
            self.peak_size = size;
        }
    }

    pub(crate) fn note_waiters(&mut self, live: usize) {
        if live > self.peak_waiters {
            self.peak_waiters = live;
        }
    }

    pub(crate) fn snapshot(&self, size: usize, idle: usize, waiters: usize) -> PoolStats {
        PoolStats {
            acquisitions: self.acquisitions,
            releases: self.releases,
            timeouts: self.timeouts,
            errors: self.errors,
            connections_created: self.connections_created,
            connections_closed: self.connections_closed,
            health_checks: self.health_checks,
            unhealthy_detected: self.unhealthy_detected,
            current_size: size,
            current_in_use: self.current_in_use,
            current_idle: idle,
            current_waiters: waiters,
            peak_size: self.peak_size,
            peak_in_use: self.peak_in_use,
            peak_waiters: self.peak_waiters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisition_release_cycle_balances() {
        let mut recorder = StatsRecorder::default();
        recorder.record_acquisition();
        recorder.record_acquisition();
        recorder.record_release();

        let stats = recorder.snapshot(2, 0, 0);
        assert_eq!(stats.acquisitions, 2);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.current_in_use, 1);
        assert_eq!(stats.peak_in_use, 2);
        assert_eq!(
            stats.acquisitions - stats.releases,
            stats.current_in_use as u64
        );
    }

    #[test]
    fn peaks_never_decrease() {
        let mut recorder = StatsRecorder::default();
        recorder.note_size(5);
        recorder.note_size(3);
        recorder.note_waiters(2);
        recorder.note_waiters(1);

        let stats = recorder.snapshot(3, 3, 0);
        assert_eq!(stats.peak_size, 5);
        assert_eq!(stats.peak_waiters, 2);
    }
}

//! Named-pool registry.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tidepool_core::{Connector, PoolConfig, PoolError};

use crate::pool::Pool;

/// Everything the registry mutex guards: finished pools plus the names
/// reserved by in-flight `create` calls.
struct RegistryState<C: Connector> {
    pools: HashMap<String, Pool<C>>,
    creating: HashSet<String>,
}

/// Removes a name reservation when an in-flight `create` finishes,
/// whatever its exit path.
struct Claim<'a, C: Connector> {
    registry: &'a PoolRegistry<C>,
    name: Option<String>,
}

impl<C: Connector> Drop for Claim<'_, C> {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            self.registry.lock_state().creating.remove(&name);
        }
    }
}

/// Process-scoped mapping from pool names to pools.
///
/// An explicit value rather than a process global: hosts that want the
/// conventional shared instance keep a `PoolRegistry::default()` in their
/// own state and pass it by reference.
///
/// One mutex serializes registry operations; it is never held across I/O,
/// and pool operations never touch it. `create` reserves the name under
/// the lock, runs pool initialization unlocked, then briefly re-acquires
/// to publish the finished pool, so a slow construction cannot block
/// lookups or mutations for unrelated names.
pub struct PoolRegistry<C: Connector> {
    state: Mutex<RegistryState<C>>,
}

impl<C: Connector> PoolRegistry<C> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                pools: HashMap::new(),
                creating: HashSet::new(),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize a pool and register it under `name`.
    ///
    /// Fails with [`PoolError::PoolExists`] if the name is registered or
    /// reserved by a concurrent `create`, or with the initialization error
    /// if construction fails (in which case nothing is registered and the
    /// reservation is released).
    pub async fn create(
        &self,
        name: impl Into<String>,
        config: PoolConfig,
        connector: C,
    ) -> Result<Pool<C>, PoolError> {
        let name = name.into();
        {
            let mut state = self.lock_state();
            if state.pools.contains_key(&name) || !state.creating.insert(name.clone()) {
                return Err(PoolError::PoolExists { name });
            }
        }
        // The reservation stands in for the pool while the lock is
        // released for construction; the claim clears it on every exit
        // path, including cancellation.
        let claim = Claim {
            registry: self,
            name: Some(name.clone()),
        };

        let pool = Pool::initialize(config, connector).await?;

        let mut state = self.lock_state();
        state.pools.insert(name.clone(), pool.clone());
        drop(state);
        drop(claim);
        tracing::info!(%name, "pool registered");
        Ok(pool)
    }

    /// Look up a registered pool.
    pub async fn get(&self, name: &str) -> Option<Pool<C>> {
        self.lock_state().pools.get(name).cloned()
    }

    /// Close a pool and forget it.
    pub async fn close(&self, name: &str) -> Result<(), PoolError> {
        let removed = self.lock_state().pools.remove(name);
        match removed {
            Some(pool) => {
                pool.close().await;
                Ok(())
            }
            None => Err(PoolError::UnknownPool {
                name: name.to_string(),
            }),
        }
    }

    /// Close every registered pool, best-effort in parallel.
    pub async fn close_all(&self) {
        let drained: Vec<Pool<C>> = {
            let mut state = self.lock_state();
            state.pools.drain().map(|(_, pool)| pool).collect()
        };
        futures::future::join_all(drained.iter().map(Pool::close)).await;
    }

    /// Names of the currently registered pools.
    pub async fn names(&self) -> Vec<String> {
        self.lock_state().pools.keys().cloned().collect()
    }
}

impl<C: Connector> Default for PoolRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

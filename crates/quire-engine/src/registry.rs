use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use quire_core::TurnId;

use crate::executor::TurnExecutor;

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// How often the sweep runs.
    pub sweep_interval: Duration,
    /// How long a finished executor stays reachable for reconnection.
    pub retention: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            retention: Duration::from_secs(600),
        }
    }
}

/// Process-wide directory of turn executors, keyed by turn id.
///
/// Finished executors are kept around for the retention window so late
/// subscribers can still replay the turn, then swept.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<TurnId, Arc<TurnExecutor>>>,
    completed_at: DashMap<TurnId, Instant>,
    config: RegistryConfig,
    shutdown: CancellationToken,
}

impl ExecutorRegistry {
    /// A registry without a background sweep. Call [`sweep`](Self::sweep)
    /// manually or use [`start`](Self::start).
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
            completed_at: DashMap::new(),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// A registry with its periodic sweep running until [`shutdown`](Self::shutdown)
    /// or drop.
    pub fn start(config: RegistryConfig) -> Arc<Self> {
        let registry = Arc::new(Self::new(config));
        spawn_sweeper(Arc::downgrade(&registry), registry.config.sweep_interval, registry.shutdown.clone());
        registry
    }

    /// Returns false, leaving the existing entry alone, if the turn already
    /// has an executor.
    pub fn register(&self, turn_id: TurnId, executor: Arc<TurnExecutor>) -> bool {
        let mut executors = self.executors.write();
        if executors.contains_key(&turn_id) {
            return false;
        }
        debug!(turn_id = %turn_id, "executor registered");
        executors.insert(turn_id, executor);
        true
    }

    pub fn get(&self, turn_id: &TurnId) -> Option<Arc<TurnExecutor>> {
        self.executors.read().get(turn_id).cloned()
    }

    pub fn remove(&self, turn_id: &TurnId) {
        self.executors.write().remove(turn_id);
        self.completed_at.remove(turn_id);
    }

    /// Start the retention clock for a finished turn.
    pub fn mark_completed(&self, turn_id: &TurnId) {
        self.completed_at.insert(turn_id.clone(), Instant::now());
    }

    pub fn count(&self) -> usize {
        self.executors.read().len()
    }

    pub fn turn_ids(&self) -> Vec<TurnId> {
        self.executors.read().keys().cloned().collect()
    }

    /// Drop finished executors past the retention window. Finished ones
    /// never marked completed get stamped now instead. Returns how many
    /// were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut executors = self.executors.write();
        let before = executors.len();
        executors.retain(|turn_id, executor| {
            if !executor.status().is_terminal() {
                return true;
            }
            match self.completed_at.get(turn_id).map(|at| *at) {
                Some(at) if now.duration_since(at) >= self.config.retention => {
                    self.completed_at.remove(turn_id);
                    false
                }
                Some(_) => true,
                None => {
                    self.completed_at.insert(turn_id.clone(), now);
                    true
                }
            }
        });
        before - executors.len()
    }

    /// Interrupt every executor still streaming. Returns how many were.
    pub fn interrupt_all(&self) -> usize {
        let executors = self.executors.read();
        let mut interrupted = 0;
        for executor in executors.values() {
            if !executor.status().is_terminal() {
                executor.interrupt();
                interrupted += 1;
            }
        }
        interrupted
    }

    /// Stop the background sweep. Registered executors are left as is.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ExecutorRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_sweeper(registry: Weak<ExecutorRegistry>, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let removed = registry.sweep();
            if removed > 0 {
                info!(removed, remaining = registry.count(), "swept finished executors");
            }
        }
        debug!("executor sweep stopped");
    });
}

//! Periodic engine health polling.
//!
//! Runs only while the store says the engine is up. The task ends on its own
//! when `is_engine_running` flips to false and is aborted when the owner stops
//! the engine or shuts down.

use crate::engine::EngineBridge;
use crate::model::now_millis;
use crate::store::{Action, Store};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

#[derive(Default)]
pub(crate) struct HealthPoller {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthPoller {
    /// (Re)start polling. Any previous loop is cancelled first.
    pub(crate) fn start(&self, bridge: Arc<EngineBridge>, store: Store, every: Duration, stale_after: Duration) {
        let task = tokio::spawn(poll_health(bridge, store, every, stale_after));
        if let Some(old) = self.task.lock().replace(task) {
            old.abort();
        }
    }

    pub(crate) fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for HealthPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_health(bridge: Arc<EngineBridge>, store: Store, every: Duration, stale_after: Duration) {
    let mut state_rx = store.subscribe();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; polling starts one period in.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !bridge.is_engine_running() {
                    break;
                }
                let health = bridge.get_engine_health();
                if !health.is_fresh(now_millis(), stale_after) {
                    warn!(last_heartbeat = health.last_heartbeat, "engine is not responding");
                }
                store.dispatch(Action::EngineHealthUpdate { health });
            }
            changed = state_rx.changed() => {
                if changed.is_err() || !state_rx.borrow_and_update().is_engine_running {
                    break;
                }
            }
        }
    }
    debug!("health poll loop finished");
}

//! Typed publish/subscribe channels for engine-originated events.
//!
//! Each event kind gets its own [`Channel`]. Subscribing returns a
//! [`Subscription`] token; calling [`Subscription::unsubscribe`] removes the
//! handler and is safe to call any number of times.

use crate::model::{EngineEvent, EngineFault, EngineHealth, Metrics, Stage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<u64, Handler<T>>>,
}

trait Unsubscribe: Send + Sync {
    fn remove(&self, id: u64);
}

impl<T> Unsubscribe for Registry<T> {
    fn remove(&self, id: u64) {
        self.handlers.lock().remove(&id);
    }
}

/// A set of handlers for one event kind.
pub struct Channel<T> {
    registry: Arc<Registry<T>>,
}

impl<T: 'static> Channel<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.handlers.lock().insert(id, Arc::new(handler));
        let registry: Weak<dyn Unsubscribe> = Arc::downgrade(&self.registry) as Weak<dyn Unsubscribe>;
        Subscription {
            id,
            registry,
            active: AtomicBool::new(true),
        }
    }

    /// Deliver `value` to every current subscriber.
    ///
    /// Handlers are cloned out of the lock first so a handler may subscribe or
    /// unsubscribe without deadlocking.
    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self.registry.handlers.lock().values().cloned().collect();
        for h in handlers {
            h(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.handlers.lock().len()
    }
}

impl<T: 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation token returned by [`Channel::subscribe`].
#[must_use = "dropping a Subscription leaves the handler registered; call unsubscribe()"]
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Unsubscribe>,
    active: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(self.id);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.registry.strong_count() > 0
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub stage: Option<Stage>,
    pub progress: Option<f64>,
    pub elapsed_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineStarted {
    pub process_id: Option<u32>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineStopped {
    pub exit_code: Option<i32>,
    /// False when the engine went away without being asked to.
    pub requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct HeartbeatSample {
    at: u64,
    memory_usage: Option<f64>,
    cpu_usage: Option<f64>,
}

/// Fan-out point between a transport and everyone listening to the engine.
///
/// Also owns the engine-running flag and the latest heartbeat so health can be
/// answered without touching the transport.
pub struct EventHub {
    pub status: Channel<StatusUpdate>,
    pub stage: Channel<Stage>,
    pub metrics: Channel<Metrics>,
    pub error: Channel<EngineFault>,
    pub heartbeat: Channel<EngineHealth>,
    pub started: Channel<EngineStarted>,
    pub stopped: Channel<EngineStopped>,
    running: AtomicBool,
    last_heartbeat: Mutex<Option<HeartbeatSample>>,
    heartbeat_timeout: Duration,
}

impl EventHub {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            status: Channel::new(),
            stage: Channel::new(),
            metrics: Channel::new(),
            error: Channel::new(),
            heartbeat: Channel::new(),
            started: Channel::new(),
            stopped: Channel::new(),
            running: AtomicBool::new(false),
            last_heartbeat: Mutex::new(None),
            heartbeat_timeout,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn mark_started(&self, info: EngineStarted, at: u64) {
        *self.last_heartbeat.lock() = Some(HeartbeatSample {
            at,
            memory_usage: None,
            cpu_usage: None,
        });
        self.running.store(true, Ordering::Release);
        self.started.emit(&info);
    }

    /// Flip to stopped and notify. Returns false if the engine was already down.
    pub(crate) fn mark_stopped(&self, exit_code: Option<i32>, requested: bool) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        *self.last_heartbeat.lock() = None;
        self.stopped.emit(&EngineStopped {
            exit_code,
            requested,
        });
        true
    }

    /// Snapshot of engine health from cached heartbeat data. Never blocks on I/O.
    pub fn health(&self, now: u64) -> EngineHealth {
        let sample = *self.last_heartbeat.lock();
        match sample {
            Some(s) if self.is_running() => EngineHealth {
                is_responding: now.saturating_sub(s.at)
                    <= self.heartbeat_timeout.as_millis() as u64,
                last_heartbeat: s.at,
                memory_usage: s.memory_usage,
                cpu_usage: s.cpu_usage,
            },
            Some(s) => EngineHealth {
                is_responding: false,
                last_heartbeat: s.at,
                memory_usage: s.memory_usage,
                cpu_usage: s.cpu_usage,
            },
            None => EngineHealth {
                is_responding: false,
                last_heartbeat: 0,
                memory_usage: None,
                cpu_usage: None,
            },
        }
    }

    /// Route one engine event to the matching channel.
    pub fn publish(&self, event: EngineEvent) {
        match event {
            EngineEvent::StatusUpdate {
                stage,
                progress,
                elapsed_time,
            } => self.status.emit(&StatusUpdate {
                stage,
                progress,
                elapsed_time,
            }),
            EngineEvent::StageChange { stage } => {
                debug!(%stage, "engine stage change");
                self.stage.emit(&stage)
            }
            EngineEvent::MetricsUpdate(m) => self.metrics.emit(&m),
            EngineEvent::Error(fault) => {
                warn!(code = %fault.code, message = %fault.message, "engine fault");
                self.error.emit(&fault)
            }
            EngineEvent::Heartbeat {
                memory_usage,
                cpu_usage,
                timestamp,
            } => {
                if !self.is_running() {
                    return;
                }
                *self.last_heartbeat.lock() = Some(HeartbeatSample {
                    at: timestamp,
                    memory_usage,
                    cpu_usage,
                });
                self.heartbeat.emit(&EngineHealth {
                    is_responding: true,
                    last_heartbeat: timestamp,
                    memory_usage,
                    cpu_usage,
                });
            }
            EngineEvent::Exited { code } => {
                if self.mark_stopped(code, false) {
                    warn!(?code, "engine exited unexpectedly");
                }
            }
            EngineEvent::Unknown => debug!("ignoring unknown engine event"),
        }
    }
}

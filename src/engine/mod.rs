//! Engine bridge.
//!
//! The only path to the external engine. Lifecycle calls report failure as
//! values ([`StartupResult`] with `success: false`); commands sent to a stopped
//! engine or with malformed input fail with a [`BridgeError`].

mod error;
mod events;
mod process;
mod protocol;
mod simulated;
mod transport;

pub use error::BridgeError;
pub use events::{EngineStarted, EngineStopped, EventHub, StatusUpdate, Subscription};
pub use process::{ProcessConfig, ProcessTransport};
pub use protocol::{EngineCommand, EngineReply};
pub use simulated::{SimulatedEngine, SimulatedEngineConfig};
pub use transport::{EngineTransport, LaunchInfo};

#[cfg(test)]
pub(crate) use simulated::tests_support;

use crate::model::{
    now_millis, AnimationConfig, EngineFault, EngineHealth, EngineSettings, Envelope,
    LoadImageResult, Metrics, Stage, StartupResult, WatermarkConfig,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct EngineBridge {
    transport: Arc<dyn EngineTransport>,
    hub: Arc<EventHub>,
    // Serializes start/stop so a restart cannot interleave with another launch.
    lifecycle: tokio::sync::Mutex<Option<LaunchInfo>>,
}

impl EngineBridge {
    pub fn new(transport: Arc<dyn EngineTransport>, heartbeat_timeout: Duration) -> Self {
        Self {
            transport,
            hub: Arc::new(EventHub::new(heartbeat_timeout)),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Launch the engine. Already running is a success describing the live process.
    pub async fn start_engine(&self) -> StartupResult {
        let mut current = self.lifecycle.lock().await;
        if self.hub.is_running() {
            let info = current.clone().unwrap_or_default();
            debug!(pid = ?info.process_id, "engine already running");
            return StartupResult {
                success: true,
                process_id: info.process_id,
                version: info.version,
                error: None,
                startup_time: Duration::ZERO,
            };
        }

        let started = Instant::now();
        info!(transport = %self.transport.describe(), "starting engine");
        match self.transport.launch(self.hub.clone()).await {
            Ok(info) => {
                let startup_time = started.elapsed();
                self.hub.mark_started(
                    EngineStarted {
                        process_id: info.process_id,
                        version: info.version.clone(),
                    },
                    now_millis(),
                );
                info!(
                    pid = ?info.process_id,
                    version = ?info.version,
                    startup_ms = startup_time.as_millis() as u64,
                    "engine started"
                );
                *current = Some(info.clone());
                StartupResult {
                    success: true,
                    process_id: info.process_id,
                    version: info.version,
                    error: None,
                    startup_time,
                }
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "engine failed to start");
                *current = None;
                StartupResult {
                    success: false,
                    process_id: None,
                    version: None,
                    error: Some(format!("{e:#}")),
                    startup_time: started.elapsed(),
                }
            }
        }
    }

    /// Stop the engine. Resolves immediately if it is not running.
    pub async fn stop_engine(&self) {
        let mut current = self.lifecycle.lock().await;
        // Flip the flag before tearing down so the transport's own exit
        // notification is not reported as a crash.
        if !self.hub.mark_stopped(None, true) {
            *current = None;
            return;
        }
        if let Err(e) = self.transport.shutdown().await {
            warn!(error = %format!("{e:#}"), "engine shutdown was not clean");
        }
        *current = None;
        info!("engine stopped");
    }

    pub async fn restart_engine(&self) -> StartupResult {
        self.stop_engine().await;
        self.start_engine().await
    }

    pub fn is_engine_running(&self) -> bool {
        self.hub.is_running()
    }

    /// Health from cached heartbeat data; no I/O.
    pub fn get_engine_health(&self) -> EngineHealth {
        self.hub.health(now_millis())
    }

    async fn send(&self, command: EngineCommand) -> Result<EngineReply, BridgeError> {
        let name = command.name();
        if !self.hub.is_running() {
            return Err(BridgeError::NotRunning(name));
        }
        debug!(command = name, "engine request");
        self.transport.request(command).await
    }

    async fn send_expect_ack(&self, command: EngineCommand) -> Result<(), BridgeError> {
        let name = command.name();
        match self.send(command).await? {
            EngineReply::Ack => Ok(()),
            EngineReply::Failed { error } => Err(BridgeError::Rejected {
                command: name,
                reason: error,
            }),
            other => Err(BridgeError::Transport(format!(
                "unexpected reply to {name}: {other:?}"
            ))),
        }
    }

    fn require_running(&self, command: &'static str) -> Result<(), BridgeError> {
        if self.hub.is_running() {
            Ok(())
        } else {
            Err(BridgeError::NotRunning(command))
        }
    }

    /// Ask the engine to load an image. Missing files come back as `success: false`.
    pub async fn load_image(&self, path: &Path) -> Result<LoadImageResult, BridgeError> {
        self.require_running("loadImage")?;
        if path.as_os_str().is_empty() {
            return Ok(LoadImageResult::failed("no image path given"));
        }
        if !matches!(tokio::fs::try_exists(path).await, Ok(true)) {
            return Ok(LoadImageResult::failed(format!(
                "image file not found: {}",
                path.display()
            )));
        }
        let reply = self
            .send(EngineCommand::LoadImage {
                path: path.to_path_buf(),
            })
            .await?;
        match reply {
            EngineReply::ImageLoaded { width, height } => Ok(LoadImageResult::loaded(width, height)),
            EngineReply::Failed { error } => Ok(LoadImageResult::failed(error)),
            other => Err(BridgeError::Transport(format!(
                "unexpected reply to loadImage: {other:?}"
            ))),
        }
    }

    pub async fn start_animation(&self, config: &AnimationConfig) -> Result<(), BridgeError> {
        self.require_running("startAnimation")?;
        if config.is_empty() {
            return Err(BridgeError::MalformedInput(
                "animation config has no image path".into(),
            ));
        }
        self.send_expect_ack(EngineCommand::StartAnimation {
            config: config.clone(),
        })
        .await
    }

    pub async fn pause_animation(&self) -> Result<(), BridgeError> {
        self.send_expect_ack(EngineCommand::Pause).await
    }

    pub async fn resume_animation(&self) -> Result<(), BridgeError> {
        self.send_expect_ack(EngineCommand::Resume).await
    }

    pub async fn stop_animation(&self) -> Result<(), BridgeError> {
        self.send_expect_ack(EngineCommand::StopAnimation).await
    }

    pub async fn skip_to_final(&self) -> Result<(), BridgeError> {
        self.send_expect_ack(EngineCommand::SkipToFinal).await
    }

    pub async fn update_engine_settings(&self, settings: &EngineSettings) -> Result<(), BridgeError> {
        self.require_running("updateSettings")?;
        if settings.is_empty() {
            return Err(BridgeError::MalformedInput("settings update is empty".into()));
        }
        self.send_expect_ack(EngineCommand::UpdateSettings {
            settings: settings.clone(),
        })
        .await
    }

    pub async fn set_watermark(&self, watermark: Option<&WatermarkConfig>) -> Result<(), BridgeError> {
        self.send_expect_ack(EngineCommand::SetWatermark {
            watermark: watermark.cloned(),
        })
        .await
    }

    pub async fn send_message(&self, envelope: &Envelope) -> Result<serde_json::Value, BridgeError> {
        self.require_running("sendMessage")?;
        if !envelope.is_well_formed() {
            return Err(BridgeError::MalformedInput(
                "message envelope needs an id and a type".into(),
            ));
        }
        match self
            .send(EngineCommand::Message {
                envelope: envelope.clone(),
            })
            .await?
        {
            EngineReply::Message { payload } => Ok(payload),
            EngineReply::Ack => Ok(serde_json::Value::Null),
            EngineReply::Failed { error } => Err(BridgeError::Rejected {
                command: "sendMessage",
                reason: error,
            }),
            other => Err(BridgeError::Transport(format!(
                "unexpected reply to sendMessage: {other:?}"
            ))),
        }
    }

    pub async fn broadcast_message(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        self.require_running("broadcastMessage")?;
        if !envelope.is_well_formed() {
            return Err(BridgeError::MalformedInput(
                "message envelope needs an id and a type".into(),
            ));
        }
        self.send_expect_ack(EngineCommand::Broadcast {
            envelope: envelope.clone(),
        })
        .await
    }

    pub fn on_status_update<F>(&self, f: F) -> Subscription
    where
        F: Fn(&StatusUpdate) + Send + Sync + 'static,
    {
        self.hub.status.subscribe(f)
    }

    pub fn on_stage_change<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Stage) + Send + Sync + 'static,
    {
        self.hub.stage.subscribe(f)
    }

    pub fn on_metrics_update<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Metrics) + Send + Sync + 'static,
    {
        self.hub.metrics.subscribe(f)
    }

    pub fn on_error<F>(&self, f: F) -> Subscription
    where
        F: Fn(&EngineFault) + Send + Sync + 'static,
    {
        self.hub.error.subscribe(f)
    }

    pub fn on_heartbeat<F>(&self, f: F) -> Subscription
    where
        F: Fn(&EngineHealth) + Send + Sync + 'static,
    {
        self.hub.heartbeat.subscribe(f)
    }

    pub fn on_engine_started<F>(&self, f: F) -> Subscription
    where
        F: Fn(&EngineStarted) + Send + Sync + 'static,
    {
        self.hub.started.subscribe(f)
    }

    pub fn on_engine_stopped<F>(&self, f: F) -> Subscription
    where
        F: Fn(&EngineStopped) + Send + Sync + 'static,
    {
        self.hub.stopped.subscribe(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bridge() -> EngineBridge {
        let engine = SimulatedEngine::new(SimulatedEngineConfig::instant());
        EngineBridge::new(Arc::new(engine), Duration::from_secs(5))
    }

    fn png_file() -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        f.write_all(&tests_support::png_header(320, 200))
            .unwrap();
        f
    }

    #[tokio::test]
    async fn cold_start_reports_startup_time() {
        let b = bridge();
        assert!(!b.is_engine_running());
        let r = b.start_engine().await;
        assert!(r.success);
        assert!(r.error.is_none());
        assert!(r.process_id.is_some());
        assert!(b.is_engine_running());
        assert!(b.get_engine_health().is_responding);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let b = bridge();
        let launches = Arc::new(AtomicUsize::new(0));
        let l = launches.clone();
        let sub = b.on_engine_started(move |_| {
            l.fetch_add(1, Ordering::SeqCst);
        });
        let first = b.start_engine().await;
        let second = b.start_engine().await;
        assert!(second.success);
        assert_eq!(second.process_id, first.process_id);
        assert_eq!(second.startup_time, Duration::ZERO);
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let b = bridge();
        b.stop_engine().await;
        assert!(!b.is_engine_running());
        b.start_engine().await;
        b.stop_engine().await;
        b.stop_engine().await;
        assert!(!b.is_engine_running());
        assert!(!b.get_engine_health().is_responding);
    }

    #[tokio::test]
    async fn failed_launch_is_a_value_not_an_error() {
        let cfg = SimulatedEngineConfig {
            fail_launch: true,
            ..SimulatedEngineConfig::instant()
        };
        let b = EngineBridge::new(Arc::new(SimulatedEngine::new(cfg)), Duration::from_secs(5));
        let r = b.start_engine().await;
        assert!(!r.success);
        assert!(r.error.as_deref().is_some_and(|e| !e.is_empty()));
        assert!(!b.is_engine_running());
    }

    #[tokio::test]
    async fn commands_on_stopped_engine_fail_with_not_running() {
        let b = bridge();
        let cfg = AnimationConfig {
            image_path: "/tmp/x.png".into(),
            ..Default::default()
        };
        assert!(matches!(
            b.start_animation(&cfg).await,
            Err(BridgeError::NotRunning("startAnimation"))
        ));
        assert!(matches!(b.pause_animation().await, Err(BridgeError::NotRunning(_))));
        assert!(matches!(b.skip_to_final().await, Err(BridgeError::NotRunning(_))));
        assert!(matches!(
            b.load_image(Path::new("/tmp/x.png")).await,
            Err(BridgeError::NotRunning("loadImage"))
        ));
        assert!(matches!(
            b.set_watermark(None).await,
            Err(BridgeError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn missing_image_is_a_result_failure() {
        let b = bridge();
        b.start_engine().await;
        let r = b.load_image(Path::new("/nonexistent/x.png")).await.unwrap();
        assert!(!r.success);
        assert!(r.error.as_deref().is_some_and(|e| !e.is_empty()));

        let r = b.load_image(Path::new("")).await.unwrap();
        assert!(!r.success);
    }

    #[tokio::test]
    async fn loads_image_dimensions() {
        let b = bridge();
        b.start_engine().await;
        let f = png_file();
        let r = b.load_image(f.path()).await.unwrap();
        assert!(r.success);
        assert_eq!((r.width, r.height), (Some(320), Some(200)));
    }

    #[tokio::test]
    async fn malformed_inputs_are_rejected() {
        let b = bridge();
        b.start_engine().await;
        assert!(matches!(
            b.start_animation(&AnimationConfig::default()).await,
            Err(BridgeError::MalformedInput(_))
        ));
        assert!(matches!(
            b.update_engine_settings(&EngineSettings::default()).await,
            Err(BridgeError::MalformedInput(_))
        ));
        let bad = Envelope {
            id: "1".into(),
            kind: " ".into(),
            payload: serde_json::Value::Null,
        };
        assert!(matches!(
            b.send_message(&bad).await,
            Err(BridgeError::MalformedInput(_))
        ));
        assert!(matches!(
            b.broadcast_message(&bad).await,
            Err(BridgeError::MalformedInput(_))
        ));
    }

    #[tokio::test]
    async fn message_round_trip_through_engine() {
        let b = bridge();
        b.start_engine().await;
        let reply = b
            .send_message(&Envelope::new("ping", serde_json::json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(reply["pong"], true);
        b.broadcast_message(&Envelope::new("hello", serde_json::Value::Null))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stage_events_reach_subscribers() {
        let b = bridge();
        b.start_engine().await;
        let f = png_file();
        b.load_image(f.path()).await.unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::<Stage>::new()));
        let s = seen.clone();
        let sub = b.on_stage_change(move |stage| s.lock().push(*stage));
        b.start_animation(&AnimationConfig {
            image_path: f.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !seen.lock().contains(&Stage::FinalBreathing) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sub.unsubscribe();
        let seen = seen.lock().clone();
        assert_eq!(seen, Stage::ALL.to_vec());
        b.stop_animation().await.unwrap();
    }
}

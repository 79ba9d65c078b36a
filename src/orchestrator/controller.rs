//! Orchestration service.
//!
//! Owns the bridge and the store, gates user intents with capability
//! predicates, wraps every engine call in [`Orchestrator::safe_operation`],
//! and feeds engine events into the store. User intents never return bridge
//! errors: failures land in `AnimationState::error`.

use super::capabilities::Capabilities;
use super::config::OrchestratorConfig;
use super::health::HealthPoller;
use super::timeline::{self, ProgressReport, StageTimeline};
use crate::engine::{BridgeError, EngineBridge, Subscription};
use crate::model::{
    AnimationConfig, EngineSettings, ImageFormat, ImageInfo, Stage, StartupResult,
    WatermarkConfig,
};
use crate::store::{Action, AnimationState, Store};
use parking_lot::Mutex;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Orchestrator {
    bridge: Arc<EngineBridge>,
    store: Store,
    cfg: OrchestratorConfig,
    timeline: StageTimeline,
    health: HealthPoller,
    // User commands run one at a time, in the order they were issued, and
    // re-check their capability once they hold the lane.
    lane: tokio::sync::Mutex<()>,
    settings: Mutex<EngineSettings>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Orchestrator {
    pub fn new(bridge: Arc<EngineBridge>, cfg: OrchestratorConfig) -> Self {
        Self {
            bridge,
            store: Store::new(),
            timeline: StageTimeline::new(cfg.stage_durations),
            cfg,
            health: HealthPoller::default(),
            lane: tokio::sync::Mutex::new(()),
            settings: Mutex::new(EngineSettings::default()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Route engine events into the store. Calling it twice is harmless.
    pub fn init(&self) {
        let mut subs = self.subscriptions.lock();
        if !subs.is_empty() {
            return;
        }

        let store = self.store.clone();
        subs.push(self.bridge.on_stage_change(move |stage| {
            store.dispatch(Action::StageChanged { stage: *stage });
        }));

        let store = self.store.clone();
        subs.push(self.bridge.on_status_update(move |update| {
            if let Some(stage) = update.stage {
                // Nothing follows the terminal stage; an older stage here is a
                // status line that was in flight when the run was skipped.
                let moves = store.read(|s| {
                    s.current_stage != Some(stage)
                        && s.current_stage != Some(Stage::FinalBreathing)
                });
                if moves {
                    store.dispatch(Action::StageChanged { stage });
                }
            }
            let progress = match update.progress {
                Some(p) => Some(p),
                None if update.elapsed_time.is_some() => Some(store.read(|s| s.progress)),
                None => None,
            };
            if let Some(progress) = progress {
                store.dispatch(Action::ProgressUpdate {
                    progress,
                    elapsed_time: update.elapsed_time,
                });
            }
        }));

        let store = self.store.clone();
        subs.push(self.bridge.on_heartbeat(move |health| {
            store.dispatch(Action::EngineHealthUpdate {
                health: health.clone(),
            });
        }));

        let store = self.store.clone();
        subs.push(self.bridge.on_metrics_update(move |metrics| {
            store.dispatch(Action::MetricsUpdated {
                metrics: metrics.clone(),
            });
        }));

        let store = self.store.clone();
        subs.push(self.bridge.on_error(move |fault| {
            store.dispatch(Action::EngineError {
                fault: fault.clone(),
            });
        }));

        let store = self.store.clone();
        subs.push(self.bridge.on_engine_stopped(move |ev| {
            if !ev.requested {
                warn!(exit_code = ?ev.exit_code, "engine went away");
            }
            store.dispatch(Action::EngineStopped);
        }));
        debug!(count = subs.len(), "orchestrator subscribed to engine events");
    }

    /// Stop polling, stop the engine, and drop every event subscription.
    pub async fn shutdown(&self) {
        self.health.stop();
        if self.store.read(|s| s.is_animation_running) && self.bridge.is_engine_running() {
            if let Err(e) = self.bridge.stop_animation().await {
                debug!(error = %e, "stop animation during shutdown failed");
            }
        }
        self.bridge.stop_engine().await;
        if self.store.read(|s| s.is_engine_running) {
            self.store.dispatch(Action::EngineStopped);
        }
        for sub in self.subscriptions.lock().drain(..) {
            sub.unsubscribe();
        }
        info!("orchestrator shut down");
    }

    pub fn bridge(&self) -> &Arc<EngineBridge> {
        &self.bridge
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn snapshot(&self) -> AnimationState {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<AnimationState> {
        self.store.subscribe()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.store.read(Capabilities::of)
    }

    pub fn progress(&self) -> ProgressReport {
        self.store.read(|s| self.timeline.report(s))
    }

    pub fn is_at_stage(&self, stage: Stage) -> bool {
        self.store.read(|s| timeline::is_at_stage(s, stage))
    }

    pub fn has_reached_stage(&self, stage: Stage) -> bool {
        self.store.read(|s| timeline::has_reached_stage(s, stage))
    }

    pub fn stage_progress(&self, stage: Stage) -> f64 {
        self.store.read(|s| timeline::stage_progress(s, stage))
    }

    pub fn is_health_polling(&self) -> bool {
        self.health.is_active()
    }

    pub async fn start_engine(&self) -> StartupResult {
        let was_running = self.bridge.is_engine_running();
        self.store.dispatch(Action::EngineStartRequested);
        let result = self.bridge.start_engine().await;
        if result.success {
            self.store.dispatch(Action::EngineStarted {
                health: self.bridge.get_engine_health(),
            });
            self.health.start(
                self.bridge.clone(),
                self.store.clone(),
                self.cfg.health_poll_interval,
                self.cfg.heartbeat_timeout,
            );
            if !was_running {
                self.resync_content().await;
            }
        } else {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "engine failed to start".to_string());
            self.store.dispatch(Action::EngineStartFailed { error });
        }
        result
    }

    pub async fn stop_engine(&self) {
        self.health.stop();
        self.bridge.stop_engine().await;
        if self.store.read(|s| s.is_engine_running) {
            self.store.dispatch(Action::EngineStopped);
        }
    }

    pub async fn restart_engine(&self) -> StartupResult {
        self.stop_engine().await;
        self.start_engine().await
    }

    /// A freshly launched engine knows nothing; hand it the current image,
    /// watermark and settings again.
    async fn resync_content(&self) {
        let (image, watermark) = self
            .store
            .read(|s| (s.loaded_image.clone(), s.watermark_config.clone()));
        if let Some(image) = image {
            match self.bridge.load_image(&image.path).await {
                Ok(r) if r.success => debug!(path = %image.path.display(), "image re-sent to engine"),
                Ok(r) => warn!(error = ?r.error, "engine could not reload image"),
                Err(e) => warn!(error = %e, "engine could not reload image"),
            }
        }
        if let Some(w) = watermark {
            if let Err(e) = self.bridge.set_watermark(Some(&w)).await {
                warn!(error = %e, "engine could not restore watermark");
            }
        }
        let settings = self.settings.lock().clone();
        if !settings.is_empty() {
            if let Err(e) = self.bridge.update_engine_settings(&settings).await {
                warn!(error = %e, "engine could not restore settings");
            }
        }
    }

    pub async fn ensure_engine_running(&self) -> Result<(), BridgeError> {
        if self.bridge.is_engine_running() {
            return Ok(());
        }
        let result = self.start_engine().await;
        if result.success {
            Ok(())
        } else {
            Err(BridgeError::Transport(format!(
                "engine failed to start: {}",
                result.error.unwrap_or_default()
            )))
        }
    }

    /// Run `op` against a live engine.
    ///
    /// Starts the engine first if needed. If `op` fails in a way a restart
    /// could fix and auto-restart is on, the engine is restarted (best-effort)
    /// and the original error is still returned.
    pub async fn safe_operation<T, F, Fut>(&self, name: &'static str, op: F) -> Result<T, BridgeError>
    where
        F: FnOnce(Arc<EngineBridge>) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        self.ensure_engine_running().await?;
        match op(self.bridge.clone()).await {
            Ok(v) => Ok(v),
            Err(e) => {
                if self.cfg.auto_restart && e.is_recoverable() {
                    warn!(operation = name, code = e.code(), error = %e, "command failed, restarting engine");
                    let restarted = self.restart_engine().await;
                    if !restarted.success {
                        warn!(operation = name, error = ?restarted.error, "auto-restart failed");
                    }
                } else {
                    debug!(operation = name, error = %e, "command failed");
                }
                Err(e)
            }
        }
    }

    /// Start a run, or resume a paused one.
    pub async fn play(&self) -> bool {
        let _lane = self.lane.lock().await;
        self.play_locked().await
    }

    async fn play_locked(&self) -> bool {
        let caps = self.capabilities();
        if caps.can_resume {
            return self.resume_locked().await;
        }
        if !caps.can_start {
            debug!("play ignored: cannot start now");
            return false;
        }
        let Some(config) = self.store.read(|s| {
            s.loaded_image.as_ref().map(|image| AnimationConfig {
                image_path: image.path.clone(),
                settings: self.settings.lock().clone(),
                watermark: s.watermark_config.clone(),
            })
        }) else {
            return false;
        };

        self.store.dispatch(Action::AnimationStartRequested);
        let res = self
            .safe_operation("startAnimation", |b| async move {
                b.start_animation(&config).await
            })
            .await;
        match res {
            Ok(()) => {
                info!("animation started");
                self.store.dispatch(Action::AnimationStarted);
                true
            }
            Err(e) => {
                self.store.dispatch(Action::AnimationStartFailed {
                    error: e.to_string(),
                });
                false
            }
        }
    }

    pub async fn pause(&self) -> bool {
        let _lane = self.lane.lock().await;
        if !self.capabilities().can_pause {
            return false;
        }
        self.animation_command("pause", Action::AnimationPaused, |b| async move {
            b.pause_animation().await
        })
        .await
    }

    pub async fn resume(&self) -> bool {
        let _lane = self.lane.lock().await;
        self.resume_locked().await
    }

    async fn resume_locked(&self) -> bool {
        if !self.capabilities().can_resume {
            return false;
        }
        self.animation_command("resume", Action::AnimationResumed, |b| async move {
            b.resume_animation().await
        })
        .await
    }

    pub async fn stop(&self) -> bool {
        let _lane = self.lane.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> bool {
        if !self.capabilities().can_stop {
            return false;
        }
        self.animation_command("stopAnimation", Action::AnimationStopped, |b| async move {
            b.stop_animation().await
        })
        .await
    }

    /// Stop the current run (if any) and start a new one from the beginning.
    pub async fn restart(&self) -> bool {
        let _lane = self.lane.lock().await;
        if self.capabilities().can_stop && !self.stop_locked().await {
            return false;
        }
        self.play_locked().await
    }

    pub async fn skip_to_end(&self) -> bool {
        let _lane = self.lane.lock().await;
        if !self.capabilities().can_skip {
            return false;
        }
        self.animation_command("skipToFinal", Action::SkippedToFinal, |b| async move {
            b.skip_to_final().await
        })
        .await
    }

    async fn animation_command<F, Fut>(&self, name: &'static str, on_success: Action, op: F) -> bool
    where
        F: FnOnce(Arc<EngineBridge>) -> Fut,
        Fut: Future<Output = Result<(), BridgeError>>,
    {
        self.store.dispatch(Action::CommandStart);
        match self.safe_operation(name, op).await {
            Ok(()) => {
                debug!(command = name, "animation command done");
                self.store.dispatch(on_success);
                self.store.dispatch(Action::CommandComplete);
                true
            }
            Err(e) => {
                self.store.dispatch(Action::CommandFailed {
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Load a new source image into the engine.
    pub async fn change_image(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let _lane = self.lane.lock().await;
        self.store.dispatch(Action::ImageLoadRequested);
        let target = path.clone();
        let res = self
            .safe_operation("loadImage", |b| async move { b.load_image(&target).await })
            .await;
        match res {
            Ok(r) if r.success => {
                let image = describe_image(&path, r.width.unwrap_or(0), r.height.unwrap_or(0)).await;
                info!(
                    path = %image.path.display(),
                    width = image.width,
                    height = image.height,
                    "image loaded"
                );
                self.store.dispatch(Action::ImageLoaded { image });
                true
            }
            Ok(r) => {
                let error = r
                    .error
                    .unwrap_or_else(|| format!("could not load {}", path.display()));
                warn!(%error, "image load failed");
                self.store.dispatch(Action::ImageLoadFailed { error });
                false
            }
            Err(e) => {
                self.store.dispatch(Action::ImageLoadFailed {
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Set or clear the watermark.
    pub async fn change_watermark(&self, watermark: Option<WatermarkConfig>) -> bool {
        let _lane = self.lane.lock().await;
        self.store.dispatch(Action::CommandStart);
        if let Some(Err(error)) = watermark.as_ref().map(WatermarkConfig::validate) {
            self.store.dispatch(Action::CommandFailed { error });
            return false;
        }
        let wm = watermark.clone();
        let res = self
            .safe_operation("setWatermark", |b| async move {
                b.set_watermark(wm.as_ref()).await
            })
            .await;
        match res {
            Ok(()) => {
                self.store.dispatch(Action::WatermarkChanged { watermark });
                self.store.dispatch(Action::CommandComplete);
                true
            }
            Err(e) => {
                self.store.dispatch(Action::CommandFailed {
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Push a partial settings update to the engine.
    pub async fn update_settings(&self, update: EngineSettings) -> bool {
        let _lane = self.lane.lock().await;
        self.store.dispatch(Action::CommandStart);
        if let Err(error) = update.validate() {
            self.store.dispatch(Action::CommandFailed { error });
            return false;
        }
        let sent = update.clone();
        let res = self
            .safe_operation("updateSettings", |b| async move {
                b.update_engine_settings(&sent).await
            })
            .await;
        match res {
            Ok(()) => {
                self.settings.lock().merge(&update);
                self.store.dispatch(Action::CommandComplete);
                true
            }
            Err(e) => {
                self.store.dispatch(Action::CommandFailed {
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Dismiss the banner error only.
    pub fn dismiss_error(&self) {
        self.store.dispatch(Action::ClearError);
    }

    pub fn clear_all_errors(&self) {
        self.store.dispatch(Action::ClearError);
        self.store.dispatch(Action::ClearEngineErrors);
    }
}

async fn describe_image(path: &Path, width: u32, height: u32) -> ImageInfo {
    let size_bytes = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    let format = ImageFormat::from_path(path);
    ImageInfo {
        path: path.to_path_buf(),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        width,
        height,
        size_bytes,
        format,
        aspect_ratio: if height == 0 {
            0.0
        } else {
            f64::from(width) / f64::from(height)
        },
        has_transparency: format.supports_transparency(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        tests_support, EngineCommand, EngineReply, EngineTransport, EventHub, LaunchInfo,
        SimulatedEngine, SimulatedEngineConfig,
    };
    use crate::model::EngineEvent;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::model::{StageDurations, WatermarkPosition};
    use std::io::Write;
    use std::time::Duration;

    fn orchestrator_on(transport: Arc<dyn EngineTransport>, cfg: OrchestratorConfig) -> Orchestrator {
        let bridge = Arc::new(EngineBridge::new(transport, Duration::from_secs(5)));
        let orch = Orchestrator::new(bridge, cfg);
        orch.init();
        orch
    }

    fn orchestrator_with(sim: SimulatedEngineConfig, auto_restart: bool) -> (Orchestrator, Arc<SimulatedEngine>) {
        let engine = Arc::new(SimulatedEngine::new(sim));
        let cfg = OrchestratorConfig {
            auto_restart,
            health_poll_interval: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        };
        (orchestrator_on(engine.clone(), cfg), engine)
    }

    fn orchestrator() -> (Orchestrator, Arc<SimulatedEngine>) {
        orchestrator_with(SimulatedEngineConfig::instant(), true)
    }

    /// Simulator whose stages are long enough that a run never finishes mid-test.
    fn slow_stages() -> SimulatedEngineConfig {
        SimulatedEngineConfig {
            stage_durations: StageDurations::uniform(Duration::from_secs(60)),
            ..SimulatedEngineConfig::instant()
        }
    }

    fn png_file() -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        f.write_all(&tests_support::png_header(640, 320)).unwrap();
        f
    }

    async fn wait_for(orch: &Orchestrator, pred: impl Fn(&AnimationState) -> bool) -> bool {
        let mut rx = orch.subscribe();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if pred(&rx.borrow_and_update()) {
                return true;
            }
            if tokio::time::Instant::now() > deadline {
                return false;
            }
            let _ = tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
        }
    }

    #[tokio::test]
    async fn cold_start_updates_state() {
        let (orch, _) = orchestrator();
        let s = orch.snapshot();
        assert!(!s.is_engine_running);
        assert_eq!(s.current_stage, None);
        assert_eq!(s.progress, 0.0);

        let r = orch.start_engine().await;
        assert!(r.success);
        let s = orch.snapshot();
        assert!(s.is_engine_running);
        assert!(!s.is_starting_engine);
        assert!(s.engine_health.is_some());
        assert!(orch.is_health_polling());
        orch.shutdown().await;
        assert!(!orch.snapshot().is_engine_running);
        assert!(!orch.is_health_polling());
    }

    #[tokio::test]
    async fn startup_failure_lands_in_error() {
        let sim = SimulatedEngineConfig {
            fail_launch: true,
            ..SimulatedEngineConfig::instant()
        };
        let (orch, _) = orchestrator_with(sim, true);
        let r = orch.start_engine().await;
        assert!(!r.success);
        let s = orch.snapshot();
        assert!(!s.is_engine_running);
        assert!(!s.is_starting_engine);
        assert!(s.error.is_some());
    }

    #[tokio::test]
    async fn wrapper_starts_engine_before_command() {
        let (orch, _) = orchestrator();
        let f = png_file();
        let path = f.path().to_path_buf();
        assert!(!orch.bridge().is_engine_running());

        // Directly on the bridge the command is refused.
        let cfg = AnimationConfig {
            image_path: path.clone(),
            ..Default::default()
        };
        assert!(matches!(
            orch.bridge().start_animation(&cfg).await,
            Err(BridgeError::NotRunning(_))
        ));

        // Through the wrapper the engine comes up and the command succeeds.
        let loaded = orch
            .safe_operation("loadImage", |b| async move { b.load_image(&path).await })
            .await
            .unwrap();
        assert!(loaded.success);
        orch.safe_operation("startAnimation", |b| async move { b.start_animation(&cfg).await })
            .await
            .unwrap();
        assert!(orch.snapshot().is_engine_running);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn recoverable_failure_triggers_restart_and_returns_original_error() {
        let (orch, engine) = orchestrator();
        orch.start_engine().await;
        let first_pid = orch.bridge().start_engine().await.process_id;

        // The engine dies between the liveness check and the command.
        let err = orch
            .safe_operation("pause", |b| {
                let engine = engine.clone();
                async move {
                    engine.crash(137);
                    b.pause_animation().await
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotRunning("pause")));
        assert!(orch.bridge().is_engine_running());
        assert!(orch.snapshot().is_engine_running);
        let second_pid = orch.bridge().start_engine().await.process_id;
        assert!(second_pid.is_some());
        assert!(first_pid.is_some());
        orch.shutdown().await;
    }

    /// Simulator that only comes up on its first launch.
    struct OneShotEngine {
        inner: SimulatedEngine,
        launches: AtomicUsize,
    }

    impl EngineTransport for OneShotEngine {
        fn launch(&self, hub: Arc<EventHub>) -> BoxFuture<'_, anyhow::Result<LaunchInfo>> {
            async move {
                if self.launches.fetch_add(1, Ordering::SeqCst) > 0 {
                    anyhow::bail!("engine binary went missing");
                }
                self.inner.launch(hub).await
            }
            .boxed()
        }

        fn shutdown(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            self.inner.shutdown()
        }

        fn request(&self, command: EngineCommand) -> BoxFuture<'_, Result<EngineReply, BridgeError>> {
            self.inner.request(command)
        }

        fn describe(&self) -> String {
            "one-shot simulated engine".into()
        }
    }

    #[tokio::test]
    async fn failed_auto_restart_still_returns_original_error() {
        let engine = Arc::new(OneShotEngine {
            inner: SimulatedEngine::new(SimulatedEngineConfig::instant()),
            launches: AtomicUsize::new(0),
        });
        let orch = orchestrator_on(engine.clone(), OrchestratorConfig::default());
        assert!(orch.start_engine().await.success);

        let err = orch
            .safe_operation("pause", |b| {
                let engine = engine.clone();
                async move {
                    engine.inner.crash(137);
                    b.pause_animation().await
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotRunning("pause")));
        assert_eq!(engine.launches.load(Ordering::SeqCst), 2);
        assert!(!orch.bridge().is_engine_running());
        let s = orch.snapshot();
        assert!(!s.is_engine_running);
        assert!(!s.is_starting_engine);
        assert!(s.error.is_some());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn recoverable_failure_without_auto_restart_leaves_engine_down() {
        let (orch, engine) = orchestrator_with(SimulatedEngineConfig::instant(), false);
        orch.start_engine().await;
        let starts = Arc::new(AtomicUsize::new(0));
        let n = starts.clone();
        let sub = orch.bridge().on_engine_started(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        let err = orch
            .safe_operation("pause", |b| {
                let engine = engine.clone();
                async move {
                    engine.crash(137);
                    b.pause_animation().await
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotRunning("pause")));
        assert!(!orch.bridge().is_engine_running());
        assert!(!orch.snapshot().is_engine_running);
        assert_eq!(starts.load(Ordering::SeqCst), 0);
        sub.unsubscribe();
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeats_refresh_health_between_polls() {
        let engine = Arc::new(SimulatedEngine::new(SimulatedEngineConfig::instant()));
        let cfg = OrchestratorConfig {
            health_poll_interval: Duration::from_secs(60),
            ..OrchestratorConfig::default()
        };
        let orch = orchestrator_on(engine, cfg);
        orch.start_engine().await;
        let first = orch.snapshot().engine_health.unwrap().last_heartbeat;
        assert!(
            wait_for(&orch, |s| s
                .engine_health
                .as_ref()
                .is_some_and(|h| h.last_heartbeat > first))
            .await
        );
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_input_is_not_restarted() {
        let (orch, _) = orchestrator();
        orch.start_engine().await;
        let stops = Arc::new(AtomicUsize::new(0));
        let s = stops.clone();
        let sub = orch.bridge().on_engine_stopped(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let err = orch
            .safe_operation("updateSettings", |b| async move {
                b.update_engine_settings(&EngineSettings::default()).await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MalformedInput(_)));
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        sub.unsubscribe();
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_image_surfaces_as_state_error() {
        let (orch, _) = orchestrator();
        orch.start_engine().await;
        assert!(!orch.change_image("/nonexistent/x.png").await);
        let s = orch.snapshot();
        assert!(s.error.as_deref().is_some_and(|e| !e.is_empty()));
        assert!(s.loaded_image.is_none());
        assert!(!s.is_loading_image);
        assert!(!orch.capabilities().can_start);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn change_image_describes_file() {
        let (orch, _) = orchestrator();
        orch.start_engine().await;
        let f = png_file();
        assert!(orch.change_image(f.path()).await);
        let image = orch.snapshot().loaded_image.unwrap();
        assert_eq!((image.width, image.height), (640, 320));
        assert_eq!(image.format, ImageFormat::Png);
        assert!(image.has_transparency);
        assert_eq!(image.aspect_ratio, 2.0);
        assert!(image.size_bytes > 0);
        assert!(orch.capabilities().can_start);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn full_run_reaches_final_breathing() {
        let (orch, _) = orchestrator();
        orch.start_engine().await;
        let f = png_file();
        orch.change_image(f.path()).await;
        assert!(orch.play().await);
        assert!(wait_for(&orch, |s| s.current_stage == Some(Stage::FinalBreathing)).await);
        assert!(orch.has_reached_stage(Stage::Formation));
        assert_eq!(orch.stage_progress(Stage::Chaos), 1.0);
        assert!(!orch.capabilities().can_skip);
        assert_eq!(orch.progress().estimated_remaining, None);
        assert!(wait_for(&orch, |s| s.metrics.is_some()).await);

        assert!(orch.stop().await);
        let s = orch.snapshot();
        assert!(!s.is_animation_running);
        assert_eq!(s.current_stage, None);
        assert_eq!(s.progress, 0.0);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn pause_resume_and_guards() {
        let (orch, _) = orchestrator_with(slow_stages(), true);
        orch.start_engine().await;
        let f = png_file();
        orch.change_image(f.path()).await;

        assert!(!orch.pause().await, "nothing to pause yet");
        assert!(orch.play().await);
        assert!(!orch.play().await, "already running");
        assert!(orch.pause().await);
        assert!(orch.snapshot().is_paused);
        assert!(!orch.pause().await);
        assert!(orch.play().await, "play resumes a paused run");
        let s = orch.snapshot();
        assert!(s.is_animation_running && !s.is_paused);
        assert!(orch.stop().await);
        assert!(!orch.stop().await);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn skip_from_formation_lands_in_final() {
        let (orch, _) = orchestrator_with(slow_stages(), true);
        orch.start_engine().await;
        let f = png_file();
        orch.change_image(f.path()).await;
        assert!(orch.play().await);
        orch.store().dispatch(Action::StageChanged {
            stage: Stage::Formation,
        });
        assert!(orch.capabilities().can_skip);

        assert!(orch.skip_to_end().await);
        assert_eq!(orch.snapshot().current_stage, Some(Stage::FinalBreathing));
        assert!(!orch.capabilities().can_skip);
        assert!(!orch.skip_to_end().await);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn late_status_after_skip_keeps_final_stage() {
        let (orch, _) = orchestrator_with(slow_stages(), true);
        orch.start_engine().await;
        let f = png_file();
        orch.change_image(f.path()).await;
        assert!(orch.play().await);
        assert!(orch.skip_to_end().await);

        orch.bridge().hub().publish(EngineEvent::StatusUpdate {
            stage: Some(Stage::Chaos),
            progress: Some(0.5),
            elapsed_time: Some(10),
        });
        let s = orch.snapshot();
        assert_eq!(s.current_stage, Some(Stage::FinalBreathing));
        assert!(orch.has_reached_stage(Stage::Formation));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn stop_issued_after_start_wins() {
        let sim = SimulatedEngineConfig {
            command_latency: Duration::from_millis(30),
            ..slow_stages()
        };
        let (orch, _) = orchestrator_with(sim, true);
        orch.start_engine().await;
        let f = png_file();
        orch.change_image(f.path()).await;

        let orch = Arc::new(orch);
        let o1 = orch.clone();
        let start = tokio::spawn(async move { o1.play().await });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stopped = orch.stop().await;
        let started = start.await.unwrap();
        assert!(started);
        assert!(stopped, "stop runs after the start it followed");
        assert!(!orch.snapshot().is_animation_running);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn restart_begins_a_fresh_run() {
        let (orch, _) = orchestrator_with(slow_stages(), true);
        orch.start_engine().await;
        let f = png_file();
        orch.change_image(f.path()).await;
        assert!(orch.play().await);
        orch.store().dispatch(Action::StageChanged { stage: Stage::Chaos });
        assert!(orch.restart().await);
        let s = orch.snapshot();
        assert!(s.is_animation_running);
        assert_ne!(s.current_stage, Some(Stage::Chaos));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn restart_is_not_interleaved_with_a_queued_stop() {
        let sim = SimulatedEngineConfig {
            command_latency: Duration::from_millis(20),
            ..slow_stages()
        };
        let (orch, _) = orchestrator_with(sim, true);
        orch.start_engine().await;
        let f = png_file();
        orch.change_image(f.path()).await;
        assert!(orch.play().await);

        let orch = Arc::new(orch);
        let o1 = orch.clone();
        let restart = tokio::spawn(async move { o1.restart().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stopped = orch.stop().await;
        assert!(restart.await.unwrap(), "restart runs stop and play back to back");
        assert!(stopped, "the queued stop ends the restarted run");
        assert!(!orch.snapshot().is_animation_running);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn engine_faults_go_to_the_log() {
        let (orch, engine) = orchestrator();
        orch.start_engine().await;
        for n in 0..15 {
            engine.inject_fault(&format!("F{n}"), "particle buffer overflow");
        }
        let s = orch.snapshot();
        assert_eq!(s.engine_errors.len(), 10);
        assert_eq!(s.engine_errors[0].code, "F14");
        assert!(s.error.is_none());
        orch.clear_all_errors();
        assert!(orch.snapshot().engine_errors.is_empty());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn watermark_and_settings_commands() {
        let (orch, _) = orchestrator();
        orch.start_engine().await;
        let logo = png_file();
        let wm = WatermarkConfig {
            enabled: true,
            path: logo.path().to_path_buf(),
            position: WatermarkPosition::TopRight,
            opacity: 0.8,
            scale: 0.25,
        };
        assert!(orch.change_watermark(Some(wm.clone())).await);
        let s = orch.snapshot();
        assert_eq!(s.watermark_config, Some(wm.clone()));
        assert!(!s.is_processing_command);

        let bad = WatermarkConfig {
            opacity: 3.0,
            ..wm.clone()
        };
        assert!(!orch.change_watermark(Some(bad)).await);
        let s = orch.snapshot();
        assert!(s.error.is_some());
        assert_eq!(s.watermark_config, Some(wm));
        orch.dismiss_error();

        assert!(orch.change_watermark(None).await);
        assert!(orch.snapshot().watermark_config.is_none());

        assert!(
            orch.update_settings(EngineSettings {
                speed: Some(2.0),
                ..Default::default()
            })
            .await
        );
        assert!(
            !orch
                .update_settings(EngineSettings {
                    speed: Some(-1.0),
                    ..Default::default()
                })
                .await
        );
        assert!(orch.snapshot().error.is_some());
        orch.dismiss_error();

        assert!(
            !orch
                .update_settings(EngineSettings {
                    speed: Some(1e-300),
                    ..Default::default()
                })
                .await
        );
        assert!(orch.snapshot().error.is_some());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn missing_watermark_file_is_streamed_fault() {
        let (orch, _) = orchestrator();
        orch.start_engine().await;
        let wm = WatermarkConfig {
            enabled: true,
            path: "/nonexistent/logo.png".into(),
            position: WatermarkPosition::default(),
            opacity: 0.5,
            scale: 0.1,
        };
        assert!(orch.change_watermark(Some(wm)).await);
        let s = orch.snapshot();
        assert_eq!(s.engine_errors.front().map(|f| f.code.as_str()), Some("WATERMARK_NOT_FOUND"));
        assert!(s.error.is_none());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn crash_clears_engine_scope_but_keeps_content() {
        let (orch, engine) = orchestrator_with(slow_stages(), true);
        orch.start_engine().await;
        let f = png_file();
        orch.change_image(f.path()).await;
        orch.play().await;
        engine.crash(1);
        let s = orch.snapshot();
        assert!(!s.is_engine_running);
        assert!(!s.is_animation_running);
        assert!(s.loaded_image.is_some());
        assert!(wait_for(&orch, |_| !orch.is_health_polling()).await);

        // Next play brings the engine back and re-sends the image.
        let r = orch.start_engine().await;
        assert!(r.success);
        assert!(orch.play().await);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_unsubscribes() {
        let (orch, _) = orchestrator();
        assert_eq!(orch.bridge().hub().stage.subscriber_count(), 1);
        orch.init();
        assert_eq!(orch.bridge().hub().stage.subscriber_count(), 1);
        orch.shutdown().await;
        assert_eq!(orch.bridge().hub().stage.subscriber_count(), 0);
        assert_eq!(orch.bridge().hub().stopped.subscriber_count(), 0);
    }
}

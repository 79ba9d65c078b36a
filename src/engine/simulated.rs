//! In-process stand-in for the animation engine.
//!
//! Answers the same commands as a real engine, with configurable round-trip
//! latency, and drives the six stages on its own clock while publishing
//! status, stage, metrics and heartbeat events.

use super::error::BridgeError;
use super::events::EventHub;
use super::protocol::{EngineCommand, EngineReply};
use super::transport::{EngineTransport, LaunchInfo};
use crate::model::{
    now_millis, AnimationConfig, EngineEvent, EngineFault, EngineSettings, Metrics, Stage,
    StageDurations, SPEED_RANGE,
};
use anyhow::{bail, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::debug;

/// How many header bytes are read to sniff image dimensions.
const HEADER_PROBE_BYTES: u64 = 64 * 1024;
const DEFAULT_PARTICLE_COUNT: u64 = 12_000;
const DEFAULT_TARGET_FPS: u32 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulatedEngineConfig {
    #[serde(with = "humantime_serde")]
    pub startup_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub command_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub image_load_latency: Duration,
    /// Interval between status updates while animating.
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    pub stage_durations: StageDurations,
    pub version: String,
    /// Make every launch fail; exercises the startup-failure path.
    pub fail_launch: bool,
}

impl Default for SimulatedEngineConfig {
    fn default() -> Self {
        Self {
            startup_latency: Duration::from_millis(800),
            command_latency: Duration::from_millis(50),
            image_load_latency: Duration::from_millis(300),
            tick: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(1),
            stage_durations: StageDurations::default(),
            version: format!("sim-{}", env!("CARGO_PKG_VERSION")),
            fail_launch: false,
        }
    }
}

impl SimulatedEngineConfig {
    /// Near-zero latencies and millisecond stages.
    pub fn instant() -> Self {
        Self {
            startup_latency: Duration::ZERO,
            command_latency: Duration::ZERO,
            image_load_latency: Duration::ZERO,
            tick: Duration::from_millis(1),
            heartbeat_interval: Duration::from_millis(20),
            stage_durations: StageDurations::uniform(Duration::from_millis(5)),
            ..Self::default()
        }
    }
}

/// Flags shared between the command handler and a running stage driver.
struct RunHandle {
    paused: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    skip: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl RunHandle {
    fn cancel(self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.task.abort();
    }
}

#[derive(Default)]
struct EngineState {
    hub: Option<Arc<EventHub>>,
    image: Option<(u32, u32)>,
    settings: EngineSettings,
    run: Option<RunHandle>,
    heartbeat: Option<JoinHandle<()>>,
    process_id: Option<u32>,
}

pub struct SimulatedEngine {
    cfg: SimulatedEngineConfig,
    state: Arc<Mutex<EngineState>>,
}

impl SimulatedEngine {
    pub fn new(cfg: SimulatedEngineConfig) -> Self {
        Self {
            cfg,
            state: Arc::new(Mutex::new(EngineState::default())),
        }
    }

    /// Publish a fault as if the engine had reported it.
    pub fn inject_fault(&self, code: &str, message: &str) {
        let hub = self.state.lock().hub.clone();
        if let Some(hub) = hub {
            hub.publish(EngineEvent::Error(EngineFault {
                code: code.to_string(),
                message: message.to_string(),
                details: None,
                timestamp: now_millis(),
            }));
        }
    }

    /// Simulate the engine process dying without being asked to.
    pub fn crash(&self, code: i32) {
        let hub = self.teardown();
        if let Some(hub) = hub {
            hub.publish(EngineEvent::Exited { code: Some(code) });
        }
    }

    fn teardown(&self) -> Option<Arc<EventHub>> {
        let mut st = self.state.lock();
        if let Some(run) = st.run.take() {
            run.cancel();
        }
        if let Some(hb) = st.heartbeat.take() {
            hb.abort();
        }
        st.image = None;
        st.process_id = None;
        st.hub.take()
    }

    async fn do_launch(&self, hub: Arc<EventHub>) -> Result<LaunchInfo> {
        tokio::time::sleep(self.cfg.startup_latency).await;
        if self.cfg.fail_launch {
            bail!("engine failed to initialise its renderer (simulated)");
        }
        self.teardown();

        let pid = rand::thread_rng().gen_range(1_000..60_000);
        let heartbeat = tokio::spawn(heartbeat_loop(hub.clone(), self.cfg.heartbeat_interval));
        let mut st = self.state.lock();
        st.hub = Some(hub);
        st.heartbeat = Some(heartbeat);
        st.process_id = Some(pid);
        st.settings = EngineSettings::default();
        Ok(LaunchInfo {
            process_id: Some(pid),
            version: Some(self.cfg.version.clone()),
        })
    }

    async fn handle(&self, command: EngineCommand) -> Result<EngineReply, BridgeError> {
        let hub = match self.state.lock().hub.clone() {
            Some(hub) => hub,
            None => {
                return Err(BridgeError::Transport(
                    "simulated engine is not launched".into(),
                ))
            }
        };
        let latency = match &command {
            EngineCommand::LoadImage { .. } => self.cfg.image_load_latency,
            _ => self.cfg.command_latency,
        };
        tokio::time::sleep(latency).await;
        debug!(command = command.name(), "simulated engine handling command");

        let reply = match command {
            EngineCommand::Hello => EngineReply::Hello {
                version: self.cfg.version.clone(),
            },
            EngineCommand::Shutdown => {
                self.teardown();
                EngineReply::Ack
            }
            EngineCommand::LoadImage { path } => match probe_image(&path).await {
                Ok((w, h)) => {
                    self.state.lock().image = Some((w, h));
                    EngineReply::ImageLoaded {
                        width: w,
                        height: h,
                    }
                }
                Err(error) => EngineReply::Failed { error },
            },
            EngineCommand::StartAnimation { config } => self.start_run(hub, &config),
            EngineCommand::Pause => self.with_run(|run| run.paused.store(true, Ordering::Relaxed)),
            EngineCommand::Resume => {
                self.with_run(|run| run.paused.store(false, Ordering::Relaxed))
            }
            EngineCommand::StopAnimation => {
                if let Some(run) = self.state.lock().run.take() {
                    run.cancel();
                }
                EngineReply::Ack
            }
            EngineCommand::SkipToFinal => self.with_run(|run| run.skip.store(true, Ordering::Relaxed)),
            EngineCommand::UpdateSettings { settings } => {
                let mut st = self.state.lock();
                let mut next = st.settings.clone();
                next.merge(&settings);
                match next.validate() {
                    Ok(()) => {
                        st.settings = next;
                        EngineReply::Ack
                    }
                    Err(error) => EngineReply::Failed { error },
                }
            }
            EngineCommand::SetWatermark { watermark } => {
                if let Some(w) = watermark.filter(|w| w.enabled) {
                    if !matches!(tokio::fs::try_exists(&w.path).await, Ok(true)) {
                        hub.publish(EngineEvent::Error(EngineFault {
                            code: "WATERMARK_NOT_FOUND".into(),
                            message: format!("watermark image not found: {}", w.path.display()),
                            details: None,
                            timestamp: now_millis(),
                        }));
                    }
                }
                EngineReply::Ack
            }
            EngineCommand::Message { envelope } => {
                let payload = if envelope.kind == "ping" {
                    serde_json::json!({ "pong": true, "id": envelope.id })
                } else {
                    serde_json::json!({ "echo": envelope.payload, "id": envelope.id })
                };
                EngineReply::Message { payload }
            }
            EngineCommand::Broadcast { .. } => EngineReply::Ack,
        };
        Ok(reply)
    }

    fn with_run(&self, f: impl FnOnce(&RunHandle)) -> EngineReply {
        match self.state.lock().run.as_ref() {
            Some(run) if !run.task.is_finished() => {
                f(run);
                EngineReply::Ack
            }
            _ => EngineReply::Failed {
                error: "no animation is running".into(),
            },
        }
    }

    fn start_run(&self, hub: Arc<EventHub>, config: &AnimationConfig) -> EngineReply {
        let mut st = self.state.lock();
        if st.image.is_none() {
            return EngineReply::Failed {
                error: "no image loaded".into(),
            };
        }
        let mut settings = st.settings.clone();
        settings.merge(&config.settings);
        if let Err(error) = settings.validate() {
            return EngineReply::Failed { error };
        }
        st.settings = settings.clone();
        if let Some(old) = st.run.take() {
            old.cancel();
        }

        let paused = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));
        let skip = Arc::new(AtomicBool::new(false));
        let params = DriveParams {
            hub,
            durations: self.cfg.stage_durations,
            tick: self.cfg.tick,
            settings,
            paused: paused.clone(),
            cancel: cancel.clone(),
            skip: skip.clone(),
        };
        let task = tokio::spawn(drive_stages(params));
        st.run = Some(RunHandle {
            paused,
            cancel,
            skip,
            task,
        });
        EngineReply::Ack
    }
}

impl EngineTransport for SimulatedEngine {
    fn launch(&self, hub: Arc<EventHub>) -> BoxFuture<'_, Result<LaunchInfo>> {
        self.do_launch(hub).boxed()
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            tokio::time::sleep(self.cfg.command_latency).await;
            self.teardown();
            Ok(())
        }
        .boxed()
    }

    fn request(&self, command: EngineCommand) -> BoxFuture<'_, Result<EngineReply, BridgeError>> {
        self.handle(command).boxed()
    }

    fn describe(&self) -> String {
        format!("simulated engine {}", self.cfg.version)
    }
}

async fn heartbeat_loop(hub: Arc<EventHub>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        hub.publish(EngineEvent::Heartbeat {
            memory_usage: Some(jitter(180.0, 20.0)),
            cpu_usage: Some(jitter(35.0, 10.0)),
            timestamp: now_millis(),
        });
    }
}

struct DriveParams {
    hub: Arc<EventHub>,
    durations: StageDurations,
    tick: Duration,
    settings: EngineSettings,
    paused: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    skip: Arc<AtomicBool>,
}

/// Returns false once the run was cancelled.
async fn wait_if_paused(paused: &AtomicBool, cancel: &AtomicBool) -> bool {
    while paused.load(Ordering::Relaxed) && !cancel.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    !cancel.load(Ordering::Relaxed)
}

async fn drive_stages(p: DriveParams) {
    let speed = p
        .settings
        .speed
        .filter(|s| SPEED_RANGE.contains(s))
        .unwrap_or(1.0);
    let particles = p.settings.particle_count.unwrap_or(DEFAULT_PARTICLE_COUNT);
    let target_fps = f64::from(p.settings.target_fps.unwrap_or(DEFAULT_TARGET_FPS));
    let tick_ms = p.tick.as_millis().max(1) as u64;
    // Roughly two metrics samples per second of animation.
    let metrics_every = (500 / tick_ms).max(1);
    let mut elapsed_ms = 0u64;
    let mut ticks = 0u64;

    'stages: for stage in Stage::ALL.iter().copied().filter(|s| !s.is_terminal()) {
        p.hub.publish(EngineEvent::StageChange { stage });
        let nominal = p
            .durations
            .get(stage)
            .unwrap_or_default()
            .div_f64(speed)
            .as_millis()
            .max(1) as u64;
        let mut in_stage = 0u64;
        while in_stage < nominal {
            if !wait_if_paused(&p.paused, &p.cancel).await {
                return;
            }
            tokio::time::sleep(p.tick).await;
            // Checked after the sleep so no stale status follows a skip.
            if p.skip.load(Ordering::Relaxed) {
                break 'stages;
            }
            in_stage += tick_ms;
            elapsed_ms += tick_ms;
            ticks += 1;
            p.hub.publish(EngineEvent::StatusUpdate {
                stage: Some(stage),
                progress: Some((in_stage as f64 / nominal as f64).min(1.0)),
                elapsed_time: Some(elapsed_ms),
            });
            if ticks % metrics_every == 0 {
                p.hub.publish(EngineEvent::MetricsUpdate(sample_metrics(
                    stage, particles, target_fps,
                )));
            }
        }
    }

    p.hub.publish(EngineEvent::StageChange {
        stage: Stage::FinalBreathing,
    });
    loop {
        if !wait_if_paused(&p.paused, &p.cancel).await {
            return;
        }
        tokio::time::sleep(p.tick).await;
        elapsed_ms += tick_ms;
        ticks += 1;
        if ticks % metrics_every == 0 {
            p.hub.publish(EngineEvent::StatusUpdate {
                stage: Some(Stage::FinalBreathing),
                progress: None,
                elapsed_time: Some(elapsed_ms),
            });
            p.hub.publish(EngineEvent::MetricsUpdate(sample_metrics(
                Stage::FinalBreathing,
                particles,
                target_fps,
            )));
        }
    }
}

fn jitter(center: f64, spread: f64) -> f64 {
    center + rand::thread_rng().gen_range(-spread..=spread)
}

fn sample_metrics(stage: Stage, particles: u64, target_fps: f64) -> Metrics {
    let formed = stage.index() as f64 / (Stage::ALL.len() - 1) as f64;
    Metrics {
        fps: jitter(target_fps - 2.0, 2.0).max(1.0),
        particle_count: particles,
        memory_usage: jitter(160.0 + particles as f64 / 1_000.0, 5.0),
        recognition_accuracy: (stage.index() >= Stage::Converging.index())
            .then(|| (0.6 + 0.4 * formed).min(1.0)),
    }
}

async fn probe_image(path: &Path) -> Result<(u32, u32), String> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    let mut header = Vec::new();
    file.take(HEADER_PROBE_BYTES)
        .read_to_end(&mut header)
        .await
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    image_dimensions(&header)
        .filter(|(w, h)| *w > 0 && *h > 0)
        .ok_or_else(|| format!("unsupported or corrupt image: {}", path.display()))
}

/// Read pixel dimensions from a PNG, GIF, BMP, JPEG or WebP (VP8X) header.
pub(crate) fn image_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    let be16 = |i: usize| Some(u16::from_be_bytes([*b.get(i)?, *b.get(i + 1)?]) as u32);
    let le16 = |i: usize| Some(u16::from_le_bytes([*b.get(i)?, *b.get(i + 1)?]) as u32);
    let be32 = |i: usize| Some(u32::from_be_bytes(b.get(i..i + 4)?.try_into().ok()?));
    let le32 = |i: usize| Some(i32::from_le_bytes(b.get(i..i + 4)?.try_into().ok()?));
    let le24 = |i: usize| {
        let s = b.get(i..i + 3)?;
        Some(u32::from(s[0]) | u32::from(s[1]) << 8 | u32::from(s[2]) << 16)
    };

    if b.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some((be32(16)?, be32(20)?));
    }
    if b.starts_with(b"GIF87a") || b.starts_with(b"GIF89a") {
        return Some((le16(6)?, le16(8)?));
    }
    if b.starts_with(b"BM") {
        return Some((le32(18)?.unsigned_abs(), le32(22)?.unsigned_abs()));
    }
    if b.len() > 30 && &b[0..4] == b"RIFF" && &b[8..16] == b"WEBPVP8X" {
        return Some((le24(24)? + 1, le24(27)? + 1));
    }
    if b.starts_with(&[0xFF, 0xD8]) {
        let mut i = 2;
        while i + 9 < b.len() {
            if b[i] != 0xFF {
                i += 1;
                continue;
            }
            let marker = b[i + 1];
            let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
            if is_sof {
                return Some((be16(i + 7)?, be16(i + 5)?));
            }
            i += 2 + be16(i + 2)? as usize;
        }
    }
    None
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_png_and_gif() {
        assert_eq!(
            image_dimensions(&tests_support::png_header(800, 600)),
            Some((800, 600))
        );
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[0x40, 0x01, 0xF0, 0x00]);
        assert_eq!(image_dimensions(&gif), Some((320, 240)));
    }

    #[test]
    fn sniffs_jpeg_sof() {
        let mut jpg = vec![0xFF, 0xD8];
        // APP0 segment of length 16
        jpg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        jpg.extend_from_slice(&[0u8; 14]);
        // SOF0: len, precision, height 480, width 640
        jpg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08, 0x01, 0xE0, 0x02, 0x80]);
        jpg.extend_from_slice(&[0u8; 12]);
        assert_eq!(image_dimensions(&jpg), Some((640, 480)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(image_dimensions(b"hello world"), None);
        assert_eq!(image_dimensions(b"\x89PNG\r\n\x1a\n"), None);
    }

    #[test]
    fn metrics_report_accuracy_only_once_converging() {
        assert!(sample_metrics(Stage::Burst, 100, 60.0)
            .recognition_accuracy
            .is_none());
        let m = sample_metrics(Stage::FinalBreathing, 100, 60.0);
        assert_eq!(m.recognition_accuracy, Some(1.0));
        assert_eq!(m.particle_count, 100);
    }

    #[tokio::test]
    async fn requests_before_launch_are_transport_errors() {
        let engine = SimulatedEngine::new(SimulatedEngineConfig::instant());
        let err = engine.request(EngineCommand::Pause).await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
    }

    #[tokio::test]
    async fn pause_without_run_is_refused() {
        let engine = SimulatedEngine::new(SimulatedEngineConfig::instant());
        let hub = Arc::new(EventHub::new(Duration::from_secs(5)));
        engine.launch(hub).await.unwrap();
        let reply = engine.request(EngineCommand::Pause).await.unwrap();
        assert!(matches!(reply, EngineReply::Failed { .. }));
        let reply = engine
            .request(EngineCommand::StartAnimation {
                config: AnimationConfig {
                    image_path: "/tmp/none.png".into(),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            EngineReply::Failed {
                error: "no image loaded".into()
            }
        );
    }
}

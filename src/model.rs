use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Current wall-clock time as Unix epoch milliseconds.
pub fn now_millis() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}

/// Phases of a single animation run, in the order the engine walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    PreStart,
    Burst,
    Chaos,
    Converging,
    Formation,
    FinalBreathing,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::PreStart,
        Stage::Burst,
        Stage::Chaos,
        Stage::Converging,
        Stage::Formation,
        Stage::FinalBreathing,
    ];

    pub fn index(self) -> usize {
        match self {
            Stage::PreStart => 0,
            Stage::Burst => 1,
            Stage::Chaos => 2,
            Stage::Converging => 3,
            Stage::Formation => 4,
            Stage::FinalBreathing => 5,
        }
    }

    /// `FinalBreathing` has no nominal end; it lasts until an explicit stop.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::FinalBreathing)
    }

    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::PreStart => "PRE_START",
            Stage::Burst => "BURST",
            Stage::Chaos => "CHAOS",
            Stage::Converging => "CONVERGING",
            Stage::Formation => "FORMATION",
            Stage::FinalBreathing => "FINAL_BREATHING",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nominal length of every stage that has one. Used for estimates and by the
/// simulated engine; a real engine decides its own boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDurations {
    #[serde(with = "humantime_serde")]
    pub pre_start: Duration,
    #[serde(with = "humantime_serde")]
    pub burst: Duration,
    #[serde(with = "humantime_serde")]
    pub chaos: Duration,
    #[serde(with = "humantime_serde")]
    pub converging: Duration,
    #[serde(with = "humantime_serde")]
    pub formation: Duration,
}

impl Default for StageDurations {
    fn default() -> Self {
        Self {
            pre_start: Duration::from_secs(2),
            burst: Duration::from_secs(3),
            chaos: Duration::from_secs(5),
            converging: Duration::from_secs(6),
            formation: Duration::from_secs(4),
        }
    }
}

impl StageDurations {
    /// `None` for the terminal stage.
    pub fn get(&self, stage: Stage) -> Option<Duration> {
        match stage {
            Stage::PreStart => Some(self.pre_start),
            Stage::Burst => Some(self.burst),
            Stage::Chaos => Some(self.chaos),
            Stage::Converging => Some(self.converging),
            Stage::Formation => Some(self.formation),
            Stage::FinalBreathing => None,
        }
    }

    /// Every stage set to the same length; handy for fast runs.
    pub fn uniform(d: Duration) -> Self {
        Self {
            pre_start: d,
            burst: d,
            chaos: d,
            converging: d,
            formation: d,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub is_responding: bool,
    /// Epoch millis of the last confirmed heartbeat.
    pub last_heartbeat: u64,
    #[serde(default)]
    pub memory_usage: Option<f64>,
    #[serde(default)]
    pub cpu_usage: Option<f64>,
}

impl EngineHealth {
    /// A heartbeat older than `window` means the engine is implicitly not responding.
    pub fn is_fresh(&self, now: u64, window: Duration) -> bool {
        self.is_responding && now.saturating_sub(self.last_heartbeat) <= window.as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
    Unknown,
}

impl ImageFormat {
    pub fn from_path(path: &std::path::Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("png") => ImageFormat::Png,
            Some("jpg") | Some("jpeg") => ImageFormat::Jpeg,
            Some("gif") => ImageFormat::Gif,
            Some("webp") => ImageFormat::Webp,
            Some("bmp") => ImageFormat::Bmp,
            _ => ImageFormat::Unknown,
        }
    }

    /// Whether the container format can carry an alpha channel.
    pub fn supports_transparency(self) -> bool {
        matches!(self, ImageFormat::Png | ImageFormat::Gif | ImageFormat::Webp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub path: PathBuf,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub format: ImageFormat,
    pub aspect_ratio: f64,
    pub has_transparency: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
    Center,
}

impl std::str::FromStr for WatermarkPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top-left" => Ok(Self::TopLeft),
            "top-right" => Ok(Self::TopRight),
            "bottom-left" => Ok(Self::BottomLeft),
            "bottom-right" => Ok(Self::BottomRight),
            "center" => Ok(Self::Center),
            other => Err(format!("unknown watermark position: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkConfig {
    pub enabled: bool,
    pub path: PathBuf,
    #[serde(default)]
    pub position: WatermarkPosition,
    /// 0.0 (invisible) ..= 1.0 (opaque)
    pub opacity: f64,
    pub scale: f64,
}

impl WatermarkConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.path.as_os_str().is_empty() {
            return Err("watermark is enabled but has no image path".into());
        }
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(format!("watermark opacity {} is outside 0..=1", self.opacity));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(format!("watermark scale {} must be positive", self.scale));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub fps: f64,
    pub particle_count: u64,
    pub memory_usage: f64,
    #[serde(default)]
    pub recognition_accuracy: Option<f64>,
}

/// A fault streamed by the engine while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineFault {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    pub timestamp: u64,
}

/// Partial settings update; fields left as `None` keep the engine's current value.
/// Playback speed multipliers the engine accepts.
pub const SPEED_RANGE: std::ops::RangeInclusive<f64> = 0.01..=100.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub particle_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub particle_size: Option<f64>,
    /// Playback speed multiplier; 2.0 runs every stage twice as fast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_fps: Option<u32>,
}

impl EngineSettings {
    pub fn is_empty(&self) -> bool {
        self.particle_count.is_none()
            && self.particle_size.is_none()
            && self.speed.is_none()
            && self.background_color.is_none()
            && self.target_fps.is_none()
    }

    /// Overlay every field `update` sets onto `self`.
    pub fn merge(&mut self, update: &EngineSettings) {
        if let Some(v) = update.particle_count {
            self.particle_count = Some(v);
        }
        if let Some(v) = update.particle_size {
            self.particle_size = Some(v);
        }
        if let Some(v) = update.speed {
            self.speed = Some(v);
        }
        if let Some(v) = update.background_color.as_ref() {
            self.background_color = Some(v.clone());
        }
        if let Some(v) = update.target_fps {
            self.target_fps = Some(v);
        }
    }

    /// Reject values no engine could honour.
    pub fn validate(&self) -> Result<(), String> {
        if matches!(self.speed, Some(s) if !SPEED_RANGE.contains(&s)) {
            return Err(format!(
                "speed must be between {} and {}",
                SPEED_RANGE.start(),
                SPEED_RANGE.end()
            ));
        }
        if self.particle_count == Some(0) {
            return Err("particle count must be at least 1".into());
        }
        if matches!(self.particle_size, Some(s) if !(s.is_finite() && s > 0.0)) {
            return Err("particle size must be a positive number".into());
        }
        if self.target_fps == Some(0) {
            return Err("target fps must be at least 1".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimationConfig {
    pub image_path: PathBuf,
    #[serde(default)]
    pub settings: EngineSettings,
    #[serde(default)]
    pub watermark: Option<WatermarkConfig>,
}

impl AnimationConfig {
    pub fn is_empty(&self) -> bool {
        self.image_path.as_os_str().is_empty()
    }
}

/// Generic message envelope for the free-form engine channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: gen_message_id(),
            kind: kind.into(),
            payload,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        !self.id.trim().is_empty() && !self.kind.trim().is_empty()
    }
}

/// Generate a random id for an outbound envelope.
fn gen_message_id() -> String {
    use rand::RngCore;
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupResult {
    pub success: bool,
    pub process_id: Option<u32>,
    pub version: Option<String>,
    pub error: Option<String>,
    #[serde(with = "humantime_serde")]
    pub startup_time: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadImageResult {
    pub success: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub error: Option<String>,
}

impl LoadImageResult {
    pub fn loaded(width: u32, height: u32) -> Self {
        Self {
            success: true,
            width: Some(width),
            height: Some(height),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            width: None,
            height: None,
            error: Some(error.into()),
        }
    }
}

/// Events pushed by the engine without a preceding request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        #[serde(default)]
        stage: Option<Stage>,
        #[serde(default)]
        progress: Option<f64>,
        /// Milliseconds since the run started.
        #[serde(default)]
        elapsed_time: Option<u64>,
    },
    StageChange {
        stage: Stage,
    },
    MetricsUpdate(Metrics),
    Error(EngineFault),
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        #[serde(default)]
        memory_usage: Option<f64>,
        #[serde(default)]
        cpu_usage: Option<f64>,
        timestamp: u64,
    },
    Exited {
        #[serde(default)]
        code: Option<i32>,
    },
    #[serde(other)]
    Unknown,
}

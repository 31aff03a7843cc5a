use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Daemon configuration: defaults, then an optional TOML file, then `OFFICEWATCH_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_fps: u32,
    /// Frames discarded after opening the camera (exposure settling).
    pub warmup_frames: usize,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Encoding gallery artifact written by the trainer.
    pub gallery_path: PathBuf,
    /// SQLite attendance database.
    pub db_path: PathBuf,
    /// Maximum embedding distance accepted as a match.
    pub tolerance: f32,
    /// Entry debounce and absence-exit window.
    pub cooldown: Duration,
    /// Sleep between monitoring ticks.
    pub tick_interval: Duration,
    /// Start monitoring as soon as the daemon is up.
    pub autostart: bool,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

/// Config file shape. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    capture_width: Option<u32>,
    capture_height: Option<u32>,
    capture_fps: Option<u32>,
    warmup_frames: Option<usize>,
    model_dir: Option<PathBuf>,
    gallery_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    tolerance: Option<f32>,
    cooldown_secs: Option<u64>,
    tick_interval_ms: Option<u64>,
    autostart: Option<bool>,
    system_bus: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            capture_fps: 30,
            warmup_frames: 4,
            model_dir: officewatch_core::default_model_dir(),
            gallery_path: data_dir.join("gallery.json"),
            db_path: data_dir.join("attendance.db"),
            tolerance: officewatch_core::DEFAULT_TOLERANCE,
            cooldown: officewatch_core::DEFAULT_COOLDOWN,
            tick_interval: Duration::from_millis(30),
            autostart: false,
            system_bus: false,
        }
    }
}

impl Config {
    /// Load configuration from the config file (if any) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let explicit = std::env::var("OFFICEWATCH_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(|| config_dir().join("config.toml"));
        if explicit.is_some() || path.exists() {
            config.apply_file(&path)?;
            tracing::info!(path = %path.display(), "loaded config file");
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        self.apply_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_toml(&mut self, text: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;
        macro_rules! take {
            ($($field:ident),*) => { $( if let Some(v) = file.$field { self.$field = v; } )* };
        }
        take!(
            camera_device,
            capture_width,
            capture_height,
            capture_fps,
            warmup_frames,
            model_dir,
            gallery_path,
            db_path,
            tolerance,
            autostart,
            system_bus
        );
        if let Some(secs) = file.cooldown_secs {
            self.cooldown = Duration::from_secs(secs);
        }
        if let Some(ms) = file.tick_interval_ms {
            self.tick_interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("OFFICEWATCH_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Ok(v) = std::env::var("OFFICEWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("OFFICEWATCH_GALLERY_PATH") {
            self.gallery_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("OFFICEWATCH_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        self.capture_width = env_parse("OFFICEWATCH_CAPTURE_WIDTH", self.capture_width);
        self.capture_height = env_parse("OFFICEWATCH_CAPTURE_HEIGHT", self.capture_height);
        self.capture_fps = env_parse("OFFICEWATCH_CAPTURE_FPS", self.capture_fps);
        self.warmup_frames = env_parse("OFFICEWATCH_WARMUP_FRAMES", self.warmup_frames);
        self.tolerance = env_parse("OFFICEWATCH_TOLERANCE", self.tolerance);
        self.cooldown = Duration::from_secs(env_parse(
            "OFFICEWATCH_COOLDOWN_SECS",
            self.cooldown.as_secs(),
        ));
        self.tick_interval = Duration::from_millis(env_parse(
            "OFFICEWATCH_TICK_INTERVAL_MS",
            self.tick_interval.as_millis() as u64,
        ));
        self.autostart = env_flag("OFFICEWATCH_AUTOSTART", self.autostart);
        self.system_bus = env_flag("OFFICEWATCH_SYSTEM_BUS", self.system_bus);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tolerance must be a positive number, got {}",
                self.tolerance
            )));
        }
        if self.cooldown.is_zero() {
            return Err(ConfigError::Invalid("cooldown must be non-zero".into()));
        }
        if self.capture_width == 0 || self.capture_height == 0 {
            return Err(ConfigError::Invalid(format!(
                "capture size {}x{} is empty",
                self.capture_width, self.capture_height
            )));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn capture(&self) -> officewatch_hw::CaptureConfig {
        officewatch_hw::CaptureConfig {
            device_path: self.camera_device.clone(),
            width: self.capture_width,
            height: self.capture_height,
            fps: self.capture_fps,
            warmup_frames: self.warmup_frames,
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("officewatch")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("officewatch")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
        .unwrap_or(default)
}

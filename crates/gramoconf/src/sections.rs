//! The raw TOML sections, with their defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration file contents.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecordingConfig {
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub logs: LogsConfig,

    /// Global backend defaults, plus the allow-all escape hatch.
    #[serde(default)]
    pub backend: BackendDefaults,

    /// One section per configured origin server.
    #[serde(default)]
    pub backends: HashMap<String, BackendSection>,

    /// Global signaling defaults.
    #[serde(default)]
    pub signaling: SignalingDefaults,

    /// One section per configured signaling endpoint.
    #[serde(default)]
    pub signalings: HashMap<String, SignalingSection>,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub recorder: RecorderConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address and port to listen on for control requests.
    #[serde(default = "HttpConfig::default_listen")]
    pub listen: String,

    /// Addresses or CIDR networks allowed to supply a forwarded client
    /// address. Empty means no proxy is trusted.
    #[serde(default)]
    pub trustedproxies: Vec<String>,
}

impl HttpConfig {
    fn default_listen() -> String {
        "127.0.0.1:8000".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            trustedproxies: Vec::new(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    /// Log filter, `tracing_subscriber::EnvFilter` syntax.
    #[serde(default = "LogsConfig::default_level")]
    pub level: String,
}

impl LogsConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// Global defaults applied to every backend unless overridden per section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDefaults {
    /// Accept requests from any origin, authenticated with the shared
    /// `secret` below. Never enable outside development setups.
    #[serde(default)]
    pub allowall: bool,

    /// Shared secret for `allowall` mode.
    #[serde(default)]
    pub secret: Option<String>,

    /// Maximum allowed control request body size in bytes.
    #[serde(default = "BackendDefaults::default_maxmessagesize")]
    pub maxmessagesize: u64,

    /// Width of the virtual display and the recording.
    #[serde(default = "BackendDefaults::default_videowidth")]
    pub videowidth: u32,

    /// Height of the virtual display and the recording.
    #[serde(default = "BackendDefaults::default_videoheight")]
    pub videoheight: u32,

    /// Spool directory holding recordings until they are uploaded.
    #[serde(default = "BackendDefaults::default_directory")]
    pub directory: PathBuf,

    /// Skip TLS certificate verification when talking to the backend.
    #[serde(default)]
    pub skipverify: bool,
}

impl BackendDefaults {
    fn default_maxmessagesize() -> u64 {
        1024
    }

    fn default_videowidth() -> u32 {
        1920
    }

    fn default_videoheight() -> u32 {
        1080
    }

    fn default_directory() -> PathBuf {
        PathBuf::from("/tmp")
    }
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            allowall: false,
            secret: None,
            maxmessagesize: Self::default_maxmessagesize(),
            videowidth: Self::default_videowidth(),
            videoheight: Self::default_videoheight(),
            directory: Self::default_directory(),
            skipverify: false,
        }
    }
}

/// One configured origin server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    pub url: String,
    pub secret: Option<String>,
    pub maxmessagesize: Option<u64>,
    pub videowidth: Option<u32>,
    pub videoheight: Option<u32>,
    pub directory: Option<PathBuf>,
    pub skipverify: Option<bool>,
}

/// Global signaling defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignalingDefaults {
    /// Default internal secret shared with signaling endpoints.
    #[serde(default)]
    pub internalsecret: Option<String>,
}

/// One configured signaling endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingSection {
    pub url: String,
    /// Endpoint-specific secret, overrides the global default.
    pub internalsecret: Option<String>,
}

/// Browser and WebDriver settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrowserConfig {
    /// Explicit path to the WebDriver executable. When unset the driver is
    /// discovered on `$PATH`.
    #[serde(default)]
    pub driver: Option<PathBuf>,
}

/// Encoder profile: the recorder command line, split into the pieces that
/// get recombined per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Recorder executable.
    #[serde(default = "RecorderConfig::default_binary")]
    pub binary: String,

    /// Arguments placed before any input.
    #[serde(default = "RecorderConfig::default_common")]
    pub common: Vec<String>,

    /// Audio output codec arguments.
    #[serde(default = "RecorderConfig::default_outputaudio")]
    pub outputaudio: Vec<String>,

    /// Video output codec arguments.
    #[serde(default = "RecorderConfig::default_outputvideo")]
    pub outputvideo: Vec<String>,

    /// Artifact extension for audio-only recordings.
    #[serde(default = "RecorderConfig::default_extensionaudio")]
    pub extensionaudio: String,

    /// Artifact extension for audio and video recordings.
    #[serde(default = "RecorderConfig::default_extensionvideo")]
    pub extensionvideo: String,
}

impl RecorderConfig {
    fn default_binary() -> String {
        "ffmpeg".to_string()
    }

    fn default_common() -> Vec<String> {
        ["-loglevel", "level+warning", "-n"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn default_outputaudio() -> Vec<String> {
        ["-c:a", "libopus"].iter().map(|s| s.to_string()).collect()
    }

    fn default_outputvideo() -> Vec<String> {
        ["-c:v", "libvpx", "-quality:v", "realtime"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn default_extensionaudio() -> String {
        ".ogg".to_string()
    }

    fn default_extensionvideo() -> String {
        ".webm".to_string()
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            binary: Self::default_binary(),
            common: Self::default_common(),
            outputaudio: Self::default_outputaudio(),
            outputvideo: Self::default_outputvideo(),
            extensionaudio: Self::default_extensionaudio(),
            extensionvideo: Self::default_extensionvideo(),
        }
    }
}

/// Per-operation timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Bound on the whole start sequence, request to healthy pipeline.
    #[serde(default = "TimeoutsConfig::default_start")]
    pub start: u64,

    /// Bound on draining the capture pipeline on stop.
    #[serde(default = "TimeoutsConfig::default_stop")]
    pub stop: u64,

    /// Bound on the artifact upload.
    #[serde(default = "TimeoutsConfig::default_upload")]
    pub upload: u64,
}

impl TimeoutsConfig {
    fn default_start() -> u64 {
        60
    }

    fn default_stop() -> u64 {
        30
    }

    fn default_upload() -> u64 {
        300
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            start: Self::default_start(),
            stop: Self::default_stop(),
            upload: Self::default_upload(),
        }
    }
}

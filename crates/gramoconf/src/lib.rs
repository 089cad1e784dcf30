//! Configuration loading for the gramophone recording server.
//!
//! The configuration file is TOML. Global defaults live in the `[backend]`
//! and `[signaling]` sections; individual origin servers and signaling
//! endpoints are declared as named sub-sections and matched against request
//! URLs at runtime:
//!
//! ```toml
//! [http]
//! listen = "127.0.0.1:8000"
//! trustedproxies = ["10.0.0.0/8"]
//!
//! [backend]
//! videowidth = 1920
//! videoheight = 1080
//! directory = "/var/spool/gramophone"
//!
//! [backends.cloud]
//! url = "https://cloud.example.com"
//! secret = "the-shared-secret"
//!
//! [signaling]
//! internalsecret = "the-default-internal-secret"
//!
//! [signalings.hpb]
//! url = "https://hpb.example.com"
//! ```
//!
//! Loading produces an immutable [`Registry`] snapshot that is built once at
//! startup and passed explicitly to the components that need lookups. Nothing
//! in here changes for the lifetime of the process.

pub mod loader;
pub mod sections;

pub use loader::{discover_config_file, load_from_file};
pub use sections::{
    BackendDefaults, BackendSection, BrowserConfig, HttpConfig, LogsConfig, RecorderConfig,
    RecordingConfig, SignalingDefaults, SignalingSection, TimeoutsConfig,
};

use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Section names that backend and signaling ids may not reuse.
pub const RESERVED_SECTION_NAMES: &[&str] = &[
    "http",
    "logs",
    "backend",
    "backends",
    "signaling",
    "signalings",
    "browser",
    "recorder",
    "timeouts",
];

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("section name {0:?} is reserved")]
    ReservedSection(String),

    #[error("duplicate url {url} in sections {first:?} and {second:?}")]
    DuplicateUrl {
        url: String,
        first: String,
        second: String,
    },
}

/// A backend section resolved against the global defaults.
///
/// This is what the rest of the server works with; every field is concrete.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBackend {
    pub id: String,
    /// Normalized url, no trailing slash.
    pub url: String,
    pub secret: String,
    pub max_message_size: u64,
    pub video_width: u32,
    pub video_height: u32,
    pub directory: PathBuf,
    pub skip_verify: bool,
}

/// A signaling endpoint section resolved against the global defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSignaling {
    pub id: String,
    pub url: String,
    pub internal_secret: String,
}

/// Immutable lookup snapshot built from a [`RecordingConfig`] at startup.
#[derive(Debug, Clone)]
pub struct Registry {
    backends_by_url: HashMap<String, ResolvedBackend>,
    signalings_by_url: HashMap<String, ResolvedSignaling>,
    defaults: BackendDefaults,
    allow_all: bool,
    /// Ids of sections that were declared but could not be used.
    pub skipped_sections: Vec<String>,
}

fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

impl Registry {
    /// Build the registry, validating section names and url uniqueness.
    pub fn build(config: &RecordingConfig) -> Result<Self, ConfigError> {
        let mut backends_by_url = HashMap::new();
        let mut signalings_by_url = HashMap::new();
        let mut skipped_sections = Vec::new();

        for (id, section) in &config.backends {
            if RESERVED_SECTION_NAMES.contains(&id.as_str()) {
                return Err(ConfigError::ReservedSection(id.clone()));
            }

            // A backend without its own secret cannot authenticate anything.
            let Some(secret) = section.secret.clone() else {
                skipped_sections.push(id.clone());
                continue;
            };

            let url = normalize_url(&section.url);
            let resolved = ResolvedBackend {
                id: id.clone(),
                url: url.clone(),
                secret,
                max_message_size: section
                    .maxmessagesize
                    .unwrap_or(config.backend.maxmessagesize),
                video_width: section.videowidth.unwrap_or(config.backend.videowidth),
                video_height: section.videoheight.unwrap_or(config.backend.videoheight),
                directory: section
                    .directory
                    .clone()
                    .unwrap_or_else(|| config.backend.directory.clone()),
                skip_verify: section.skipverify.unwrap_or(config.backend.skipverify),
            };

            if let Some(previous) = backends_by_url.insert(url.clone(), resolved) {
                return Err(ConfigError::DuplicateUrl {
                    url,
                    first: previous.id,
                    second: id.clone(),
                });
            }
        }

        for (id, section) in &config.signalings {
            if RESERVED_SECTION_NAMES.contains(&id.as_str()) {
                return Err(ConfigError::ReservedSection(id.clone()));
            }

            let Some(secret) = section
                .internalsecret
                .clone()
                .or_else(|| config.signaling.internalsecret.clone())
            else {
                skipped_sections.push(id.clone());
                continue;
            };

            let url = normalize_url(&section.url);
            let resolved = ResolvedSignaling {
                id: id.clone(),
                url: url.clone(),
                internal_secret: secret,
            };

            if let Some(previous) = signalings_by_url.insert(url.clone(), resolved) {
                return Err(ConfigError::DuplicateUrl {
                    url,
                    first: previous.id,
                    second: id.clone(),
                });
            }
        }

        Ok(Self {
            backends_by_url,
            signalings_by_url,
            defaults: config.backend.clone(),
            allow_all: config.backend.allowall && config.backend.secret.is_some(),
            skipped_sections,
        })
    }

    /// Whether the allow-all escape hatch is active. Non-production use only.
    pub fn allow_all(&self) -> bool {
        self.allow_all
    }

    /// Look up the backend configured for the given origin url.
    ///
    /// With `allowall` enabled any url resolves to a synthetic backend built
    /// from the global defaults and the shared secret.
    pub fn backend_for_url(&self, url: &str) -> Option<ResolvedBackend> {
        let url = normalize_url(url);

        if let Some(backend) = self.backends_by_url.get(&url) {
            return Some(backend.clone());
        }

        if self.allow_all {
            let secret = self.defaults.secret.clone()?;
            return Some(ResolvedBackend {
                id: "allowall".to_string(),
                url,
                secret,
                max_message_size: self.defaults.maxmessagesize,
                video_width: self.defaults.videowidth,
                video_height: self.defaults.videoheight,
                directory: self.defaults.directory.clone(),
                skip_verify: self.defaults.skipverify,
            });
        }

        None
    }

    /// Look up the internal secret for the given signaling endpoint url.
    ///
    /// An endpoint-specific secret overrides the global default.
    pub fn signaling_for_url(&self, url: &str) -> Option<ResolvedSignaling> {
        self.signalings_by_url.get(&normalize_url(url)).cloned()
    }

    /// Number of configured backends.
    pub fn backend_count(&self) -> usize {
        self.backends_by_url.len()
    }

    /// All configured backends, for startup logging.
    pub fn backends(&self) -> impl Iterator<Item = &ResolvedBackend> {
        self.backends_by_url.values()
    }
}

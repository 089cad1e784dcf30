//! The capture side of a recording session.
//!
//! Four supervised external processes make up one recording unit: a virtual
//! display, an audio sink, a browser joined to the call inside that display,
//! and an encoder consuming the display and sink outputs. Each supervisor
//! owns the lifecycle of its process class; the pipeline composes them in
//! dependency order and guarantees that everything acquired is released
//! again, on success and on every failure path.

pub mod audio;
pub mod browser;
pub mod display;
pub mod encoder;
pub mod pipeline;

pub use display::{DisplayAllocator, DisplaysExhausted};
pub use pipeline::{CapturePipeline, CapturePipelineFactory};

use anyhow::Result;
use async_trait::async_trait;
use gramoconf::ResolvedBackend;
use std::path::PathBuf;
use std::time::Duration;

/// Whether a session records audio and video or audio alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingStatus {
    AudioAndVideo,
    AudioOnly,
}

impl RecordingStatus {
    /// The wire encoding used by control requests: 1 audio+video, 2 audio.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::AudioAndVideo),
            2 => Some(Self::AudioOnly),
            _ => None,
        }
    }
}

/// Everything a recording unit needs to know about its session.
#[derive(Debug, Clone)]
pub struct RecordingSpec {
    pub token: String,
    pub backend: ResolvedBackend,
    pub status: RecordingStatus,
    /// Url the browser opens to join the call.
    pub join_url: String,
}

/// The finished media file, with its measured duration.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureArtifact {
    pub path: PathBuf,
    pub duration: Duration,
}

/// How the encoder process ended when it exited on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderCrash {
    pub description: String,
}

/// One recording unit, from pipeline bring-up to artifact.
///
/// `CapturePipeline` is the production implementation; the session state
/// machine only ever talks to this trait so it can be exercised with a stub.
#[async_trait]
pub trait RecordingUnit: Send {
    /// Bring up the pipeline and join the call. Returns once every process
    /// is healthy and the encoder is writing.
    async fn start(&mut self) -> Result<()>;

    /// Resolves when the encoder process exits without having been asked to
    /// stop. Only valid between a successful `start` and `stop`.
    async fn crashed(&mut self) -> EncoderCrash;

    /// Stop the pipeline in reverse order. Returns the artifact when the
    /// encoder shut down cleanly and produced a non-empty file.
    async fn stop(&mut self) -> Result<CaptureArtifact>;

    /// Release anything still held. Safe to call at any point, any number
    /// of times.
    async fn release(&mut self);
}

/// Creates recording units; one per session.
pub trait RecordingUnitFactory: Send + Sync {
    fn create(&self, spec: RecordingSpec) -> Box<dyn RecordingUnit>;
}

/// Reduce a backend url to the alphanumeric characters usable in sink names
/// and spool directory paths.
pub fn sanitize_backend(url: &str) -> String {
    url.chars().filter(|c| c.is_alphanumeric()).collect()
}

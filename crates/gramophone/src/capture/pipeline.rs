//! Composition of the four supervisors into one recording unit.
//!
//! Startup order is display, audio sink, browser, encoder; teardown runs in
//! reverse. Whatever was acquired before a failure is released again, so a
//! long-running deployment can run many sequential sessions without leaking
//! display numbers, sink modules or temp profiles.

use super::audio::{AudioHandle, AudioSupervisor};
use super::browser::{BrowserHandle, BrowserSupervisor};
use super::display::{DisplayAllocator, DisplayHandle, DisplaySupervisor};
use super::encoder::{exited_cleanly, EncoderHandle, EncoderSupervisor};
use super::{
    sanitize_backend, CaptureArtifact, EncoderCrash, RecordingSpec, RecordingUnit,
    RecordingUnitFactory,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use gramoconf::{BrowserConfig, RecorderConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Geckodriver ports are derived from the display number so concurrent
/// sessions never collide.
const DRIVER_PORT_BASE: u16 = 20000;

/// Builds a [`CapturePipeline`] per session.
pub struct CapturePipelineFactory {
    allocator: Arc<DisplayAllocator>,
    browser: BrowserConfig,
    recorder: RecorderConfig,
    encoder_drain: Duration,
}

impl CapturePipelineFactory {
    pub fn new(
        allocator: Arc<DisplayAllocator>,
        browser: BrowserConfig,
        recorder: RecorderConfig,
        encoder_drain: Duration,
    ) -> Self {
        Self {
            allocator,
            browser,
            recorder,
            encoder_drain,
        }
    }
}

impl RecordingUnitFactory for CapturePipelineFactory {
    fn create(&self, spec: RecordingSpec) -> Box<dyn RecordingUnit> {
        Box::new(CapturePipeline {
            display_supervisor: DisplaySupervisor::new(self.allocator.clone()),
            audio_supervisor: AudioSupervisor,
            browser_supervisor: BrowserSupervisor::new(&self.browser),
            encoder_supervisor: EncoderSupervisor::new(self.recorder.clone()),
            encoder_drain: self.encoder_drain,
            spec,
            display: None,
            audio: None,
            browser: None,
            encoder: None,
            started_at: None,
        })
    }
}

/// The production recording unit.
pub struct CapturePipeline {
    display_supervisor: DisplaySupervisor,
    audio_supervisor: AudioSupervisor,
    browser_supervisor: BrowserSupervisor,
    encoder_supervisor: EncoderSupervisor,
    encoder_drain: Duration,
    spec: RecordingSpec,
    display: Option<DisplayHandle>,
    audio: Option<AudioHandle>,
    browser: Option<BrowserHandle>,
    encoder: Option<EncoderHandle>,
    started_at: Option<Instant>,
}

impl CapturePipeline {
    fn spool_directory(&self) -> PathBuf {
        self.spec
            .backend
            .directory
            .join(sanitize_backend(&self.spec.backend.url))
            .join(&self.spec.token)
    }

    async fn bring_up(&mut self) -> Result<()> {
        let width = self.spec.backend.video_width;
        let height = self.spec.backend.video_height;
        let token = &self.spec.token;

        tracing::debug!(session.token = %token, "starting display");
        let display = self.display_supervisor.start(width, height).await?;
        let display_id = display.display_id();
        let driver_port = DRIVER_PORT_BASE + (display.number() % 10000) as u16;
        self.display = Some(display);

        tracing::debug!(session.token = %token, "starting audio sink");
        let audio = self
            .audio_supervisor
            .start(&sanitize_backend(&self.spec.backend.url), token)
            .await?;
        let sink_name = audio.sink_name().to_string();
        let audio_source = audio.source_name();
        self.audio = Some(audio);

        tracing::debug!(session.token = %token, "starting browser, joining call");
        let browser = self
            .browser_supervisor
            .start(
                &display_id,
                &sink_name,
                width,
                height,
                driver_port,
                &self.spec.join_url,
            )
            .await?;
        self.browser = Some(browser);

        let directory = self.spool_directory();
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("failed to create spool directory {}", directory.display()))?;
        let extensionless =
            directory.join(format!("recording-{}", chrono::Local::now().format("%Y%m%d-%H%M%S")));

        tracing::debug!(session.token = %token, "starting recorder");
        let encoder = self
            .encoder_supervisor
            .start(
                token,
                self.spec.status,
                &display_id,
                &audio_source,
                width,
                height,
                &extensionless,
            )
            .await?;
        self.encoder = Some(encoder);

        if !self.all_healthy().await {
            bail!("capture pipeline did not come up healthy");
        }

        self.started_at = Some(Instant::now());
        Ok(())
    }

    async fn all_healthy(&mut self) -> bool {
        let display = self.display.as_mut().is_some_and(|d| d.is_healthy());
        let audio = match &self.audio {
            Some(audio) => audio.is_healthy().await,
            None => false,
        };
        let browser = match &self.browser {
            Some(browser) => browser.is_healthy().await,
            None => false,
        };
        let encoder = self.encoder.as_mut().is_some_and(|e| e.is_healthy());

        display && audio && browser && encoder
    }
}

#[async_trait]
impl RecordingUnit for CapturePipeline {
    async fn start(&mut self) -> Result<()> {
        match self.bring_up().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.release().await;
                Err(e)
            }
        }
    }

    async fn crashed(&mut self) -> EncoderCrash {
        let Some(encoder) = self.encoder.as_mut() else {
            return EncoderCrash {
                description: "encoder not running".to_string(),
            };
        };

        let description = match encoder.wait().await {
            Some(status) => format!("recorder ended unexpectedly: {status}"),
            None => "recorder ended unexpectedly".to_string(),
        };
        EncoderCrash { description }
    }

    async fn stop(&mut self) -> Result<CaptureArtifact> {
        let Some(mut encoder) = self.encoder.take() else {
            self.release().await;
            bail!("no encoder running");
        };

        let output = encoder.output().to_path_buf();
        let result = encoder.terminate(self.encoder_drain).await;
        self.release().await;

        let status = result?;
        if !exited_cleanly(status) {
            bail!("recorder ended unexpectedly: {status}");
        }

        let size = std::fs::metadata(&output)
            .with_context(|| format!("recording {} does not exist", output.display()))?
            .len();
        if size == 0 {
            bail!("recording {} is empty", output.display());
        }

        let duration = self
            .started_at
            .map(|started| started.elapsed())
            .unwrap_or_default();

        Ok(CaptureArtifact {
            path: output,
            duration,
        })
    }

    async fn release(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            encoder.kill().await;
        }
        if let Some(mut browser) = self.browser.take() {
            browser.stop().await;
        }
        if let Some(mut audio) = self.audio.take() {
            audio.stop().await;
        }
        if let Some(mut display) = self.display.take() {
            display.stop().await;
        }
    }
}

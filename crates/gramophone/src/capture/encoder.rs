//! Encoder supervision.
//!
//! The encoder command line is assembled from the configured encoder profile
//! plus the session specifics: pulse input from the session's sink monitor,
//! x11grab input from the session's display (omitted for audio-only), output
//! codec arguments and extension by recording status.

use super::RecordingStatus;
use anyhow::{Context, Result};
use gramoconf::RecorderConfig;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Output file extension for the given recording status.
pub fn output_extension(config: &RecorderConfig, status: RecordingStatus) -> &str {
    match status {
        RecordingStatus::AudioAndVideo => &config.extensionvideo,
        RecordingStatus::AudioOnly => &config.extensionaudio,
    }
}

/// Assemble the full recorder argument list. The output file is the last
/// argument.
pub fn recorder_arguments(
    config: &RecorderConfig,
    status: RecordingStatus,
    display_id: &str,
    audio_source: &str,
    width: u32,
    height: u32,
    extensionless_output: &Path,
) -> Vec<String> {
    let mut arguments = config.common.clone();

    arguments.extend(["-f", "pulse", "-i"].iter().map(|s| s.to_string()));
    arguments.push(audio_source.to_string());

    if status == RecordingStatus::AudioAndVideo {
        arguments.extend(["-f", "x11grab", "-draw_mouse", "0", "-video_size"]
            .iter()
            .map(|s| s.to_string()));
        arguments.push(format!("{width}x{height}"));
        arguments.push("-i".to_string());
        arguments.push(display_id.to_string());
    }

    arguments.extend(config.outputaudio.iter().cloned());

    if status == RecordingStatus::AudioAndVideo {
        arguments.extend(config.outputvideo.iter().cloned());
    }

    let mut output = extensionless_output.as_os_str().to_owned();
    output.push(output_extension(config, status));
    arguments.push(output.to_string_lossy().into_owned());

    arguments
}

/// The encoder stops with SIGTERM and then reports 255; exit by the signal
/// itself is also clean. Anything else means it died on us.
pub fn exited_cleanly(status: ExitStatus) -> bool {
    match status.code() {
        Some(code) => code == 255,
        // Terminated by signal before installing its handler.
        None => true,
    }
}

/// A running encoder process writing one artifact.
pub struct EncoderHandle {
    child: Option<Child>,
    output: PathBuf,
}

impl EncoderHandle {
    /// Path of the artifact being written.
    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn is_healthy(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        match &mut self.child {
            Some(child) => child.wait().await.ok(),
            None => None,
        }
    }

    /// Ask the encoder to finish, wait up to `drain` before killing it.
    pub async fn terminate(&mut self, drain: Duration) -> Result<ExitStatus> {
        let Some(child) = &mut self.child else {
            anyhow::bail!("encoder already stopped");
        };

        if let Some(pid) = child.id() {
            // SIGTERM lets the encoder flush and close the container.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        let status = match tokio::time::timeout(drain, child.wait()).await {
            Ok(result) => result.context("failed to wait for encoder")?,
            Err(_) => {
                tracing::warn!("encoder did not drain in {drain:?}, killing it");
                child.kill().await.context("failed to kill encoder")?;
                self.child = None;
                anyhow::bail!("encoder did not drain in {drain:?}");
            }
        };

        self.child = None;
        Ok(status)
    }

    /// Hard stop for abort paths. Idempotent.
    pub async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if child.start_kill().is_ok() {
                let _ = child.wait().await;
            }
        }
    }
}

/// Wraps the lifecycle of encoder processes.
pub struct EncoderSupervisor {
    config: RecorderConfig,
}

impl EncoderSupervisor {
    pub fn new(config: RecorderConfig) -> Self {
        Self { config }
    }

    /// Start the encoder for a session. Output lines are forwarded to the
    /// log as they arrive.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        &self,
        token: &str,
        status: RecordingStatus,
        display_id: &str,
        audio_source: &str,
        width: u32,
        height: u32,
        extensionless_output: &Path,
    ) -> Result<EncoderHandle> {
        let arguments = recorder_arguments(
            &self.config,
            status,
            display_id,
            audio_source,
            width,
            height,
            extensionless_output,
        );
        let output = PathBuf::from(arguments.last().cloned().unwrap_or_default());

        let mut child = Command::new(&self.config.binary)
            .args(&arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn recorder {}", self.config.binary))?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(token.to_string(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(token.to_string(), stderr);
        }

        Ok(EncoderHandle {
            child: Some(child),
            output,
        })
    }
}

fn forward_output(token: String, pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(session.token = %token, "recorder: {line}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_arguments_audio_and_video() {
        let config = RecorderConfig::default();
        let arguments = recorder_arguments(
            &config,
            RecordingStatus::AudioAndVideo,
            ":107",
            "sink-abc.monitor",
            1280,
            720,
            Path::new("/tmp/spool/recording-20260807-120000"),
        );

        let expected: Vec<String> = [
            "-loglevel",
            "level+warning",
            "-n",
            "-f",
            "pulse",
            "-i",
            "sink-abc.monitor",
            "-f",
            "x11grab",
            "-draw_mouse",
            "0",
            "-video_size",
            "1280x720",
            "-i",
            ":107",
            "-c:a",
            "libopus",
            "-c:v",
            "libvpx",
            "-quality:v",
            "realtime",
            "/tmp/spool/recording-20260807-120000.webm",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(arguments, expected);
    }

    #[test]
    fn test_recorder_arguments_audio_only() {
        let config = RecorderConfig::default();
        let arguments = recorder_arguments(
            &config,
            RecordingStatus::AudioOnly,
            ":107",
            "sink-abc.monitor",
            1280,
            720,
            Path::new("/tmp/spool/recording-20260807-120000"),
        );

        assert!(!arguments.iter().any(|a| a == "x11grab"));
        assert!(!arguments.iter().any(|a| a == "libvpx"));
        assert_eq!(
            arguments.last().unwrap(),
            "/tmp/spool/recording-20260807-120000.ogg"
        );
    }

    #[test]
    fn test_custom_profile_overrides_codecs() {
        let config = RecorderConfig {
            outputvideo: ["-c:v", "libx264"].iter().map(|s| s.to_string()).collect(),
            extensionvideo: ".mp4".to_string(),
            ..RecorderConfig::default()
        };

        let arguments = recorder_arguments(
            &config,
            RecordingStatus::AudioAndVideo,
            ":1",
            "s.monitor",
            640,
            480,
            Path::new("/tmp/r"),
        );

        assert!(arguments.iter().any(|a| a == "libx264"));
        assert_eq!(arguments.last().unwrap(), "/tmp/r.mp4");
    }
}

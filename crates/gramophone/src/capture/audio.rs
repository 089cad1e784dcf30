//! Audio sink supervision.
//!
//! Every browser instance plays into its own PulseAudio null sink. Sharing
//! the default sink would mix the audio of concurrent recordings, so a sink
//! is loaded per session and unloaded again when the session ends.

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use uuid::Uuid;

/// PulseAudio module names are capped at 127 characters.
const MAX_SINK_NAME: usize = 127;

/// Build a per-session sink name.
///
/// A random suffix keeps the name from clashing with a sink of an earlier
/// session for the same call that has not been unloaded yet.
pub fn sink_name(sanitized_backend: &str, token: &str) -> String {
    let name = format!(
        "{}-{}-{}",
        sanitized_backend,
        token,
        Uuid::new_v4().simple()
    );
    name.chars().take(MAX_SINK_NAME).collect()
}

/// A loaded null-sink module bound to one session.
pub struct AudioHandle {
    sink: String,
    module_index: Option<String>,
}

impl AudioHandle {
    /// The sink the browser is pointed at through `PULSE_SINK`.
    pub fn sink_name(&self) -> &str {
        &self.sink
    }

    /// The monitor source the encoder captures from.
    pub fn source_name(&self) -> String {
        format!("{}.monitor", self.sink)
    }

    pub async fn is_healthy(&self) -> bool {
        let Some(index) = &self.module_index else {
            return false;
        };

        let output = Command::new("pactl")
            .args(["list", "short", "modules"])
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .any(|line| line.split_whitespace().next() == Some(index.as_str())),
            _ => false,
        }
    }

    /// Unload the sink module. Idempotent; a sink whose daemon already went
    /// away counts as unloaded.
    pub async fn stop(&mut self) {
        if let Some(index) = self.module_index.take() {
            let result = Command::new("pactl")
                .args(["unload-module", &index])
                .status()
                .await;

            match result {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    tracing::warn!(sink = %self.sink, %status, "failed to unload audio module")
                }
                Err(e) => {
                    tracing::warn!(sink = %self.sink, error = %e, "failed to run pactl unload-module")
                }
            }
        }
    }
}

/// Wraps the lifecycle of per-session PulseAudio null sinks.
pub struct AudioSupervisor;

impl AudioSupervisor {
    /// Create the sink for a session.
    ///
    /// Makes sure the PulseAudio daemon is up first. The long idle timeout
    /// keeps the daemon from exiting before the call was joined.
    pub async fn start(&self, sanitized_backend: &str, token: &str) -> Result<AudioHandle> {
        let status = Command::new("pulseaudio")
            .args(["--start", "--exit-idle-time=120"])
            .status()
            .await
            .context("failed to run pulseaudio --start")?;
        if !status.success() {
            bail!("pulseaudio --start exited with {status}");
        }

        let sink = sink_name(sanitized_backend, token);

        let output = Command::new("pactl")
            .args(["load-module", "module-null-sink"])
            .arg(format!("sink_name={sink}"))
            .output()
            .await
            .context("failed to run pactl load-module")?;
        if !output.status.success() {
            bail!(
                "pactl load-module failed for sink {sink}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let module_index = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if module_index.is_empty() || !module_index.chars().all(|c| c.is_ascii_digit()) {
            bail!("pactl load-module returned no module index for sink {sink}");
        }

        Ok(AudioHandle {
            sink,
            module_index: Some(module_index),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_name_is_unique_per_call() {
        let first = sink_name("httpscloudexamplecom", "tok123");
        let second = sink_name("httpscloudexamplecom", "tok123");

        assert!(first.starts_with("httpscloudexamplecom-tok123-"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_sink_name_is_truncated() {
        let long_token = "t".repeat(200);
        let name = sink_name("backend", &long_token);
        assert_eq!(name.len(), MAX_SINK_NAME);
    }
}

//! Browser supervision.
//!
//! The browser runs in kiosk mode inside the session's virtual display with
//! its audio routed to the session's sink, and is driven over the WebDriver
//! HTTP protocol: create a session, navigate to the call join url, delete the
//! session on stop so the driver cleans up its temporary profile.

use anyhow::{bail, Context, Result};
use gramoconf::BrowserConfig;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};

const DRIVER_BINARY: &str = "geckodriver";

/// Why no usable WebDriver executable was available. The two cases need
/// different operator action, so they are reported separately.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("configured webdriver {path} could not be started: {source}")]
    ConfiguredDriverFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no {DRIVER_BINARY} found on PATH")]
    DriverNotFound,
}

/// A running driver process with one WebDriver session in it.
pub struct BrowserHandle {
    child: Option<Child>,
    base: String,
    session_id: String,
    http: reqwest::Client,
}

impl BrowserHandle {
    pub async fn is_healthy(&self) -> bool {
        let response = self.http.get(format!("{}/status", self.base)).send().await;
        match response {
            Ok(response) => response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|status| status["value"]["ready"].as_bool())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Leave the call and quit the browser. Idempotent.
    ///
    /// The WebDriver session must be deleted explicitly, otherwise the
    /// browser profile lingers in /tmp.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let url = format!("{}/session/{}", self.base, self.session_id);
            if let Err(e) = self.http.delete(&url).send().await {
                tracing::warn!(error = %e, "failed to delete webdriver session");
            }

            if child.start_kill().is_ok() {
                let _ = child.wait().await;
            }
        }
    }
}

/// Wraps the lifecycle of browser instances and their WebDriver drivers.
pub struct BrowserSupervisor {
    driver: Option<PathBuf>,
    http: reqwest::Client,
}

impl BrowserSupervisor {
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            driver: config.driver.clone(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Resolve the driver executable.
    ///
    /// An explicitly configured path is used as-is; only when nothing is
    /// configured is the driver searched for on `$PATH`.
    fn resolve_driver(&self) -> Result<PathBuf, DriverError> {
        if let Some(path) = &self.driver {
            return Ok(path.clone());
        }

        let path_var = std::env::var_os("PATH").ok_or(DriverError::DriverNotFound)?;
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(DRIVER_BINARY))
            .find(|candidate| candidate.is_file())
            .ok_or(DriverError::DriverNotFound)
    }

    /// Start the browser inside the given display, join the call.
    pub async fn start(
        &self,
        display_id: &str,
        sink_name: &str,
        width: u32,
        height: u32,
        port: u16,
        join_url: &str,
    ) -> Result<BrowserHandle> {
        let driver = self.resolve_driver()?;
        let configured = self.driver.is_some();

        let child = Command::new(&driver)
            .args(["--port", &port.to_string()])
            .env("DISPLAY", display_id)
            .env("PULSE_SINK", sink_name)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                if configured {
                    anyhow::Error::from(DriverError::ConfiguredDriverFailed {
                        path: driver.clone(),
                        source,
                    })
                } else {
                    anyhow::Error::from(source)
                        .context(format!("failed to start discovered driver {}", driver.display()))
                }
            })?;

        let mut handle = BrowserHandle {
            child: Some(child),
            base: format!("http://127.0.0.1:{port}"),
            session_id: String::new(),
            http: self.http.clone(),
        };

        if let Err(e) = self.join_call(&mut handle, width, height, join_url).await {
            handle.stop().await;
            return Err(e);
        }

        Ok(handle)
    }

    async fn join_call(
        &self,
        handle: &mut BrowserHandle,
        width: u32,
        height: u32,
        join_url: &str,
    ) -> Result<()> {
        self.wait_for_driver(handle).await?;

        // Kiosk mode keeps browser chrome out of the capture; the media
        // preferences let the call play without any user interaction.
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "moz:firefoxOptions": {
                        "args": [
                            "--kiosk",
                            format!("--width={width}"),
                            format!("--height={height}"),
                        ],
                        "prefs": {
                            "media.navigator.permission.disabled": true,
                            "media.autoplay.default": 0,
                        },
                    },
                },
            },
        });

        let response: serde_json::Value = self
            .http
            .post(format!("{}/session", handle.base))
            .json(&capabilities)
            .send()
            .await
            .context("failed to create webdriver session")?
            .json()
            .await
            .context("invalid webdriver session response")?;

        let Some(session_id) = response["value"]["sessionId"].as_str() else {
            bail!("webdriver session response carried no session id: {response}");
        };
        handle.session_id = session_id.to_string();

        let response = self
            .http
            .post(format!("{}/session/{}/url", handle.base, handle.session_id))
            .json(&json!({ "url": join_url }))
            .send()
            .await
            .context("failed to navigate to the call")?;
        if !response.status().is_success() {
            bail!("call navigation rejected with {}", response.status());
        }

        Ok(())
    }

    async fn wait_for_driver(&self, handle: &mut BrowserHandle) -> Result<()> {
        for _ in 0..50 {
            if let Some(child) = &mut handle.child {
                if !matches!(child.try_wait(), Ok(None)) {
                    bail!("webdriver exited during startup");
                }
            }
            if handle.is_healthy().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        bail!("webdriver did not become ready within 5s")
    }
}

//! Requests to the origin servers: the started notification and the one-shot
//! artifact upload.
//!
//! Uploads are never retried. A destination that rejects the payload for
//! structural reasons (size limit, authentication) will keep rejecting it,
//! so the artifact is left in the spool directory for manual recovery and
//! the uploads-failed counter is the operator signal.

use crate::auth;
use crate::capture::CaptureArtifact;
use anyhow::{bail, Context, Result};
use gramoconf::ResolvedBackend;
use reqwest::multipart::{Form, Part};
use serde_json::json;
use std::time::Duration;

const USER_AGENT: &str = concat!("gramophone/", env!("CARGO_PKG_VERSION"));

/// Client for the authenticated outbound requests of a session.
pub struct BackendNotifier {
    upload_timeout: Duration,
}

impl BackendNotifier {
    pub fn new(upload_timeout: Duration) -> Self {
        Self { upload_timeout }
    }

    fn client(&self, backend: &ResolvedBackend) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(backend.skip_verify)
            .build()
            .context("failed to build http client")
    }

    /// Tell the origin server that the recording is running.
    ///
    /// The session only becomes `Recording` once this was delivered; a
    /// failure here fails the session instead of leaving it hanging half
    /// started.
    pub async fn recording_started(&self, backend: &ResolvedBackend, token: &str) -> Result<()> {
        let body = serde_json::to_vec(&json!({ "type": "started" }))
            .context("failed to encode started notification")?;
        let random = auth::new_random();
        let checksum = auth::checksum(&backend.secret, &random, &body);

        let url = format!("{}/api/v1/recording/{}", backend.url, token);
        let response = self
            .client(backend)?
            .post(&url)
            .timeout(Duration::from_secs(30))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(auth::RANDOM_HEADER, random)
            .header(auth::CHECKSUM_HEADER, checksum)
            .body(body)
            .send()
            .await
            .with_context(|| format!("failed to notify {url}"))?;

        if !response.status().is_success() {
            bail!("started notification rejected with {}", response.status());
        }

        Ok(())
    }

    /// Upload the finished artifact. Exactly one attempt; the caller decides
    /// what the failure means, the artifact stays on disk either way until
    /// this returns success.
    pub async fn upload(
        &self,
        backend: &ResolvedBackend,
        token: &str,
        artifact: &CaptureArtifact,
        owner: &str,
    ) -> Result<()> {
        let file_name = artifact
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording".to_string());

        let contents = tokio::fs::read(&artifact.path)
            .await
            .with_context(|| format!("failed to read recording {}", artifact.path.display()))?;

        tracing::info!(
            session.token = %token,
            backend = %backend.id,
            file = %file_name,
            size = contents.len(),
            "uploading recording"
        );

        // The multipart body is not signed; the checksum covers the token.
        let random = auth::new_random();
        let checksum = auth::checksum(&backend.secret, &random, token.as_bytes());

        let form = Form::new()
            .text("owner", owner.to_string())
            .part("file", Part::bytes(contents).file_name(file_name));

        let url = format!("{}/api/v1/recording/{}/store", backend.url, token);
        let response = self
            .client(backend)?
            .post(&url)
            .timeout(self.upload_timeout)
            .header(auth::RANDOM_HEADER, random)
            .header(auth::CHECKSUM_HEADER, checksum)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("failed to upload to {url}"))?;

        if !response.status().is_success() {
            bail!("upload rejected with {}", response.status());
        }

        tokio::fs::remove_file(&artifact.path)
            .await
            .with_context(|| format!("failed to remove uploaded {}", artifact.path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn backend(url: &str) -> ResolvedBackend {
        ResolvedBackend {
            id: "cloud".to_string(),
            url: url.to_string(),
            secret: "s3cr3t".to_string(),
            max_message_size: 1024,
            video_width: 1920,
            video_height: 1080,
            directory: PathBuf::from("/tmp"),
            skip_verify: false,
        }
    }

    async fn serve(status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let requests = Arc::new(AtomicUsize::new(0));

        async fn handler(State(state): State<(Arc<AtomicUsize>, StatusCode)>) -> StatusCode {
            state.0.fetch_add(1, Ordering::SeqCst);
            state.1
        }

        let app = Router::new()
            .route("/api/v1/recording/{token}/store", post(handler))
            .with_state((requests.clone(), status));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), requests)
    }

    fn artifact(dir: &tempfile::TempDir) -> CaptureArtifact {
        let path = dir.path().join("recording-20260807-120000.webm");
        std::fs::write(&path, b"webm-bytes").unwrap();
        CaptureArtifact {
            path,
            duration: Duration::from_secs(90),
        }
    }

    #[tokio::test]
    async fn test_upload_success_removes_artifact() {
        let (url, requests) = serve(StatusCode::OK).await;
        let dir = tempfile::TempDir::new().unwrap();
        let artifact = artifact(&dir);

        let notifier = BackendNotifier::new(Duration::from_secs(5));
        notifier
            .upload(&backend(&url), "tok123", &artifact, "alice")
            .await
            .unwrap();

        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert!(!artifact.path.exists());
    }

    #[tokio::test]
    async fn test_rejected_upload_keeps_artifact_and_never_retries() {
        let (url, requests) = serve(StatusCode::PAYLOAD_TOO_LARGE).await;
        let dir = tempfile::TempDir::new().unwrap();
        let artifact = artifact(&dir);

        let notifier = BackendNotifier::new(Duration::from_secs(5));
        let result = notifier
            .upload(&backend(&url), "tok123", &artifact, "alice")
            .await;

        assert!(result.is_err());
        assert!(artifact.path.exists());

        // A retry loop would show up as extra requests within this window.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_keeps_artifact() {
        let dir = tempfile::TempDir::new().unwrap();
        let artifact = artifact(&dir);

        let notifier = BackendNotifier::new(Duration::from_secs(1));
        let result = notifier
            .upload(&backend("http://127.0.0.1:1"), "tok123", &artifact, "alice")
            .await;

        assert!(result.is_err());
        assert!(artifact.path.exists());
    }
}

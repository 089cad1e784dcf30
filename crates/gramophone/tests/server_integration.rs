//! Integration tests for the control surface.
//!
//! Requests go through the real router, authentication and session manager;
//! only the capture side is stubbed out so no external processes run.

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::Router;
use gramophone::auth::{self, TrustedProxies};
use gramophone::capture::{
    CaptureArtifact, EncoderCrash, RecordingSpec, RecordingUnit, RecordingUnitFactory,
};
use gramophone::metrics::Metrics;
use gramophone::server::{self, AppState};
use gramophone::sessions::{SessionManager, SessionState};
use gramophone::upload::BackendNotifier;
use gramoconf::{Registry, TimeoutsConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

struct StubUnit {
    spool: PathBuf,
}

#[async_trait]
impl RecordingUnit for StubUnit {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn crashed(&mut self) -> EncoderCrash {
        std::future::pending().await
    }

    async fn stop(&mut self) -> Result<CaptureArtifact> {
        let path = self.spool.join(format!(
            "recording-{}.webm",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(&path, b"webm-bytes")?;
        Ok(CaptureArtifact {
            path,
            duration: Duration::from_secs(30),
        })
    }

    async fn release(&mut self) {}
}

struct StubFactory {
    spool: PathBuf,
}

impl RecordingUnitFactory for StubFactory {
    fn create(&self, _spec: RecordingSpec) -> Box<dyn RecordingUnit> {
        Box::new(StubUnit {
            spool: self.spool.clone(),
        })
    }
}

/// Fake origin server accepting started notifications and uploads.
async fn fake_origin() -> String {
    async fn ok() -> StatusCode {
        StatusCode::OK
    }

    let app = Router::new()
        .route("/api/v1/recording/{token}", post(ok))
        .route("/api/v1/recording/{token}/store", post(ok));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

struct Fixture {
    router: Router,
    manager: Arc<SessionManager>,
    metrics: Arc<Metrics>,
    origin: String,
    _spool: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let origin = fake_origin().await;
    let spool = tempfile::TempDir::new().unwrap();

    let config: gramoconf::RecordingConfig = toml::from_str(&format!(
        r#"
[backends.cloud]
url = "{origin}"
secret = "s3cr3t"
directory = "{spool}"
"#,
        origin = origin,
        spool = spool.path().display()
    ))
    .unwrap();
    let registry = Arc::new(Registry::build(&config).unwrap());

    let metrics = Arc::new(Metrics::new());
    let manager = Arc::new(SessionManager::new(
        registry.clone(),
        metrics.clone(),
        Arc::new(StubFactory {
            spool: spool.path().to_path_buf(),
        }),
        Arc::new(BackendNotifier::new(Duration::from_secs(5))),
        TimeoutsConfig {
            start: 5,
            stop: 5,
            upload: 5,
        },
    ));

    let router = server::router(AppState {
        registry,
        manager: manager.clone(),
        metrics: metrics.clone(),
        proxies: Arc::new(TrustedProxies::default()),
        started_at: Instant::now(),
    });

    Fixture {
        router,
        manager,
        metrics,
        origin,
        _spool: spool,
    }
}

fn signed_request(origin: &str, secret: &str, token: &str, body: &str) -> Request<Body> {
    let random = auth::new_random();
    let checksum = auth::checksum(secret, &random, body.as_bytes());

    Request::builder()
        .method("POST")
        .uri(format!("/api/v1/session/{token}"))
        .header(auth::BACKEND_HEADER, origin)
        .header(auth::RANDOM_HEADER, random)
        .header(auth::CHECKSUM_HEADER, checksum)
        .body(Body::from(body.to_string()))
        .unwrap()
}

const START_BODY: &str = r#"{"type":"start","start":{"owner":"alice","actor":{"type":"users","id":"alice"}}}"#;
const STOP_BODY: &str = r#"{"type":"stop","stop":{}}"#;

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_welcome() {
    let fx = fixture().await;

    let response = fx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/welcome")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_start_then_duplicate_then_stop() {
    let fx = fixture().await;

    let response = fx
        .router
        .clone()
        .oneshot(signed_request(&fx.origin, "s3cr3t", "tok1", START_BODY))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let manager = fx.manager.clone();
    wait_until("recording state", || {
        manager.session_state("tok1") == Some(SessionState::Recording)
    })
    .await;

    // A duplicate start is accepted and changes nothing.
    let response = fx
        .router
        .clone()
        .oneshot(signed_request(&fx.origin, "s3cr3t", "tok1", START_BODY))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(fx.manager.stats().active, 1);

    let response = fx
        .router
        .clone()
        .oneshot(signed_request(&fx.origin, "s3cr3t", "tok1", STOP_BODY))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let manager = fx.manager.clone();
    wait_until("session drained", || manager.stats().active == 0).await;

    let snapshot = fx.metrics.snapshot();
    assert_eq!(snapshot.backends["cloud"].recordings_total, 1);
    assert_eq!(snapshot.backends["cloud"].recorded_duration_seconds, 30);
}

#[tokio::test]
async fn test_unknown_origin_is_rejected_without_side_effects() {
    let fx = fixture().await;

    let response = fx
        .router
        .clone()
        .oneshot(signed_request(
            "https://rogue.example.com",
            "s3cr3t",
            "tok1",
            START_BODY,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(fx.manager.stats().active, 0);
    assert!(fx.metrics.snapshot().backends.is_empty());
}

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let fx = fixture().await;

    let response = fx
        .router
        .clone()
        .oneshot(signed_request(&fx.origin, "wrong", "tok1", START_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(fx.manager.stats().active, 0);
}

#[tokio::test]
async fn test_missing_headers_are_rejected() {
    let fx = fixture().await;

    let response = fx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/session/tok1")
                .body(Body::from(START_BODY))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let fx = fixture().await;

    let padding = "x".repeat(2048);
    let body = format!(r#"{{"type":"stop","stop":{{"padding":"{padding}"}}}}"#);

    let response = fx
        .router
        .clone()
        .oneshot(signed_request(&fx.origin, "s3cr3t", "tok1", &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_body_is_rejected_after_authentication() {
    let fx = fixture().await;

    let response = fx
        .router
        .clone()
        .oneshot(signed_request(&fx.origin, "s3cr3t", "tok1", r#"{"no":"type"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stop_without_active_session_is_accepted() {
    let fx = fixture().await;

    let response = fx
        .router
        .clone()
        .oneshot(signed_request(&fx.origin, "s3cr3t", "ghost", STOP_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(fx.manager.stats().active, 0);
}

#[tokio::test]
async fn test_health_reports_sessions_and_metrics() {
    let fx = fixture().await;

    fx.router
        .clone()
        .oneshot(signed_request(&fx.origin, "s3cr3t", "tok1", START_BODY))
        .await
        .unwrap();
    let manager = fx.manager.clone();
    wait_until("recording state", || {
        manager.session_state("tok1") == Some(SessionState::Recording)
    })
    .await;

    let response = fx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["status"], "healthy");
    assert_eq!(parsed["sessions"]["active"], 1);
    assert_eq!(
        parsed["recordings"]["backends"]["cloud"]["current_recordings"],
        1
    );
}

//! Session manager - owns the registry of active recordings and drives each
//! session through its lifecycle.
//!
//! The registry is the one piece of shared mutable state. All checks and
//! inserts happen under its lock, so two concurrent starts for the same
//! conversation token can never both succeed, while sessions for different
//! tokens proceed fully in parallel. Each session runs as its own task and
//! removes itself from the registry when it reaches a terminal state.

use super::types::{FailureReason, SessionState, StartRequest};
use crate::capture::{DisplaysExhausted, RecordingSpec, RecordingUnit, RecordingUnitFactory};
use crate::metrics::Metrics;
use crate::signaling;
use crate::upload::BackendNotifier;
use gramoconf::{Registry, ResolvedBackend, TimeoutsConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A non-terminal session already exists for the token; the duplicate
    /// start is accepted as a no-op.
    AlreadyActive,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopping,
    /// No active session for the token; treated as already finished.
    NotActive,
}

/// Registry counts for the health endpoint.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SessionStats {
    pub active: usize,
}

struct SessionEntry {
    id: Uuid,
    backend_id: String,
    state: Arc<Mutex<SessionState>>,
    cancel: CancellationToken,
}

type SessionMap = Arc<Mutex<HashMap<String, SessionEntry>>>;

/// Owns every recording session in the process.
pub struct SessionManager {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    factory: Arc<dyn RecordingUnitFactory>,
    notifier: Arc<BackendNotifier>,
    timeouts: TimeoutsConfig,
    sessions: SessionMap,
    fatal: CancellationToken,
}

impl SessionManager {
    pub fn new(
        registry: Arc<Registry>,
        metrics: Arc<Metrics>,
        factory: Arc<dyn RecordingUnitFactory>,
        notifier: Arc<BackendNotifier>,
        timeouts: TimeoutsConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            factory,
            notifier,
            timeouts,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            fatal: CancellationToken::new(),
        }
    }

    /// Cancelled when the process hit an unrecoverable fault and should shut
    /// down, such as running out of display numbers entirely.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Start recording a call.
    ///
    /// A start for a token that already has a non-terminal session is a
    /// no-op; the caller reports it as accepted either way.
    pub fn start_recording(
        &self,
        backend: ResolvedBackend,
        token: &str,
        request: StartRequest,
    ) -> StartOutcome {
        let mut sessions = self.sessions.lock().unwrap();

        if let Some(entry) = sessions.get(token) {
            let state = *entry.state.lock().unwrap();
            if !state.is_terminal() {
                warn!(
                    session.token = %token,
                    backend = %backend.id,
                    %state,
                    "start requested for an active recording, ignoring"
                );
                return StartOutcome::AlreadyActive;
            }
        }

        let ticket = request.signaling_url.as_deref().and_then(|url| {
            match signaling::issue_ticket(&self.registry, url, token) {
                Ok(ticket) => Some(ticket),
                Err(e) => {
                    warn!(session.token = %token, error = %e, "joining without a signaling ticket");
                    None
                }
            }
        });
        let join_url = signaling::join_url(&backend.url, token, ticket.as_ref());

        let unit = self.factory.create(RecordingSpec {
            token: token.to_string(),
            backend: backend.clone(),
            status: request.status,
            join_url,
        });

        let entry = SessionEntry {
            id: Uuid::new_v4(),
            backend_id: backend.id.clone(),
            state: Arc::new(Mutex::new(SessionState::Requested)),
            cancel: CancellationToken::new(),
        };

        info!(session.token = %token, backend = %backend.id, "start recording");

        let context = SessionContext {
            token: token.to_string(),
            entry_id: entry.id,
            state: entry.state.clone(),
            cancel: entry.cancel.clone(),
            backend,
            owner: request.owner,
            metrics: self.metrics.clone(),
            notifier: self.notifier.clone(),
            timeouts: self.timeouts.clone(),
            sessions: self.sessions.clone(),
            fatal: self.fatal.clone(),
        };

        // The entry must be registered before the task runs, otherwise a
        // fast-failing session could finish before it exists and leave a
        // zombie entry behind.
        sessions.insert(token.to_string(), entry);
        tokio::spawn(context.run(unit));

        StartOutcome::Started
    }

    /// Stop recording a call. Idempotent: stopping a session that is already
    /// winding down, finished, failed or unknown is a no-op success.
    pub fn stop_recording(&self, token: &str) -> StopOutcome {
        let sessions = self.sessions.lock().unwrap();

        match sessions.get(token) {
            Some(entry) if !entry.state.lock().unwrap().is_terminal() => {
                info!(session.token = %token, backend = %entry.backend_id, "stop recording");
                entry.cancel.cancel();
                StopOutcome::Stopping
            }
            _ => {
                info!(session.token = %token, "stop requested for an unknown recording, ignoring");
                StopOutcome::NotActive
            }
        }
    }

    /// Current state of a session, if one is active.
    pub fn session_state(&self, token: &str) -> Option<SessionState> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(token)
            .map(|entry| *entry.state.lock().unwrap())
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.sessions.lock().unwrap();
        SessionStats {
            active: sessions.len(),
        }
    }

    /// Cancel every in-flight session and wait for the registry to drain.
    pub async fn shutdown(&self, drain: Duration) {
        {
            let sessions = self.sessions.lock().unwrap();
            for entry in sessions.values() {
                entry.cancel.cancel();
            }
        }

        let deadline = Instant::now() + drain;
        loop {
            if self.stats().active == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    remaining = self.stats().active,
                    "sessions did not drain before shutdown deadline"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Everything one session task needs; the task owns its clone.
struct SessionContext {
    token: String,
    entry_id: Uuid,
    state: Arc<Mutex<SessionState>>,
    cancel: CancellationToken,
    backend: ResolvedBackend,
    owner: String,
    metrics: Arc<Metrics>,
    notifier: Arc<BackendNotifier>,
    timeouts: TimeoutsConfig,
    sessions: SessionMap,
    fatal: CancellationToken,
}

impl SessionContext {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Record the terminal state and drop the session from the registry. The
    /// id check keeps a finished task from removing a successor session that
    /// reused the token in the meantime.
    fn finish(&self, state: SessionState) {
        self.set_state(state);
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.get(&self.token).is_some_and(|entry| entry.id == self.entry_id) {
            sessions.remove(&self.token);
        }
    }

    async fn run(self, mut unit: Box<dyn RecordingUnit>) {
        self.set_state(SessionState::Starting);

        let started = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(self.timeouts.start_timeout(), unit.start()) => Some(result),
        };

        match started {
            None => {
                info!(session.token = %self.token, "recording stopped before it started");
                unit.release().await;
                self.metrics.recording_cancelled(&self.backend.id, false);
                self.finish(SessionState::Failed(FailureReason::Cancelled));
                return;
            }
            Some(Err(_)) => {
                error!(
                    session.token = %self.token,
                    backend = %self.backend.id,
                    timeout = ?self.timeouts.start_timeout(),
                    "capture pipeline did not come up in time"
                );
                unit.release().await;
                self.metrics.recording_failed(&self.backend.id, false);
                self.finish(SessionState::Failed(FailureReason::StartTimeout));
                return;
            }
            Some(Ok(Err(e))) => {
                if e.downcast_ref::<DisplaysExhausted>().is_some() {
                    error!("display numbers exhausted, shutting down");
                    self.fatal.cancel();
                }
                error!(
                    session.token = %self.token,
                    backend = %self.backend.id,
                    error = %format!("{e:#}"),
                    "failed to start recording"
                );
                unit.release().await;
                self.metrics.recording_failed(&self.backend.id, false);
                self.finish(SessionState::Failed(FailureReason::SupervisorFault));
                return;
            }
            Some(Ok(Ok(()))) => {}
        }

        // The origin server has to learn that the recording is running; if
        // that cannot be delivered the session fails instead of sitting in
        // Starting forever.
        if let Err(e) = self
            .notifier
            .recording_started(&self.backend, &self.token)
            .await
        {
            error!(
                session.token = %self.token,
                backend = %self.backend.id,
                error = %format!("{e:#}"),
                "failed to mark recording as started"
            );
            unit.release().await;
            self.metrics.recording_failed(&self.backend.id, false);
            self.finish(SessionState::Failed(FailureReason::SupervisorFault));
            return;
        }

        self.set_state(SessionState::Recording);
        self.metrics.recording_started(&self.backend.id);
        info!(session.token = %self.token, backend = %self.backend.id, "recording");

        let crash = tokio::select! {
            _ = self.cancel.cancelled() => None,
            crash = unit.crashed() => Some(crash),
        };

        if let Some(crash) = crash {
            error!(
                session.token = %self.token,
                backend = %self.backend.id,
                reason = %crash.description,
                "recorder crashed"
            );
            unit.release().await;
            self.metrics.recording_failed(&self.backend.id, true);
            self.finish(SessionState::Failed(FailureReason::RecorderCrashed));
            return;
        }

        self.set_state(SessionState::Stopping);
        info!(session.token = %self.token, "stopping recording");

        let stopped = tokio::time::timeout(self.timeouts.stop_timeout(), unit.stop()).await;
        let artifact = match stopped {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(e)) => {
                error!(
                    session.token = %self.token,
                    backend = %self.backend.id,
                    error = %format!("{e:#}"),
                    "recording did not stop cleanly"
                );
                unit.release().await;
                self.metrics.recording_failed(&self.backend.id, true);
                self.finish(SessionState::Failed(FailureReason::RecorderCrashed));
                return;
            }
            Err(_) => {
                error!(
                    session.token = %self.token,
                    backend = %self.backend.id,
                    "capture pipeline did not drain in time"
                );
                unit.release().await;
                self.metrics.recording_failed(&self.backend.id, true);
                self.finish(SessionState::Failed(FailureReason::RecorderCrashed));
                return;
            }
        };

        self.set_state(SessionState::Uploading);

        match self
            .notifier
            .upload(&self.backend, &self.token, &artifact, &self.owner)
            .await
        {
            Ok(()) => {
                self.metrics
                    .recording_finished(&self.backend.id, artifact.duration.as_secs());
                info!(
                    session.token = %self.token,
                    backend = %self.backend.id,
                    duration_secs = artifact.duration.as_secs(),
                    "recording finished"
                );
                self.finish(SessionState::Finished);
            }
            Err(e) => {
                // No retry: the artifact stays on disk for manual recovery.
                error!(
                    session.token = %self.token,
                    backend = %self.backend.id,
                    artifact = %artifact.path.display(),
                    error = %format!("{e:#}"),
                    "upload failed, artifact retained"
                );
                self.metrics.upload_failed(&self.backend.id);
                self.finish(SessionState::Failed(FailureReason::UploadFailed));
            }
        }
    }
}

//! Session lifecycle types.

use crate::capture::RecordingStatus;
use serde::Serialize;
use std::fmt;

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The capture pipeline did not come up within the start timeout.
    StartTimeout,
    /// The encoder exited abnormally or produced nothing.
    RecorderCrashed,
    /// A supervisor or the started notification failed.
    SupervisorFault,
    /// The artifact could not be handed off; it stays on disk.
    UploadFailed,
    /// Stop arrived before the recording was running.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StartTimeout => "start timeout",
            Self::RecorderCrashed => "recorder crashed",
            Self::SupervisorFault => "supervisor fault",
            Self::UploadFailed => "upload failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle state of one recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    Starting,
    Recording,
    Stopping,
    Uploading,
    Finished,
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Starting => write!(f, "starting"),
            Self::Recording => write!(f, "recording"),
            Self::Stopping => write!(f, "stopping"),
            Self::Uploading => write!(f, "uploading"),
            Self::Finished => write!(f, "finished"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// A validated start request.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// User the finished artifact is stored as on the origin server.
    pub owner: String,
    pub actor_type: String,
    pub actor_id: String,
    pub status: RecordingStatus,
    /// Signaling endpoint for the call, when the origin names one.
    pub signaling_url: Option<String>,
}

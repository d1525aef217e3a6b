use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub project_id: Option<String>,
    pub server_url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub forwarded: u64,
    pub checkpoint: Option<Checkpoint>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            project_id: None,
            server_url: None,
            started_at: None,
            last_poll_at: None,
            last_error: None,
            forwarded: 0,
            checkpoint: None,
        }
    }
}

/// Highest KoboToolbox `_id` of a project that reached a terminal delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_submission_id: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped { project_id: String, forwarded: u64 },
    NotActive { warning: String },
}

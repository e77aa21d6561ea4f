use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Active,
    Inactive,
}

impl WatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchState::Active => "active",
            WatchState::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(WatchState::Active),
            "inactive" => Some(WatchState::Inactive),
            _ => None,
        }
    }
}

/// One push watch per user. Provider-side watches expire and must be renewed
/// before `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSubscription {
    pub user_id: Uuid,
    pub watch_id: String,
    pub topic: String,
    pub state: WatchState,
    pub expires_at: DateTime<Utc>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub renewal_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WatchSubscription {
    pub fn is_active(&self) -> bool {
        self.state == WatchState::Active
    }

    pub fn hours_until_expiration(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_hours()
    }
}

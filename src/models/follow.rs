use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A follow joined with the names needed to display it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedFollowDetails {
    pub id: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub created_at: DateTime<Utc>,
    pub feed_name: String,
    pub feed_url: String,
    pub user_name: String,
}

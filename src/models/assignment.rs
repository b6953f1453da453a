use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentResponse {
    Pending,
    Accepted,
    Rejected,
    Expired,
    /// The order was cancelled or failed while the offer was live.
    Withdrawn,
    Completed,
}

impl AssignmentResponse {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Accepted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub courier_id: Uuid,
    pub response: AssignmentResponse,
    pub distance_km: Option<f64>,
    pub assigned_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn is_active(&self) -> bool {
        self.response.is_active()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.response == AssignmentResponse::Pending && now >= self.deadline
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a broadcast run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    CompletedWithErrors,
    Cancelled,
}

impl RunStatus {
    /// Terminal runs are never claimed again and never hold a lease.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::CompletedWithErrors | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Queued => write!(f, "queued"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Audience selector of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum RunTarget {
    All,
    Vip,
    Role,
    Users,
    ChannelSubscribers,
}

impl std::fmt::Display for RunTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunTarget::All => write!(f, "all"),
            RunTarget::Vip => write!(f, "vip"),
            RunTarget::Role => write!(f, "role"),
            RunTarget::Users => write!(f, "users"),
            RunTarget::ChannelSubscribers => write!(f, "channel_subscribers"),
        }
    }
}

/// Per-recipient delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Sent,
    FailedRetryable,
    FailedPermanent,
    Unknown,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Processing => write!(f, "processing"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::FailedRetryable => write!(f, "failed_retryable"),
            DeliveryStatus::FailedPermanent => write!(f, "failed_permanent"),
            DeliveryStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// One broadcast campaign.
///
/// The counter columns are a cache over `broadcast_deliveries` and are
/// refreshed from aggregates after every state change that matters.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BroadcastRun {
    pub id: i64,
    pub status: RunStatus,
    pub target: RunTarget,
    pub target_role: Option<String>,
    pub target_user_ids: Option<Vec<i64>>,
    pub message: String,
    pub kind: String,
    pub requested_by: Option<i64>,
    pub recipient_limit: Option<i64>,
    pub total_recipients: i64,
    pub pending_count: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub unknown_count: i64,
    #[serde(skip_serializing)]
    pub lock_token: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One (run, recipient) send record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BroadcastDelivery {
    pub id: i64,
    pub run_id: i64,
    pub user_id: Option<i64>,
    pub chat_id: String,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub gateway_message_id: Option<i64>,
    #[serde(skip_serializing)]
    pub lock_token: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A delivery joined with best-effort recipient display info.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryView {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub delivery: BroadcastDelivery,
    pub recipient_name: Option<String>,
    pub recipient_username: Option<String>,
}

/// A resolved (user reference, channel address) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    pub user_id: Option<i64>,
    pub chat_id: String,
}

/// Delivery rows of one run grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed_retryable: i64,
    pub failed_permanent: i64,
    pub unknown: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: DeliveryStatus, count: i64) {
        match status {
            DeliveryStatus::Pending => self.pending += count,
            DeliveryStatus::Processing => self.processing += count,
            DeliveryStatus::Sent => self.sent += count,
            DeliveryStatus::FailedRetryable => self.failed_retryable += count,
            DeliveryStatus::FailedPermanent => self.failed_permanent += count,
            DeliveryStatus::Unknown => self.unknown += count,
        }
    }

    /// Deliveries that still need a worker: PENDING + FAILED_RETRYABLE + PROCESSING.
    pub fn active(&self) -> i64 {
        self.pending + self.failed_retryable + self.processing
    }

    /// Deliveries that ended badly: FAILED_PERMANENT + UNKNOWN.
    pub fn errors(&self) -> i64 {
        self.failed_permanent + self.unknown
    }

    pub fn total(&self) -> i64 {
        self.active() + self.sent + self.errors()
    }
}

impl FromIterator<(DeliveryStatus, i64)> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = (DeliveryStatus, i64)>>(iter: I) -> Self {
        let mut counts = StatusCounts::default();
        for (status, count) in iter {
            counts.add(status, count);
        }
        counts
    }
}

/// Status filter for delivery listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryFilter {
    #[default]
    All,
    Sent,
    NotSent,
    Failed,
    Unknown,
    Pending,
}

impl DeliveryFilter {
    /// Delivery statuses selected by this filter.
    pub fn statuses(self) -> &'static [DeliveryStatus] {
        use DeliveryStatus::*;
        match self {
            DeliveryFilter::All => &[
                Pending,
                Processing,
                Sent,
                FailedRetryable,
                FailedPermanent,
                Unknown,
            ],
            DeliveryFilter::Sent => &[Sent],
            DeliveryFilter::NotSent => &[
                Pending,
                Processing,
                FailedRetryable,
                FailedPermanent,
                Unknown,
            ],
            DeliveryFilter::Failed => &[FailedPermanent, FailedRetryable],
            DeliveryFilter::Unknown => &[Unknown],
            DeliveryFilter::Pending => &[Pending, Processing],
        }
    }

    pub fn matches(self, status: DeliveryStatus) -> bool {
        self.statuses().contains(&status)
    }
}

impl std::str::FromStr for DeliveryFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" => Ok(DeliveryFilter::All),
            "SENT" => Ok(DeliveryFilter::Sent),
            "NOT_SENT" => Ok(DeliveryFilter::NotSent),
            "FAILED" => Ok(DeliveryFilter::Failed),
            "UNKNOWN" => Ok(DeliveryFilter::Unknown),
            "PENDING" => Ok(DeliveryFilter::Pending),
            other => Err(format!(
                "Invalid filter '{}'. Valid filters: ALL, SENT, NOT_SENT, FAILED, UNKNOWN, PENDING",
                other
            )),
        }
    }
}

/// 1-based pagination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const DEFAULT_PAGE_SIZE: u32 = 20;
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Clamp raw query values into a valid request.
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(Self::DEFAULT_PAGE_SIZE)
                .clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn limit(&self) -> i64 {
        self.page_size as i64
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.page_size as i64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of results plus the unpaginated total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
        }
    }
}

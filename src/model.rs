use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a full-history sync job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelling,
    Cancelled,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "cancelling" => Some(JobStatus::Cancelling),
            "cancelled" => Some(JobStatus::Cancelled),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Complete | JobStatus::Failed
        )
    }

    /// Allowed edges of the job state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Complete)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Cancelling)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed)
        )
    }

    /// Every status that may move to `next`.
    pub fn sources_of(next: JobStatus) -> Vec<JobStatus> {
        ALL_JOB_STATUSES
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

pub const ALL_JOB_STATUSES: [JobStatus; 6] = [
    JobStatus::Queued,
    JobStatus::Running,
    JobStatus::Cancelling,
    JobStatus::Cancelled,
    JobStatus::Complete,
    JobStatus::Failed,
];

/// Events the notification dispatcher knows how to deliver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewOrder,
    UserTest,
    SystemTest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewOrder => "new_order",
            EventKind::UserTest => "user_test",
            EventKind::SystemTest => "system_test",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    SuperAdmin,
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    /// Unknown role strings are treated as plain users.
    pub fn parse_role(s: &str) -> Self {
        match s {
            "super_admin" => Role::SuperAdmin,
            "admin" => Role::Admin,
            _ => Role::User,
        }
    }

    /// Whether a user with this role receives escalation copies for managed users.
    pub fn is_manager(&self) -> bool {
        matches!(self, Role::SuperAdmin | Role::Admin)
    }
}

/// A storefront as seen by the sync core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub user_id: Option<i64>,
    pub active: bool,
    pub syncing: bool,
    pub check_interval_minutes: Option<i64>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_notified_cursor: Option<DateTime<Utc>>,
}

/// Canonical order fields produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub external_order_id: i64,
    pub status: String,
    pub currency: String,
    pub total: f64,
    pub shipping_total: f64,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub billing_address: Option<String>,
    pub shipping_address: Option<String>,
    pub payment_method_title: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: Option<i64>,
    pub name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub unit_price: f64,
    pub image_url: Option<String>,
    pub variants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOrder {
    pub order: Order,
    pub items: Vec<LineItem>,
}

/// Job Ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub job_id: String,
    pub store_id: i64,
    pub user_id: Option<i64>,
    pub name: String,
    pub status: JobStatus,
    pub progress: i64,
    pub total: Option<i64>,
    pub log: Option<String>,
    pub cancellation_requested: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Notification-relevant slice of a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub manager_id: Option<i64>,
    pub telegram_enabled: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_send_delay_seconds: Option<i64>,
    pub can_customize_telegram_delay: bool,
    pub can_customize_telegram_templates: bool,
    pub telegram_template_new_order: Option<String>,
    pub telegram_template_user_test: Option<String>,
}

impl UserProfile {
    pub fn personal_template(&self, event: EventKind) -> Option<&str> {
        match event {
            EventKind::NewOrder => self.telegram_template_new_order.as_deref(),
            EventKind::UserTest => self.telegram_template_user_test.as_deref(),
            EventKind::SystemTest => None,
        }
    }
}

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_REMINDER_DAYS: u32 = 3;
pub const DEFAULT_REMINDER_TIME: &str = "10:00";
pub const DEFAULT_SMS_TEMPLATE: &str = "default";
pub const DEFAULT_PAYMENT_METHOD: &str = "cash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Paid,
    #[default]
    Pending,
    Overdue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    #[default]
    Active,
    Inactive,
    /// Any other stored value, written back verbatim. Counts as not active.
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub monthly_amount: Decimal,
    pub due_day: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_reminder_days")]
    pub reminder_days: u32,
    #[serde(default = "default_reminder_time")]
    pub reminder_time: String,
    #[serde(default = "default_sms_template")]
    pub sms_template: String,
    #[serde(default)]
    pub custom_message: Option<String>,
    #[serde(default)]
    pub total_members: usize,
    #[serde(default)]
    pub total_collected: Decimal,
    #[serde(default)]
    pub status: GroupStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub id_number: String,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub total_paid: Decimal,
    #[serde(default)]
    pub last_payment_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payment_history: Vec<PaymentRecord>,
}

/// A payment actually recorded against a member, as opposed to a synthesized ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: String,
    pub amount: Decimal,
    pub method: String,
    pub date: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderKind {
    Manual,
    Scheduled,
    Overdue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderLog {
    pub id: String,
    pub member_id: String,
    pub member_name: String,
    pub member_phone: String,
    pub group_id: String,
    pub group_name: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ReminderKind,
    pub status: DeliveryStatus,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReminderSettings {
    pub default_reminder_days: u32,
    pub default_reminder_time: String,
    pub max_retries: u32,
    /// Seconds between retry attempts of a failed scheduled send.
    pub retry_interval: u64,
    pub enable_auto_reminders: bool,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            default_reminder_days: DEFAULT_REMINDER_DAYS,
            default_reminder_time: DEFAULT_REMINDER_TIME.to_string(),
            max_retries: 3,
            retry_interval: 3600,
            enable_auto_reminders: true,
        }
    }
}

// ---- persisted documents ----

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GroupsDocument {
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub last_id: u64,
}

/// Members bucketed by the id of the group they belong to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct MembersDocument {
    pub buckets: BTreeMap<String, Vec<Member>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RemindersDocument {
    #[serde(default)]
    pub logs: Vec<ReminderLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSettingsDocument {
    #[serde(default)]
    pub global_settings: ReminderSettings,
    #[serde(default)]
    pub group_settings: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct AppData {
    pub groups: GroupsDocument,
    pub members: MembersDocument,
    pub reminders: RemindersDocument,
    pub settings: ReminderSettingsDocument,
}

// ---- requests ----

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: Option<String>,
    pub monthly_amount: Option<Decimal>,
    pub due_day: Option<i64>,
    pub description: Option<String>,
    pub reminder_days: Option<u32>,
    pub reminder_time: Option<String>,
    pub sms_template: Option<String>,
    pub custom_message: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateMemberRequest {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub id_number: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecordPaymentRequest {
    pub amount: Option<Decimal>,
    pub payment_method: Option<String>,
    pub payment_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRemindersRequest {
    #[serde(default)]
    pub member_ids: Vec<String>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReminderLogRequest {
    pub member_id: String,
    #[serde(default)]
    pub member_name: String,
    #[serde(default)]
    pub member_phone: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub group_name: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: Option<ReminderKind>,
    pub status: Option<DeliveryStatus>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ReminderLogQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GroupFilterQuery {
    pub group_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsRequest {
    pub group_id: Option<String>,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

// ---- responses ----

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            id: None,
            count: None,
            total: None,
            message: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: String,
    pub member_id: String,
    pub member_name: String,
    pub group_id: String,
    pub group_name: String,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    pub paid_date: Option<NaiveDate>,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    pub total_collected: Decimal,
    pub expected_this_month: Decimal,
    pub overdue_amount: Decimal,
    pub payment_rate: u32,
    pub paid_count: usize,
    pub pending_count: usize,
    pub overdue_count: usize,
    pub total_members: usize,
    pub members_with_payments: usize,
}

#[derive(Debug, Serialize)]
pub struct PaymentsResponse {
    pub payments: Vec<LedgerEntry>,
    pub summary: PaymentSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub member_id: String,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendFailure {
    pub member_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SendOutcome {
    pub sent: usize,
    pub failed: usize,
    pub total: usize,
    pub results: Vec<SendResult>,
    pub errors: Vec<SendFailure>,
}

fn default_reminder_days() -> u32 {
    DEFAULT_REMINDER_DAYS
}

fn default_reminder_time() -> String {
    DEFAULT_REMINDER_TIME.to_string()
}

fn default_sms_template() -> String {
    DEFAULT_SMS_TEMPLATE.to_string()
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Builds an opaque id of the form `<prefix>_<unix millis>_<9 base36 chars>`.
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{prefix}_{}_{suffix}", Utc::now().timestamp_millis())
}

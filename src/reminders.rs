//! Reminder messages: templates, the delivery gateway, the send pipeline and
//! the reminder log / settings documents.

use crate::config::GatewayKind;
use crate::errors::AppError;
use crate::ledger::{due_date_in_month, find_member};
use crate::models::{
    generate_id, AppData, DeliveryStatus, Group, Member, ReminderKind, ReminderLog,
    ReminderLogQuery, ReminderSettings, ReminderSettingsDocument, SendFailure, SendOutcome,
    SendResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, Months, NaiveDate, NaiveTime, Utc};
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

pub const DEFAULT_TEMPLATE: &str = "Hi {name}, please pay R{amount} for {group} by {dueDate}.";
pub const FRIENDLY_TEMPLATE: &str =
    "Hi {name}, a friendly reminder that your R{amount} payment for {group} is due on {dueDate}.";
pub const URGENT_TEMPLATE: &str =
    "URGENT: Hi {name}, please make your R{amount} payment for {group} immediately. Due: {dueDate}";

#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn send(&self, phone: &str, message: &str) -> DeliveryStatus;
}

/// Stand-in for an SMS provider: each send succeeds with a fixed probability.
pub struct SimulatedGateway {
    success_rate: f64,
}

impl SimulatedGateway {
    pub fn new(success_rate: f64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
        }
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(0.9)
    }
}

#[async_trait]
impl MessageGateway for SimulatedGateway {
    async fn send(&self, _phone: &str, _message: &str) -> DeliveryStatus {
        if rand::thread_rng().gen_bool(self.success_rate) {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        }
    }
}

pub struct FixedGateway(pub DeliveryStatus);

#[async_trait]
impl MessageGateway for FixedGateway {
    async fn send(&self, _phone: &str, _message: &str) -> DeliveryStatus {
        self.0
    }
}

/// Replays a fixed sequence of outcomes, then reports `sent` once exhausted.
/// Every delivery attempt is recorded.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<DeliveryStatus>>,
    deliveries: Mutex<Vec<(String, String)>>,
}

impl ScriptedGateway {
    pub fn new(script: impl IntoIterator<Item = DeliveryStatus>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            deliveries: Mutex::new(Vec::new()),
        }
    }

    pub fn deliveries(&self) -> Vec<(String, String)> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageGateway for ScriptedGateway {
    async fn send(&self, phone: &str, message: &str) -> DeliveryStatus {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((phone.to_string(), message.to_string()));
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(DeliveryStatus::Sent)
    }
}

pub fn build_gateway(kind: GatewayKind) -> Arc<dyn MessageGateway> {
    match kind {
        GatewayKind::Simulated => Arc::new(SimulatedGateway::default()),
        GatewayKind::AlwaysSent => Arc::new(FixedGateway(DeliveryStatus::Sent)),
        GatewayKind::AlwaysFailed => Arc::new(FixedGateway(DeliveryStatus::Failed)),
    }
}

pub fn template_body(template_id: &str) -> Option<&'static str> {
    match template_id {
        "default" => Some(DEFAULT_TEMPLATE),
        "friendly" => Some(FRIENDLY_TEMPLATE),
        "urgent" => Some(URGENT_TEMPLATE),
        _ => None,
    }
}

/// Picks the text to send: an explicit override, then the group's custom
/// message when its template is `custom`, then the named built-in template.
pub fn message_for(group: &Group, override_text: Option<&str>) -> String {
    if let Some(text) = override_text.map(str::trim).filter(|text| !text.is_empty()) {
        return text.to_string();
    }
    if group.sms_template == "custom" {
        if let Some(custom) = group
            .custom_message
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
        {
            return custom.to_string();
        }
    }
    template_body(&group.sms_template)
        .unwrap_or(DEFAULT_TEMPLATE)
        .to_string()
}

pub fn render_message(template: &str, member: &Member, group: &Group) -> String {
    template
        .replace("{name}", &member.name)
        .replace(
            "{amount}",
            &group.monthly_amount.round_dp(2).normalize().to_string(),
        )
        .replace("{group}", &group.name)
        .replace("{dueDate}", &ordinal(group.due_day))
}

pub fn ordinal(day: u32) -> String {
    let suffix = match (day % 10, day % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{day}{suffix}")
}

/// A member resolved together with the group it belongs to.
#[derive(Debug, Clone)]
pub struct ReminderTarget {
    pub member: Member,
    pub group: Group,
}

/// One message ready to go out.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub target: ReminderTarget,
    pub kind: ReminderKind,
    pub message: String,
}

/// Resolves each id in request order; ids that match no member, or whose
/// bucket has no group record, resolve to a failure entry.
pub fn resolve_targets(
    data: &AppData,
    member_ids: &[String],
) -> Vec<Result<ReminderTarget, SendFailure>> {
    member_ids
        .iter()
        .map(|member_id| {
            let (group_id, member) = find_member(&data.members, member_id).ok_or_else(|| {
                SendFailure {
                    member_id: member_id.clone(),
                    error: "Member or group not found".to_string(),
                }
            })?;
            let group = data
                .groups
                .groups
                .iter()
                .find(|group| group.id == group_id)
                .ok_or_else(|| SendFailure {
                    member_id: member_id.clone(),
                    error: "Member or group not found".to_string(),
                })?;
            Ok(ReminderTarget {
                member: member.clone(),
                group: group.clone(),
            })
        })
        .collect()
}

pub async fn dispatch(
    gateway: &dyn MessageGateway,
    outgoing: Dispatch,
    now: DateTime<Utc>,
) -> ReminderLog {
    let Dispatch {
        target,
        kind,
        message,
    } = outgoing;
    let status = gateway.send(&target.member.phone, &message).await;
    if status == DeliveryStatus::Failed {
        warn!(member_id = %target.member.id, "reminder delivery failed");
    }

    ReminderLog {
        id: generate_id("reminder"),
        member_id: target.member.id,
        member_name: target.member.name,
        member_phone: target.member.phone,
        group_id: target.group.id,
        group_name: target.group.name,
        message,
        kind,
        status,
        sent_at: now,
    }
}

/// Sends a manual reminder to every resolved target. Failures never abort
/// the batch; every attempted send yields a log entry.
pub async fn send_manual(
    gateway: &dyn MessageGateway,
    targets: Vec<Result<ReminderTarget, SendFailure>>,
    override_text: Option<&str>,
    now: DateTime<Utc>,
) -> (SendOutcome, Vec<ReminderLog>) {
    let mut outcome = SendOutcome {
        total: targets.len(),
        ..Default::default()
    };
    let mut logs = Vec::new();

    for target in targets {
        let target = match target {
            Ok(target) => target,
            Err(failure) => {
                outcome.errors.push(failure);
                continue;
            }
        };
        let template = message_for(&target.group, override_text);
        let message = render_message(&template, &target.member, &target.group);
        let log = dispatch(
            gateway,
            Dispatch {
                target,
                kind: ReminderKind::Manual,
                message,
            },
            now,
        )
        .await;

        match log.status {
            DeliveryStatus::Sent => outcome.results.push(SendResult {
                member_id: log.member_id.clone(),
                status: DeliveryStatus::Sent,
            }),
            DeliveryStatus::Failed => outcome.errors.push(SendFailure {
                member_id: log.member_id.clone(),
                error: "SMS failed to send".to_string(),
            }),
        }
        logs.push(log);
    }

    outcome.sent = outcome.results.len();
    outcome.failed = outcome.errors.len();
    info!(sent = outcome.sent, failed = outcome.failed, "manual reminders processed");
    (outcome, logs)
}

/// Applies the `status`, `type` and `days` filters and orders newest first.
/// `all` or an absent value disables a filter.
pub fn filter_logs(
    logs: &[ReminderLog],
    query: &ReminderLogQuery,
    now: DateTime<Utc>,
) -> Result<Vec<ReminderLog>, AppError> {
    let status = active_filter(query.status.as_deref());
    let kind = active_filter(query.kind.as_deref());
    let cutoff = query
        .days
        .map(|days| {
            Duration::try_days(days)
                .and_then(|window| now.checked_sub_signed(window))
                .ok_or_else(|| AppError::validation(format!("Invalid days filter: {days}")))
        })
        .transpose()?;

    let mut filtered: Vec<ReminderLog> = logs
        .iter()
        .filter(|log| status.is_none_or(|wanted| status_name(log.status) == wanted))
        .filter(|log| kind.is_none_or(|wanted| kind_name(log.kind) == wanted))
        .filter(|log| cutoff.is_none_or(|cutoff| log.sent_at >= cutoff))
        .cloned()
        .collect();
    filtered.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
    Ok(filtered)
}

/// `None` for an absent, blank or `all` filter value.
pub fn active_filter(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty() && *value != "all")
}

pub fn status_name(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Sent => "sent",
        DeliveryStatus::Failed => "failed",
    }
}

pub fn kind_name(kind: ReminderKind) -> &'static str {
    match kind {
        ReminderKind::Manual => "manual",
        ReminderKind::Scheduled => "scheduled",
        ReminderKind::Overdue => "overdue",
    }
}

/// Global settings overlaid with the group's overrides, if any.
pub fn effective_settings(
    doc: &ReminderSettingsDocument,
    group_id: Option<&str>,
) -> Result<ReminderSettings, AppError> {
    let overrides = group_id.and_then(|id| doc.group_settings.get(id));
    let Some(overrides) = overrides else {
        return Ok(doc.global_settings.clone());
    };

    let mut merged = settings_object(&doc.global_settings)?;
    merged.extend(overrides.clone());
    serde_json::from_value(Value::Object(merged))
        .map_err(|err| AppError::validation(format!("Invalid reminder settings: {err}")))
}

/// Shallow-merges `patch` into the group's overrides, or into the global
/// settings when no group is given.
pub fn merge_settings(
    doc: &mut ReminderSettingsDocument,
    group_id: Option<&str>,
    patch: Map<String, Value>,
) -> Result<(), AppError> {
    match group_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(group_id) => {
            doc.group_settings
                .entry(group_id.to_string())
                .or_default()
                .extend(patch);
            effective_settings(doc, Some(group_id))?;
        }
        None => {
            let mut merged = settings_object(&doc.global_settings)?;
            merged.extend(patch);
            doc.global_settings = serde_json::from_value(Value::Object(merged))
                .map_err(|err| AppError::validation(format!("Invalid reminder settings: {err}")))?;
        }
    }
    Ok(())
}

fn settings_object(settings: &ReminderSettings) -> Result<Map<String, Value>, AppError> {
    match serde_json::to_value(settings)? {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::internal("reminder settings did not serialize to an object")),
    }
}

/// Due date whose scheduled reminder falls on `today`, if any.
///
/// A reminder can land in the month before its due date when `reminderDays`
/// reaches back past the 1st, so the neighbouring months are checked too.
pub fn scheduled_due_date(group: &Group, today: NaiveDate) -> Option<NaiveDate> {
    let lead = Duration::days(i64::from(group.reminder_days));
    [
        today.checked_sub_months(Months::new(1)),
        Some(today),
        today.checked_add_months(Months::new(1)),
    ]
    .into_iter()
    .flatten()
    .map(|anchor| due_date_in_month(anchor, group.due_day))
    .find(|due| due.checked_sub_signed(lead) == Some(today))
}

/// Local time of day from which the group's automatic reminders go out. The
/// group's `reminderTime` wins over the settings default; when neither
/// parses there is no gate.
pub fn send_time(group: &Group, settings: &ReminderSettings) -> NaiveTime {
    [&group.reminder_time, &settings.default_reminder_time]
        .into_iter()
        .find_map(|raw| NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok())
        .unwrap_or(NaiveTime::MIN)
}

/// Calendar day of a timestamp in local time.
pub fn local_day(timestamp: DateTime<Utc>) -> NaiveDate {
    timestamp.with_timezone(&Local).date_naive()
}

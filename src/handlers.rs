use crate::errors::{AppError, JsonBody, QueryParams};
use crate::ledger::{self, parse_payment_date, summarize, synthesize_all, PaymentInput};
use crate::models::{
    generate_id, ApiResponse, AppData, CreateGroupRequest, CreateMemberRequest,
    CreateReminderLogRequest, DeliveryStatus, Group, GroupFilterQuery, GroupsDocument, Member,
    MembersDocument, PaymentRecord, PaymentStatus, PaymentsResponse, RecordPaymentRequest,
    ReminderKind, ReminderLog, ReminderLogQuery, SendOutcome, SendRemindersRequest,
    UpdateSettingsRequest, DEFAULT_PAYMENT_METHOD,
};
use crate::reminders::{
    active_filter, effective_settings, filter_logs, merge_settings, resolve_targets, send_manual,
};
use crate::state::AppState;
use crate::stats::{build_report, group_stats, GroupStats, Report};
use crate::storage::{persist_groups, persist_members, persist_reminders, persist_settings};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{Local, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;
type Created<T> = Result<(StatusCode, Json<ApiResponse<T>>), AppError>;

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    deleted: usize,
}

pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

// ---- groups ----

pub async fn list_groups(State(state): State<AppState>) -> ApiResult<Vec<Group>> {
    let data = state.data.lock().await;
    let groups = data.groups.groups.clone();
    let count = groups.len();
    Ok(Json(ApiResponse::ok(groups).with_count(count)))
}

pub async fn create_group(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CreateGroupRequest>,
) -> Created<Group> {
    let mut data = state.data.lock().await;
    let mut groups = data.groups.clone();
    let mut members = data.members.clone();

    let group = ledger::create_group(&mut groups, &mut members, request, Utc::now())?;
    commit_roster(&state, &mut data, groups, members).await?;

    info!(group_id = %group.id, name = %group.name, "group created");
    let id = group.id.clone();
    Ok((
        StatusCode::CREATED,
        Json(
            ApiResponse::ok(group)
                .with_id(id)
                .with_message("Group created successfully"),
        ),
    ))
}

pub async fn get_group_stats(State(state): State<AppState>) -> ApiResult<GroupStats> {
    let data = state.data.lock().await;
    Ok(Json(ApiResponse::ok(group_stats(&data.groups.groups)?)))
}

// ---- members ----

pub async fn list_members(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> ApiResult<Vec<Member>> {
    let data = state.data.lock().await;
    let members = data
        .members
        .buckets
        .get(&group_id)
        .cloned()
        .unwrap_or_default();
    let count = members.len();
    Ok(Json(ApiResponse::ok(members).with_count(count)))
}

pub async fn add_member(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    JsonBody(request): JsonBody<CreateMemberRequest>,
) -> Created<Member> {
    let mut data = state.data.lock().await;
    let mut groups = data.groups.clone();
    let mut members = data.members.clone();

    let member = ledger::add_member(&mut groups, &mut members, &group_id, request, Utc::now())?;
    commit_roster(&state, &mut data, groups, members).await?;

    info!(group_id = %group_id, member_id = %member.id, "member added");
    let id = member.id.clone();
    Ok((
        StatusCode::CREATED,
        Json(
            ApiResponse::ok(member)
                .with_id(id)
                .with_message("Member added successfully"),
        ),
    ))
}

pub async fn clear_members(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> ApiResult<Deleted> {
    let mut data = state.data.lock().await;
    let mut groups = data.groups.clone();
    let mut members = data.members.clone();

    let deleted = ledger::clear_members(&mut groups, &mut members, &group_id);
    if deleted > 0 {
        commit_roster(&state, &mut data, groups, members).await?;
        info!(group_id = %group_id, deleted, "group members cleared");
    }

    Ok(Json(
        ApiResponse::ok(Deleted { deleted }).with_message("All members deleted successfully"),
    ))
}

pub async fn delete_member(
    State(state): State<AppState>,
    Path(member_id): Path<String>,
) -> ApiResult<Member> {
    let mut data = state.data.lock().await;
    let mut groups = data.groups.clone();
    let mut members = data.members.clone();

    let (group_id, removed) = ledger::remove_member(&mut groups, &mut members, &member_id)?;
    commit_roster(&state, &mut data, groups, members).await?;

    info!(group_id = %group_id, member_id = %member_id, "member deleted");
    Ok(Json(
        ApiResponse::ok(removed).with_message("Member deleted successfully"),
    ))
}

// ---- payments ----

pub async fn record_payment(
    State(state): State<AppState>,
    Path(member_id): Path<String>,
    JsonBody(request): JsonBody<RecordPaymentRequest>,
) -> ApiResult<Member> {
    let now = Utc::now();
    let amount = request
        .amount
        .ok_or_else(|| AppError::validation("Valid amount is required"))?;
    let date = match request
        .payment_date
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
    {
        Some(raw) => parse_payment_date(raw)?,
        None => now,
    };
    let method = request
        .payment_method
        .map(|method| method.trim().to_string())
        .filter(|method| !method.is_empty())
        .unwrap_or_else(|| DEFAULT_PAYMENT_METHOD.to_string());

    let mut data = state.data.lock().await;
    let mut groups = data.groups.clone();
    let mut members = data.members.clone();

    let member = ledger::record_payment(
        &mut groups,
        &mut members,
        &member_id,
        PaymentInput {
            amount,
            method,
            date,
        },
        now,
    )?;
    commit_roster(&state, &mut data, groups, members).await?;

    info!(member_id = %member_id, amount = %amount, "payment recorded");
    Ok(Json(
        ApiResponse::ok(member).with_message("Payment recorded successfully"),
    ))
}

pub async fn payment_history(
    State(state): State<AppState>,
    Path(member_id): Path<String>,
) -> ApiResult<Vec<PaymentRecord>> {
    let data = state.data.lock().await;
    let (_, member) = ledger::find_member(&data.members, &member_id)
        .ok_or_else(|| AppError::not_found("Member not found"))?;
    let history = member.payment_history.clone();
    let count = history.len();
    Ok(Json(ApiResponse::ok(history).with_count(count)))
}

/// Synthesized ledger for one group or all of them. The summary covers the
/// selected groups; the `status` filter only narrows the returned entries.
pub async fn list_payments(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<GroupFilterQuery>,
) -> ApiResult<PaymentsResponse> {
    let wanted_status = active_filter(query.status.as_deref())
        .map(parse_status)
        .transpose()?;
    let wanted_group = active_filter(query.group_id.as_deref());
    let as_of = Local::now().date_naive();

    let data = state.data.lock().await;
    let groups: Vec<Group> = data
        .groups
        .groups
        .iter()
        .filter(|group| wanted_group.is_none_or(|id| group.id == id))
        .cloned()
        .collect();

    let ledger = synthesize_all(&groups, &data.members, as_of)?;
    let total_members = groups
        .iter()
        .map(|group| data.members.buckets.get(&group.id).map_or(0, Vec::len))
        .sum();
    let summary = summarize(&ledger, total_members, &groups)?;

    let payments: Vec<_> = ledger
        .into_iter()
        .filter(|entry| wanted_status.is_none_or(|status| entry.status == status))
        .collect();
    let count = payments.len();

    Ok(Json(
        ApiResponse::ok(PaymentsResponse { payments, summary }).with_count(count),
    ))
}

pub async fn get_report(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<GroupFilterQuery>,
) -> ApiResult<Report> {
    let data = state.data.lock().await;
    let report = build_report(
        &data.groups.groups,
        &data.members,
        query.group_id.as_deref(),
    )?;
    Ok(Json(ApiResponse::ok(report)))
}

// ---- reminders ----

pub async fn list_reminder_logs(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<ReminderLogQuery>,
) -> ApiResult<Vec<ReminderLog>> {
    let data = state.data.lock().await;
    let logs = filter_logs(&data.reminders.logs, &query, Utc::now())?;
    let count = logs.len();
    let total = data.reminders.logs.len();
    Ok(Json(ApiResponse::ok(logs).with_count(count).with_total(total)))
}

pub async fn create_reminder_log(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CreateReminderLogRequest>,
) -> Created<ReminderLog> {
    if request.member_id.trim().is_empty() || request.message.trim().is_empty() {
        return Err(AppError::validation("Member ID and message are required"));
    }

    let log = ReminderLog {
        id: generate_id("reminder"),
        member_id: request.member_id,
        member_name: request.member_name,
        member_phone: request.member_phone,
        group_id: request.group_id,
        group_name: request.group_name,
        message: request.message,
        kind: request.kind.unwrap_or(ReminderKind::Manual),
        status: request.status.unwrap_or(DeliveryStatus::Sent),
        sent_at: request.sent_at.unwrap_or_else(Utc::now),
    };

    let mut data = state.data.lock().await;
    let mut reminders = data.reminders.clone();
    reminders.logs.push(log.clone());
    persist_reminders(&state.files, &reminders).await?;
    data.reminders = reminders;

    let id = log.id.clone();
    Ok((
        StatusCode::CREATED,
        Json(
            ApiResponse::ok(log)
                .with_id(id)
                .with_message("Reminder log saved"),
        ),
    ))
}

/// Targets are resolved under the lock, messages go out without it, and the
/// resulting logs are appended in a second short critical section.
pub async fn send_reminders(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<SendRemindersRequest>,
) -> ApiResult<SendOutcome> {
    if request.member_ids.is_empty() {
        return Err(AppError::validation("Member IDs are required"));
    }

    let targets = {
        let data = state.data.lock().await;
        resolve_targets(&data, &request.member_ids)
    };

    let (outcome, logs) = send_manual(
        state.gateway.as_ref(),
        targets,
        request.message.as_deref(),
        Utc::now(),
    )
    .await;

    if !logs.is_empty() {
        let mut data = state.data.lock().await;
        let mut reminders = data.reminders.clone();
        reminders.logs.extend(logs);
        persist_reminders(&state.files, &reminders).await?;
        data.reminders = reminders;
    }

    let message = format!(
        "Sent {} reminder(s), {} failed",
        outcome.sent, outcome.failed
    );
    Ok(Json(ApiResponse::ok(outcome).with_message(message)))
}

/// The whole settings document, or one group's effective settings.
pub async fn get_reminder_settings(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<GroupFilterQuery>,
) -> ApiResult<Value> {
    let data = state.data.lock().await;
    let body = match active_filter(query.group_id.as_deref()) {
        Some(group_id) => serde_json::to_value(effective_settings(&data.settings, Some(group_id))?)?,
        None => serde_json::to_value(&data.settings)?,
    };
    Ok(Json(ApiResponse::ok(body)))
}

pub async fn update_reminder_settings(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<UpdateSettingsRequest>,
) -> ApiResult<Value> {
    if request.settings.is_empty() {
        return Err(AppError::validation("Settings are required"));
    }
    let group_id = active_filter(request.group_id.as_deref());

    let mut data = state.data.lock().await;
    let mut settings = data.settings.clone();
    merge_settings(&mut settings, group_id, request.settings)?;
    persist_settings(&state.files, &settings).await?;

    let effective = effective_settings(&settings, group_id)?;
    data.settings = settings;

    info!(group_id = group_id.unwrap_or("global"), "reminder settings updated");
    Ok(Json(
        ApiResponse::ok(serde_json::to_value(effective)?)
            .with_message("Settings saved successfully"),
    ))
}

fn parse_status(raw: &str) -> Result<PaymentStatus, AppError> {
    match raw {
        "paid" => Ok(PaymentStatus::Paid),
        "pending" => Ok(PaymentStatus::Pending),
        "overdue" => Ok(PaymentStatus::Overdue),
        other => Err(AppError::validation(format!("Unknown payment status: {other}"))),
    }
}

/// Persists the staged roster documents, then swaps them into memory.
async fn commit_roster(
    state: &AppState,
    data: &mut AppData,
    groups: GroupsDocument,
    members: MembersDocument,
) -> Result<(), AppError> {
    persist_members(&state.files, &members).await?;
    persist_groups(&state.files, &groups).await?;
    data.groups = groups;
    data.members = members;
    Ok(())
}

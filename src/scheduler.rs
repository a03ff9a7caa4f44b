//! Background job: rolls paid members back to pending at the start of a new
//! billing month and sends the automatic scheduled / overdue reminders.

use crate::errors::AppError;
use crate::ledger::{derive_member_status, due_date_in_month};
use crate::models::{
    AppData, DeliveryStatus, Group, GroupStatus, Member, MembersDocument, PaymentStatus,
    ReminderKind, ReminderLog, ReminderSettings,
};
use crate::reminders::{
    dispatch, effective_settings, local_day, message_for, render_message, scheduled_due_date,
    send_time, Dispatch, ReminderTarget, URGENT_TEMPLATE,
};
use crate::state::AppState;
use crate::storage::{persist_members, persist_reminders};
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, Utc};
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub reset: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Paid members whose last payment falls in an earlier calendar month than
/// `today` go back to pending. Running it twice in a month changes nothing.
pub fn reset_billing_cycle(
    members: &mut MembersDocument,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> usize {
    let current = (today.year(), today.month());
    let mut reset = 0;

    for member in members.buckets.values_mut().flatten() {
        let stale = member.payment_status == PaymentStatus::Paid
            && member.last_payment_date.is_some_and(|paid| {
                let paid = paid.date_naive();
                (paid.year(), paid.month()) < current
            });
        if stale {
            member.payment_status = PaymentStatus::Pending;
            member.updated_at = now;
            reset += 1;
        }
    }

    reset
}

/// Works out which automatic reminders are due at local wall-clock time
/// `local_now`. Nothing goes out for a group before its send time.
pub fn plan_reminders(
    data: &AppData,
    local_now: NaiveDateTime,
    now: DateTime<Utc>,
) -> Result<Vec<Dispatch>, AppError> {
    let today = local_now.date();
    let mut planned = Vec::new();

    for group in &data.groups.groups {
        if group.status != GroupStatus::Active {
            continue;
        }
        let settings = effective_settings(&data.settings, Some(&group.id))?;
        if !settings.enable_auto_reminders || local_now.time() < send_time(group, &settings) {
            continue;
        }
        let Some(bucket) = data.members.buckets.get(&group.id) else {
            continue;
        };

        for member in bucket {
            let Some(kind) = reminder_kind(member, group, today) else {
                continue;
            };
            if !should_attempt(&data.reminders.logs, &member.id, kind, &settings, today, now) {
                continue;
            }

            let template = match kind {
                ReminderKind::Overdue => URGENT_TEMPLATE.to_string(),
                _ => message_for(group, None),
            };
            planned.push(Dispatch {
                message: render_message(&template, member, group),
                target: ReminderTarget {
                    member: member.clone(),
                    group: group.clone(),
                },
                kind,
            });
        }
    }

    Ok(planned)
}

/// Escalation starts on the due day itself for anyone still unpaid. A
/// scheduled reminder goes to members who have not yet settled the cycle
/// whose reminder day is today.
fn reminder_kind(member: &Member, group: &Group, today: NaiveDate) -> Option<ReminderKind> {
    let status = derive_member_status(member, group, today);
    let due_now = due_date_in_month(today, group.due_day);
    if status == PaymentStatus::Overdue || (status == PaymentStatus::Pending && today >= due_now) {
        return Some(ReminderKind::Overdue);
    }

    let due = scheduled_due_date(group, today)?;
    let settled = if month_of(due) == month_of(today) {
        status == PaymentStatus::Paid
    } else {
        member
            .last_payment_date
            .is_some_and(|paid| month_of(paid.date_naive()) >= month_of(due))
    };
    (!settled).then_some(ReminderKind::Scheduled)
}

fn month_of(date: NaiveDate) -> (i32, u32) {
    (date.year(), date.month())
}

/// One successful send per member and kind per day. Failed sends are retried
/// after `retryInterval` seconds until the day's attempts reach `maxRetries`.
fn should_attempt(
    logs: &[ReminderLog],
    member_id: &str,
    kind: ReminderKind,
    settings: &ReminderSettings,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> bool {
    let attempts: Vec<&ReminderLog> = logs
        .iter()
        .filter(|log| log.member_id == member_id && log.kind == kind)
        .filter(|log| local_day(log.sent_at) == today)
        .collect();

    if attempts.iter().any(|log| log.status == DeliveryStatus::Sent) {
        return false;
    }
    if attempts.len() >= settings.max_retries as usize {
        return false;
    }

    let retry_after = Duration::seconds(i64::try_from(settings.retry_interval).unwrap_or(i64::MAX));
    attempts
        .iter()
        .map(|log| log.sent_at)
        .max()
        .is_none_or(|last| now - last >= retry_after)
}

pub async fn run_daily_jobs(state: &AppState, now: DateTime<Utc>) -> Result<JobReport, AppError> {
    let local_now = now.with_timezone(&Local).naive_local();
    let today = local_now.date();
    let mut report = JobReport::default();

    let planned = {
        let mut data = state.data.lock().await;

        let mut members = data.members.clone();
        report.reset = reset_billing_cycle(&mut members, today, now);
        if report.reset > 0 {
            persist_members(&state.files, &members).await?;
            data.members = members;
            info!(reset = report.reset, "billing cycle rolled over");
        }

        plan_reminders(&data, local_now, now)?
    };

    if planned.is_empty() {
        return Ok(report);
    }

    let mut logs = Vec::with_capacity(planned.len());
    for outgoing in planned {
        let log = dispatch(state.gateway.as_ref(), outgoing, now).await;
        match log.status {
            DeliveryStatus::Sent => report.sent += 1,
            DeliveryStatus::Failed => report.failed += 1,
        }
        logs.push(log);
    }

    let mut data = state.data.lock().await;
    let mut reminders = data.reminders.clone();
    reminders.logs.extend(logs);
    persist_reminders(&state.files, &reminders).await?;
    data.reminders = reminders;

    info!(
        sent = report.sent,
        failed = report.failed,
        "automatic reminders processed"
    );
    Ok(report)
}

pub fn spawn(state: AppState, period: StdDuration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match run_daily_jobs(&state, Utc::now()).await {
                Ok(report) => debug!(?report, "reminder job finished"),
                Err(err) => error!("reminder job failed: {err}"),
            }
        }
    })
}

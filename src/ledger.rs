//! Member status, synthesized payment ledger and the bookkeeping that keeps
//! group totals in step with their member buckets.

use crate::errors::AppError;
use crate::models::{
    generate_id, CreateGroupRequest, CreateMemberRequest, Group, GroupStatus, GroupsDocument,
    LedgerEntry, Member, MembersDocument, PaymentRecord, PaymentStatus, PaymentSummary,
    DEFAULT_PAYMENT_METHOD, DEFAULT_REMINDER_DAYS, DEFAULT_REMINDER_TIME, DEFAULT_SMS_TEMPLATE,
};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::warn;

/// Due date of the month containing `anchor`.
///
/// Day N is "first of month + (N - 1) days", so a due day past the end of a
/// short month rolls into the following month instead of failing.
pub fn due_date_in_month(anchor: NaiveDate, due_day: u32) -> NaiveDate {
    month_start(anchor) + Duration::days(i64::from(due_day) - 1)
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.day0()))
}

pub fn derive_member_status(member: &Member, group: &Group, as_of: NaiveDate) -> PaymentStatus {
    match member.payment_status {
        PaymentStatus::Paid => PaymentStatus::Paid,
        PaymentStatus::Pending if as_of > due_date_in_month(as_of, group.due_day) => {
            PaymentStatus::Overdue
        }
        other => other,
    }
}

/// Whole months covered by `total_paid` at `monthly_amount` per month.
pub fn months_paid(total_paid: Decimal, monthly_amount: Decimal) -> Result<u32, AppError> {
    if monthly_amount <= Decimal::ZERO {
        return Err(AppError::validation(
            "Monthly amount must be greater than zero",
        ));
    }
    if total_paid <= Decimal::ZERO {
        return Ok(0);
    }

    (total_paid / monthly_amount)
        .floor()
        .to_u32()
        .ok_or_else(|| AppError::validation("Total paid is out of range"))
}

/// One entry for the current period plus one `paid` entry per whole month
/// covered by each member's `totalPaid`, counting back from `as_of`.
pub fn synthesize_payment_ledger(
    group: &Group,
    members: &[Member],
    as_of: NaiveDate,
) -> Result<Vec<LedgerEntry>, AppError> {
    let mut entries = Vec::new();
    let current_start = month_start(as_of);

    for member in members {
        let months = months_paid(member.total_paid, group.monthly_amount)?;
        if current_start.checked_sub_months(Months::new(months)).is_none() {
            return Err(AppError::validation("Total paid is out of range"));
        }
        let status = derive_member_status(member, group, as_of);
        let due_date = due_date_in_month(as_of, group.due_day);

        entries.push(LedgerEntry {
            id: ledger_entry_id(&member.id, current_start),
            member_id: member.id.clone(),
            member_name: member.name.clone(),
            group_id: group.id.clone(),
            group_name: group.name.clone(),
            amount: group.monthly_amount,
            due_date,
            paid_date: member.last_payment_date.map(|date| date.date_naive()),
            status,
            payment_method: (status == PaymentStatus::Paid).then(|| last_method(member)),
            phone: member.phone.clone(),
            email: member.email.clone(),
        });

        for back in 1..=months {
            let past_start = current_start
                .checked_sub_months(Months::new(back))
                .ok_or_else(|| AppError::internal("ledger date out of range"))?;
            let past_due = due_date_in_month(past_start, group.due_day);

            entries.push(LedgerEntry {
                id: ledger_entry_id(&member.id, past_start),
                member_id: member.id.clone(),
                member_name: member.name.clone(),
                group_id: group.id.clone(),
                group_name: group.name.clone(),
                amount: group.monthly_amount,
                due_date: past_due,
                paid_date: Some(past_due),
                status: PaymentStatus::Paid,
                payment_method: Some(DEFAULT_PAYMENT_METHOD.to_string()),
                phone: member.phone.clone(),
                email: member.email.clone(),
            });
        }
    }

    Ok(entries)
}

/// Ledger across every group, in group order.
pub fn synthesize_all(
    groups: &[Group],
    members: &MembersDocument,
    as_of: NaiveDate,
) -> Result<Vec<LedgerEntry>, AppError> {
    let mut entries = Vec::new();
    for group in groups {
        let bucket = members
            .buckets
            .get(&group.id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        entries.extend(synthesize_payment_ledger(group, bucket, as_of)?);
    }
    Ok(entries)
}

pub fn summarize(
    payments: &[LedgerEntry],
    total_members: usize,
    groups: &[Group],
) -> Result<PaymentSummary, AppError> {
    let sum_where = |status: PaymentStatus| {
        checked_total(
            payments
                .iter()
                .filter(|entry| entry.status == status)
                .map(|entry| entry.amount),
        )
    };
    let count_where =
        |status: PaymentStatus| payments.iter().filter(|entry| entry.status == status).count();

    let paid_count = count_where(PaymentStatus::Paid);
    let expected = groups
        .iter()
        .map(|group| checked_product(group.monthly_amount, Decimal::from(group.total_members)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PaymentSummary {
        total_collected: sum_where(PaymentStatus::Paid)?,
        expected_this_month: checked_total(expected)?,
        overdue_amount: sum_where(PaymentStatus::Overdue)?,
        payment_rate: percentage(paid_count, payments.len()),
        paid_count,
        pending_count: count_where(PaymentStatus::Pending),
        overdue_count: count_where(PaymentStatus::Overdue),
        total_members,
        members_with_payments: payments
            .iter()
            .map(|entry| entry.member_id.as_str())
            .collect::<HashSet<_>>()
            .len(),
    })
}

/// Sum of money values, failing instead of overflowing `Decimal`.
pub fn checked_total(values: impl IntoIterator<Item = Decimal>) -> Result<Decimal, AppError> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |total, value| total.checked_add(value))
        .ok_or_else(amount_out_of_range)
}

pub fn checked_product(left: Decimal, right: Decimal) -> Result<Decimal, AppError> {
    left.checked_mul(right).ok_or_else(amount_out_of_range)
}

fn amount_out_of_range() -> AppError {
    AppError::validation("Amount is out of range")
}

/// `round(part / whole * 100)`, defined as 0 for an empty whole.
pub fn percentage(part: usize, whole: usize) -> u32 {
    if whole == 0 {
        return 0;
    }
    (part as f64 / whole as f64 * 100.0).round() as u32
}

pub struct PaymentInput {
    pub amount: Decimal,
    pub method: String,
    pub date: DateTime<Utc>,
}

/// Applies a payment to the member and its owning group.
///
/// Validation happens before anything is touched, so a rejected payment
/// leaves both documents exactly as they were.
pub fn record_payment(
    groups: &mut GroupsDocument,
    members: &mut MembersDocument,
    member_id: &str,
    payment: PaymentInput,
    now: DateTime<Utc>,
) -> Result<Member, AppError> {
    if payment.amount <= Decimal::ZERO {
        return Err(AppError::validation("Valid amount is required"));
    }

    let (group_id, index) = locate_member(members, member_id)
        .ok_or_else(|| AppError::not_found("Member not found"))?;

    let group = groups.groups.iter_mut().find(|group| group.id == group_id);
    let collected = group
        .as_ref()
        .map(|group| checked_total([group.total_collected, payment.amount]))
        .transpose()?;

    let member = &mut members
        .buckets
        .get_mut(&group_id)
        .ok_or_else(|| AppError::not_found("Member not found"))?[index];
    let total_paid = checked_total([member.total_paid, payment.amount])?;

    member.total_paid = total_paid;
    member.payment_status = PaymentStatus::Paid;
    member.last_payment_date = Some(payment.date);
    member.updated_at = now;
    member.payment_history.push(PaymentRecord {
        id: generate_id("payment"),
        amount: payment.amount,
        method: payment.method,
        date: payment.date,
        recorded_at: now,
    });
    let updated = member.clone();

    match group.zip(collected) {
        Some((group, collected)) => {
            group.total_collected = collected;
            group.updated_at = now;
        }
        None => warn!(group_id = %group_id, "payment recorded for member of unknown group"),
    }

    Ok(updated)
}

/// Sets `totalMembers` to the live size of the group's bucket. Returns the
/// new count, or `None` when no such group exists.
pub fn reconcile_group_member_count(
    groups: &mut GroupsDocument,
    members: &MembersDocument,
    group_id: &str,
) -> Option<usize> {
    let group = groups.groups.iter_mut().find(|group| group.id == group_id)?;
    group.total_members = members.buckets.get(group_id).map_or(0, Vec::len);
    Some(group.total_members)
}

pub fn locate_member(members: &MembersDocument, member_id: &str) -> Option<(String, usize)> {
    members.buckets.iter().find_map(|(group_id, bucket)| {
        bucket
            .iter()
            .position(|member| member.id == member_id)
            .map(|index| (group_id.clone(), index))
    })
}

pub fn find_member<'a>(members: &'a MembersDocument, member_id: &str) -> Option<(&'a str, &'a Member)> {
    members.buckets.iter().find_map(|(group_id, bucket)| {
        bucket
            .iter()
            .find(|member| member.id == member_id)
            .map(|member| (group_id.as_str(), member))
    })
}

pub fn create_group(
    groups: &mut GroupsDocument,
    members: &mut MembersDocument,
    request: CreateGroupRequest,
    now: DateTime<Utc>,
) -> Result<Group, AppError> {
    let name = request
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::validation("Group name is required"))?;
    let monthly_amount = request
        .monthly_amount
        .ok_or_else(|| AppError::validation("Monthly amount is required"))?;
    if monthly_amount <= Decimal::ZERO {
        return Err(AppError::validation("Monthly amount must be greater than zero"));
    }
    let due_day = request
        .due_day
        .ok_or_else(|| AppError::validation("Due day is required"))?;
    if !(1..=31).contains(&due_day) {
        return Err(AppError::validation("Due day must be between 1 and 31"));
    }

    let group = Group {
        id: generate_id("group"),
        name,
        monthly_amount,
        due_day: due_day as u32,
        description: request.description.unwrap_or_default(),
        reminder_days: request.reminder_days.unwrap_or(DEFAULT_REMINDER_DAYS),
        reminder_time: request
            .reminder_time
            .unwrap_or_else(|| DEFAULT_REMINDER_TIME.to_string()),
        sms_template: request
            .sms_template
            .unwrap_or_else(|| DEFAULT_SMS_TEMPLATE.to_string()),
        custom_message: request.custom_message,
        total_members: 0,
        total_collected: Decimal::ZERO,
        status: GroupStatus::Active,
        created_at: now,
        updated_at: now,
    };

    groups.groups.push(group.clone());
    groups.last_id += 1;
    members.buckets.entry(group.id.clone()).or_default();

    Ok(group)
}

pub fn add_member(
    groups: &mut GroupsDocument,
    members: &mut MembersDocument,
    group_id: &str,
    request: CreateMemberRequest,
    now: DateTime<Utc>,
) -> Result<Member, AppError> {
    let name = non_blank(request.name);
    let phone = non_blank(request.phone);
    let (Some(name), Some(phone)) = (name, phone) else {
        return Err(AppError::validation("Name and phone number are required"));
    };
    if !groups.groups.iter().any(|group| group.id == group_id) {
        return Err(AppError::not_found("Group not found"));
    }

    let member = Member {
        id: generate_id("member"),
        name,
        phone,
        email: request.email.unwrap_or_default(),
        id_number: request.id_number.unwrap_or_default(),
        payment_status: PaymentStatus::Pending,
        total_paid: Decimal::ZERO,
        last_payment_date: None,
        created_at: now,
        updated_at: now,
        payment_history: Vec::new(),
    };

    members
        .buckets
        .entry(group_id.to_string())
        .or_default()
        .push(member.clone());
    reconcile_group_member_count(groups, members, group_id);

    Ok(member)
}

/// Removes one member from whichever bucket holds it. Returns the owning group id.
pub fn remove_member(
    groups: &mut GroupsDocument,
    members: &mut MembersDocument,
    member_id: &str,
) -> Result<(String, Member), AppError> {
    let (group_id, index) = locate_member(members, member_id)
        .ok_or_else(|| AppError::not_found("Member not found"))?;
    let removed = members
        .buckets
        .get_mut(&group_id)
        .map(|bucket| bucket.remove(index))
        .ok_or_else(|| AppError::not_found("Member not found"))?;
    reconcile_group_member_count(groups, members, &group_id);

    Ok((group_id, removed))
}

/// Drops the whole bucket. Returns how many members were removed.
pub fn clear_members(
    groups: &mut GroupsDocument,
    members: &mut MembersDocument,
    group_id: &str,
) -> usize {
    let removed = members.buckets.remove(group_id).map_or(0, |bucket| bucket.len());
    reconcile_group_member_count(groups, members, group_id);
    removed
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (taken as midnight UTC).
pub fn parse_payment_date(raw: &str) -> Result<DateTime<Utc>, AppError> {
    let raw = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
        .map_err(|_| AppError::validation(format!("Invalid payment date: {raw}")))
}

fn ledger_entry_id(member_id: &str, period: NaiveDate) -> String {
    format!("payment_{member_id}_{}_{:02}", period.year(), period.month())
}

fn last_method(member: &Member) -> String {
    member
        .payment_history
        .last()
        .map(|record| record.method.clone())
        .unwrap_or_else(|| DEFAULT_PAYMENT_METHOD.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

use crate::errors::AppError;
use crate::ledger::{checked_product, checked_total, derive_member_status, percentage};
use crate::models::{Group, GroupStatus, MembersDocument, PaymentStatus};
use chrono::{Local, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::BTreeMap;

const NO_GROUP: &str = "N/A";

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub total_groups: usize,
    pub active_groups: usize,
    pub total_members: usize,
    pub total_collected: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPerformance {
    pub id: String,
    pub name: String,
    pub status: GroupStatus,
    pub monthly_amount: Decimal,
    pub member_count: usize,
    pub paid_members: usize,
    pub pending_members: usize,
    pub overdue_members: usize,
    pub total_collected: Decimal,
    pub collection_rate: u32,
    pub potential_revenue: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_groups: usize,
    pub active_groups: usize,
    pub inactive_groups: usize,
    pub total_members: usize,
    pub total_collected: Decimal,
    pub pending_amount: Decimal,
    pub collection_rate: u32,
    pub average_contribution: Decimal,
    pub total_potential: Decimal,
    pub best_performing_group: String,
    pub worst_performing_group: String,
    pub most_valuable_group: String,
    pub highest_collection_rate: u32,
    pub lowest_collection_rate: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub summary: ReportSummary,
    pub group_performance: Vec<GroupPerformance>,
    /// Recorded payments per method across the reported groups.
    pub payment_methods: BTreeMap<String, usize>,
}

/// Dashboard figures taken straight from the group records.
pub fn group_stats(groups: &[Group]) -> Result<GroupStats, AppError> {
    Ok(GroupStats {
        total_groups: groups.len(),
        active_groups: groups
            .iter()
            .filter(|group| group.status == GroupStatus::Active)
            .count(),
        total_members: groups.iter().map(|group| group.total_members).sum(),
        total_collected: checked_total(groups.iter().map(|group| group.total_collected))?,
    })
}

pub fn build_report(
    groups: &[Group],
    members: &MembersDocument,
    group_filter: Option<&str>,
) -> Result<Report, AppError> {
    build_report_at(Local::now().date_naive(), groups, members, group_filter)
}

/// Per-group collection performance, best collection rate first.
/// `group_filter` of `None` or `all` reports on every group.
pub fn build_report_at(
    as_of: NaiveDate,
    groups: &[Group],
    members: &MembersDocument,
    group_filter: Option<&str>,
) -> Result<Report, AppError> {
    let wanted = group_filter.filter(|id| !id.is_empty() && *id != "all");
    let selected: Vec<&Group> = groups
        .iter()
        .filter(|group| wanted.is_none_or(|id| group.id == id))
        .collect();

    let mut performance = Vec::with_capacity(selected.len());
    let mut payment_methods = BTreeMap::new();
    let mut pending_amount = Decimal::ZERO;
    let mut paid_total = 0usize;

    for group in &selected {
        let bucket = members
            .buckets
            .get(&group.id)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let (mut paid, mut pending, mut overdue) = (0usize, 0usize, 0usize);
        for member in bucket {
            match derive_member_status(member, group, as_of) {
                PaymentStatus::Paid => paid += 1,
                PaymentStatus::Pending => pending += 1,
                PaymentStatus::Overdue => overdue += 1,
            }
            for record in &member.payment_history {
                *payment_methods.entry(record.method.clone()).or_insert(0) += 1;
            }
        }

        let member_count = bucket.len();
        let unpaid = checked_product(Decimal::from(pending + overdue), group.monthly_amount)?;
        pending_amount = checked_total([pending_amount, unpaid])?;
        paid_total += paid;

        performance.push(GroupPerformance {
            id: group.id.clone(),
            name: group.name.clone(),
            status: group.status.clone(),
            monthly_amount: group.monthly_amount,
            member_count,
            paid_members: paid,
            pending_members: pending,
            overdue_members: overdue,
            total_collected: checked_total(bucket.iter().map(|member| member.total_paid))?,
            collection_rate: percentage(paid, member_count),
            potential_revenue: checked_product(
                checked_product(Decimal::from(member_count), group.monthly_amount)?,
                Decimal::from(12),
            )?,
        });
    }

    performance.sort_by(|a, b| b.collection_rate.cmp(&a.collection_rate));

    let total_members: usize = performance.iter().map(|group| group.member_count).sum();
    let total_collected = checked_total(performance.iter().map(|group| group.total_collected))?;
    let active_groups = selected
        .iter()
        .filter(|group| group.status == GroupStatus::Active)
        .count();

    let best = performance.first();
    let worst = performance.last();
    let most_valuable = performance
        .iter()
        .reduce(|top, group| if group.total_collected > top.total_collected { group } else { top });

    let summary = ReportSummary {
        total_groups: selected.len(),
        active_groups,
        inactive_groups: selected.len() - active_groups,
        total_members,
        total_collected,
        pending_amount,
        collection_rate: percentage(paid_total, total_members),
        average_contribution: if total_members == 0 {
            Decimal::ZERO
        } else {
            (total_collected / Decimal::from(total_members))
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        },
        total_potential: checked_total(performance.iter().map(|group| group.potential_revenue))?,
        best_performing_group: name_or_none(best),
        worst_performing_group: name_or_none(worst),
        most_valuable_group: name_or_none(most_valuable),
        highest_collection_rate: best.map_or(0, |group| group.collection_rate),
        lowest_collection_rate: worst.map_or(0, |group| group.collection_rate),
    };

    Ok(Report {
        summary,
        group_performance: performance,
        payment_methods,
    })
}

fn name_or_none(group: Option<&GroupPerformance>) -> String {
    group.map_or_else(|| NO_GROUP.to_string(), |group| group.name.clone())
}

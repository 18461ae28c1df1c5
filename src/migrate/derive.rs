use crate::dump::SqlValue;
use crate::lookup::{APPLICATION_STATUSES, HIGHEST_ROLE, LOWEST_TEAM_ROLE, ROLES};

/// Legacy `deals.status` codes that override the secondary status.
pub const LEGACY_STATUS_DRAFT: i64 = 0;
pub const LEGACY_STATUS_SETTLED: i64 = 2;
pub const LEGACY_STATUS_DECLINED: i64 = 3;

pub const DEFAULT_OPPORTUNITY_STATUS: &str = "opportunity";

/// LVR above this counts as a risk factor.
pub const HIGH_LVR_PERCENT: f64 = 80.0;

/// First match wins: settled (date + code), declined, draft, secondary code,
/// then `opportunity`.
pub fn opportunity_status(
    status: Option<i64>,
    settlement_date: Option<&str>,
    application_status: Option<&SqlValue>,
) -> &'static str {
    if settlement_date.is_some() && status == Some(LEGACY_STATUS_SETTLED) {
        return "settled";
    }
    if status == Some(LEGACY_STATUS_DECLINED) {
        return "declined";
    }
    if status == Some(LEGACY_STATUS_DRAFT) {
        return "draft";
    }
    APPLICATION_STATUSES
        .translate(application_status)
        .unwrap_or(DEFAULT_OPPORTUNITY_STATUS)
}

pub fn user_role(email: Option<&str>, role: Option<&SqlValue>, super_admins: &[String]) -> &'static str {
    if let Some(e) = email {
        if super_admins.iter().any(|a| a.eq_ignore_ascii_case(e)) {
            return HIGHEST_ROLE;
        }
    }
    ROLES.translate(role).unwrap_or(LOWEST_TEAM_ROLE)
}

/// Loan-to-value as a percentage, two decimals.
pub fn loan_to_value(loan_amount: Option<f64>, asset_value: Option<f64>) -> Option<f64> {
    let (loan, value) = (loan_amount?, asset_value?);
    if value <= 0.0 {
        return None;
    }
    Some((loan / value * 10000.0).round() / 100.0)
}

pub fn risk_level(outstanding_tax_debt: bool, credit_issues: bool, lvr: Option<f64>) -> &'static str {
    let high_lvr = lvr.map(|v| v > HIGH_LVR_PERCENT).unwrap_or(false);
    let factors = [outstanding_tax_debt, credit_issues, high_lvr]
        .iter()
        .filter(|f| **f)
        .count();
    match factors {
        0 => "low",
        1 => "medium",
        _ => "high",
    }
}

#![forbid(unsafe_code)]

//! Per-grant usage counters. Pure: callers own locking and persistence.

use avatart_kernel_contracts::clone_grant::{CloneGrantRecord, GrantStatus, QuotaPeriodKeys};
use avatart_kernel_contracts::TimestampNs;
use chrono::{DateTime, Datelike, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaPeriod {
    Daily,
    Monthly,
}

impl QuotaPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaPeriod::Daily => "daily",
            QuotaPeriod::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{} quota exceeded: {used}/{limit}", .period.as_str())]
pub struct QuotaExceeded {
    pub period: QuotaPeriod,
    pub limit: u32,
    pub used: u32,
}

/// UTC day and month buckets for `now`.
pub fn period_keys_at(now: TimestampNs) -> QuotaPeriodKeys {
    let secs = i64::try_from(now.unix_secs()).unwrap_or(i64::MAX);
    let at: DateTime<Utc> = DateTime::from_timestamp(secs, 0).unwrap_or_default();
    let date = at.date_naive();
    QuotaPeriodKeys {
        day: date.num_days_from_ce(),
        month: date.year() * 12 + date.month0() as i32,
    }
}

/// Check-and-increment. Counters are untouched on `Err`.
pub fn record_use(grant: &mut CloneGrantRecord, now: TimestampNs) -> Result<(), QuotaExceeded> {
    let limits = &grant.limits;
    let usage = &grant.usage;
    if limits.daily_limit > 0 && usage.daily_used >= limits.daily_limit {
        return Err(QuotaExceeded {
            period: QuotaPeriod::Daily,
            limit: limits.daily_limit,
            used: usage.daily_used,
        });
    }
    if limits.monthly_limit > 0 && usage.monthly_used >= limits.monthly_limit {
        return Err(QuotaExceeded {
            period: QuotaPeriod::Monthly,
            limit: limits.monthly_limit,
            used: usage.monthly_used,
        });
    }

    grant.usage.daily_used = grant.usage.daily_used.saturating_add(1);
    grant.usage.monthly_used = grant.usage.monthly_used.saturating_add(1);
    grant.usage.total_used = grant.usage.total_used.saturating_add(1);
    grant.usage.last_used_at = Some(now);
    grant.updated_at = grant.updated_at.max(now);

    // Single-period exhaustion stays active; access checks report the period instead.
    if grant.status == GrantStatus::Active && grant.daily_exhausted() && grant.monthly_exhausted()
    {
        grant.status = GrantStatus::Expired;
    }
    Ok(())
}

/// Zeroes the daily counter. Returns `true` when the grant was reactivated.
pub fn reset_daily(grant: &mut CloneGrantRecord, now: TimestampNs) -> bool {
    grant.usage.daily_used = 0;
    grant.usage.period.day = period_keys_at(now).day;
    grant.updated_at = grant.updated_at.max(now);
    reactivate_if_headroom(grant)
}

/// Zeroes the monthly counter. Returns `true` when the grant was reactivated.
pub fn reset_monthly(grant: &mut CloneGrantRecord, now: TimestampNs) -> bool {
    grant.usage.monthly_used = 0;
    grant.usage.period.month = period_keys_at(now).month;
    grant.updated_at = grant.updated_at.max(now);
    reactivate_if_headroom(grant)
}

fn reactivate_if_headroom(grant: &mut CloneGrantRecord) -> bool {
    if grant.status != GrantStatus::Expired {
        return false;
    }
    if grant.daily_exhausted() || grant.monthly_exhausted() {
        return false;
    }
    grant.status = GrantStatus::Active;
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RolloverOutcome {
    pub daily_reset: bool,
    pub monthly_reset: bool,
    pub reactivated: bool,
}

/// Applies whichever resets the calendar requires for `now`.
pub fn rollover(grant: &mut CloneGrantRecord, now: TimestampNs) -> RolloverOutcome {
    let keys = period_keys_at(now);
    let mut out = RolloverOutcome::default();
    if keys.month != grant.usage.period.month {
        out.monthly_reset = true;
        out.reactivated |= reset_monthly(grant, now);
    }
    if keys.day != grant.usage.period.day {
        out.daily_reset = true;
        out.reactivated |= reset_daily(grant, now);
    }
    out
}

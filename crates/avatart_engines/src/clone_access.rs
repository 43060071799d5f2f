#![forbid(unsafe_code)]

use avatart_kernel_contracts::clone_grant::{
    AccessDenyReason, CloneAccessDecision, CloneGrantRecord,
};
use avatart_kernel_contracts::TimestampNs;

/// Read-only access check; the first failing rule is the reported reason.
///
/// Date expiry is evaluated lazily here and never flips the stored status.
pub fn evaluate_clone_access(
    grant: Option<&CloneGrantRecord>,
    now: TimestampNs,
) -> CloneAccessDecision {
    let Some(grant) = grant else {
        return CloneAccessDecision::deny(AccessDenyReason::NoPermission, None);
    };
    if let Some(reason) = AccessDenyReason::for_status(grant.status) {
        return CloneAccessDecision::deny(reason, Some(grant.clone()));
    }
    if grant.expired_by_date(now) {
        return CloneAccessDecision::deny(AccessDenyReason::ExpiredByDate, Some(grant.clone()));
    }
    if grant.daily_exhausted() {
        return CloneAccessDecision::deny(
            AccessDenyReason::DailyLimitReached,
            Some(grant.clone()),
        );
    }
    if grant.monthly_exhausted() {
        return CloneAccessDecision::deny(
            AccessDenyReason::MonthlyLimitReached,
            Some(grant.clone()),
        );
    }
    CloneAccessDecision::allow(grant.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use avatart_kernel_contracts::clone_grant::{
        CloneId, GrantLimits, GrantStatus, ProducerId, QuotaPeriodKeys, SubjectId, SubjectKind,
        SubjectRef,
    };
    use avatart_kernel_contracts::ActorId;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    fn grant(daily: u32, monthly: u32) -> CloneGrantRecord {
        CloneGrantRecord::v1(
            CloneId::new("clone_a").unwrap(),
            ProducerId::new("producer_a").unwrap(),
            SubjectRef::new(SubjectKind::Subproducer, SubjectId::new("sub_a").unwrap()),
            ActorId::new("producer_a").unwrap(),
            GrantLimits::v1(daily, monthly, Decimal::ZERO).unwrap(),
            None,
            BTreeMap::new(),
            QuotaPeriodKeys { day: 1, month: 1 },
            TimestampNs(1_000),
        )
        .unwrap()
    }

    #[test]
    fn at_access_01_missing_grant_is_no_permission() {
        let d = evaluate_clone_access(None, TimestampNs(5_000));
        assert!(!d.allowed);
        assert_eq!(d.reason(), "no permission");
        assert!(d.grant.is_none());
    }

    #[test]
    fn at_access_02_status_wins_over_date_and_quota() {
        let mut g = grant(1, 1);
        g.status = GrantStatus::Paused;
        g.expires_at = Some(TimestampNs(1_500));
        g.usage.daily_used = 1;
        let d = evaluate_clone_access(Some(&g), TimestampNs(9_000));
        assert_eq!(d.reason(), "paused");

        g.status = GrantStatus::Revoked;
        assert_eq!(evaluate_clone_access(Some(&g), TimestampNs(9_000)).reason(), "revoked");
        g.status = GrantStatus::Expired;
        assert_eq!(evaluate_clone_access(Some(&g), TimestampNs(9_000)).reason(), "expired");
    }

    #[test]
    fn at_access_03_date_expiry_is_lazy() {
        let mut g = grant(0, 0);
        g.expires_at = Some(TimestampNs(2_000));
        let d = evaluate_clone_access(Some(&g), TimestampNs(2_001));
        assert_eq!(d.reason(), "expired by date");
        assert_eq!(g.status, GrantStatus::Active);
        assert_eq!(d.grant.map(|g| g.status), Some(GrantStatus::Active));
    }

    #[test]
    fn at_access_04_daily_before_monthly() {
        let mut g = grant(2, 2);
        g.usage.daily_used = 2;
        g.usage.monthly_used = 2;
        assert_eq!(
            evaluate_clone_access(Some(&g), TimestampNs(2_000)).reason(),
            "daily limit reached"
        );
        g.usage.daily_used = 0;
        assert_eq!(
            evaluate_clone_access(Some(&g), TimestampNs(2_000)).reason(),
            "monthly limit reached"
        );
    }

    #[test]
    fn at_access_05_unlimited_grant_allowed() {
        let mut g = grant(0, 0);
        g.usage.daily_used = 10_000;
        let d = evaluate_clone_access(Some(&g), TimestampNs(2_000));
        assert!(d.allowed);
        assert_eq!(d.reason(), "allowed");
        assert_eq!(d.grant, Some(g));
    }
}

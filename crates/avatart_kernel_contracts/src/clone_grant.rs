#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::common::{string_id, validate_text, validate_token};
use crate::{ActorId, ContractViolation, ReasonCodeId, SchemaVersion, TimestampNs, Validate};

pub const CLONE_GRANT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const GRANT_NOTES_MAX_CHARS: usize = 4096;
pub const GRANT_METADATA_MAX_ENTRIES: usize = 32;

// Clone-grant reason-code namespace. Values are placeholders until the global registry lock.
pub mod reason_codes {
    use crate::ReasonCodeId;

    pub const GRANT_OK_ALLOWED: ReasonCodeId = ReasonCodeId(0x4347_0001);
    pub const GRANT_DENY_NO_PERMISSION: ReasonCodeId = ReasonCodeId(0x4347_00F1);
    pub const GRANT_DENY_PAUSED: ReasonCodeId = ReasonCodeId(0x4347_00F2);
    pub const GRANT_DENY_EXPIRED: ReasonCodeId = ReasonCodeId(0x4347_00F3);
    pub const GRANT_DENY_REVOKED: ReasonCodeId = ReasonCodeId(0x4347_00F4);
    pub const GRANT_DENY_EXPIRED_BY_DATE: ReasonCodeId = ReasonCodeId(0x4347_00F5);
    pub const GRANT_DENY_DAILY_LIMIT: ReasonCodeId = ReasonCodeId(0x4347_00F6);
    pub const GRANT_DENY_MONTHLY_LIMIT: ReasonCodeId = ReasonCodeId(0x4347_00F7);
}

string_id!(
    /// Avatar asset owned by a producer.
    CloneId,
    "clone_id",
    96
);
string_id!(ProducerId, "producer_id", 96);
string_id!(SubjectId, "subject_id", 96);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Subproducer,
    FinalUser,
}

impl SubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectKind::Subproducer => "subproducer",
            SubjectKind::FinalUser => "final_user",
        }
    }
}

/// Tagged grantee: the kind travels with the id, never inferred from it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectRef {
    pub kind: SubjectKind,
    pub id: SubjectId,
}

impl SubjectRef {
    pub fn new(kind: SubjectKind, id: SubjectId) -> Self {
        Self { kind, id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Active,
    Paused,
    Expired,
    Revoked,
}

impl GrantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GrantStatus::Active => "active",
            GrantStatus::Paused => "paused",
            GrantStatus::Expired => "expired",
            GrantStatus::Revoked => "revoked",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GrantStatus::Revoked)
    }
}

/// Usage caps for one grant. A limit of 0 means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantLimits {
    pub daily_limit: u32,
    pub monthly_limit: u32,
    pub per_use_cost: Decimal,
}

impl GrantLimits {
    pub fn v1(
        daily_limit: u32,
        monthly_limit: u32,
        per_use_cost: Decimal,
    ) -> Result<Self, ContractViolation> {
        let limits = Self {
            daily_limit,
            monthly_limit,
            per_use_cost,
        };
        limits.validate()?;
        Ok(limits)
    }

    pub fn unlimited() -> Self {
        Self {
            daily_limit: 0,
            monthly_limit: 0,
            per_use_cost: Decimal::ZERO,
        }
    }
}

impl Validate for GrantLimits {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.per_use_cost.is_sign_negative() {
            return Err(ContractViolation::InvalidValue {
                field: "grant_limits.per_use_cost",
                reason: "must be >= 0",
            });
        }
        Ok(())
    }
}

/// Partial limit update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantLimitsUpdate {
    pub daily_limit: Option<u32>,
    pub monthly_limit: Option<u32>,
    pub per_use_cost: Option<Decimal>,
}

impl GrantLimitsUpdate {
    pub fn is_empty(&self) -> bool {
        self.daily_limit.is_none() && self.monthly_limit.is_none() && self.per_use_cost.is_none()
    }
}

impl Validate for GrantLimitsUpdate {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(cost) = self.per_use_cost {
            if cost.is_sign_negative() {
                return Err(ContractViolation::InvalidValue {
                    field: "grant_limits_update.per_use_cost",
                    reason: "must be >= 0",
                });
            }
        }
        Ok(())
    }
}

/// UTC calendar buckets the current counters belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuotaPeriodKeys {
    /// Days since 0001-01-01 (proleptic Gregorian).
    pub day: i32,
    /// `year * 12 + month0`.
    pub month: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantUsage {
    pub daily_used: u32,
    pub monthly_used: u32,
    pub total_used: u64,
    pub last_used_at: Option<TimestampNs>,
    pub period: QuotaPeriodKeys,
}

impl GrantUsage {
    pub fn fresh(period: QuotaPeriodKeys) -> Self {
        Self {
            daily_used: 0,
            monthly_used: 0,
            total_used: 0,
            last_used_at: None,
            period,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CloneGrantKey {
    pub clone_id: CloneId,
    pub subject_id: SubjectId,
}

impl CloneGrantKey {
    pub fn new(clone_id: CloneId, subject_id: SubjectId) -> Self {
        Self {
            clone_id,
            subject_id,
        }
    }
}

impl std::fmt::Display for CloneGrantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.clone_id, self.subject_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneGrantRecord {
    pub schema_version: SchemaVersion,
    pub clone_id: CloneId,
    pub producer_id: ProducerId,
    pub subject: SubjectRef,
    pub status: GrantStatus,
    pub limits: GrantLimits,
    pub usage: GrantUsage,
    pub expires_at: Option<TimestampNs>,
    pub granted_by: ActorId,
    pub notes: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: TimestampNs,
    pub updated_at: TimestampNs,
}

impl CloneGrantRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        clone_id: CloneId,
        producer_id: ProducerId,
        subject: SubjectRef,
        granted_by: ActorId,
        limits: GrantLimits,
        expires_at: Option<TimestampNs>,
        metadata: BTreeMap<String, String>,
        period: QuotaPeriodKeys,
        now: TimestampNs,
    ) -> Result<Self, ContractViolation> {
        let rec = Self {
            schema_version: CLONE_GRANT_CONTRACT_VERSION,
            clone_id,
            producer_id,
            subject,
            status: GrantStatus::Active,
            limits,
            usage: GrantUsage::fresh(period),
            expires_at,
            granted_by,
            notes: None,
            metadata,
            created_at: now,
            updated_at: now,
        };
        rec.validate()?;
        Ok(rec)
    }

    pub fn key(&self) -> CloneGrantKey {
        CloneGrantKey::new(self.clone_id.clone(), self.subject.id.clone())
    }

    /// `None` when the daily period is unlimited.
    pub fn remaining_daily(&self) -> Option<u32> {
        remaining(self.limits.daily_limit, self.usage.daily_used)
    }

    /// `None` when the monthly period is unlimited.
    pub fn remaining_monthly(&self) -> Option<u32> {
        remaining(self.limits.monthly_limit, self.usage.monthly_used)
    }

    pub fn daily_exhausted(&self) -> bool {
        self.remaining_daily() == Some(0)
    }

    pub fn monthly_exhausted(&self) -> bool {
        self.remaining_monthly() == Some(0)
    }

    pub fn expired_by_date(&self, now: TimestampNs) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    pub fn append_note(&mut self, note: &str) {
        match &mut self.notes {
            Some(existing) if !existing.is_empty() => {
                existing.push('\n');
                existing.push_str(note);
            }
            _ => self.notes = Some(note.to_string()),
        }
    }
}

fn remaining(limit: u32, used: u32) -> Option<u32> {
    if limit == 0 {
        None
    } else {
        Some(limit.saturating_sub(used))
    }
}

impl Validate for CloneGrantRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != CLONE_GRANT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "clone_grant_record.schema_version",
                reason: "must match CLONE_GRANT_CONTRACT_VERSION",
            });
        }
        self.clone_id.validate()?;
        self.producer_id.validate()?;
        self.subject.id.validate()?;
        self.granted_by.validate()?;
        self.limits.validate()?;
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "clone_grant_record.created_at",
                reason: "must be > 0",
            });
        }
        if self.updated_at < self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "clone_grant_record.updated_at",
                reason: "must be >= created_at",
            });
        }
        if let Some(notes) = &self.notes {
            if notes.chars().count() > GRANT_NOTES_MAX_CHARS {
                return Err(ContractViolation::InvalidValue {
                    field: "clone_grant_record.notes",
                    reason: "exceeds max length",
                });
            }
        }
        if self.metadata.len() > GRANT_METADATA_MAX_ENTRIES {
            return Err(ContractViolation::InvalidValue {
                field: "clone_grant_record.metadata",
                reason: "too many entries",
            });
        }
        for (k, v) in &self.metadata {
            validate_token("clone_grant_record.metadata.key", k, 64)?;
            validate_text("clone_grant_record.metadata.value", v, 512)?;
        }
        Ok(())
    }
}

/// Stable denial reasons surfaced to callers verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessDenyReason {
    NoPermission,
    Paused,
    Expired,
    Revoked,
    ExpiredByDate,
    DailyLimitReached,
    MonthlyLimitReached,
}

impl AccessDenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessDenyReason::NoPermission => "no permission",
            AccessDenyReason::Paused => "paused",
            AccessDenyReason::Expired => "expired",
            AccessDenyReason::Revoked => "revoked",
            AccessDenyReason::ExpiredByDate => "expired by date",
            AccessDenyReason::DailyLimitReached => "daily limit reached",
            AccessDenyReason::MonthlyLimitReached => "monthly limit reached",
        }
    }

    pub fn reason_code(self) -> ReasonCodeId {
        match self {
            AccessDenyReason::NoPermission => reason_codes::GRANT_DENY_NO_PERMISSION,
            AccessDenyReason::Paused => reason_codes::GRANT_DENY_PAUSED,
            AccessDenyReason::Expired => reason_codes::GRANT_DENY_EXPIRED,
            AccessDenyReason::Revoked => reason_codes::GRANT_DENY_REVOKED,
            AccessDenyReason::ExpiredByDate => reason_codes::GRANT_DENY_EXPIRED_BY_DATE,
            AccessDenyReason::DailyLimitReached => reason_codes::GRANT_DENY_DAILY_LIMIT,
            AccessDenyReason::MonthlyLimitReached => reason_codes::GRANT_DENY_MONTHLY_LIMIT,
        }
    }

    /// Denial for a non-active status. `None` for `Active`.
    pub fn for_status(status: GrantStatus) -> Option<Self> {
        match status {
            GrantStatus::Active => None,
            GrantStatus::Paused => Some(AccessDenyReason::Paused),
            GrantStatus::Expired => Some(AccessDenyReason::Expired),
            GrantStatus::Revoked => Some(AccessDenyReason::Revoked),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneAccessDecision {
    pub allowed: bool,
    pub deny_reason: Option<AccessDenyReason>,
    pub grant: Option<CloneGrantRecord>,
}

impl CloneAccessDecision {
    pub fn allow(grant: CloneGrantRecord) -> Self {
        Self {
            allowed: true,
            deny_reason: None,
            grant: Some(grant),
        }
    }

    pub fn deny(reason: AccessDenyReason, grant: Option<CloneGrantRecord>) -> Self {
        Self {
            allowed: false,
            deny_reason: Some(reason),
            grant,
        }
    }

    pub fn reason(&self) -> &'static str {
        self.deny_reason
            .map(AccessDenyReason::as_str)
            .unwrap_or("allowed")
    }

    pub fn reason_code(&self) -> ReasonCodeId {
        self.deny_reason
            .map(AccessDenyReason::reason_code)
            .unwrap_or(reason_codes::GRANT_OK_ALLOWED)
    }
}

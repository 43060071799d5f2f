#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use avatart_engines::quota_ledger::{self, QuotaExceeded};
use avatart_kernel_contracts::clone_grant::{
    CloneGrantKey, CloneGrantRecord, CloneId, GrantLimits, GrantLimitsUpdate, GrantStatus,
    ProducerId, SubjectId, SubjectRef,
};
use avatart_kernel_contracts::{ActorId, ContractViolation, TimestampNs, Validate};
use avatart_storage::repo::CloneGrantRepo;
use avatart_storage::StorageError;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GrantError {
    #[error("a grant already exists for {key}")]
    AlreadyExists { key: String },
    #[error("grant {key} is {}; transition not allowed", .status.as_str())]
    Terminal { key: String, status: GrantStatus },
    #[error("no grant for {key}")]
    NotFound { key: String },
    #[error("clone {clone_id} is owned by producer {owner}")]
    OwnerMismatch { clone_id: String, owner: String },
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceeded),
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for GrantError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DuplicateKey { key, .. } => GrantError::AlreadyExists { key },
            StorageError::NotFound { key, .. } => GrantError::NotFound { key },
            StorageError::ContractViolation(v) => GrantError::ContractViolation(v),
            other => GrantError::Storage(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    pub clone_id: CloneId,
    pub producer_id: ProducerId,
    pub subject: SubjectRef,
    pub granted_by: ActorId,
    pub limits: GrantLimits,
    pub expires_at: Option<TimestampNs>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RolloverReport {
    pub daily_resets: u32,
    pub monthly_resets: u32,
    pub reactivated: u32,
}

/// Owns every clone grant and its lifecycle. Each operation is one row transaction.
#[derive(Debug)]
pub struct PermissionRegistry<R> {
    repo: Arc<R>,
}

impl<R> Clone for PermissionRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<R: CloneGrantRepo> PermissionRegistry<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// The first grant for a clone pins its owning producer; later grants must name the same one.
    pub fn grant(
        &self,
        req: GrantRequest,
        now: TimestampNs,
    ) -> Result<CloneGrantRecord, GrantError> {
        if let Some(owner) = self.owner_of(&req.clone_id)? {
            if owner != req.producer_id {
                warn!(
                    clone_id = %req.clone_id,
                    owner = %owner,
                    requested_by = %req.producer_id,
                    "grant refused for a clone owned by another producer"
                );
                return Err(GrantError::OwnerMismatch {
                    clone_id: req.clone_id.to_string(),
                    owner: owner.to_string(),
                });
            }
        }
        let record = CloneGrantRecord::v1(
            req.clone_id,
            req.producer_id,
            req.subject,
            req.granted_by,
            req.limits,
            req.expires_at,
            req.metadata,
            quota_ledger::period_keys_at(now),
            now,
        )?;
        self.repo.insert_clone_grant_row(record.clone())?;
        info!(
            clone_id = %record.clone_id,
            subject_id = %record.subject.id,
            subject_kind = record.subject.kind.as_str(),
            "clone grant created"
        );
        Ok(record)
    }

    pub fn pause(
        &self,
        key: &CloneGrantKey,
        reason: Option<&str>,
        now: TimestampNs,
    ) -> Result<CloneGrantRecord, GrantError> {
        let updated = self.repo.update_clone_grant_row(key, |g| {
            match g.status {
                GrantStatus::Paused => return Ok(g.clone()),
                GrantStatus::Active => {}
                status @ (GrantStatus::Expired | GrantStatus::Revoked) => {
                    return Err(GrantError::Terminal {
                        key: key.to_string(),
                        status,
                    })
                }
            }
            g.status = GrantStatus::Paused;
            g.append_note(&format!("paused: {}", reason.unwrap_or("no reason given")));
            g.updated_at = g.updated_at.max(now);
            Ok(g.clone())
        })?;
        info!(grant = %key, status = updated.status.as_str(), "clone grant paused");
        Ok(updated)
    }

    /// `Terminal` for revoked or expired grants; expired ones come back only through a reset.
    pub fn activate(
        &self,
        key: &CloneGrantKey,
        now: TimestampNs,
    ) -> Result<CloneGrantRecord, GrantError> {
        let updated = self.repo.update_clone_grant_row(key, |g| {
            match g.status {
                GrantStatus::Active => return Ok(g.clone()),
                GrantStatus::Paused => {}
                status @ (GrantStatus::Expired | GrantStatus::Revoked) => {
                    return Err(GrantError::Terminal {
                        key: key.to_string(),
                        status,
                    })
                }
            }
            g.status = GrantStatus::Active;
            g.updated_at = g.updated_at.max(now);
            Ok(g.clone())
        })?;
        info!(grant = %key, "clone grant activated");
        Ok(updated)
    }

    /// Re-revoking is a no-op.
    pub fn revoke(
        &self,
        key: &CloneGrantKey,
        reason: Option<&str>,
        now: TimestampNs,
    ) -> Result<CloneGrantRecord, GrantError> {
        let (updated, changed) = self.repo.update_clone_grant_row(key, |g| {
            if g.status == GrantStatus::Revoked {
                return Ok::<_, GrantError>((g.clone(), false));
            }
            g.status = GrantStatus::Revoked;
            g.append_note(&format!("revoked: {}", reason.unwrap_or("no reason given")));
            g.updated_at = g.updated_at.max(now);
            Ok((g.clone(), true))
        })?;
        if changed {
            info!(grant = %key, "clone grant revoked");
        }
        Ok(updated)
    }

    /// Only the provided fields change; counters and status are untouched.
    pub fn update_limits(
        &self,
        key: &CloneGrantKey,
        update: &GrantLimitsUpdate,
        now: TimestampNs,
    ) -> Result<CloneGrantRecord, GrantError> {
        update.validate()?;
        self.repo.update_clone_grant_row(key, |g| {
            if let Some(daily) = update.daily_limit {
                g.limits.daily_limit = daily;
            }
            if let Some(monthly) = update.monthly_limit {
                g.limits.monthly_limit = monthly;
            }
            if let Some(cost) = update.per_use_cost {
                g.limits.per_use_cost = cost;
            }
            if !update.is_empty() {
                g.updated_at = g.updated_at.max(now);
            }
            Ok(g.clone())
        })
    }

    /// Quota-only check-and-increment under the grant's lock.
    pub fn record_use(
        &self,
        key: &CloneGrantKey,
        now: TimestampNs,
    ) -> Result<CloneGrantRecord, GrantError> {
        self.repo.update_clone_grant_row(key, |g| {
            quota_ledger::record_use(g, now)?;
            Ok(g.clone())
        })
    }

    pub fn reset_daily(
        &self,
        key: &CloneGrantKey,
        now: TimestampNs,
    ) -> Result<CloneGrantRecord, GrantError> {
        self.repo.update_clone_grant_row(key, |g| {
            if quota_ledger::reset_daily(g, now) {
                info!(grant = %key, "clone grant reactivated by daily reset");
            }
            Ok(g.clone())
        })
    }

    pub fn reset_monthly(
        &self,
        key: &CloneGrantKey,
        now: TimestampNs,
    ) -> Result<CloneGrantRecord, GrantError> {
        self.repo.update_clone_grant_row(key, |g| {
            if quota_ledger::reset_monthly(g, now) {
                info!(grant = %key, "clone grant reactivated by monthly reset");
            }
            Ok(g.clone())
        })
    }

    /// Resets every grant whose counters belong to an elapsed day or month.
    pub fn rollover_due(&self, now: TimestampNs) -> Result<RolloverReport, GrantError> {
        let mut report = RolloverReport::default();
        for key in self.repo.clone_grant_keys()? {
            let outcome = self.repo.update_clone_grant_row(&key, |g| {
                Ok::<_, GrantError>(quota_ledger::rollover(g, now))
            });
            match outcome {
                Ok(o) => {
                    report.daily_resets += u32::from(o.daily_reset);
                    report.monthly_resets += u32::from(o.monthly_reset);
                    report.reactivated += u32::from(o.reactivated);
                }
                Err(err) => warn!(grant = %key, error = %err, "grant rollover skipped"),
            }
        }
        if report != RolloverReport::default() {
            info!(
                daily_resets = report.daily_resets,
                monthly_resets = report.monthly_resets,
                reactivated = report.reactivated,
                "quota period rollover applied"
            );
        }
        Ok(report)
    }

    pub fn get(&self, key: &CloneGrantKey) -> Result<Option<CloneGrantRecord>, GrantError> {
        Ok(self.repo.clone_grant_row(key)?)
    }

    pub fn grants_for_subject(
        &self,
        subject_id: &SubjectId,
        status: Option<GrantStatus>,
    ) -> Result<Vec<CloneGrantRecord>, GrantError> {
        Ok(self.repo.clone_grant_rows_by_subject(subject_id, status)?)
    }

    pub fn grants_for_clone(
        &self,
        clone_id: &CloneId,
        status: Option<GrantStatus>,
    ) -> Result<Vec<CloneGrantRecord>, GrantError> {
        Ok(self.repo.clone_grant_rows_by_clone(clone_id, status)?)
    }

    pub fn grants_for_producer(
        &self,
        producer_id: &ProducerId,
        status: Option<GrantStatus>,
    ) -> Result<Vec<CloneGrantRecord>, GrantError> {
        Ok(self.repo.clone_grant_rows_by_producer(producer_id, status)?)
    }

    /// Producer named by the clone's existing grants, if any.
    pub fn owner_of(&self, clone_id: &CloneId) -> Result<Option<ProducerId>, GrantError> {
        Ok(self
            .repo
            .clone_grant_rows_by_clone(clone_id, None)?
            .into_iter()
            .next()
            .map(|g| g.producer_id))
    }

    pub(crate) fn repo(&self) -> &Arc<R> {
        &self.repo
    }
}

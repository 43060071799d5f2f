#![forbid(unsafe_code)]

use std::sync::Arc;

use avatart_engines::reel_transitions::{self, estimate_duration_secs, ReelTransitionError};
use avatart_kernel_contracts::reel::{
    CommissionEvent, JobHandle, ReelAction, ReelAuditEvent, ReelDraft, ReelId, ReelRecord,
    ReelResult, ReelStatus, Requester,
};
use avatart_kernel_contracts::render_provider::ProviderJobId;
use avatart_kernel_contracts::{ActorId, ContractViolation, TimestampNs};
use avatart_storage::repo::ReelRepo;
use avatart_storage::StorageError;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReelError {
    #[error(transparent)]
    Transition(#[from] ReelTransitionError),
    #[error("reel {reel_id} not found")]
    NotFound { reel_id: ReelId },
    #[error("no reel is bound to provider job {job_id}")]
    UnknownJob { job_id: String },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for ReelError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ContractViolation(v) => ReelError::ContractViolation(v),
            other => ReelError::Storage(other),
        }
    }
}

impl ReelError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, ReelError::Transition(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("commission hook failed: {0}")]
pub struct CommissionHookError(pub String);

/// Downstream accounting consumer, called once per completed reel.
pub trait CommissionHook: Send + Sync {
    fn on_reel_completed(&self, event: &CommissionEvent) -> Result<(), CommissionHookError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCommissionHook;

impl CommissionHook for NoopCommissionHook {
    fn on_reel_completed(&self, _event: &CommissionEvent) -> Result<(), CommissionHookError> {
        Ok(())
    }
}

/// Sole writer of reel records. Every method is one row transaction plus its audit rows.
pub struct ReelStateMachine<R> {
    repo: Arc<R>,
    commission_hook: Arc<dyn CommissionHook>,
}

impl<R> Clone for ReelStateMachine<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            commission_hook: Arc::clone(&self.commission_hook),
        }
    }
}

impl<R: ReelRepo> ReelStateMachine<R> {
    pub fn new(repo: Arc<R>, commission_hook: Arc<dyn CommissionHook>) -> Self {
        Self {
            repo,
            commission_hook,
        }
    }

    /// Creates the reel as `pending`; owner requests are approved in the same step.
    pub fn create(&self, draft: ReelDraft, now: TimestampNs) -> Result<ReelRecord, ReelError> {
        let owner_actor = match &draft.requester {
            Requester::Producer(p) if draft.requested_by_owner() => {
                Some(ActorId::new(p.as_str())?)
            }
            _ => None,
        };
        let reel_id = self.repo.allocate_reel_id();
        let estimate = estimate_duration_secs(&draft.script);
        let mut record = ReelRecord::from_draft(reel_id, draft, estimate, now)?;
        let created = ReelAuditEvent {
            reel_id,
            action: ReelAction::Create,
            from: ReelStatus::Pending,
            to: ReelStatus::Pending,
            actor: owner_actor.clone(),
            detail: None,
            at: now,
        };
        let approval = match owner_actor {
            Some(actor) => Some(reel_transitions::approve(&mut record, actor, now)?),
            None => None,
        };
        self.repo.insert_reel_row(record.clone(), created)?;
        if let Some(event) = approval {
            self.repo.append_reel_audit_row(event)?;
        }
        info!(reel_id = %reel_id, status = record.status.as_str(), "reel created");
        Ok(record)
    }

    pub fn approve(
        &self,
        reel_id: ReelId,
        approver: ActorId,
        now: TimestampNs,
    ) -> Result<ReelRecord, ReelError> {
        self.transition(reel_id, |r| reel_transitions::approve(r, approver, now))
    }

    pub fn reject(
        &self,
        reel_id: ReelId,
        reviewer: ActorId,
        notes: Option<String>,
        now: TimestampNs,
    ) -> Result<ReelRecord, ReelError> {
        self.transition(reel_id, |r| reel_transitions::reject(r, reviewer, notes, now))
    }

    /// Writes the job handle and enters `processing` in one transaction.
    pub fn attach_job_and_start(
        &self,
        reel_id: ReelId,
        handle: JobHandle,
        now: TimestampNs,
    ) -> Result<ReelRecord, ReelError> {
        self.repo.update_reel_row(reel_id, |r| {
            let attached = reel_transitions::attach_job(r, handle, now)?;
            let started = reel_transitions::start_processing(r, now)?;
            Ok::<_, ReelError>((r.clone(), vec![attached, started]))
        })
    }

    pub fn start_processing(
        &self,
        reel_id: ReelId,
        now: TimestampNs,
    ) -> Result<ReelRecord, ReelError> {
        self.transition(reel_id, |r| reel_transitions::start_processing(r, now))
    }

    /// Completes the reel if it is still bound to `job_id`. The hook runs after the commit;
    /// its failure is logged and never undoes completion.
    pub fn complete(
        &self,
        reel_id: ReelId,
        job_id: &ProviderJobId,
        result: ReelResult,
        now: TimestampNs,
    ) -> Result<ReelRecord, ReelError> {
        let (record, commission) = self.repo.update_reel_row(reel_id, |r| {
            reel_transitions::require_job(r, job_id)?;
            let (event, commission) = reel_transitions::complete(r, result, now)?;
            Ok::<_, ReelError>(((r.clone(), commission), vec![event]))
        })?;
        info!(reel_id = %reel_id, job_id = %job_id, "reel completed");
        if let Some(event) = commission {
            if let Err(err) = self.commission_hook.on_reel_completed(&event) {
                error!(
                    reel_id = %reel_id,
                    requester_id = %event.requester_id,
                    base_cost = %event.base_cost,
                    error = %err,
                    "commission hook failed; needs manual reconciliation"
                );
            }
        }
        Ok(record)
    }

    pub fn fail(
        &self,
        reel_id: ReelId,
        job_id: &ProviderJobId,
        error_detail: &str,
        now: TimestampNs,
    ) -> Result<ReelRecord, ReelError> {
        let record = self.transition(reel_id, |r| {
            reel_transitions::require_job(r, job_id)?;
            reel_transitions::fail(r, error_detail, now)
        })?;
        info!(reel_id = %reel_id, job_id = %job_id, error_detail, "reel failed");
        Ok(record)
    }

    pub fn resubmit(
        &self,
        reel_id: ReelId,
        actor: ActorId,
        reason: &str,
        now: TimestampNs,
    ) -> Result<ReelRecord, ReelError> {
        let record = self.transition(reel_id, |r| {
            reel_transitions::resubmit(r, actor, reason, now)
        })?;
        info!(reel_id = %reel_id, reason, "reel resubmitted");
        Ok(record)
    }

    pub fn record_submission_failure(
        &self,
        reel_id: ReelId,
        detail: &str,
        now: TimestampNs,
    ) -> Result<ReelRecord, ReelError> {
        self.transition(reel_id, |r| {
            reel_transitions::record_submission_failure(r, detail, now)
        })
    }

    /// Bumps the poll-miss counter of a reel still processing `job_id`; returns the new count.
    pub fn register_poll_miss(
        &self,
        reel_id: ReelId,
        job_id: &ProviderJobId,
    ) -> Result<u32, ReelError> {
        self.repo.update_reel_row(reel_id, |r| {
            if r.status != ReelStatus::Processing {
                return Err(ReelError::Transition(ReelTransitionError::InvalidTransition {
                    from: r.status,
                    action: ReelAction::Fail,
                }));
            }
            reel_transitions::require_job(r, job_id)?;
            r.poll_misses = r.poll_misses.saturating_add(1);
            Ok((r.poll_misses, Vec::new()))
        })
    }

    pub fn clear_poll_misses(&self, reel_id: ReelId, job_id: &ProviderJobId) -> Result<(), ReelError> {
        self.repo.update_reel_row(reel_id, |r| {
            reel_transitions::require_job(r, job_id)?;
            r.poll_misses = 0;
            Ok::<_, ReelError>(((), Vec::new()))
        })
    }

    /// Takes the submission round for the caller. A second claim fails until the round ends
    /// with an attached job or a recorded submission failure.
    pub fn claim_dispatch(&self, reel_id: ReelId) -> Result<ReelRecord, ReelError> {
        self.repo.update_reel_row(reel_id, |r| {
            reel_transitions::claim_dispatch(r)?;
            Ok::<_, ReelError>((r.clone(), Vec::new()))
        })
    }

    pub fn release_dispatch(&self, reel_id: ReelId) -> Result<(), ReelError> {
        self.repo.update_reel_row(reel_id, |r| {
            reel_transitions::release_dispatch(r);
            Ok::<_, ReelError>(((), Vec::new()))
        })
    }

    pub fn get(&self, reel_id: ReelId) -> Result<ReelRecord, ReelError> {
        self.repo
            .reel_row(reel_id)?
            .ok_or(ReelError::NotFound { reel_id })
    }

    pub fn reel_for_job(&self, job_id: &str) -> Result<ReelRecord, ReelError> {
        let unknown = || ReelError::UnknownJob {
            job_id: job_id.to_string(),
        };
        let job_id = ProviderJobId::new(job_id).map_err(|_| unknown())?;
        let reel_id = self.repo.reel_id_for_job(&job_id)?.ok_or_else(unknown)?;
        self.get(reel_id)
    }

    pub fn processing_reels(&self, limit: usize) -> Result<Vec<ReelRecord>, ReelError> {
        Ok(self.repo.reel_rows_in_status(ReelStatus::Processing, limit)?)
    }

    /// Approved reels whose last dispatch round found no working credential.
    pub fn queued_reels(&self, limit: usize) -> Result<Vec<ReelRecord>, ReelError> {
        Ok(self
            .repo
            .reel_rows_in_status(ReelStatus::ApprovedAwaitingSubmission, usize::MAX)?
            .into_iter()
            .filter(|r| r.job.is_none() && !r.dispatch_in_flight && r.last_submission_error.is_some())
            .take(limit)
            .collect())
    }

    pub fn audit_trail(&self, reel_id: ReelId) -> Result<Vec<ReelAuditEvent>, ReelError> {
        Ok(self.repo.reel_audit_rows(reel_id)?)
    }

    fn transition(
        &self,
        reel_id: ReelId,
        f: impl FnOnce(&mut ReelRecord) -> Result<ReelAuditEvent, ReelTransitionError>,
    ) -> Result<ReelRecord, ReelError> {
        self.repo.update_reel_row(reel_id, |r| {
            let event = f(r)?;
            Ok::<_, ReelError>((r.clone(), vec![event]))
        })
    }
}

#![forbid(unsafe_code)]

use avatart_kernel_contracts::clone_grant::AccessDenyReason;
use avatart_kernel_contracts::reel::{JobHandle, ReelDraft, ReelId, ReelRecord, ReelStatus, Requester};
use avatart_kernel_contracts::render_provider::ProviderCredential;
use avatart_kernel_contracts::{ActorId, TimestampNs};
use avatart_storage::repo::{CloneGrantRepo, ReelRepo};
use tracing::info;

use crate::access_decision::AccessDecisionService;
use crate::job_dispatcher::{DispatchError, JobDispatcher};
use crate::permission_registry::GrantError;
use crate::reel_state_machine::{ReelError, ReelStateMachine};

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Denied { reason: AccessDenyReason },
    /// Created by a subproducer or final user; waits for the owning producer.
    AwaitingApproval { reel: ReelRecord },
    Processing { reel_id: ReelId, job: JobHandle },
    /// Every credential failed; the reel stays pre-submission and can be retried.
    Queued { reel_id: ReelId, error: DispatchError },
}

impl GenerationOutcome {
    pub fn reel_id(&self) -> Option<ReelId> {
        match self {
            GenerationOutcome::Denied { .. } => None,
            GenerationOutcome::AwaitingApproval { reel } => Some(reel.reel_id),
            GenerationOutcome::Processing { reel_id, .. }
            | GenerationOutcome::Queued { reel_id, .. } => Some(*reel_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Grant(#[from] GrantError),
    #[error(transparent)]
    Reel(#[from] ReelError),
    #[error(transparent)]
    Dispatch(DispatchError),
}

/// Request handling path: authorize and record use, create the reel, dispatch when approved.
pub struct GenerationFlow<R> {
    access: AccessDecisionService<R>,
    reels: ReelStateMachine<R>,
    dispatcher: JobDispatcher<R>,
}

impl<R: CloneGrantRepo + ReelRepo> GenerationFlow<R> {
    pub fn new(
        access: AccessDecisionService<R>,
        reels: ReelStateMachine<R>,
        dispatcher: JobDispatcher<R>,
    ) -> Self {
        Self {
            access,
            reels,
            dispatcher,
        }
    }

    /// Producers are trusted to name their own clone unless the clone's grants say otherwise.
    pub fn request_generation(
        &self,
        mut draft: ReelDraft,
        candidates: &[ProviderCredential],
        now: TimestampNs,
    ) -> Result<GenerationOutcome, GenerationError> {
        match &draft.requester {
            Requester::Producer(producer)
                if draft.requested_by_owner()
                    && self.access.producer_owns(producer, &draft.clone_id)? => {}
            Requester::Producer(other) => {
                info!(
                    requester = %other,
                    clone_id = %draft.clone_id,
                    "producer does not own the clone"
                );
                return Ok(GenerationOutcome::Denied {
                    reason: AccessDenyReason::NoPermission,
                });
            }
            Requester::Subject(subject) => {
                let decision = self
                    .access
                    .authorize_and_record(&subject.id, &draft.clone_id, now)?;
                if let Some(reason) = decision.deny_reason {
                    info!(
                        subject_id = %subject.id,
                        clone_id = %draft.clone_id,
                        reason = reason.as_str(),
                        "generation request denied"
                    );
                    return Ok(GenerationOutcome::Denied { reason });
                }
                if let Some(grant) = decision.grant {
                    draft.producer_id = grant.producer_id;
                    draft.base_cost = grant.limits.per_use_cost;
                }
            }
        }

        let reel = self.reels.create(draft, now)?;
        if reel.status != ReelStatus::ApprovedAwaitingSubmission {
            return Ok(GenerationOutcome::AwaitingApproval { reel });
        }
        self.dispatch(reel.reel_id, candidates, now)
    }

    pub fn approve_and_dispatch(
        &self,
        reel_id: ReelId,
        approver: ActorId,
        candidates: &[ProviderCredential],
        now: TimestampNs,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.reels.approve(reel_id, approver, now)?;
        self.dispatch(reel_id, candidates, now)
    }

    /// Re-runs the credential ladder for a reel left awaiting submission.
    pub fn retry_dispatch(
        &self,
        reel_id: ReelId,
        candidates: &[ProviderCredential],
        now: TimestampNs,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.dispatch(reel_id, candidates, now)
    }

    fn dispatch(
        &self,
        reel_id: ReelId,
        candidates: &[ProviderCredential],
        now: TimestampNs,
    ) -> Result<GenerationOutcome, GenerationError> {
        match self.dispatcher.submit(reel_id, candidates, now) {
            Ok(job) => Ok(GenerationOutcome::Processing { reel_id, job }),
            Err(error) if error.is_retriable() => Ok(GenerationOutcome::Queued { reel_id, error }),
            Err(DispatchError::Reel(err)) => Err(GenerationError::Reel(err)),
            Err(other) => Err(GenerationError::Dispatch(other)),
        }
    }
}

#![forbid(unsafe_code)]

//! Transition rules for a single reel. Callers hold the reel's lock and persist the result.

use avatart_kernel_contracts::reel::{
    CommissionEvent, JobHandle, ReelAction, ReelAuditEvent, ReelId, ReelRecord, ReelResult,
    ReelStatus, REEL_ERROR_DETAIL_MAX_CHARS,
};
use avatart_kernel_contracts::render_provider::ProviderJobId;
use avatart_kernel_contracts::{ActorId, TimestampNs};

pub const SPEECH_WORDS_PER_MINUTE: u64 = 150;
pub const MIN_ESTIMATED_DURATION_SECS: u32 = 5;
pub const MAX_ESTIMATED_DURATION_SECS: u32 = 600;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReelTransitionError {
    #[error("invalid reel transition: {} from {}", .action.as_str(), .from.as_str())]
    InvalidTransition { from: ReelStatus, action: ReelAction },
    #[error("reel {reel_id} already has a job handle")]
    JobAlreadyAttached { reel_id: ReelId },
    #[error("reel {reel_id} has no job handle")]
    MissingJobHandle { reel_id: ReelId },
    #[error("reel {reel_id} is {} and not open for dispatch", .status.as_str())]
    NotDispatchable { reel_id: ReelId, status: ReelStatus },
    #[error("reel {reel_id} is no longer bound to provider job {job_id}")]
    StaleJob { reel_id: ReelId, job_id: String },
}

/// Spoken-length estimate from word count.
pub fn estimate_duration_secs(script: &str) -> u32 {
    let words = script.split_whitespace().count() as u64;
    let secs = words.saturating_mul(60) / SPEECH_WORDS_PER_MINUTE;
    u32::try_from(secs)
        .unwrap_or(u32::MAX)
        .clamp(MIN_ESTIMATED_DURATION_SECS, MAX_ESTIMATED_DURATION_SECS)
}

pub fn approve(
    reel: &mut ReelRecord,
    approver: ActorId,
    now: TimestampNs,
) -> Result<ReelAuditEvent, ReelTransitionError> {
    require(reel, ReelAction::Approve, &[ReelStatus::Pending])?;
    let from = reel.status;
    reel.status = ReelStatus::ApprovedAwaitingSubmission;
    reel.approved_by = Some(approver.clone());
    reel.approved_at = Some(now);
    Ok(audit(reel, ReelAction::Approve, from, Some(approver), None, now))
}

pub fn reject(
    reel: &mut ReelRecord,
    reviewer: ActorId,
    notes: Option<String>,
    now: TimestampNs,
) -> Result<ReelAuditEvent, ReelTransitionError> {
    require(reel, ReelAction::Reject, &[ReelStatus::Pending])?;
    let from = reel.status;
    reel.status = ReelStatus::Rejected;
    reel.approved_by = Some(reviewer.clone());
    reel.review_notes = notes.clone();
    Ok(audit(reel, ReelAction::Reject, from, Some(reviewer), notes, now))
}

/// Takes the submission round for one dispatcher. Only an approved reel with no job and no
/// round already in flight can be claimed.
pub fn claim_dispatch(reel: &mut ReelRecord) -> Result<(), ReelTransitionError> {
    if reel.status != ReelStatus::ApprovedAwaitingSubmission
        || reel.job.is_some()
        || reel.dispatch_in_flight
    {
        return Err(ReelTransitionError::NotDispatchable {
            reel_id: reel.reel_id,
            status: reel.status,
        });
    }
    reel.dispatch_in_flight = true;
    Ok(())
}

pub fn release_dispatch(reel: &mut ReelRecord) {
    reel.dispatch_in_flight = false;
}

/// Observations of a provider job apply only while the reel still carries that job.
pub fn require_job(reel: &ReelRecord, job_id: &ProviderJobId) -> Result<(), ReelTransitionError> {
    match &reel.job {
        Some(h) if &h.job_id == job_id => Ok(()),
        _ => Err(ReelTransitionError::StaleJob {
            reel_id: reel.reel_id,
            job_id: job_id.as_str().to_string(),
        }),
    }
}

/// Writes the job handle. At most once per submission cycle.
pub fn attach_job(
    reel: &mut ReelRecord,
    handle: JobHandle,
    now: TimestampNs,
) -> Result<ReelAuditEvent, ReelTransitionError> {
    if !reel.status.is_pre_submission() {
        return Err(ReelTransitionError::InvalidTransition {
            from: reel.status,
            action: ReelAction::AttachJob,
        });
    }
    if reel.job.is_some() {
        return Err(ReelTransitionError::JobAlreadyAttached {
            reel_id: reel.reel_id,
        });
    }
    let detail = format!(
        "job_id={} credential_id={}",
        handle.job_id.as_str(),
        handle.credential_id.as_str()
    );
    reel.job = Some(handle);
    reel.dispatch_in_flight = false;
    reel.submission_attempts = reel.submission_attempts.saturating_add(1);
    reel.last_submission_error = None;
    let from = reel.status;
    Ok(audit(reel, ReelAction::AttachJob, from, None, Some(detail), now))
}

pub fn start_processing(
    reel: &mut ReelRecord,
    now: TimestampNs,
) -> Result<ReelAuditEvent, ReelTransitionError> {
    require(
        reel,
        ReelAction::StartProcessing,
        &[ReelStatus::Pending, ReelStatus::ApprovedAwaitingSubmission],
    )?;
    if reel.job.is_none() {
        return Err(ReelTransitionError::MissingJobHandle {
            reel_id: reel.reel_id,
        });
    }
    let from = reel.status;
    reel.status = ReelStatus::Processing;
    reel.processing_started_at = Some(now);
    reel.poll_misses = 0;
    Ok(audit(reel, ReelAction::StartProcessing, from, None, None, now))
}

/// Returns the commission event on the first completion only.
pub fn complete(
    reel: &mut ReelRecord,
    result: ReelResult,
    now: TimestampNs,
) -> Result<(ReelAuditEvent, Option<CommissionEvent>), ReelTransitionError> {
    require(reel, ReelAction::Complete, &[ReelStatus::Processing])?;
    let from = reel.status;
    let detail = result.video_url.clone();
    reel.status = ReelStatus::Completed;
    reel.result = Some(result);
    reel.error_detail = None;
    reel.processing_ended_at = Some(now);
    let commission = if reel.commission_emitted {
        None
    } else {
        reel.commission_emitted = true;
        Some(CommissionEvent {
            requester_id: reel.requester.id_str().to_string(),
            reel_id: reel.reel_id,
            base_cost: reel.base_cost,
        })
    };
    Ok((
        audit(reel, ReelAction::Complete, from, None, Some(detail), now),
        commission,
    ))
}

pub fn fail(
    reel: &mut ReelRecord,
    error_detail: &str,
    now: TimestampNs,
) -> Result<ReelAuditEvent, ReelTransitionError> {
    require(reel, ReelAction::Fail, &[ReelStatus::Processing])?;
    let from = reel.status;
    let detail = clamp_detail(error_detail);
    reel.status = ReelStatus::Failed;
    reel.error_detail = Some(detail.clone());
    reel.processing_ended_at = Some(now);
    Ok(audit(reel, ReelAction::Fail, from, None, Some(detail), now))
}

/// Audited way out of `failed`. The previous job handle survives only in the audit detail.
pub fn resubmit(
    reel: &mut ReelRecord,
    actor: ActorId,
    reason: &str,
    now: TimestampNs,
) -> Result<ReelAuditEvent, ReelTransitionError> {
    require(reel, ReelAction::Resubmit, &[ReelStatus::Failed])?;
    let from = reel.status;
    let archived = reel
        .job
        .take()
        .map(|h| format!("archived_job_id={}", h.job_id.as_str()))
        .unwrap_or_else(|| "archived_job_id=none".to_string());
    let previous_error = reel.error_detail.take().unwrap_or_default();
    reel.status = ReelStatus::ApprovedAwaitingSubmission;
    reel.result = None;
    reel.processing_started_at = None;
    reel.processing_ended_at = None;
    reel.poll_misses = 0;
    let detail = clamp_detail(&format!(
        "{archived} previous_error={previous_error} reason={reason}"
    ));
    Ok(audit(reel, ReelAction::Resubmit, from, Some(actor), Some(detail), now))
}

/// Annotates a dispatch round that found no working credential. Status is unchanged.
pub fn record_submission_failure(
    reel: &mut ReelRecord,
    detail: &str,
    now: TimestampNs,
) -> Result<ReelAuditEvent, ReelTransitionError> {
    if !reel.status.is_pre_submission() {
        return Err(ReelTransitionError::InvalidTransition {
            from: reel.status,
            action: ReelAction::SubmissionFailed,
        });
    }
    let detail = clamp_detail(detail);
    reel.dispatch_in_flight = false;
    reel.submission_attempts = reel.submission_attempts.saturating_add(1);
    reel.last_submission_error = Some(detail.clone());
    let from = reel.status;
    Ok(audit(reel, ReelAction::SubmissionFailed, from, None, Some(detail), now))
}

fn require(
    reel: &ReelRecord,
    action: ReelAction,
    allowed: &[ReelStatus],
) -> Result<(), ReelTransitionError> {
    if allowed.contains(&reel.status) {
        Ok(())
    } else {
        Err(ReelTransitionError::InvalidTransition {
            from: reel.status,
            action,
        })
    }
}

fn audit(
    reel: &ReelRecord,
    action: ReelAction,
    from: ReelStatus,
    actor: Option<ActorId>,
    detail: Option<String>,
    at: TimestampNs,
) -> ReelAuditEvent {
    ReelAuditEvent {
        reel_id: reel.reel_id,
        action,
        from,
        to: reel.status,
        actor,
        detail,
        at,
    }
}

fn clamp_detail(raw: &str) -> String {
    raw.chars().take(REEL_ERROR_DETAIL_MAX_CHARS).collect()
}

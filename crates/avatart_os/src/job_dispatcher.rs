#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use avatart_engines::reel_transitions::ReelTransitionError;
use avatart_kernel_contracts::reel::{JobHandle, ReelId, ReelStatus};
use avatart_kernel_contracts::render_provider::{
    ProviderCallError, ProviderCredential, RenderJobSpec, RenderProvider,
};
use avatart_kernel_contracts::TimestampNs;
use avatart_storage::repo::ReelRepo;
use tracing::{error, info, warn};

use crate::reel_state_machine::{ReelError, ReelStateMachine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub per_credential_timeout_ms: u32,
    pub aggregate_timeout_ms: u32,
    pub callback_url: Option<String>,
}

impl DispatchConfig {
    pub fn mvp_v1() -> Self {
        Self {
            per_credential_timeout_ms: 15_000,
            aggregate_timeout_ms: 45_000,
            callback_url: None,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::mvp_v1();
        let per_credential_timeout_ms = env::var("AVATART_DISPATCH_CREDENTIAL_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| (100..=120_000).contains(v))
            .unwrap_or(defaults.per_credential_timeout_ms);
        let aggregate_timeout_ms = env::var("AVATART_DISPATCH_AGGREGATE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| (100..=600_000).contains(v))
            .unwrap_or(defaults.aggregate_timeout_ms)
            .max(per_credential_timeout_ms);
        let callback_url = env::var("AVATART_RENDER_CALLBACK_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| v.starts_with("https://") || v.starts_with("http://"));
        Self {
            per_credential_timeout_ms,
            aggregate_timeout_ms,
            callback_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub credential_id: String,
    pub error: ProviderCallError,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("reel {reel_id}: no provider credential available")]
    NoCredential { reel_id: ReelId },
    #[error("reel {reel_id}: every provider credential was rejected ({} attempts)", .failures.len())]
    ProviderRejected {
        reel_id: ReelId,
        failures: Vec<CandidateFailure>,
    },
    #[error("reel {reel_id}: rendering provider temporarily unavailable")]
    ProviderTimeout {
        reel_id: ReelId,
        failures: Vec<CandidateFailure>,
    },
    #[error("reel {reel_id} is {} and cannot be dispatched", .status.as_str())]
    NotDispatchable { reel_id: ReelId, status: ReelStatus },
    #[error(transparent)]
    Reel(#[from] ReelError),
}

impl DispatchError {
    /// Submission failures leave the reel pre-submission and may be retried later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DispatchError::NoCredential { .. }
                | DispatchError::ProviderRejected { .. }
                | DispatchError::ProviderTimeout { .. }
        )
    }
}

/// Submits approved reels to the rendering provider, walking the credential ladder.
pub struct JobDispatcher<R> {
    reels: ReelStateMachine<R>,
    provider: Arc<dyn RenderProvider>,
    config: DispatchConfig,
}

impl<R: ReelRepo> JobDispatcher<R> {
    pub fn new(
        reels: ReelStateMachine<R>,
        provider: Arc<dyn RenderProvider>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            reels,
            provider,
            config,
        }
    }

    /// Claims the reel's submission round before any provider call, so concurrent callers
    /// get `NotDispatchable` instead of a second external job. No reel or grant lock is held
    /// while a provider call is in flight.
    pub fn submit(
        &self,
        reel_id: ReelId,
        candidates: &[ProviderCredential],
        now: TimestampNs,
    ) -> Result<JobHandle, DispatchError> {
        let reel = match self.reels.claim_dispatch(reel_id) {
            Ok(reel) => reel,
            Err(ReelError::Transition(ReelTransitionError::NotDispatchable { status, .. })) => {
                return Err(DispatchError::NotDispatchable { reel_id, status });
            }
            Err(err) => return Err(err.into()),
        };
        if candidates.is_empty() {
            warn!(reel_id = %reel_id, "no provider credential available for dispatch");
            self.reels
                .record_submission_failure(reel_id, "no provider credential available", now)?;
            return Err(DispatchError::NoCredential { reel_id });
        }

        let spec = RenderJobSpec::from_reel(&reel, self.config.callback_url.clone());
        let aggregate = Duration::from_millis(u64::from(self.config.aggregate_timeout_ms));
        let per_credential = Duration::from_millis(u64::from(self.config.per_credential_timeout_ms));
        let started = Instant::now();
        let mut failures = Vec::new();
        let mut deadline_hit = false;

        for credential in candidates {
            let elapsed = started.elapsed();
            if elapsed >= aggregate {
                deadline_hit = true;
                break;
            }
            let budget = per_credential.min(aggregate - elapsed);
            match self.provider.submit_job(credential, &spec, budget) {
                Ok(job_id) => {
                    let handle = JobHandle {
                        job_id,
                        credential_id: credential.credential_id.clone(),
                        submitted_at: now,
                    };
                    if let Err(err) = self.reels.attach_job_and_start(reel_id, handle.clone(), now)
                    {
                        error!(
                            reel_id = %reel_id,
                            job_id = %handle.job_id,
                            error = %err,
                            "provider accepted job but reel could not record it"
                        );
                        if let Err(release_err) = self.reels.release_dispatch(reel_id) {
                            warn!(reel_id = %reel_id, error = %release_err, "dispatch claim not released");
                        }
                        return Err(err.into());
                    }
                    info!(
                        reel_id = %reel_id,
                        job_id = %handle.job_id,
                        credential_id = %handle.credential_id,
                        attempts = failures.len() + 1,
                        "reel submitted to rendering provider"
                    );
                    return Ok(handle);
                }
                Err(err) => {
                    warn!(
                        reel_id = %reel_id,
                        credential_id = %credential.credential_id,
                        kind = err.kind.as_str(),
                        detail = %err.detail,
                        "render submission candidate failed"
                    );
                    failures.push(CandidateFailure {
                        credential_id: credential.credential_id.to_string(),
                        error: err,
                    });
                }
            }
        }

        if started.elapsed() >= aggregate {
            deadline_hit = true;
        }
        let summary = failures
            .iter()
            .map(|f| format!("{}={}", f.credential_id, f.error.kind.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let detail = if deadline_hit {
            format!("aggregate submission timeout [{summary}]")
        } else {
            format!("all credentials failed [{summary}]")
        };
        warn!(reel_id = %reel_id, detail = %detail, "reel left awaiting submission");
        self.reels.record_submission_failure(reel_id, &detail, now)?;

        if deadline_hit {
            Err(DispatchError::ProviderTimeout { reel_id, failures })
        } else {
            Err(DispatchError::ProviderRejected { reel_id, failures })
        }
    }
}

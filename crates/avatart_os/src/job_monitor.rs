#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;

use avatart_kernel_contracts::reel::{ReelId, ReelResult, ReelStatus};
use avatart_kernel_contracts::render_provider::{
    CredentialSource, ProviderJobId, ProviderJobStatus, RenderProvider,
};
use avatart_kernel_contracts::TimestampNs;
use avatart_storage::repo::ReelRepo;
use tracing::{debug, warn};

use crate::reel_state_machine::{ReelError, ReelStateMachine};

pub const PROVIDER_TIMEOUT_DETAIL: &str = "provider timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub max_status_misses: u32,
    pub sweep_limit: usize,
    pub poll_interval_ms: u64,
}

impl MonitorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_status_misses: 5,
            sweep_limit: 50,
            poll_interval_ms: 30_000,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::mvp_v1();
        Self {
            max_status_misses: env::var("AVATART_MONITOR_MAX_MISSES")
                .ok()
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|v| (1..=100).contains(v))
                .unwrap_or(defaults.max_status_misses),
            sweep_limit: env::var("AVATART_MONITOR_SWEEP_LIMIT")
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| (1..=1_000).contains(v))
                .unwrap_or(defaults.sweep_limit),
            poll_interval_ms: env::var("AVATART_MONITOR_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| (1_000..=3_600_000).contains(v))
                .unwrap_or(defaults.poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    StillProcessing,
    Completed,
    Failed,
    Miss { count: u32 },
    /// The reel left `processing` before (or while) this observation was applied.
    NotProcessing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepStats {
    pub checked: u32,
    pub completed: u32,
    pub failed: u32,
    pub still_processing: u32,
    pub errors: u32,
}

/// Observes provider jobs and writes only terminal outcomes onto reels.
pub struct JobMonitor<R> {
    reels: ReelStateMachine<R>,
    provider: Arc<dyn RenderProvider>,
    credentials: Arc<dyn CredentialSource>,
    config: MonitorConfig,
}

impl<R: ReelRepo> JobMonitor<R> {
    pub fn new(
        reels: ReelStateMachine<R>,
        provider: Arc<dyn RenderProvider>,
        credentials: Arc<dyn CredentialSource>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            reels,
            provider,
            credentials,
            config,
        }
    }

    pub fn config(&self) -> MonitorConfig {
        self.config
    }

    pub fn poll_once(&self, reel_id: ReelId, now: TimestampNs) -> Result<PollOutcome, ReelError> {
        let reel = self.reels.get(reel_id)?;
        let job = match (&reel.status, reel.job) {
            (ReelStatus::Processing, Some(job)) => job,
            _ => return Ok(PollOutcome::NotProcessing),
        };
        let Some(credential) = self.credentials.credential(&job.credential_id) else {
            warn!(
                reel_id = %reel_id,
                credential_id = %job.credential_id,
                "credential for outstanding job is gone"
            );
            return self.register_miss(reel_id, &job.job_id, now);
        };
        match self.provider.job_status(&credential, &job.job_id) {
            Ok(status) => self.apply_status(reel_id, &job.job_id, status, now),
            Err(err) => {
                warn!(
                    reel_id = %reel_id,
                    job_id = %job.job_id,
                    kind = err.kind.as_str(),
                    detail = %err.detail,
                    "job status poll failed"
                );
                self.register_miss(reel_id, &job.job_id, now)
            }
        }
    }

    /// Provider push path. Duplicate callbacks for a settled reel are no-ops.
    pub fn on_callback(
        &self,
        job_id: &ProviderJobId,
        status: ProviderJobStatus,
        now: TimestampNs,
    ) -> Result<PollOutcome, ReelError> {
        let reel = self.reels.reel_for_job(job_id.as_str())?;
        if reel.status != ReelStatus::Processing {
            debug!(reel_id = %reel.reel_id, job_id = %job_id, "callback for settled reel ignored");
            return Ok(PollOutcome::NotProcessing);
        }
        self.apply_status(reel.reel_id, job_id, status, now)
    }

    pub fn sweep(&self, now: TimestampNs) -> Result<SweepStats, ReelError> {
        self.sweep_with_limit(self.config.sweep_limit, now)
    }

    pub fn sweep_with_limit(&self, limit: usize, now: TimestampNs) -> Result<SweepStats, ReelError> {
        let mut stats = SweepStats::default();
        for reel in self.reels.processing_reels(limit)? {
            stats.checked += 1;
            match self.poll_once(reel.reel_id, now) {
                Ok(PollOutcome::Completed) => stats.completed += 1,
                Ok(PollOutcome::Failed) => stats.failed += 1,
                Ok(PollOutcome::StillProcessing | PollOutcome::Miss { .. }) => {
                    stats.still_processing += 1
                }
                Ok(PollOutcome::NotProcessing) => {}
                Err(err) => {
                    stats.errors += 1;
                    warn!(reel_id = %reel.reel_id, error = %err, "monitor sweep entry failed");
                }
            }
        }
        Ok(stats)
    }

    /// Every write checks, under the row lock, that the reel still carries `job_id`. A reel
    /// that moved on to another job while the status was in flight yields `NotProcessing`.
    fn apply_status(
        &self,
        reel_id: ReelId,
        job_id: &ProviderJobId,
        status: ProviderJobStatus,
        now: TimestampNs,
    ) -> Result<PollOutcome, ReelError> {
        match status {
            ProviderJobStatus::Queued | ProviderJobStatus::Processing => {
                settle(
                    self.reels.clear_poll_misses(reel_id, job_id),
                    PollOutcome::StillProcessing,
                )
            }
            ProviderJobStatus::Completed {
                video_url,
                thumbnail_url,
                duration_secs,
            } => match ReelResult::v1(video_url, thumbnail_url, duration_secs) {
                Ok(result) => settle(
                    self.reels.complete(reel_id, job_id, result, now),
                    PollOutcome::Completed,
                ),
                Err(violation) => {
                    warn!(reel_id = %reel_id, error = %violation, "provider returned unusable result");
                    settle(
                        self.reels.fail(
                            reel_id,
                            job_id,
                            "completed with invalid result locator",
                            now,
                        ),
                        PollOutcome::Failed,
                    )
                }
            },
            ProviderJobStatus::Failed { reason } => {
                settle(
                    self.reels.fail(reel_id, job_id, &reason, now),
                    PollOutcome::Failed,
                )
            }
            ProviderJobStatus::Unknown { raw } => {
                debug!(reel_id = %reel_id, raw = %raw, "unrecognized job status");
                self.register_miss(reel_id, job_id, now)
            }
        }
    }

    fn register_miss(
        &self,
        reel_id: ReelId,
        job_id: &ProviderJobId,
        now: TimestampNs,
    ) -> Result<PollOutcome, ReelError> {
        let count = match self.reels.register_poll_miss(reel_id, job_id) {
            Ok(count) => count,
            Err(err) if err.is_invalid_transition() => return Ok(PollOutcome::NotProcessing),
            Err(err) => return Err(err),
        };
        if count < self.config.max_status_misses {
            return Ok(PollOutcome::Miss { count });
        }
        warn!(
            reel_id = %reel_id,
            misses = count,
            "job status unavailable too long; failing reel"
        );
        settle(
            self.reels.fail(reel_id, job_id, PROVIDER_TIMEOUT_DETAIL, now),
            PollOutcome::Failed,
        )
    }
}

/// Another writer settling the reel first is not an error for the monitor.
fn settle<T>(result: Result<T, ReelError>, outcome: PollOutcome) -> Result<PollOutcome, ReelError> {
    match result {
        Ok(_) => Ok(outcome),
        Err(err) if err.is_invalid_transition() => Ok(PollOutcome::NotProcessing),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        credential, owner_draft, RecordingCommissionHook, ScriptedProvider, StaticCredentials, T0,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    use avatart_kernel_contracts::reel::JobHandle;
    use avatart_kernel_contracts::render_provider::{
        CredentialId, ProviderCallError, ProviderCredential, ProviderErrorKind, RenderJobSpec,
    };
    use avatart_kernel_contracts::ActorId;
    use avatart_storage::AvatartStore;

    struct Rig {
        sm: ReelStateMachine<AvatartStore>,
        provider: Arc<ScriptedProvider>,
        hook: Arc<RecordingCommissionHook>,
        monitor: JobMonitor<AvatartStore>,
    }

    fn rig(max_status_misses: u32) -> Rig {
        let hook = Arc::new(RecordingCommissionHook::default());
        let sm = ReelStateMachine::new(Arc::new(AvatartStore::new_in_memory()), hook.clone());
        let provider = Arc::new(ScriptedProvider::default());
        let creds = Arc::new(StaticCredentials::new(vec![credential("producer_a", "tok_a")]));
        let config = MonitorConfig {
            max_status_misses,
            ..MonitorConfig::mvp_v1()
        };
        let monitor = JobMonitor::new(sm.clone(), provider.clone(), creds, config);
        Rig {
            sm,
            provider,
            hook,
            monitor,
        }
    }

    fn handle(job: &str) -> JobHandle {
        JobHandle {
            job_id: ProviderJobId::new(job).unwrap(),
            credential_id: CredentialId::new("producer:producer_a").unwrap(),
            submitted_at: T0,
        }
    }

    fn processing_reel(rig: &Rig, job: &str) -> ReelId {
        let reel = rig.sm.create(owner_draft(), T0).unwrap();
        rig.sm
            .attach_job_and_start(reel.reel_id, handle(job), T0)
            .unwrap();
        reel.reel_id
    }

    /// Fails, resubmits and re-dispatches the reel while a status call for its old job is
    /// in flight, then reports the old job as completed.
    struct JobSwappingProvider {
        sm: ReelStateMachine<AvatartStore>,
        reel_id: Mutex<Option<ReelId>>,
    }

    impl RenderProvider for JobSwappingProvider {
        fn submit_job(
            &self,
            _credential: &ProviderCredential,
            _spec: &RenderJobSpec,
            _timeout: Duration,
        ) -> Result<ProviderJobId, ProviderCallError> {
            Err(ProviderCallError::new(ProviderErrorKind::Transport, "unused"))
        }

        fn job_status(
            &self,
            _credential: &ProviderCredential,
            job_id: &ProviderJobId,
        ) -> Result<ProviderJobStatus, ProviderCallError> {
            let reel_id = self.reel_id.lock().unwrap().unwrap();
            self.sm.fail(reel_id, job_id, "operator abort", T0).unwrap();
            self.sm
                .resubmit(reel_id, ActorId::new("producer_a").unwrap(), "retry", T0)
                .unwrap();
            self.sm
                .attach_job_and_start(reel_id, handle("job_new"), T0)
                .unwrap();
            Ok(completed("https://cdn.test/old.mp4"))
        }
    }

    fn completed(url: &str) -> ProviderJobStatus {
        ProviderJobStatus::Completed {
            video_url: url.to_string(),
            thumbnail_url: None,
            duration_secs: Some(12.5),
        }
    }

    #[test]
    fn at_monitor_01_queued_and_processing_do_not_transition() {
        let rig = rig(5);
        let id = processing_reel(&rig, "job_1");
        rig.provider.script_status("job_1", Ok(ProviderJobStatus::Queued));
        assert_eq!(rig.monitor.poll_once(id, T0).unwrap(), PollOutcome::StillProcessing);
        rig.provider.script_status("job_1", Ok(ProviderJobStatus::Processing));
        assert_eq!(rig.monitor.poll_once(id, T0).unwrap(), PollOutcome::StillProcessing);
        assert_eq!(rig.sm.get(id).unwrap().status, ReelStatus::Processing);
        assert_eq!(rig.provider.status_calls(), vec!["job_1", "job_1"]);
    }

    #[test]
    fn at_monitor_02_completed_status_completes_and_commissions_once() {
        let rig = rig(5);
        let id = processing_reel(&rig, "job_1");
        rig.provider
            .script_status("job_1", Ok(completed("https://cdn.test/reel.mp4")));
        assert_eq!(rig.monitor.poll_once(id, T0).unwrap(), PollOutcome::Completed);
        assert_eq!(rig.monitor.poll_once(id, T0).unwrap(), PollOutcome::NotProcessing);

        let stored = rig.sm.get(id).unwrap();
        assert_eq!(stored.status, ReelStatus::Completed);
        let result = stored.result.unwrap();
        assert_eq!(result.video_url, "https://cdn.test/reel.mp4");
        assert_eq!(result.duration_secs, Some(12.5));
        assert_eq!(rig.hook.events().len(), 1);
    }

    #[test]
    fn at_monitor_03_failed_status_records_reason_without_commission() {
        let rig = rig(5);
        let id = processing_reel(&rig, "job_1");
        rig.provider.script_status(
            "job_1",
            Ok(ProviderJobStatus::Failed {
                reason: "avatar asset missing".to_string(),
            }),
        );
        assert_eq!(rig.monitor.poll_once(id, T0).unwrap(), PollOutcome::Failed);
        let stored = rig.sm.get(id).unwrap();
        assert_eq!(stored.status, ReelStatus::Failed);
        assert_eq!(stored.error_detail.as_deref(), Some("avatar asset missing"));
        assert!(rig.hook.events().is_empty());
    }

    #[test]
    fn at_monitor_04_bounded_misses_end_in_provider_timeout() {
        let rig = rig(3);
        let id = processing_reel(&rig, "job_1");
        rig.provider
            .script_status("job_1", Err(ProviderErrorKind::Transport));
        assert_eq!(rig.monitor.poll_once(id, T0).unwrap(), PollOutcome::Miss { count: 1 });
        rig.provider.script_status(
            "job_1",
            Ok(ProviderJobStatus::Unknown {
                raw: "rendering_v2".to_string(),
            }),
        );
        assert_eq!(rig.monitor.poll_once(id, T0).unwrap(), PollOutcome::Miss { count: 2 });
        assert_eq!(rig.monitor.poll_once(id, T0).unwrap(), PollOutcome::Failed);
        let stored = rig.sm.get(id).unwrap();
        assert_eq!(stored.status, ReelStatus::Failed);
        assert_eq!(stored.error_detail.as_deref(), Some(PROVIDER_TIMEOUT_DETAIL));
    }

    #[test]
    fn at_monitor_05_recognized_status_resets_miss_counter() {
        let rig = rig(2);
        let id = processing_reel(&rig, "job_1");
        rig.provider
            .script_status("job_1", Err(ProviderErrorKind::Timeout));
        assert_eq!(rig.monitor.poll_once(id, T0).unwrap(), PollOutcome::Miss { count: 1 });
        rig.provider.script_status("job_1", Ok(ProviderJobStatus::Queued));
        rig.monitor.poll_once(id, T0).unwrap();
        rig.provider
            .script_status("job_1", Err(ProviderErrorKind::Timeout));
        assert_eq!(rig.monitor.poll_once(id, T0).unwrap(), PollOutcome::Miss { count: 1 });
        assert_eq!(rig.sm.get(id).unwrap().status, ReelStatus::Processing);
    }

    #[test]
    fn at_monitor_06_invalid_result_locator_fails_reel() {
        let rig = rig(5);
        let id = processing_reel(&rig, "job_1");
        rig.provider
            .script_status("job_1", Ok(completed("ftp://cdn.test/reel.mp4")));
        assert_eq!(rig.monitor.poll_once(id, T0).unwrap(), PollOutcome::Failed);
        assert!(rig.hook.events().is_empty());
    }

    #[test]
    fn at_monitor_07_callbacks_resolve_by_job_and_are_idempotent() {
        let rig = rig(5);
        let id = processing_reel(&rig, "job_cb");
        let job = ProviderJobId::new("job_cb").unwrap();
        let status = completed("https://cdn.test/cb.mp4");
        assert_eq!(
            rig.monitor.on_callback(&job, status.clone(), T0).unwrap(),
            PollOutcome::Completed
        );
        assert_eq!(
            rig.monitor.on_callback(&job, status, T0).unwrap(),
            PollOutcome::NotProcessing
        );
        assert_eq!(rig.sm.get(id).unwrap().status, ReelStatus::Completed);
        assert_eq!(rig.hook.events().len(), 1);

        let stranger = ProviderJobId::new("job_unknown").unwrap();
        assert!(matches!(
            rig.monitor
                .on_callback(&stranger, ProviderJobStatus::Queued, T0),
            Err(ReelError::UnknownJob { .. })
        ));
    }

    #[test]
    fn at_monitor_08_sweep_tallies_outcomes() {
        let rig = rig(5);
        let done = processing_reel(&rig, "job_done");
        let broken = processing_reel(&rig, "job_broken");
        let waiting = processing_reel(&rig, "job_wait");
        rig.provider
            .script_status("job_done", Ok(completed("https://cdn.test/a.mp4")));
        rig.provider.script_status(
            "job_broken",
            Ok(ProviderJobStatus::Failed {
                reason: "script rejected".to_string(),
            }),
        );
        rig.provider.script_status("job_wait", Ok(ProviderJobStatus::Queued));

        let stats = rig.monitor.sweep(T0).unwrap();
        assert_eq!(
            stats,
            SweepStats {
                checked: 3,
                completed: 1,
                failed: 1,
                still_processing: 1,
                errors: 0,
            }
        );
        assert_eq!(rig.sm.get(done).unwrap().status, ReelStatus::Completed);
        assert_eq!(rig.sm.get(broken).unwrap().status, ReelStatus::Failed);
        assert_eq!(rig.sm.get(waiting).unwrap().status, ReelStatus::Processing);

        let limited = rig.monitor.sweep_with_limit(1, T0).unwrap();
        assert_eq!(limited.checked, 1);
    }

    #[test]
    fn at_monitor_09_status_for_a_replaced_job_is_dropped() {
        let hook = Arc::new(RecordingCommissionHook::default());
        let sm = ReelStateMachine::new(Arc::new(AvatartStore::new_in_memory()), hook.clone());
        let provider = Arc::new(JobSwappingProvider {
            sm: sm.clone(),
            reel_id: Mutex::new(None),
        });
        let creds = Arc::new(StaticCredentials::new(vec![credential("producer_a", "tok_a")]));
        let monitor = JobMonitor::new(sm.clone(), provider.clone(), creds, MonitorConfig::mvp_v1());
        let reel = sm.create(owner_draft(), T0).unwrap();
        sm.attach_job_and_start(reel.reel_id, handle("job_old"), T0)
            .unwrap();
        *provider.reel_id.lock().unwrap() = Some(reel.reel_id);

        assert_eq!(
            monitor.poll_once(reel.reel_id, T0).unwrap(),
            PollOutcome::NotProcessing
        );
        let stored = sm.get(reel.reel_id).unwrap();
        assert_eq!(stored.status, ReelStatus::Processing);
        assert_eq!(stored.job.unwrap().job_id.as_str(), "job_new");
        assert!(stored.result.is_none());
        assert!(hook.events().is_empty());
    }
}

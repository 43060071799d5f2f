#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use avatart_engines::callback_signature::{
    parse_callback_event, verify_callback_signature, CallbackParseError,
};
use avatart_engines::credential_vault::CredentialVault;
use avatart_engines::render_http::{HttpRenderProvider, RenderProviderHttpConfig};
use avatart_kernel_contracts::clone_grant::{
    CloneGrantKey, CloneGrantRecord, CloneId, GrantLimits, GrantLimitsUpdate, ProducerId,
    SubjectId, SubjectKind, SubjectRef,
};
use avatart_kernel_contracts::reel::{
    AvatarRef, BackgroundKind, BackgroundSpec, CommissionEvent, ReelDraft, ReelId, ReelRecord,
    ReelRenderConfig, Requester, Resolution, VoiceSpec,
};
use avatart_kernel_contracts::render_provider::{CredentialSource, RenderProvider};
use avatart_kernel_contracts::{ActorId, ContractViolation, TimestampNs};
use avatart_os::access_decision::AccessDecisionService;
use avatart_os::generation_flow::{GenerationError, GenerationFlow, GenerationOutcome};
use avatart_os::job_dispatcher::{DispatchConfig, DispatchError, JobDispatcher};
use avatart_os::job_monitor::{JobMonitor, MonitorConfig, PollOutcome};
use avatart_os::permission_registry::{GrantError, GrantRequest, PermissionRegistry};
use avatart_os::reel_state_machine::{
    CommissionHook, CommissionHookError, ReelError, ReelStateMachine,
};
use avatart_storage::AvatartStore;
use rust_decimal::Decimal;
use tracing::{info, warn};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GrantAdapterRequest {
    pub clone_id: String,
    pub producer_id: String,
    pub subject_kind: String,
    pub subject_id: String,
    pub granted_by: String,
    pub daily_limit: u32,
    pub monthly_limit: u32,
    pub per_use_cost: Option<String>,
    pub expires_at_ns: Option<u64>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GrantKeyAdapterRequest {
    pub clone_id: String,
    pub subject_id: String,
    pub reason: Option<String>,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GrantLimitsAdapterRequest {
    pub clone_id: String,
    pub subject_id: String,
    pub daily_limit: Option<u32>,
    pub monthly_limit: Option<u32>,
    pub per_use_cost: Option<String>,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GrantView {
    pub clone_id: String,
    pub producer_id: String,
    pub subject_kind: String,
    pub subject_id: String,
    pub status: String,
    pub daily_limit: u32,
    pub monthly_limit: u32,
    pub per_use_cost: String,
    pub daily_used: u32,
    pub monthly_used: u32,
    pub total_used: u64,
    pub remaining_daily: Option<u32>,
    pub remaining_monthly: Option<u32>,
    pub expires_at_ns: Option<u64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GrantAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub grant: Option<GrantView>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CanUseAdapterRequest {
    pub clone_id: String,
    pub subject_id: String,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CanUseAdapterResponse {
    pub allowed: bool,
    pub reason: String,
    pub remaining_daily: Option<u32>,
    pub remaining_monthly: Option<u32>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReelAdapterRequest {
    /// `producer`, `subproducer` or `final_user`.
    pub requester_kind: String,
    pub requester_id: String,
    pub clone_id: String,
    pub producer_id: String,
    pub avatar_ref: String,
    pub title: String,
    pub script: String,
    pub resolution: Option<String>,
    pub background_kind: Option<String>,
    pub background_value: Option<String>,
    pub voice_id: Option<String>,
    pub voice_speed: Option<f32>,
    pub base_cost: Option<String>,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReelApproveAdapterRequest {
    pub reel_id: u64,
    pub approver: String,
    pub now_ns: Option<u64>,
}

/// Owner-gated retry of a queued reel, or resubmission of a failed one.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReelRetryAdapterRequest {
    pub reel_id: u64,
    pub actor: String,
    pub reason: Option<String>,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReelAdapterResponse {
    #[serde(skip)]
    pub http_status: u16,
    pub status: String,
    pub outcome: String,
    pub reel_id: Option<u64>,
    pub reel_status: Option<String>,
    pub job_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CallbackAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct MaintenancePassReport {
    pub checked: u32,
    pub completed: u32,
    pub failed: u32,
    pub still_processing: u32,
    pub errors: u32,
    pub redispatched: u32,
    pub still_queued: u32,
    pub daily_resets: u32,
    pub monthly_resets: u32,
    pub reactivated: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub processing_reels: u32,
}

/// Error surfaced to HTTP callers with the status code it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
    pub http_status: u16,
    pub reason: String,
}

impl AdapterError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            http_status: 400,
            reason: reason.into(),
        }
    }

    fn new(http_status: u16, reason: impl Into<String>) -> Self {
        Self {
            http_status,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.http_status)
    }
}

impl std::error::Error for AdapterError {}

impl From<ContractViolation> for AdapterError {
    fn from(err: ContractViolation) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<GrantError> for AdapterError {
    fn from(err: GrantError) -> Self {
        let status = match &err {
            GrantError::AlreadyExists { .. } | GrantError::Terminal { .. } => 409,
            GrantError::NotFound { .. } => 404,
            GrantError::OwnerMismatch { .. } => 403,
            GrantError::QuotaExceeded(_) => 429,
            GrantError::ContractViolation(_) => 400,
            GrantError::Storage(_) => 500,
        };
        Self::new(status, err.to_string())
    }
}

impl From<ReelError> for AdapterError {
    fn from(err: ReelError) -> Self {
        Self::new(reel_error_status(&err), err.to_string())
    }
}

impl From<DispatchError> for AdapterError {
    fn from(err: DispatchError) -> Self {
        Self::new(dispatch_error_status(&err), err.to_string())
    }
}

impl From<GenerationError> for AdapterError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Grant(e) => e.into(),
            GenerationError::Reel(e) => e.into(),
            GenerationError::Dispatch(e) => e.into(),
        }
    }
}

fn reel_error_status(err: &ReelError) -> u16 {
    match err {
        ReelError::Transition(_) => 409,
        ReelError::NotFound { .. } | ReelError::UnknownJob { .. } => 404,
        ReelError::ContractViolation(_) => 400,
        ReelError::Storage(_) => 500,
    }
}

fn dispatch_error_status(err: &DispatchError) -> u16 {
    match err {
        DispatchError::NoCredential { .. } | DispatchError::ProviderRejected { .. } => 502,
        DispatchError::ProviderTimeout { .. } => 503,
        DispatchError::NotDispatchable { .. } => 409,
        DispatchError::Reel(e) => reel_error_status(e),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub dispatch: DispatchConfig,
    pub monitor: MonitorConfig,
    pub webhook_secret: Option<String>,
}

impl AdapterConfig {
    pub fn mvp_v1() -> Self {
        Self {
            dispatch: DispatchConfig::mvp_v1(),
            monitor: MonitorConfig::mvp_v1(),
            webhook_secret: None,
        }
    }

    pub fn from_env() -> Self {
        Self {
            dispatch: DispatchConfig::from_env(),
            monitor: MonitorConfig::from_env(),
            webhook_secret: env::var("AVATART_WEBHOOK_SECRET")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }
}

/// Commission consumer for the standalone adapter: the event lands in the log stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCommissionHook;

impl CommissionHook for LogCommissionHook {
    fn on_reel_completed(&self, event: &CommissionEvent) -> Result<(), CommissionHookError> {
        info!(
            reel_id = %event.reel_id,
            requester_id = %event.requester_id,
            base_cost = %event.base_cost,
            "commission event emitted"
        );
        Ok(())
    }
}

pub struct AdapterRuntime {
    registry: PermissionRegistry<AvatartStore>,
    access: AccessDecisionService<AvatartStore>,
    reels: ReelStateMachine<AvatartStore>,
    flow: GenerationFlow<AvatartStore>,
    monitor: JobMonitor<AvatartStore>,
    credentials: Arc<dyn CredentialSource>,
    webhook_secret: Option<String>,
}

impl AdapterRuntime {
    pub fn new(
        store: Arc<AvatartStore>,
        provider: Arc<dyn RenderProvider>,
        credentials: Arc<dyn CredentialSource>,
        commission_hook: Arc<dyn CommissionHook>,
        config: AdapterConfig,
    ) -> Self {
        let registry = PermissionRegistry::new(store.clone());
        let access = AccessDecisionService::new(registry.clone());
        let reels = ReelStateMachine::new(store, commission_hook);
        let dispatcher = JobDispatcher::new(reels.clone(), provider.clone(), config.dispatch);
        let flow = GenerationFlow::new(access.clone(), reels.clone(), dispatcher);
        let monitor = JobMonitor::new(reels.clone(), provider, credentials.clone(), config.monitor);
        Self {
            registry,
            access,
            reels,
            flow,
            monitor,
            credentials,
            webhook_secret: config.webhook_secret,
        }
    }

    pub fn default_from_env() -> Result<Self, String> {
        let vault = CredentialVault::from_env();
        if let Some(token) = env::var("AVATART_PLATFORM_RENDER_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            vault
                .store_platform_token(&token)
                .map_err(|err| format!("failed to store platform render key: {err}"))?;
        }
        if let Ok(raw) = env::var("AVATART_PRODUCER_RENDER_KEYS") {
            for (producer_id, token) in parse_producer_keys(&raw)? {
                vault
                    .store_producer_token(&producer_id, &token)
                    .map_err(|err| format!("failed to store render key for {producer_id}: {err}"))?;
            }
        }
        let provider = HttpRenderProvider::new(RenderProviderHttpConfig::from_env());
        let config = AdapterConfig::from_env();
        if config.webhook_secret.is_none() {
            warn!("AVATART_WEBHOOK_SECRET is unset; provider callbacks will be refused");
        }
        Ok(Self::new(
            Arc::new(AvatartStore::new_in_memory()),
            Arc::new(provider),
            Arc::new(vault),
            Arc::new(LogCommissionHook),
            config,
        ))
    }

    pub fn monitor_poll_interval_ms(&self) -> u64 {
        self.monitor.config().poll_interval_ms
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        match self.reels.processing_reels(usize::MAX) {
            Ok(reels) => AdapterHealthResponse {
                status: "ok".to_string(),
                outcome: "HEALTHY".to_string(),
                reason: None,
                processing_reels: u32::try_from(reels.len()).unwrap_or(u32::MAX),
            },
            Err(err) => AdapterHealthResponse {
                status: "error".to_string(),
                outcome: "UNHEALTHY".to_string(),
                reason: Some(err.to_string()),
                processing_reels: 0,
            },
        }
    }

    pub fn grant(&self, request: GrantAdapterRequest) -> Result<GrantAdapterResponse, AdapterError> {
        let now = resolve_now(request.now_ns);
        let per_use_cost = parse_decimal_option(request.per_use_cost.as_deref())?
            .unwrap_or(Decimal::ZERO);
        let subject = SubjectRef::new(
            parse_subject_kind(&request.subject_kind)?,
            SubjectId::new(request.subject_id)?,
        );
        let grant_request = GrantRequest {
            clone_id: CloneId::new(request.clone_id)?,
            producer_id: ProducerId::new(request.producer_id)?,
            subject,
            granted_by: ActorId::new(request.granted_by)?,
            limits: GrantLimits::v1(request.daily_limit, request.monthly_limit, per_use_cost)?,
            expires_at: request.expires_at_ns.map(TimestampNs),
            metadata: request.metadata.unwrap_or_default(),
        };
        let record = self.registry.grant(grant_request, now)?;
        Ok(grant_response("GRANTED", record))
    }

    pub fn pause_grant(
        &self,
        request: GrantKeyAdapterRequest,
    ) -> Result<GrantAdapterResponse, AdapterError> {
        let now = resolve_now(request.now_ns);
        let key = grant_key(&request.clone_id, &request.subject_id)?;
        let record = self.registry.pause(&key, request.reason.as_deref(), now)?;
        Ok(grant_response("PAUSED", record))
    }

    pub fn activate_grant(
        &self,
        request: GrantKeyAdapterRequest,
    ) -> Result<GrantAdapterResponse, AdapterError> {
        let now = resolve_now(request.now_ns);
        let key = grant_key(&request.clone_id, &request.subject_id)?;
        let record = self.registry.activate(&key, now)?;
        Ok(grant_response("ACTIVE", record))
    }

    pub fn revoke_grant(
        &self,
        request: GrantKeyAdapterRequest,
    ) -> Result<GrantAdapterResponse, AdapterError> {
        let now = resolve_now(request.now_ns);
        let key = grant_key(&request.clone_id, &request.subject_id)?;
        let record = self.registry.revoke(&key, request.reason.as_deref(), now)?;
        Ok(grant_response("REVOKED", record))
    }

    pub fn update_grant_limits(
        &self,
        request: GrantLimitsAdapterRequest,
    ) -> Result<GrantAdapterResponse, AdapterError> {
        let now = resolve_now(request.now_ns);
        let key = grant_key(&request.clone_id, &request.subject_id)?;
        let update = GrantLimitsUpdate {
            daily_limit: request.daily_limit,
            monthly_limit: request.monthly_limit,
            per_use_cost: parse_decimal_option(request.per_use_cost.as_deref())?,
        };
        if update.is_empty() {
            return Err(AdapterError::bad_request("no limit field supplied"));
        }
        let record = self.registry.update_limits(&key, &update, now)?;
        Ok(grant_response("LIMITS_UPDATED", record))
    }

    pub fn can_use(
        &self,
        request: CanUseAdapterRequest,
    ) -> Result<CanUseAdapterResponse, AdapterError> {
        let now = resolve_now(request.now_ns);
        let subject_id = SubjectId::new(request.subject_id)?;
        let clone_id = CloneId::new(request.clone_id)?;
        let decision = self.access.can_use(&subject_id, &clone_id, now)?;
        Ok(CanUseAdapterResponse {
            allowed: decision.allowed,
            reason: decision.reason().to_string(),
            remaining_daily: decision.grant.as_ref().and_then(|g| g.remaining_daily()),
            remaining_monthly: decision.grant.as_ref().and_then(|g| g.remaining_monthly()),
        })
    }

    /// Blocking: may call the rendering provider once per candidate credential.
    pub fn submit_reel(
        &self,
        request: ReelAdapterRequest,
    ) -> Result<ReelAdapterResponse, AdapterError> {
        let now = resolve_now(request.now_ns);
        let draft = build_reel_draft(request)?;
        let candidates = self.credentials.candidates_for(&draft.producer_id);
        let outcome = self.flow.request_generation(draft, &candidates, now)?;
        Ok(self.reel_response(outcome))
    }

    /// Blocking: may call the rendering provider once per candidate credential.
    pub fn approve_reel(
        &self,
        request: ReelApproveAdapterRequest,
    ) -> Result<ReelAdapterResponse, AdapterError> {
        let now = resolve_now(request.now_ns);
        let reel_id = ReelId(request.reel_id);
        let approver = ActorId::new(request.approver)?;
        let reel = self.owned_reel(reel_id, &approver)?;
        let candidates = self.credentials.candidates_for(&reel.producer_id);
        let outcome = self
            .flow
            .approve_and_dispatch(reel_id, approver, &candidates, now)?;
        Ok(self.reel_response(outcome))
    }

    /// Blocking: re-runs the credential ladder for a reel answered as queued.
    pub fn retry_reel(
        &self,
        request: ReelRetryAdapterRequest,
    ) -> Result<ReelAdapterResponse, AdapterError> {
        let now = resolve_now(request.now_ns);
        let reel_id = ReelId(request.reel_id);
        let actor = ActorId::new(request.actor)?;
        let reel = self.owned_reel(reel_id, &actor)?;
        let candidates = self.credentials.candidates_for(&reel.producer_id);
        let outcome = self.flow.retry_dispatch(reel_id, &candidates, now)?;
        Ok(self.reel_response(outcome))
    }

    /// Blocking: moves a failed reel back to awaiting submission and dispatches it again.
    pub fn resubmit_reel(
        &self,
        request: ReelRetryAdapterRequest,
    ) -> Result<ReelAdapterResponse, AdapterError> {
        let now = resolve_now(request.now_ns);
        let reel_id = ReelId(request.reel_id);
        let actor = ActorId::new(request.actor)?;
        let reel = self.owned_reel(reel_id, &actor)?;
        let reason = request
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("resubmitted by producer");
        self.reels.resubmit(reel_id, actor, reason, now)?;
        let candidates = self.credentials.candidates_for(&reel.producer_id);
        let outcome = self.flow.retry_dispatch(reel_id, &candidates, now)?;
        Ok(self.reel_response(outcome))
    }

    pub fn handle_provider_callback(
        &self,
        body: &[u8],
        signature: Option<&str>,
        now_ns: Option<u64>,
    ) -> Result<CallbackAdapterResponse, AdapterError> {
        let Some(secret) = self.webhook_secret.as_deref() else {
            return Err(AdapterError::new(503, "webhook secret is not configured"));
        };
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AdapterError::new(401, "missing callback signature"))?;
        if !verify_callback_signature(body, signature, secret.as_bytes()) {
            warn!("provider callback rejected: bad signature");
            return Err(AdapterError::new(401, "invalid callback signature"));
        }
        let event = match parse_callback_event(body) {
            Ok(event) => event,
            Err(CallbackParseError::UnsupportedEvent(kind)) => {
                return Ok(CallbackAdapterResponse {
                    status: "ok".to_string(),
                    outcome: "IGNORED".to_string(),
                    reason: Some(format!("unsupported event {kind}")),
                });
            }
            Err(err) => return Err(AdapterError::bad_request(err.to_string())),
        };
        let outcome = self
            .monitor
            .on_callback(&event.job_id, event.status, resolve_now(now_ns))?;
        let outcome = match outcome {
            PollOutcome::Completed => "COMPLETED",
            PollOutcome::Failed => "FAILED",
            PollOutcome::NotProcessing => "ALREADY_SETTLED",
            PollOutcome::StillProcessing | PollOutcome::Miss { .. } => "PROCESSING",
        };
        Ok(CallbackAdapterResponse {
            status: "ok".to_string(),
            outcome: outcome.to_string(),
            reason: None,
        })
    }

    /// Blocking: one monitor sweep followed by quota period rollover.
    pub fn run_maintenance_pass(
        &self,
        now_ns: Option<u64>,
    ) -> Result<MaintenancePassReport, AdapterError> {
        let now = resolve_now(now_ns);
        let sweep = self.monitor.sweep(now)?;
        let mut redispatched = 0;
        let mut still_queued = 0;
        let mut errors = sweep.errors;
        for reel in self.reels.queued_reels(self.monitor.config().sweep_limit)? {
            let candidates = self.credentials.candidates_for(&reel.producer_id);
            match self.flow.retry_dispatch(reel.reel_id, &candidates, now) {
                Ok(GenerationOutcome::Processing { .. }) => redispatched += 1,
                Ok(_) => still_queued += 1,
                Err(GenerationError::Dispatch(DispatchError::NotDispatchable { .. })) => {}
                Err(err) => {
                    errors += 1;
                    warn!(reel_id = %reel.reel_id, error = %err, "queued reel retry failed");
                }
            }
        }
        let rollover = self.registry.rollover_due(now)?;
        Ok(MaintenancePassReport {
            checked: sweep.checked,
            completed: sweep.completed,
            failed: sweep.failed,
            still_processing: sweep.still_processing,
            errors,
            redispatched,
            still_queued,
            daily_resets: rollover.daily_resets,
            monthly_resets: rollover.monthly_resets,
            reactivated: rollover.reactivated,
        })
    }

    fn owned_reel(&self, reel_id: ReelId, actor: &ActorId) -> Result<ReelRecord, AdapterError> {
        let reel = self.reels.get(reel_id)?;
        if actor.as_str() != reel.producer_id.as_str() {
            return Err(AdapterError::new(
                403,
                "only the owning producer may act on this reel",
            ));
        }
        Ok(reel)
    }

    fn reel_response(&self, outcome: GenerationOutcome) -> ReelAdapterResponse {
        let reel_status = outcome
            .reel_id()
            .and_then(|id| self.reels.get(id).ok())
            .map(|r| r.status.as_str().to_string());
        match outcome {
            GenerationOutcome::Denied { reason } => ReelAdapterResponse {
                http_status: 403,
                status: "error".to_string(),
                outcome: "DENIED".to_string(),
                reel_id: None,
                reel_status,
                job_id: None,
                reason: Some(reason.as_str().to_string()),
            },
            GenerationOutcome::AwaitingApproval { reel } => ReelAdapterResponse {
                http_status: 202,
                status: "ok".to_string(),
                outcome: "AWAITING_APPROVAL".to_string(),
                reel_id: Some(reel.reel_id.0),
                reel_status,
                job_id: None,
                reason: None,
            },
            GenerationOutcome::Processing { reel_id, job } => ReelAdapterResponse {
                http_status: 200,
                status: "ok".to_string(),
                outcome: "PROCESSING".to_string(),
                reel_id: Some(reel_id.0),
                reel_status,
                job_id: Some(job.job_id.as_str().to_string()),
                reason: None,
            },
            GenerationOutcome::Queued { reel_id, error } => ReelAdapterResponse {
                http_status: dispatch_error_status(&error),
                status: "error".to_string(),
                outcome: "QUEUED".to_string(),
                reel_id: Some(reel_id.0),
                reel_status,
                job_id: None,
                reason: Some(error.to_string()),
            },
        }
    }
}

/// `producer_a=token_a,producer_b=token_b`; blank entries are skipped.
fn parse_producer_keys(raw: &str) -> Result<Vec<(ProducerId, String)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (producer, token) = entry
                .split_once('=')
                .ok_or_else(|| "producer render key entry is missing '='".to_string())?;
            let producer_id = ProducerId::new(producer.trim())
                .map_err(|err| format!("invalid producer id in render keys: {err}"))?;
            Ok((producer_id, token.trim().to_string()))
        })
        .collect()
}

fn grant_response(outcome: &str, record: CloneGrantRecord) -> GrantAdapterResponse {
    GrantAdapterResponse {
        status: "ok".to_string(),
        outcome: outcome.to_string(),
        reason: None,
        grant: Some(grant_view(&record)),
    }
}

fn grant_view(record: &CloneGrantRecord) -> GrantView {
    GrantView {
        clone_id: record.clone_id.as_str().to_string(),
        producer_id: record.producer_id.as_str().to_string(),
        subject_kind: record.subject.kind.as_str().to_string(),
        subject_id: record.subject.id.as_str().to_string(),
        status: record.status.as_str().to_string(),
        daily_limit: record.limits.daily_limit,
        monthly_limit: record.limits.monthly_limit,
        per_use_cost: record.limits.per_use_cost.to_string(),
        daily_used: record.usage.daily_used,
        monthly_used: record.usage.monthly_used,
        total_used: record.usage.total_used,
        remaining_daily: record.remaining_daily(),
        remaining_monthly: record.remaining_monthly(),
        expires_at_ns: record.expires_at.map(|t| t.0),
        notes: record.notes.clone(),
    }
}

fn grant_key(clone_id: &str, subject_id: &str) -> Result<CloneGrantKey, AdapterError> {
    Ok(CloneGrantKey::new(
        CloneId::new(clone_id)?,
        SubjectId::new(subject_id)?,
    ))
}

fn build_reel_draft(request: ReelAdapterRequest) -> Result<ReelDraft, AdapterError> {
    let requester = match request.requester_kind.trim() {
        "producer" => Requester::Producer(ProducerId::new(request.requester_id)?),
        kind => Requester::Subject(SubjectRef::new(
            parse_subject_kind(kind)?,
            SubjectId::new(request.requester_id)?,
        )),
    };
    let resolution = match request.resolution.as_deref() {
        Some(raw) => Resolution::parse(raw)
            .ok_or_else(|| AdapterError::bad_request(format!("unsupported resolution '{raw}'")))?,
        None => Resolution::default(),
    };
    let background = match (request.background_kind.as_deref(), request.background_value) {
        (None, None) => None,
        (Some(kind), Some(value)) => Some(BackgroundSpec::v1(parse_background_kind(kind)?, value)?),
        _ => {
            return Err(AdapterError::bad_request(
                "background_kind and background_value go together",
            ))
        }
    };
    let voice = VoiceSpec::v1(request.voice_id, request.voice_speed.unwrap_or(1.0))?;
    let base_cost = parse_decimal_option(request.base_cost.as_deref())?.unwrap_or(Decimal::ZERO);
    Ok(ReelDraft::v1(
        requester,
        CloneId::new(request.clone_id)?,
        ProducerId::new(request.producer_id)?,
        AvatarRef::new(request.avatar_ref)?,
        request.title,
        request.script,
        ReelRenderConfig {
            resolution,
            background,
            voice,
        },
        base_cost,
    )?)
}

fn parse_subject_kind(raw: &str) -> Result<SubjectKind, AdapterError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "subproducer" => Ok(SubjectKind::Subproducer),
        "final_user" | "user" => Ok(SubjectKind::FinalUser),
        other => Err(AdapterError::bad_request(format!(
            "unknown subject kind '{other}'"
        ))),
    }
}

fn parse_background_kind(raw: &str) -> Result<BackgroundKind, AdapterError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "color" => Ok(BackgroundKind::Color),
        "image" => Ok(BackgroundKind::Image),
        "video" => Ok(BackgroundKind::Video),
        other => Err(AdapterError::bad_request(format!(
            "unknown background kind '{other}'"
        ))),
    }
}

fn parse_decimal_option(raw: Option<&str>) -> Result<Option<Decimal>, AdapterError> {
    raw.map(|v| {
        Decimal::from_str(v.trim())
            .map_err(|_| AdapterError::bad_request(format!("invalid decimal '{v}'")))
    })
    .transpose()
}

fn resolve_now(now_ns: Option<u64>) -> TimestampNs {
    TimestampNs(now_ns.unwrap_or_else(system_time_now_ns).max(1))
}

fn system_time_now_ns() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    u64::try_from(nanos).unwrap_or(u64::MAX)
}

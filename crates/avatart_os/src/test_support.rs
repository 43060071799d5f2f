#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use avatart_kernel_contracts::clone_grant::{
    CloneGrantKey, CloneId, GrantLimits, ProducerId, SubjectId, SubjectKind, SubjectRef,
};
use avatart_kernel_contracts::reel::{
    AvatarRef, CommissionEvent, ReelDraft, ReelRenderConfig, Requester,
};
use avatart_kernel_contracts::render_provider::{
    CredentialId, CredentialOwner, CredentialSource, ProviderCallError, ProviderCredential,
    ProviderErrorKind, ProviderJobId, ProviderJobStatus, RenderJobSpec, RenderProvider,
};
use avatart_kernel_contracts::{ActorId, TimestampNs};
use avatart_storage::AvatartStore;
use rust_decimal::Decimal;

use crate::permission_registry::{GrantRequest, PermissionRegistry};
use crate::reel_state_machine::{CommissionHook, CommissionHookError};

/// 2026-03-14T12:00:00Z
pub const T0: TimestampNs = TimestampNs(1_773_489_600_000_000_000);

pub fn registry() -> PermissionRegistry<AvatartStore> {
    PermissionRegistry::new(Arc::new(AvatartStore::new_in_memory()))
}

pub fn grant_request(clone: &str, subject: &str, daily: u32, monthly: u32) -> GrantRequest {
    GrantRequest {
        clone_id: CloneId::new(clone).unwrap(),
        producer_id: ProducerId::new("producer_a").unwrap(),
        subject: SubjectRef::new(SubjectKind::FinalUser, SubjectId::new(subject).unwrap()),
        granted_by: ActorId::new("producer_a").unwrap(),
        limits: GrantLimits::v1(daily, monthly, Decimal::ONE).unwrap(),
        expires_at: None,
        metadata: BTreeMap::new(),
    }
}

pub fn key(clone: &str, subject: &str) -> CloneGrantKey {
    CloneGrantKey::new(CloneId::new(clone).unwrap(), SubjectId::new(subject).unwrap())
}

fn draft(requester: Requester) -> ReelDraft {
    ReelDraft::v1(
        requester,
        CloneId::new("clone_a").unwrap(),
        ProducerId::new("producer_a").unwrap(),
        AvatarRef::new("avatar_a").unwrap(),
        "Spring launch teaser",
        "Hi everyone, the spring collection is live today.",
        ReelRenderConfig::default(),
        Decimal::new(250, 2),
    )
    .unwrap()
}

pub fn owner_draft() -> ReelDraft {
    draft(Requester::Producer(ProducerId::new("producer_a").unwrap()))
}

pub fn subject_draft(subject: &str) -> ReelDraft {
    draft(Requester::Subject(SubjectRef::new(
        SubjectKind::FinalUser,
        SubjectId::new(subject).unwrap(),
    )))
}

/// Producer credential `producer:<producer>` carrying `token`.
pub fn credential(producer: &str, token: &str) -> ProviderCredential {
    ProviderCredential::producer(ProducerId::new(producer).unwrap(), token).unwrap()
}

#[derive(Default)]
pub struct RecordingCommissionHook {
    events: Mutex<Vec<CommissionEvent>>,
}

impl RecordingCommissionHook {
    pub fn events(&self) -> Vec<CommissionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl CommissionHook for RecordingCommissionHook {
    fn on_reel_completed(&self, event: &CommissionEvent) -> Result<(), CommissionHookError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct FailingCommissionHook;

impl CommissionHook for FailingCommissionHook {
    fn on_reel_completed(&self, _event: &CommissionEvent) -> Result<(), CommissionHookError> {
        Err(CommissionHookError("ledger offline".to_string()))
    }
}

#[derive(Debug, Clone)]
pub enum SubmitScript {
    Accept(&'static str),
    Fail(ProviderErrorKind),
    /// Sleeps, then reports a timeout.
    Stall(Duration),
}

/// Render provider driven by per-token submit scripts and per-job status scripts.
#[derive(Default)]
pub struct ScriptedProvider {
    submits: Mutex<HashMap<String, SubmitScript>>,
    statuses: Mutex<HashMap<String, Result<ProviderJobStatus, ProviderErrorKind>>>,
    submit_calls: Mutex<Vec<String>>,
    status_calls: Mutex<Vec<String>>,
    last_timeout: Mutex<Option<Duration>>,
}

impl ScriptedProvider {
    pub fn script_submit(&self, token: &str, script: SubmitScript) {
        self.submits
            .lock()
            .unwrap()
            .insert(token.to_string(), script);
    }

    pub fn script_status(&self, job_id: &str, status: Result<ProviderJobStatus, ProviderErrorKind>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(job_id.to_string(), status);
    }

    pub fn submit_calls(&self) -> Vec<String> {
        self.submit_calls.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> Vec<String> {
        self.status_calls.lock().unwrap().clone()
    }

    pub fn last_timeout(&self) -> Option<Duration> {
        *self.last_timeout.lock().unwrap()
    }
}

impl RenderProvider for ScriptedProvider {
    fn submit_job(
        &self,
        credential: &ProviderCredential,
        _spec: &RenderJobSpec,
        timeout: Duration,
    ) -> Result<ProviderJobId, ProviderCallError> {
        let token = credential.bearer_token().to_string();
        self.submit_calls.lock().unwrap().push(token.clone());
        *self.last_timeout.lock().unwrap() = Some(timeout);
        let script = self.submits.lock().unwrap().get(&token).cloned();
        match script {
            Some(SubmitScript::Accept(job)) => Ok(ProviderJobId::new(job).unwrap()),
            Some(SubmitScript::Fail(kind)) => Err(ProviderCallError::new(kind, "scripted failure")),
            Some(SubmitScript::Stall(d)) => {
                thread::sleep(d);
                Err(ProviderCallError::new(ProviderErrorKind::Timeout, "scripted stall"))
            }
            None => Err(ProviderCallError::new(
                ProviderErrorKind::HttpStatus(401),
                "unknown token",
            )),
        }
    }

    fn job_status(
        &self,
        _credential: &ProviderCredential,
        job_id: &ProviderJobId,
    ) -> Result<ProviderJobStatus, ProviderCallError> {
        self.status_calls
            .lock()
            .unwrap()
            .push(job_id.as_str().to_string());
        match self.statuses.lock().unwrap().get(job_id.as_str()).cloned() {
            Some(Ok(status)) => Ok(status),
            Some(Err(kind)) => Err(ProviderCallError::new(kind, "scripted status failure")),
            None => Ok(ProviderJobStatus::Processing),
        }
    }
}

/// Accepts every submission, but each call signals `entered` and then blocks until the
/// test sends on `release`.
pub struct GatedProvider {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
    created: Mutex<Vec<String>>,
}

impl GatedProvider {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let provider = Arc::new(Self {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            created: Mutex::new(Vec::new()),
        });
        (provider, entered_rx, release_tx)
    }

    pub fn created_jobs(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl RenderProvider for GatedProvider {
    fn submit_job(
        &self,
        _credential: &ProviderCredential,
        _spec: &RenderJobSpec,
        _timeout: Duration,
    ) -> Result<ProviderJobId, ProviderCallError> {
        self.entered.lock().unwrap().send(()).unwrap();
        self.release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10))
            .unwrap();
        let mut created = self.created.lock().unwrap();
        let job = format!("job_gated_{}", created.len());
        created.push(job.clone());
        Ok(ProviderJobId::new(job).unwrap())
    }

    fn job_status(
        &self,
        _credential: &ProviderCredential,
        _job_id: &ProviderJobId,
    ) -> Result<ProviderJobStatus, ProviderCallError> {
        Ok(ProviderJobStatus::Processing)
    }
}

/// Fixed credential table: producer credentials first, then the platform one.
#[derive(Default)]
pub struct StaticCredentials {
    credentials: Vec<ProviderCredential>,
}

impl StaticCredentials {
    pub fn new(credentials: Vec<ProviderCredential>) -> Self {
        Self { credentials }
    }
}

impl CredentialSource for StaticCredentials {
    fn candidates_for(&self, producer_id: &ProducerId) -> Vec<ProviderCredential> {
        let own = self
            .credentials
            .iter()
            .filter(|c| matches!(&c.owner, CredentialOwner::Producer(p) if p == producer_id));
        let platform = self
            .credentials
            .iter()
            .filter(|c| c.owner == CredentialOwner::Platform);
        own.chain(platform).cloned().collect()
    }

    fn credential(&self, credential_id: &CredentialId) -> Option<ProviderCredential> {
        self.credentials
            .iter()
            .find(|c| &c.credential_id == credential_id)
            .cloned()
    }
}

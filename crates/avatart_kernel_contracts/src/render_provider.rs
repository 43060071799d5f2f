#![forbid(unsafe_code)]

use std::time::Duration;

use crate::clone_grant::ProducerId;
use crate::common::{string_id, validate_url};
use crate::reel::{AvatarRef, BackgroundSpec, ReelRecord, Resolution, VoiceSpec};
use crate::{ContractViolation, Validate};

string_id!(
    /// Stable id of one provider credential, e.g. `producer:p_1` or `platform`.
    CredentialId,
    "credential_id",
    128
);
string_id!(ProviderJobId, "provider_job_id", 128);

pub const PLATFORM_CREDENTIAL_ID: &str = "platform";

impl CredentialId {
    pub fn for_producer(producer_id: &ProducerId) -> Result<Self, ContractViolation> {
        Self::new(format!("producer:{}", producer_id.as_str()))
    }

    pub fn platform() -> Self {
        Self(PLATFORM_CREDENTIAL_ID.to_string())
    }

    /// Owner encoded in the id: `producer:<producer_id>` or `platform`.
    pub fn owner(&self) -> Option<CredentialOwner> {
        if self.0 == PLATFORM_CREDENTIAL_ID {
            return Some(CredentialOwner::Platform);
        }
        self.0
            .strip_prefix("producer:")
            .and_then(|raw| ProducerId::new(raw).ok())
            .map(CredentialOwner::Producer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialOwner {
    Producer(ProducerId),
    Platform,
}

/// Opaque bearer token plus its provenance. The token never appears in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredential {
    pub credential_id: CredentialId,
    pub owner: CredentialOwner,
    bearer_token: String,
}

impl ProviderCredential {
    pub fn v1(
        credential_id: CredentialId,
        owner: CredentialOwner,
        bearer_token: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let c = Self {
            credential_id,
            owner,
            bearer_token: bearer_token.into(),
        };
        c.validate()?;
        Ok(c)
    }

    pub fn producer(
        producer_id: ProducerId,
        bearer_token: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        Self::v1(
            CredentialId::for_producer(&producer_id)?,
            CredentialOwner::Producer(producer_id),
            bearer_token,
        )
    }

    pub fn platform(bearer_token: impl Into<String>) -> Result<Self, ContractViolation> {
        Self::v1(
            CredentialId::platform(),
            CredentialOwner::Platform,
            bearer_token,
        )
    }

    pub fn bearer_token(&self) -> &str {
        &self.bearer_token
    }
}

impl std::fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredential")
            .field("credential_id", &self.credential_id)
            .field("owner", &self.owner)
            .field("bearer_token", &"<redacted>")
            .finish()
    }
}

impl Validate for ProviderCredential {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.credential_id.validate()?;
        let token = self.bearer_token.trim();
        if token.is_empty() || token.len() > 512 {
            return Err(ContractViolation::InvalidValue {
                field: "provider_credential.bearer_token",
                reason: "must be 1..=512 bytes",
            });
        }
        if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ContractViolation::InvalidValue {
                field: "provider_credential.bearer_token",
                reason: "must not contain whitespace",
            });
        }
        Ok(())
    }
}

/// Everything the provider needs to render one reel.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJobSpec {
    pub avatar_ref: AvatarRef,
    pub script: String,
    pub resolution: Resolution,
    pub background: Option<BackgroundSpec>,
    pub voice: VoiceSpec,
    pub title: Option<String>,
    pub callback_url: Option<String>,
}

impl RenderJobSpec {
    pub fn from_reel(reel: &ReelRecord, callback_url: Option<String>) -> Self {
        Self {
            avatar_ref: reel.avatar_ref.clone(),
            script: reel.script.clone(),
            resolution: reel.config.resolution,
            background: reel.config.background.clone(),
            voice: reel.config.voice.clone(),
            title: Some(reel.title.clone()),
            callback_url,
        }
    }
}

impl Validate for RenderJobSpec {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.avatar_ref.validate()?;
        if self.script.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "render_job_spec.script",
                reason: "must be non-empty",
            });
        }
        if let Some(bg) = &self.background {
            bg.validate()?;
        }
        self.voice.validate()?;
        if let Some(url) = &self.callback_url {
            validate_url("render_job_spec.callback_url", url)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderJobStatus {
    Queued,
    Processing,
    Completed {
        video_url: String,
        thumbnail_url: Option<String>,
        duration_secs: Option<f64>,
    },
    Failed {
        reason: String,
    },
    Unknown {
        raw: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Timeout,
    HttpStatus(u16),
    Transport,
    MalformedBody,
    MissingJobId,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::HttpStatus(_) => "http_status",
            ProviderErrorKind::Transport => "transport",
            ProviderErrorKind::MalformedBody => "malformed_body",
            ProviderErrorKind::MissingJobId => "missing_job_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("render provider {}: {detail}", .kind.as_str())]
pub struct ProviderCallError {
    pub kind: ProviderErrorKind,
    pub detail: String,
}

impl ProviderCallError {
    pub fn new(kind: ProviderErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ProviderErrorKind::Timeout
    }
}

/// Narrow seam to the external rendering service.
pub trait RenderProvider: Send + Sync {
    fn submit_job(
        &self,
        credential: &ProviderCredential,
        spec: &RenderJobSpec,
        timeout: Duration,
    ) -> Result<ProviderJobId, ProviderCallError>;

    fn job_status(
        &self,
        credential: &ProviderCredential,
        job_id: &ProviderJobId,
    ) -> Result<ProviderJobStatus, ProviderCallError>;
}

/// Lookup of stored credentials: the ordered ladder for a producer, or one by id.
pub trait CredentialSource: Send + Sync {
    fn candidates_for(&self, producer_id: &ProducerId) -> Vec<ProviderCredential>;

    fn credential(&self, credential_id: &CredentialId) -> Option<ProviderCredential>;
}

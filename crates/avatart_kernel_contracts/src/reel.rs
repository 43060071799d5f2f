#![forbid(unsafe_code)]

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::clone_grant::{CloneId, ProducerId, SubjectRef};
use crate::common::{string_id, validate_text, validate_url};
use crate::render_provider::{CredentialId, ProviderJobId};
use crate::{ActorId, ContractViolation, SchemaVersion, TimestampNs, Validate};

pub const REEL_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const REEL_TITLE_MAX_CHARS: usize = 200;
pub const REEL_SCRIPT_MAX_CHARS: usize = 5000;
pub const REEL_ERROR_DETAIL_MAX_CHARS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReelId(pub u64);

impl Validate for ReelId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "reel_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for ReelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

string_id!(
    /// Provider-side avatar identifier the clone renders with.
    AvatarRef,
    "avatar_ref",
    128
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    Fhd1080,
    #[serde(rename = "4k")]
    Uhd4k,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Hd720 => "720p",
            Resolution::Fhd1080 => "1080p",
            Resolution::Uhd4k => "4k",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "720p" => Some(Resolution::Hd720),
            "1080p" => Some(Resolution::Fhd1080),
            "4k" | "2160p" => Some(Resolution::Uhd4k),
            _ => None,
        }
    }

    /// Portrait (9:16) frame size in pixels as `(width, height)`.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Resolution::Hd720 => (720, 1280),
            Resolution::Fhd1080 => (1080, 1920),
            Resolution::Uhd4k => (2160, 3840),
        }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Fhd1080
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundKind {
    Color,
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundSpec {
    pub kind: BackgroundKind,
    /// Hex color for `Color`, media url otherwise.
    pub value: String,
}

impl BackgroundSpec {
    pub fn v1(kind: BackgroundKind, value: impl Into<String>) -> Result<Self, ContractViolation> {
        let spec = Self {
            kind,
            value: value.into(),
        };
        spec.validate()?;
        Ok(spec)
    }
}

impl Validate for BackgroundSpec {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self.kind {
            BackgroundKind::Color => {
                let hex = self.value.strip_prefix('#').unwrap_or("");
                if !(hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit())) {
                    return Err(ContractViolation::InvalidValue {
                        field: "background_spec.value",
                        reason: "color must be #RRGGBB",
                    });
                }
                Ok(())
            }
            BackgroundKind::Image | BackgroundKind::Video => {
                validate_url("background_spec.value", &self.value)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSpec {
    pub voice_id: Option<String>,
    pub speed: f32,
}

impl VoiceSpec {
    pub fn v1(voice_id: Option<String>, speed: f32) -> Result<Self, ContractViolation> {
        let spec = Self { voice_id, speed };
        spec.validate()?;
        Ok(spec)
    }
}

impl Default for VoiceSpec {
    fn default() -> Self {
        Self {
            voice_id: None,
            speed: 1.0,
        }
    }
}

impl Validate for VoiceSpec {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(voice_id) = &self.voice_id {
            crate::common::validate_token("voice_spec.voice_id", voice_id, 128)?;
        }
        if !self.speed.is_finite() {
            return Err(ContractViolation::NotFinite {
                field: "voice_spec.speed",
            });
        }
        if !(0.5..=1.5).contains(&self.speed) {
            return Err(ContractViolation::InvalidRange {
                field: "voice_spec.speed",
                min: 0.5,
                max: 1.5,
                got: f64::from(self.speed),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReelRenderConfig {
    pub resolution: Resolution,
    pub background: Option<BackgroundSpec>,
    pub voice: VoiceSpec,
}

impl Validate for ReelRenderConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(bg) = &self.background {
            bg.validate()?;
        }
        self.voice.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReelStatus {
    Pending,
    ApprovedAwaitingSubmission,
    Processing,
    Completed,
    Failed,
    Rejected,
}

impl ReelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReelStatus::Pending => "pending",
            ReelStatus::ApprovedAwaitingSubmission => "approved_awaiting_submission",
            ReelStatus::Processing => "processing",
            ReelStatus::Completed => "completed",
            ReelStatus::Failed => "failed",
            ReelStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReelStatus::Completed | ReelStatus::Failed | ReelStatus::Rejected
        )
    }

    /// No external job exists yet.
    pub fn is_pre_submission(self) -> bool {
        matches!(
            self,
            ReelStatus::Pending | ReelStatus::ApprovedAwaitingSubmission
        )
    }
}

/// Who asked for the reel. Producers requesting with their own clone skip approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requester {
    Producer(ProducerId),
    Subject(SubjectRef),
}

impl Requester {
    pub fn id_str(&self) -> &str {
        match self {
            Requester::Producer(p) => p.as_str(),
            Requester::Subject(s) => s.id.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: ProviderJobId,
    pub credential_id: CredentialId,
    pub submitted_at: TimestampNs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReelResult {
    pub video_url: String,
    pub thumbnail_url: Option<String>,
    pub duration_secs: Option<f64>,
}

impl ReelResult {
    pub fn v1(
        video_url: impl Into<String>,
        thumbnail_url: Option<String>,
        duration_secs: Option<f64>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            video_url: video_url.into(),
            thumbnail_url,
            duration_secs,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ReelResult {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_url("reel_result.video_url", &self.video_url)?;
        if let Some(t) = &self.thumbnail_url {
            validate_url("reel_result.thumbnail_url", t)?;
        }
        if let Some(d) = self.duration_secs {
            if !d.is_finite() {
                return Err(ContractViolation::NotFinite {
                    field: "reel_result.duration_secs",
                });
            }
            if d < 0.0 {
                return Err(ContractViolation::InvalidRange {
                    field: "reel_result.duration_secs",
                    min: 0.0,
                    max: f64::MAX,
                    got: d,
                });
            }
        }
        Ok(())
    }
}

/// Submission input before an id is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ReelDraft {
    pub requester: Requester,
    pub clone_id: CloneId,
    pub producer_id: ProducerId,
    pub avatar_ref: AvatarRef,
    pub title: String,
    pub script: String,
    pub config: ReelRenderConfig,
    pub base_cost: Decimal,
}

impl ReelDraft {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        requester: Requester,
        clone_id: CloneId,
        producer_id: ProducerId,
        avatar_ref: AvatarRef,
        title: impl Into<String>,
        script: impl Into<String>,
        config: ReelRenderConfig,
        base_cost: Decimal,
    ) -> Result<Self, ContractViolation> {
        let d = Self {
            requester,
            clone_id,
            producer_id,
            avatar_ref,
            title: title.into(),
            script: script.into(),
            config,
            base_cost,
        };
        d.validate()?;
        Ok(d)
    }

    pub fn requested_by_owner(&self) -> bool {
        matches!(&self.requester, Requester::Producer(p) if *p == self.producer_id)
    }
}

impl Validate for ReelDraft {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.clone_id.validate()?;
        self.producer_id.validate()?;
        self.avatar_ref.validate()?;
        validate_text("reel_draft.title", &self.title, REEL_TITLE_MAX_CHARS)?;
        validate_text("reel_draft.script", &self.script, REEL_SCRIPT_MAX_CHARS)?;
        self.config.validate()?;
        if self.base_cost.is_sign_negative() {
            return Err(ContractViolation::InvalidValue {
                field: "reel_draft.base_cost",
                reason: "must be >= 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReelRecord {
    pub schema_version: SchemaVersion,
    pub reel_id: ReelId,
    pub requester: Requester,
    pub clone_id: CloneId,
    pub producer_id: ProducerId,
    pub avatar_ref: AvatarRef,
    pub title: String,
    pub script: String,
    pub config: ReelRenderConfig,
    pub estimated_duration_secs: u32,
    pub base_cost: Decimal,
    pub status: ReelStatus,
    pub job: Option<JobHandle>,
    pub result: Option<ReelResult>,
    pub error_detail: Option<String>,
    pub approved_by: Option<ActorId>,
    pub review_notes: Option<String>,
    pub submission_attempts: u32,
    pub last_submission_error: Option<String>,
    pub poll_misses: u32,
    /// Set while a dispatcher owns the submission round for this reel.
    pub dispatch_in_flight: bool,
    pub commission_emitted: bool,
    pub created_at: TimestampNs,
    pub approved_at: Option<TimestampNs>,
    pub processing_started_at: Option<TimestampNs>,
    pub processing_ended_at: Option<TimestampNs>,
}

impl ReelRecord {
    pub fn from_draft(
        reel_id: ReelId,
        draft: ReelDraft,
        estimated_duration_secs: u32,
        now: TimestampNs,
    ) -> Result<Self, ContractViolation> {
        let rec = Self {
            schema_version: REEL_CONTRACT_VERSION,
            reel_id,
            requester: draft.requester,
            clone_id: draft.clone_id,
            producer_id: draft.producer_id,
            avatar_ref: draft.avatar_ref,
            title: draft.title,
            script: draft.script,
            config: draft.config,
            estimated_duration_secs,
            base_cost: draft.base_cost,
            status: ReelStatus::Pending,
            job: None,
            result: None,
            error_detail: None,
            approved_by: None,
            review_notes: None,
            submission_attempts: 0,
            last_submission_error: None,
            poll_misses: 0,
            dispatch_in_flight: false,
            commission_emitted: false,
            created_at: now,
            approved_at: None,
            processing_started_at: None,
            processing_ended_at: None,
        };
        rec.validate()?;
        Ok(rec)
    }
}

impl Validate for ReelRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != REEL_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "reel_record.schema_version",
                reason: "must match REEL_CONTRACT_VERSION",
            });
        }
        self.reel_id.validate()?;
        self.avatar_ref.validate()?;
        validate_text("reel_record.title", &self.title, REEL_TITLE_MAX_CHARS)?;
        validate_text("reel_record.script", &self.script, REEL_SCRIPT_MAX_CHARS)?;
        self.config.validate()?;
        if self.status == ReelStatus::Processing && self.job.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "reel_record.job",
                reason: "processing requires a job handle",
            });
        }
        if self.status == ReelStatus::Completed && self.result.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "reel_record.result",
                reason: "completed requires a result",
            });
        }
        if let Some(r) = &self.result {
            r.validate()?;
        }
        if let Some(e) = &self.error_detail {
            if e.chars().count() > REEL_ERROR_DETAIL_MAX_CHARS {
                return Err(ContractViolation::InvalidValue {
                    field: "reel_record.error_detail",
                    reason: "exceeds max length",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReelAction {
    Create,
    Approve,
    Reject,
    AttachJob,
    StartProcessing,
    Complete,
    Fail,
    Resubmit,
    SubmissionFailed,
}

impl ReelAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ReelAction::Create => "create",
            ReelAction::Approve => "approve",
            ReelAction::Reject => "reject",
            ReelAction::AttachJob => "attach_job",
            ReelAction::StartProcessing => "start_processing",
            ReelAction::Complete => "complete",
            ReelAction::Fail => "fail",
            ReelAction::Resubmit => "resubmit",
            ReelAction::SubmissionFailed => "submission_failed",
        }
    }
}

/// Append-only audit row for one reel transition or annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReelAuditEvent {
    pub reel_id: ReelId,
    pub action: ReelAction,
    pub from: ReelStatus,
    pub to: ReelStatus,
    pub actor: Option<ActorId>,
    pub detail: Option<String>,
    pub at: TimestampNs,
}

/// Emitted once per reel completion for downstream accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionEvent {
    pub requester_id: String,
    pub reel_id: ReelId,
    pub base_cost: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone_grant::{SubjectId, SubjectKind};

    fn draft(requester: Requester) -> ReelDraft {
        ReelDraft::v1(
            requester,
            CloneId::new("clone_a").unwrap(),
            ProducerId::new("producer_a").unwrap(),
            AvatarRef::new("avatar_123").unwrap(),
            "Launch teaser",
            "Hello world, this is a teaser.",
            ReelRenderConfig::default(),
            Decimal::new(500, 2),
        )
        .unwrap()
    }

    #[test]
    fn at_reel_01_resolution_mapping_is_portrait() {
        assert_eq!(Resolution::Hd720.dimensions(), (720, 1280));
        assert_eq!(Resolution::Fhd1080.dimensions(), (1080, 1920));
        assert_eq!(Resolution::Uhd4k.dimensions(), (2160, 3840));
        assert_eq!(Resolution::parse("4K"), Some(Resolution::Uhd4k));
        assert_eq!(Resolution::parse("480p"), None);
        assert_eq!(Resolution::default(), Resolution::Fhd1080);
    }

    #[test]
    fn at_reel_02_background_color_must_be_hex() {
        assert!(BackgroundSpec::v1(BackgroundKind::Color, "#00ff88").is_ok());
        assert!(BackgroundSpec::v1(BackgroundKind::Color, "green").is_err());
        assert!(BackgroundSpec::v1(BackgroundKind::Image, "https://x.test/bg.png").is_ok());
        assert!(BackgroundSpec::v1(BackgroundKind::Video, "not a url").is_err());
    }

    #[test]
    fn at_reel_03_voice_speed_bounded_and_finite() {
        assert!(VoiceSpec::v1(None, 1.2).is_ok());
        assert!(matches!(
            VoiceSpec::v1(None, 2.0),
            Err(ContractViolation::InvalidRange { .. })
        ));
        assert!(matches!(
            VoiceSpec::v1(None, f32::NAN),
            Err(ContractViolation::NotFinite { .. })
        ));
    }

    #[test]
    fn at_reel_04_owner_detection() {
        let owner = draft(Requester::Producer(ProducerId::new("producer_a").unwrap()));
        assert!(owner.requested_by_owner());
        let other = draft(Requester::Producer(ProducerId::new("producer_b").unwrap()));
        assert!(!other.requested_by_owner());
        let subject = draft(Requester::Subject(SubjectRef::new(
            SubjectKind::Subproducer,
            SubjectId::new("sub_1").unwrap(),
        )));
        assert!(!subject.requested_by_owner());
        assert_eq!(subject.requester.id_str(), "sub_1");
    }

    #[test]
    fn at_reel_05_new_record_starts_pending_without_job() {
        let rec = ReelRecord::from_draft(
            ReelId(1),
            draft(Requester::Producer(ProducerId::new("producer_a").unwrap())),
            12,
            TimestampNs(5),
        )
        .unwrap();
        assert_eq!(rec.status, ReelStatus::Pending);
        assert!(rec.job.is_none());
        assert!(!rec.commission_emitted);
        assert!(rec.status.is_pre_submission());
    }

    #[test]
    fn at_reel_06_empty_script_rejected() {
        let err = ReelDraft::v1(
            Requester::Producer(ProducerId::new("p").unwrap()),
            CloneId::new("c").unwrap(),
            ProducerId::new("p").unwrap(),
            AvatarRef::new("a").unwrap(),
            "t",
            "   ",
            ReelRenderConfig::default(),
            Decimal::ZERO,
        );
        assert!(err.is_err());
    }
}

#![forbid(unsafe_code)]

use std::env;
use std::time::Duration;

use avatart_kernel_contracts::reel::BackgroundKind;
use avatart_kernel_contracts::render_provider::{
    ProviderCallError, ProviderCredential, ProviderErrorKind, ProviderJobId, ProviderJobStatus,
    RenderJobSpec, RenderProvider,
};
use avatart_kernel_contracts::Validate;
use serde_json::{json, Value};

pub const DEFAULT_RENDER_BASE_URL: &str = "https://api.heygen.com";
const GENERATE_PATH: &str = "/v2/video/generate";
const STATUS_PATH: &str = "/v1/video_status.get";
const PORTRAIT_ASPECT_RATIO: &str = "9:16";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderProviderHttpConfig {
    pub base_url: String,
    pub connect_timeout_ms: u32,
    pub status_timeout_ms: u32,
    pub user_agent: String,
    pub proxy_url: Option<String>,
}

impl RenderProviderHttpConfig {
    pub fn mvp_v1() -> Self {
        Self {
            base_url: DEFAULT_RENDER_BASE_URL.to_string(),
            connect_timeout_ms: 5_000,
            status_timeout_ms: 10_000,
            user_agent: "avatart-render/1.0".to_string(),
            proxy_url: None,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::mvp_v1();
        let base_url = env::var("AVATART_RENDER_BASE_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| v.starts_with("https://") || v.starts_with("http://"))
            .unwrap_or(defaults.base_url);
        let status_timeout_ms = env::var("AVATART_RENDER_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| (100..=120_000).contains(v))
            .unwrap_or(defaults.status_timeout_ms);
        let proxy_url = env::var("AVATART_RENDER_PROXY_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        Self {
            base_url,
            status_timeout_ms,
            proxy_url,
            ..defaults
        }
    }
}

/// `RenderProvider` over the HeyGen-style REST API.
#[derive(Debug, Clone)]
pub struct HttpRenderProvider {
    config: RenderProviderHttpConfig,
}

impl HttpRenderProvider {
    pub fn new(config: RenderProviderHttpConfig) -> Self {
        Self { config }
    }

    fn agent(&self, timeout: Duration) -> Result<ureq::Agent, ProviderCallError> {
        let timeout = timeout.max(Duration::from_millis(100));
        let connect = Duration::from_millis(u64::from(self.config.connect_timeout_ms)).min(timeout);
        let mut builder = ureq::AgentBuilder::new()
            .timeout_connect(connect)
            .timeout(timeout)
            .user_agent(&self.config.user_agent)
            .try_proxy_from_env(false);
        if let Some(proxy_url) = self.config.proxy_url.as_deref() {
            let proxy = ureq::Proxy::new(proxy_url).map_err(|_| {
                ProviderCallError::new(ProviderErrorKind::Transport, "invalid proxy url")
            })?;
            builder = builder.proxy(proxy);
        }
        Ok(builder.build())
    }
}

impl RenderProvider for HttpRenderProvider {
    fn submit_job(
        &self,
        credential: &ProviderCredential,
        spec: &RenderJobSpec,
        timeout: Duration,
    ) -> Result<ProviderJobId, ProviderCallError> {
        spec.validate().map_err(|v| {
            ProviderCallError::new(ProviderErrorKind::MalformedBody, format!("spec: {v}"))
        })?;
        let endpoint = format!("{}{}", self.config.base_url, GENERATE_PATH);
        let response = self
            .agent(timeout)?
            .post(&endpoint)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .set("X-Api-Key", credential.bearer_token())
            .send_json(build_generate_payload(spec))
            .map_err(provider_error_from_ureq)?;
        let body: Value = serde_json::from_reader(response.into_reader()).map_err(|_| {
            ProviderCallError::new(ProviderErrorKind::MalformedBody, "json_parse")
        })?;
        parse_generate_response(&body)
    }

    fn job_status(
        &self,
        credential: &ProviderCredential,
        job_id: &ProviderJobId,
    ) -> Result<ProviderJobStatus, ProviderCallError> {
        let endpoint = format!("{}{}", self.config.base_url, STATUS_PATH);
        let timeout = Duration::from_millis(u64::from(self.config.status_timeout_ms));
        let response = self
            .agent(timeout)?
            .get(&endpoint)
            .query("video_id", job_id.as_str())
            .set("Accept", "application/json")
            .set("X-Api-Key", credential.bearer_token())
            .call()
            .map_err(provider_error_from_ureq)?;
        let body: Value = serde_json::from_reader(response.into_reader()).map_err(|_| {
            ProviderCallError::new(ProviderErrorKind::MalformedBody, "json_parse")
        })?;
        parse_status_response(&body)
    }
}

pub(crate) fn build_generate_payload(spec: &RenderJobSpec) -> Value {
    let mut voice = json!({
        "type": "text",
        "input_text": spec.script,
        "speed": spec.voice.speed,
    });
    if let Some(voice_id) = &spec.voice.voice_id {
        voice["voice_id"] = json!(voice_id);
    }

    let mut video_input = json!({
        "character": {
            "type": "avatar",
            "avatar_id": spec.avatar_ref.as_str(),
            "avatar_style": "normal",
        },
        "voice": voice,
    });
    if let Some(bg) = &spec.background {
        video_input["background"] = match bg.kind {
            BackgroundKind::Color => json!({ "type": "color", "value": bg.value }),
            BackgroundKind::Image => json!({ "type": "image", "url": bg.value }),
            BackgroundKind::Video => json!({ "type": "video", "url": bg.value }),
        };
    }

    let (width, height) = spec.resolution.dimensions();
    let mut payload = json!({
        "video_inputs": [video_input],
        "dimension": { "width": width, "height": height },
        "aspect_ratio": PORTRAIT_ASPECT_RATIO,
        "test": false,
    });
    if let Some(title) = &spec.title {
        payload["title"] = json!(title);
    }
    if let Some(callback_url) = &spec.callback_url {
        payload["callback_url"] = json!(callback_url);
    }
    payload
}

pub(crate) fn parse_generate_response(body: &Value) -> Result<ProviderJobId, ProviderCallError> {
    let job_id = body
        .pointer("/data/video_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match job_id {
        Some(id) => ProviderJobId::new(id).map_err(|_| {
            ProviderCallError::new(ProviderErrorKind::MalformedBody, "invalid video_id")
        }),
        None => Err(ProviderCallError::new(
            ProviderErrorKind::MissingJobId,
            error_message(body).unwrap_or_else(|| "response without video_id".to_string()),
        )),
    }
}

pub(crate) fn parse_status_response(body: &Value) -> Result<ProviderJobStatus, ProviderCallError> {
    let Some(data) = body.get("data").filter(|d| d.is_object()) else {
        return Err(ProviderCallError::new(
            ProviderErrorKind::MalformedBody,
            error_message(body).unwrap_or_else(|| "status response without data".to_string()),
        ));
    };
    let raw = data
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let status = match raw.as_str() {
        "pending" | "waiting" => ProviderJobStatus::Queued,
        "processing" => ProviderJobStatus::Processing,
        "completed" => match non_empty_str(data, "video_url") {
            Some(video_url) => ProviderJobStatus::Completed {
                video_url,
                thumbnail_url: non_empty_str(data, "thumbnail_url"),
                duration_secs: data.get("duration").and_then(Value::as_f64),
            },
            None => ProviderJobStatus::Failed {
                reason: "completed without video url".to_string(),
            },
        },
        "failed" => ProviderJobStatus::Failed {
            reason: error_message(data).unwrap_or_else(|| "provider reported failure".to_string()),
        },
        _ => ProviderJobStatus::Unknown { raw },
    };
    Ok(status)
}

fn non_empty_str(obj: &Value, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn error_message(obj: &Value) -> Option<String> {
    match obj.get("error") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => non_empty_str(obj, "error_message").or_else(|| non_empty_str(obj, "message")),
    }
}

fn provider_error_from_ureq(err: ureq::Error) -> ProviderCallError {
    match err {
        ureq::Error::Status(status, _) => ProviderCallError::new(
            ProviderErrorKind::HttpStatus(status),
            format!("http_non_2xx status={status}"),
        ),
        ureq::Error::Transport(transport) => {
            let combined = format!("{:?} {}", transport.kind(), transport);
            let kind = classify_transport_error_kind(&combined);
            ProviderCallError::new(kind, combined)
        }
    }
}

fn classify_transport_error_kind(raw: &str) -> ProviderErrorKind {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ProviderErrorKind::Timeout
    } else {
        ProviderErrorKind::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avatart_kernel_contracts::reel::{
        AvatarRef, BackgroundSpec, Resolution, VoiceSpec,
    };

    fn spec() -> RenderJobSpec {
        RenderJobSpec {
            avatar_ref: AvatarRef::new("avatar_99").unwrap(),
            script: "Hola a todos".to_string(),
            resolution: Resolution::Hd720,
            background: Some(BackgroundSpec::v1(BackgroundKind::Color, "#112233").unwrap()),
            voice: VoiceSpec::v1(Some("voice_es_1".to_string()), 1.1).unwrap(),
            title: Some("Saludo".to_string()),
            callback_url: None,
        }
    }

    #[test]
    fn at_render_http_01_payload_carries_avatar_voice_and_dimension() {
        let p = build_generate_payload(&spec());
        assert_eq!(p["video_inputs"][0]["character"]["avatar_id"], "avatar_99");
        assert_eq!(p["video_inputs"][0]["voice"]["input_text"], "Hola a todos");
        assert_eq!(p["video_inputs"][0]["voice"]["voice_id"], "voice_es_1");
        assert_eq!(p["video_inputs"][0]["background"]["value"], "#112233");
        assert_eq!(p["dimension"]["width"], 720);
        assert_eq!(p["dimension"]["height"], 1280);
        assert_eq!(p["aspect_ratio"], "9:16");
        assert_eq!(p["title"], "Saludo");
        assert!(p.get("callback_url").is_none());
    }

    #[test]
    fn at_render_http_02_image_background_uses_url_field() {
        let mut s = spec();
        s.background =
            Some(BackgroundSpec::v1(BackgroundKind::Image, "https://cdn.test/bg.png").unwrap());
        s.voice.voice_id = None;
        let p = build_generate_payload(&s);
        assert_eq!(p["video_inputs"][0]["background"]["url"], "https://cdn.test/bg.png");
        assert!(p["video_inputs"][0]["voice"].get("voice_id").is_none());
    }

    #[test]
    fn at_render_http_03_generate_response_requires_video_id() {
        let ok = json!({ "error": null, "data": { "video_id": "vid_123" } });
        assert_eq!(parse_generate_response(&ok).unwrap().as_str(), "vid_123");

        let missing = json!({ "error": { "code": "quota", "message": "insufficient credit" }, "data": null });
        let err = parse_generate_response(&missing).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::MissingJobId);
        assert_eq!(err.detail, "insufficient credit");
    }

    #[test]
    fn at_render_http_04_status_mapping() {
        let queued = json!({ "data": { "status": "waiting" } });
        assert_eq!(parse_status_response(&queued).unwrap(), ProviderJobStatus::Queued);

        let done = json!({ "data": {
            "status": "completed",
            "video_url": "https://cdn.test/v.mp4",
            "thumbnail_url": "https://cdn.test/t.jpg",
            "duration": 14.2
        }});
        assert_eq!(
            parse_status_response(&done).unwrap(),
            ProviderJobStatus::Completed {
                video_url: "https://cdn.test/v.mp4".to_string(),
                thumbnail_url: Some("https://cdn.test/t.jpg".to_string()),
                duration_secs: Some(14.2),
            }
        );

        let failed = json!({ "data": { "status": "failed", "error": { "message": "bad avatar" } } });
        assert_eq!(
            parse_status_response(&failed).unwrap(),
            ProviderJobStatus::Failed { reason: "bad avatar".to_string() }
        );

        let odd = json!({ "data": { "status": "draft" } });
        assert_eq!(
            parse_status_response(&odd).unwrap(),
            ProviderJobStatus::Unknown { raw: "draft".to_string() }
        );
    }

    #[test]
    fn at_render_http_05_completed_without_url_is_failure() {
        let body = json!({ "data": { "status": "completed", "video_url": "" } });
        assert_eq!(
            parse_status_response(&body).unwrap(),
            ProviderJobStatus::Failed { reason: "completed without video url".to_string() }
        );
    }

    #[test]
    fn at_render_http_06_missing_data_is_malformed() {
        let err = parse_status_response(&json!({ "message": "not found" })).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::MalformedBody);
        assert_eq!(err.detail, "not found");
    }

    #[test]
    fn at_render_http_07_transport_timeout_classification() {
        assert_eq!(
            classify_transport_error_kind("Io timed out reading response"),
            ProviderErrorKind::Timeout
        );
        assert_eq!(
            classify_transport_error_kind("ConnectionFailed dns lookup"),
            ProviderErrorKind::Transport
        );
    }
}

#![forbid(unsafe_code)]

use avatart_kernel_contracts::render_provider::{ProviderJobId, ProviderJobStatus};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_VIDEO_SUCCESS: &str = "avatar_video.success";
pub const EVENT_VIDEO_FAIL: &str = "avatar_video.fail";

/// Constant-time check of a hex HMAC-SHA256 over the raw request body.
pub fn verify_callback_signature(body: &[u8], signature_hex: &str, secret: &[u8]) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn sign_callback_body(body: &[u8], secret: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallbackEvent {
    pub job_id: ProviderJobId,
    pub status: ProviderJobStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackParseError {
    #[error("callback body is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("callback event has no usable video_id")]
    MissingJobId,
    #[error("unsupported callback event type: {0}")]
    UnsupportedEvent(String),
}

#[derive(Debug, Deserialize)]
struct RawCallback {
    event_type: String,
    event_data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    video_id: Option<String>,
    url: Option<String>,
    thumbnail_url: Option<String>,
    duration: Option<f64>,
    msg: Option<String>,
}

pub fn parse_callback_event(body: &[u8]) -> Result<CallbackEvent, CallbackParseError> {
    let raw: RawCallback = serde_json::from_slice(body)?;
    let job_id = raw
        .event_data
        .video_id
        .as_deref()
        .and_then(|v| ProviderJobId::new(v.trim()).ok())
        .ok_or(CallbackParseError::MissingJobId)?;
    let data = raw.event_data;
    let status = match raw.event_type.as_str() {
        EVENT_VIDEO_SUCCESS => match data.url.filter(|u| !u.trim().is_empty()) {
            Some(video_url) => ProviderJobStatus::Completed {
                video_url,
                thumbnail_url: data.thumbnail_url,
                duration_secs: data.duration,
            },
            None => ProviderJobStatus::Failed {
                reason: "completed without video url".to_string(),
            },
        },
        EVENT_VIDEO_FAIL => ProviderJobStatus::Failed {
            reason: data
                .msg
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "provider reported failure".to_string()),
        },
        other => return Err(CallbackParseError::UnsupportedEvent(other.to_string())),
    };
    Ok(CallbackEvent { job_id, status })
}

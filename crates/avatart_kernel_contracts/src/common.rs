#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(pub u32);

/// Wall-clock instant in nanoseconds since the Unix epoch (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimestampNs(pub u64);

impl TimestampNs {
    pub const NANOS_PER_SEC: u64 = 1_000_000_000;

    pub fn from_unix_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(Self::NANOS_PER_SEC))
    }

    pub fn unix_secs(self) -> u64 {
        self.0 / Self::NANOS_PER_SEC
    }

    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms.saturating_mul(1_000_000)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReasonCodeId(pub u32);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractViolation {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field} out of range [{min}, {max}]: got {got}")]
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
        got: f64,
    },
    #[error("{field} must be finite")]
    NotFinite { field: &'static str },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

/// Declares a validated string identifier with `new` / `as_str`.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $field:literal, $max_len:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self, $crate::ContractViolation> {
                let v = Self(id.into());
                $crate::Validate::validate(&v)?;
                Ok(v)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl $crate::Validate for $name {
            fn validate(&self) -> Result<(), $crate::ContractViolation> {
                $crate::common::validate_token($field, &self.0, $max_len)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

pub(crate) use string_id;

string_id!(
    /// Whoever performed an administrative action (granting, approving, resubmitting).
    ActorId,
    "actor_id",
    96
);

pub(crate) fn validate_token(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be non-empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    if value.chars().any(|c| {
        !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':' || c == '.' || c == '/')
    }) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must contain token-safe ASCII only",
        });
    }
    Ok(())
}

pub(crate) fn validate_text(
    field: &'static str,
    value: &str,
    max_chars: usize,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be non-empty",
        });
    }
    if value.chars().count() > max_chars {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    if value.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain control characters",
        });
    }
    Ok(())
}

pub(crate) fn validate_url(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    validate_text(field, value, 2048)?;
    if !(value.starts_with("https://") || value.starts_with("http://")) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be an http(s) url",
        });
    }
    if value.chars().any(char::is_whitespace) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain whitespace",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_common_01_token_rejects_whitespace_and_empty() {
        assert!(validate_token("t", "", 8).is_err());
        assert!(validate_token("t", "a b", 8).is_err());
        assert!(validate_token("t", "producer:p_1", 32).is_ok());
        assert!(validate_token("t", "abcdefghij", 4).is_err());
    }

    #[test]
    fn at_common_02_url_requires_http_scheme() {
        assert!(validate_url("u", "https://cdn.example.com/v.mp4").is_ok());
        assert!(validate_url("u", "ftp://cdn.example.com/v.mp4").is_err());
        assert!(validate_url("u", "https://cdn.example.com/a b.mp4").is_err());
    }

    #[test]
    fn at_common_03_timestamp_conversions() {
        let t = TimestampNs::from_unix_secs(86_400);
        assert_eq!(t.unix_secs(), 86_400);
        assert_eq!(t.saturating_add_ms(1_500).0, 86_400 * 1_000_000_000 + 1_500_000_000);
    }
}

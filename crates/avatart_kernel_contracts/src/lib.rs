#![forbid(unsafe_code)]

pub mod clone_grant;
pub mod common;
pub mod reel;
pub mod render_provider;

pub use common::{ActorId, ContractViolation, ReasonCodeId, SchemaVersion, TimestampNs, Validate};

#![forbid(unsafe_code)]

pub mod callback_signature;
pub mod clone_access;
pub mod credential_vault;
pub mod quota_ledger;
pub mod reel_transitions;
pub mod render_http;

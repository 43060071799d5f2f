#![forbid(unsafe_code)]

pub mod access_decision;
pub mod generation_flow;
pub mod job_dispatcher;
pub mod job_monitor;
pub mod permission_registry;
pub mod reel_state_machine;

#[cfg(test)]
pub(crate) mod test_support;

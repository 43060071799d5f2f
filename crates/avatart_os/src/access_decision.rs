#![forbid(unsafe_code)]

use std::sync::Arc;

use avatart_engines::clone_access::evaluate_clone_access;
use avatart_engines::quota_ledger;
use avatart_kernel_contracts::clone_grant::{
    AccessDenyReason, CloneAccessDecision, CloneGrantKey, CloneId, ProducerId, SubjectId,
};
use avatart_kernel_contracts::TimestampNs;
use avatart_storage::repo::CloneGrantRepo;
use tracing::debug;

use crate::permission_registry::{GrantError, PermissionRegistry};

/// Answers "may this subject use this clone now?".
#[derive(Debug)]
pub struct AccessDecisionService<R> {
    registry: PermissionRegistry<R>,
}

impl<R> Clone for AccessDecisionService<R> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<R: CloneGrantRepo> AccessDecisionService<R> {
    pub fn new(registry: PermissionRegistry<R>) -> Self {
        Self { registry }
    }

    /// Pure read; never mutates the grant.
    pub fn can_use(
        &self,
        subject_id: &SubjectId,
        clone_id: &CloneId,
        now: TimestampNs,
    ) -> Result<CloneAccessDecision, GrantError> {
        let key = CloneGrantKey::new(clone_id.clone(), subject_id.clone());
        let grant = self.registry.get(&key)?;
        let decision = evaluate_clone_access(grant.as_ref(), now);
        debug!(grant = %key, allowed = decision.allowed, reason = decision.reason(), "clone access evaluated");
        Ok(decision)
    }

    /// Clone ownership arrives with the request. It is accepted unless an existing grant for
    /// the clone names a different producer.
    pub fn producer_owns(
        &self,
        producer_id: &ProducerId,
        clone_id: &CloneId,
    ) -> Result<bool, GrantError> {
        Ok(self
            .registry
            .owner_of(clone_id)?
            .map_or(true, |owner| &owner == producer_id))
    }

    /// Evaluate and consume one use inside the grant's row transaction.
    ///
    /// Denials leave the grant untouched. An allowed decision carries the grant as it
    /// stands after the increment.
    pub fn authorize_and_record(
        &self,
        subject_id: &SubjectId,
        clone_id: &CloneId,
        now: TimestampNs,
    ) -> Result<CloneAccessDecision, GrantError> {
        let key = CloneGrantKey::new(clone_id.clone(), subject_id.clone());
        let outcome = self.registry.repo().update_clone_grant_row(&key, |g| {
            let decision = evaluate_clone_access(Some(g), now);
            if !decision.allowed {
                return Ok(decision);
            }
            quota_ledger::record_use(g, now)?;
            Ok::<_, GrantError>(CloneAccessDecision::allow(g.clone()))
        });
        match outcome {
            Err(GrantError::NotFound { .. }) => Ok(CloneAccessDecision::deny(
                AccessDenyReason::NoPermission,
                None,
            )),
            other => other,
        }
    }
}

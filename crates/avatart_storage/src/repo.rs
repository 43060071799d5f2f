#![forbid(unsafe_code)]

use avatart_kernel_contracts::clone_grant::{
    CloneGrantKey, CloneGrantRecord, CloneId, GrantStatus, ProducerId, SubjectId,
};
use avatart_kernel_contracts::reel::{ReelAuditEvent, ReelId, ReelRecord, ReelStatus};
use avatart_kernel_contracts::render_provider::ProviderJobId;

use crate::store::{AvatartStore, StorageError};

/// Typed repository interface for clone permission grants.
pub trait CloneGrantRepo: Send + Sync {
    fn insert_clone_grant_row(&self, record: CloneGrantRecord) -> Result<(), StorageError>;

    fn clone_grant_row(&self, key: &CloneGrantKey)
        -> Result<Option<CloneGrantRecord>, StorageError>;

    fn update_clone_grant_row<T, E>(
        &self,
        key: &CloneGrantKey,
        f: impl FnOnce(&mut CloneGrantRecord) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>;

    fn clone_grant_keys(&self) -> Result<Vec<CloneGrantKey>, StorageError>;

    fn clone_grant_rows_by_subject(
        &self,
        subject_id: &SubjectId,
        status: Option<GrantStatus>,
    ) -> Result<Vec<CloneGrantRecord>, StorageError>;

    fn clone_grant_rows_by_clone(
        &self,
        clone_id: &CloneId,
        status: Option<GrantStatus>,
    ) -> Result<Vec<CloneGrantRecord>, StorageError>;

    fn clone_grant_rows_by_producer(
        &self,
        producer_id: &ProducerId,
        status: Option<GrantStatus>,
    ) -> Result<Vec<CloneGrantRecord>, StorageError>;
}

/// Typed repository interface for reels, their job index, and the reel audit log.
pub trait ReelRepo: Send + Sync {
    fn allocate_reel_id(&self) -> ReelId;

    fn insert_reel_row(
        &self,
        record: ReelRecord,
        created: ReelAuditEvent,
    ) -> Result<(), StorageError>;

    fn reel_row(&self, reel_id: ReelId) -> Result<Option<ReelRecord>, StorageError>;

    fn update_reel_row<T, E>(
        &self,
        reel_id: ReelId,
        f: impl FnOnce(&mut ReelRecord) -> Result<(T, Vec<ReelAuditEvent>), E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>;

    fn reel_id_for_job(&self, job_id: &ProviderJobId) -> Result<Option<ReelId>, StorageError>;

    fn reel_rows_in_status(
        &self,
        status: ReelStatus,
        limit: usize,
    ) -> Result<Vec<ReelRecord>, StorageError>;

    fn append_reel_audit_row(&self, event: ReelAuditEvent) -> Result<(), StorageError>;

    fn reel_audit_rows(&self, reel_id: ReelId) -> Result<Vec<ReelAuditEvent>, StorageError>;
}

fn status_matches(filter: Option<GrantStatus>, record: &CloneGrantRecord) -> bool {
    filter.map_or(true, |s| record.status == s)
}

impl CloneGrantRepo for AvatartStore {
    fn insert_clone_grant_row(&self, record: CloneGrantRecord) -> Result<(), StorageError> {
        self.insert_clone_grant(record)
    }

    fn clone_grant_row(
        &self,
        key: &CloneGrantKey,
    ) -> Result<Option<CloneGrantRecord>, StorageError> {
        self.clone_grant(key)
    }

    fn update_clone_grant_row<T, E>(
        &self,
        key: &CloneGrantKey,
        f: impl FnOnce(&mut CloneGrantRecord) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        self.update_clone_grant(key, f)
    }

    fn clone_grant_keys(&self) -> Result<Vec<CloneGrantKey>, StorageError> {
        AvatartStore::clone_grant_keys(self)
    }

    fn clone_grant_rows_by_subject(
        &self,
        subject_id: &SubjectId,
        status: Option<GrantStatus>,
    ) -> Result<Vec<CloneGrantRecord>, StorageError> {
        self.clone_grants_matching(|g| g.subject.id == *subject_id && status_matches(status, g))
    }

    fn clone_grant_rows_by_clone(
        &self,
        clone_id: &CloneId,
        status: Option<GrantStatus>,
    ) -> Result<Vec<CloneGrantRecord>, StorageError> {
        self.clone_grants_matching(|g| g.clone_id == *clone_id && status_matches(status, g))
    }

    fn clone_grant_rows_by_producer(
        &self,
        producer_id: &ProducerId,
        status: Option<GrantStatus>,
    ) -> Result<Vec<CloneGrantRecord>, StorageError> {
        self.clone_grants_matching(|g| g.producer_id == *producer_id && status_matches(status, g))
    }
}

impl ReelRepo for AvatartStore {
    fn allocate_reel_id(&self) -> ReelId {
        AvatartStore::allocate_reel_id(self)
    }

    fn insert_reel_row(
        &self,
        record: ReelRecord,
        created: ReelAuditEvent,
    ) -> Result<(), StorageError> {
        self.insert_reel(record, created)
    }

    fn reel_row(&self, reel_id: ReelId) -> Result<Option<ReelRecord>, StorageError> {
        self.reel(reel_id)
    }

    fn update_reel_row<T, E>(
        &self,
        reel_id: ReelId,
        f: impl FnOnce(&mut ReelRecord) -> Result<(T, Vec<ReelAuditEvent>), E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        self.update_reel(reel_id, f)
    }

    fn reel_id_for_job(&self, job_id: &ProviderJobId) -> Result<Option<ReelId>, StorageError> {
        AvatartStore::reel_id_for_job(self, job_id)
    }

    fn reel_rows_in_status(
        &self,
        status: ReelStatus,
        limit: usize,
    ) -> Result<Vec<ReelRecord>, StorageError> {
        self.reels_in_status(status, limit)
    }

    fn append_reel_audit_row(&self, event: ReelAuditEvent) -> Result<(), StorageError> {
        self.append_reel_audit(event)
    }

    fn reel_audit_rows(&self, reel_id: ReelId) -> Result<Vec<ReelAuditEvent>, StorageError> {
        self.reel_audit_events(reel_id)
    }
}

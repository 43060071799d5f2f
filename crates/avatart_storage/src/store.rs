#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use avatart_kernel_contracts::clone_grant::{CloneGrantKey, CloneGrantRecord};
use avatart_kernel_contracts::reel::{ReelAuditEvent, ReelId, ReelRecord, ReelStatus};
use avatart_kernel_contracts::render_provider::ProviderJobId;
use avatart_kernel_contracts::{ContractViolation, Validate};

const TABLE_CLONE_GRANTS: &str = "clone_grants";
const TABLE_REELS: &str = "reels";
const TABLE_REEL_JOB_INDEX: &str = "reel_job_index";
const TABLE_REEL_AUDIT: &str = "reel_audit_events";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("{table}: no row for key {key}")]
    NotFound { table: &'static str, key: String },
    #[error("{table}: duplicate key {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("{table}: foreign key {key} does not exist")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("{table}: lock poisoned")]
    LockPoisoned { table: &'static str },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

type Row<T> = Arc<Mutex<T>>;

/// In-memory tables with one mutex per row. Table maps are only locked long enough to
/// find or insert a row handle, so work on different rows proceeds in parallel.
#[derive(Debug)]
pub struct AvatartStore {
    clone_grants: RwLock<BTreeMap<CloneGrantKey, Row<CloneGrantRecord>>>,
    reels: RwLock<BTreeMap<ReelId, Row<ReelRecord>>>,
    reel_job_index: RwLock<BTreeMap<ProviderJobId, ReelId>>,
    reel_audit_events: Mutex<Vec<ReelAuditEvent>>,
    next_reel_id: AtomicU64,
}

impl Default for AvatartStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl AvatartStore {
    pub fn new_in_memory() -> Self {
        Self {
            clone_grants: RwLock::new(BTreeMap::new()),
            reels: RwLock::new(BTreeMap::new()),
            reel_job_index: RwLock::new(BTreeMap::new()),
            reel_audit_events: Mutex::new(Vec::new()),
            next_reel_id: AtomicU64::new(1),
        }
    }

    // ---- clone grants ----

    pub fn insert_clone_grant(&self, record: CloneGrantRecord) -> Result<(), StorageError> {
        record.validate()?;
        let key = record.key();
        let mut table = self
            .clone_grants
            .write()
            .map_err(|_| poisoned(TABLE_CLONE_GRANTS))?;
        if table.contains_key(&key) {
            return Err(StorageError::DuplicateKey {
                table: TABLE_CLONE_GRANTS,
                key: key.to_string(),
            });
        }
        table.insert(key, Arc::new(Mutex::new(record)));
        Ok(())
    }

    pub fn clone_grant(&self, key: &CloneGrantKey) -> Result<Option<CloneGrantRecord>, StorageError> {
        let Some(row) = self.grant_row(key)? else {
            return Ok(None);
        };
        let guard = lock_row(&row, TABLE_CLONE_GRANTS)?;
        Ok(Some(guard.clone()))
    }

    /// Runs `f` on a working copy under the row lock; the copy replaces the row only on `Ok`.
    pub fn update_clone_grant<T, E>(
        &self,
        key: &CloneGrantKey,
        f: impl FnOnce(&mut CloneGrantRecord) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let row = self.grant_row(key)?.ok_or_else(|| StorageError::NotFound {
            table: TABLE_CLONE_GRANTS,
            key: key.to_string(),
        })?;
        let mut guard = lock_row(&row, TABLE_CLONE_GRANTS)?;
        let mut working = guard.clone();
        let out = f(&mut working)?;
        if working.key() != *key {
            return Err(StorageError::ContractViolation(ContractViolation::InvalidValue {
                field: "clone_grant_record.key",
                reason: "must not change on update",
            })
            .into());
        }
        working.validate().map_err(StorageError::from)?;
        *guard = working;
        Ok(out)
    }

    pub fn clone_grant_keys(&self) -> Result<Vec<CloneGrantKey>, StorageError> {
        let table = self
            .clone_grants
            .read()
            .map_err(|_| poisoned(TABLE_CLONE_GRANTS))?;
        Ok(table.keys().cloned().collect())
    }

    pub fn clone_grants_matching(
        &self,
        mut pred: impl FnMut(&CloneGrantRecord) -> bool,
    ) -> Result<Vec<CloneGrantRecord>, StorageError> {
        let rows: Vec<Row<CloneGrantRecord>> = {
            let table = self
                .clone_grants
                .read()
                .map_err(|_| poisoned(TABLE_CLONE_GRANTS))?;
            table.values().cloned().collect()
        };
        let mut out = Vec::new();
        for row in rows {
            let guard = lock_row(&row, TABLE_CLONE_GRANTS)?;
            if pred(&guard) {
                out.push(guard.clone());
            }
        }
        Ok(out)
    }

    fn grant_row(
        &self,
        key: &CloneGrantKey,
    ) -> Result<Option<Row<CloneGrantRecord>>, StorageError> {
        let table = self
            .clone_grants
            .read()
            .map_err(|_| poisoned(TABLE_CLONE_GRANTS))?;
        Ok(table.get(key).cloned())
    }

    // ---- reels ----

    pub fn allocate_reel_id(&self) -> ReelId {
        ReelId(self.next_reel_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert_reel(
        &self,
        record: ReelRecord,
        created: ReelAuditEvent,
    ) -> Result<(), StorageError> {
        record.validate()?;
        if created.reel_id != record.reel_id {
            return Err(StorageError::ForeignKeyViolation {
                table: TABLE_REEL_AUDIT,
                key: created.reel_id.to_string(),
            });
        }
        let reel_id = record.reel_id;
        {
            let mut table = self.reels.write().map_err(|_| poisoned(TABLE_REELS))?;
            if table.contains_key(&reel_id) {
                return Err(StorageError::DuplicateKey {
                    table: TABLE_REELS,
                    key: reel_id.to_string(),
                });
            }
            table.insert(reel_id, Arc::new(Mutex::new(record)));
        }
        self.push_audit(created)
    }

    pub fn reel(&self, reel_id: ReelId) -> Result<Option<ReelRecord>, StorageError> {
        let Some(row) = self.reel_row(reel_id)? else {
            return Ok(None);
        };
        let guard = lock_row(&row, TABLE_REELS)?;
        Ok(Some(guard.clone()))
    }

    /// Same all-or-nothing contract as `update_clone_grant`. Returned audit events are
    /// appended before the row lock is released, keeping per-reel audit order linear.
    pub fn update_reel<T, E>(
        &self,
        reel_id: ReelId,
        f: impl FnOnce(&mut ReelRecord) -> Result<(T, Vec<ReelAuditEvent>), E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let row = self.reel_row(reel_id)?.ok_or_else(|| StorageError::NotFound {
            table: TABLE_REELS,
            key: reel_id.to_string(),
        })?;
        let mut guard = lock_row(&row, TABLE_REELS)?;
        let mut working = guard.clone();
        let (out, events) = f(&mut working)?;
        if working.reel_id != reel_id {
            return Err(StorageError::ContractViolation(ContractViolation::InvalidValue {
                field: "reel_record.reel_id",
                reason: "must not change on update",
            })
            .into());
        }
        working.validate().map_err(StorageError::from)?;

        let old_job = guard.job.as_ref().map(|h| h.job_id.clone());
        let new_job = working.job.as_ref().map(|h| h.job_id.clone());
        if old_job != new_job {
            self.reindex_job(reel_id, old_job, new_job)?;
        }
        *guard = working;
        for event in events {
            self.push_audit(event)?;
        }
        Ok(out)
    }

    pub fn reel_id_for_job(&self, job_id: &ProviderJobId) -> Result<Option<ReelId>, StorageError> {
        let index = self
            .reel_job_index
            .read()
            .map_err(|_| poisoned(TABLE_REEL_JOB_INDEX))?;
        Ok(index.get(job_id).copied())
    }

    /// Snapshots in creation order, capped at `limit`.
    pub fn reels_in_status(
        &self,
        status: ReelStatus,
        limit: usize,
    ) -> Result<Vec<ReelRecord>, StorageError> {
        let rows: Vec<Row<ReelRecord>> = {
            let table = self.reels.read().map_err(|_| poisoned(TABLE_REELS))?;
            table.values().cloned().collect()
        };
        let mut out = Vec::new();
        for row in rows {
            if out.len() >= limit {
                break;
            }
            let guard = lock_row(&row, TABLE_REELS)?;
            if guard.status == status {
                out.push(guard.clone());
            }
        }
        Ok(out)
    }

    pub fn append_reel_audit(&self, event: ReelAuditEvent) -> Result<(), StorageError> {
        if self.reel_row(event.reel_id)?.is_none() {
            return Err(StorageError::ForeignKeyViolation {
                table: TABLE_REEL_AUDIT,
                key: event.reel_id.to_string(),
            });
        }
        self.push_audit(event)
    }

    pub fn reel_audit_events(&self, reel_id: ReelId) -> Result<Vec<ReelAuditEvent>, StorageError> {
        let events = self
            .reel_audit_events
            .lock()
            .map_err(|_| poisoned(TABLE_REEL_AUDIT))?;
        Ok(events.iter().filter(|e| e.reel_id == reel_id).cloned().collect())
    }

    fn push_audit(&self, event: ReelAuditEvent) -> Result<(), StorageError> {
        self.reel_audit_events
            .lock()
            .map_err(|_| poisoned(TABLE_REEL_AUDIT))?
            .push(event);
        Ok(())
    }

    fn reel_row(&self, reel_id: ReelId) -> Result<Option<Row<ReelRecord>>, StorageError> {
        let table = self.reels.read().map_err(|_| poisoned(TABLE_REELS))?;
        Ok(table.get(&reel_id).cloned())
    }

    fn reindex_job(
        &self,
        reel_id: ReelId,
        old_job: Option<ProviderJobId>,
        new_job: Option<ProviderJobId>,
    ) -> Result<(), StorageError> {
        let mut index = self
            .reel_job_index
            .write()
            .map_err(|_| poisoned(TABLE_REEL_JOB_INDEX))?;
        if let Some(job_id) = &new_job {
            if let Some(owner) = index.get(job_id) {
                if *owner != reel_id {
                    return Err(StorageError::DuplicateKey {
                        table: TABLE_REEL_JOB_INDEX,
                        key: job_id.to_string(),
                    });
                }
            }
        }
        if let Some(job_id) = old_job {
            index.remove(&job_id);
        }
        if let Some(job_id) = new_job {
            index.insert(job_id, reel_id);
        }
        Ok(())
    }
}

fn lock_row<'a, T>(
    row: &'a Mutex<T>,
    table: &'static str,
) -> Result<MutexGuard<'a, T>, StorageError> {
    row.lock().map_err(|_| poisoned(table))
}

fn poisoned(table: &'static str) -> StorageError {
    StorageError::LockPoisoned { table }
}

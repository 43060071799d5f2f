#![forbid(unsafe_code)]

use avatart_kernel_contracts::clone_grant::{CloneId, ProducerId};
use avatart_kernel_contracts::reel::{
    AvatarRef, JobHandle, ReelAction, ReelAuditEvent, ReelDraft, ReelId, ReelRecord,
    ReelRenderConfig, ReelStatus, Requester,
};
use avatart_kernel_contracts::render_provider::{CredentialId, ProviderJobId};
use avatart_kernel_contracts::TimestampNs;
use avatart_storage::repo::ReelRepo;
use avatart_storage::{AvatartStore, StorageError};
use rust_decimal::Decimal;

fn new_reel(s: &AvatartStore) -> ReelId {
    let reel_id = s.allocate_reel_id();
    let draft = ReelDraft::v1(
        Requester::Producer(ProducerId::new("prod_1").unwrap()),
        CloneId::new("clone_1").unwrap(),
        ProducerId::new("prod_1").unwrap(),
        AvatarRef::new("avatar_1").unwrap(),
        "title",
        "some script text",
        ReelRenderConfig::default(),
        Decimal::new(10, 0),
    )
    .unwrap();
    let rec = ReelRecord::from_draft(reel_id, draft, 5, TimestampNs(1)).unwrap();
    s.insert_reel_row(rec, created(reel_id)).unwrap();
    reel_id
}

fn created(reel_id: ReelId) -> ReelAuditEvent {
    ReelAuditEvent {
        reel_id,
        action: ReelAction::Create,
        from: ReelStatus::Pending,
        to: ReelStatus::Pending,
        actor: None,
        detail: None,
        at: TimestampNs(1),
    }
}

fn handle(job: &str) -> JobHandle {
    JobHandle {
        job_id: ProviderJobId::new(job).unwrap(),
        credential_id: CredentialId::platform(),
        submitted_at: TimestampNs(2),
    }
}

#[test]
fn at_dbw_reel_01_ids_are_allocated_in_order_and_creation_is_audited() {
    let s = AvatartStore::new_in_memory();
    let a = new_reel(&s);
    let b = new_reel(&s);
    assert!(b > a);
    let audit = s.reel_audit_rows(a).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, ReelAction::Create);
}

#[test]
fn at_dbw_reel_02_job_index_follows_handle() {
    let s = AvatartStore::new_in_memory();
    let id = new_reel(&s);
    s.update_reel_row::<_, StorageError>(id, |r| {
        r.job = Some(handle("job_a"));
        Ok(((), Vec::new()))
    })
    .unwrap();
    let job_a = ProviderJobId::new("job_a").unwrap();
    assert_eq!(s.reel_id_for_job(&job_a).unwrap(), Some(id));

    s.update_reel_row::<_, StorageError>(id, |r| {
        r.job = None;
        Ok(((), Vec::new()))
    })
    .unwrap();
    assert_eq!(s.reel_id_for_job(&job_a).unwrap(), None);
}

#[test]
fn at_dbw_reel_03_job_id_cannot_belong_to_two_reels() {
    let s = AvatartStore::new_in_memory();
    let a = new_reel(&s);
    let b = new_reel(&s);
    s.update_reel_row::<_, StorageError>(a, |r| {
        r.job = Some(handle("job_shared"));
        Ok(((), Vec::new()))
    })
    .unwrap();
    let err = s
        .update_reel_row::<_, StorageError>(b, |r| {
            r.job = Some(handle("job_shared"));
            Ok(((), Vec::new()))
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { .. }));
    assert!(s.reel_row(b).unwrap().unwrap().job.is_none());
}

#[test]
fn at_dbw_reel_04_invalid_state_is_never_committed() {
    let s = AvatartStore::new_in_memory();
    let id = new_reel(&s);
    let err = s
        .update_reel_row::<_, StorageError>(id, |r| {
            r.status = ReelStatus::Processing;
            Ok(((), Vec::new()))
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));
    assert_eq!(s.reel_row(id).unwrap().unwrap().status, ReelStatus::Pending);
}

#[test]
fn at_dbw_reel_05_status_scan_respects_limit_and_order() {
    let s = AvatartStore::new_in_memory();
    let ids: Vec<ReelId> = (0..4).map(|_| new_reel(&s)).collect();
    let pending = s.reel_rows_in_status(ReelStatus::Pending, 3).unwrap();
    let got: Vec<ReelId> = pending.iter().map(|r| r.reel_id).collect();
    assert_eq!(got, ids[..3].to_vec());
    assert!(s
        .reel_rows_in_status(ReelStatus::Processing, 10)
        .unwrap()
        .is_empty());
}

#[test]
fn at_dbw_reel_06_audit_requires_existing_reel() {
    let s = AvatartStore::new_in_memory();
    let err = s.append_reel_audit_row(created(ReelId(77))).unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation { .. }));
    let id = new_reel(&s);
    s.update_reel_row::<_, StorageError>(id, |r| {
        let ev = ReelAuditEvent {
            reel_id: r.reel_id,
            action: ReelAction::Approve,
            from: ReelStatus::Pending,
            to: ReelStatus::ApprovedAwaitingSubmission,
            actor: None,
            detail: None,
            at: TimestampNs(3),
        };
        r.status = ReelStatus::ApprovedAwaitingSubmission;
        Ok(((), vec![ev]))
    })
    .unwrap();
    let actions: Vec<ReelAction> = s
        .reel_audit_rows(id)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(actions, vec![ReelAction::Create, ReelAction::Approve]);
}

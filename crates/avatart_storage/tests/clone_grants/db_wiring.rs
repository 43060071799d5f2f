#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use avatart_kernel_contracts::clone_grant::{
    CloneGrantKey, CloneGrantRecord, CloneId, GrantLimits, GrantStatus, ProducerId,
    QuotaPeriodKeys, SubjectId, SubjectKind, SubjectRef,
};
use avatart_kernel_contracts::{ActorId, TimestampNs};
use avatart_storage::repo::CloneGrantRepo;
use avatart_storage::{AvatartStore, StorageError};
use rust_decimal::Decimal;

fn grant(clone: &str, producer: &str, subject: &str, daily: u32) -> CloneGrantRecord {
    CloneGrantRecord::v1(
        CloneId::new(clone).unwrap(),
        ProducerId::new(producer).unwrap(),
        SubjectRef::new(SubjectKind::FinalUser, SubjectId::new(subject).unwrap()),
        ActorId::new(producer).unwrap(),
        GrantLimits::v1(daily, 0, Decimal::ZERO).unwrap(),
        None,
        BTreeMap::new(),
        QuotaPeriodKeys { day: 10, month: 1 },
        TimestampNs(1),
    )
    .unwrap()
}

fn key(clone: &str, subject: &str) -> CloneGrantKey {
    CloneGrantKey::new(CloneId::new(clone).unwrap(), SubjectId::new(subject).unwrap())
}

#[test]
fn at_dbw_grant_01_pair_is_unique_and_first_row_untouched() {
    let s = AvatartStore::new_in_memory();
    s.insert_clone_grant_row(grant("clone_1", "prod_1", "user_1", 3))
        .unwrap();
    let err = s
        .insert_clone_grant_row(grant("clone_1", "prod_1", "user_1", 99))
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { .. }));
    let stored = s.clone_grant_row(&key("clone_1", "user_1")).unwrap().unwrap();
    assert_eq!(stored.limits.daily_limit, 3);
}

#[test]
fn at_dbw_grant_02_update_is_all_or_nothing() {
    let s = AvatartStore::new_in_memory();
    s.insert_clone_grant_row(grant("clone_1", "prod_1", "user_1", 3))
        .unwrap();
    let k = key("clone_1", "user_1");

    let failed: Result<(), StorageError> = s.update_clone_grant_row(&k, |g| {
        g.usage.daily_used = 2;
        Err(StorageError::NotFound {
            table: "test",
            key: "abort".to_string(),
        })
    });
    assert!(failed.is_err());
    assert_eq!(s.clone_grant_row(&k).unwrap().unwrap().usage.daily_used, 0);

    s.update_clone_grant_row::<_, StorageError>(&k, |g| {
        g.usage.daily_used = 2;
        Ok(())
    })
    .unwrap();
    assert_eq!(s.clone_grant_row(&k).unwrap().unwrap().usage.daily_used, 2);
}

#[test]
fn at_dbw_grant_03_update_rejects_key_change_and_invalid_rows() {
    let s = AvatartStore::new_in_memory();
    s.insert_clone_grant_row(grant("clone_1", "prod_1", "user_1", 3))
        .unwrap();
    let k = key("clone_1", "user_1");
    let err = s
        .update_clone_grant_row::<_, StorageError>(&k, |g| {
            g.clone_id = CloneId::new("clone_2").unwrap();
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));

    let err = s
        .update_clone_grant_row::<_, StorageError>(&k, |g| {
            g.limits.per_use_cost = Decimal::new(-1, 0);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));
    assert_eq!(
        s.clone_grant_row(&k).unwrap().unwrap().limits.per_use_cost,
        Decimal::ZERO
    );
}

#[test]
fn at_dbw_grant_04_missing_row_is_not_found() {
    let s = AvatartStore::new_in_memory();
    let err = s
        .update_clone_grant_row::<(), StorageError>(&key("nope", "nobody"), |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
    assert!(s.clone_grant_row(&key("nope", "nobody")).unwrap().is_none());
}

#[test]
fn at_dbw_grant_05_queries_filter_by_owner_and_status() {
    let s = AvatartStore::new_in_memory();
    s.insert_clone_grant_row(grant("clone_1", "prod_1", "user_1", 1))
        .unwrap();
    s.insert_clone_grant_row(grant("clone_1", "prod_1", "user_2", 1))
        .unwrap();
    s.insert_clone_grant_row(grant("clone_2", "prod_2", "user_1", 1))
        .unwrap();
    s.update_clone_grant_row::<_, StorageError>(&key("clone_1", "user_2"), |g| {
        g.status = GrantStatus::Paused;
        Ok(())
    })
    .unwrap();

    let user_1 = SubjectId::new("user_1").unwrap();
    assert_eq!(s.clone_grant_rows_by_subject(&user_1, None).unwrap().len(), 2);

    let clone_1 = CloneId::new("clone_1").unwrap();
    assert_eq!(s.clone_grant_rows_by_clone(&clone_1, None).unwrap().len(), 2);
    let paused = s
        .clone_grant_rows_by_clone(&clone_1, Some(GrantStatus::Paused))
        .unwrap();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0].subject.id.as_str(), "user_2");

    let prod_2 = ProducerId::new("prod_2").unwrap();
    assert_eq!(
        s.clone_grant_rows_by_producer(&prod_2, Some(GrantStatus::Active))
            .unwrap()
            .len(),
        1
    );
    assert_eq!(s.clone_grant_keys().unwrap().len(), 3);
}

#[test]
fn at_dbw_grant_06_row_updates_serialize_across_threads() {
    let s = Arc::new(AvatartStore::new_in_memory());
    s.insert_clone_grant_row(grant("clone_1", "prod_1", "user_1", 0))
        .unwrap();
    let k = key("clone_1", "user_1");
    std::thread::scope(|scope| {
        for _ in 0..8 {
            let s = Arc::clone(&s);
            let k = k.clone();
            scope.spawn(move || {
                for _ in 0..50 {
                    s.update_clone_grant_row::<_, StorageError>(&k, |g| {
                        g.usage.total_used += 1;
                        Ok(())
                    })
                    .unwrap();
                }
            });
        }
    });
    assert_eq!(s.clone_grant_row(&k).unwrap().unwrap().usage.total_used, 400);
}

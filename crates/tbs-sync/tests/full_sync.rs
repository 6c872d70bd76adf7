//! End-to-end pipeline runs against the in-memory directory and identity
//! provider fakes.

use std::sync::Arc;

use tbs_core::{ManagerRole, RelationKind, RunErrorKind};
use tbs_ingest::RawRow;
use tbs_storage::memory::{MemoryDirectory, MemoryIdentityProvider};
use tbs_storage::{Directory, UploadArchive};
use tbs_sync::SyncPipeline;
use tempfile::TempDir;

struct Harness {
    pipeline: SyncPipeline,
    directory: Arc<MemoryDirectory>,
    identity: Arc<MemoryIdentityProvider>,
    _archive_dir: TempDir,
}

fn harness() -> Harness {
    let directory = Arc::new(MemoryDirectory::new());
    let identity = Arc::new(MemoryIdentityProvider::new());
    let archive_dir = TempDir::new().expect("tempdir");
    let pipeline = SyncPipeline::new(
        directory.clone(),
        identity.clone(),
        UploadArchive::new(archive_dir.path()),
    );
    Harness {
        pipeline,
        directory,
        identity,
        _archive_dir: archive_dir,
    }
}

fn row(row_number: usize, store_code: &str, sm_name: &str, sm_email: &str) -> RawRow {
    RawRow {
        row_number,
        rm_name: "Rita".into(),
        rm_surname: "Mokoena".into(),
        rm_email: "rm@x.com".into(),
        rm_username: "rmokoena".into(),
        am_name: "Andre".into(),
        am_surname: "Botha".into(),
        am_email: "am@x.com".into(),
        am_username: "abotha".into(),
        sm_name: sm_name.into(),
        sm_email: sm_email.into(),
        sm_username: if sm_email.is_empty() || sm_email.eq_ignore_ascii_case("vacant") {
            String::new()
        } else {
            sm_email.split('@').next().unwrap().into()
        },
        store_name: "Cape Town".into(),
        store_code: store_code.into(),
        region: "Western Cape".into(),
    }
}

async fn store_id(directory: &MemoryDirectory, code: &str) -> uuid::Uuid {
    directory
        .find_store_by_code(code)
        .await
        .unwrap()
        .expect("store exists")
}

async fn user_id(directory: &MemoryDirectory, email: &str) -> uuid::Uuid {
    directory
        .find_user_by_email(email)
        .await
        .unwrap()
        .expect("user exists")
        .id
}

#[tokio::test]
async fn vacant_store_manager_links_nothing_and_raises_no_error() {
    let h = harness();
    let summary = h
        .pipeline
        .run_rows("sha-a", vec![row(2, "BED001", "Vacant", "vacant")])
        .await
        .unwrap();

    assert!(summary.errors.is_empty());
    assert_eq!(summary.stores.created, 1);
    // Regional and area managers still provisioned and linked.
    assert_eq!(summary.users.created, 2);
    assert_eq!(summary.assignments.created, 2);
    assert!(h
        .directory
        .find_user_by_email("sm1@x.com")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn blank_store_manager_behaves_like_vacant_for_linking() {
    let h = harness();
    let summary = h
        .pipeline
        .run_rows("sha-a", vec![row(2, "BED001", "", "")])
        .await
        .unwrap();

    assert!(summary.errors.is_empty());
    assert_eq!(summary.users.created, 2);
    assert_eq!(summary.assignments.created, 2);
}

#[tokio::test]
async fn rows_missing_store_fields_are_reported_and_excluded() {
    let h = harness();
    let mut bad = row(3, "", "Lindiwe Dube", "sm9@x.com");
    bad.store_name = String::new();
    let summary = h
        .pipeline
        .run_rows("sha-a", vec![row(2, "BED001", "Sam Naidoo", "sm1@x.com"), bad])
        .await
        .unwrap();

    assert_eq!(summary.total_rows, 2);
    assert_eq!(summary.failed_rows, 1);
    assert_eq!(summary.succeeded_rows, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].kind, RunErrorKind::RowValidation);
    assert_eq!(summary.errors[0].row_numbers, vec![3]);
    assert_eq!(h.directory.stores().await.len(), 1);
    // The bad row contributed nothing downstream, including its manager.
    assert_eq!(summary.stores.created, 1);
    assert!(h
        .directory
        .find_user_by_email("sm9@x.com")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn rerunning_the_identical_upload_is_idempotent() {
    let h = harness();
    let rows = vec![
        row(2, "BED001", "Sam Naidoo", "sm1@x.com"),
        row(3, "BED002", "Thandi Zulu", "sm2@x.com"),
    ];

    let first = h.pipeline.run_rows("sha-a", rows.clone()).await.unwrap();
    assert_eq!(first.users.created, 4);
    assert_eq!(first.stores.created, 2);
    assert_eq!(first.assignments.created, 5);

    let second = h.pipeline.run_rows("sha-a", rows).await.unwrap();
    assert_eq!(second.users.created, 0);
    assert_eq!(second.users.updated, 4);
    assert_eq!(second.stores.created, 0);
    assert_eq!(second.stores.updated, 2);
    assert_eq!(second.assignments.created, 0);
    assert_eq!(second.assignments.updated, 0);
    assert_eq!(second.assignments.deactivated, 0);

    assert_eq!(h.directory.users().await.len(), 4);
    assert_eq!(h.directory.stores().await.len(), 2);
    // Accounts were provisioned once, on first sight only.
    assert_eq!(h.identity.created_accounts().await.len(), 4);
}

#[tokio::test]
async fn store_dropped_from_upload_keeps_inactive_assignment_history() {
    let h = harness();
    h.pipeline
        .run_rows(
            "sha-a",
            vec![
                row(2, "BED001", "Alice Adams", "alice@x.com"),
                row(3, "BED002", "Thandi Zulu", "sm2@x.com"),
            ],
        )
        .await
        .unwrap();

    let alice = user_id(&h.directory, "alice@x.com").await;
    let bed001 = store_id(&h.directory, "BED001").await;
    assert!(h
        .directory
        .find_assignment(RelationKind::StoreManagerToStore, alice, bed001)
        .await
        .unwrap()
        .expect("assignment exists")
        .active);

    let second = h
        .pipeline
        .run_rows("sha-b", vec![row(2, "BED002", "Thandi Zulu", "sm2@x.com")])
        .await
        .unwrap();
    assert!(second.assignments.deactivated >= 1);

    // Soft removal: the row is still queryable, just inactive.
    let state = h
        .directory
        .find_assignment(RelationKind::StoreManagerToStore, alice, bed001)
        .await
        .unwrap()
        .expect("history preserved");
    assert!(!state.active);
}

#[tokio::test]
async fn reintroduced_store_reactivates_the_historical_assignment() {
    let h = harness();
    let original = vec![row(2, "BED001", "Alice Adams", "alice@x.com")];
    h.pipeline.run_rows("sha-a", original.clone()).await.unwrap();
    h.pipeline
        .run_rows("sha-b", vec![row(2, "BED002", "Thandi Zulu", "sm2@x.com")])
        .await
        .unwrap();

    let third = h.pipeline.run_rows("sha-c", original).await.unwrap();
    // The old row flips back to active instead of being duplicated.
    assert_eq!(third.assignments.created, 0);
    assert!(third.assignments.updated >= 1);
}

#[tokio::test]
async fn conflicting_surnames_produce_one_conflict_and_skip_the_upsert() {
    let h = harness();
    let summary = h
        .pipeline
        .run_rows(
            "sha-a",
            vec![
                row(2, "BED001", "Sam Smith", "sm1@x.com"),
                row(3, "BED002", "Sam Jones", "sm1@x.com"),
            ],
        )
        .await
        .unwrap();

    let conflicts: Vec<_> = summary
        .errors
        .iter()
        .filter(|err| err.kind == RunErrorKind::Conflict)
        .collect();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].row_numbers, vec![2, 3]);
    assert_eq!(summary.conflicts, 1);

    assert!(h
        .directory
        .find_user_by_email("sm1@x.com")
        .await
        .unwrap()
        .is_none());
    assert!(h
        .identity
        .created_accounts()
        .await
        .iter()
        .all(|account| account.email != "sm1@x.com"));
}

#[tokio::test]
async fn two_managers_for_one_store_write_no_assignment_for_it() {
    let h = harness();
    let summary = h
        .pipeline
        .run_rows(
            "sha-a",
            vec![
                row(2, "BED001", "Sam Naidoo", "sm1@x.com"),
                row(3, "BED001", "Thandi Zulu", "sm2@x.com"),
            ],
        )
        .await
        .unwrap();

    let conflicts: Vec<_> = summary
        .errors
        .iter()
        .filter(|err| err.kind == RunErrorKind::Conflict)
        .collect();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].row_numbers, vec![2, 3]);

    // Both managers are valid people and still get accounts; only the store
    // link is withheld this run.
    let bed001 = store_id(&h.directory, "BED001").await;
    for email in ["sm1@x.com", "sm2@x.com"] {
        let id = user_id(&h.directory, email).await;
        assert!(h
            .directory
            .find_assignment(RelationKind::StoreManagerToStore, id, bed001)
            .await
            .unwrap()
            .is_none());
    }
}

#[tokio::test]
async fn provisioning_failure_is_scoped_to_the_one_entity() {
    let h = harness();
    h.identity.reject_email("sm1@x.com").await;

    let summary = h
        .pipeline
        .run_rows("sha-a", vec![row(2, "BED001", "Sam Naidoo", "sm1@x.com")])
        .await
        .unwrap();

    let upsert_errors: Vec<_> = summary
        .errors
        .iter()
        .filter(|err| err.kind == RunErrorKind::Upsert)
        .collect();
    assert_eq!(upsert_errors.len(), 1);
    assert!(upsert_errors[0].message.contains("sm1@x.com"));

    // The rest of the row still lands: both other users, the store and their
    // assignments.
    assert_eq!(summary.users.created, 2);
    assert_eq!(summary.stores.created, 1);
    assert_eq!(summary.assignments.created, 2);
    assert!(h
        .directory
        .find_user_by_email("sm1@x.com")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn initial_passwords_follow_the_surname_rule_and_are_never_rewritten() {
    let h = harness();
    h.pipeline
        .run_rows("sha-a", vec![row(2, "BED001", "Sam Naidoo", "sm1@x.com")])
        .await
        .unwrap();

    let accounts = h.identity.created_accounts().await;
    let sam = accounts
        .iter()
        .find(|account| account.email == "sm1@x.com")
        .expect("account provisioned");
    assert_eq!(sam.initial_password, "Naidoo951#");
    assert_eq!(sam.role, ManagerRole::StoreManager);

    // Second run updates the profile without re-provisioning.
    h.pipeline
        .run_rows("sha-a", vec![row(2, "BED001", "Sam Naidoo", "sm1@x.com")])
        .await
        .unwrap();
    assert_eq!(h.identity.created_accounts().await.len(), 3);
}

#[tokio::test]
async fn every_run_appends_one_audit_entry() {
    let h = harness();
    let summary = h
        .pipeline
        .run_rows("sha-a", vec![row(2, "BED001", "Sam Naidoo", "sm1@x.com")])
        .await
        .unwrap();
    h.pipeline
        .run_rows("sha-b", vec![row(2, "BED001", "Sam Naidoo", "sm1@x.com")])
        .await
        .unwrap();

    let logs = h.directory.logs().await;
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].run_id, summary.run_id);
    assert_eq!(logs[0].source_sha256, "sha-a");
    assert_eq!(logs[0].total_rows, 1);
    assert_eq!(logs[1].source_sha256, "sha-b");
}

mod common;

use common::{registry, seed_members, ACTOR};
use repoquery_core::{
    open_db_with_config, Args, DatabaseConfig, FixedActor, Member, RepoError, Session,
};
use rusqlite::Connection;
use std::path::Path;

fn open_file(path: &Path) -> Connection {
    open_db_with_config(&DatabaseConfig {
        path: Some(path.to_path_buf()),
        busy_timeout_ms: 100,
    })
    .unwrap()
}

fn session(conn: &Connection) -> Session<'_> {
    Session::builder()
        .actor_provider(FixedActor::new(ACTOR))
        .registry(registry())
        .build(conn)
        .unwrap()
}

#[test]
fn read_only_results_are_never_written_back() {
    let conn = common::open();
    let session = common::session(&conn);
    seed_members(&session, &[("member1", 10)]);
    let members = session.repository::<Member>();

    session.begin().unwrap();
    let found = members
        .list("findReadOnlyByUsername", &Args::new().push("member1"))
        .unwrap();
    let updates = session.stats().entity_updates;
    found[0].borrow_mut().username = "renamed".to_string();
    session.flush().unwrap();
    session.commit().unwrap();

    assert_eq!(session.stats().entity_updates, updates);
    let reloaded = members
        .list("findByUsername", &Args::new().push("member1"))
        .unwrap();
    assert_eq!(reloaded.len(), 1);
}

#[test]
fn locking_query_returns_rows_outside_a_transaction() {
    let conn = common::open();
    let session = common::session(&conn);
    seed_members(&session, &[("member1", 10), ("member2", 20)]);

    let locked = session
        .repository::<Member>()
        .list("findLockByUsername", &Args::new().push("member2"))
        .unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(locked[0].borrow().age, 20);
    assert!(!session.in_transaction());
}

#[test]
fn competing_writer_times_out_until_lock_holder_commits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locks.sqlite3");
    let conn_a = open_file(&path);
    let conn_b = open_file(&path);
    let holder = session(&conn_a);
    let contender = session(&conn_b);
    seed_members(&holder, &[("member1", 10)]);

    holder.begin().unwrap();
    let locked = holder
        .repository::<Member>()
        .list("findLockByUsername", &Args::new().push("member1"))
        .unwrap();
    assert_eq!(locked.len(), 1);

    let err = contender
        .repository::<Member>()
        .save(Member::new("member2", 20))
        .unwrap_err();
    assert!(matches!(err, RepoError::LockTimeout(_)), "{err}");
    assert!(err.is_retryable());

    let err = contender
        .repository::<Member>()
        .list("findLockByUsername", &Args::new().push("member1"))
        .unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert!(!contender.in_transaction());

    locked[0].borrow_mut().age = 11;
    holder.commit().unwrap();

    contender
        .repository::<Member>()
        .save(Member::new("member2", 20))
        .unwrap();
    let relocked = contender
        .repository::<Member>()
        .list("findLockByUsername", &Args::new().push("member1"))
        .unwrap();
    assert_eq!(relocked[0].borrow().age, 11);
}

#[test]
fn lock_hint_on_native_query_is_rejected() {
    let err = repoquery_core::QueryRegistry::builder()
        .declare::<Member>(
            repoquery_core::DeclaredQuery::native("lockedNative", "select * from member")
                .lock(repoquery_core::LockMode::PessimisticWrite),
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::Configuration(_)));
}

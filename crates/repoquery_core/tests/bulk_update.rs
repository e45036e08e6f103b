mod common;

use common::{open, seed_members, session};
use repoquery_core::model::member::MEMBER_META;
use repoquery_core::query::descriptor::{Assignment, ColumnRef, CompareOp, Expr, Operand};
use repoquery_core::{Args, Entity, Member, QueryDescriptor, RepoError, Sort, Value};

fn ages(session: &repoquery_core::Session<'_>) -> Vec<(String, i32)> {
    session
        .repository::<Member>()
        .find_all_sorted(&Sort::asc("username"))
        .unwrap()
        .iter()
        .map(|member| {
            let member = member.borrow();
            (member.username.clone(), member.age)
        })
        .collect()
}

#[test]
fn bulk_increment_reports_affected_rows_without_auditing() {
    let conn = open();
    let session = session(&conn);
    seed_members(
        &session,
        &[("m1", 10), ("m2", 19), ("m3", 20), ("m4", 21), ("m5", 40)],
    );
    let members = session.repository::<Member>();
    let before = members
        .find_all_sorted(&Sort::asc("username"))
        .unwrap()
        .iter()
        .map(|member| member.borrow().audit().clone())
        .collect::<Vec<_>>();

    let affected = members
        .bulk_update("bulkAgePlus", &Args::new().bind("age", 20))
        .unwrap();

    assert_eq!(affected, 3);
    assert_eq!(
        ages(&session),
        vec![
            ("m1".to_string(), 10),
            ("m2".to_string(), 19),
            ("m3".to_string(), 21),
            ("m4".to_string(), 22),
            ("m5".to_string(), 41),
        ]
    );
    let after = members
        .find_all_sorted(&Sort::asc("username"))
        .unwrap()
        .iter()
        .map(|member| member.borrow().audit().clone())
        .collect::<Vec<_>>();
    assert_eq!(before, after);
}

#[test]
fn bulk_update_detaches_tracked_instances() {
    let conn = open();
    let session = session(&conn);
    seed_members(&session, &[("m1", 30), ("m2", 5)]);
    let members = session.repository::<Member>();

    session.begin().unwrap();
    let loaded = members
        .one("findMemberByUsername", &Args::new().push("m1"))
        .unwrap();
    let id = loaded.id().unwrap();
    assert_eq!(loaded.borrow().age, 30);

    members
        .bulk_update("bulkAgePlus", &Args::new().bind("age", 20))
        .unwrap();

    assert_eq!(loaded.borrow().age, 30);
    let fresh = members.find_by_id(id).unwrap().unwrap();
    assert!(!fresh.ptr_eq(&loaded));
    assert_eq!(fresh.borrow().age, 31);

    // Changes to the detached handle are no longer written back.
    let updates = session.stats().entity_updates;
    loaded.borrow_mut().age = 99;
    session.commit().unwrap();
    assert_eq!(session.stats().entity_updates, updates);
    assert_eq!(members.find_by_id(id).unwrap().unwrap().borrow().age, 31);
}

#[test]
fn pending_changes_are_flushed_before_the_statement() {
    let conn = open();
    let session = session(&conn);
    seed_members(&session, &[("m1", 5)]);
    let members = session.repository::<Member>();

    session
        .transaction(|_| {
            let member = members.one("findMemberByUsername", &Args::new().push("m1"))?;
            member.borrow_mut().age = 50;
            let affected = members.bulk_update("bulkAgePlus", &Args::new().bind("age", 20))?;
            assert_eq!(affected, 1);
            Ok(())
        })
        .unwrap();

    assert_eq!(ages(&session), vec![("m1".to_string(), 51)]);
}

#[test]
fn derived_delete_removes_matching_rows() {
    let conn = open();
    let session = session(&conn);
    seed_members(&session, &[("gone", 1), ("gone", 2), ("kept", 3)]);

    let affected = session
        .repository::<Member>()
        .bulk_update("deleteByUsername", &Args::new().push("gone"))
        .unwrap();
    assert_eq!(affected, 2);
    assert_eq!(ages(&session), vec![("kept".to_string(), 3)]);
}

#[test]
fn descriptor_built_in_code() {
    let conn = open();
    let session = session(&conn);
    seed_members(&session, &[("m1", 1), ("m2", 2)]);

    let descriptor = QueryDescriptor::bulk_update(
        &MEMBER_META,
        "Member.resetAge",
        vec![Assignment {
            column: "age",
            value: Operand::Literal(Value::Integer(0)),
        }],
        Some(Expr::compare(
            Operand::Column(ColumnRef::root("username")),
            CompareOp::Eq,
            Operand::param("username"),
        )),
    )
    .unwrap();

    let affected = session
        .repository::<Member>()
        .bulk_update_with(&descriptor, &Args::new().bind("username", "m2"))
        .unwrap();
    assert_eq!(affected, 1);
    assert_eq!(
        ages(&session),
        vec![("m1".to_string(), 1), ("m2".to_string(), 0)]
    );

    let err = session
        .repository::<Member>()
        .bulk_update_with(&descriptor, &Args::new())
        .unwrap_err();
    assert!(matches!(err, RepoError::ParameterMismatch { .. }));

    let err = session
        .repository::<repoquery_core::Team>()
        .bulk_update_with(&descriptor, &Args::new().bind("username", "m2"))
        .unwrap_err();
    assert!(matches!(err, RepoError::Configuration(_)));
}

#[test]
fn bulk_accessor_rejects_selects() {
    let conn = open();
    let session = session(&conn);
    let err = session
        .repository::<Member>()
        .bulk_update("findByUsername", &Args::new().push("m1"))
        .unwrap_err();
    assert!(matches!(err, RepoError::ShapeMismatch { .. }));
}

mod common;

use common::{open, seed_members, seed_team, session};
use repoquery_core::query::descriptor::ParamRef;
use repoquery_core::{
    Args, DeclaredQuery, Entity, FixedActor, Member, MemberDto, PageRequest, QueryRegistry,
    RepoError, ResultShape, Session,
};

#[test]
fn logical_query_binds_named_parameters() {
    let conn = open();
    let session = session(&conn);
    seed_members(&session, &[("member1", 10), ("member1", 20), ("member2", 10)]);

    let found = session
        .repository::<Member>()
        .list(
            "findUser",
            &Args::new().bind("username", "member1").bind("age", 10),
        )
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].borrow().username, "member1");
    assert_eq!(found[0].borrow().age, 10);
}

#[test]
fn argument_set_must_match_placeholders() {
    let conn = open();
    let session = session(&conn);
    let members = session.repository::<Member>();

    let err = members
        .list("findUser", &Args::new().bind("username", "member1"))
        .unwrap_err();
    match err {
        RepoError::ParameterMismatch {
            query,
            missing,
            unexpected,
        } => {
            assert_eq!(query, "Member.findUser");
            assert_eq!(missing, vec![":age".to_string()]);
            assert!(unexpected.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = members
        .list(
            "findUser",
            &Args::new()
                .bind("username", "member1")
                .bind("age", 10)
                .bind("nickname", "m"),
        )
        .unwrap_err();
    match err {
        RepoError::ParameterMismatch { unexpected, .. } => {
            assert_eq!(unexpected, vec![":nickname".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn collection_parameter_expands() {
    let conn = open();
    let session = session(&conn);
    seed_members(&session, &[("a", 1), ("b", 2), ("c", 3)]);

    let found = session
        .repository::<Member>()
        .list("findByNames", &Args::new().bind("names", vec!["c", "a"]))
        .unwrap();
    let names: Vec<String> = found.iter().map(|m| m.borrow().username.clone()).collect();
    assert_eq!(names, vec!["a", "c"]);

    let none = session
        .repository::<Member>()
        .list("findByNames", &Args::new().bind("names", Vec::<String>::new()))
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn column_query_returns_rows() {
    let conn = open();
    let session = session(&conn);
    seed_members(&session, &[("b", 2), ("a", 1)]);

    let rows = session
        .repository::<Member>()
        .rows("findUsernameList", &Args::new())
        .unwrap();
    let names: Vec<String> = rows.iter().map(|row| row.get_at(0).unwrap()).collect();
    assert_eq!(names, vec!["a", "b"]);

    let err = session
        .repository::<Member>()
        .list("findUsernameList", &Args::new())
        .unwrap_err();
    assert!(matches!(err, RepoError::ShapeMismatch { .. }));
}

#[test]
fn constructor_projection_builds_dtos() {
    let conn = open();
    let session = session(&conn);
    seed_team(&session, "teamA", &["member1", "member2"]);
    seed_members(&session, &[("loner", 30)]);

    let dtos: Vec<MemberDto> = session
        .repository::<Member>()
        .project("findMemberDto", &Args::new())
        .unwrap();
    assert_eq!(dtos.len(), 2);
    assert_eq!(dtos[0].username, "member1");
    assert_eq!(dtos[0].team_name.as_deref(), Some("teamA"));
    assert_eq!(dtos[1].username, "member2");
    assert!(dtos[0].id < dtos[1].id);
}

#[test]
fn logical_count_is_scalar() {
    let conn = open();
    let session = session(&conn);
    seed_members(&session, &[("a", 10), ("b", 20), ("c", 30)]);

    let older: i64 = session
        .repository::<Member>()
        .scalar("countOlder", &Args::new().bind("age", 15))
        .unwrap();
    assert_eq!(older, 2);
}

#[test]
fn native_query_maps_entities() {
    let conn = open();
    let session = session(&conn);
    seed_members(&session, &[("member1", 10), ("member2", 20)]);

    let found = session
        .repository::<Member>()
        .list("nativeByUsername", &Args::new().bind("username", "member2"))
        .unwrap();
    assert_eq!(found.len(), 1);
    let member = found[0].borrow();
    assert_eq!(member.username, "member2");
    assert_eq!(member.age, 20);
    assert!(member.id().is_some());
    assert!(member.audit().created_at().is_some());
}

#[test]
fn malformed_declarations_fail_at_registration() {
    let err = QueryRegistry::builder()
        .declare::<Member>(DeclaredQuery::logical(
            "broken",
            "select m from Member m where",
        ))
        .unwrap_err();
    assert!(matches!(err, RepoError::Syntax { .. }));

    let err = QueryRegistry::builder()
        .declare::<Member>(DeclaredQuery::logical(
            "broken",
            "select m from Member m where m.nickname = :n",
        ))
        .unwrap_err();
    assert!(matches!(err, RepoError::UnresolvedField { .. }));

    let err = QueryRegistry::builder()
        .declare::<Member>(DeclaredQuery::native("broken", "select 'x from member"))
        .unwrap_err();
    assert!(matches!(err, RepoError::Syntax { .. }));
}

#[test]
fn count_text_must_count() {
    let err = QueryRegistry::builder()
        .declare::<Member>(
            DeclaredQuery::logical("paged", "select m from Member m")
                .count("select m from Member m")
                .returns(ResultShape::Page),
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::Configuration(_)));
}

#[test]
fn count_placeholders_join_the_argument_contract() {
    let registry = QueryRegistry::builder()
        .declare::<Member>(
            DeclaredQuery::logical("pagedAll", "select m from Member m order by m.id")
                .count("select count(m) from Member m where m.age > :age")
                .returns(ResultShape::Page),
        )
        .unwrap()
        .declare::<Member>(
            DeclaredQuery::native("nativePagedAll", "select * from member order by member_id")
                .count("select count(*) from member where age > :age")
                .returns(ResultShape::Page),
        )
        .unwrap()
        .build();
    for name in ["pagedAll", "nativePagedAll"] {
        let declared = registry.get(Member::meta(), name).unwrap();
        assert_eq!(declared.parameters, vec![ParamRef::Named("age".to_string())]);
    }

    let conn = open();
    let session = Session::builder()
        .actor_provider(FixedActor::new(common::ACTOR))
        .registry(registry)
        .build(&conn)
        .unwrap();
    seed_members(&session, &[("a", 10), ("b", 20), ("c", 30)]);
    let members = session.repository::<Member>();

    let page = members
        .page("pagedAll", &Args::new().bind("age", 15), &PageRequest::of(0, 10))
        .unwrap();
    assert_eq!(page.content().len(), 3);
    assert_eq!(page.total_elements, 2);

    let err = members
        .page("nativePagedAll", &Args::new(), &PageRequest::of(0, 10))
        .unwrap_err();
    match err {
        RepoError::ParameterMismatch { query, missing, .. } => {
            assert_eq!(query, "Member.nativePagedAll");
            assert_eq!(missing, vec![":age".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn duplicate_declaration_is_rejected() {
    let err = QueryRegistry::builder()
        .declare::<Member>(DeclaredQuery::logical("q", "select m from Member m"))
        .unwrap()
        .declare::<Member>(DeclaredQuery::native("q", "select * from member"))
        .unwrap_err();
    assert!(matches!(err, RepoError::Configuration(_)));
}

#[test]
fn unknown_query_name_is_configuration() {
    let conn = open();
    let session = session(&conn);
    let err = session
        .repository::<Member>()
        .list("findNothing", &Args::new())
        .unwrap_err();
    assert!(matches!(err, RepoError::Configuration(_)));
}


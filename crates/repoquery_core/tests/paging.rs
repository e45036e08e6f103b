mod common;

use common::{open, registry, seed_members, seed_team, session, ACTOR};
use repoquery_core::{
    Args, FixedActor, Member, Page, PageRequest, ProjectedRow, Projection, QueryConfig, RepoError,
    RepoResult, Session, Sort,
};

fn usernames<T>(page: &Page<T>, name: impl Fn(&T) -> String) -> Vec<String> {
    page.content().iter().map(name).collect()
}

#[test]
fn derived_page_reports_totals() {
    let conn = open();
    let session = session(&conn);
    seed_members(
        &session,
        &[
            ("member1", 10),
            ("member2", 10),
            ("member3", 10),
            ("member4", 10),
            ("member5", 10),
            ("other", 20),
        ],
    );
    let members = session.repository::<Member>();
    let request = PageRequest::of(0, 3).with_sort(Sort::desc("username"));

    let first = members
        .page("findByAge", &Args::new().push(10), &request)
        .unwrap();
    assert_eq!(
        usernames(&first, |m| m.borrow().username.clone()),
        vec!["member5", "member4", "member3"]
    );
    assert_eq!(first.total_elements, 5);
    assert_eq!(first.total_pages(), 2);
    assert!(first.is_first());
    assert!(first.has_next());

    let second = members
        .page("findByAge", &Args::new().push(10), &request.next())
        .unwrap();
    assert_eq!(
        usernames(&second, |m| m.borrow().username.clone()),
        vec!["member2", "member1"]
    );
    assert_eq!(second.number, 1);
    assert!(second.has_previous());
    assert!(second.is_last());

    let beyond = members
        .page("findByAge", &Args::new().push(10), &PageRequest::of(2, 3))
        .unwrap();
    assert!(beyond.content().is_empty());
    assert_eq!(beyond.total_elements, 5);
}

#[test]
fn declared_count_text_drives_the_total() {
    let conn = open();
    let session = session(&conn);
    seed_team(&session, "teamA", &["a", "b"]);
    seed_members(&session, &[("c", 0), ("d", 7)]);

    let page = session
        .repository::<Member>()
        .page(
            "findByAgeJoined",
            &Args::new().bind("age", 0),
            &PageRequest::of(0, 2),
        )
        .unwrap();
    assert_eq!(
        usernames(&page, |m| m.borrow().username.clone()),
        vec!["a", "b"]
    );
    assert_eq!(page.total_elements, 3);
    assert_eq!(page.total_pages(), 2);
}

#[test]
fn caller_sort_is_applied_after_static_order() {
    let conn = open();
    let session = session(&conn);
    seed_members(&session, &[("b", 1), ("a", 1), ("c", 2)]);

    let found = session
        .repository::<Member>()
        .list_sorted(
            "findTop3ByOrderByAgeDesc",
            &Args::new(),
            &Sort::asc("username"),
        )
        .unwrap();
    let names: Vec<String> = found.iter().map(|m| m.borrow().username.clone()).collect();
    assert_eq!(names, vec!["c", "a", "b"]);
}

#[test]
fn unknown_sort_property_is_unresolved() {
    let conn = open();
    let session = session(&conn);
    let err = session
        .repository::<Member>()
        .find_all_page(&PageRequest::of(0, 3).with_sort(Sort::asc("nickname")))
        .unwrap_err();
    assert!(matches!(err, RepoError::UnresolvedField { .. }));
}

#[test]
fn find_all_page_sorts_by_nested_property() {
    let conn = open();
    let session = session(&conn);
    seed_team(&session, "zeta", &["m1"]);
    seed_team(&session, "alpha", &["m2"]);

    let page = session
        .repository::<Member>()
        .find_all_page(&PageRequest::of(0, 10).with_sort(Sort::asc("team.name")))
        .unwrap();
    assert_eq!(
        usernames(&page, |m| m.borrow().username.clone()),
        vec!["m2", "m1"]
    );
    assert_eq!(page.total_elements, 2);
}

#[test]
fn page_size_is_clamped() {
    let conn = open();
    let session = Session::builder()
        .actor_provider(FixedActor::new(ACTOR))
        .registry(registry())
        .config(QueryConfig {
            max_page_size: 2,
            ..QueryConfig::default()
        })
        .build(&conn)
        .unwrap();
    seed_members(&session, &[("a", 1), ("b", 1), ("c", 1)]);

    let page = session
        .repository::<Member>()
        .find_all_page(&PageRequest::of(0, 50).with_sort(Sort::asc("username")))
        .unwrap();
    assert_eq!(page.size, 2);
    assert_eq!(page.content().len(), 2);
    assert_eq!(page.total_pages(), 2);
}

#[test]
fn page_accessor_requires_page_declaration() {
    let conn = open();
    let session = session(&conn);
    let err = session
        .repository::<Member>()
        .page("findByUsername", &Args::new().push("a"), &PageRequest::of(0, 1))
        .unwrap_err();
    assert!(matches!(err, RepoError::ShapeMismatch { .. }));
}

#[derive(Debug, PartialEq)]
struct MemberLine {
    id: i64,
    username: String,
    team_name: Option<String>,
}

impl Projection for MemberLine {
    fn paths() -> &'static [&'static str] {
        &["id", "username", "team.name"]
    }

    fn from_row(row: &ProjectedRow) -> RepoResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            username: row.get("username")?,
            team_name: row.get("teamName")?,
        })
    }
}

#[test]
fn native_projection_page() {
    let conn = open();
    let session = session(&conn);
    seed_team(&session, "teamA", &["b"]);
    seed_members(&session, &[("c", 1), ("a", 2)]);
    let members = session.repository::<Member>();
    let request = PageRequest::of(0, 2).with_sort(Sort::asc("username"));

    let page = members
        .project_page::<MemberLine>("nativeProjection", &Args::new(), &request)
        .unwrap();
    assert_eq!(page.total_elements, 3);
    assert_eq!(page.content().len(), 2);
    assert_eq!(page.content()[0].username, "a");
    assert_eq!(page.content()[0].team_name, None);
    assert_eq!(page.content()[1].username, "b");
    assert_eq!(page.content()[1].team_name.as_deref(), Some("teamA"));
    assert!(page.content()[0].id > 0);

    let last = members
        .project_page::<MemberLine>("nativeProjection", &Args::new(), &request.next())
        .unwrap();
    assert_eq!(last.content().len(), 1);
    assert_eq!(last.content()[0].username, "c");

    let err = members
        .project_page::<MemberLine>(
            "nativeProjection",
            &Args::new(),
            &PageRequest::of(0, 2).with_sort(Sort::asc("name\"; drop table member; --")),
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::Configuration(_)));
}

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use repoquery_core::{
    open_db_in_memory, Clock, DeclaredQuery, DerivedQuery, FixedActor, LockMode, Member,
    QueryRegistry, ResultShape, Session, Team,
};
use rusqlite::Connection;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub const ACTOR: &str = "tester";
pub const EPOCH_MILLIS: i64 = 1_700_000_000_000;

/// Advances one second on every reading.
#[derive(Debug, Default)]
pub struct SteppingClock(AtomicI64);

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let tick = self.0.fetch_add(1, Ordering::SeqCst);
        Utc.timestamp_millis_opt(EPOCH_MILLIS + tick * 1_000).unwrap()
    }
}

pub fn registry() -> Arc<QueryRegistry> {
    QueryRegistry::builder()
        .derive::<Member>(DerivedQuery::new("findByUsernameAndAgeGreaterThan"))
        .unwrap()
        .derive::<Member>(DerivedQuery::new("findByUsername"))
        .unwrap()
        .derive::<Member>(DerivedQuery::new("findMemberByUsername").returns(ResultShape::One))
        .unwrap()
        .derive::<Member>(
            DerivedQuery::new("findOptionalByUsername").returns(ResultShape::Optional),
        )
        .unwrap()
        .derive::<Member>(DerivedQuery::new("findReadOnlyByUsername").read_only())
        .unwrap()
        .derive::<Member>(
            DerivedQuery::new("findLockByUsername").lock(LockMode::PessimisticWrite),
        )
        .unwrap()
        .derive::<Member>(DerivedQuery::new("findByAge").returns(ResultShape::Page))
        .unwrap()
        .derive::<Member>(DerivedQuery::new("findByAgeGreaterThanEqual").returns(ResultShape::Page))
        .unwrap()
        .derive::<Member>(DerivedQuery::new("findByUsernameIn"))
        .unwrap()
        .derive::<Member>(DerivedQuery::new("findByUsernameStartingWith"))
        .unwrap()
        .derive::<Member>(DerivedQuery::new("findTop3ByOrderByAgeDesc"))
        .unwrap()
        .derive::<Member>(DerivedQuery::new("findByTeamName"))
        .unwrap()
        .derive::<Member>(DerivedQuery::new("countByAgeGreaterThan"))
        .unwrap()
        .derive::<Member>(DerivedQuery::new("existsByUsername"))
        .unwrap()
        .derive::<Member>(DerivedQuery::new("deleteByUsername"))
        .unwrap()
        .derive::<Member>(DerivedQuery::new("findAll").fetch("team"))
        .unwrap()
        .declare::<Member>(DeclaredQuery::logical(
            "findUser",
            "select m from Member m where m.username = :username and m.age = :age",
        ))
        .unwrap()
        .declare::<Member>(DeclaredQuery::logical(
            "findUsernameList",
            "select m.username from Member m order by m.username",
        ))
        .unwrap()
        .declare::<Member>(DeclaredQuery::logical(
            "findMemberDto",
            "select new MemberDto(m.id, m.username, t.name) from Member m join m.team t order by m.id",
        ))
        .unwrap()
        .declare::<Member>(DeclaredQuery::logical(
            "findByNames",
            "select m from Member m where m.username in :names order by m.username",
        ))
        .unwrap()
        .declare::<Member>(
            DeclaredQuery::logical(
                "findByAgeJoined",
                "select m from Member m left join m.team t where m.age = :age order by m.username",
            )
            .count("select count(m) from Member m where m.age = :age")
            .returns(ResultShape::Page),
        )
        .unwrap()
        .declare::<Member>(DeclaredQuery::logical(
            "findFetchTeam",
            "select m from Member m left join fetch m.team t order by m.id",
        ))
        .unwrap()
        .declare::<Member>(DeclaredQuery::logical(
            "bulkAgePlus",
            "update Member m set m.age = m.age + 1 where m.age >= :age",
        ))
        .unwrap()
        .declare::<Member>(DeclaredQuery::logical(
            "countOlder",
            "select count(m) from Member m where m.age > :age",
        ))
        .unwrap()
        .declare::<Member>(DeclaredQuery::native(
            "nativeByUsername",
            "select * from member where username = :username",
        ))
        .unwrap()
        .declare::<Member>(
            DeclaredQuery::native(
                "nativeProjection",
                "select m.member_id as id, m.username as username, t.team_name as teamName \
                 from member m left join team t on t.team_id = m.team_id",
            )
            .count("select count(*) from member")
            .returns(ResultShape::Page),
        )
        .unwrap()
        .declare::<Member>(
            DeclaredQuery::native(
                "nativeSlowCount",
                "with recursive n(x) as (select 1 union all select x + 1 from n) \
                 select count(*) from (select x from n limit 200000000)",
            )
            .returns(ResultShape::Scalar),
        )
        .unwrap()
        .build()
}

pub fn session(conn: &Connection) -> Session<'_> {
    Session::builder()
        .actor_provider(FixedActor::new(ACTOR))
        .clock(Arc::new(SteppingClock::default()))
        .registry(registry())
        .build(conn)
        .unwrap()
}

pub fn open() -> Connection {
    open_db_in_memory().unwrap()
}

/// Saves one member per `(username, age)` pair.
pub fn seed_members(session: &Session<'_>, members: &[(&str, i32)]) {
    let repo = session.repository::<Member>();
    repo.save_all(
        members
            .iter()
            .map(|(username, age)| Member::new(*username, *age)),
    )
    .unwrap();
}

/// Saves a team and puts the given members on it.
pub fn seed_team(session: &Session<'_>, name: &str, usernames: &[&str]) -> Team {
    let teams = session.repository::<Team>();
    let members = session.repository::<Member>();
    session
        .transaction(|_| {
            let team = teams.save(Team::new(name))?;
            for username in usernames {
                let member = members.save(Member::named(*username))?;
                let mut team = team.borrow_mut();
                member.borrow_mut().change_team(None, &mut team)?;
            }
            Ok(team.get())
        })
        .unwrap()
}

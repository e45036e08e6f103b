//! CLI smoke entry point.
//!
//! # Responsibility
//! - Open the configured store, seed `userN` members and print the first
//!   page of members sorted by username.
//! - Keep output deterministic for quick local sanity checks.

use log::info;
use repoquery_core::{
    init_from_config, open_db_with_config, FixedActor, Member, PageRequest, RepoConfig,
    RepoResult, Session, Sort,
};
use std::process::ExitCode;

const SEED_MEMBERS: i32 = 100;
const PAGE_SIZE: u32 = 5;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("repoquery: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = RepoConfig::load()?;
    init_from_config(&config.logging)?;
    println!("repoquery_core version={}", repoquery_core::core_version());

    let conn = open_db_with_config(&config.database)?;
    let session = Session::builder()
        .actor_provider(FixedActor::new("repoquery-cli"))
        .config(config.query.clone())
        .build(&conn)?;

    seed(&session)?;
    let members = session.repository::<Member>();
    let page = members.find_all_page(
        &PageRequest::of(0, PAGE_SIZE).with_sort(Sort::asc("username")),
    )?;
    println!(
        "members total={} pages={} page={} has_next={}",
        page.total_elements,
        page.total_pages(),
        page.number,
        page.has_next()
    );
    for member in page.content() {
        let member = member.borrow();
        println!("  {:?}", *member);
    }
    Ok(())
}

fn seed(session: &Session<'_>) -> RepoResult<()> {
    let members = session.repository::<Member>();
    if members.count()? > 0 {
        return Ok(());
    }
    session.transaction(|_| {
        members.save_all(
            (0..SEED_MEMBERS).map(|index| Member::new(format!("user{index}"), index)),
        )?;
        Ok(())
    })?;
    info!("event=seed module=cli status=ok members={SEED_MEMBERS}");
    Ok(())
}

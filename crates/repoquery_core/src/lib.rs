//! Repository query layer over SQLite.
//!
//! Callers declare data access once, at startup, as method names
//! (`findByUsernameAndAgeGreaterThan`), logical query text or native SQL.
//! Declarations are resolved into descriptors, compiled into parameterized
//! statements and executed inside a session's unit of work, which also
//! stamps auditing columns and flushes tracked entity changes.

pub mod audit;
pub mod config;
pub mod db;
pub(crate) mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod query;
pub mod repository;
pub mod session;

pub use audit::{ActorProvider, Auditor, Clock, FixedActor, SystemClock};
pub use config::{ConfigError, DatabaseConfig, LoggingConfig, QueryConfig, RepoConfig};
pub use db::{open_db, open_db_in_memory, open_db_with_config, DbError};
pub use error::{RepoError, RepoResult};
pub use logging::{default_log_level, init_from_config, init_logging, LoggingError};
pub use model::entity::{AuditMode, Entity, EntityMeta};
pub use model::member::Member;
pub use model::projection::{
    MemberDto, MemberWithTeam, ProjectedRow, Projection, TeamInfo, UsernameOnly,
};
pub use model::team::Team;
pub use model::value::{EntityId, FromValue, Value};
pub use query::{
    Args, DeclaredQuery, DerivedQuery, Direction, LockMode, Order, Page, PageRequest,
    QueryDescriptor, QueryRegistry, RegistryBuilder, ResultShape, Sort,
};
pub use repository::{QueryResult, Repository};
pub use session::{Managed, Session, SessionBuilder, SessionStats};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}

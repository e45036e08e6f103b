//! Auditing interceptor.
//!
//! # Responsibility
//! - Stamp creation and modification timestamps and actors on entity writes.
//! - Resolve the current actor through an explicitly configured provider.
//!
//! # Invariants
//! - Stamping runs before the write is dispatched; an actor failure aborts
//!   the write.
//! - `created_*` is written once, on insert. Updates only touch `modified_*`.
//! - Entities in timestamp-only mode never consult the actor provider.
//! - Bulk mutations bypass this interceptor.

use crate::error::{RepoError, RepoResult};
use crate::model::entity::{AuditMode, Entity};
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;

/// Supplies the identifier of whoever performs the current write.
pub trait ActorProvider: Send + Sync {
    fn current_actor(&self) -> Result<String, String>;
}

impl<F> ActorProvider for F
where
    F: Fn() -> Result<String, String> + Send + Sync,
{
    fn current_actor(&self) -> Result<String, String> {
        self()
    }
}

/// Provider that always returns the same actor.
#[derive(Debug, Clone)]
pub struct FixedActor(pub String);

impl FixedActor {
    pub fn new(actor: impl Into<String>) -> Self {
        Self(actor.into())
    }
}

impl ActorProvider for FixedActor {
    fn current_actor(&self) -> Result<String, String> {
        Ok(self.0.clone())
    }
}

/// Time source for audit stamps.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Applies audit stamps using a configured actor provider and clock.
#[derive(Clone)]
pub struct Auditor {
    actor: Arc<dyn ActorProvider>,
    clock: Arc<dyn Clock>,
}

impl Debug for Auditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auditor").field("clock", &self.clock).finish()
    }
}

impl Auditor {
    pub fn new(actor: Arc<dyn ActorProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { actor, clock }
    }

    fn actor(&self) -> RepoResult<String> {
        let actor = self
            .actor
            .current_actor()
            .map_err(|err| RepoError::Configuration(format!("actor provider failed: {err}")))?;
        if actor.trim().is_empty() {
            return Err(RepoError::Configuration(
                "actor provider returned an empty actor".to_string(),
            ));
        }
        Ok(actor)
    }

    /// Stamps a transient entity before its insert. `modified_*` equals
    /// `created_*` afterwards.
    pub fn stamp_create<E: Entity>(&self, entity: &mut E) -> RepoResult<()> {
        let actor = match E::meta().audit {
            AuditMode::Full => Some(self.actor()?),
            AuditMode::TimestampsOnly => None,
        };
        let now = self.clock.now();
        let audit = entity.audit_mut();
        audit.created_at = Some(now);
        audit.modified_at = Some(now);
        audit.created_by = actor.clone();
        audit.modified_by = actor;
        Ok(())
    }

    /// Stamps a managed entity before an update statement.
    pub fn stamp_update<E: Entity>(&self, entity: &mut E) -> RepoResult<()> {
        let actor = match E::meta().audit {
            AuditMode::Full => Some(self.actor()?),
            AuditMode::TimestampsOnly => None,
        };
        let now = self.clock.now();
        let audit = entity.audit_mut();
        audit.modified_at = Some(now);
        audit.modified_by = actor;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Auditor, Clock, FixedActor};
    use crate::error::RepoError;
    use crate::model::entity::Entity;
    use crate::model::member::Member;
    use crate::model::team::Team;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct TickClock(AtomicI64);

    impl Clock for TickClock {
        fn now(&self) -> DateTime<Utc> {
            let tick = self.0.fetch_add(1, Ordering::SeqCst);
            Utc.timestamp_millis_opt(1_700_000_000_000 + tick * 1000)
                .unwrap()
        }
    }

    fn auditor() -> Auditor {
        Auditor::new(Arc::new(FixedActor::new("tester")), Arc::new(TickClock::default()))
    }

    #[test]
    fn create_sets_both_envelopes() {
        let mut member = Member::new("member1", 10);
        auditor().stamp_create(&mut member).unwrap();
        let audit = member.audit();
        assert_eq!(audit.created_by(), Some("tester"));
        assert_eq!(audit.modified_by(), Some("tester"));
        assert_eq!(audit.created_at(), audit.modified_at());
    }

    #[test]
    fn update_moves_modified_only() {
        let auditor = auditor();
        let mut member = Member::new("member1", 10);
        auditor.stamp_create(&mut member).unwrap();
        let created = member.audit().created_at();
        auditor.stamp_update(&mut member).unwrap();
        assert_eq!(member.audit().created_at(), created);
        assert!(member.audit().modified_at() > created);
    }

    #[test]
    fn timestamp_only_entities_skip_actor() {
        let failing = Auditor::new(
            Arc::new(|| -> Result<String, String> { Err("no session user".to_string()) }),
            Arc::new(TickClock::default()),
        );
        let mut team = Team::new("teamA");
        failing.stamp_create(&mut team).unwrap();
        assert!(team.audit().created_at().is_some());
        assert_eq!(team.audit().created_by(), None);

        let mut member = Member::new("member1", 10);
        let err = failing.stamp_create(&mut member).unwrap_err();
        assert!(matches!(err, RepoError::Configuration(_)));
        assert!(member.audit().created_at().is_none());
    }
}

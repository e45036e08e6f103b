//! Member entity and its owning reference to `Team`.
//!
//! # Invariants
//! - `team_id` is the only authoritative side of the Member -> Team link.
//! - `team` is a snapshot filled by fetch joins; it is never written back.
//! - Debug output lists id, username and age only, so printing a member never
//!   walks into its team.

use crate::error::{RepoError, RepoResult};
use crate::model::audit::AuditEnvelope;
use crate::model::entity::{AuditMode, Entity, EntityMeta, FieldMeta, RelationMeta};
use crate::model::projection::ProjectedRow;
use crate::model::team::{Team, TEAM_META};
use crate::model::value::{EntityId, Value};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};

pub static MEMBER_META: EntityMeta = EntityMeta {
    name: "Member",
    table: "member",
    id_column: "member_id",
    fields: &[
        FieldMeta {
            name: "username",
            column: "username",
        },
        FieldMeta {
            name: "age",
            column: "age",
        },
    ],
    relations: &[RelationMeta {
        name: "team",
        column: "team_id",
        target: &TEAM_META,
    }],
    audit: AuditMode::Full,
};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    id: Option<EntityId>,
    pub username: String,
    pub age: i32,
    team_id: Option<EntityId>,
    #[serde(skip)]
    team: Option<Team>,
    #[serde(flatten)]
    audit: AuditEnvelope,
}

impl Member {
    pub fn new(username: impl Into<String>, age: i32) -> Self {
        Self {
            id: None,
            username: username.into(),
            age,
            team_id: None,
            team: None,
            audit: AuditEnvelope::default(),
        }
    }

    pub fn named(username: impl Into<String>) -> Self {
        Self::new(username, 0)
    }

    pub fn team_id(&self) -> Option<EntityId> {
        self.team_id
    }

    /// Team snapshot loaded by a fetch join, if the query asked for one.
    pub fn team(&self) -> Option<&Team> {
        self.team.as_ref()
    }

    /// Moves this member to `next`, keeping both back-collections in step.
    ///
    /// `previous` must be the member's current team, or `None` when the
    /// member has none; its back-collection loses this member.
    ///
    /// # Errors
    /// - `TransientEntity` when the member or `next` has no identity yet.
    /// - `Configuration` when `previous` is not the member's current team.
    pub fn change_team(&mut self, previous: Option<&mut Team>, next: &mut Team) -> RepoResult<()> {
        let member_id = self.id.ok_or(RepoError::TransientEntity { entity: "Member" })?;
        let next_id = next.id().ok_or(RepoError::TransientEntity { entity: "Team" })?;
        self.expect_team(previous.as_deref())?;

        if let Some(previous) = previous {
            previous.unlink_member(member_id);
        }
        next.link_member(member_id);
        self.team_id = Some(next_id);
        self.team = None;
        Ok(())
    }

    /// Detaches this member from its team. `current` follows the same rule
    /// as `previous` in [`Member::change_team`].
    pub fn leave_team(&mut self, current: Option<&mut Team>) -> RepoResult<()> {
        let member_id = self.id.ok_or(RepoError::TransientEntity { entity: "Member" })?;
        self.expect_team(current.as_deref())?;
        if let Some(current) = current {
            current.unlink_member(member_id);
        }
        self.team_id = None;
        self.team = None;
        Ok(())
    }

    fn expect_team(&self, held: Option<&Team>) -> RepoResult<()> {
        let held_id = held.and_then(|team| team.id());
        if held_id == self.team_id {
            return Ok(());
        }
        let describe =
            |id: Option<EntityId>| id.map_or_else(|| "none".to_string(), |id| id.to_string());
        Err(RepoError::Configuration(format!(
            "member {} belongs to team {}, but team {} was passed as its current team",
            describe(self.id),
            describe(self.team_id),
            describe(held_id)
        )))
    }
}

impl Debug for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("age", &self.age)
            .finish()
    }
}

impl Entity for Member {
    fn meta() -> &'static EntityMeta {
        &MEMBER_META
    }

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn audit(&self) -> &AuditEnvelope {
        &self.audit
    }

    fn audit_mut(&mut self) -> &mut AuditEnvelope {
        &mut self.audit
    }

    fn column_values(&self) -> Vec<Value> {
        vec![
            Value::from(self.username.as_str()),
            Value::from(self.age),
            Value::from(self.team_id),
        ]
    }

    fn from_row(row: &ProjectedRow) -> RepoResult<Self> {
        Ok(Self {
            id: Some(row.get("member_id")?),
            username: row.get::<Option<String>>("username")?.unwrap_or_default(),
            age: row.get("age")?,
            team_id: row.get("team_id")?,
            team: None,
            audit: AuditEnvelope {
                created_at: row.get("created_at")?,
                created_by: row.get("created_by")?,
                modified_at: row.get("modified_at")?,
                modified_by: row.get("modified_by")?,
            },
        })
    }

    fn attach_fetched(&mut self, relation: &str, row: &ProjectedRow) -> RepoResult<()> {
        if relation != "team" {
            return Ok(());
        }
        let team_id: Option<EntityId> = row.get("team_id")?;
        self.team = match team_id {
            Some(_) => Some(Team::from_row(row)?),
            None => None,
        };
        Ok(())
    }
}

//! Team entity.
//!
//! # Invariants
//! - `members` is a derived, non-authoritative index of member ids. It is
//!   never persisted, never serialized, and only changes through
//!   `Member::change_team` or a repository load.
//! - Teams carry timestamp-only auditing.

use crate::error::RepoResult;
use crate::model::audit::AuditEnvelope;
use crate::model::entity::{AuditMode, Entity, EntityMeta, FieldMeta};
use crate::model::projection::ProjectedRow;
use crate::model::value::{EntityId, Value};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};

pub static TEAM_META: EntityMeta = EntityMeta {
    name: "Team",
    table: "team",
    id_column: "team_id",
    fields: &[FieldMeta {
        name: "name",
        column: "team_name",
    }],
    relations: &[],
    audit: AuditMode::TimestampsOnly,
};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    id: Option<EntityId>,
    pub name: String,
    #[serde(skip)]
    members: Vec<EntityId>,
    #[serde(flatten)]
    audit: AuditEnvelope,
}

impl Team {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            members: Vec::new(),
            audit: AuditEnvelope::default(),
        }
    }

    /// Ids of members currently pointing at this team, as far as this
    /// instance knows.
    pub fn members(&self) -> &[EntityId] {
        &self.members
    }

    pub(crate) fn link_member(&mut self, member_id: EntityId) {
        if !self.members.contains(&member_id) {
            self.members.push(member_id);
        }
    }

    pub(crate) fn unlink_member(&mut self, member_id: EntityId) {
        self.members.retain(|id| *id != member_id);
    }

    pub(crate) fn replace_members(&mut self, members: Vec<EntityId>) {
        self.members = members;
    }
}

impl Debug for Team {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Team")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Entity for Team {
    fn meta() -> &'static EntityMeta {
        &TEAM_META
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
        vec![Value::from(self.name.as_str())]
    }

    fn from_row(row: &ProjectedRow) -> RepoResult<Self> {
        Ok(Self {
            id: Some(row.get("team_id")?),
            name: row.get::<Option<String>>("team_name")?.unwrap_or_default(),
            members: Vec::new(),
            audit: AuditEnvelope {
                created_at: row.get("created_at")?,
                created_by: None,
                modified_at: row.get("modified_at")?,
                modified_by: None,
            },
        })
    }
}

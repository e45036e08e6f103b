//! Entity metadata and the persistence contract every entity implements.
//!
//! # Responsibility
//! - Describe table, key, column and relation layout per entity type.
//! - Resolve logical property names (`username`, `team`, `createdAt`) to
//!   physical columns for the deriver, resolver and compiler.
//!
//! # Invariants
//! - `id == None` means transient; once assigned the id never changes.
//! - `column_values()` follows `EntityMeta::persistent_columns()` order and
//!   excludes the key and the auditing envelope.

use crate::error::RepoResult;
use crate::model::audit::AuditEnvelope;
use crate::model::projection::ProjectedRow;
use crate::model::value::{EntityId, Value};
use std::fmt::Debug;

/// Which auditing columns an entity carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditMode {
    /// `created_at`, `created_by`, `modified_at`, `modified_by`.
    Full,
    /// `created_at`, `modified_at`; the actor provider is never consulted.
    TimestampsOnly,
}

#[derive(Debug, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: &'static str,
    pub column: &'static str,
}

/// Owning many-to-one reference stored as a foreign key column.
#[derive(Debug, PartialEq, Eq)]
pub struct RelationMeta {
    pub name: &'static str,
    pub column: &'static str,
    pub target: &'static EntityMeta,
}

#[derive(Debug, PartialEq, Eq)]
pub struct EntityMeta {
    pub name: &'static str,
    pub table: &'static str,
    pub id_column: &'static str,
    pub fields: &'static [FieldMeta],
    pub relations: &'static [RelationMeta],
    pub audit: AuditMode,
}

/// What a logical property resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Id,
    Field,
    Relation,
    Audit,
}

/// A logical property with its physical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property {
    pub name: &'static str,
    pub column: &'static str,
    pub kind: PropertyKind,
}

const FULL_AUDIT: &[(&str, &str)] = &[
    ("createdAt", "created_at"),
    ("createdBy", "created_by"),
    ("modifiedAt", "modified_at"),
    ("modifiedBy", "modified_by"),
];

const TIMESTAMP_AUDIT: &[(&str, &str)] = &[("createdAt", "created_at"), ("modifiedAt", "modified_at")];

impl EntityMeta {
    /// Resolves a logical property name, ignoring ASCII case.
    pub fn property(&self, name: &str) -> Option<Property> {
        self.properties()
            .into_iter()
            .find(|property| property.name.eq_ignore_ascii_case(name))
    }

    /// Every addressable property: key, fields, relations, audit columns.
    pub fn properties(&self) -> Vec<Property> {
        let mut properties = vec![Property {
            name: "id",
            column: self.id_column,
            kind: PropertyKind::Id,
        }];
        properties.extend(self.fields.iter().map(|field| Property {
            name: field.name,
            column: field.column,
            kind: PropertyKind::Field,
        }));
        properties.extend(self.relations.iter().map(|relation| Property {
            name: relation.name,
            column: relation.column,
            kind: PropertyKind::Relation,
        }));
        properties.extend(self.audit_columns().iter().map(|&(name, column)| Property {
            name,
            column,
            kind: PropertyKind::Audit,
        }));
        properties
    }

    pub fn relation(&self, name: &str) -> Option<&'static RelationMeta> {
        self.relations
            .iter()
            .find(|relation| relation.name.eq_ignore_ascii_case(name))
    }

    /// Columns written from `Entity::column_values()`, in order.
    pub fn persistent_columns(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .map(|field| field.column)
            .chain(self.relations.iter().map(|relation| relation.column))
            .collect()
    }

    pub fn audit_columns(&self) -> &'static [(&'static str, &'static str)] {
        match self.audit {
            AuditMode::Full => FULL_AUDIT,
            AuditMode::TimestampsOnly => TIMESTAMP_AUDIT,
        }
    }

    /// Key, persistent and audit columns: the full row shape of the entity.
    pub fn select_columns(&self) -> Vec<&'static str> {
        let mut columns = vec![self.id_column];
        columns.extend(self.persistent_columns());
        columns.extend(self.audit_columns().iter().map(|(_, column)| *column));
        columns
    }
}

/// Persistence contract implemented by every entity type.
pub trait Entity: Clone + Debug + 'static {
    fn meta() -> &'static EntityMeta;

    fn id(&self) -> Option<EntityId>;

    /// Called exactly once, after the store assigned the key.
    fn assign_id(&mut self, id: EntityId);

    fn audit(&self) -> &AuditEnvelope;

    fn audit_mut(&mut self) -> &mut AuditEnvelope;

    fn column_values(&self) -> Vec<Value>;

    /// Decodes the entity from a row labelled with `select_columns()`.
    fn from_row(row: &ProjectedRow) -> RepoResult<Self>;

    /// Stores an eagerly fetched relation. `row` holds the target's columns
    /// with the relation prefix already stripped.
    fn attach_fetched(&mut self, _relation: &str, _row: &ProjectedRow) -> RepoResult<()> {
        Ok(())
    }
}

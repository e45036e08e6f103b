//! Per-entity write path: insert, update, delete and load by key.
//!
//! # Invariants
//! - Inserts and updates are stamped by the auditor before dispatch.
//! - Updates never write `created_*` columns.

use crate::audit::Auditor;
use crate::engine::Executor;
use crate::error::{RepoError, RepoResult};
use crate::model::entity::{AuditMode, Entity, EntityMeta};
use crate::model::value::{EntityId, Value};

pub(crate) struct Writer<'a, 'c> {
    exec: Executor<'c>,
    auditor: &'a Auditor,
}

fn audit_values<E: Entity>(entity: &E, on_create: bool) -> Vec<(&'static str, Value)> {
    let audit = entity.audit();
    let mut values = Vec::with_capacity(4);
    if on_create {
        values.push(("created_at", Value::from(audit.created_at())));
        if E::meta().audit == AuditMode::Full {
            values.push(("created_by", Value::from(audit.created_by())));
        }
    }
    values.push(("modified_at", Value::from(audit.modified_at())));
    if E::meta().audit == AuditMode::Full {
        values.push(("modified_by", Value::from(audit.modified_by())));
    }
    values
}

fn statement_name(meta: &EntityMeta, operation: &str) -> String {
    format!("{}.{operation}", meta.name)
}

impl<'a, 'c> Writer<'a, 'c> {
    pub fn new(exec: Executor<'c>, auditor: &'a Auditor) -> Self {
        Self { exec, auditor }
    }

    /// Stamps and inserts a transient entity, then assigns its key.
    pub fn insert<E: Entity>(&self, entity: &mut E) -> RepoResult<EntityId> {
        let meta = E::meta();
        if entity.id().is_some() {
            return Err(RepoError::Configuration(format!(
                "{} already has an identity and cannot be inserted",
                meta.name
            )));
        }
        self.auditor.stamp_create(entity)?;

        let mut columns = meta.persistent_columns();
        let mut values = entity.column_values();
        for (column, value) in audit_values(entity, true) {
            columns.push(column);
            values.push(value);
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            meta.table,
            columns.join(", ")
        );
        self.exec
            .execute_values(&statement_name(meta, "insert"), &sql, values)?;
        let id = self.exec.last_insert_rowid();
        entity.assign_id(id);
        Ok(id)
    }

    /// Stamps and updates a managed entity. Zero affected rows is `NotFound`.
    pub fn update<E: Entity>(&self, entity: &mut E) -> RepoResult<()> {
        let meta = E::meta();
        let id = entity
            .id()
            .ok_or(RepoError::TransientEntity { entity: meta.name })?;
        self.auditor.stamp_update(entity)?;

        let mut assignments: Vec<String> = meta
            .persistent_columns()
            .into_iter()
            .map(|column| format!("{column} = ?"))
            .collect();
        let mut values = entity.column_values();
        for (column, value) in audit_values(entity, false) {
            assignments.push(format!("{column} = ?"));
            values.push(value);
        }
        values.push(Value::Integer(id));
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            meta.table,
            assignments.join(", "),
            meta.id_column
        );
        let affected = self
            .exec
            .execute_values(&statement_name(meta, "update"), &sql, values)?;
        if affected == 0 {
            return Err(RepoError::NotFound {
                entity: meta.name,
                key: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn delete(&self, meta: &EntityMeta, id: EntityId) -> RepoResult<usize> {
        let sql = format!("DELETE FROM {} WHERE {} = ?", meta.table, meta.id_column);
        self.exec
            .execute_values(&statement_name(meta, "delete"), &sql, vec![Value::Integer(id)])
    }

    /// Loads one entity by key.
    pub fn load<E: Entity>(&self, id: EntityId) -> RepoResult<Option<E>> {
        let meta = E::meta();
        let columns: Vec<String> = meta
            .select_columns()
            .into_iter()
            .map(|column| format!("t0.{column} AS \"{column}\""))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} AS t0 WHERE t0.{} = ?",
            columns.join(", "),
            meta.table,
            meta.id_column
        );
        let rows = self.exec.rows_values(
            &statement_name(meta, "findById"),
            &sql,
            vec![Value::Integer(id)],
        )?;
        rows.first().map(E::from_row).transpose()
    }
}

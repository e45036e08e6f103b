//! Execution engine.
//!
//! # Responsibility
//! - Compile descriptors to SQL and run them on the connection.
//! - Bind arguments, enforce deadlines and return owned rows.
//!
//! # Invariants
//! - Bound values are never logged; events carry query names, counts and
//!   durations only.
//! - Every statement runs under the caller's deadline, if any.

pub(crate) mod compile;
mod deadline;
pub(crate) mod persist;

use crate::error::{RepoError, RepoResult};
use crate::model::projection::ProjectedRow;
use crate::model::value::Value;
use crate::query::descriptor::ParamRef;
use compile::{Binding, Compiled};
use deadline::DeadlineGuard;
use log::{debug, warn};
use rusqlite::{Connection, Statement};
use std::time::Instant;

/// Runs compiled statements on one connection.
#[derive(Clone, Copy)]
pub(crate) struct Executor<'c> {
    conn: &'c Connection,
    deadline: Option<Instant>,
}

impl<'c> Executor<'c> {
    pub fn new(conn: &'c Connection, deadline: Option<Instant>) -> Self {
        Self { conn, deadline }
    }

    /// Runs a row-returning statement.
    pub fn rows(&self, query: &str, compiled: &Compiled<'_>) -> RepoResult<Vec<ProjectedRow>> {
        self.run(query, compiled, |stmt| {
            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            let mut out = Vec::new();
            let mut rows = stmt.raw_query();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(columns.len());
                for index in 0..columns.len() {
                    values.push(Value::from(row.get_ref(index)?));
                }
                out.push(ProjectedRow::new(columns.clone(), values));
            }
            Ok(out)
        })
        .inspect(|rows| {
            debug!(
                "event=query_execute module=engine status=ok query={query} rows={}",
                rows.len()
            )
        })
    }

    /// Runs a statement expected to yield one value in one row.
    pub fn scalar(&self, query: &str, compiled: &Compiled<'_>) -> RepoResult<Value> {
        let rows = self.rows(query, compiled)?;
        rows.into_iter()
            .next()
            .and_then(|row| row.into_values().into_iter().next())
            .ok_or_else(|| RepoError::InvalidData(format!("query `{query}` returned no value")))
    }

    /// Runs a write statement and returns the affected-row count.
    pub fn execute(&self, query: &str, compiled: &Compiled<'_>) -> RepoResult<usize> {
        self.run(query, compiled, |stmt| Ok(stmt.raw_execute()?))
            .inspect(|affected| {
                debug!(
                    "event=statement_execute module=engine status=ok query={query} affected={affected}"
                )
            })
    }

    /// Runs a plain statement with ordered values.
    pub fn execute_values(&self, query: &str, sql: &str, values: Vec<Value>) -> RepoResult<usize> {
        self.execute(
            query,
            &Compiled {
                sql: sql.to_string(),
                binding: Binding::Ordered(values),
            },
        )
    }

    pub fn rows_values(
        &self,
        query: &str,
        sql: &str,
        values: Vec<Value>,
    ) -> RepoResult<Vec<ProjectedRow>> {
        self.rows(
            query,
            &Compiled {
                sql: sql.to_string(),
                binding: Binding::Ordered(values),
            },
        )
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    fn run<T, F>(&self, query: &str, compiled: &Compiled<'_>, body: F) -> RepoResult<T>
    where
        F: FnOnce(&mut Statement<'_>) -> RepoResult<T>,
    {
        let started_at = Instant::now();
        let result = DeadlineGuard::arm(self.conn, self.deadline).and_then(|_guard| {
            let mut stmt = self.conn.prepare(&compiled.sql)?;
            bind(&mut stmt, query, &compiled.binding)?;
            body(&mut stmt)
        });
        if let Err(err) = &result {
            warn!(
                "event=statement_execute module=engine status=error query={query} duration_ms={} error_code={}",
                started_at.elapsed().as_millis(),
                err.code()
            );
        }
        result
    }
}

fn bind(stmt: &mut Statement<'_>, query: &str, binding: &Binding<'_>) -> RepoResult<()> {
    match binding {
        Binding::Ordered(values) => {
            let expected = stmt.parameter_count();
            if expected != values.len() {
                return Err(RepoError::Configuration(format!(
                    "query `{query}` compiled {expected} placeholders for {} values",
                    values.len()
                )));
            }
            for (index, value) in values.iter().enumerate() {
                stmt.raw_bind_parameter(index + 1, value)?;
            }
        }
        Binding::ByName { args, extra } => {
            for index in 1..=stmt.parameter_count() {
                let name = stmt.parameter_name(index).map(str::to_string);
                let param = match name.as_deref() {
                    Some(name) if name.starts_with('?') => name[1..]
                        .parse::<usize>()
                        .map(ParamRef::Positional)
                        .unwrap_or(ParamRef::Positional(index)),
                    Some(name) => {
                        let bare = &name[1..];
                        if let Some((_, value)) = extra.iter().find(|(key, _)| *key == bare) {
                            stmt.raw_bind_parameter(index, value)?;
                            continue;
                        }
                        ParamRef::Named(bare.to_string())
                    }
                    None => ParamRef::Positional(index),
                };
                let value = args.require(query, &param)?;
                if matches!(value, Value::List(_)) {
                    return Err(RepoError::Configuration(format!(
                        "query `{query}`: native statements cannot expand collection argument {param}"
                    )));
                }
                stmt.raw_bind_parameter(index, value)?;
            }
        }
    }
    Ok(())
}

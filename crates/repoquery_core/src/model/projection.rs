//! Owned result rows and caller-defined projections.
//!
//! # Responsibility
//! - Carry query results out of the driver as owned, labelled values.
//! - Let callers declare DTOs and closed views without touching the driver.
//!
//! # Invariants
//! - Projections are copies. They are never tracked by the unit of work and
//!   never alias managed entity state.

use crate::error::{RepoError, RepoResult};
use crate::model::value::{EntityId, FromValue, Value};
use serde::Serialize;

/// One result row with column labels.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedRow {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl ProjectedRow {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Raw value by label; labels compare ignoring ASCII case.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|label| label.eq_ignore_ascii_case(column))
            .map(|index| &self.values[index])
    }

    pub fn get<T: FromValue>(&self, column: &str) -> RepoResult<T> {
        let value = self
            .value(column)
            .ok_or_else(|| RepoError::InvalidData(format!("missing column `{column}`")))?;
        T::from_value(value)
            .map_err(|err| RepoError::InvalidData(format!("column `{column}`: {err}")))
    }

    /// Positional access, used by constructor projections.
    pub fn get_at<T: FromValue>(&self, index: usize) -> RepoResult<T> {
        let value = self.values.get(index).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "column index {index} out of range for {} columns",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Columns labelled `<prefix>.<name>`, relabelled `<name>`.
    pub fn with_prefix(&self, prefix: &str) -> ProjectedRow {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (label, value) in self.columns.iter().zip(&self.values) {
            let Some(rest) = label.strip_prefix(prefix) else {
                continue;
            };
            if let Some(name) = rest.strip_prefix('.') {
                columns.push(name.to_string());
                values.push(value.clone());
            }
        }
        ProjectedRow { columns, values }
    }
}

/// A read-only shape a query result can be mapped into.
///
/// `paths()` lists the logical properties to select, relative to the root
/// entity; one level of relation nesting is written `relation.property`.
/// Constructor projections declared in query text ignore `paths()` and read
/// their values positionally.
pub trait Projection: Sized {
    fn paths() -> &'static [&'static str];

    fn from_row(row: &ProjectedRow) -> RepoResult<Self>;
}

/// Closed view exposing only the member's username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsernameOnly {
    pub username: String,
}

impl Projection for UsernameOnly {
    fn paths() -> &'static [&'static str] {
        &["username"]
    }

    fn from_row(row: &ProjectedRow) -> RepoResult<Self> {
        Ok(Self {
            username: row.get("username")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamInfo {
    pub name: Option<String>,
}

/// Nested closed view: username plus the team's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberWithTeam {
    pub username: String,
    pub team: Option<TeamInfo>,
}

impl Projection for MemberWithTeam {
    fn paths() -> &'static [&'static str] {
        &["username", "team.id", "team.name"]
    }

    fn from_row(row: &ProjectedRow) -> RepoResult<Self> {
        let team_id: Option<EntityId> = row.get("team.id")?;
        Ok(Self {
            username: row.get("username")?,
            team: team_id
                .map(|_| row.get("team.name").map(|name| TeamInfo { name }))
                .transpose()?,
        })
    }
}

/// Positional DTO built by `select new MemberDto(m.id, m.username, t.name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberDto {
    pub id: EntityId,
    pub username: String,
    pub team_name: Option<String>,
}

impl Projection for MemberDto {
    fn paths() -> &'static [&'static str] {
        &["id", "username", "team.name"]
    }

    fn from_row(row: &ProjectedRow) -> RepoResult<Self> {
        Ok(Self {
            id: row.get_at(0)?,
            username: row.get_at(1)?,
            team_name: row.get_at(2)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{MemberWithTeam, Projection, ProjectedRow};
    use crate::model::value::Value;

    fn row(columns: &[&str], values: Vec<Value>) -> ProjectedRow {
        ProjectedRow::new(columns.iter().map(|c| c.to_string()).collect(), values)
    }

    #[test]
    fn with_prefix_strips_relation_label() {
        let row = row(
            &["member_id", "team.team_id", "team.team_name"],
            vec![Value::from(1), Value::from(7), Value::from("teamA")],
        );
        let team = row.with_prefix("team");
        assert_eq!(team.columns(), &["team_id".to_string(), "team_name".to_string()]);
        assert_eq!(team.get::<String>("team_name").unwrap(), "teamA");
    }

    #[test]
    fn nested_view_maps_missing_team_to_none() {
        let row = row(
            &["username", "team.id", "team.name"],
            vec![Value::from("member1"), Value::Null, Value::Null],
        );
        let view = MemberWithTeam::from_row(&row).unwrap();
        assert_eq!(view.username, "member1");
        assert_eq!(view.team, None);
    }
}

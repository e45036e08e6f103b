//! Named-query registry.
//!
//! # Responsibility
//! - Resolve every derived and declared query once, at startup.
//! - Hand out pre-resolved descriptors by `(entity, name)` on call paths.
//!
//! # Invariants
//! - Names are unique per entity type; a duplicate is a `Configuration` error.
//! - Any malformed declaration aborts `RegistryBuilder` before a registry
//!   exists. The built registry is immutable and shared through `Arc`.

use crate::error::{RepoError, RepoResult};
use crate::model::entity::{Entity, EntityMeta};
use crate::query::declared;
use crate::query::derive::derive;
use crate::query::descriptor::{
    Join, JoinKind, LockMode, Projection, QueryBody, QueryDescriptor, ResultShape,
};
use log::{error, info};
use std::collections::HashMap;
use std::sync::Arc;

/// Registration of a method-name query.
#[derive(Debug, Clone)]
pub struct DerivedQuery {
    method: String,
    shape: Option<ResultShape>,
    lock: LockMode,
    fetch: Vec<String>,
}

impl DerivedQuery {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            shape: None,
            lock: LockMode::None,
            fetch: Vec::new(),
        }
    }

    /// Overrides the verb's default return shape.
    pub fn returns(mut self, shape: ResultShape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    /// Results are never flushed back to the store.
    pub fn read_only(self) -> Self {
        self.lock(LockMode::ReadOnly)
    }

    /// Eagerly loads `relation` in the same statement.
    pub fn fetch(mut self, relation: impl Into<String>) -> Self {
        self.fetch.push(relation.into());
        self
    }
}

#[derive(Debug, Clone)]
enum Dialect {
    Logical(String),
    Native(String),
}

/// Registration of a query written as text.
#[derive(Debug, Clone)]
pub struct DeclaredQuery {
    name: String,
    dialect: Dialect,
    count: Option<String>,
    shape: Option<ResultShape>,
    lock: LockMode,
}

impl DeclaredQuery {
    /// Query text over entity names, aliases and property paths.
    pub fn logical(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_dialect(name.into(), Dialect::Logical(text.into()))
    }

    /// SQL passed to the store as written, with `?`, `?N` or `:name`
    /// placeholders.
    pub fn native(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::with_dialect(name.into(), Dialect::Native(sql.into()))
    }

    fn with_dialect(name: String, dialect: Dialect) -> Self {
        Self {
            name,
            dialect,
            count: None,
            shape: None,
            lock: LockMode::None,
        }
    }

    /// Count text used for paging instead of the derived count.
    pub fn count(mut self, text: impl Into<String>) -> Self {
        self.count = Some(text.into());
        self
    }

    pub fn returns(mut self, shape: ResultShape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    pub fn read_only(self) -> Self {
        self.lock(LockMode::ReadOnly)
    }
}

type QueryKey = (&'static str, String);

/// Resolved queries keyed by entity and query name.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    queries: HashMap<QueryKey, QueryDescriptor>,
}

impl QueryRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// An empty registry, for sessions that only use CRUD operations.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, entity: &EntityMeta, name: &str) -> Option<&QueryDescriptor> {
        self.queries.get(&(entity.name, name.to_string()))
    }

    pub(crate) fn require(&self, entity: &EntityMeta, name: &str) -> RepoResult<&QueryDescriptor> {
        self.get(entity, name).ok_or_else(|| {
            RepoError::Configuration(format!("no query `{name}` registered for `{}`", entity.name))
        })
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    queries: HashMap<QueryKey, QueryDescriptor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a method-name query for `E`.
    pub fn derive<E: Entity>(mut self, query: DerivedQuery) -> RepoResult<Self> {
        let meta = E::meta();
        let result = derive(meta, &query.method).and_then(|mut descriptor| {
            if let Some(shape) = query.shape {
                descriptor.shape = shape;
            }
            descriptor.lock = query.lock;
            for relation in &query.fetch {
                add_fetch(&mut descriptor, relation)?;
            }
            descriptor.validate()?;
            Ok(descriptor)
        });
        let descriptor = log_registration(meta, &query.method, "derived", result)?;
        self.insert(meta, query.method, descriptor)?;
        Ok(self)
    }

    /// Parses a logical or native query for `E`.
    pub fn declare<E: Entity>(mut self, query: DeclaredQuery) -> RepoResult<Self> {
        let meta = E::meta();
        let result = resolve_declared(meta, &query);
        let descriptor = log_registration(meta, &query.name, "declared", result)?;
        self.insert(meta, query.name, descriptor)?;
        Ok(self)
    }

    pub fn build(self) -> Arc<QueryRegistry> {
        info!(
            "event=registry_build module=query status=ok queries={}",
            self.queries.len()
        );
        Arc::new(QueryRegistry {
            queries: self.queries,
        })
    }

    fn insert(
        &mut self,
        meta: &'static EntityMeta,
        name: String,
        descriptor: QueryDescriptor,
    ) -> RepoResult<()> {
        let key = (meta.name, name);
        if self.queries.contains_key(&key) {
            error!(
                "event=query_register module=query status=error entity={} query={} error_code=configuration",
                meta.name, key.1
            );
            return Err(RepoError::Configuration(format!(
                "query `{}` is registered twice for `{}`",
                key.1, meta.name
            )));
        }
        self.queries.insert(key, descriptor);
        Ok(())
    }
}

fn log_registration(
    meta: &EntityMeta,
    name: &str,
    kind: &str,
    result: RepoResult<QueryDescriptor>,
) -> RepoResult<QueryDescriptor> {
    match &result {
        Ok(_) => info!(
            "event=query_register module=query status=ok entity={} query={name} kind={kind}",
            meta.name
        ),
        Err(err) => error!(
            "event=query_register module=query status=error entity={} query={name} kind={kind} error_code={}",
            meta.name,
            err.code()
        ),
    }
    result
}

fn resolve_declared(meta: &'static EntityMeta, query: &DeclaredQuery) -> RepoResult<QueryDescriptor> {
    let mut descriptor = match &query.dialect {
        Dialect::Logical(text) => {
            let mut descriptor = declared::logical(meta, &query.name, text)?;
            if let Some(count) = query.count.as_deref() {
                let count_descriptor = declared::logical(meta, &format!("{}#count", query.name), count)?;
                if !matches!(count_descriptor.projection(), Some(Projection::Count { .. })) {
                    return Err(RepoError::Configuration(format!(
                        "count query of `{}.{}` must select count(...)",
                        meta.name, query.name
                    )));
                }
                descriptor.count_query = Some(Box::new(count_descriptor));
            }
            descriptor
        }
        Dialect::Native(sql) => {
            let shape = query.shape.unwrap_or(ResultShape::List);
            declared::native(meta, &query.name, sql, query.count.as_deref(), shape)?
        }
    };
    if let Some(count) = descriptor.count_query.as_deref() {
        let extra: Vec<_> = count
            .parameters
            .iter()
            .filter(|param| !descriptor.parameters.contains(param))
            .cloned()
            .collect();
        descriptor.parameters.extend(extra);
    }
    if let Some(shape) = query.shape {
        descriptor.shape = shape;
    }
    descriptor.lock = query.lock;
    descriptor.validate()?;
    Ok(descriptor)
}

fn add_fetch(descriptor: &mut QueryDescriptor, relation_name: &str) -> RepoResult<()> {
    let relation = descriptor.entity.relation(relation_name).ok_or_else(|| {
        RepoError::UnresolvedField {
            entity: descriptor.entity.name,
            declaration: descriptor.name.clone(),
            token: relation_name.to_string(),
        }
    })?;
    match &mut descriptor.body {
        QueryBody::Select {
            joins,
            projection: Projection::Entity,
            ..
        } => {
            let index = Join::ensure(joins, 0, relation, JoinKind::Left);
            if let Some(join) = joins.get_mut(index - 1) {
                join.fetch = true;
            }
            Ok(())
        }
        _ => Err(RepoError::Configuration(format!(
            "query `{}`: only entity selections can fetch relations",
            descriptor.name
        ))),
    }
}

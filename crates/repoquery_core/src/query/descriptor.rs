//! Query descriptor: the intermediate form between declarations and SQL.
//!
//! # Responsibility
//! - Represent what to fetch or mutate independently of how it was declared
//!   (method name, logical text, native text, or built in code).
//! - Enforce descriptor-level invariants once, at construction.
//!
//! # Invariants
//! - A mutation never carries a projection, a page window or a lock mode.
//! - Values never appear in the tree as SQL text: literals and parameters
//!   are bound by the compiler.

use crate::error::{RepoError, RepoResult};
use crate::model::entity::{EntityMeta, RelationMeta};
use crate::model::value::Value;
use crate::query::page::{Direction, Sort};
use std::fmt::{Display, Formatter};

/// A column on one row source of the query: 0 is the root entity, `n` is the
/// target of the n-th join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRef {
    pub source: usize,
    pub column: &'static str,
}

impl ColumnRef {
    pub fn root(column: &'static str) -> Self {
        Self { source: 0, column }
    }
}

/// Placeholder reference: `:name` or `?N` (1-based).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamRef {
    Named(String),
    Positional(usize),
}

impl Display for ParamRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(name) => write!(f, ":{name}"),
            Self::Positional(index) => write!(f, "?{index}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// How a bound LIKE pattern is completed before binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeMode {
    /// Pattern used as given, wildcards included.
    Raw,
    StartsWith,
    EndsWith,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand<P = ColumnRef> {
    Column(P),
    Param(ParamRef),
    Literal(Value),
    Arith {
        left: Box<Operand<P>>,
        op: ArithOp,
        right: Box<Operand<P>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InList<P = ColumnRef> {
    /// One parameter bound to a list value, expanded at compile time.
    Param(ParamRef),
    Items(Vec<Operand<P>>),
}

/// Predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr<P = ColumnRef> {
    And(Vec<Expr<P>>),
    Or(Vec<Expr<P>>),
    Not(Box<Expr<P>>),
    Compare {
        left: Operand<P>,
        op: CompareOp,
        right: Operand<P>,
    },
    In {
        operand: Operand<P>,
        list: InList<P>,
        negated: bool,
    },
    IsNull {
        operand: Operand<P>,
        negated: bool,
    },
    Like {
        operand: Operand<P>,
        pattern: Operand<P>,
        mode: LikeMode,
        negated: bool,
    },
}

impl<P> Operand<P> {
    pub fn param(name: &str) -> Self {
        Self::Param(ParamRef::Named(name.to_string()))
    }

    pub(crate) fn collect_parameters(&self, out: &mut Vec<ParamRef>) {
        match self {
            Self::Param(param) => push_unique(out, param),
            Self::Arith { left, right, .. } => {
                left.collect_parameters(out);
                right.collect_parameters(out);
            }
            Self::Column(_) | Self::Literal(_) => {}
        }
    }

    pub(crate) fn try_map<Q, F>(self, f: &mut F) -> RepoResult<Operand<Q>>
    where
        F: FnMut(P) -> RepoResult<Q>,
    {
        Ok(match self {
            Self::Column(column) => Operand::Column(f(column)?),
            Self::Param(param) => Operand::Param(param),
            Self::Literal(value) => Operand::Literal(value),
            Self::Arith { left, op, right } => Operand::Arith {
                left: Box::new(left.try_map(f)?),
                op,
                right: Box::new(right.try_map(f)?),
            },
        })
    }
}

impl<P> Expr<P> {
    pub fn compare(left: Operand<P>, op: CompareOp, right: Operand<P>) -> Self {
        Self::Compare { left, op, right }
    }

    /// Placeholders in order of first appearance.
    pub fn parameters(&self) -> Vec<ParamRef> {
        let mut out = Vec::new();
        self.collect_parameters(&mut out);
        out
    }

    pub(crate) fn collect_parameters(&self, out: &mut Vec<ParamRef>) {
        match self {
            Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.collect_parameters(out);
                }
            }
            Self::Not(inner) => inner.collect_parameters(out),
            Self::Compare { left, right, .. } => {
                left.collect_parameters(out);
                right.collect_parameters(out);
            }
            Self::In { operand, list, .. } => {
                operand.collect_parameters(out);
                match list {
                    InList::Param(param) => push_unique(out, param),
                    InList::Items(items) => {
                        for item in items {
                            item.collect_parameters(out);
                        }
                    }
                }
            }
            Self::IsNull { operand, .. } => operand.collect_parameters(out),
            Self::Like {
                operand, pattern, ..
            } => {
                operand.collect_parameters(out);
                pattern.collect_parameters(out);
            }
        }
    }

    pub(crate) fn try_map<Q, F>(self, f: &mut F) -> RepoResult<Expr<Q>>
    where
        F: FnMut(P) -> RepoResult<Q>,
    {
        Ok(match self {
            Self::And(items) => Expr::And(
                items
                    .into_iter()
                    .map(|item| item.try_map(f))
                    .collect::<RepoResult<_>>()?,
            ),
            Self::Or(items) => Expr::Or(
                items
                    .into_iter()
                    .map(|item| item.try_map(f))
                    .collect::<RepoResult<_>>()?,
            ),
            Self::Not(inner) => Expr::Not(Box::new(inner.try_map(f)?)),
            Self::Compare { left, op, right } => Expr::Compare {
                left: left.try_map(f)?,
                op,
                right: right.try_map(f)?,
            },
            Self::In {
                operand,
                list,
                negated,
            } => Expr::In {
                operand: operand.try_map(f)?,
                list: match list {
                    InList::Param(param) => InList::Param(param),
                    InList::Items(items) => InList::Items(
                        items
                            .into_iter()
                            .map(|item| item.try_map(f))
                            .collect::<RepoResult<_>>()?,
                    ),
                },
                negated,
            },
            Self::IsNull { operand, negated } => Expr::IsNull {
                operand: operand.try_map(f)?,
                negated,
            },
            Self::Like {
                operand,
                pattern,
                mode,
                negated,
            } => Expr::Like {
                operand: operand.try_map(f)?,
                pattern: pattern.try_map(f)?,
                mode,
                negated,
            },
        })
    }
}

fn push_unique(out: &mut Vec<ParamRef>, param: &ParamRef) {
    if !out.contains(param) {
        out.push(param.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// Join along an owning many-to-one relation.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub relation: &'static RelationMeta,
    /// Row source the relation starts from.
    pub from: usize,
    pub kind: JoinKind,
    /// Materialize the target into the root entity in the same round trip.
    pub fetch: bool,
}

impl Join {
    /// Returns the row source for `relation` reached from `from`, appending a
    /// join when none exists yet.
    pub(crate) fn ensure(
        joins: &mut Vec<Join>,
        from: usize,
        relation: &'static RelationMeta,
        kind: JoinKind,
    ) -> usize {
        if let Some(position) = joins
            .iter()
            .position(|join| join.from == from && std::ptr::eq(join.relation, relation))
        {
            return position + 1;
        }
        joins.push(Join {
            relation,
            from,
            kind,
            fetch: false,
        });
        joins.len()
    }
}

/// Entity behind a row source index.
pub(crate) fn source_entity(
    root: &'static EntityMeta,
    joins: &[Join],
    source: usize,
) -> Option<&'static EntityMeta> {
    if source == 0 {
        return Some(root);
    }
    joins.get(source - 1).map(|join| join.relation.target)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub operand: Operand,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// The root entity, plus any fetch-joined relations.
    Entity,
    /// Labelled columns: scalar lists and closed views.
    Columns(Vec<SelectItem>),
    /// Positional DTO construction.
    Constructor {
        type_name: String,
        items: Vec<SelectItem>,
    },
    /// `None` counts root keys.
    Count {
        distinct: bool,
        operand: Option<Operand>,
    },
    Exists,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: &'static str,
    pub value: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryBody {
    Select {
        distinct: bool,
        joins: Vec<Join>,
        predicate: Option<Expr>,
        projection: Projection,
    },
    /// Joins of a mutation only feed the predicate; the statement itself
    /// touches the root table alone.
    Update {
        assignments: Vec<Assignment>,
        joins: Vec<Join>,
        predicate: Option<Expr>,
    },
    Delete {
        joins: Vec<Join>,
        predicate: Option<Expr>,
    },
    /// Opaque statement addressed at physical tables and columns.
    Native {
        sql: String,
        count_sql: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderTarget {
    Column(ColumnRef),
    /// Result label, used for native statements.
    Label(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub target: OrderTarget,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    /// Results are handed out but never flushed back.
    ReadOnly,
    PessimisticWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub offset: u64,
    pub limit: u32,
}

/// Declared return shape of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Exactly one row: zero is `NotFound`, more is `NotUnique`.
    One,
    /// Zero or one row: more is `NotUnique`.
    Optional,
    List,
    Page,
    Scalar,
    /// Affected-row count of a mutation.
    Affected,
}

impl ResultShape {
    pub fn name(self) -> &'static str {
        match self {
            Self::One => "a single row",
            Self::Optional => "an optional row",
            Self::List => "a list",
            Self::Page => "a page",
            Self::Scalar => "a scalar",
            Self::Affected => "an affected-row count",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    /// `Entity.queryName`, used in errors and log events.
    pub name: String,
    pub entity: &'static EntityMeta,
    pub body: QueryBody,
    pub sort: Vec<OrderItem>,
    /// Static row cap from `findFirstN` / `findTopN`.
    pub limit: Option<u32>,
    pub window: Option<PageWindow>,
    pub lock: LockMode,
    pub shape: ResultShape,
    /// Placeholders the body references, in order of first appearance.
    pub parameters: Vec<ParamRef>,
    pub count_query: Option<Box<QueryDescriptor>>,
}

impl QueryDescriptor {
    /// Plain select of the root entity without predicate.
    pub fn select_all(entity: &'static EntityMeta, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity,
            body: QueryBody::Select {
                distinct: false,
                joins: Vec::new(),
                predicate: None,
                projection: Projection::Entity,
            },
            sort: Vec::new(),
            limit: None,
            window: None,
            lock: LockMode::None,
            shape: ResultShape::List,
            parameters: Vec::new(),
            count_query: None,
        }
    }

    /// Set-based update built in code rather than parsed from text.
    pub fn bulk_update(
        entity: &'static EntityMeta,
        name: impl Into<String>,
        assignments: Vec<Assignment>,
        predicate: Option<Expr>,
    ) -> RepoResult<Self> {
        let mut parameters = Vec::new();
        for assignment in &assignments {
            assignment.value.collect_parameters(&mut parameters);
        }
        if let Some(predicate) = predicate.as_ref() {
            predicate.collect_parameters(&mut parameters);
        }
        let descriptor = Self {
            name: name.into(),
            entity,
            body: QueryBody::Update {
                assignments,
                joins: Vec::new(),
                predicate,
            },
            sort: Vec::new(),
            limit: None,
            window: None,
            lock: LockMode::None,
            shape: ResultShape::Affected,
            parameters,
            count_query: None,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// True for bulk update/delete, including native mutations.
    pub fn is_mutation(&self) -> bool {
        match self.body {
            QueryBody::Update { .. } | QueryBody::Delete { .. } => true,
            QueryBody::Native { .. } => self.shape == ResultShape::Affected,
            QueryBody::Select { .. } => false,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, QueryBody::Native { .. })
    }

    pub fn joins(&self) -> &[Join] {
        match &self.body {
            QueryBody::Select { joins, .. }
            | QueryBody::Update { joins, .. }
            | QueryBody::Delete { joins, .. } => joins,
            QueryBody::Native { .. } => &[],
        }
    }

    pub fn predicate(&self) -> Option<&Expr> {
        match &self.body {
            QueryBody::Select { predicate, .. }
            | QueryBody::Update { predicate, .. }
            | QueryBody::Delete { predicate, .. } => predicate.as_ref(),
            QueryBody::Native { .. } => None,
        }
    }

    pub fn projection(&self) -> Option<&Projection> {
        match &self.body {
            QueryBody::Select { projection, .. } => Some(projection),
            _ => None,
        }
    }

    /// Whether rows decode into the root entity.
    pub fn maps_entity(&self) -> bool {
        match &self.body {
            QueryBody::Select { projection, .. } => *projection == Projection::Entity,
            QueryBody::Native { .. } => {
                !self.is_mutation() && !matches!(self.shape, ResultShape::Scalar)
            }
            _ => false,
        }
    }

    /// Resolves `property` or `relation.property` against the root entity,
    /// adding a left join for relation paths.
    fn resolve_path(&mut self, path: &str) -> Option<ColumnRef> {
        let entity = self.entity;
        let joins = match &mut self.body {
            QueryBody::Select { joins, .. } => joins,
            _ => return None,
        };
        match path.split_once('.') {
            None => entity.property(path).map(|property| ColumnRef::root(property.column)),
            Some((relation, property)) => {
                let relation = entity.relation(relation)?;
                let column = relation.target.property(property)?.column;
                let source = Join::ensure(joins, 0, relation, JoinKind::Left);
                Some(ColumnRef { source, column })
            }
        }
    }

    /// Appends a caller-supplied sort after the declared one.
    ///
    /// # Errors
    /// - `UnresolvedField` for a property the entity does not have.
    /// - `Configuration` for a native label that cannot be quoted safely.
    pub(crate) fn apply_sort(&mut self, sort: &Sort) -> RepoResult<()> {
        for order in sort.orders() {
            let target = if self.is_native() {
                if !crate::engine::compile::is_valid_label(&order.property) {
                    return Err(RepoError::Configuration(format!(
                        "query `{}`: `{}` is not a sortable result label",
                        self.name, order.property
                    )));
                }
                OrderTarget::Label(order.property.clone())
            } else {
                let column = self.resolve_path(&order.property).ok_or_else(|| {
                    RepoError::UnresolvedField {
                        entity: self.entity.name,
                        declaration: self.name.clone(),
                        token: order.property.clone(),
                    }
                })?;
                OrderTarget::Column(column)
            };
            self.sort.push(OrderItem {
                target,
                direction: order.direction,
            });
        }
        Ok(())
    }

    /// Narrows an entity select to the labelled columns named by `paths`.
    /// The predicate, sort and window stay as declared.
    pub(crate) fn into_view(mut self, paths: &[&str]) -> RepoResult<Self> {
        if !self.maps_entity() || self.is_native() {
            return Err(RepoError::Configuration(format!(
                "query `{}` does not select entities and cannot be viewed",
                self.name
            )));
        }
        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let column = self
                .resolve_path(path)
                .ok_or_else(|| RepoError::UnresolvedField {
                    entity: self.entity.name,
                    declaration: self.name.clone(),
                    token: path.to_string(),
                })?;
            items.push(SelectItem {
                operand: Operand::Column(column),
                label: path.to_string(),
            });
        }
        if let QueryBody::Select { projection, .. } = &mut self.body {
            *projection = Projection::Columns(items);
        }
        if self.lock == LockMode::ReadOnly {
            self.lock = LockMode::None;
        }
        Ok(self)
    }

    /// Checks the structural invariants. Called by every constructor and by
    /// registration.
    pub fn validate(&self) -> RepoResult<()> {
        let fail = |message: &str| {
            Err(RepoError::Configuration(format!(
                "query `{}`: {message}",
                self.name
            )))
        };

        if self.is_mutation() {
            if self.shape != ResultShape::Affected {
                return fail("a mutation must return an affected-row count");
            }
            if self.window.is_some() || self.limit.is_some() {
                return fail("a mutation cannot carry a page window or row limit");
            }
            if self.lock != LockMode::None {
                return fail("a mutation cannot carry a lock mode or read-only hint");
            }
            if self.count_query.is_some() {
                return fail("a mutation cannot declare a count query");
            }
        } else if self.shape == ResultShape::Affected {
            return fail("only mutations return an affected-row count");
        }

        if self.is_native() && self.lock == LockMode::PessimisticWrite {
            return fail("pessimistic locking needs a logical query");
        }

        if let Some(Projection::Count { .. } | Projection::Exists) = self.projection() {
            if self.shape != ResultShape::Scalar {
                return fail("count and exists projections return a scalar");
            }
        }
        if self.shape == ResultShape::Scalar && !self.is_native() {
            match self.projection() {
                Some(Projection::Count { .. } | Projection::Exists | Projection::Columns(_)) => {}
                _ => return fail("a scalar result needs a count, exists or column projection"),
            }
        }

        if let Some(count) = self.count_query.as_ref() {
            if count.shape != ResultShape::Scalar {
                return fail("a count query must return a scalar");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Assignment, CompareOp, Expr, LockMode, Operand, ParamRef, QueryDescriptor, ResultShape,
    };
    use crate::model::member::MEMBER_META;

    #[test]
    fn parameters_are_collected_once_in_order() {
        let expr: Expr = Expr::And(vec![
            Expr::compare(
                Operand::Column(super::ColumnRef::root("username")),
                CompareOp::Eq,
                Operand::param("username"),
            ),
            Expr::compare(
                Operand::param("age"),
                CompareOp::Lt,
                Operand::param("username"),
            ),
        ]);
        assert_eq!(
            expr.parameters(),
            vec![
                ParamRef::Named("username".to_string()),
                ParamRef::Named("age".to_string())
            ]
        );
    }

    #[test]
    fn mutation_rejects_lock_and_window() {
        let mut descriptor = QueryDescriptor::bulk_update(
            &MEMBER_META,
            "Member.touch",
            vec![Assignment {
                column: "age",
                value: Operand::param("age"),
            }],
            None,
        )
        .unwrap();
        assert!(descriptor.is_mutation());

        descriptor.lock = LockMode::PessimisticWrite;
        assert!(descriptor.validate().is_err());

        descriptor.lock = LockMode::None;
        descriptor.shape = ResultShape::List;
        assert!(descriptor.validate().is_err());
    }
}

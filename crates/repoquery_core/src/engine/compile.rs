//! Descriptor to SQL compilation.
//!
//! # Responsibility
//! - Emit SQLite statements for logical descriptors and wrap native ones for
//!   paging, sorting and counting.
//! - Collect bound values in placeholder order.
//!
//! # Invariants
//! - Every value reaches SQL through a placeholder. Statement text only ever
//!   contains identifiers from entity metadata, validated native labels and
//!   fixed keywords.
//! - Row sources are aliased `t0` (root) and `t1..tn` (joins); key
//!   subqueries of mutations use `s0..sn`.

use crate::error::{RepoError, RepoResult};
use crate::model::entity::EntityMeta;
use crate::model::value::Value;
use crate::query::args::Args;
use crate::query::descriptor::{
    source_entity, ArithOp, Assignment, ColumnRef, CompareOp, Expr, InList, Join, JoinKind,
    LikeMode, Operand, OrderItem, OrderTarget, PageWindow, ParamRef, Projection, QueryBody,
    QueryDescriptor,
};
use std::fmt::Write as _;

/// How values attach to the placeholders of a compiled statement.
#[derive(Debug)]
pub(crate) enum Binding<'a> {
    /// Anonymous `?` placeholders, in order.
    Ordered(Vec<Value>),
    /// Native text: resolved per placeholder name, with engine-owned extras.
    ByName {
        args: &'a Args,
        extra: Vec<(&'static str, Value)>,
    },
}

#[derive(Debug)]
pub(crate) struct Compiled<'a> {
    pub sql: String,
    pub binding: Binding<'a>,
}

const NATIVE_LIMIT: &str = "__limit";
const NATIVE_OFFSET: &str = "__offset";

/// Compiles the main statement of `descriptor`.
pub(crate) fn compile<'a>(descriptor: &QueryDescriptor, args: &'a Args) -> RepoResult<Compiled<'a>> {
    match &descriptor.body {
        QueryBody::Select {
            distinct,
            joins,
            predicate,
            projection,
        } => {
            let mut emitter = Emitter::new(descriptor, joins, args, "t");
            emitter.select(*distinct, projection, predicate.as_ref())?;
            Ok(emitter.finish())
        }
        QueryBody::Update {
            assignments,
            joins,
            predicate,
        } => {
            let mut emitter = Emitter::new(descriptor, joins, args, "t");
            emitter.update(assignments, predicate.as_ref())?;
            Ok(emitter.finish())
        }
        QueryBody::Delete { joins, predicate } => {
            let mut emitter = Emitter::new(descriptor, joins, args, "t");
            let table = descriptor.entity.table;
            write!(emitter.sql, "DELETE FROM {table} AS t0").ok();
            emitter.mutation_filter(predicate.as_ref())?;
            Ok(emitter.finish())
        }
        QueryBody::Native { sql, .. } => native(descriptor, sql, args),
    }
}

/// Compiles the count statement used for paging: the declared count query
/// when present, otherwise the main query reduced to a count of distinct
/// root keys with sort and window dropped.
pub(crate) fn compile_count<'a>(
    descriptor: &QueryDescriptor,
    args: &'a Args,
) -> RepoResult<Compiled<'a>> {
    if let Some(count) = descriptor.count_query.as_deref() {
        return compile(count, args);
    }
    match &descriptor.body {
        QueryBody::Select {
            joins, predicate, ..
        } => {
            let mut emitter = Emitter::new(descriptor, joins, args, "t");
            let id = descriptor.entity.id_column;
            emitter.sql.push_str("SELECT COUNT(DISTINCT t0.");
            emitter.sql.push_str(id);
            emitter.sql.push(')');
            emitter.from_clause(predicate.as_ref())?;
            Ok(emitter.finish())
        }
        QueryBody::Native { sql, count_sql } => {
            let sql = match count_sql {
                Some(count_sql) => count_sql.clone(),
                None => format!("SELECT COUNT(*) FROM ({sql}) AS native_count"),
            };
            Ok(Compiled {
                sql,
                binding: Binding::ByName {
                    args,
                    extra: Vec::new(),
                },
            })
        }
        _ => Err(RepoError::Configuration(format!(
            "query `{}` cannot be counted",
            descriptor.name
        ))),
    }
}

/// No-op write on the rows a locking select reads. Executed inside an open
/// transaction it takes the store's write lock until commit or rollback.
pub(crate) fn compile_lock<'a>(descriptor: &QueryDescriptor, args: &'a Args) -> RepoResult<Compiled<'a>> {
    let (joins, predicate) = match &descriptor.body {
        QueryBody::Select {
            joins, predicate, ..
        } => (joins.as_slice(), predicate.as_ref()),
        _ => {
            return Err(RepoError::Configuration(format!(
                "query `{}` cannot take a row lock",
                descriptor.name
            )))
        }
    };
    let mut emitter = Emitter::new(descriptor, joins, args, "s");
    let table = descriptor.entity.table;
    let id = descriptor.entity.id_column;
    write!(emitter.sql, "UPDATE {table} SET {id} = {id} WHERE {id} IN (").ok();
    emitter.key_subquery(predicate)?;
    emitter.sql.push(')');
    Ok(emitter.finish())
}

fn native<'a>(descriptor: &QueryDescriptor, sql: &str, args: &'a Args) -> RepoResult<Compiled<'a>> {
    if descriptor.sort.is_empty() && descriptor.window.is_none() && descriptor.limit.is_none() {
        return Ok(Compiled {
            sql: sql.to_string(),
            binding: Binding::ByName {
                args,
                extra: Vec::new(),
            },
        });
    }
    let mut wrapped = format!("SELECT * FROM ({sql}) AS native");
    let mut first = true;
    for item in &descriptor.sort {
        let OrderTarget::Label(label) = &item.target else {
            return Err(RepoError::Configuration(format!(
                "query `{}`: native statements sort by result label",
                descriptor.name
            )));
        };
        wrapped.push_str(if first { " ORDER BY " } else { ", " });
        first = false;
        write!(wrapped, "\"{label}\" {}", item.direction.as_sql()).ok();
    }
    let mut extra = Vec::new();
    if let Some((limit, offset)) = effective_window(descriptor.window, descriptor.limit) {
        write!(wrapped, " LIMIT :{NATIVE_LIMIT} OFFSET :{NATIVE_OFFSET}").ok();
        extra.push((NATIVE_LIMIT, Value::from(limit)));
        extra.push((NATIVE_OFFSET, Value::from(offset)));
    }
    Ok(Compiled {
        sql: wrapped,
        binding: Binding::ByName { args, extra },
    })
}

/// Combines a page window with a static row cap into `(limit, offset)`.
fn effective_window(window: Option<PageWindow>, cap: Option<u32>) -> Option<(i64, i64)> {
    match (window, cap) {
        (None, None) => None,
        (None, Some(cap)) => Some((i64::from(cap), 0)),
        (Some(window), None) => Some((i64::from(window.limit), offset_i64(window.offset))),
        (Some(window), Some(cap)) => {
            let remaining = u64::from(cap).saturating_sub(window.offset);
            let limit = remaining.min(u64::from(window.limit));
            Some((offset_i64(limit), offset_i64(window.offset)))
        }
    }
}

fn offset_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Whether `label` can be quoted as a native result column.
pub(crate) fn is_valid_label(label: &str) -> bool {
    let mut chars = label.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
}

struct Emitter<'d, 'a> {
    descriptor: &'d QueryDescriptor,
    joins: &'d [Join],
    args: &'a Args,
    prefix: &'static str,
    sql: String,
    values: Vec<Value>,
}

impl<'d, 'a> Emitter<'d, 'a> {
    fn new(
        descriptor: &'d QueryDescriptor,
        joins: &'d [Join],
        args: &'a Args,
        prefix: &'static str,
    ) -> Self {
        Self {
            descriptor,
            joins,
            args,
            prefix,
            sql: String::with_capacity(256),
            values: Vec::new(),
        }
    }

    fn finish(self) -> Compiled<'a> {
        Compiled {
            sql: self.sql,
            binding: Binding::Ordered(self.values),
        }
    }

    fn entity(&self, source: usize) -> RepoResult<&'static EntityMeta> {
        source_entity(self.descriptor.entity, self.joins, source).ok_or_else(|| {
            RepoError::Configuration(format!(
                "query `{}` references unknown row source {source}",
                self.descriptor.name
            ))
        })
    }

    fn bind(&mut self, value: Value) {
        self.sql.push('?');
        self.values.push(value);
    }

    fn column(&mut self, column: ColumnRef) {
        write!(self.sql, "{}{}.{}", self.prefix, column.source, column.column).ok();
    }

    fn argument(&self, param: &ParamRef) -> RepoResult<Value> {
        self.args
            .require(&self.descriptor.name, param)
            .map(Clone::clone)
    }

    fn scalar_argument(&self, param: &ParamRef) -> RepoResult<Value> {
        let value = self.argument(param)?;
        if matches!(value, Value::List(_)) {
            return Err(RepoError::Configuration(format!(
                "query `{}`: collection argument {param} is only valid with `in`",
                self.descriptor.name
            )));
        }
        Ok(value)
    }

    fn operand(&mut self, operand: &Operand) -> RepoResult<()> {
        match operand {
            Operand::Column(column) => self.column(*column),
            Operand::Param(param) => {
                let value = self.scalar_argument(param)?;
                self.bind(value);
            }
            Operand::Literal(value) => self.bind(value.clone()),
            Operand::Arith { left, op, right } => {
                self.sql.push('(');
                self.operand(left)?;
                self.sql.push_str(match op {
                    ArithOp::Add => " + ",
                    ArithOp::Sub => " - ",
                    ArithOp::Mul => " * ",
                    ArithOp::Div => " / ",
                });
                self.operand(right)?;
                self.sql.push(')');
            }
        }
        Ok(())
    }

    /// Binds one IN element; collection arguments expand per element.
    fn in_element(&mut self, operand: &Operand, first: &mut bool) -> RepoResult<()> {
        let mut separator = |sql: &mut String| {
            if !*first {
                sql.push_str(", ");
            }
            *first = false;
        };
        match operand {
            Operand::Param(param) => match self.argument(param)? {
                Value::List(items) => {
                    for item in items {
                        separator(&mut self.sql);
                        self.bind(item);
                    }
                }
                value => {
                    separator(&mut self.sql);
                    self.bind(value);
                }
            },
            other => {
                separator(&mut self.sql);
                self.operand(other)?;
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> RepoResult<()> {
        match expr {
            Expr::And(items) | Expr::Or(items) => {
                if items.is_empty() {
                    self.sql.push_str(if matches!(expr, Expr::And(_)) { "1" } else { "0" });
                    return Ok(());
                }
                let connective = if matches!(expr, Expr::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                self.sql.push('(');
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        self.sql.push_str(connective);
                    }
                    self.expr(item)?;
                }
                self.sql.push(')');
            }
            Expr::Not(inner) => {
                self.sql.push_str("NOT (");
                self.expr(inner)?;
                self.sql.push(')');
            }
            Expr::Compare { left, op, right } => {
                // `= null` never matches in SQL; equality with a null argument
                // means a null check.
                if let (Operand::Param(param), CompareOp::Eq | CompareOp::Ne) = (right, op) {
                    if self.argument(param)?.is_null() {
                        self.operand(left)?;
                        self.sql.push_str(if *op == CompareOp::Eq {
                            " IS NULL"
                        } else {
                            " IS NOT NULL"
                        });
                        return Ok(());
                    }
                }
                self.operand(left)?;
                self.sql.push_str(match op {
                    CompareOp::Eq => " = ",
                    CompareOp::Ne => " <> ",
                    CompareOp::Gt => " > ",
                    CompareOp::Ge => " >= ",
                    CompareOp::Lt => " < ",
                    CompareOp::Le => " <= ",
                });
                self.operand(right)?;
            }
            Expr::In {
                operand,
                list,
                negated,
            } => {
                self.operand(operand)?;
                self.sql.push_str(if *negated { " NOT IN (" } else { " IN (" });
                let mut first = true;
                match list {
                    InList::Param(param) => {
                        self.in_element(&Operand::Param(param.clone()), &mut first)?
                    }
                    InList::Items(items) => {
                        for item in items {
                            self.in_element(item, &mut first)?;
                        }
                    }
                }
                self.sql.push(')');
            }
            Expr::IsNull { operand, negated } => {
                self.operand(operand)?;
                self.sql
                    .push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Expr::Like {
                operand,
                pattern,
                mode,
                negated,
            } => {
                self.operand(operand)?;
                self.sql
                    .push_str(if *negated { " NOT LIKE " } else { " LIKE " });
                if *mode == LikeMode::Raw {
                    self.operand(pattern)?;
                    return Ok(());
                }
                let raw = match pattern {
                    Operand::Param(param) => self.scalar_argument(param)?,
                    Operand::Literal(value) => value.clone(),
                    _ => {
                        return Err(RepoError::Configuration(format!(
                            "query `{}`: pattern matching needs a text argument",
                            self.descriptor.name
                        )))
                    }
                };
                let text = match raw {
                    Value::Text(text) => text,
                    Value::Integer(value) => value.to_string(),
                    other => {
                        return Err(RepoError::InvalidData(format!(
                            "pattern argument of `{}` must be text, found {}",
                            self.descriptor.name,
                            other.kind()
                        )))
                    }
                };
                let escaped = escape_like(&text);
                let pattern = match mode {
                    LikeMode::StartsWith => format!("{escaped}%"),
                    LikeMode::EndsWith => format!("%{escaped}"),
                    LikeMode::Contains => format!("%{escaped}%"),
                    LikeMode::Raw => escaped,
                };
                self.bind(Value::Text(pattern));
                self.sql.push_str(" ESCAPE '\\'");
            }
        }
        Ok(())
    }

    fn join_clauses(&mut self) -> RepoResult<()> {
        let joins = self.joins;
        for (index, join) in joins.iter().enumerate() {
            let source = index + 1;
            // Sources are appended in dependency order.
            if join.from >= source {
                return Err(RepoError::Configuration(format!(
                    "query `{}` joins from a later row source",
                    self.descriptor.name
                )));
            }
            let target = join.relation.target;
            self.sql.push_str(match join.kind {
                JoinKind::Inner => " INNER JOIN ",
                JoinKind::Left => " LEFT JOIN ",
            });
            let prefix = self.prefix;
            write!(
                self.sql,
                "{} AS {prefix}{source} ON {prefix}{source}.{} = {prefix}{}.{}",
                target.table, target.id_column, join.from, join.relation.column
            )
            .ok();
        }
        Ok(())
    }

    /// `FROM ... JOIN ... WHERE ...` shared by selects and counts.
    fn from_clause(&mut self, predicate: Option<&Expr>) -> RepoResult<()> {
        let table = self.descriptor.entity.table;
        write!(self.sql, " FROM {table} AS {}0", self.prefix).ok();
        self.join_clauses()?;
        if let Some(predicate) = predicate {
            self.sql.push_str(" WHERE ");
            self.expr(predicate)?;
        }
        Ok(())
    }

    fn select_item(&mut self, operand: &Operand, label: &str) -> RepoResult<()> {
        self.operand(operand)?;
        write!(self.sql, " AS \"{}\"", label.replace('"', "")).ok();
        Ok(())
    }

    fn entity_columns(
        &mut self,
        source: usize,
        label_prefix: Option<&str>,
        leading: bool,
    ) -> RepoResult<()> {
        let entity = self.entity(source)?;
        for (index, column) in entity.select_columns().into_iter().enumerate() {
            if index > 0 || leading {
                self.sql.push_str(", ");
            }
            match label_prefix {
                Some(prefix) => write!(
                    self.sql,
                    "{}{source}.{column} AS \"{prefix}.{column}\"",
                    self.prefix
                ),
                None => write!(self.sql, "{}{source}.{column} AS \"{column}\"", self.prefix),
            }
            .ok();
        }
        Ok(())
    }

    fn select(
        &mut self,
        distinct: bool,
        projection: &Projection,
        predicate: Option<&Expr>,
    ) -> RepoResult<()> {
        if *projection == Projection::Exists {
            self.sql.push_str("SELECT EXISTS(SELECT 1");
            self.from_clause(predicate)?;
            self.sql.push_str(") AS \"exists\"");
            return Ok(());
        }

        self.sql
            .push_str(if distinct { "SELECT DISTINCT " } else { "SELECT " });
        match projection {
            Projection::Entity => {
                self.entity_columns(0, None, false)?;
                let joins = self.joins;
                for (index, join) in joins.iter().enumerate() {
                    if join.fetch && join.from == 0 {
                        self.entity_columns(index + 1, Some(join.relation.name), true)?;
                    }
                }
            }
            Projection::Columns(items) | Projection::Constructor { items, .. } => {
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        self.sql.push_str(", ");
                    }
                    self.select_item(&item.operand, &item.label)?;
                }
            }
            Projection::Count {
                distinct: count_distinct,
                operand,
            } => {
                match operand {
                    Some(operand) => {
                        self.sql.push_str(if *count_distinct {
                            "COUNT(DISTINCT "
                        } else {
                            "COUNT("
                        });
                        self.operand(operand)?;
                        self.sql.push(')');
                    }
                    None if *count_distinct || !self.joins.is_empty() => {
                        write!(
                            self.sql,
                            "COUNT(DISTINCT {}0.{})",
                            self.prefix, self.descriptor.entity.id_column
                        )
                        .ok();
                    }
                    None => self.sql.push_str("COUNT(*)"),
                }
                self.sql.push_str(" AS \"count\"");
            }
            Projection::Exists => {}
        }

        self.from_clause(predicate)?;

        if !matches!(projection, Projection::Count { .. }) {
            let descriptor = self.descriptor;
            self.order_by(&descriptor.sort)?;
            if let Some((limit, offset)) =
                effective_window(self.descriptor.window, self.descriptor.limit)
            {
                self.sql.push_str(" LIMIT ");
                self.bind(Value::Integer(limit));
                self.sql.push_str(" OFFSET ");
                self.bind(Value::Integer(offset));
            }
        }
        Ok(())
    }

    fn order_by(&mut self, sort: &[OrderItem]) -> RepoResult<()> {
        for (index, item) in sort.iter().enumerate() {
            self.sql
                .push_str(if index == 0 { " ORDER BY " } else { ", " });
            match &item.target {
                OrderTarget::Column(column) => self.column(*column),
                OrderTarget::Label(label) => {
                    write!(self.sql, "\"{}\"", label.replace('"', "")).ok();
                }
            }
            self.sql.push(' ');
            self.sql.push_str(item.direction.as_sql());
        }
        Ok(())
    }

    fn update(&mut self, assignments: &[Assignment], predicate: Option<&Expr>) -> RepoResult<()> {
        let table = self.descriptor.entity.table;
        write!(self.sql, "UPDATE {table} AS t0 SET ").ok();
        for (index, assignment) in assignments.iter().enumerate() {
            if index > 0 {
                self.sql.push_str(", ");
            }
            if references_join(&assignment.value) {
                return Err(RepoError::Configuration(format!(
                    "query `{}`: assignments can only read the updated entity",
                    self.descriptor.name
                )));
            }
            self.sql.push_str(assignment.column);
            self.sql.push_str(" = ");
            self.operand(&assignment.value)?;
        }
        self.mutation_filter(predicate)
    }

    /// `WHERE` of an update or delete. Predicates over joined sources go
    /// through a key subquery since SQLite mutations cannot join.
    fn mutation_filter(&mut self, predicate: Option<&Expr>) -> RepoResult<()> {
        if self.joins.is_empty() {
            if let Some(predicate) = predicate {
                self.sql.push_str(" WHERE ");
                self.expr(predicate)?;
            }
            return Ok(());
        }
        let id = self.descriptor.entity.id_column;
        write!(self.sql, " WHERE t0.{id} IN (").ok();
        let outer = self.prefix;
        self.prefix = "s";
        self.key_subquery(predicate)?;
        self.prefix = outer;
        self.sql.push(')');
        Ok(())
    }

    fn key_subquery(&mut self, predicate: Option<&Expr>) -> RepoResult<()> {
        let id = self.descriptor.entity.id_column;
        write!(self.sql, "SELECT {}0.{id}", self.prefix).ok();
        self.from_clause(predicate)
    }
}

fn references_join(operand: &Operand) -> bool {
    match operand {
        Operand::Column(column) => column.source != 0,
        Operand::Arith { left, right, .. } => references_join(left) || references_join(right),
        Operand::Param(_) | Operand::Literal(_) => false,
    }
}

/// Escapes LIKE wildcards with `\`.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::{compile, compile_count, compile_lock, escape_like, Binding};
    use crate::model::member::MEMBER_META;
    use crate::model::value::Value;
    use crate::query::args::Args;
    use crate::query::declared::{logical, native};
    use crate::query::derive::derive;
    use crate::query::descriptor::{PageWindow, ResultShape};

    fn ordered(binding: &Binding<'_>) -> Vec<Value> {
        match binding {
            Binding::Ordered(values) => values.clone(),
            other => panic!("unexpected binding: {other:?}"),
        }
    }

    #[test]
    fn derived_select_binds_every_value() {
        let descriptor = derive(&MEMBER_META, "findByUsernameAndAgeGreaterThan").unwrap();
        let args = Args::positional([Value::from("x' OR 1=1 --"), Value::from(15)]);
        let compiled = compile(&descriptor, &args).unwrap();
        assert!(compiled
            .sql
            .ends_with("FROM member AS t0 WHERE (t0.username = ? AND t0.age > ?)"));
        assert!(!compiled.sql.contains("OR 1=1"));
        assert_eq!(
            ordered(&compiled.binding),
            vec![Value::from("x' OR 1=1 --"), Value::from(15)]
        );
    }

    #[test]
    fn collection_arguments_expand() {
        let descriptor = logical(
            &MEMBER_META,
            "byNames",
            "select m from Member m where m.username in :names",
        )
        .unwrap();
        let args = Args::new().bind("names", vec!["a", "b", "c"]);
        let compiled = compile(&descriptor, &args).unwrap();
        assert!(compiled.sql.contains("t0.username IN (?, ?, ?)"));
        assert_eq!(ordered(&compiled.binding).len(), 3);
    }

    #[test]
    fn like_patterns_are_escaped_at_bind_time() {
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
        let descriptor = derive(&MEMBER_META, "findByUsernameStartingWith").unwrap();
        let args = Args::positional(["mem_"]);
        let compiled = compile(&descriptor, &args).unwrap();
        assert!(compiled.sql.contains("t0.username LIKE ? ESCAPE '\\'"));
        assert_eq!(ordered(&compiled.binding), vec![Value::from("mem\\_%")]);
    }

    #[test]
    fn count_uses_distinct_root_keys_without_order() {
        let mut descriptor = logical(
            &MEMBER_META,
            "withTeam",
            "select m from Member m left join m.team t where t.name = :name order by m.username",
        )
        .unwrap();
        descriptor.window = Some(PageWindow {
            offset: 3,
            limit: 3,
        });
        let args = Args::new().bind("name", "teamA");
        let count = compile_count(&descriptor, &args).unwrap();
        assert!(count.sql.starts_with("SELECT COUNT(DISTINCT t0.member_id) FROM member AS t0"));
        assert!(!count.sql.contains("ORDER BY"));
        assert!(!count.sql.contains("LIMIT"));

        let page = compile(&descriptor, &args).unwrap();
        assert!(page.sql.ends_with("ORDER BY t0.username ASC LIMIT ? OFFSET ?"));
        assert_eq!(
            ordered(&page.binding),
            vec![Value::from("teamA"), Value::from(3), Value::from(3)]
        );
    }

    #[test]
    fn fetch_join_labels_target_columns() {
        let mut descriptor = derive(&MEMBER_META, "findAll").unwrap();
        if let crate::query::descriptor::QueryBody::Select { joins, .. } = &mut descriptor.body {
            crate::query::descriptor::Join::ensure(
                joins,
                0,
                &MEMBER_META.relations[0],
                crate::query::descriptor::JoinKind::Left,
            );
            joins[0].fetch = true;
        }
        let args = Args::new();
        let compiled = compile(&descriptor, &args).unwrap();
        assert!(compiled.sql.contains("t1.team_name AS \"team.team_name\""));
        assert!(compiled
            .sql
            .contains("LEFT JOIN team AS t1 ON t1.team_id = t0.team_id"));
    }

    #[test]
    fn bulk_update_and_joined_delete() {
        let update = logical(
            &MEMBER_META,
            "bulkAgePlus",
            "update Member m set m.age = m.age + 1 where m.age >= :age",
        )
        .unwrap();
        let args = Args::new().bind("age", 20);
        let compiled = compile(&update, &args).unwrap();
        assert_eq!(
            compiled.sql,
            "UPDATE member AS t0 SET age = (t0.age + ?) WHERE t0.age >= ?"
        );

        let delete = derive(&MEMBER_META, "deleteByTeamName").unwrap();
        let args = Args::positional(["teamA"]);
        let compiled = compile(&delete, &args).unwrap();
        assert!(compiled.sql.starts_with(
            "DELETE FROM member AS t0 WHERE t0.member_id IN (SELECT s0.member_id FROM member AS s0 LEFT JOIN team AS s1"
        ));
    }

    #[test]
    fn lock_touch_reuses_the_predicate() {
        let descriptor = derive(&MEMBER_META, "findLockByUsername").unwrap();
        let args = Args::positional(["member1"]);
        let compiled = compile_lock(&descriptor, &args).unwrap();
        assert_eq!(
            compiled.sql,
            "UPDATE member SET member_id = member_id WHERE member_id IN (SELECT s0.member_id FROM member AS s0 WHERE s0.username = ?)"
        );
    }

    #[test]
    fn null_equality_becomes_null_check() {
        let descriptor = derive(&MEMBER_META, "findByTeam").unwrap();
        let args = Args::positional([Value::Null]);
        let compiled = compile(&descriptor, &args).unwrap();
        assert!(compiled.sql.ends_with("WHERE t0.team_id IS NULL"));
        assert!(ordered(&compiled.binding).is_empty());
    }

    #[test]
    fn native_paging_wraps_the_statement() {
        let mut descriptor = native(
            &MEMBER_META,
            "nativeAll",
            "select * from member",
            None,
            ResultShape::Page,
        )
        .unwrap();
        descriptor.window = Some(PageWindow {
            offset: 0,
            limit: 10,
        });
        let args = Args::new();
        let compiled = compile(&descriptor, &args).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT * FROM (select * from member) AS native LIMIT :__limit OFFSET :__offset"
        );
        let count = compile_count(&descriptor, &args).unwrap();
        assert_eq!(
            count.sql,
            "SELECT COUNT(*) FROM (select * from member) AS native_count"
        );
    }
}

//! Declared-query resolver.
//!
//! # Responsibility
//! - Parse logical query text (entity names, aliases, property paths) into a
//!   `QueryDescriptor`.
//! - Scan native statements for their placeholders so argument checks work
//!   the same way for both dialects.
//!
//! # Invariants
//! - Malformed text fails with `Syntax` carrying the byte offset; unknown
//!   aliases or properties fail with `UnresolvedField`.
//! - Literals in query text are kept as values and bound by the compiler,
//!   never spliced back into SQL.

use crate::error::{RepoError, RepoResult};
use crate::model::entity::{EntityMeta, PropertyKind};
use crate::model::value::Value;
use crate::query::descriptor::{
    source_entity, ArithOp, Assignment, ColumnRef, CompareOp, Expr, InList, Join, JoinKind,
    LikeMode, LockMode, Operand, OrderItem, OrderTarget, ParamRef, Projection, QueryBody,
    QueryDescriptor, ResultShape, SelectItem,
};
use crate::query::lexer::{syntax, tokenize, Tok, Token};
use crate::query::page::Direction;

const RESERVED: &[&str] = &[
    "select", "from", "where", "and", "or", "not", "in", "is", "null", "like", "join", "left",
    "inner", "outer", "fetch", "order", "by", "asc", "desc", "set", "update", "delete", "new",
    "distinct", "count", "as", "between", "true", "false",
];

/// Dotted property path as written, e.g. `m.team.name`.
#[derive(Debug, Clone, PartialEq)]
struct RawPath {
    segments: Vec<String>,
    offset: usize,
}

impl RawPath {
    fn text(&self) -> String {
        self.segments.join(".")
    }
}

#[derive(Debug)]
struct FromClause {
    entity: String,
    alias: String,
    offset: usize,
}

#[derive(Debug)]
struct RawJoin {
    kind: JoinKind,
    fetch: bool,
    path: RawPath,
    alias: String,
}

#[derive(Debug)]
enum Selection {
    Items(Vec<(Operand<RawPath>, Option<String>)>),
    Constructor {
        type_name: String,
        items: Vec<Operand<RawPath>>,
    },
    Count {
        distinct: bool,
        operand: Operand<RawPath>,
    },
}

#[derive(Debug)]
enum Statement {
    Select {
        distinct: bool,
        selection: Selection,
        from: FromClause,
        joins: Vec<RawJoin>,
        predicate: Option<Expr<RawPath>>,
        order: Vec<(RawPath, Direction)>,
    },
    Update {
        from: FromClause,
        assignments: Vec<(RawPath, Operand<RawPath>)>,
        predicate: Option<Expr<RawPath>>,
    },
    Delete {
        from: FromClause,
        predicate: Option<Expr<RawPath>>,
    },
}

struct Parser<'a> {
    declaration: &'a str,
    tokens: Vec<Token>,
    position: usize,
    end: usize,
}

impl<'a> Parser<'a> {
    fn new(declaration: &'a str, text: &str) -> RepoResult<Self> {
        Ok(Self {
            declaration,
            tokens: tokenize(declaration, text)?,
            position: 0,
            end: text.len(),
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.position + ahead)
    }

    fn offset(&self) -> usize {
        self.peek().map_or(self.end, |token| token.offset)
    }

    fn error(&self, message: impl Into<String>) -> RepoError {
        syntax(self.declaration, self.offset(), message)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|token| token.is_keyword(keyword))
    }

    fn at_symbol(&self, symbol: &str) -> bool {
        self.peek().is_some_and(|token| token.is_symbol(symbol))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.at_keyword(keyword);
        if found {
            self.position += 1;
        }
        found
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        let found = self.at_symbol(symbol);
        if found {
            self.position += 1;
        }
        found
    }

    fn expect_keyword(&mut self, keyword: &str) -> RepoResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{keyword}`")))
        }
    }

    fn expect_symbol(&mut self, symbol: &str) -> RepoResult<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{symbol}`")))
        }
    }

    /// A non-reserved identifier.
    fn identifier(&mut self, what: &str) -> RepoResult<String> {
        match self.peek() {
            Some(Token {
                tok: Tok::Ident(ident),
                ..
            }) if !is_reserved(ident) => {
                let ident = ident.clone();
                self.position += 1;
                Ok(ident)
            }
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    fn path(&mut self) -> RepoResult<RawPath> {
        let offset = self.offset();
        let mut segments = vec![self.identifier("alias or property path")?];
        while self.eat_symbol(".") {
            segments.push(self.identifier("property name")?);
        }
        Ok(RawPath { segments, offset })
    }

    fn statement(&mut self) -> RepoResult<Statement> {
        let statement = if self.eat_keyword("select") {
            self.select()?
        } else if self.eat_keyword("update") {
            self.update()?
        } else if self.eat_keyword("delete") {
            self.delete()?
        } else {
            return Err(self.error("expected `select`, `update` or `delete`"));
        };
        if self.peek().is_some() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(statement)
    }

    fn from_clause(&mut self) -> RepoResult<FromClause> {
        let offset = self.offset();
        let entity = self.identifier("entity name")?;
        self.eat_keyword("as");
        let alias = self.identifier("entity alias")?;
        Ok(FromClause {
            entity,
            alias,
            offset,
        })
    }

    fn select(&mut self) -> RepoResult<Statement> {
        let distinct = self.eat_keyword("distinct");
        let selection = self.selection()?;
        self.expect_keyword("from")?;
        let from = self.from_clause()?;

        let mut joins = Vec::new();
        loop {
            let kind = if self.eat_keyword("left") {
                self.eat_keyword("outer");
                JoinKind::Left
            } else if self.eat_keyword("inner") || self.at_keyword("join") {
                JoinKind::Inner
            } else {
                break;
            };
            self.expect_keyword("join")?;
            let fetch = self.eat_keyword("fetch");
            let path = self.path()?;
            self.eat_keyword("as");
            let alias = self.identifier("join alias")?;
            joins.push(RawJoin {
                kind,
                fetch,
                path,
                alias,
            });
        }

        let predicate = self.where_clause()?;

        let mut order = Vec::new();
        if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            loop {
                let path = self.path()?;
                let direction = if self.eat_keyword("desc") {
                    Direction::Desc
                } else {
                    self.eat_keyword("asc");
                    Direction::Asc
                };
                order.push((path, direction));
                if !self.eat_symbol(",") {
                    break;
                }
            }
        }

        Ok(Statement::Select {
            distinct,
            selection,
            from,
            joins,
            predicate,
            order,
        })
    }

    fn selection(&mut self) -> RepoResult<Selection> {
        if self.at_keyword("count") && self.peek_at(1).is_some_and(|t| t.is_symbol("(")) {
            self.position += 2;
            let distinct = self.eat_keyword("distinct");
            let operand = self.arith()?;
            self.expect_symbol(")")?;
            return Ok(Selection::Count { distinct, operand });
        }
        if self.eat_keyword("new") {
            let mut type_name = self.identifier("constructor type")?;
            while self.eat_symbol(".") {
                type_name = self.identifier("constructor type")?;
            }
            self.expect_symbol("(")?;
            let mut items = vec![self.arith()?];
            while self.eat_symbol(",") {
                items.push(self.arith()?);
            }
            self.expect_symbol(")")?;
            return Ok(Selection::Constructor { type_name, items });
        }
        let mut items = Vec::new();
        loop {
            let operand = self.arith()?;
            let label = if self.eat_keyword("as") {
                Some(self.identifier("column label")?)
            } else {
                None
            };
            items.push((operand, label));
            if !self.eat_symbol(",") {
                break;
            }
        }
        Ok(Selection::Items(items))
    }

    fn update(&mut self) -> RepoResult<Statement> {
        let from = self.from_clause()?;
        self.expect_keyword("set")?;
        let mut assignments = Vec::new();
        loop {
            let path = self.path()?;
            self.expect_symbol("=")?;
            assignments.push((path, self.arith()?));
            if !self.eat_symbol(",") {
                break;
            }
        }
        let predicate = self.where_clause()?;
        Ok(Statement::Update {
            from,
            assignments,
            predicate,
        })
    }

    fn delete(&mut self) -> RepoResult<Statement> {
        self.expect_keyword("from")?;
        let from = self.from_clause()?;
        let predicate = self.where_clause()?;
        Ok(Statement::Delete { from, predicate })
    }

    fn where_clause(&mut self) -> RepoResult<Option<Expr<RawPath>>> {
        if self.eat_keyword("where") {
            Ok(Some(self.or_expr()?))
        } else {
            Ok(None)
        }
    }

    fn or_expr(&mut self) -> RepoResult<Expr<RawPath>> {
        let mut items = vec![self.and_expr()?];
        while self.eat_keyword("or") {
            items.push(self.and_expr()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn and_expr(&mut self) -> RepoResult<Expr<RawPath>> {
        let mut items = vec![self.not_expr()?];
        while self.eat_keyword("and") {
            items.push(self.not_expr()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn not_expr(&mut self) -> RepoResult<Expr<RawPath>> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        if self.at_symbol("(") {
            let saved = self.position;
            self.position += 1;
            if let Ok(group) = self.or_expr() {
                if self.eat_symbol(")") && !self.at_comparison() {
                    return Ok(group);
                }
            }
            // Not a predicate group: a parenthesized arithmetic operand.
            self.position = saved;
        }
        self.comparison()
    }

    fn at_comparison(&self) -> bool {
        ["=", "<>", "!=", "<", "<=", ">", ">=", "+", "-", "*", "/"]
            .iter()
            .any(|symbol| self.at_symbol(symbol))
            || ["in", "is", "like", "between", "not"]
                .iter()
                .any(|keyword| self.at_keyword(keyword))
    }

    fn comparison(&mut self) -> RepoResult<Expr<RawPath>> {
        let left = self.arith()?;

        if self.eat_keyword("is") {
            let negated = self.eat_keyword("not");
            self.expect_keyword("null")?;
            return Ok(Expr::IsNull {
                operand: left,
                negated,
            });
        }

        let negated = self.eat_keyword("not");
        if self.eat_keyword("in") {
            let list = if self.eat_symbol("(") {
                let mut items = vec![self.arith()?];
                while self.eat_symbol(",") {
                    items.push(self.arith()?);
                }
                self.expect_symbol(")")?;
                InList::Items(items)
            } else {
                let param = match self.peek().map(|token| &token.tok) {
                    Some(Tok::Named(name)) => ParamRef::Named(name.clone()),
                    Some(Tok::Positional(index)) => ParamRef::Positional(*index),
                    _ => return Err(self.error("expected `(` or a parameter after `in`")),
                };
                self.position += 1;
                InList::Param(param)
            };
            return Ok(Expr::In {
                operand: left,
                list,
                negated,
            });
        }
        if self.eat_keyword("like") {
            let pattern = self.arith()?;
            return Ok(Expr::Like {
                operand: left,
                pattern,
                mode: LikeMode::Raw,
                negated,
            });
        }
        if self.eat_keyword("between") {
            let low = self.arith()?;
            self.expect_keyword("and")?;
            let high = self.arith()?;
            let range = Expr::And(vec![
                Expr::compare(left.clone(), CompareOp::Ge, low),
                Expr::compare(left, CompareOp::Le, high),
            ]);
            return Ok(if negated {
                Expr::Not(Box::new(range))
            } else {
                range
            });
        }
        if negated {
            return Err(self.error("expected `in`, `like` or `between` after `not`"));
        }

        let op = match self.peek().map(|token| &token.tok) {
            Some(Tok::Symbol("=")) => CompareOp::Eq,
            Some(Tok::Symbol("<>" | "!=")) => CompareOp::Ne,
            Some(Tok::Symbol(">")) => CompareOp::Gt,
            Some(Tok::Symbol(">=")) => CompareOp::Ge,
            Some(Tok::Symbol("<")) => CompareOp::Lt,
            Some(Tok::Symbol("<=")) => CompareOp::Le,
            _ => return Err(self.error("expected a comparison operator")),
        };
        self.position += 1;
        let right = self.arith()?;
        Ok(Expr::Compare { left, op, right })
    }

    fn arith(&mut self) -> RepoResult<Operand<RawPath>> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat_symbol("+") {
                ArithOp::Add
            } else if self.eat_symbol("-") {
                ArithOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.term()?;
            left = Operand::Arith {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
    }

    fn term(&mut self) -> RepoResult<Operand<RawPath>> {
        let mut left = self.factor()?;
        loop {
            let op = if self.eat_symbol("*") {
                ArithOp::Mul
            } else if self.eat_symbol("/") {
                ArithOp::Div
            } else {
                return Ok(left);
            };
            let right = self.factor()?;
            left = Operand::Arith {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
    }

    fn factor(&mut self) -> RepoResult<Operand<RawPath>> {
        if self.eat_symbol("(") {
            let inner = self.arith()?;
            self.expect_symbol(")")?;
            return Ok(inner);
        }
        if self.eat_symbol("-") {
            let literal = match self.peek().map(|token| &token.tok) {
                Some(Tok::Integer(value)) => Value::Integer(-*value),
                Some(Tok::Real(value)) => Value::Real(-*value),
                _ => return Err(self.error("expected a number after `-`")),
            };
            self.position += 1;
            return Ok(Operand::Literal(literal));
        }
        if self.eat_keyword("true") {
            return Ok(Operand::Literal(Value::from(true)));
        }
        if self.eat_keyword("false") {
            return Ok(Operand::Literal(Value::from(false)));
        }
        if self.eat_keyword("null") {
            return Ok(Operand::Literal(Value::Null));
        }
        let tok = self.peek().map(|token| token.tok.clone());
        let operand = match tok {
            Some(Tok::Integer(value)) => Operand::Literal(Value::Integer(value)),
            Some(Tok::Real(value)) => Operand::Literal(Value::Real(value)),
            Some(Tok::Str(value)) => Operand::Literal(Value::Text(value)),
            Some(Tok::Named(name)) => Operand::Param(ParamRef::Named(name)),
            Some(Tok::Positional(index)) => Operand::Param(ParamRef::Positional(index)),
            Some(Tok::Ident(_)) => return Ok(Operand::Column(self.path()?)),
            _ => return Err(self.error("expected an operand")),
        };
        self.position += 1;
        Ok(operand)
    }
}

fn is_reserved(ident: &str) -> bool {
    RESERVED
        .iter()
        .any(|keyword| keyword.eq_ignore_ascii_case(ident))
}

/// Alias table and join list while resolving one statement.
struct Scope<'a> {
    declaration: &'a str,
    entity: &'static EntityMeta,
    aliases: Vec<(String, usize)>,
    joins: Vec<Join>,
}

impl Scope<'_> {
    fn unresolved(&self, source: usize, path: &RawPath) -> RepoError {
        let entity = source_entity(self.entity, &self.joins, source).unwrap_or(self.entity);
        RepoError::UnresolvedField {
            entity: entity.name,
            declaration: self.declaration.to_string(),
            token: path.text(),
        }
    }

    fn source_of(&self, alias: &str) -> Option<usize> {
        self.aliases
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(alias))
            .map(|(_, source)| *source)
    }

    fn is_root_alias(&self, path: &RawPath) -> bool {
        path.segments.len() == 1 && self.source_of(&path.segments[0]) == Some(0)
    }

    fn resolve(&mut self, path: RawPath) -> RepoResult<ColumnRef> {
        let source = self
            .source_of(&path.segments[0])
            .ok_or_else(|| self.unresolved(0, &path))?;
        let entity = source_entity(self.entity, &self.joins, source)
            .ok_or_else(|| self.unresolved(0, &path))?;

        match path.segments.as_slice() {
            [_] => Ok(ColumnRef {
                source,
                column: entity.id_column,
            }),
            [_, property] => entity
                .property(property)
                .map(|property| ColumnRef {
                    source,
                    column: property.column,
                })
                .ok_or_else(|| self.unresolved(source, &path)),
            [_, relation, property] => {
                let relation = entity
                    .relation(relation)
                    .ok_or_else(|| self.unresolved(source, &path))?;
                let target = relation
                    .target
                    .property(property)
                    .ok_or_else(|| self.unresolved(source, &path))?;
                if target.kind == PropertyKind::Id {
                    return Ok(ColumnRef {
                        source,
                        column: relation.column,
                    });
                }
                let joined = Join::ensure(&mut self.joins, source, relation, JoinKind::Inner);
                Ok(ColumnRef {
                    source: joined,
                    column: target.column,
                })
            }
            _ => Err(self.unresolved(source, &path)),
        }
    }

    fn bind_from(&mut self, from: &FromClause) -> RepoResult<()> {
        if from.entity != self.entity.name {
            return Err(syntax(
                self.declaration,
                from.offset,
                format!(
                    "query is declared on `{}` but reads from `{}`",
                    self.entity.name, from.entity
                ),
            ));
        }
        self.aliases.push((from.alias.clone(), 0));
        Ok(())
    }

    fn bind_join(&mut self, join: RawJoin) -> RepoResult<()> {
        let (alias, relation_name) = match join.path.segments.as_slice() {
            [alias, relation] => (alias.clone(), relation.clone()),
            _ => return Err(self.unresolved(0, &join.path)),
        };
        let source = self
            .source_of(&alias)
            .ok_or_else(|| self.unresolved(0, &join.path))?;
        let relation = source_entity(self.entity, &self.joins, source)
            .and_then(|entity| entity.relation(&relation_name))
            .ok_or_else(|| self.unresolved(source, &join.path))?;
        let index = Join::ensure(&mut self.joins, source, relation, join.kind);
        if let Some(existing) = self.joins.get_mut(index - 1) {
            existing.kind = join.kind;
            existing.fetch |= join.fetch;
        }
        self.aliases.push((join.alias, index));
        Ok(())
    }

    fn operand(&mut self, operand: Operand<RawPath>) -> RepoResult<Operand> {
        operand.try_map(&mut |path| self.resolve(path))
    }

    fn predicate(&mut self, predicate: Option<Expr<RawPath>>) -> RepoResult<Option<Expr>> {
        predicate
            .map(|expr| expr.try_map(&mut |path| self.resolve(path)))
            .transpose()
    }
}

fn label_of(operand: &Operand<RawPath>, index: usize) -> String {
    match operand {
        Operand::Column(path) if path.segments.len() > 1 => path.segments[1..].join("."),
        _ => format!("col{index}"),
    }
}

/// Parses logical query text declared on `entity`.
pub fn logical(entity: &'static EntityMeta, name: &str, text: &str) -> RepoResult<QueryDescriptor> {
    let declaration = format!("{}.{name}", entity.name);
    let statement = Parser::new(&declaration, text)?.statement()?;
    let mut scope = Scope {
        declaration: &declaration,
        entity,
        aliases: Vec::new(),
        joins: Vec::new(),
    };
    let mut parameters = Vec::new();

    let (body, sort, shape) = match statement {
        Statement::Select {
            distinct,
            selection,
            from,
            joins,
            predicate,
            order,
        } => {
            scope.bind_from(&from)?;
            for join in joins {
                scope.bind_join(join)?;
            }

            let (projection, shape) = match selection {
                Selection::Items(items)
                    if items.len() == 1
                        && matches!(&items[0].0, Operand::Column(path) if scope.is_root_alias(path)) =>
                {
                    (Projection::Entity, ResultShape::List)
                }
                Selection::Items(items) => {
                    let mut resolved = Vec::with_capacity(items.len());
                    for (index, (operand, label)) in items.into_iter().enumerate() {
                        let label = label.unwrap_or_else(|| label_of(&operand, index));
                        resolved.push(SelectItem {
                            operand: scope.operand(operand)?,
                            label,
                        });
                    }
                    (Projection::Columns(resolved), ResultShape::List)
                }
                Selection::Constructor { type_name, items } => {
                    let mut resolved = Vec::with_capacity(items.len());
                    for (index, operand) in items.into_iter().enumerate() {
                        resolved.push(SelectItem {
                            operand: scope.operand(operand)?,
                            label: format!("col{index}"),
                        });
                    }
                    (
                        Projection::Constructor {
                            type_name,
                            items: resolved,
                        },
                        ResultShape::List,
                    )
                }
                Selection::Count { distinct, operand } => {
                    let operand = match operand {
                        Operand::Column(path) if scope.is_root_alias(&path) => None,
                        other => Some(scope.operand(other)?),
                    };
                    (Projection::Count { distinct, operand }, ResultShape::Scalar)
                }
            };

            if projection != Projection::Entity && scope.joins.iter().any(|join| join.fetch) {
                return Err(RepoError::Configuration(format!(
                    "query `{declaration}`: fetch joins need an entity selection"
                )));
            }

            let predicate = scope.predicate(predicate)?;
            let mut sort = Vec::with_capacity(order.len());
            for (path, direction) in order {
                sort.push(OrderItem {
                    target: OrderTarget::Column(scope.resolve(path)?),
                    direction,
                });
            }

            match &projection {
                Projection::Columns(items) | Projection::Constructor { items, .. } => {
                    for item in items {
                        item.operand.collect_parameters(&mut parameters);
                    }
                }
                Projection::Count {
                    operand: Some(operand),
                    ..
                } => operand.collect_parameters(&mut parameters),
                _ => {}
            }
            if let Some(predicate) = predicate.as_ref() {
                predicate.collect_parameters(&mut parameters);
            }

            (
                QueryBody::Select {
                    distinct,
                    joins: std::mem::take(&mut scope.joins),
                    predicate,
                    projection,
                },
                sort,
                shape,
            )
        }
        Statement::Update {
            from,
            assignments,
            predicate,
        } => {
            scope.bind_from(&from)?;
            let mut resolved = Vec::with_capacity(assignments.len());
            for (path, value) in assignments {
                let target = scope.resolve(path.clone())?;
                let settable = path.segments.len() == 2
                    && target.source == 0
                    && target.column != entity.id_column;
                if !settable {
                    return Err(syntax(
                        &declaration,
                        path.offset,
                        format!("`{}` cannot be assigned", path.text()),
                    ));
                }
                let value = scope.operand(value)?;
                value.collect_parameters(&mut parameters);
                resolved.push(Assignment {
                    column: target.column,
                    value,
                });
            }
            let predicate = scope.predicate(predicate)?;
            if let Some(predicate) = predicate.as_ref() {
                predicate.collect_parameters(&mut parameters);
            }
            (
                QueryBody::Update {
                    assignments: resolved,
                    joins: std::mem::take(&mut scope.joins),
                    predicate,
                },
                Vec::new(),
                ResultShape::Affected,
            )
        }
        Statement::Delete { from, predicate } => {
            scope.bind_from(&from)?;
            let predicate = scope.predicate(predicate)?;
            if let Some(predicate) = predicate.as_ref() {
                predicate.collect_parameters(&mut parameters);
            }
            (
                QueryBody::Delete {
                    joins: std::mem::take(&mut scope.joins),
                    predicate,
                },
                Vec::new(),
                ResultShape::Affected,
            )
        }
    };

    let descriptor = QueryDescriptor {
        name: declaration,
        entity,
        body,
        sort,
        limit: None,
        window: None,
        lock: LockMode::None,
        shape,
        parameters,
        count_query: None,
    };
    descriptor.validate()?;
    Ok(descriptor)
}

/// Wraps a native statement. Rows map to the entity unless `shape` says
/// otherwise.
pub fn native(
    entity: &'static EntityMeta,
    name: &str,
    sql: &str,
    count_sql: Option<&str>,
    shape: ResultShape,
) -> RepoResult<QueryDescriptor> {
    let declaration = format!("{}.{name}", entity.name);
    if sql.trim().is_empty() {
        return Err(syntax(&declaration, 0, "empty native statement"));
    }
    let parameters = native_parameters(&declaration, sql)?;
    let count_query = match count_sql {
        Some(count_sql) => Some(Box::new(QueryDescriptor {
            name: format!("{declaration}#count"),
            entity,
            body: QueryBody::Native {
                sql: count_sql.to_string(),
                count_sql: None,
            },
            sort: Vec::new(),
            limit: None,
            window: None,
            lock: LockMode::None,
            shape: ResultShape::Scalar,
            parameters: native_parameters(&declaration, count_sql)?,
            count_query: None,
        })),
        None => None,
    };
    let descriptor = QueryDescriptor {
        name: declaration,
        entity,
        body: QueryBody::Native {
            sql: sql.to_string(),
            count_sql: count_sql.map(str::to_string),
        },
        sort: Vec::new(),
        limit: None,
        window: None,
        lock: LockMode::None,
        shape,
        parameters,
        count_query,
    };
    descriptor.validate()?;
    Ok(descriptor)
}

/// Placeholders of a native statement in the order SQLite numbers them:
/// `?N`, bare `?` (next free index) and `:name`, `@name` or `$name`. Quoted
/// text, line comments and block comments are skipped.
pub(crate) fn native_parameters(declaration: &str, sql: &str) -> RepoResult<Vec<ParamRef>> {
    let bytes = sql.as_bytes();
    let mut parameters: Vec<ParamRef> = Vec::new();
    let mut highest = 0usize;
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            quote @ (b'\'' | b'"' | b'`') => {
                let start = index;
                index += 1;
                while index < bytes.len() && bytes[index] != quote {
                    index += 1;
                }
                if index >= bytes.len() {
                    return Err(syntax(declaration, start, "unterminated quoted text"));
                }
                index += 1;
            }
            b'-' if bytes.get(index + 1) == Some(&b'-') => {
                while index < bytes.len() && bytes[index] != b'\n' {
                    index += 1;
                }
            }
            b'/' if bytes.get(index + 1) == Some(&b'*') => {
                let start = index;
                let end = sql[index + 2..]
                    .find("*/")
                    .ok_or_else(|| syntax(declaration, start, "unterminated block comment"))?;
                index += 2 + end + 2;
            }
            b'?' => {
                index += 1;
                let start = index;
                while index < bytes.len() && bytes[index].is_ascii_digit() {
                    index += 1;
                }
                let position = if start == index {
                    highest + 1
                } else {
                    sql[start..index]
                        .parse::<usize>()
                        .ok()
                        .filter(|position| *position > 0)
                        .ok_or_else(|| syntax(declaration, start - 1, "invalid positional parameter"))?
                };
                highest = highest.max(position);
                let param = ParamRef::Positional(position);
                if !parameters.contains(&param) {
                    parameters.push(param);
                }
            }
            b':' | b'@' | b'$'
                if bytes.get(index + 1).is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_')
                    && (index == 0 || bytes[index - 1] != b':') =>
            {
                index += 1;
                let start = index;
                while index < bytes.len()
                    && (bytes[index].is_ascii_alphanumeric() || bytes[index] == b'_')
                {
                    index += 1;
                }
                let param = ParamRef::Named(sql[start..index].to_string());
                if !parameters.contains(&param) {
                    highest += 1;
                    parameters.push(param);
                }
            }
            _ => index += 1,
        }
    }
    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::{logical, native, native_parameters};
    use crate::error::RepoError;
    use crate::model::member::MEMBER_META;
    use crate::query::descriptor::{
        ColumnRef, Expr, InList, JoinKind, OrderTarget, ParamRef, Projection, QueryBody,
        ResultShape,
    };

    #[test]
    fn entity_select_with_named_parameter() {
        let descriptor = logical(
            &MEMBER_META,
            "byName",
            "select m from Member m where m.username = :username and m.age > :age",
        )
        .unwrap();
        assert_eq!(descriptor.projection(), Some(&Projection::Entity));
        assert_eq!(descriptor.shape, ResultShape::List);
        assert_eq!(
            descriptor.parameters,
            vec![
                ParamRef::Named("username".to_string()),
                ParamRef::Named("age".to_string())
            ]
        );
    }

    #[test]
    fn fetch_join_and_implicit_join_share_the_edge() {
        let descriptor = logical(
            &MEMBER_META,
            "withTeam",
            "select m from Member m left join fetch m.team t where m.team.name = :name order by t.name desc",
        )
        .unwrap();
        let joins = descriptor.joins();
        assert_eq!(joins.len(), 1);
        assert!(joins[0].fetch);
        assert_eq!(joins[0].kind, JoinKind::Left);
        assert_eq!(
            descriptor.sort[0].target,
            OrderTarget::Column(ColumnRef {
                source: 1,
                column: "team_name"
            })
        );
    }

    #[test]
    fn constructor_and_column_projections() {
        let dto = logical(
            &MEMBER_META,
            "dto",
            "select new study.MemberDto(m.id, m.username, t.name) from Member m join m.team t",
        )
        .unwrap();
        match dto.projection() {
            Some(Projection::Constructor { type_name, items }) => {
                assert_eq!(type_name, "MemberDto");
                assert_eq!(items.len(), 3);
            }
            other => panic!("unexpected projection: {other:?}"),
        }

        let names = logical(&MEMBER_META, "names", "select m.username from Member m").unwrap();
        match names.projection() {
            Some(Projection::Columns(items)) => assert_eq!(items[0].label, "username"),
            other => panic!("unexpected projection: {other:?}"),
        }
    }

    #[test]
    fn collection_parameter_and_count() {
        let descriptor = logical(
            &MEMBER_META,
            "byNames",
            "select count(m) from Member m where m.username in :names",
        )
        .unwrap();
        assert_eq!(descriptor.shape, ResultShape::Scalar);
        match descriptor.predicate() {
            Some(Expr::In {
                list: InList::Param(param),
                ..
            }) => assert_eq!(param, &ParamRef::Named("names".to_string())),
            other => panic!("unexpected predicate: {other:?}"),
        }
    }

    #[test]
    fn bulk_update_is_a_mutation() {
        let descriptor = logical(
            &MEMBER_META,
            "bulkAgePlus",
            "update Member m set m.age = m.age + 1 where m.age >= :age",
        )
        .unwrap();
        assert!(descriptor.is_mutation());
        assert!(matches!(descriptor.body, QueryBody::Update { .. }));

        assert!(matches!(
            logical(&MEMBER_META, "badSet", "update Member m set m.id = 1").unwrap_err(),
            RepoError::Syntax { .. }
        ));
    }

    #[test]
    fn parenthesized_groups_and_arithmetic() {
        let descriptor = logical(
            &MEMBER_META,
            "grouped",
            "select m from Member m where (m.age + 1) * 2 > :min and (m.username = :a or m.username = :b)",
        )
        .unwrap();
        match descriptor.predicate() {
            Some(Expr::And(items)) => {
                assert!(matches!(items[0], Expr::Compare { .. }));
                assert!(matches!(items[1], Expr::Or(_)));
            }
            other => panic!("unexpected predicate: {other:?}"),
        }
    }

    #[test]
    fn unknown_property_and_alias_are_unresolved() {
        assert!(matches!(
            logical(&MEMBER_META, "bad", "select m from Member m where m.nickname = :n").unwrap_err(),
            RepoError::UnresolvedField { .. }
        ));
        assert!(matches!(
            logical(&MEMBER_META, "bad", "select m from Member m where x.age = 1").unwrap_err(),
            RepoError::UnresolvedField { .. }
        ));
    }

    #[test]
    fn malformed_text_is_a_syntax_error() {
        let err = logical(&MEMBER_META, "bad", "select m from Member m where").unwrap_err();
        assert!(matches!(err, RepoError::Syntax { .. }));
        assert!(logical(&MEMBER_META, "bad", "select m from Team t").is_err());
    }

    #[test]
    fn native_placeholders_skip_quoted_text() {
        let params = native_parameters(
            "q",
            "select * from member where username = ? and team_id = :team and note = ':skip' and age > ?5",
        )
        .unwrap();
        assert_eq!(
            params,
            vec![
                ParamRef::Positional(1),
                ParamRef::Named("team".to_string()),
                ParamRef::Positional(5)
            ]
        );

        let descriptor = native(
            &MEMBER_META,
            "nativeByName",
            "select * from member where username = :username",
            Some("select count(*) from member where username = :username"),
            ResultShape::Page,
        )
        .unwrap();
        assert!(descriptor.maps_entity());
        assert!(descriptor.count_query.is_some());
    }

    #[test]
    fn native_placeholders_cover_every_sqlite_prefix() {
        let params = native_parameters(
            "q",
            "select * /* where age = :hidden */ from member \
             where username = @username and age > $age /* ? */ and team_id = :team",
        )
        .unwrap();
        assert_eq!(
            params,
            vec![
                ParamRef::Named("username".to_string()),
                ParamRef::Named("age".to_string()),
                ParamRef::Named("team".to_string())
            ]
        );

        let err = native_parameters("q", "select * from member /* open").unwrap_err();
        assert!(matches!(err, RepoError::Syntax { offset: 21, .. }));
    }
}

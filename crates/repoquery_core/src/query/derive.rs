//! Method-name query deriver.
//!
//! # Responsibility
//! - Turn a declared operation name such as `findByUsernameAndAgeGreaterThan`
//!   into a `QueryDescriptor`, once, at registration.
//!
//! # Invariants
//! - Every field token must resolve against the entity; otherwise
//!   `UnresolvedField` is returned and nothing is registered.
//! - A predicate uses a single connective. Mixing `And` and `Or` fails with
//!   `AmbiguousPredicate`.
//! - Value-taking clauses consume positional placeholders `?1..?n` in
//!   declaration order.

use crate::error::{RepoError, RepoResult};
use crate::model::entity::{EntityMeta, PropertyKind, RelationMeta};
use crate::model::value::Value;
use crate::query::descriptor::{
    ColumnRef, CompareOp, Expr, InList, Join, JoinKind, LikeMode, LockMode, OrderItem,
    OrderTarget, Operand, ParamRef, Projection, QueryBody, QueryDescriptor, ResultShape,
};
use crate::query::page::Direction;
use once_cell::sync::Lazy;
use regex::Regex;

static VERB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(find|get|query|read|count|exists|delete|remove)((?:[A-Z0-9].*)?)$")
        .expect("valid verb regex")
});
static WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Z][a-z]*|[a-z]+|[0-9]+").expect("valid word regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Find,
    Count,
    Exists,
    Delete,
}

#[derive(Debug, Clone, Copy)]
enum Operator {
    Compare(CompareOp),
    In { negated: bool },
    IsNull { negated: bool },
    Like { mode: LikeMode, negated: bool },
    Bool(bool),
}

/// Operator keywords as camel-case word sequences. The longest match wins.
const OPERATORS: &[(&[&str], Operator)] = &[
    (&["Is", "Not", "Null"], Operator::IsNull { negated: true }),
    (&["Not", "Null"], Operator::IsNull { negated: true }),
    (&["Is", "Null"], Operator::IsNull { negated: false }),
    (&["Null"], Operator::IsNull { negated: false }),
    (&["Is", "Greater", "Than", "Equal"], Operator::Compare(CompareOp::Ge)),
    (&["Greater", "Than", "Equal"], Operator::Compare(CompareOp::Ge)),
    (&["Is", "Greater", "Than"], Operator::Compare(CompareOp::Gt)),
    (&["Greater", "Than"], Operator::Compare(CompareOp::Gt)),
    (&["After"], Operator::Compare(CompareOp::Gt)),
    (&["Is", "Less", "Than", "Equal"], Operator::Compare(CompareOp::Le)),
    (&["Less", "Than", "Equal"], Operator::Compare(CompareOp::Le)),
    (&["Is", "Less", "Than"], Operator::Compare(CompareOp::Lt)),
    (&["Less", "Than"], Operator::Compare(CompareOp::Lt)),
    (&["Before"], Operator::Compare(CompareOp::Lt)),
    (&["Is", "Not", "In"], Operator::In { negated: true }),
    (&["Not", "In"], Operator::In { negated: true }),
    (&["Is", "In"], Operator::In { negated: false }),
    (&["In"], Operator::In { negated: false }),
    (
        &["Is", "Starting", "With"],
        Operator::Like {
            mode: LikeMode::StartsWith,
            negated: false,
        },
    ),
    (
        &["Starting", "With"],
        Operator::Like {
            mode: LikeMode::StartsWith,
            negated: false,
        },
    ),
    (
        &["Starts", "With"],
        Operator::Like {
            mode: LikeMode::StartsWith,
            negated: false,
        },
    ),
    (
        &["Is", "Ending", "With"],
        Operator::Like {
            mode: LikeMode::EndsWith,
            negated: false,
        },
    ),
    (
        &["Ending", "With"],
        Operator::Like {
            mode: LikeMode::EndsWith,
            negated: false,
        },
    ),
    (
        &["Ends", "With"],
        Operator::Like {
            mode: LikeMode::EndsWith,
            negated: false,
        },
    ),
    (
        &["Is", "Containing"],
        Operator::Like {
            mode: LikeMode::Contains,
            negated: false,
        },
    ),
    (
        &["Containing"],
        Operator::Like {
            mode: LikeMode::Contains,
            negated: false,
        },
    ),
    (
        &["Contains"],
        Operator::Like {
            mode: LikeMode::Contains,
            negated: false,
        },
    ),
    (
        &["Not", "Containing"],
        Operator::Like {
            mode: LikeMode::Contains,
            negated: true,
        },
    ),
    (
        &["Is", "Not", "Like"],
        Operator::Like {
            mode: LikeMode::Raw,
            negated: true,
        },
    ),
    (
        &["Not", "Like"],
        Operator::Like {
            mode: LikeMode::Raw,
            negated: true,
        },
    ),
    (
        &["Is", "Like"],
        Operator::Like {
            mode: LikeMode::Raw,
            negated: false,
        },
    ),
    (
        &["Like"],
        Operator::Like {
            mode: LikeMode::Raw,
            negated: false,
        },
    ),
    (&["Is", "True"], Operator::Bool(true)),
    (&["True"], Operator::Bool(true)),
    (&["Is", "False"], Operator::Bool(false)),
    (&["False"], Operator::Bool(false)),
    (&["Is", "Not"], Operator::Compare(CompareOp::Ne)),
    (&["Not"], Operator::Compare(CompareOp::Ne)),
    (&["Is", "Equal"], Operator::Compare(CompareOp::Eq)),
    (&["Equals"], Operator::Compare(CompareOp::Eq)),
    (&["Is"], Operator::Compare(CompareOp::Eq)),
];

/// A property reachable from the root: directly, or one relation hop away.
#[derive(Debug, Clone, Copy)]
enum FieldPath {
    Root(&'static str),
    Nested(&'static RelationMeta, &'static str),
}

struct Candidate {
    key: String,
    path: FieldPath,
}

fn candidates(entity: &'static EntityMeta) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = entity
        .properties()
        .into_iter()
        .map(|property| Candidate {
            key: property.name.to_ascii_lowercase(),
            path: FieldPath::Root(property.column),
        })
        .collect();
    for relation in entity.relations {
        for property in relation.target.properties() {
            if property.kind == PropertyKind::Relation {
                continue;
            }
            // The target key is the foreign key column itself.
            let path = if property.kind == PropertyKind::Id {
                FieldPath::Root(relation.column)
            } else {
                FieldPath::Nested(relation, property.column)
            };
            out.push(Candidate {
                key: format!("{}{}", relation.name, property.name).to_ascii_lowercase(),
                path,
            });
        }
    }
    out
}

struct Deriver<'a> {
    entity: &'static EntityMeta,
    method: &'a str,
    candidates: Vec<Candidate>,
    joins: Vec<Join>,
    next_param: usize,
}

/// Parses `method` into a descriptor for `entity` with the verb's default
/// result shape: `List` for finders, `Scalar` for count/exists and
/// `Affected` for delete.
pub fn derive(entity: &'static EntityMeta, method: &str) -> RepoResult<QueryDescriptor> {
    let captures = VERB_RE.captures(method).ok_or_else(|| {
        RepoError::Configuration(format!(
            "`{}.{method}` does not start with a query verb",
            entity.name
        ))
    })?;
    let verb = match captures.get(1).map(|m| m.as_str()) {
        Some("count") => Verb::Count,
        Some("exists") => Verb::Exists,
        Some("delete" | "remove") => Verb::Delete,
        _ => Verb::Find,
    };
    let rest = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
    let words: Vec<&str> = WORD_RE.find_iter(rest).map(|m| m.as_str()).collect();

    let mut deriver = Deriver {
        entity,
        method,
        candidates: candidates(entity),
        joins: Vec::new(),
        next_param: 0,
    };

    let (subject, predicate_words, order_words) = split_clauses(&words);
    let (distinct, limit) = deriver.subject(subject)?;
    let predicate = match predicate_words {
        Some(words) => Some(deriver.predicate(words)?),
        None => None,
    };
    let sort = match order_words {
        Some(words) => deriver.order(words)?,
        None => Vec::new(),
    };

    let joins = std::mem::take(&mut deriver.joins);
    let (body, shape) = match verb {
        Verb::Find => (
            QueryBody::Select {
                distinct,
                joins,
                predicate,
                projection: Projection::Entity,
            },
            ResultShape::List,
        ),
        Verb::Count => (
            QueryBody::Select {
                distinct,
                joins,
                predicate,
                projection: Projection::Count {
                    distinct,
                    operand: None,
                },
            },
            ResultShape::Scalar,
        ),
        Verb::Exists => (
            QueryBody::Select {
                distinct: false,
                joins,
                predicate,
                projection: Projection::Exists,
            },
            ResultShape::Scalar,
        ),
        Verb::Delete => (QueryBody::Delete { joins, predicate }, ResultShape::Affected),
    };

    let descriptor = QueryDescriptor {
        name: format!("{}.{method}", entity.name),
        entity,
        body,
        sort,
        limit: if verb == Verb::Find { limit } else { None },
        window: None,
        lock: LockMode::None,
        shape,
        parameters: (1..=deriver.next_param).map(ParamRef::Positional).collect(),
        count_query: None,
    };
    descriptor.validate()?;
    Ok(descriptor)
}

type Clauses<'w, 's> = (&'w [&'s str], Option<&'w [&'s str]>, Option<&'w [&'s str]>);

/// Splits words into subject, predicate (after `By`) and order (after
/// `OrderBy`).
fn split_clauses<'w, 's>(words: &'w [&'s str]) -> Clauses<'w, 's> {
    let order_at = |from: usize| {
        (from..words.len().saturating_sub(1))
            .find(|&index| words[index] == "Order" && words[index + 1] == "By")
    };
    for index in 0..words.len() {
        if words[index] == "Order" && words.get(index + 1) == Some(&"By") {
            return (&words[..index], None, Some(&words[index + 2..]));
        }
        if words[index] == "By" {
            let start = index + 1;
            let (predicate, order) = match order_at(start) {
                Some(order) => (&words[start..order], Some(&words[order + 2..])),
                None => (&words[start..], None),
            };
            let predicate = if predicate.is_empty() {
                None
            } else {
                Some(predicate)
            };
            return (&words[..index], predicate, order);
        }
    }
    (words, None, None)
}

impl Deriver<'_> {
    fn unresolved(&self, words: &[&str]) -> RepoError {
        RepoError::UnresolvedField {
            entity: self.entity.name,
            declaration: self.method.to_string(),
            token: words.concat(),
        }
    }

    /// `Distinct`, `First[N]` and `Top[N]` carry meaning; other subject words
    /// (`All`, `List`, entity names, hint markers) are decoration.
    fn subject(&self, words: &[&str]) -> RepoResult<(bool, Option<u32>)> {
        let mut distinct = false;
        let mut limit = None;
        let mut index = 0;
        while index < words.len() {
            match words[index] {
                "Distinct" => distinct = true,
                "First" | "Top" => {
                    let count = match words.get(index + 1).and_then(|w| w.parse::<u32>().ok()) {
                        Some(count) => {
                            index += 1;
                            count
                        }
                        None => 1,
                    };
                    if count == 0 {
                        return Err(RepoError::Configuration(format!(
                            "`{}.{}` limits results to zero rows",
                            self.entity.name, self.method
                        )));
                    }
                    limit = Some(count);
                }
                _ => {}
            }
            index += 1;
        }
        Ok((distinct, limit))
    }

    fn match_field(&self, words: &[&str]) -> Option<(FieldPath, usize)> {
        (1..=words.len()).rev().find_map(|len| {
            let key = words[..len].concat().to_ascii_lowercase();
            self.candidates
                .iter()
                .find(|candidate| candidate.key == key)
                .map(|candidate| (candidate.path, len))
        })
    }

    fn match_operator(words: &[&str]) -> Option<(Operator, usize)> {
        OPERATORS
            .iter()
            .filter(|(keyword, _)| words.starts_with(keyword))
            .max_by_key(|(keyword, _)| keyword.len())
            .map(|(keyword, operator)| (*operator, keyword.len()))
    }

    fn column(&mut self, path: FieldPath) -> ColumnRef {
        match path {
            FieldPath::Root(column) => ColumnRef::root(column),
            FieldPath::Nested(relation, column) => ColumnRef {
                source: Join::ensure(&mut self.joins, 0, relation, JoinKind::Left),
                column,
            },
        }
    }

    fn predicate(&mut self, words: &[&str]) -> RepoResult<Expr> {
        let mut clauses = Vec::new();
        let mut connective: Option<&str> = None;
        let mut position = 0;

        loop {
            let rest = &words[position..];
            let clause_words = rest
                .iter()
                .position(|word| *word == "And" || *word == "Or")
                .map_or(rest, |end| &rest[..end]);
            let (path, field_len) = self
                .match_field(rest)
                .ok_or_else(|| self.unresolved(clause_words))?;
            let after_field = &rest[field_len..];
            let (operator, operator_len) = match Self::match_operator(after_field) {
                Some(found) => found,
                None => (Operator::Compare(CompareOp::Eq), 0),
            };
            let consumed = field_len + operator_len;
            match rest.get(consumed) {
                None | Some(&"And") | Some(&"Or") => {}
                Some(_) => return Err(self.unresolved(clause_words)),
            }

            let column = self.column(path);
            clauses.push(self.clause(column, operator));
            position += consumed;

            let Some(&next) = words.get(position) else {
                break;
            };
            match connective {
                Some(previous) if previous != next => {
                    return Err(RepoError::AmbiguousPredicate {
                        declaration: format!("{}.{}", self.entity.name, self.method),
                    });
                }
                _ => connective = Some(next),
            }
            position += 1;
            if position == words.len() {
                return Err(self.unresolved(&[]));
            }
        }

        Ok(match (clauses.len(), connective) {
            (1, _) => clauses.remove(0),
            (_, Some("Or")) => Expr::Or(clauses),
            _ => Expr::And(clauses),
        })
    }

    fn param(&mut self) -> ParamRef {
        self.next_param += 1;
        ParamRef::Positional(self.next_param)
    }

    fn clause(&mut self, column: ColumnRef, operator: Operator) -> Expr {
        let operand = Operand::Column(column);
        match operator {
            Operator::Compare(op) => Expr::Compare {
                left: operand,
                op,
                right: Operand::Param(self.param()),
            },
            Operator::In { negated } => Expr::In {
                operand,
                list: InList::Param(self.param()),
                negated,
            },
            Operator::Like { mode, negated } => Expr::Like {
                operand,
                pattern: Operand::Param(self.param()),
                mode,
                negated,
            },
            Operator::IsNull { negated } => Expr::IsNull { operand, negated },
            Operator::Bool(flag) => Expr::Compare {
                left: operand,
                op: CompareOp::Eq,
                right: Operand::Literal(Value::from(flag)),
            },
        }
    }

    fn order(&mut self, words: &[&str]) -> RepoResult<Vec<OrderItem>> {
        let mut items = Vec::new();
        let mut position = 0;
        while position < words.len() {
            let rest = &words[position..];
            let (path, len) = self.match_field(rest).ok_or_else(|| self.unresolved(rest))?;
            position += len;
            let direction = match words.get(position) {
                Some(&"Desc") => {
                    position += 1;
                    Direction::Desc
                }
                Some(&"Asc") => {
                    position += 1;
                    Direction::Asc
                }
                _ => Direction::Asc,
            };
            let column = self.column(path);
            items.push(OrderItem {
                target: OrderTarget::Column(column),
                direction,
            });
        }
        if items.is_empty() {
            return Err(self.unresolved(&["OrderBy"]));
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::derive;
    use crate::error::RepoError;
    use crate::model::member::MEMBER_META;
    use crate::query::descriptor::{
        ColumnRef, CompareOp, Expr, LikeMode, Operand, OrderTarget, ParamRef, Projection,
        QueryBody, ResultShape,
    };
    use crate::query::page::Direction;

    fn predicate(body: &QueryBody) -> &Expr {
        match body {
            QueryBody::Select {
                predicate: Some(predicate),
                ..
            }
            | QueryBody::Delete {
                predicate: Some(predicate),
                ..
            } => predicate,
            other => panic!("no predicate in {other:?}"),
        }
    }

    #[test]
    fn username_and_age_greater_than() {
        let descriptor = derive(&MEMBER_META, "findByUsernameAndAgeGreaterThan").unwrap();
        assert_eq!(descriptor.name, "Member.findByUsernameAndAgeGreaterThan");
        assert_eq!(descriptor.shape, ResultShape::List);
        assert_eq!(
            descriptor.parameters,
            vec![ParamRef::Positional(1), ParamRef::Positional(2)]
        );
        assert_eq!(
            predicate(&descriptor.body),
            &Expr::And(vec![
                Expr::compare(
                    Operand::Column(ColumnRef::root("username")),
                    CompareOp::Eq,
                    Operand::Param(ParamRef::Positional(1)),
                ),
                Expr::compare(
                    Operand::Column(ColumnRef::root("age")),
                    CompareOp::Gt,
                    Operand::Param(ParamRef::Positional(2)),
                ),
            ])
        );
    }

    #[test]
    fn mixed_connectives_are_ambiguous() {
        let err = derive(&MEMBER_META, "findByUsernameAndAgeOrTeamIsNull").unwrap_err();
        assert!(matches!(err, RepoError::AmbiguousPredicate { .. }));
    }

    #[test]
    fn unknown_field_is_unresolved() {
        let err = derive(&MEMBER_META, "findByNicknameAndAge").unwrap_err();
        match err {
            RepoError::UnresolvedField { token, entity, .. } => {
                assert_eq!(token, "Nickname");
                assert_eq!(entity, "Member");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            derive(&MEMBER_META, "findByUsernameFoo").unwrap_err(),
            RepoError::UnresolvedField { .. }
        ));
    }

    #[test]
    fn non_verb_name_is_rejected() {
        assert!(matches!(
            derive(&MEMBER_META, "loadByUsername").unwrap_err(),
            RepoError::Configuration(_)
        ));
    }

    #[test]
    fn subject_limit_and_static_sort() {
        let descriptor =
            derive(&MEMBER_META, "findFirst3ByAgeGreaterThanEqualOrderByUsernameDescAgeAsc")
                .unwrap();
        assert_eq!(descriptor.limit, Some(3));
        assert_eq!(descriptor.sort.len(), 2);
        assert_eq!(
            descriptor.sort[0].target,
            OrderTarget::Column(ColumnRef::root("username"))
        );
        assert_eq!(descriptor.sort[0].direction, Direction::Desc);
        assert_eq!(descriptor.sort[1].direction, Direction::Asc);

        let top = derive(&MEMBER_META, "findTopByOrderByAgeDesc").unwrap();
        assert_eq!(top.limit, Some(1));
        assert!(top.predicate().is_none());
    }

    #[test]
    fn nested_relation_property_joins_target() {
        let descriptor = derive(&MEMBER_META, "countByTeamName").unwrap();
        assert_eq!(descriptor.shape, ResultShape::Scalar);
        assert_eq!(descriptor.joins().len(), 1);
        assert!(matches!(
            descriptor.projection(),
            Some(Projection::Count { .. })
        ));

        // The target key resolves to the foreign key without a join.
        let by_team_id = derive(&MEMBER_META, "findByTeamId").unwrap();
        assert!(by_team_id.joins().is_empty());
    }

    #[test]
    fn delete_verb_is_a_mutation() {
        let descriptor = derive(&MEMBER_META, "deleteByAgeLessThan").unwrap();
        assert!(descriptor.is_mutation());
        assert_eq!(descriptor.shape, ResultShape::Affected);
    }

    #[test]
    fn null_checks_take_no_parameter() {
        let descriptor = derive(&MEMBER_META, "findByTeamIsNullAndUsernameStartingWith").unwrap();
        assert_eq!(descriptor.parameters, vec![ParamRef::Positional(1)]);
        match predicate(&descriptor.body) {
            Expr::And(items) => {
                assert!(matches!(items[0], Expr::IsNull { negated: false, .. }));
                assert!(matches!(
                    items[1],
                    Expr::Like {
                        mode: LikeMode::StartsWith,
                        ..
                    }
                ));
            }
            other => panic!("unexpected predicate: {other:?}"),
        }
    }

    #[test]
    fn decoration_words_are_ignored() {
        for method in [
            "findMemberByUsername",
            "findListByUsername",
            "findOptionalByUsername",
            "findReadOnlyByUsername",
        ] {
            let descriptor = derive(&MEMBER_META, method).unwrap();
            assert_eq!(descriptor.parameters.len(), 1, "{method}");
        }
        let all = derive(&MEMBER_META, "findAll").unwrap();
        assert!(all.predicate().is_none());
    }
}

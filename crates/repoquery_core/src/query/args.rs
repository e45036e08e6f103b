//! Call-time arguments for named and positional placeholders.

use crate::error::{RepoError, RepoResult};
use crate::model::value::Value;
use crate::query::descriptor::ParamRef;
use std::collections::BTreeMap;

/// Arguments supplied to one query invocation.
///
/// Derived queries bind positionally (`?1..?n` in clause order); declared
/// queries usually bind by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    named: BTreeMap<String, Value>,
    positional: Vec<Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `:name`. A leading colon in `name` is ignored.
    pub fn bind(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.named
            .insert(name.trim_start_matches(':').to_string(), value.into());
        self
    }

    /// Appends the next positional argument.
    pub fn push(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            named: BTreeMap::new(),
            positional: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty() && self.positional.is_empty()
    }

    pub fn get(&self, param: &ParamRef) -> Option<&Value> {
        match param {
            ParamRef::Named(name) => self.named.get(name),
            ParamRef::Positional(index) => index
                .checked_sub(1)
                .and_then(|slot| self.positional.get(slot)),
        }
    }

    /// Looks up a bound value, failing with `ParameterMismatch` if absent.
    pub(crate) fn require(&self, query: &str, param: &ParamRef) -> RepoResult<&Value> {
        self.get(param).ok_or_else(|| RepoError::ParameterMismatch {
            query: query.to_string(),
            missing: vec![param.to_string()],
            unexpected: Vec::new(),
        })
    }

    /// Compares the supplied arguments with the placeholders a query declares.
    pub fn check(&self, query: &str, declared: &[ParamRef]) -> RepoResult<()> {
        let missing: Vec<String> = declared
            .iter()
            .filter(|param| self.get(param).is_none())
            .map(ToString::to_string)
            .collect();

        let mut unexpected: Vec<String> = self
            .named
            .keys()
            .filter(|name| !declared.contains(&ParamRef::Named((*name).clone())))
            .map(|name| format!(":{name}"))
            .collect();
        unexpected.extend(
            (1..=self.positional.len())
                .filter(|index| !declared.contains(&ParamRef::Positional(*index)))
                .map(|index| format!("?{index}")),
        );

        if missing.is_empty() && unexpected.is_empty() {
            return Ok(());
        }
        Err(RepoError::ParameterMismatch {
            query: query.to_string(),
            missing,
            unexpected,
        })
    }
}

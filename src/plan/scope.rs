//! Variable scope for one plan invocation
//!
//! Scopes are persistent: binding a name returns a new scope and leaves the
//! original untouched, so a lambda body or a later step never leaks bindings
//! back into a sibling. Bindings keep the order they were made in; rebinding
//! a name replaces its value in place.

use super::value::PlanValue;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: Arc<Vec<(String, Arc<PlanValue>)>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope seeded with a plan's parameters
    pub fn from_params(params: impl IntoIterator<Item = (String, PlanValue)>) -> Self {
        params
            .into_iter()
            .fold(Self::new(), |scope, (name, value)| scope.with(name, value))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|(bound, _)| bound == name)
    }

    pub fn get(&self, name: &str) -> Option<&PlanValue> {
        self.position(name).map(|i| self.vars[i].1.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// This scope plus one binding
    #[must_use]
    pub fn with(&self, name: impl Into<String>, value: PlanValue) -> Scope {
        let name = name.into();
        let mut vars = (*self.vars).clone();
        match self.position(&name) {
            Some(i) => vars[i].1 = Arc::new(value),
            None => vars.push((name, Arc::new(value))),
        }
        Scope {
            vars: Arc::new(vars),
        }
    }

    /// Bound names in binding order
    pub fn names(&self) -> Vec<&str> {
        self.vars.iter().map(|(name, _)| name.as_str()).collect()
    }
}

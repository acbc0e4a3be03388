// Evaluation scope for expressions.

use std::collections::HashMap;
use std::sync::Arc;

use super::values::Value;

/// Bindings with an optional parent scope. Lambda calls push a child
/// scope over the captured one.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    bindings: HashMap<String, Value>,
    parent: Option<Arc<Environment>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: Arc<Environment>) -> Self {
        Environment {
            bindings: HashMap::new(),
            parent: Some(parent),
        }
    }

    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    /// Look up a name here or in any parent scope.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        match self.bindings.get(name) {
            Some(value) => Some(value),
            None => self.parent.as_deref().and_then(|p| p.lookup(name)),
        }
    }

    /// Define every entry of an object value as a binding.
    pub fn define_all<'a>(&mut self, entries: impl IntoIterator<Item = (&'a String, &'a Value)>) {
        for (key, value) in entries {
            self.bindings.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_scope_shadows_parent() {
        let mut parent = Environment::new();
        parent.define("x", Value::Number(1.0));
        parent.define("y", Value::Number(2.0));
        let mut child = Environment::with_parent(Arc::new(parent));
        child.define("x", Value::Number(10.0));
        assert_eq!(child.lookup("x"), Some(&Value::Number(10.0)));
        assert_eq!(child.lookup("y"), Some(&Value::Number(2.0)));
        assert_eq!(child.lookup("z"), None);
    }
}

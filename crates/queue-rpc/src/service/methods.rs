//! Local method table.
//!
//! Names are matched exactly. The table is filled before the node starts
//! and read-only afterwards, so the dispatcher shares it behind an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::ports::MethodHandler;

/// Method name to handler
#[derive(Default, Clone)]
pub struct MethodTable {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    ///
    /// Returns true if a handler was replaced.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> bool
    where
        H: MethodHandler + 'static,
    {
        self.handlers
            .insert(name.into(), Arc::new(handler))
            .is_some()
    }

    /// Register an already shared handler
    pub fn register_arc(&mut self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) -> bool {
        self.handlers.insert(name.into(), handler).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}

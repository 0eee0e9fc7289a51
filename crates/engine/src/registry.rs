//! Handler registry: maps the `handler` name on a task node to the object
//! that executes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nodes::builtin::{EchoHandler, ECHO};
use nodes::NodeHandler;

use crate::models::Graph;
use crate::EngineError;

/// Explicit, host-populated map of handler name to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ECHO, EchoHandler);
        registry
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, handler: impl NodeHandler + 'static) -> &mut Self {
        self.register_arc(name, Arc::new(handler))
    }

    /// Register a handler that is shared with the caller (e.g. a mock the
    /// test inspects afterwards).
    pub fn register_arc(&mut self, name: impl Into<String>, handler: Arc<dyn NodeHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeHandler>> {
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

    /// Look up the handler of every task node in `graph`.
    pub fn resolve(&self, graph: &Graph) -> Result<HashMap<String, Arc<dyn NodeHandler>>, EngineError> {
        let mut resolved = HashMap::new();
        for node in graph.nodes.iter().filter(|n| !n.is_structural()) {
            let name = node
                .handler
                .as_deref()
                .ok_or_else(|| EngineError::MissingHandler(node.id.clone()))?;
            let handler = self.get(name).ok_or_else(|| EngineError::UnknownHandler {
                node_id: node.id.clone(),
                handler: name.to_owned(),
            })?;
            resolved.insert(node.id.clone(), handler);
        }
        Ok(resolved)
    }
}

//! Method path parsing and the callable table

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};

use super::register_builtins;

/// A registered task entry point
///
/// Receives the task's positional arguments and the writer that stands in
/// for its standard output. Returning `Err` marks the task `Failed`.
pub type Callable =
    Arc<dyn Fn(&[Value], &mut dyn Write) -> anyhow::Result<()> + Send + Sync + 'static>;

// ─────────────────────────────────────────────────────────────────
// Method Path
// ─────────────────────────────────────────────────────────────────

/// A `module.attribute` reference, split on the last dot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodPath {
    module: String,
    attribute: String,
}

impl MethodPath {
    /// Parse and validate a dotted method path
    pub fn parse(path: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidMethodPath {
            method_path: path.to_string(),
            reason: reason.to_string(),
        };

        let (module, attribute) = path
            .rsplit_once('.')
            .ok_or_else(|| invalid("expected 'module.attribute'"))?;

        if module.is_empty() || attribute.is_empty() {
            return Err(invalid("module and attribute must be non-empty"));
        }
        if module.split('.').any(|part| !is_identifier(part)) || !is_identifier(attribute) {
            return Err(invalid("segments must be identifiers"));
        }

        Ok(Self {
            module: module.to_string(),
            attribute: attribute.to_string(),
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }
}

impl fmt::Display for MethodPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.attribute)
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ─────────────────────────────────────────────────────────────────
// Callable Registry
// ─────────────────────────────────────────────────────────────────

/// Table of method paths to callables, fixed after startup
#[derive(Default)]
pub struct CallableRegistry {
    callables: BTreeMap<MethodPath, Callable>,
}

impl CallableRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in callables
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtins(&mut registry);
        registry
    }

    /// Register a callable under a method path
    ///
    /// Fails on malformed or already registered paths.
    pub fn register<F>(&mut self, path: &str, callable: F) -> Result<()>
    where
        F: Fn(&[Value], &mut dyn Write) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let method_path = MethodPath::parse(path)?;
        if self.callables.contains_key(&method_path) {
            return Err(Error::InvalidMethodPath {
                method_path: path.to_string(),
                reason: "already registered".to_string(),
            });
        }

        tracing::debug!(method_path = %method_path, "Callable registered");
        self.callables.insert(method_path, Arc::new(callable));
        Ok(())
    }

    /// Look up the callable for a method path
    pub fn resolve(&self, path: &str) -> Result<Callable> {
        let method_path = MethodPath::parse(path)?;
        self.callables
            .get(&method_path)
            .cloned()
            .ok_or_else(|| Error::UnknownMethod {
                method_path: path.to_string(),
            })
    }

    /// Check whether a method path is registered
    pub fn contains(&self, path: &str) -> bool {
        MethodPath::parse(path)
            .map(|p| self.callables.contains_key(&p))
            .unwrap_or(false)
    }

    /// All registered method paths, sorted
    pub fn method_paths(&self) -> Vec<String> {
        self.callables.keys().map(|p| p.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.callables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callables.is_empty()
    }
}

impl fmt::Debug for CallableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableRegistry")
            .field("method_paths", &self.method_paths())
            .finish()
    }
}

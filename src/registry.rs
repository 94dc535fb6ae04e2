//! Name-indexed registries for tools and edge conditions.
//!
//! A serialized graph references tools and conditions by *name*; the
//! registries are the only mechanism that turns those names back into
//! callable units, which is what lets graph definitions travel through
//! persistence.
//!
//! Registration happens once, at startup, through a builder; the built
//! registry is frozen and shared behind an `Arc`. Re-registering a name is
//! an error rather than a silent overwrite, and lookups of unknown names
//! fail with a typed error the coordinator maps to a client-facing 400.
//!
//! # Examples
//!
//! ```rust
//! use flowgraph::registry::ToolRegistry;
//! use flowgraph::node::{tool_fn, ToolMetadata};
//!
//! let registry = ToolRegistry::builder()
//!     .register(
//!         "echo",
//!         tool_fn(|state| async move { Ok(state) }),
//!         ToolMetadata::described("returns the state unchanged"),
//!     )
//!     .unwrap()
//!     .build();
//!
//! assert!(registry.contains("echo"));
//! assert!(registry.get("nope").is_err());
//! ```

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::graphs::edges::EdgeCondition;
use crate::node::{Tool, ToolMetadata};

/// Errors raised by registry construction and lookup.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    /// A tool name was registered twice.
    #[error("tool '{name}' is already registered")]
    #[diagnostic(
        code(flowgraph::registry::tool_already_registered),
        help("Tool names are unique; pick a different name or drop the duplicate registration.")
    )]
    ToolAlreadyRegistered { name: String },

    /// A tool name was looked up but never registered.
    #[error("tool '{name}' not found; available: {available}")]
    #[diagnostic(
        code(flowgraph::registry::tool_not_found),
        help("Register the tool before building graphs that reference it.")
    )]
    ToolNotFound { name: String, available: String },

    /// A condition name was registered twice.
    #[error("condition '{name}' is already registered")]
    #[diagnostic(code(flowgraph::registry::condition_already_registered))]
    ConditionAlreadyRegistered { name: String },

    /// A condition name was looked up but never registered.
    #[error("condition '{name}' not found; available: {available}")]
    #[diagnostic(
        code(flowgraph::registry::condition_not_found),
        help("Register the named condition before building graphs that reference it.")
    )]
    ConditionNotFound { name: String, available: String },
}

fn joined_names<'a>(names: impl Iterator<Item = &'a String>) -> String {
    let mut sorted: Vec<&str> = names.map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(", ")
}

/// Frozen name → tool table.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<FxHashMap<String, RegisteredTool>>,
}

#[derive(Clone, Debug)]
struct RegisteredTool {
    tool: Arc<dyn Tool>,
    metadata: ToolMetadata,
}

impl ToolRegistry {
    /// Start registering tools.
    #[must_use]
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder {
            tools: FxHashMap::default(),
        }
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        self.tools
            .get(name)
            .map(|entry| Arc::clone(&entry.tool))
            .ok_or_else(|| RegistryError::ToolNotFound {
                name: name.to_string(),
                available: joined_names(self.tools.keys()),
            })
    }

    /// Look up a tool's metadata by name.
    pub fn metadata(&self, name: &str) -> Result<&ToolMetadata, RegistryError> {
        self.tools
            .get(name)
            .map(|entry| &entry.metadata)
            .ok_or_else(|| RegistryError::ToolNotFound {
                name: name.to_string(),
                available: joined_names(self.tools.keys()),
            })
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

/// Accumulates registrations before freezing into a [`ToolRegistry`].
#[derive(Debug)]
pub struct ToolRegistryBuilder {
    tools: FxHashMap<String, RegisteredTool>,
}

impl ToolRegistryBuilder {
    /// Register `tool` under `name`.
    ///
    /// Registration is idempotent per name: re-registering the *same*
    /// callable is a no-op, while a different callable under a taken name
    /// fails.
    pub fn register(
        mut self,
        name: impl Into<String>,
        tool: Arc<dyn Tool>,
        metadata: ToolMetadata,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        if let Some(existing) = self.tools.get(&name) {
            if Arc::ptr_eq(&existing.tool, &tool) {
                return Ok(self);
            }
            return Err(RegistryError::ToolAlreadyRegistered { name });
        }
        self.tools.insert(name, RegisteredTool { tool, metadata });
        Ok(self)
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            tools: Arc::new(self.tools),
        }
    }
}

/// Frozen name → edge-condition table, the serialization-side counterpart of
/// [`ToolRegistry`]: a wire-format edge carries a condition *name*, resolved
/// here at graph-build time.
#[derive(Clone)]
pub struct ConditionRegistry {
    conditions: Arc<FxHashMap<String, Arc<dyn EdgeCondition>>>,
}

impl ConditionRegistry {
    /// Start registering conditions.
    #[must_use]
    pub fn builder() -> ConditionRegistryBuilder {
        ConditionRegistryBuilder {
            conditions: FxHashMap::default(),
        }
    }

    /// An empty registry, for graphs whose edges are all unconditional.
    #[must_use]
    pub fn empty() -> Self {
        Self::builder().build()
    }

    /// Look up a condition by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn EdgeCondition>, RegistryError> {
        self.conditions
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| RegistryError::ConditionNotFound {
                name: name.to_string(),
                available: joined_names(self.conditions.keys()),
            })
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.conditions.contains_key(name)
    }

    /// Registered condition names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.conditions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionRegistry")
            .field("conditions", &self.names())
            .finish()
    }
}

/// Accumulates registrations before freezing into a [`ConditionRegistry`].
#[derive(Debug)]
pub struct ConditionRegistryBuilder {
    conditions: FxHashMap<String, Arc<dyn EdgeCondition>>,
}

impl ConditionRegistryBuilder {
    /// Register `condition` under `name`. Idempotent for the same callable,
    /// an error for a different one.
    pub fn register(
        mut self,
        name: impl Into<String>,
        condition: Arc<dyn EdgeCondition>,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        if let Some(existing) = self.conditions.get(&name) {
            if Arc::ptr_eq(existing, &condition) {
                return Ok(self);
            }
            return Err(RegistryError::ConditionAlreadyRegistered { name });
        }
        self.conditions.insert(name, condition);
        Ok(self)
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> ConditionRegistry {
        ConditionRegistry {
            conditions: Arc::new(self.conditions),
        }
    }
}

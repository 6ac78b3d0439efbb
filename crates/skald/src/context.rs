//! The compiler context: configuration and shared lookups threaded through
//! parser and resolver by handle.
//!
//! There is deliberately no process-wide state. A context can drive many
//! compilations; each gets its own parser/resolver state and a snapshot of
//! the context's class registry. Globals are behind a lock because REPL mode
//! is allowed to define new ones between compilations.

use std::sync::Mutex;

use ahash::AHashMap;

use crate::{classes::ClassMap, value::Value};

/// Feature switches and shared lookups for compilation.
#[derive(Debug, Default)]
pub struct CompilerContext {
    /// Fold constant expressions at resolve time.
    pub const_folding: bool,
    /// Treat every function as async (test switch for exercising the
    /// continuation machinery).
    pub test_async: bool,
    /// REPL mode: unknown top-level variables become globals, and script
    /// classes attach their inner classes at the top level.
    pub repl_mode: bool,
    /// Whether checkpoint/restore operations are available to scripts; they
    /// are async sources when present.
    pub checkpointing: bool,
    /// Minimum scale for decimal division during constant folding.
    pub min_scale: u32,
    /// Known packages, for class-path disambiguation during parsing.
    packages: Vec<String>,
    /// Classes compiled earlier or imported from the host. Each compilation
    /// starts from a snapshot of this registry.
    pub classes: ClassMap,
    /// Global variables. Mutated only in REPL mode; the lock makes
    /// concurrent compilations see a consistent snapshot.
    globals: Mutex<AHashMap<String, Value>>,
}

impl CompilerContext {
    pub fn new() -> Self {
        Self {
            const_folding: true,
            min_scale: 10,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_test_async(mut self, test_async: bool) -> Self {
        self.test_async = test_async;
        self
    }

    #[must_use]
    pub fn with_repl_mode(mut self, repl_mode: bool) -> Self {
        self.repl_mode = repl_mode;
        self
    }

    #[must_use]
    pub fn with_const_folding(mut self, const_folding: bool) -> Self {
        self.const_folding = const_folding;
        self
    }

    #[must_use]
    pub fn with_min_scale(mut self, min_scale: u32) -> Self {
        self.min_scale = min_scale;
        self
    }

    #[must_use]
    pub fn with_package(mut self, name: impl Into<String>) -> Self {
        self.packages.push(name.into());
        self
    }

    /// Whether a package with this name exists. Consulted by the parser when
    /// deciding if a dotted path is a packaged class name.
    pub fn package_exists(&self, name: &str) -> bool {
        self.packages.iter().any(|p| p == name || p.starts_with(&format!("{name}.")))
    }

    /// Defines or replaces a global. REPL use only.
    pub fn define_global(&self, name: impl Into<String>, value: Value) {
        self.globals
            .lock()
            .expect("globals lock poisoned")
            .insert(name.into(), value);
    }

    pub fn global_exists(&self, name: &str) -> bool {
        self.globals.lock().expect("globals lock poisoned").contains_key(name)
    }

    /// Snapshot of the current global names.
    pub fn global_names(&self) -> Vec<String> {
        self.globals
            .lock()
            .expect("globals lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

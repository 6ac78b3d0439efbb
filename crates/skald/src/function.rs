//! Function descriptors.
//!
//! A descriptor carries everything a call site or the code generator needs to
//! know about a function without owning its body: parameter shapes, the
//! async flag, the paired wrapper, and the implicit heap-local parameters
//! added by closure capture. Descriptors live in a [`FunMap`] arena and are
//! referred to by [`FunId`] so call expressions, class methods and wrapper
//! pairings never form ownership cycles.

use ahash::AHashSet;
use indexmap::IndexMap;

use crate::{ast::VarDeclId, types::Type};

/// Index of a function descriptor in the [`FunMap`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct FunId(u32);

impl FunId {
    pub fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("invalid function id"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The deterministic decoration applied to a function name to form its
/// wrapper's name.
pub fn wrapper_name(name: &str) -> String {
    format!("$w${name}")
}

/// The synthesized initialiser method name for classes.
pub const INIT_METHOD: &str = "$init";

/// Compile-time metadata for one function: a user function, closure, class
/// method, synthesized initialiser, wrapper, or built-in.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    pub return_type: Type,
    pub param_names: Vec<String>,
    pub param_types: Vec<Type>,
    /// Number of parameters without default initialisers.
    pub mandatory_count: usize,
    /// Names of parameters without default initialisers.
    pub mandatory_params: AHashSet<String>,
    pub is_static: bool,
    pub is_final: bool,
    pub is_init_method: bool,
    pub is_wrapper: bool,
    pub is_builtin: bool,
    /// Async state machine: `None` = not yet determined, then `Some(true)` or
    /// `Some(false)`. Once async, a function never becomes non-async again.
    is_async: Option<bool>,
    /// Packaged name of the declaring class, when this is a method.
    pub implementing_class: Option<String>,
    /// The internal method name the code generator emits for this function.
    pub implementing_method: String,
    /// Name of the paired wrapper method (`wrapper_name(implementing_method)`).
    pub wrapper_method: String,
    /// The paired wrapper descriptor. Every user function has exactly one.
    pub wrapper: Option<FunId>,
    /// Whether calls must pass source/offset location arguments.
    pub needs_location: bool,
    /// Implicit heap-local parameters in the order they were discovered.
    /// Callers pass the matching heap locals through at every invocation.
    pub heap_locals: IndexMap<String, VarDeclId>,
}

impl FunctionDescriptor {
    pub fn new(name: impl Into<String>, return_type: Type) -> Self {
        let name = name.into();
        let implementing_method = name.clone();
        let wrapper_method = wrapper_name(&implementing_method);
        Self {
            name,
            return_type,
            param_names: Vec::new(),
            param_types: Vec::new(),
            mandatory_count: 0,
            mandatory_params: AHashSet::new(),
            is_static: false,
            is_final: false,
            is_init_method: false,
            is_wrapper: false,
            is_builtin: false,
            is_async: None,
            implementing_class: None,
            implementing_method,
            wrapper_method,
            wrapper: None,
            needs_location: false,
            heap_locals: IndexMap::new(),
        }
    }

    pub fn param_count(&self) -> usize {
        self.param_names.len()
    }

    pub fn is_async(&self) -> bool {
        self.is_async == Some(true)
    }

    pub fn async_known(&self) -> bool {
        self.is_async.is_some()
    }

    /// Transitions the async flag to `Async`. Returns true if this changed
    /// the state (used by the fixed-point propagation to detect progress).
    pub fn mark_async(&mut self) -> bool {
        if self.is_async == Some(true) {
            return false;
        }
        self.is_async = Some(true);
        true
    }

    /// Finalizes the flag as `NotAsync` if it is still undetermined.
    pub fn finalize_async(&mut self) {
        if self.is_async.is_none() {
            self.is_async = Some(false);
        }
    }

    /// Pre-sets the flag for built-ins whose asyncness is declared, not
    /// derived.
    pub fn with_async(mut self, is_async: bool) -> Self {
        self.is_async = Some(is_async);
        self
    }
}

/// Arena of function descriptors for one compilation.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FunMap(Vec<FunctionDescriptor>);

impl FunMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, descriptor: FunctionDescriptor) -> FunId {
        let id = FunId::new(self.0.len());
        self.0.push(descriptor);
        id
    }

    pub fn get(&self, id: FunId) -> &FunctionDescriptor {
        &self.0[id.index()]
    }

    pub fn get_mut(&mut self, id: FunId) -> &mut FunctionDescriptor {
        &mut self.0[id.index()]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = FunId> {
        (0..self.0.len()).map(FunId::new)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FunId, &FunctionDescriptor)> {
        self.0.iter().enumerate().map(|(i, d)| (FunId::new(i), d))
    }

    /// Discards descriptors added after `len`. Used when a speculative parse
    /// is rolled back.
    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }
}

//! Built-in function registry.
//!
//! Built-ins come in two flavors: global functions (`sleep`, `sprintf`, ...)
//! and methods looked up by `(receiver type, name)`. The resolver links
//! identifier and method-call nodes to these descriptors; the async flags
//! here are the leaves the whole-program async propagation starts from.

use ahash::{AHashMap, AHashSet};

use crate::{
    function::{FunId, FunMap, FunctionDescriptor},
    types::Type,
};

/// Receiver category for built-in method lookup. Methods registered under
/// `Any` are available on every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize, serde::Deserialize)]
pub enum Receiver {
    Any,
    String,
    List,
    Map,
    Iterator,
}

impl Receiver {
    /// The lookup categories for a static type, most specific first.
    fn categories(ty: &Type) -> &'static [Receiver] {
        match ty {
            Type::String => &[Receiver::String, Receiver::Any],
            Type::List | Type::Array(_) => &[Receiver::List, Receiver::Iterator, Receiver::Any],
            Type::Map => &[Receiver::Map, Receiver::Iterator, Receiver::Any],
            Type::Iterator => &[Receiver::Iterator, Receiver::Any],
            Type::Any => &[
                Receiver::Any,
                Receiver::String,
                Receiver::List,
                Receiver::Map,
                Receiver::Iterator,
            ],
            _ => &[Receiver::Any],
        }
    }
}

/// Registry of built-in functions and methods.
#[derive(Debug, Default)]
pub struct Builtins {
    global: AHashMap<String, FunId>,
    methods: AHashMap<(Receiver, String), FunId>,
    any_method_names: AHashSet<String>,
}

impl Builtins {
    /// Registers every built-in descriptor into `funs` and returns the
    /// registry for name lookup.
    pub fn register(funs: &mut FunMap) -> Self {
        let mut b = Self::default();

        // Global functions
        b.global_fn(funs, "timestamp", Type::Long, &[], 0, false);
        b.global_fn(funs, "nanoTime", Type::Long, &[], 0, false);
        b.global_fn(
            funs,
            "sprintf",
            Type::String,
            &[("format", Type::String), ("args", Type::Any)],
            1,
            false,
        );
        // sleep suspends the caller: the canonical async source
        b.global_fn(
            funs,
            "sleep",
            Type::Any,
            &[("timeMs", Type::Long), ("result", Type::Any)],
            1,
            true,
        );
        b.global_fn(funs, "checkpoint", Type::Any, &[("result", Type::Any)], 0, true);

        // Methods on every value
        b.method(funs, Receiver::Any, "toString", Type::String, &[], 0, false);
        b.method(funs, Receiver::Any, "className", Type::String, &[], 0, false);
        b.method(funs, Receiver::Any, "size", Type::Int, &[], 0, false);

        // String methods
        b.method(funs, Receiver::String, "length", Type::Int, &[], 0, false);
        b.method(funs, Receiver::String, "toUpperCase", Type::String, &[], 0, false);
        b.method(funs, Receiver::String, "toLowerCase", Type::String, &[], 0, false);
        b.method(
            funs,
            Receiver::String,
            "substring",
            Type::String,
            &[("start", Type::Int), ("end", Type::Int)],
            1,
            false,
        );
        b.method(
            funs,
            Receiver::String,
            "split",
            Type::List,
            &[("regex", Type::String), ("modifiers", Type::String)],
            0,
            false,
        );
        b.method(funs, Receiver::String, "lines", Type::List, &[], 0, false);
        b.method(funs, Receiver::String, "asNum", Type::Long, &[("base", Type::Int)], 0, false);

        // Collection methods; the closure-taking ones are async because the
        // closure may itself suspend.
        b.method(
            funs,
            Receiver::Iterator,
            "each",
            Type::Any,
            &[("action", Type::Function)],
            0,
            true,
        );
        b.method(
            funs,
            Receiver::Iterator,
            "map",
            Type::Iterator,
            &[("mapper", Type::Function)],
            0,
            true,
        );
        b.method(
            funs,
            Receiver::Iterator,
            "filter",
            Type::Iterator,
            &[("predicate", Type::Function)],
            0,
            true,
        );
        b.method(funs, Receiver::Iterator, "collect", Type::List, &[], 0, true);
        b.method(
            funs,
            Receiver::Iterator,
            "sort",
            Type::List,
            &[("comparator", Type::Function)],
            0,
            true,
        );
        b.method(funs, Receiver::Iterator, "sum", Type::Any, &[], 0, false);
        b.method(funs, Receiver::Iterator, "avg", Type::Any, &[], 0, false);
        b.method(
            funs,
            Receiver::Iterator,
            "join",
            Type::String,
            &[("separator", Type::String)],
            0,
            false,
        );
        b.method(
            funs,
            Receiver::List,
            "add",
            Type::List,
            &[("element", Type::Any)],
            1,
            false,
        );
        b.method(
            funs,
            Receiver::List,
            "contains",
            Type::Bool,
            &[("element", Type::Any)],
            1,
            false,
        );
        b.method(
            funs,
            Receiver::List,
            "subList",
            Type::List,
            &[("start", Type::Int), ("end", Type::Int)],
            1,
            false,
        );
        b.method(
            funs,
            Receiver::Map,
            "remove",
            Type::Any,
            &[("key", Type::String)],
            1,
            false,
        );
        b.method(funs, Receiver::Map, "keys", Type::List, &[], 0, false);
        b.method(funs, Receiver::Map, "values", Type::List, &[], 0, false);

        b
    }

    fn descriptor(
        name: &str,
        return_type: Type,
        params: &[(&str, Type)],
        mandatory: usize,
        is_async: bool,
    ) -> FunctionDescriptor {
        let mut desc = FunctionDescriptor::new(name, return_type).with_async(is_async);
        desc.is_builtin = true;
        desc.is_final = true;
        desc.param_names = params.iter().map(|(n, _)| (*n).to_string()).collect();
        desc.param_types = params.iter().map(|(_, t)| t.clone()).collect();
        desc.mandatory_count = mandatory;
        desc.mandatory_params = desc.param_names.iter().take(mandatory).cloned().collect();
        desc
    }

    fn global_fn(
        &mut self,
        funs: &mut FunMap,
        name: &str,
        return_type: Type,
        params: &[(&str, Type)],
        mandatory: usize,
        is_async: bool,
    ) {
        let id = funs.add(Self::descriptor(name, return_type, params, mandatory, is_async));
        self.global.insert(name.to_string(), id);
    }

    fn method(
        &mut self,
        funs: &mut FunMap,
        receiver: Receiver,
        name: &str,
        return_type: Type,
        params: &[(&str, Type)],
        mandatory: usize,
        is_async: bool,
    ) {
        let id = funs.add(Self::descriptor(name, return_type, params, mandatory, is_async));
        self.methods.insert((receiver, name.to_string()), id);
        if receiver == Receiver::Any {
            self.any_method_names.insert(name.to_string());
        }
    }

    /// Looks up a global built-in function by name.
    pub fn global_lookup(&self, name: &str) -> Option<FunId> {
        self.global.get(name).copied()
    }

    /// Looks up a built-in method for a receiver of the given static type.
    pub fn method_lookup(&self, ty: &Type, name: &str) -> Option<FunId> {
        Receiver::categories(ty)
            .iter()
            .find_map(|r| self.methods.get(&(*r, name.to_string())).copied())
    }

    /// Whether `name` is a method available on `any`. Class fields must not
    /// shadow these.
    pub fn is_any_method(&self, name: &str) -> bool {
        self.any_method_names.contains(name)
    }
}

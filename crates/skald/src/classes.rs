//! Class descriptors and the class registry.
//!
//! Base classes and inner classes form a graph, so descriptors live in a
//! registry keyed by packaged name and refer to each other through
//! [`ClassId`] indices, never through owning references. The circular
//! `extends` check is a walk up the base chain with cycle detection.

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{function::FunId, types::Type};

/// Index of a class descriptor in the [`ClassMap`] registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ClassId(u32);

impl ClassId {
    pub fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("invalid class id"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A declared field with its type and whether it must be supplied at
/// construction time (no initialiser means mandatory).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FieldInfo {
    pub ty: Type,
    pub mandatory: bool,
    pub is_final: bool,
}

/// Compile-time metadata for one class.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClassDescriptor {
    /// Simple name, e.g. `Inner`.
    pub name: String,
    /// Declaring package, e.g. `a.b.c`. Empty for the default package.
    pub package_name: String,
    /// Fully qualified name including enclosing classes, e.g. `a.b.c.Outer.Inner`.
    pub packaged_name: String,
    pub base: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    /// Declared fields in source order. Does not include inherited fields.
    pub fields: IndexMap<String, FieldInfo>,
    /// Declared methods (and the script-main function for script classes).
    pub methods: AHashMap<String, FunId>,
    pub inner_classes: Vec<ClassId>,
    /// Synthesized initialiser taking one parameter per mandatory field.
    pub init_method: Option<FunId>,
    pub is_interface: bool,
    /// Script classes host a script-main method and resolve globals.
    pub is_script_class: bool,
}

impl ClassDescriptor {
    pub fn new(name: impl Into<String>, package_name: impl Into<String>, packaged_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package_name: package_name.into(),
            packaged_name: packaged_name.into(),
            base: None,
            interfaces: Vec::new(),
            fields: IndexMap::new(),
            methods: AHashMap::new(),
            inner_classes: Vec::new(),
            init_method: None,
            is_interface: false,
            is_script_class: false,
        }
    }
}

/// The registry of all classes visible to a compilation: imported ones plus
/// the ones declared by the unit being compiled.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ClassMap {
    classes: Vec<ClassDescriptor>,
    by_name: AHashMap<String, ClassId>,
}

impl ClassMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor. Returns `None` if a class with the same
    /// packaged name already exists.
    pub fn add(&mut self, descriptor: ClassDescriptor) -> Option<ClassId> {
        if self.by_name.contains_key(&descriptor.packaged_name) {
            return None;
        }
        let id = ClassId::new(self.classes.len());
        self.by_name.insert(descriptor.packaged_name.clone(), id);
        self.classes.push(descriptor);
        Some(id)
    }

    pub fn get(&self, id: ClassId) -> &ClassDescriptor {
        &self.classes[id.index()]
    }

    pub fn get_mut(&mut self, id: ClassId) -> &mut ClassDescriptor {
        &mut self.classes[id.index()]
    }

    pub fn lookup(&self, packaged_name: &str) -> Option<ClassId> {
        self.by_name.get(packaged_name).copied()
    }

    /// Registers an extra name for an existing class (REPL mode attaches
    /// script-inner classes at the top level). Existing names win.
    pub fn add_alias(&mut self, name: String, id: ClassId) {
        self.by_name.entry(name).or_insert(id);
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = ClassId> {
        (0..self.classes.len()).map(ClassId::new)
    }

    /// Whether `child` is `ancestor` or transitively extends/implements it.
    pub fn is_subclass(&self, child: ClassId, ancestor: ClassId) -> bool {
        if child == ancestor {
            return true;
        }
        let mut seen = vec![false; self.classes.len()];
        let mut stack = vec![child];
        while let Some(id) = stack.pop() {
            if id == ancestor {
                return true;
            }
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            let desc = self.get(id);
            stack.extend(desc.base);
            stack.extend(desc.interfaces.iter().copied());
        }
        false
    }

    /// Whether the two classes are in the same hierarchy in either direction.
    pub fn is_related(&self, a: ClassId, b: ClassId) -> bool {
        self.is_subclass(a, b) || self.is_subclass(b, a)
    }

    /// Detects a cycle on the base-class chain starting at `id`. A chain
    /// longer than the registry is necessarily cyclic.
    pub fn has_circular_extends(&self, id: ClassId) -> bool {
        let mut current = self.get(id).base;
        let mut steps = 0usize;
        while let Some(cid) = current {
            if cid == id {
                return true;
            }
            steps += 1;
            if steps > self.classes.len() {
                return true;
            }
            current = self.get(cid).base;
        }
        false
    }

    /// Looks up a field on `id` or any of its base classes.
    pub fn field_lookup(&self, id: ClassId, name: &str) -> Option<(ClassId, FieldInfo)> {
        let mut current = Some(id);
        let mut remaining = self.classes.len() + 1;
        while let Some(cid) = current {
            if remaining == 0 {
                return None; // circular extends reported elsewhere
            }
            remaining -= 1;
            if let Some(info) = self.get(cid).fields.get(name) {
                return Some((cid, info.clone()));
            }
            current = self.get(cid).base;
        }
        None
    }

    /// Looks up a method on `id` or any of its base classes.
    pub fn method_lookup(&self, id: ClassId, name: &str) -> Option<FunId> {
        let mut current = Some(id);
        let mut remaining = self.classes.len() + 1;
        while let Some(cid) = current {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            if let Some(fun) = self.get(cid).methods.get(name) {
                return Some(*fun);
            }
            current = self.get(cid).base;
        }
        None
    }

    /// All mandatory fields, base-class fields first, in declaration order.
    pub fn mandatory_fields(&self, id: ClassId) -> Vec<(String, Type)> {
        let mut result = Vec::new();
        if let Some(base) = self.get(id).base {
            result = self.mandatory_fields(base);
        }
        for (name, info) in &self.get(id).fields {
            if info.mandatory {
                result.push((name.clone(), info.ty.clone()));
            }
        }
        result
    }

    /// All fields (mandatory and optional), base-class fields first.
    pub fn all_fields(&self, id: ClassId) -> Vec<(String, FieldInfo)> {
        let mut result = Vec::new();
        if let Some(base) = self.get(id).base {
            result = self.all_fields(base);
        }
        for (name, info) in &self.get(id).fields {
            result.push((name.clone(), info.clone()));
        }
        result
    }

    /// Rolls the registry back to `len` entries. Used when a speculative
    /// parse that registered classes is abandoned.
    pub fn truncate(&mut self, len: usize) {
        while self.classes.len() > len {
            let desc = self.classes.pop().expect("length checked");
            self.by_name.remove(&desc.packaged_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(map: &mut ClassMap, name: &str, base: Option<ClassId>) -> ClassId {
        let mut desc = ClassDescriptor::new(name, "", name);
        desc.base = base;
        map.add(desc).unwrap()
    }

    #[test]
    fn subclass_walks_base_chain() {
        let mut map = ClassMap::new();
        let a = class(&mut map, "A", None);
        let b = class(&mut map, "B", Some(a));
        let c = class(&mut map, "C", Some(b));
        assert!(map.is_subclass(c, a));
        assert!(!map.is_subclass(a, c));
        assert!(map.is_related(a, c));
    }

    #[test]
    fn circular_extends_detected() {
        let mut map = ClassMap::new();
        let a = class(&mut map, "A", None);
        let b = class(&mut map, "B", Some(a));
        map.get_mut(a).base = Some(b);
        assert!(map.has_circular_extends(a));
        assert!(map.has_circular_extends(b));
    }

    #[test]
    fn duplicate_packaged_name_rejected() {
        let mut map = ClassMap::new();
        class(&mut map, "A", None);
        assert!(map.add(ClassDescriptor::new("A", "", "A")).is_none());
    }

    #[test]
    fn mandatory_fields_base_first() {
        let mut map = ClassMap::new();
        let a = class(&mut map, "A", None);
        map.get_mut(a).fields.insert(
            "x".into(),
            FieldInfo {
                ty: Type::Int,
                mandatory: true,
                is_final: false,
            },
        );
        let b = class(&mut map, "B", Some(a));
        map.get_mut(b).fields.insert(
            "y".into(),
            FieldInfo {
                ty: Type::String,
                mandatory: true,
                is_final: false,
            },
        );
        let fields = map.mandatory_fields(b);
        assert_eq!(fields[0].0, "x");
        assert_eq!(fields[1].0, "y");
    }
}

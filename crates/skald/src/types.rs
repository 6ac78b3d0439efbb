//! The type lattice.
//!
//! Types are cheap value objects. Class and instance types refer to their
//! descriptor through a [`ClassId`] into the class registry, so the lattice
//! itself never owns descriptor data and subtype questions take the registry
//! as a parameter.

use std::fmt;

use crate::{
    classes::{ClassId, ClassMap},
    token::TokenKind,
};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Type {
    Bool,
    Byte,
    Int,
    Long,
    Double,
    Decimal,
    String,
    Map,
    List,
    Iterator,
    Array(Box<Type>),
    /// The class itself used as a value (static access, `new`, type exprs).
    Class(ClassId),
    /// An instance of a user class.
    Instance(ClassId),
    Function,
    Any,
    /// Placeholder for `var` declarations whose initialiser has not been
    /// resolved yet. Must never survive resolution of the declaration.
    Unknown,
    /// A class name as written in source (possibly dotted), not yet linked to
    /// its descriptor. Resolved to `Instance`/`Class` before the enclosing
    /// statement is marked resolved.
    Named(String),
    /// Opaque regex matcher state owned by the runtime.
    Matcher,
}

/// Numeric promotion order: byte < int < long < double < decimal.
fn numeric_rank(ty: &Type) -> Option<u8> {
    match ty {
        Type::Byte => Some(0),
        Type::Int => Some(1),
        Type::Long => Some(2),
        Type::Double => Some(3),
        Type::Decimal => Some(4),
        _ => None,
    }
}

impl Type {
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Self::Bool | Self::Byte | Self::Int | Self::Long | Self::Double | Self::Decimal
        )
    }

    pub fn is_numeric(&self) -> bool {
        numeric_rank(self).is_some()
    }

    pub fn is_ref(&self) -> bool {
        !self.is_primitive() && !matches!(self, Self::Unknown)
    }

    /// The boxed form of this type. The managed-runtime box/unbox distinction
    /// collapses in this representation; kept so the code generator can ask.
    #[must_use]
    pub fn boxed(&self) -> Self {
        self.clone()
    }

    #[must_use]
    pub fn unboxed(&self) -> Self {
        self.clone()
    }

    pub fn array_element(&self) -> Option<&Type> {
        match self {
            Self::Array(elem) => Some(elem),
            _ => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Whether an explicit cast `(T)expr` or `expr as T` from `self` to
    /// `target` can succeed.
    pub fn is_castable_to(&self, target: &Type, classes: &ClassMap) -> bool {
        match (self, target) {
            (a, b) if a == b => true,
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Unknown | Self::Named(_), _) | (_, Self::Unknown | Self::Named(_)) => false,
            (a, b) if a.is_numeric() && b.is_numeric() => true,
            // Truthiness casts
            (_, Self::Bool) => true,
            // Stringification and parsing
            (a, Self::String) if a.is_numeric() => true,
            (Self::String, b) if b.is_numeric() => true,
            // Structural coercions the runtime supports
            (Self::Map, Self::Instance(_)) | (Self::Instance(_), Self::Map) => true,
            (Self::List, Self::Array(_)) | (Self::Array(_), Self::List) => true,
            (Self::Array(a), Self::Array(b)) => a.is_castable_to(b, classes),
            (Self::String, Self::Matcher) => true,
            // Up- and down-casts within a class hierarchy
            (Self::Instance(a), Self::Instance(b)) => classes.is_related(*a, *b),
            (Self::Class(a), Self::Class(b)) => classes.is_related(*a, *b),
            _ => false,
        }
    }

    /// Whether a value of type `other` can be stored into a slot of type
    /// `self` without an explicit cast.
    pub fn is_assignable_from(&self, other: &Type, classes: &ClassMap) -> bool {
        match (self, other) {
            (a, b) if a == b => true,
            (Self::Any, _) => true,
            (_, Self::Any) => true, // dynamic values convert at runtime
            (Self::Unknown | Self::Named(_), _) | (_, Self::Unknown | Self::Named(_)) => false,
            (a, b) if a.is_numeric() && b.is_numeric() => {
                numeric_rank(a) >= numeric_rank(b)
            }
            (Self::Bool, _) => true, // truthiness conversion
            (Self::String, b) if b.is_numeric() => false,
            (Self::Instance(a), Self::Instance(b)) => classes.is_subclass(*b, *a),
            (Self::Instance(_), Self::Map) => true, // via init wrapper coercion
            (Self::Array(a), Self::Array(b)) => a.is_assignable_from(b, classes),
            (Self::Array(_), Self::List) | (Self::List, Self::Array(_)) => true,
            (Self::Iterator, Self::List | Self::Map) => true,
            _ => false,
        }
    }

    /// Arithmetic result type for `left op right`.
    ///
    /// Strings promote for `+` (concatenation) and `*` (repetition); lists and
    /// maps absorb `+`; otherwise the result is the higher-ranked numeric
    /// operand. Comparison and logical operators do not come through here.
    pub fn result_type(left: &Type, op: TokenKind, right: &Type) -> Option<Type> {
        if matches!(op, TokenKind::Plus) {
            match (left, right) {
                (Type::String, _) => return Some(Type::String),
                (Type::List, _) => return Some(Type::List),
                (Type::Map, Type::Map | Type::Any) => return Some(Type::Map),
                _ => {}
            }
        }
        if matches!(op, TokenKind::Star) && *left == Type::String {
            return Some(Type::String);
        }
        if matches!(
            op,
            TokenKind::Ampersand | TokenKind::Pipe | TokenKind::Caret
        ) {
            return match (left, right) {
                (Type::Long, b) | (b, Type::Long) if b.is_numeric() || *b == Type::Any => Some(Type::Long),
                (a, b)
                    if matches!(a, Type::Byte | Type::Int | Type::Bool | Type::Any)
                        && matches!(b, Type::Byte | Type::Int | Type::Bool | Type::Any) =>
                {
                    Some(Type::Int)
                }
                _ => None,
            };
        }
        if matches!(
            op,
            TokenKind::ShiftLeft | TokenKind::ShiftRight | TokenKind::ShiftRightUnsigned
        ) {
            return match left {
                Type::Long => Some(Type::Long),
                Type::Byte | Type::Int | Type::Any => Some(Type::Int),
                _ => None,
            };
        }
        if *left == Type::Any || *right == Type::Any {
            return Some(Type::Any);
        }
        let (lr, rr) = (numeric_rank(left)?, numeric_rank(right)?);
        Some(if lr >= rr { left.clone() } else { right.clone() })
    }

    /// Human-readable name; instance and class types resolve their names via
    /// the registry.
    pub fn describe(&self, classes: &ClassMap) -> String {
        match self {
            Self::Array(elem) => format!("{}[]", elem.describe(classes)),
            Self::Class(id) => format!("Class<{}>", classes.get(*id).packaged_name),
            Self::Instance(id) => classes.get(*id).packaged_name.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "boolean",
            Self::Byte => "byte",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::Decimal => "Decimal",
            Self::String => "String",
            Self::Map => "Map",
            Self::List => "List",
            Self::Iterator => "Iterator",
            Self::Array(elem) => return write!(f, "{elem}[]"),
            Self::Class(_) => "Class",
            Self::Instance(_) => "Instance",
            Self::Function => "Function",
            Self::Any => "def",
            Self::Unknown => "unknown",
            Self::Named(name) => return f.write_str(name),
            Self::Matcher => "Matcher",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_promotion_follows_ladder() {
        assert_eq!(
            Type::result_type(&Type::Byte, TokenKind::Plus, &Type::Int),
            Some(Type::Int)
        );
        assert_eq!(
            Type::result_type(&Type::Long, TokenKind::Star, &Type::Double),
            Some(Type::Double)
        );
        assert_eq!(
            Type::result_type(&Type::Double, TokenKind::Minus, &Type::Decimal),
            Some(Type::Decimal)
        );
    }

    #[test]
    fn string_promotes_for_plus_and_star() {
        assert_eq!(
            Type::result_type(&Type::String, TokenKind::Plus, &Type::Int),
            Some(Type::String)
        );
        assert_eq!(
            Type::result_type(&Type::String, TokenKind::Star, &Type::Int),
            Some(Type::String)
        );
    }

    #[test]
    fn bitwise_limited_to_int_and_long() {
        assert_eq!(
            Type::result_type(&Type::Int, TokenKind::Ampersand, &Type::Long),
            Some(Type::Long)
        );
        assert_eq!(Type::result_type(&Type::Double, TokenKind::Pipe, &Type::Int), None);
    }

    #[test]
    fn assignability_widens_not_narrows() {
        let classes = ClassMap::new();
        assert!(Type::Long.is_assignable_from(&Type::Int, &classes));
        assert!(!Type::Int.is_assignable_from(&Type::Long, &classes));
        assert!(Type::Any.is_assignable_from(&Type::Map, &classes));
    }

    #[test]
    fn unknown_is_never_assignable() {
        let classes = ClassMap::new();
        assert!(!Type::Int.is_assignable_from(&Type::Unknown, &classes));
        assert!(!Type::Unknown.is_castable_to(&Type::Int, &classes));
    }
}

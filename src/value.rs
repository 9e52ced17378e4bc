//! Runtime value types for loxvm

use crate::object::Handle;

/// Runtime values
///
/// `Obj` refers to an object owned by the [`Heap`](crate::object::Heap).
/// Handles compare by identity; interning makes that content equality for
/// strings.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(Handle),
}

impl Value {
    /// `nil` and `false` are falsey; everything else is truthy.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Value::Obj(handle) => Some(*handle),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falsiness() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
    }

    #[test]
    fn test_equality_dispatches_on_variant() {
        assert_eq!(Value::Number(1.0), Value::Number(1.0));
        assert_ne!(Value::Number(1.0), Value::Bool(true));
        assert_ne!(Value::Nil, Value::Bool(false));
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_eq!(Value::Obj(Handle(3)), Value::Obj(Handle(3)));
        assert_ne!(Value::Obj(Handle(3)), Value::Obj(Handle(4)));
    }
}

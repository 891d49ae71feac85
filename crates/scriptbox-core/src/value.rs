//! Host-side value model mirrored by the guest interpreter.
//!
//! Conversions across the bridge always deep-copy; a `Value` never aliases
//! guest storage. Maps keep insertion order for iteration but compare
//! order-insensitively, matching the "insertion order not significant"
//! contract.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Integer(i64),
    /// UTF-8 string payload.
    String(String),
    Symbol(String),
    Array(Vec<Value>),
    /// Insertion-ordered key/value pairs. Keys are unique.
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn symbol(name: &str) -> Value {
        Value::Symbol(name.to_string())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Maximum nesting depth of this value (a scalar has depth 0).
    pub fn depth(&self) -> usize {
        match self {
            Value::Array(items) => 1 + items.iter().map(Value::depth).max().unwrap_or(0),
            Value::Map(pairs) => {
                1 + pairs
                    .iter()
                    .map(|(k, v)| k.depth().max(v.depth()))
                    .max()
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                // Order-insensitive pairwise lookup; keys are unique per side.
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.iter().any(|(bk, bv)| bk == k && bv == v))
            }
            _ => false,
        }
    }
}

impl Eq for Value {}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Symbol(s) => write!(f, ":{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} => {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_equality_ignores_order() {
        let a = Value::Map(vec![
            (Value::symbol("x"), Value::Integer(1)),
            (Value::symbol("y"), Value::Integer(2)),
        ]);
        let b = Value::Map(vec![
            (Value::symbol("y"), Value::Integer(2)),
            (Value::symbol("x"), Value::Integer(1)),
        ]);
        assert_eq!(a, b);

        let c = Value::Map(vec![(Value::symbol("x"), Value::Integer(3))]);
        assert_ne!(a, c);
    }

    #[test]
    fn depth_counts_nesting() {
        assert_eq!(Value::Integer(1).depth(), 0);
        assert_eq!(Value::Array(vec![Value::Nil]).depth(), 1);
        let nested = Value::Array(vec![Value::Array(vec![Value::Array(vec![])])]);
        assert_eq!(nested.depth(), 3);
        let map = Value::Map(vec![(Value::symbol("k"), Value::Array(vec![Value::Nil]))]);
        assert_eq!(map.depth(), 2);
    }

    #[test]
    fn display_is_readable() {
        let v = Value::Map(vec![(Value::symbol("n"), Value::Array(vec![1.into(), 2.into()]))]);
        assert_eq!(v.to_string(), "{:n => [1, 2]}");
    }

    #[test]
    fn serializes_round_trip_through_json() {
        let v = Value::Map(vec![
            (Value::symbol("items"), Value::Array(vec![1.into(), 2.into()])),
            (Value::String("note".to_string()), Value::Nil),
        ]);
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}

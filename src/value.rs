//! Plain engine values: the closed set of data kinds that can flow through
//! futures, be digested, and be stored in the memo database.
//!
//! Keeping the kinds closed (rather than accepting arbitrary user types)
//! means every value is serializable and has a well-defined structural
//! digest; anything unrepresentable goes through `digest::Node::Opaque`
//! and fails loudly there.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// String-keyed mapping.  BTreeMap keeps the keys sorted, so map digests
    /// never depend on insertion order.
    Map(BTreeMap<String, Value>),
    /// A value carrying a separate identity: when a traced function returns
    /// `Named`, `name` feeds the name digest and `value` the full digest,
    /// and only `value` is stored as the result.
    Named {
        value: Box<Value>,
        name: Box<Value>,
    },
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    pub fn list(vs: impl IntoIterator<Item = Value>) -> Value {
        Value::List(vs.into_iter().collect())
    }

    pub fn map(entries: impl IntoIterator<Item = (String, Value)>) -> Value {
        Value::Map(entries.into_iter().collect())
    }

    pub fn named(value: Value, name: Value) -> Value {
        Value::Named {
            value: Box::new(value),
            name: Box::new(name),
        }
    }

    /// Scalars encode to a self-contained byte string and admit a total
    /// order; only scalars may key maps or populate sets in digest graphs.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Unit
                | Value::Bool(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::Str(_)
                | Value::Bytes(_)
        )
    }

    /// Kind tag used for cross-kind scalar ordering.
    fn rank(&self) -> u8 {
        match self {
            Value::Unit => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Str(_) => 4,
            Value::Bytes(_) => 5,
            Value::List(_) => 6,
            Value::Map(_) => 7,
            Value::Named { .. } => 8,
        }
    }

    /// Append the scalar leaf encoding.  Composite kinds are handled by the
    /// traversal in `digest`; calling this on one is a bug.
    pub(crate) fn encode_scalar(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Unit => buf.push(b'N'),
            Value::Bool(true) => buf.push(b'T'),
            Value::Bool(false) => buf.push(b'F'),
            Value::Int(n) => buf.extend_from_slice(format!("i({:x})", *n as u64).as_bytes()),
            Value::Float(f) => buf.extend_from_slice(format!("f({:x})", f.to_bits()).as_bytes()),
            Value::Str(s) => {
                buf.extend_from_slice(format!("s({:x})", s.len()).as_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.extend_from_slice(format!("b({:x})", b.len()).as_bytes());
                buf.extend_from_slice(b);
            }
            _ => panic!("encode_scalar on composite value {:?}", self),
        }
    }

    /// Encode a whole (acyclic) value tree.  Uses an explicit stack so deep
    /// lists cannot overflow the call stack.
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut work: Vec<&Value> = vec![self];
        while let Some(v) = work.pop() {
            match v {
                _ if v.is_scalar() => v.encode_scalar(buf),
                Value::List(items) => {
                    if items.is_empty() {
                        buf.push(b'L');
                    } else {
                        buf.extend_from_slice(format!("l({:x})", items.len()).as_bytes());
                        // Popped in order: push reversed.
                        work.extend(items.iter().rev());
                    }
                }
                Value::Map(entries) => {
                    if entries.is_empty() {
                        buf.push(b'D');
                    } else {
                        buf.extend_from_slice(format!("d({:x})", entries.len()).as_bytes());
                        for (k, v) in entries.iter().rev() {
                            work.push(v);
                            buf.extend_from_slice(format!("k({:x})", k.len()).as_bytes());
                            buf.extend_from_slice(k.as_bytes());
                        }
                    }
                }
                Value::Named { value, name } => {
                    buf.extend_from_slice(b"nmd");
                    work.push(value);
                    work.push(name);
                }
                _ => unreachable!(),
            }
        }
    }

    /// Total order over scalar values: kind tag first, then value.
    /// Callers must have checked `is_scalar` on both sides.
    pub(crate) fn cmp_scalar(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// An eventually-available successful outcome: positional values plus named
/// values, mirroring how general function results are delivered.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueSet {
    pub pos: Vec<Value>,
    pub named: BTreeMap<String, Value>,
}

impl ValueSet {
    pub fn empty() -> ValueSet {
        ValueSet::default()
    }

    pub fn of(v: Value) -> ValueSet {
        ValueSet {
            pos: vec![v],
            named: BTreeMap::new(),
        }
    }

    /// The first positional value, or Unit when there is none.
    pub fn value(&self) -> &Value {
        self.pos.first().unwrap_or(&Value::Unit)
    }

    pub fn into_value(mut self) -> Value {
        if self.pos.is_empty() {
            Value::Unit
        } else {
            self.pos.swap_remove(0)
        }
    }
}

/// The failure payload of a traced computation.  An ordinary application
/// error represented as data so it can be stored, replayed, and digested.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskError(pub Value);

impl TaskError {
    pub fn msg(m: impl Into<String>) -> TaskError {
        TaskError(Value::Str(m.into()))
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::Str(s) => write!(f, "{}", s),
            other => write!(f, "{:?}", other),
        }
    }
}

impl std::error::Error for TaskError {}

/// The terminal state of a future: one success value-set or one failure.
pub type Outcome<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_order_is_total() {
        let vals = [
            Value::Unit,
            Value::Bool(false),
            Value::Bool(true),
            Value::Int(-1),
            Value::Int(7),
            Value::Float(0.5),
            Value::str("a"),
            Value::str("b"),
            Value::Bytes(vec![1]),
        ];
        for (i, a) in vals.iter().enumerate() {
            for (j, b) in vals.iter().enumerate() {
                assert_eq!(a.cmp_scalar(b), i.cmp(&j), "{:?} vs {:?}", a, b);
            }
        }
    }

    #[test]
    fn encoding_distinguishes_kinds() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        Value::str("1").encode_into(&mut a);
        Value::Int(1).encode_into(&mut b);
        assert_ne!(a, b);

        a.clear();
        b.clear();
        Value::list(vec![Value::Int(1), Value::Int(2)]).encode_into(&mut a);
        Value::list(vec![Value::list(vec![Value::Int(1), Value::Int(2)])]).encode_into(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn map_encoding_ignores_insertion_order() {
        let m1 = Value::map(vec![
            ("x".to_string(), Value::Int(1)),
            ("y".to_string(), Value::Int(2)),
        ]);
        let m2 = Value::map(vec![
            ("y".to_string(), Value::Int(2)),
            ("x".to_string(), Value::Int(1)),
        ]);
        let mut a = Vec::new();
        let mut b = Vec::new();
        m1.encode_into(&mut a);
        m2.encode_into(&mut b);
        assert_eq!(a, b);
    }
}

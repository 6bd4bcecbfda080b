//! Dynamic values held in object variables.
//!
//! `Value` is a closed sum over the built-in kinds plus one open variant,
//! [`Value::Instance`], which carries a trait object for kinds registered at
//! runtime. Equality, ordering and hashing follow one contract:
//!
//! - values of different kinds order by their [`ValueKind`] tag
//! - floats compare by `total_cmp`, so `NaN == NaN` when the bit patterns match
//! - instances of different instance kinds order by kind id

pub mod instance;

use crate::object::Objnum;
use anyhow::{Result, bail};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

pub use instance::{Instance, InstanceKind, InstanceRegistry, InstanceValue, UnpackFn};

/// Tag written in front of every encoded value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueKind {
    Integer = 0,
    Float = 1,
    String = 2,
    Objnum = 3,
    List = 4,
    Symbol = 5,
    Error = 6,
    Frob = 7,
    Dict = 8,
    Buffer = 9,
    Instance = 10,
}

impl ValueKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ValueKind::Integer),
            1 => Ok(ValueKind::Float),
            2 => Ok(ValueKind::String),
            3 => Ok(ValueKind::Objnum),
            4 => Ok(ValueKind::List),
            5 => Ok(ValueKind::Symbol),
            6 => Ok(ValueKind::Error),
            7 => Ok(ValueKind::Frob),
            8 => Ok(ValueKind::Dict),
            9 => Ok(ValueKind::Buffer),
            10 => Ok(ValueKind::Instance),
            _ => bail!("Unknown value kind: {}", value),
        }
    }
}

/// A (class, representation) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frob {
    pub class: Objnum,
    pub rep: Value,
}

/// Insertion-ordered association list keyed by values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or replace; returns the previous value for `key`.
    pub fn insert(&mut self, key: Value, value: Value) -> Option<Value> {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl FromIterator<(Value, Value)> for Dict {
    fn from_iter<I: IntoIterator<Item = (Value, Value)>>(iter: I) -> Self {
        let mut dict = Dict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

/// Values that can be stored in an object variable.
#[derive(Debug, Clone)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Objnum(Objnum),
    List(Vec<Value>),
    Symbol(String),
    Error(String),
    Frob(Box<Frob>),
    Dict(Dict),
    Buffer(Vec<u8>),
    Instance(Instance),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Objnum(_) => ValueKind::Objnum,
            Value::List(_) => ValueKind::List,
            Value::Symbol(_) => ValueKind::Symbol,
            Value::Error(_) => ValueKind::Error,
            Value::Frob(_) => ValueKind::Frob,
            Value::Dict(_) => ValueKind::Dict,
            Value::Buffer(_) => ValueKind::Buffer,
            Value::Instance(_) => ValueKind::Instance,
        }
    }

    pub fn frob(class: Objnum, rep: Value) -> Self {
        Value::Frob(Box::new(Frob { class, rep }))
    }

    /// Total order used for equality, dictionary keys and sorting.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Objnum(a), Value::Objnum(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => compare_seq(a.iter(), b.iter()),
            (Value::Symbol(a), Value::Symbol(b)) => a.cmp(b),
            (Value::Error(a), Value::Error(b)) => a.cmp(b),
            (Value::Frob(a), Value::Frob(b)) => a
                .class
                .cmp(&b.class)
                .then_with(|| a.rep.compare(&b.rep)),
            (Value::Dict(a), Value::Dict(b)) => a.len().cmp(&b.len()).then_with(|| {
                for ((ak, av), (bk, bv)) in a.iter().zip(b.iter()) {
                    let ord = ak.compare(bk).then_with(|| av.compare(bv));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            }),
            (Value::Buffer(a), Value::Buffer(b)) => a.cmp(b),
            (Value::Instance(a), Value::Instance(b)) => a.compare(b),
            _ => self.kind().cmp(&other.kind()),
        }
    }
}

fn compare_seq<'a>(
    mut a: impl Iterator<Item = &'a Value>,
    mut b: impl Iterator<Item = &'a Value>,
) -> Ordering {
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.compare(y) {
                Ordering::Equal => continue,
                ord => return ord,
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        match self {
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) | Value::Symbol(s) | Value::Error(s) => s.hash(state),
            Value::Objnum(n) => n.hash(state),
            Value::List(items) => items.hash(state),
            Value::Frob(frob) => frob.hash(state),
            Value::Dict(dict) => dict.hash(state),
            Value::Buffer(bytes) => bytes.hash(state),
            Value::Instance(inst) => inst.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Objnum(n) => write!(f, "#{}", n),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Symbol(s) => write!(f, "'{}", s),
            Value::Error(s) => write!(f, "~{}", s),
            Value::Frob(frob) => write!(f, "<#{}, {}>", frob.class, frob.rep),
            Value::Dict(dict) => {
                write!(f, "#[")?;
                for (i, (k, v)) in dict.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[{}, {}]", k, v)?;
                }
                write!(f, "]")
            }
            Value::Buffer(bytes) => {
                write!(f, "`[")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", b)?;
                }
                write!(f, "]")
            }
            Value::Instance(inst) => write!(f, "{}", inst.literal()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_value_kind_conversion() -> Result<()> {
        assert_eq!(ValueKind::from_u8(0)?, ValueKind::Integer);
        assert_eq!(ValueKind::from_u8(7)?, ValueKind::Frob);
        assert_eq!(ValueKind::from_u8(10)?, ValueKind::Instance);
        assert!(ValueKind::from_u8(11).is_err());
        Ok(())
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(
            hash_of(&Value::Float(f64::INFINITY)),
            hash_of(&Value::Float(f64::INFINITY))
        );
    }

    #[test]
    fn test_cross_kind_ordering() {
        assert!(Value::Integer(100) < Value::Float(0.0));
        assert!(Value::String("a".into()) < Value::Objnum(0));
        assert!(Value::List(vec![]) < Value::List(vec![Value::Integer(0)]));
    }

    #[test]
    fn test_dict_insert_replace_remove() {
        let mut dict = Dict::new();
        assert_eq!(dict.insert(Value::Symbol("a".into()), Value::Integer(1)), None);
        assert_eq!(
            dict.insert(Value::Symbol("a".into()), Value::Integer(2)),
            Some(Value::Integer(1))
        );
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get(&Value::Symbol("a".into())), Some(&Value::Integer(2)));
        assert_eq!(dict.remove(&Value::Symbol("a".into())), Some(Value::Integer(2)));
        assert!(dict.is_empty());
    }

    #[test]
    fn test_display_literals() {
        let v = Value::List(vec![
            Value::Integer(-3),
            Value::Objnum(7),
            Value::Symbol("foo".into()),
            Value::Error("type".into()),
            Value::frob(2, Value::List(vec![])),
            Value::Buffer(vec![1, 2]),
        ]);
        assert_eq!(v.to_string(), "[-3, #7, 'foo, ~type, <#2, []>, `[1, 2]]");

        let dict: Dict = [(Value::String("k".into()), Value::Float(1.5))]
            .into_iter()
            .collect();
        assert_eq!(Value::Dict(dict).to_string(), "#[[\"k\", 1.5]]");
    }
}

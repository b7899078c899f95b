// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Python values, including class instances and placeholders for classes
//! that could not be resolved.

use std::fmt;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive};

pub use crate::value_impls::{to_value, from_value};
pub use crate::failure::Unresolved;

use crate::error::{Error, ErrorCode};

/// A reference to a class (or any other module global) by its module path
/// and name, as found in GLOBAL opcodes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassRef {
    pub module: String,
    pub name: String,
}

impl ClassRef {
    pub fn new<M: Into<String>, N: Into<String>>(module: M, name: N) -> ClassRef {
        ClassRef { module: module.into(), name: name.into() }
    }

    /// Parse a dotted path, splitting on the last dot: `"pkg.mod.Name"`
    /// becomes module `pkg.mod` and name `Name`.
    pub fn parse(path: &str) -> Option<ClassRef> {
        match path.rsplit_once('.') {
            Some((module, name)) if !module.is_empty() && !name.is_empty() =>
                Some(ClassRef::new(module, name)),
            _ => None,
        }
    }

    /// The lookup key used by registries and remap tables.
    pub fn key(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// An instance of a registered class, as reconstructed by the default
/// class factory: the constructor arguments plus whatever state BUILD set.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub class: ClassRef,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<HashableValue, Value>,
    pub state: Option<Value>,
}

impl Instance {
    pub fn new(class: ClassRef) -> Instance {
        Instance { class, args: Vec::new(), kwargs: BTreeMap::new(), state: None }
    }

    pub fn with_state(class: ClassRef, state: Value) -> Instance {
        Instance { state: Some(state), ..Instance::new(class) }
    }

    /// Look up an attribute in a dict-shaped state.
    pub fn attr(&self, name: &str) -> Option<&Value> {
        match self.state {
            Some(Value::Dict(ref dict)) => dict.get(&HashableValue::String(name.into())),
            _ => None,
        }
    }
}

/// Represents all builtin Python values that can be restored by unpickling,
/// plus class instances and unresolved placeholders.
///
/// Note on integers: the distinction between the two types (short and long) is
/// very fuzzy in Python, and they can be used interchangeably.  In Python 3,
/// all integers are long integers, so all are pickled as such.  While decoding,
/// we simply put all integers that fit into an i64, and use `BigInt` for the
/// rest.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer (unbounded length)
    Int(BigInt),
    /// Float
    F64(f64),
    /// Bytestring
    Bytes(Vec<u8>),
    /// Unicode string
    String(String),
    /// List
    List(Vec<Value>),
    /// Tuple
    Tuple(Vec<Value>),
    /// Set
    Set(BTreeSet<HashableValue>),
    /// Frozen (immutable) set
    FrozenSet(BTreeSet<HashableValue>),
    /// Dictionary (map)
    Dict(BTreeMap<HashableValue, Value>),
    /// Bare reference to a class or other global
    Class(ClassRef),
    /// Instance of a registered class
    Object(Box<Instance>),
    /// Placeholder for an instance whose class could not be resolved
    Unresolved(Box<Unresolved>),
}

/// Represents all Python values that can be contained in a "hashable"
/// context (i.e., as dictionary keys and set elements).  Class instances
/// and placeholders compare by class and contents.
///
/// In Rust, the type is *not* hashable, since we use B-tree maps and sets
/// instead of the hash variants.  To be able to put all Value instances
/// into these B-trees, we implement a consistent ordering between all
/// the possible types (see below).
#[derive(Clone, Debug)]
pub enum HashableValue {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer
    Int(BigInt),
    /// Float
    F64(f64),
    /// Bytestring
    Bytes(Vec<u8>),
    /// Unicode string
    String(String),
    /// Tuple
    Tuple(Vec<HashableValue>),
    /// Frozen (immutable) set
    FrozenSet(BTreeSet<HashableValue>),
    /// Bare reference to a class or other global
    Class(ClassRef),
    /// Instance of a registered class, compared by class and contents
    Object(Box<Instance>),
    /// Placeholder for an instance of an unresolved class
    Unresolved(Box<Unresolved>),
}

impl Value {
    /// Convert the value into a hashable version, if possible.  If not, return
    /// a ValueNotHashable error.
    pub fn into_hashable(self) -> Result<HashableValue, Error> {
        match self {
            Value::None         => Ok(HashableValue::None),
            Value::Bool(b)      => Ok(HashableValue::Bool(b)),
            Value::I64(i)       => Ok(HashableValue::I64(i)),
            Value::Int(i)       => Ok(HashableValue::Int(i)),
            Value::F64(f)       => Ok(HashableValue::F64(f)),
            Value::Bytes(b)     => Ok(HashableValue::Bytes(b)),
            Value::String(s)    => Ok(HashableValue::String(s)),
            Value::FrozenSet(v) => Ok(HashableValue::FrozenSet(v)),
            Value::Class(c)     => Ok(HashableValue::Class(c)),
            Value::Object(o)    => Ok(HashableValue::Object(o)),
            Value::Unresolved(u) => Ok(HashableValue::Unresolved(u)),
            Value::Tuple(v)     => v.into_iter()
                                    .map(Value::into_hashable)
                                    .collect::<Result<_, _>>()
                                    .map(HashableValue::Tuple),
            _                   => Err(Error::Syntax(ErrorCode::ValueNotHashable))
        }
    }

    /// Returns true if this value, or anything nested in it, is a
    /// placeholder for an unresolved class.
    pub fn contains_unresolved(&self) -> bool {
        self.count_unresolved() > 0
    }

    /// Number of unresolved placeholders anywhere in this value, including
    /// dict keys and set items.
    pub fn count_unresolved(&self) -> usize {
        match *self {
            Value::Unresolved(ref u) => placeholder_unresolved(u),
            Value::Object(ref obj) => instance_unresolved(obj),
            Value::List(ref v) | Value::Tuple(ref v) =>
                v.iter().map(Value::count_unresolved).sum(),
            Value::Set(ref s) | Value::FrozenSet(ref s) =>
                s.iter().map(HashableValue::count_unresolved).sum(),
            Value::Dict(ref d) => d.iter()
                .map(|(k, v)| k.count_unresolved() + v.count_unresolved())
                .sum(),
            _ => 0,
        }
    }
}

fn placeholder_unresolved(u: &Unresolved) -> usize {
    1 + u.args.iter().map(Value::count_unresolved).sum::<usize>()
      + u.kwargs.values().map(Value::count_unresolved).sum::<usize>()
      + u.dict.iter().map(|(k, v)| k.count_unresolved() + v.count_unresolved()).sum::<usize>()
      + u.raw_state.as_ref().map_or(0, Value::count_unresolved)
}

fn instance_unresolved(obj: &Instance) -> usize {
    obj.args.iter().map(Value::count_unresolved).sum::<usize>()
        + obj.kwargs.iter().map(|(k, v)| k.count_unresolved() + v.count_unresolved()).sum::<usize>()
        + obj.state.as_ref().map_or(0, Value::count_unresolved)
}

impl HashableValue {
    /// Number of unresolved placeholders in this key.
    pub fn count_unresolved(&self) -> usize {
        match *self {
            HashableValue::Unresolved(ref u) => placeholder_unresolved(u),
            HashableValue::Object(ref obj) => instance_unresolved(obj),
            HashableValue::Tuple(ref v) => v.iter().map(HashableValue::count_unresolved).sum(),
            HashableValue::FrozenSet(ref s) => s.iter().map(HashableValue::count_unresolved).sum(),
            _ => 0,
        }
    }

    /// Convert the value into its non-hashable version.  This always works.
    pub fn into_value(self) -> Value {
        match self {
            HashableValue::None         => Value::None,
            HashableValue::Bool(b)      => Value::Bool(b),
            HashableValue::I64(i)       => Value::I64(i),
            HashableValue::Int(i)       => Value::Int(i),
            HashableValue::F64(f)       => Value::F64(f),
            HashableValue::Bytes(b)     => Value::Bytes(b),
            HashableValue::String(s)    => Value::String(s),
            HashableValue::FrozenSet(v) => Value::FrozenSet(v),
            HashableValue::Class(c)     => Value::Class(c),
            HashableValue::Object(o)    => Value::Object(o),
            HashableValue::Unresolved(u) => Value::Unresolved(u),
            HashableValue::Tuple(v)     => Value::Tuple(v.into_iter()
                                                         .map(HashableValue::into_value)
                                                         .collect()),
        }
    }
}

fn write_seq<'a, I, T>(f: &mut fmt::Formatter, items: I, open: &str, close: &str,
                       trailing_comma: bool) -> fmt::Result
    where I: ExactSizeIterator<Item=&'a T>, T: fmt::Display + 'a
{
    let len = items.len();
    f.write_str(open)?;
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    if trailing_comma && len == 1 {
        f.write_str(",")?;
    }
    f.write_str(close)
}

fn write_dict<'a, I>(f: &mut fmt::Formatter, items: I) -> fmt::Result
    where I: Iterator<Item=(&'a HashableValue, &'a Value)>
{
    f.write_str("{")?;
    for (i, (key, value)) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}: {}", key, value)?;
    }
    f.write_str("}")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Value::None          => f.write_str("None"),
            Value::Bool(b)       => f.write_str(if b { "True" } else { "False" }),
            Value::I64(i)        => write!(f, "{}", i),
            Value::Int(ref i)    => write!(f, "{}", i),
            Value::F64(v)        => write!(f, "{}", v),
            Value::Bytes(ref b)  => write!(f, "b{:?}", b),
            Value::String(ref s) => write!(f, "{:?}", s),
            Value::List(ref v)   => write_seq(f, v.iter(), "[", "]", false),
            Value::Tuple(ref v)  => write_seq(f, v.iter(), "(", ")", true),
            Value::Set(ref v) if v.is_empty() => f.write_str("set()"),
            Value::Set(ref v)    => write_seq(f, v.iter(), "{", "}", false),
            Value::FrozenSet(ref v) => write_seq(f, v.iter(), "frozenset([", "])", false),
            Value::Dict(ref d)   => write_dict(f, d.iter()),
            Value::Class(ref c)  => write!(f, "<class '{}'>", c),
            Value::Object(ref obj) => {
                write!(f, "{}", obj.class)?;
                write_seq(f, obj.args.iter(), "(", ")", false)?;
                if let Some(ref state) = obj.state {
                    write!(f, " {}", state)?;
                }
                Ok(())
            }
            Value::Unresolved(ref u) => write!(f, "{}", u),
        }
    }
}

impl fmt::Display for HashableValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HashableValue::Tuple(ref v)     => write_seq(f, v.iter(), "(", ")", true),
            HashableValue::FrozenSet(ref v) => write_seq(f, v.iter(), "frozenset([", "])", false),
            ref other => write!(f, "{}", other.clone().into_value()),
        }
    }
}

/// Numeric view of a hashable value, for cross-type comparisons.
enum Number<'a> {
    Int(Cow<'a, BigInt>),
    Float(f64),
}

impl HashableValue {
    /// Type rank used to order values of unrelated types, similar to
    /// Python 2's ordering of mixed types.
    fn rank(&self) -> u8 {
        match *self {
            HashableValue::None => 0,
            HashableValue::Bool(_) | HashableValue::I64(_) |
            HashableValue::Int(_) | HashableValue::F64(_) => 1,
            HashableValue::Bytes(_) => 2,
            HashableValue::String(_) => 3,
            HashableValue::FrozenSet(_) => 4,
            HashableValue::Tuple(_) => 5,
            HashableValue::Class(_) => 6,
            HashableValue::Object(_) => 7,
            HashableValue::Unresolved(_) => 8,
        }
    }

    fn as_number(&self) -> Option<Number> {
        match *self {
            HashableValue::Bool(b) => Some(Number::Int(Cow::Owned(BigInt::from(b as i64)))),
            HashableValue::I64(i) => Some(Number::Int(Cow::Owned(BigInt::from(i)))),
            HashableValue::Int(ref i) => Some(Number::Int(Cow::Borrowed(i))),
            HashableValue::F64(f) => Some(Number::Float(f)),
            _ => None,
        }
    }
}

impl PartialEq for HashableValue {
    fn eq(&self, other: &HashableValue) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HashableValue {}

impl PartialOrd for HashableValue {
    fn partial_cmp(&self, other: &HashableValue) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Implement a (more or less) consistent ordering for `HashableValue`s
/// so that they can be added to dictionaries and sets.
///
/// Like in Python, numeric values with the same value (integral or not)
/// compare equal, so `True`, `1` and `1.0` are the same dict key.
impl Ord for HashableValue {
    fn cmp(&self, other: &HashableValue) -> Ordering {
        use self::HashableValue::*;
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return match (a, b) {
                (Number::Int(a), Number::Int(b)) => a.cmp(&b),
                (Number::Float(a), Number::Float(b)) => float_ord(a, b),
                (Number::Int(a), Number::Float(b)) => float_bigint_ord(&a, b),
                (Number::Float(a), Number::Int(b)) => float_bigint_ord(&b, a).reverse(),
            };
        }
        match (self, other) {
            (&Bytes(ref a), &Bytes(ref b)) => a.cmp(b),
            (&String(ref a), &String(ref b)) => a.cmp(b),
            (&FrozenSet(ref a), &FrozenSet(ref b)) => a.cmp(b),
            (&Tuple(ref a), &Tuple(ref b)) => a.cmp(b),
            (&Class(ref a), &Class(ref b)) => a.cmp(b),
            (&Object(ref a), &Object(ref b)) => instance_ord(a, b),
            (&Unresolved(ref a), &Unresolved(ref b)) => unresolved_ord(a, b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

fn value_rank(value: &Value) -> u8 {
    match *value {
        Value::List(_) => 10,
        Value::Set(_) => 11,
        Value::Dict(_) => 12,
        // The remaining variants are all hashable.
        ref other => other.clone().into_hashable().map_or(13, |h| h.rank()),
    }
}

/// Total ordering over arbitrary values, used for instances and
/// placeholders inside dict keys and set items.
fn value_ord(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (&Value::List(ref a), &Value::List(ref b)) => seq_ord(a, b),
        (&Value::Set(ref a), &Value::Set(ref b)) => a.cmp(b),
        (&Value::Dict(ref a), &Value::Dict(ref b)) => dict_ord(a, b),
        (&Value::Tuple(ref a), &Value::Tuple(ref b)) => seq_ord(a, b),
        (&Value::Object(ref a), &Value::Object(ref b)) => instance_ord(a, b),
        (&Value::Unresolved(ref a), &Value::Unresolved(ref b)) => unresolved_ord(a, b),
        _ => match (a.clone().into_hashable(), b.clone().into_hashable()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => value_rank(a).cmp(&value_rank(b)),
        },
    }
}

fn seq_ord(a: &[Value], b: &[Value]) -> Ordering {
    a.iter().zip(b)
        .map(|(x, y)| value_ord(x, y))
        .find(|&o| o != Ordering::Equal)
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

fn dict_ord(a: &BTreeMap<HashableValue, Value>, b: &BTreeMap<HashableValue, Value>) -> Ordering {
    a.iter().zip(b)
        .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| value_ord(va, vb)))
        .find(|&o| o != Ordering::Equal)
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

fn option_ord(a: &Option<Value>, b: &Option<Value>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => value_ord(a, b),
        (a, b) => a.is_some().cmp(&b.is_some()),
    }
}

fn instance_ord(a: &Instance, b: &Instance) -> Ordering {
    a.class.cmp(&b.class)
        .then_with(|| seq_ord(&a.args, &b.args))
        .then_with(|| dict_ord(&a.kwargs, &b.kwargs))
        .then_with(|| option_ord(&a.state, &b.state))
}

fn unresolved_ord(a: &Unresolved, b: &Unresolved) -> Ordering {
    a.class.cmp(&b.class)
        .then_with(|| a.failure.cmp(&b.failure))
        .then_with(|| a.occurrence.cmp(&b.occurrence))
        .then_with(|| seq_ord(&a.args, &b.args))
        .then_with(|| dict_ord(&a.kwargs, &b.kwargs))
        .then_with(|| dict_ord(&a.dict, &b.dict))
        .then_with(|| option_ord(&a.raw_state, &b.raw_state))
}

/// A "reasonable" total ordering for floats.
fn float_ord(f: f64, g: f64) -> Ordering {
    f.partial_cmp(&g).unwrap_or(Ordering::Less)
}

/// Ordering between big integers and floats.
fn float_bigint_ord(bi: &BigInt, g: f64) -> Ordering {
    match bi.to_f64() {
        Some(f) if f.is_finite() => float_ord(f, g),
        _ => if bi.is_positive() { Ordering::Greater } else { Ordering::Less }
    }
}

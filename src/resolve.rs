// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Class resolution for module globals found in pickle streams.
//!
//! Python resolves `module.Name` references by importing the module.  Here,
//! the host application registers the classes it knows how to rebuild in a
//! [`Registry`] ahead of time.  A [`RemapTable`] redirects renamed classes,
//! and a [`ClassResolver`] decides what to do when neither finds a class:
//! raise, or hand out a placeholder recorded in the failure ledger.

use std::fmt;
use std::sync::Arc;
use std::collections::BTreeMap;
use log::warn;

use crate::error::{Error, ErrorCode, Result};
use crate::failure::{FailureLedger, FailureRecord};
use crate::value::{ClassRef, HashableValue, Instance, Value};

/// Module and name of the global the extended format uses to write
/// placeholders back out.
pub const PLACEHOLDER_MODULE: &str = "robust_pickle";
pub const PLACEHOLDER_NAME: &str = "_unresolved";

/// Rebuilds instances of one registered class.
///
/// The default methods produce a generic [`Instance`] holding the arguments
/// and state, which is enough for data-only classes.
pub trait ClassFactory: Send + Sync {
    /// Called for REDUCE, NEWOBJ, NEWOBJ_EX, INST and OBJ.
    fn construct(&self, class: &ClassRef, args: Vec<Value>,
                 kwargs: BTreeMap<HashableValue, Value>) -> Result<Value> {
        Ok(Value::Object(Box::new(Instance { args, kwargs, ..Instance::new(class.clone()) })))
    }

    /// Called for BUILD with the state that `__setstate__` would receive.
    fn set_state(&self, instance: &mut Value, state: Value) -> Result<()> {
        match *instance {
            Value::Object(ref mut obj) => {
                obj.state = Some(match (obj.state.take(), state) {
                    (Some(Value::Dict(mut old)), Value::Dict(new)) => { old.extend(new); Value::Dict(old) }
                    (_, state) => state,
                });
                Ok(())
            }
            ref other => Err(Error::Syntax(ErrorCode::Construction(
                format!("cannot set state on {}", other)))),
        }
    }
}

/// Factory producing generic [`Instance`] values.
#[derive(Clone, Copy, Debug, Default)]
pub struct Generic;

impl ClassFactory for Generic {}

/// Factory backed by a closure that receives the positional arguments.
/// State is handled like [`Generic`] does.
pub struct FnFactory<F>(pub F);

impl<F> ClassFactory for FnFactory<F>
    where F: Fn(&ClassRef, Vec<Value>) -> Result<Value> + Send + Sync
{
    fn construct(&self, class: &ClassRef, args: Vec<Value>,
                 _kwargs: BTreeMap<HashableValue, Value>) -> Result<Value> {
        (self.0)(class, args)
    }
}

/// Classes the host application knows how to rebuild, keyed by
/// `"module.Name"`.
#[derive(Clone, Default)]
pub struct Registry {
    classes: BTreeMap<String, Arc<dyn ClassFactory>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register<F: ClassFactory + 'static>(&mut self, module: &str, name: &str, factory: F) {
        self.classes.insert(format!("{}.{}", module, name), Arc::new(factory));
    }

    /// Register a class rebuilt as a generic [`Instance`].
    pub fn register_generic(&mut self, module: &str, name: &str) {
        self.register(module, name, Generic)
    }

    /// Builder-style variant of [`register_generic`](Registry::register_generic).
    pub fn with_generic(mut self, module: &str, name: &str) -> Registry {
        self.register_generic(module, name);
        self
    }

    pub fn unregister(&mut self, module: &str, name: &str) -> bool {
        self.classes.remove(&format!("{}.{}", module, name)).is_some()
    }

    pub fn get(&self, class: &ClassRef) -> Option<Arc<dyn ClassFactory>> {
        self.classes.get(&class.key()).cloned()
    }

    pub fn contains(&self, class: &ClassRef) -> bool {
        self.classes.contains_key(&class.key())
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.classes.keys()).finish()
    }
}

/// Where a remapped class should be looked up instead.
#[derive(Clone)]
pub enum RemapTarget {
    /// Dotted path, split on the last dot.
    Path(String),
    /// Module and name.
    Pair(String, String),
    /// A factory used directly, bypassing the registry.
    Factory(Arc<dyn ClassFactory>),
}

impl RemapTarget {
    pub fn factory<F: ClassFactory + 'static>(factory: F) -> RemapTarget {
        RemapTarget::Factory(Arc::new(factory))
    }
}

impl fmt::Debug for RemapTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RemapTarget::Path(ref p) => write!(f, "Path({:?})", p),
            RemapTarget::Pair(ref m, ref n) => write!(f, "Pair({:?}, {:?})", m, n),
            RemapTarget::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

impl PartialEq for RemapTarget {
    fn eq(&self, other: &RemapTarget) -> bool {
        match (self, other) {
            (&RemapTarget::Path(ref a), &RemapTarget::Path(ref b)) => a == b,
            (&RemapTarget::Pair(ref a, ref b), &RemapTarget::Pair(ref c, ref d)) => a == c && b == d,
            (&RemapTarget::Factory(ref a), &RemapTarget::Factory(ref b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<'a> From<&'a str> for RemapTarget {
    fn from(path: &'a str) -> RemapTarget {
        RemapTarget::Path(path.into())
    }
}

impl From<String> for RemapTarget {
    fn from(path: String) -> RemapTarget {
        RemapTarget::Path(path)
    }
}

impl<'a, 'b> From<(&'a str, &'b str)> for RemapTarget {
    fn from((module, name): (&'a str, &'b str)) -> RemapTarget {
        RemapTarget::Pair(module.into(), name.into())
    }
}

/// Exact-match redirections from `"module.Name"` to a replacement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemapTable {
    entries: BTreeMap<String, RemapTarget>,
}

impl RemapTable {
    pub fn new() -> RemapTable {
        RemapTable::default()
    }

    pub fn insert<K: Into<String>, T: Into<RemapTarget>>(&mut self, key: K, target: T) {
        self.entries.insert(key.into(), target.into());
    }

    pub fn with<K: Into<String>, T: Into<RemapTarget>>(mut self, key: K, target: T) -> RemapTable {
        self.insert(key, target);
        self
    }

    pub fn get(&self, key: &str) -> Option<&RemapTarget> {
        self.entries.get(key)
    }

    /// Add entries without overriding existing ones.  Returns whether
    /// anything was added.
    pub fn merge_missing<'a, I>(&mut self, entries: I) -> bool
        where I: IntoIterator<Item=(&'a str, &'a str)>
    {
        let mut changed = false;
        for (key, target) in entries {
            if !self.entries.contains_key(key) {
                self.entries.insert(key.into(), RemapTarget::Path(target.into()));
                changed = true;
            }
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Known deprecations: a class (or, with an empty name, every class of a
/// module) and the remap entries that fix it.
pub const KNOWN_FIXES: &[(&str, &str, &[(&str, &str)])] = &[
    ("pandas.core.indexes.numeric", "Int64Index",
     &[("pandas.core.indexes.numeric.Int64Index", "pandas.core.indexes.api.Index")]),
    ("pandas.core.indexes.numeric", "UInt64Index",
     &[("pandas.core.indexes.numeric.UInt64Index", "pandas.core.indexes.api.Index")]),
    ("pandas.core.indexes.numeric", "Float64Index",
     &[("pandas.core.indexes.numeric.Float64Index", "pandas.core.indexes.api.Index")]),
];

/// Historical locations of tabular-library classes, applied silently by the
/// tabular-aware strategy.
pub const TABULAR_COMPAT: &[(&str, &str)] = &[
    ("pandas.index.Index", "pandas.core.indexes.base.Index"),
    ("pandas.indexes.base.Index", "pandas.core.indexes.base.Index"),
    ("pandas.indexes.numeric.Int64Index", "pandas.core.indexes.base.Index"),
    ("pandas.indexes.numeric.Float64Index", "pandas.core.indexes.base.Index"),
    ("pandas.core.indexes.numeric.Int64Index", "pandas.core.indexes.base.Index"),
    ("pandas.core.indexes.numeric.UInt64Index", "pandas.core.indexes.base.Index"),
    ("pandas.core.indexes.numeric.Float64Index", "pandas.core.indexes.base.Index"),
    ("pandas.tseries.index.DatetimeIndex", "pandas.core.indexes.datetimes.DatetimeIndex"),
    ("pandas.tseries.period.PeriodIndex", "pandas.core.indexes.period.PeriodIndex"),
    ("pandas.core.base.FrozenNDArray", "numpy.ndarray"),
    ("pandas.core.indexes.frozen.FrozenNDArray", "numpy.ndarray"),
    ("pandas.sparse.array.SparseArray", "pandas.core.arrays.sparse.SparseArray"),
];

fn known_fix(class: &ClassRef) -> Option<&'static [(&'static str, &'static str)]> {
    KNOWN_FIXES.iter()
        .find(|&&(m, n, _)| m == class.module && n == class.name)
        .or_else(|| KNOWN_FIXES.iter().find(|&&(m, n, _)| m == class.module && n.is_empty()))
        .map(|&(_, _, fix)| fix)
}

/// Python 2 names, rewritten when `fix_imports` is on.
const PY2_NAMES: &[(&str, &str, &str, &str)] = &[
    ("__builtin__", "unicode", "builtins", "str"),
    ("__builtin__", "basestring", "builtins", "str"),
    ("__builtin__", "long", "builtins", "int"),
    ("__builtin__", "xrange", "builtins", "range"),
    ("__builtin__", "reduce", "functools", "reduce"),
];

const PY2_MODULES: &[(&str, &str)] = &[
    ("__builtin__", "builtins"),
    ("copy_reg", "copyreg"),
    ("cPickle", "pickle"),
    ("Queue", "queue"),
    ("UserDict", "collections"),
];

/// Map a Python 2 global to its Python 3 location.
pub fn fix_py2_name(class: ClassRef) -> ClassRef {
    if let Some(&(_, _, m, n)) = PY2_NAMES.iter()
        .find(|&&(m, n, _, _)| m == class.module && n == class.name)
    {
        return ClassRef::new(m, n);
    }
    match PY2_MODULES.iter().find(|&&(old, _)| old == class.module) {
        Some(&(_, new)) => ClassRef::new(new, class.name),
        None => class,
    }
}

/// Globals the codec rebuilds itself.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Builtin {
    Set,
    FrozenSet,
    Bytearray,
    List,
    Dict,
    /// `_codecs.encode`, used by protocol 2 to pickle bytes.
    Encode,
    /// `copyreg._reconstructor`, used by protocols 0 and 1 for objects.
    Reconstructor,
    Object,
    /// The extended format's placeholder global.
    Placeholder,
}

impl Builtin {
    fn find(class: &ClassRef, extensions: bool) -> Option<Builtin> {
        Some(match (&*class.module, &*class.name) {
            ("builtins", "set") | ("__builtin__", "set") => Builtin::Set,
            ("builtins", "frozenset") | ("__builtin__", "frozenset") => Builtin::FrozenSet,
            ("builtins", "bytearray") | ("__builtin__", "bytearray") => Builtin::Bytearray,
            ("builtins", "list") | ("__builtin__", "list") => Builtin::List,
            ("builtins", "dict") | ("__builtin__", "dict") |
            ("collections", "OrderedDict") => Builtin::Dict,
            ("builtins", "object") | ("__builtin__", "object") => Builtin::Object,
            ("_codecs", "encode") => Builtin::Encode,
            ("copyreg", "_reconstructor") | ("copy_reg", "_reconstructor") => Builtin::Reconstructor,
            (PLACEHOLDER_MODULE, PLACEHOLDER_NAME) if extensions => Builtin::Placeholder,
            _ => return None,
        })
    }
}

/// Why a class could not be resolved.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolveError {
    /// Neither the registry nor the remap table know the class.
    NotRegistered(ClassRef),
    /// A remap entry does not name a class.
    InvalidTarget { key: String, target: String },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ResolveError::NotRegistered(ref class) =>
                write!(f, "no class registered as '{}'", class),
            ResolveError::InvalidTarget { ref key, ref target } =>
                write!(f, "remapping for '{}' is not a module.Name path: '{}'", key, target),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Outcome of resolving one global.
#[derive(Clone)]
pub enum Resolved {
    Builtin(Builtin),
    Class(ClassRef, Arc<dyn ClassFactory>),
    /// Stand-in for an unresolved class; the failure is already recorded.
    Placeholder { class: ClassRef, record: FailureRecord, universal: bool },
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Resolved::Builtin(b) => write!(f, "Builtin({:?})", b),
            Resolved::Class(ref c, _) => write!(f, "Class({})", c),
            Resolved::Placeholder { ref class, ref record, .. } =>
                write!(f, "Placeholder({}, {})", class, record.label()),
        }
    }
}

/// What to do with a class that cannot be resolved.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Fallback {
    /// Fail the load.
    Raise,
    /// Substitute a plain placeholder.
    Plain,
    /// Substitute a universal placeholder capturing args and state.
    Universal,
}

/// Resolves globals for one unpickling attempt.
pub struct ClassResolver {
    registry: Registry,
    remap: RemapTable,
    auto_remap: bool,
    fallback: Fallback,
    ledger: FailureLedger,
    failures: Vec<FailureRecord>,
    applied_fixes: Vec<ClassRef>,
    pub(crate) extensions: bool,
}

impl ClassResolver {
    pub fn new(registry: Registry) -> ClassResolver {
        ClassResolver {
            registry,
            remap: RemapTable::new(),
            auto_remap: false,
            fallback: Fallback::Raise,
            ledger: FailureLedger::global(),
            failures: Vec::new(),
            applied_fixes: Vec::new(),
            extensions: false,
        }
    }

    /// A resolver that knows only the codec's builtin globals.
    pub fn builtins_only() -> ClassResolver {
        ClassResolver::new(Registry::new())
    }

    pub fn remap(mut self, remap: RemapTable) -> Self {
        self.remap = remap;
        self
    }

    pub fn auto_remap(mut self, auto_remap: bool) -> Self {
        self.auto_remap = auto_remap;
        self
    }

    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn ledger(mut self, ledger: FailureLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Accept the extended format's placeholder global.
    pub fn extensions(mut self, extensions: bool) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn ledger_handle(&self) -> &FailureLedger {
        &self.ledger
    }

    /// Failures recorded by this resolver.
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<FailureRecord> {
        self.failures
    }

    /// Classes whose known deprecation fix was merged into the remap table.
    pub fn applied_fixes(&self) -> &[ClassRef] {
        &self.applied_fixes
    }

    pub fn remap_table(&self) -> &RemapTable {
        &self.remap
    }

    pub fn fallback_mode(&self) -> Fallback {
        self.fallback
    }

    /// Resolve a global, applying the configured fallback on failure.
    pub fn resolve(&mut self, class: ClassRef) -> std::result::Result<Resolved, ResolveError> {
        let result = if self.auto_remap {
            self.resolve_with_fixes(&class)
        } else {
            self.lookup_remapped(&class)
        };
        match (result, self.fallback) {
            (Ok(resolved), _) => Ok(resolved),
            (Err(err), Fallback::Raise) => Err(err),
            (Err(err), fallback) => Ok(self.placeholder(class, &err, fallback == Fallback::Universal)),
        }
    }

    /// Record a failure and return a placeholder for `class`.
    pub fn placeholder<E>(&mut self, class: ClassRef, err: &E, universal: bool) -> Resolved
        where E: fmt::Display + fmt::Debug
    {
        let record = self.ledger.record(&class, err);
        self.failures.push(record.clone());
        Resolved::Placeholder { class, record, universal }
    }

    fn lookup(&self, class: &ClassRef) -> std::result::Result<Resolved, ResolveError> {
        if let Some(builtin) = Builtin::find(class, self.extensions) {
            return Ok(Resolved::Builtin(builtin));
        }
        match self.registry.get(class) {
            Some(factory) => Ok(Resolved::Class(class.clone(), factory)),
            None => Err(ResolveError::NotRegistered(class.clone())),
        }
    }

    fn lookup_remapped(&self, class: &ClassRef) -> std::result::Result<Resolved, ResolveError> {
        let key = class.key();
        match self.remap.get(&key) {
            None => self.lookup(class),
            Some(&RemapTarget::Path(ref path)) => match ClassRef::parse(path) {
                Some(target) => self.lookup(&target),
                None => Err(ResolveError::InvalidTarget { key, target: path.clone() }),
            },
            Some(&RemapTarget::Pair(ref module, ref name)) =>
                self.lookup(&ClassRef::new(module.clone(), name.clone())),
            Some(&RemapTarget::Factory(ref factory)) =>
                Ok(Resolved::Class(class.clone(), factory.clone())),
        }
    }

    /// Retry with known deprecation fixes merged into the remap table.
    ///
    /// Each fix is merged at most once, and a retry failing with the same
    /// message as the previous attempt gives up.
    fn resolve_with_fixes(&mut self, class: &ClassRef) -> std::result::Result<Resolved, ResolveError> {
        let mut last_error: Option<String> = None;
        loop {
            let err = match self.lookup_remapped(class) {
                Ok(resolved) => return Ok(resolved),
                Err(err @ ResolveError::NotRegistered(_)) => err,
                Err(err) => return Err(err),
            };
            let message = err.to_string();
            if last_error.as_ref() == Some(&message) {
                return Err(err);
            }
            let fix = match known_fix(class) {
                Some(fix) => fix,
                None => return Err(err),
            };
            if !self.remap.merge_missing(fix.iter().cloned()) {
                return Err(err);
            }
            warn!("fixing known unpickling deprecation \"{}\"", message);
            self.applied_fixes.push(class.clone());
            last_error = Some(message);
        }
    }
}

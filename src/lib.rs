// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Fault-tolerant loading and saving of Python pickle streams
//!
//! # Loading
//!
//! Pickles written by old versions of a program often refer to classes that
//! have since moved, been renamed or disappeared.  [`load`] reads such files
//! anyway: it tries a chain of unpickling strategies on the same bytes, and
//! the first that succeeds wins.
//!
//! * The strict strategies (standard pickle, a tabular-compatibility variant,
//!   latin-1 legacy strings, and the extended format) either reproduce the
//!   stream faithfully or fail.
//! * Unless [`LoadOptions::die_on_failure`] is set, two permissive strategies
//!   follow.  They substitute an [`Unresolved`] placeholder for every class
//!   that cannot be found, and append a [`FailureRecord`] to the failure
//!   ledger.  The last of them never fails on class resolution.
//!
//! Which classes can be rebuilt is up to the caller: register them in a
//! [`Registry`], optionally with a [`ClassFactory`] of your own, and redirect
//! moved classes with [`LoadOptions::remapping`].  A handful of well-known
//! library deprecations are fixed automatically by the renaming strategy.
//!
//! The source may be a path, a byte slice or a reader.  Gzip and zstandard
//! containers are detected by trying to decode them, never by extension.
//!
//! # Saving
//!
//! [`save`] writes protocol 3 pickles and falls back to an extended
//! protocol 4 format for values protocol 3 cannot express, notably
//! placeholders: a value loaded with placeholders can be saved and loaded
//! again, and a placeholder heals into a real instance once its class is
//! registered.
//!
//! # Supported types
//!
//! All Python builtin types that map easily to Rust are represented by
//! [`Value`]:
//!
//! * None
//! * Boolean (Rust `bool`)
//! * Integers (Rust `i64` or bigints from num)
//! * Floats (Rust `f64`)
//! * Bytes objects and bytearrays
//! * (Unicode) strings (Rust `String`)
//! * Lists and tuples (Rust `Vec<Value>`)
//! * Sets and frozensets (Rust `BTreeSet<HashableValue>`)
//! * Dictionaries (Rust `BTreeMap<HashableValue, Value>`)
//!
//! plus class references, instances of registered classes and placeholders.
//! These three can also be dict keys and set items; instances compare by
//! class and contents, placeholders additionally by their position in the
//! load.
//!
//! *Note on enums:* Enum variants are serialized as Python tuples `(name,
//! [data])` instead of mappings (or a plain string for unit variants).  On
//! deserialization, both the tuple form and the string/mapping form is
//! accepted.
//!
//! # Exported API
//!
//! Besides [`load`], [`loads`], [`save`], [`zsave`] and [`dumps`], the
//! library exports the underlying codec: generic serde functions `to_*` and
//! `from_*`, and `value_from_*`/`value_to_*` which work on [`Value`] and a
//! [`ClassResolver`] directly.
//!
//! # Unsupported features
//!
//! - Persistent IDs and the extension registry (`PERSID`, `EXT*` opcodes).
//! - Out-of-band data as introduced in Pickle protocol 5.

pub use self::chain::{
    Loaded,
    LoadOptions,
    Method,
    Strategy,
    deserialize,
    load,
    loads,
};

pub use self::save::{
    DiePolicy,
    SaveMethod,
    SaveOptions,
    Saved,
    dumps,
    save,
    save_serialize,
    serialize,
    zsave,
};

pub use self::source::{Container, Source, read_source};

pub use self::failure::{FailureLedger, FailureRecord, Unresolved, render_failures};

pub use self::resolve::{
    ClassFactory,
    ClassResolver,
    Fallback,
    FnFactory,
    Generic,
    Registry,
    RemapTable,
    RemapTarget,
};

pub use self::ser::{
    Serializer,
    SerOptions,
    to_writer,
    to_vec,
    value_to_writer,
    value_to_vec,
};

pub use self::de::{
    DeOptions,
    Encoding,
    Errors,
    PickleReader,
    from_reader,
    from_slice,
    from_iter,
    value_from_reader,
    value_from_reader_with,
    value_from_slice,
    value_from_slice_with,
    value_from_iter,
};

pub use self::value::{
    ClassRef,
    HashableValue,
    Instance,
    Value,
    to_value,
    from_value,
};

pub use self::error::{Error, ErrorCode, Result};

pub mod chain;
pub mod de;
pub mod error;
pub mod failure;
pub mod resolve;
pub mod save;
pub mod ser;
pub mod source;
pub mod value;
mod consts;
mod value_impls;

#[cfg(test)]
#[path = "../test/mod.rs"]
mod test;

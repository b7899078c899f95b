// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The unpickler chain.
//!
//! A load tries an ordered list of strategies on the same bytes, and the
//! first one to succeed wins.  The strict strategies come first and either
//! produce a faithful value or fail.  Unless the caller asks to die on
//! failure, two permissive strategies follow which substitute placeholders
//! for classes they cannot resolve, recording each one in the failure
//! ledger.

use std::fmt;
use std::str::FromStr;
use serde::de::DeserializeOwned;
use log::{debug, info, warn};

use crate::de::{value_from_slice_with, DeOptions, Encoding, Errors};
use crate::error::{Error, ErrorCode, Result};
use crate::failure::{render_failures, FailureLedger, FailureRecord};
use crate::resolve::{ClassResolver, Fallback, RemapTable, RemapTarget, Registry, TABULAR_COMPAT};
use crate::source::{read_source, Source};
use crate::value::{from_value, Value};

/// One way of unpickling a byte stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Standard unpickling: ASCII legacy strings, registered classes only.
    Pickle,
    /// Like `Pickle`, plus the historical locations of tabular-library
    /// classes; legacy strings fall back to latin-1.
    Tabular,
    /// Standard unpickling with latin-1 legacy strings.
    Encoded,
    /// Understands the placeholders written by the extended save format.
    Extended,
    /// Placeholders for unresolved classes, caller remapping only.
    Robust,
    /// Placeholders for unresolved classes, with known deprecation fixes.
    RobustRenaming,
    /// Universal placeholders; class resolution never fails.
    UltraRobust,
}

impl Strategy {
    pub fn name(self) -> &'static str {
        match self {
            Strategy::Pickle => "Pickle",
            Strategy::Tabular => "Tabular",
            Strategy::Encoded => "Encoded Pickle",
            Strategy::Extended => "Extended",
            Strategy::Robust => "Robust",
            Strategy::RobustRenaming => "Robust (renaming)",
            Strategy::UltraRobust => "Ultrarobust",
        }
    }

    /// Whether this strategy may produce placeholders.
    pub fn is_permissive(self) -> bool {
        matches!(self, Strategy::Robust | Strategy::RobustRenaming | Strategy::UltraRobust)
    }

    fn resolver(self, options: &LoadOptions, ledger: &FailureLedger) -> ClassResolver {
        let base = ClassResolver::new(options.registry.clone()).ledger(ledger.clone());
        match self {
            Strategy::Pickle | Strategy::Encoded => base,
            Strategy::Tabular => {
                let mut compat = RemapTable::new();
                compat.merge_missing(TABULAR_COMPAT.iter().cloned());
                base.remap(compat)
            }
            Strategy::Extended => base.extensions(true),
            Strategy::Robust => base.remap(options.remap.clone())
                                    .fallback(Fallback::Plain)
                                    .extensions(true),
            Strategy::RobustRenaming => base.remap(options.remap.clone())
                                            .auto_remap(true)
                                            .fallback(Fallback::Plain)
                                            .extensions(true),
            Strategy::UltraRobust => base.remap(options.remap.clone())
                                         .fallback(Fallback::Universal)
                                         .extensions(true),
        }
    }

    fn de_options(self, extras: &Extras) -> DeOptions {
        let options = DeOptions::new().fix_imports(extras.fix_imports.unwrap_or(true));
        match self {
            Strategy::Encoded => options.encoding(Encoding::Latin1),
            Strategy::Robust | Strategy::RobustRenaming | Strategy::UltraRobust =>
                options.encoding(Encoding::Latin1).errors(Errors::Ignore),
            _ => options.encoding(extras.encoding.unwrap_or(Encoding::Ascii))
                        .errors(extras.errors.unwrap_or(Errors::Strict)),
        }
    }

    /// Run this strategy once, returning the value and the failures it
    /// recorded.
    fn attempt(self, bytes: &[u8], options: &LoadOptions, extras: &Extras,
               ledger: &FailureLedger) -> Result<(Value, Vec<FailureRecord>)> {
        let de_options = self.de_options(extras);
        let mut resolver = self.resolver(options, ledger);
        let result = value_from_slice_with(bytes, de_options.clone(), &mut resolver);
        let value = match (self, result) {
            (Strategy::Tabular, Err(Error::Eval(ErrorCode::StringNotDecodable(_), _)))
                if de_options.get_encoding() != Encoding::Latin1 =>
            {
                debug!("{}: retrying legacy strings as latin-1", self);
                resolver = self.resolver(options, ledger);
                value_from_slice_with(bytes, de_options.encoding(Encoding::Latin1), &mut resolver)?
            }
            (_, result) => result?,
        };
        Ok((value, resolver.into_failures()))
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which family of strategies to try.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// Standard pickle streams.
    Primary,
    /// Streams written by the extended save format.
    Secondary,
    /// Both, primary first.
    Auto,
}

impl Default for Method {
    fn default() -> Method {
        Method::Primary
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Method> {
        match s {
            "pickle" | "primary" => Ok(Method::Primary),
            "dill" | "secondary" => Ok(Method::Secondary),
            "auto" => Ok(Method::Auto),
            _ => Err(Error::Config(format!(
                "invalid load method '{}': must be 'pickle', 'dill' or 'auto'", s))),
        }
    }
}

/// Validated extra loader options.
#[derive(Clone, Debug, Default)]
struct Extras {
    fix_imports: Option<bool>,
    encoding: Option<Encoding>,
    errors: Option<Errors>,
}

const EXTRA_KEYS: &[&str] = &["fix_imports", "encoding", "errors", "buffers", "ignore"];

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "True" | "1" => Ok(true),
        "false" | "False" | "0" => Ok(false),
        _ => Err(Error::Config(format!("option '{}' expects a boolean, got '{}'", key, value))),
    }
}

/// Options for loading.
#[derive(Clone, Debug)]
pub struct LoadOptions {
    method: Method,
    die_on_failure: bool,
    auto_remap: bool,
    remap: RemapTable,
    registry: Registry,
    ledger: Option<FailureLedger>,
    extras: Vec<(String, String)>,
}

impl LoadOptions {
    /// Construct with default options:
    ///
    /// - primary method
    /// - permissive strategies enabled, with known deprecation fixes
    /// - no registered classes and no remapping
    /// - failures recorded in the process-wide ledger
    pub fn new() -> Self {
        LoadOptions {
            method: Method::Primary,
            die_on_failure: false,
            auto_remap: true,
            remap: RemapTable::new(),
            registry: Registry::new(),
            ledger: None,
            extras: Vec::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Fail instead of returning values with placeholders.
    pub fn die_on_failure(mut self, die: bool) -> Self {
        self.die_on_failure = die;
        self
    }

    pub fn auto_remap(mut self, auto_remap: bool) -> Self {
        self.auto_remap = auto_remap;
        self
    }

    pub fn remap(mut self, remap: RemapTable) -> Self {
        self.remap = remap;
        self
    }

    /// Add one remapping from `"module.Name"` to a new location.
    pub fn remapping<K: Into<String>, T: Into<RemapTarget>>(mut self, key: K, target: T) -> Self {
        self.remap.insert(key, target);
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Record failures in this ledger instead of the process-wide one.
    pub fn ledger(mut self, ledger: FailureLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Pass an extra loader option.  Accepted keys are `fix_imports`,
    /// `encoding`, `errors`, `buffers` and `ignore`; anything else fails the
    /// load before the source is read.
    pub fn option<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.extras.push((key.into(), value.to_string()));
        self
    }

    /// The strategies a load will try, in order.
    pub fn strategies(&self) -> Vec<Strategy> {
        let mut strategies = match self.method {
            Method::Primary => vec![Strategy::Pickle, Strategy::Tabular, Strategy::Encoded],
            Method::Secondary => vec![Strategy::Extended],
            Method::Auto => vec![Strategy::Pickle, Strategy::Tabular, Strategy::Encoded,
                                 Strategy::Extended],
        };
        if !self.die_on_failure {
            strategies.push(if self.auto_remap { Strategy::RobustRenaming } else { Strategy::Robust });
            strategies.push(Strategy::UltraRobust);
        }
        strategies
    }

    fn extras(&self) -> Result<Extras> {
        let mut extras = Extras::default();
        for (key, value) in &self.extras {
            match &**key {
                "fix_imports" => extras.fix_imports = Some(parse_bool(key, value)?),
                "encoding" => match Encoding::parse(value) {
                    Some(encoding) => extras.encoding = Some(encoding),
                    None => return Err(Error::Config(format!("unknown encoding '{}'", value))),
                },
                "errors" => match Errors::parse(value) {
                    Some(errors) => extras.errors = Some(errors),
                    None => return Err(Error::Config(format!("unknown error handler '{}'", value))),
                },
                "buffers" | "ignore" => {}
                _ => return Err(Error::Config(format!(
                    "keyword \"{}\" is not a valid keyword: {}", key, EXTRA_KEYS.join(", ")))),
            }
        }
        Ok(extras)
    }

    /// Check the extra options without loading anything.
    pub fn validate(&self) -> Result<()> {
        self.extras().map(|_| ())
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions::new()
    }
}

/// The result of a successful load.
#[derive(Debug)]
pub struct Loaded {
    pub value: Value,
    /// The strategy that produced the value.
    pub strategy: Strategy,
    /// Failures recorded by the winning strategy, one per placeholder class
    /// occurrence.
    pub failures: Vec<FailureRecord>,
    /// Errors of the strategies tried before the winning one.
    pub errors: Vec<(Strategy, String)>,
}

impl Loaded {
    /// Whether the value contains placeholders for unresolved classes.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    /// The failure report for this load.
    pub fn report(&self, verbose: bool) -> String {
        render_failures(&self.failures, verbose)
    }

    /// Convert the loaded value into a Rust type.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T> {
        from_value(self.value)
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

/// Unpickle decoded bytes by trying each strategy of the chain in turn.
pub fn deserialize(bytes: &[u8], options: &LoadOptions) -> Result<Loaded> {
    let extras = options.extras()?;
    let ledger = options.ledger.clone().unwrap_or_else(FailureLedger::global);
    let mut errors = Vec::new();
    for strategy in options.strategies() {
        match strategy.attempt(bytes, options, &extras, &ledger) {
            Ok((value, failures)) => {
                let loaded = Loaded { value, strategy, failures, errors };
                if loaded.is_degraded() {
                    warn!("the following errors were encountered during unpickling:{}",
                          loaded.report(false));
                }
                return Ok(loaded);
            }
            Err(err) => {
                debug!("{} failed ({})", strategy, err);
                errors.push((strategy, err.to_string()));
            }
        }
    }
    Err(Error::StrategyExhausted(errors))
}

/// Load a pickle from a path, an in-memory buffer or a reader.  The
/// container (gzip, zstandard or none) is detected by trial decoding.
pub fn load<'a, S: Into<Source<'a>>>(source: S, options: &LoadOptions) -> Result<Loaded> {
    // Bad options must fail before anything is read.
    options.validate()?;
    let source = source.into();
    let name = crate::source::describe(&source);
    let bytes = read_source(source)?;
    let loaded = deserialize(&bytes, options)?;
    if loaded.is_degraded() {
        info!("loaded {} with {} unresolved classes", name, loaded.failures.len());
    } else {
        info!("loaded {} ({})", name, loaded.strategy);
    }
    Ok(loaded)
}

/// Load a pickle from a byte string as produced by `dumps`.
pub fn loads(bytes: &[u8], options: &LoadOptions) -> Result<Loaded> {
    load(Source::Bytes(bytes), options)
}

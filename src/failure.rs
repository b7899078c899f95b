// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Failure capture: records of classes that could not be resolved, the
//! ledger collecting them, and the placeholder value standing in for their
//! instances.
//!
//! # Ledger lifecycle
//!
//! The process-wide ledger returned by [`FailureLedger::global`] is created
//! on first use and lives until the process exits.  Every unresolved class
//! encountered by a permissive unpickling strategy appends one record while
//! holding the ledger's lock.  Records are never removed implicitly; callers
//! that want a fresh view use [`FailureLedger::drain`].  Loads may be pointed
//! at a private ledger instead (see `LoadOptions::ledger`).

use std::fmt;
use std::sync::Arc;
use std::collections::BTreeMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::value::{ClassRef, HashableValue, Value};

/// One class resolution failure.
#[derive(Clone, Debug, PartialEq)]
pub struct FailureRecord {
    /// Creation order within the ledger, starting at 1.
    pub number: usize,
    pub module: String,
    pub class: String,
    pub error: String,
    /// Debug rendering of the underlying error.
    pub detail: String,
}

impl FailureRecord {
    /// The ledger key, e.g. `"Failure 3"`.
    pub fn label(&self) -> String {
        format!("Failure {}", self.number)
    }

    pub fn class_ref(&self) -> ClassRef {
        ClassRef::new(self.module.clone(), self.class.clone())
    }
}

/// Render a multi-failure report.  Entries are numbered by their position
/// in `records`.
pub fn render_failures(records: &[FailureRecord], verbose: bool) -> String {
    let mut output = String::new();
    for (i, failure) in records.iter().enumerate() {
        output.push_str(&format!("\nFailure {} of {}:\n", i + 1, records.len()));
        output.push_str(&format!("Module: {}\n", failure.module));
        output.push_str(&format!("Class: {}\n", failure.class));
        output.push_str(&format!("Error: {}\n", failure.error));
        if verbose {
            output.push_str("\nTraceback:\n");
            output.push_str(&format!("\n{}", failure.detail));
            output.push_str("\n\n");
        }
    }
    output
}

#[derive(Default)]
struct LedgerState {
    records: Vec<FailureRecord>,
    issued: usize,
}

/// An ordered, append-only collection of failure records, shared by handle.
///
/// Cloning a ledger clones the handle: all clones append to the same list.
#[derive(Clone, Default)]
pub struct FailureLedger {
    state: Arc<Mutex<LedgerState>>,
}

static GLOBAL_LEDGER: Lazy<FailureLedger> = Lazy::new(FailureLedger::new);

impl FailureLedger {
    /// A new, private ledger.
    pub fn new() -> FailureLedger {
        FailureLedger::default()
    }

    /// The process-wide ledger.
    pub fn global() -> FailureLedger {
        GLOBAL_LEDGER.clone()
    }

    /// Append a record and return it.  The record number is assigned under
    /// the lock, so concurrent loads never share a number.
    pub fn record<E: fmt::Display + fmt::Debug>(&self, class: &ClassRef, error: &E) -> FailureRecord {
        let mut state = self.state.lock();
        state.issued += 1;
        let record = FailureRecord {
            number: state.issued,
            module: class.module.clone(),
            class: class.name.clone(),
            error: error.to_string(),
            detail: format!("{:?}", error),
        };
        state.records.push(record.clone());
        record
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all records currently held.
    pub fn records(&self) -> Vec<FailureRecord> {
        self.state.lock().records.clone()
    }

    /// Records created after the given number, i.e. since a previous
    /// [`FailureLedger::issued`] call.
    pub fn records_since(&self, issued: usize) -> Vec<FailureRecord> {
        self.state.lock().records.iter().filter(|r| r.number > issued).cloned().collect()
    }

    /// Total number of records ever appended, including drained ones.
    pub fn issued(&self) -> usize {
        self.state.lock().issued
    }

    /// Remove and return all records.  Numbering continues where it left off.
    pub fn drain(&self) -> Vec<FailureRecord> {
        std::mem::take(&mut self.state.lock().records)
    }

    /// The failure report over every record in the ledger.
    pub fn report(&self, verbose: bool) -> String {
        render_failures(&self.records(), verbose)
    }
}

impl PartialEq for FailureLedger {
    fn eq(&self, other: &FailureLedger) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for FailureLedger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FailureLedger").field("records", &self.len()).finish()
    }
}

/// Placeholder for an instance of a class that could not be resolved.
///
/// The plain variant keeps nothing but the failure information.  The
/// universal variant also keeps the constructor arguments and the state the
/// stream tried to restore, so that at least shallow data is recoverable;
/// dict state is exposed through [`get`](Unresolved::get) and
/// [`set`](Unresolved::set).
#[derive(Clone, Debug, PartialEq)]
pub struct Unresolved {
    pub class: ClassRef,
    /// Number of the ledger record created for this class.
    pub failure: usize,
    pub error: String,
    pub universal: bool,
    /// Position among the placeholders built by one load, starting at 1;
    /// distinguishes otherwise identical placeholders used as dict keys.
    pub occurrence: usize,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<HashableValue, Value>,
    pub dict: BTreeMap<HashableValue, Value>,
    /// State that was not a dict, or dict entries with unhashable keys.
    pub raw_state: Option<Value>,
    pub ledger: FailureLedger,
}

impl Unresolved {
    pub fn new(class: ClassRef, record: &FailureRecord, universal: bool,
               ledger: FailureLedger) -> Unresolved {
        Unresolved {
            class,
            failure: record.number,
            error: record.error.clone(),
            universal,
            occurrence: 0,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            dict: BTreeMap::new(),
            raw_state: None,
            ledger,
        }
    }

    /// Record constructor arguments.  Plain placeholders discard them.
    pub fn capture_args(&mut self, args: Vec<Value>, kwargs: BTreeMap<HashableValue, Value>) {
        if self.universal {
            self.args = args;
            self.kwargs = kwargs;
        }
    }

    /// Restore state the way `__dict__.update()` would, falling back to
    /// keeping the raw state.  Never fails; plain placeholders discard it.
    pub fn capture_state(&mut self, state: Value) {
        if !self.universal {
            return;
        }
        match state {
            Value::Dict(dict) => self.dict.extend(dict),
            Value::None => {}
            other => self.raw_state = Some(other),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.dict.get(&HashableValue::String(key.into()))
    }

    pub fn get_key(&self, key: &HashableValue) -> Option<&Value> {
        self.dict.get(key)
    }

    pub fn set<K: Into<String>>(&mut self, key: K, value: Value) -> Option<Value> {
        self.dict.insert(HashableValue::String(key.into()), value)
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    /// Multi-line listing of everything captured.
    pub fn disp(&self) -> String {
        let mut out = format!("<unresolved {} (failure {}): {}>\n", self.class, self.failure,
                              self.error);
        if !self.args.is_empty() {
            out.push_str(&format!("  args: {}\n", Value::Tuple(self.args.clone())));
        }
        for (key, value) in &self.kwargs {
            out.push_str(&format!("  kwarg {}: {}\n", key, value));
        }
        for (key, value) in &self.dict {
            out.push_str(&format!("  {}: {}\n", key, value));
        }
        if let Some(ref raw) = self.raw_state {
            out.push_str(&format!("  state: {}\n", raw));
        }
        out
    }

    /// The failure report for every record in this placeholder's ledger.
    pub fn show_failures(&self, verbose: bool) -> String {
        self.ledger.report(verbose)
    }
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<unresolved {}>", self.class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(ledger: &FailureLedger, module: &str, name: &str) -> FailureRecord {
        ledger.record(&ClassRef::new(module, name), &"no such class")
    }

    #[test]
    fn numbering_survives_drain() {
        let ledger = FailureLedger::new();
        assert_eq!(failing(&ledger, "a", "A").label(), "Failure 1");
        assert_eq!(failing(&ledger, "b", "B").number, 2);
        assert_eq!(ledger.drain().len(), 2);
        assert!(ledger.is_empty());
        assert_eq!(failing(&ledger, "c", "C").number, 3);
        assert_eq!(ledger.records_since(2).len(), 1);
    }

    #[test]
    fn clones_share_records() {
        let ledger = FailureLedger::new();
        let other = ledger.clone();
        failing(&other, "x", "Y");
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger, other);
        assert!(ledger != FailureLedger::new());
    }

    #[test]
    fn report_lists_every_failure() {
        let ledger = FailureLedger::new();
        failing(&ledger, "old.models", "Patient");
        failing(&ledger, "old.models", "Ward");
        let report = ledger.report(false);
        assert!(report.contains("Failure 1 of 2:\nModule: old.models\nClass: Patient\n"));
        assert!(report.contains("Failure 2 of 2:"));
        assert!(report.contains("Error: no such class"));
        assert!(!report.contains("Traceback"));
        assert!(ledger.report(true).contains("Traceback:\n\n\"no such class\""));
    }

    #[test]
    fn concurrent_records_get_distinct_numbers() {
        let ledger = FailureLedger::new();
        let handles: Vec<_> = (0..8).map(|i| {
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    failing(&ledger, "m", &format!("C{}", i));
                }
            })
        }).collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let mut numbers: Vec<_> = ledger.records().iter().map(|r| r.number).collect();
        numbers.sort();
        numbers.dedup();
        assert_eq!(numbers.len(), 200);
    }

    #[test]
    fn universal_placeholder_keeps_state() {
        let ledger = FailureLedger::new();
        let record = failing(&ledger, "m", "C");
        let mut plain = Unresolved::new(record.class_ref(), &record, false, ledger.clone());
        plain.capture_args(vec![Value::I64(1)], BTreeMap::new());
        plain.capture_state(Value::Dict(BTreeMap::new()));
        assert!(plain.args.is_empty());

        let mut universal = Unresolved::new(record.class_ref(), &record, true, ledger);
        universal.capture_args(vec![Value::I64(1)], BTreeMap::new());
        let mut state = BTreeMap::new();
        state.insert(HashableValue::String("x".into()), Value::I64(5));
        universal.capture_state(Value::Dict(state));
        universal.capture_state(Value::List(vec![]));
        assert_eq!(universal.get("x"), Some(&Value::I64(5)));
        assert_eq!(universal.len(), 1);
        universal.set("y", Value::Bool(true));
        assert_eq!(universal.len(), 2);
        assert_eq!(universal.raw_state, Some(Value::List(vec![])));
        assert!(universal.disp().contains("args: (1,)"));
    }
}

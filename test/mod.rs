// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.


macro_rules! treemap {
    ($($k:expr => $v:expr),*) => {
        {
            let mut m = BTreeMap::new();
            $(m.insert($k, $v);)*
            m
        }
    };
}

fn ledger_options() -> (crate::FailureLedger, crate::LoadOptions) {
    let ledger = crate::FailureLedger::new();
    let options = crate::LoadOptions::new().ledger(ledger.clone());
    (ledger, options)
}

mod struct_tests {
    use std::fmt;
    use serde::ser;
    use serde_derive::{Serialize, Deserialize};
    use crate::{to_vec, from_slice, value_from_slice, loads, DeOptions, LoadOptions, SerOptions,
                Value};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Inner {
        a: (),
        b: usize,
        c: Vec<String>,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Outer {
        inner: Vec<Inner>,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Unit;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Newtype(i32);

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Tuple(i32, bool);

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    enum Animal {
        Dog,
        AntHive(Vec<String>),
        Frog(String, Vec<isize>),
        Cat { age: usize, name: String },
    }

    fn test_encode_ok<T>(value: T, repr: &'static str)
        where T: PartialEq + fmt::Debug + ser::Serialize,
    {
        let vec = to_vec(&value, SerOptions::new()).unwrap();
        let val: Value = value_from_slice(&vec, DeOptions::new()).unwrap();
        assert_eq!(format!("{}", val), repr);
    }

    #[test]
    fn encode_types() {
        test_encode_ok((), "None");
        test_encode_ok(None::<i32>, "None");
        test_encode_ok(Some(false), "False");
        test_encode_ok(4.5_f64, "4.5");
        test_encode_ok(u64::max_value(), "18446744073709551615");
    }

    #[test]
    fn encode_struct() {
        test_encode_ok(Unit, "()");
        test_encode_ok(Newtype(42), "42");
        test_encode_ok(Tuple(42, false), "(42, False)");
        test_encode_ok(Inner { a: (), b: 32, c: vec!["doc".into()] },
                       r#"{"a": None, "b": 32, "c": ["doc"]}"#);
    }

    #[test]
    fn encode_enum() {
        test_encode_ok(Animal::Dog, r#"("Dog",)"#);
        test_encode_ok(Animal::AntHive(vec!["ant".into(), "aunt".into()]),
                       r#"("AntHive", ["ant", "aunt"])"#);
        test_encode_ok(Animal::Frog("Henry".into(), vec![1, 5]),
                       r#"("Frog", ["Henry", [1, 5]])"#);
        test_encode_ok(Animal::Cat { age: 5, name: "Molyneux".into() },
                       r#"("Cat", {"age": 5, "name": "Molyneux"})"#);
    }

    #[test]
    fn typed_roundtrip() {
        let outer = Outer { inner: vec![Inner { a: (), b: 7, c: vec!["x".into(), "y".into()] }] };
        let vec = to_vec(&outer, SerOptions::new()).unwrap();
        assert_eq!(from_slice::<Outer>(&vec, DeOptions::new()).unwrap(), outer);

        let animals = vec![Animal::Dog, Animal::Frog("Henry".into(), vec![-1]),
                           Animal::Cat { age: 5, name: "Molyneux".into() }];
        let vec = to_vec(&animals, SerOptions::new().extended()).unwrap();
        let loaded = loads(&vec, &LoadOptions::new()).unwrap();
        assert_eq!(loaded.deserialize::<Vec<Animal>>().unwrap(), animals);
    }

    #[test]
    fn enum_string_and_dict_forms() {
        // A bare variant name, and serde_json's externally tagged form.
        let vec = b"\x80\x03X\x03\x00\x00\x00Dogq\x00.";
        assert_eq!(from_slice::<Animal>(vec, DeOptions::new()).unwrap(), Animal::Dog);
        let vec = b"\x80\x03}q\x00X\x07\x00\x00\x00AntHiveq\x01]q\x02X\x03\x00\x00\x00antq\x03as.";
        assert_eq!(from_slice::<Animal>(vec, DeOptions::new()).unwrap(),
                   Animal::AntHive(vec!["ant".into()]));
    }
}

mod value_tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::iter::FromIterator;
    use num_bigint::BigInt;
    use rand::{Rng, thread_rng};
    use quickcheck::{QuickCheck, StdGen};
    use super::arby;
    use crate::{value_from_reader, value_from_slice, value_from_slice_with, value_from_iter,
                value_to_vec, to_vec, from_slice};
    use crate::{ClassRef, ClassResolver, DeOptions, Encoding, HashableValue, Instance,
                Registry, SerOptions, Value};
    use crate::error::{Error, ErrorCode};

    fn get_test_object() -> Value {
        let longish = BigInt::from(10000000000u64) * BigInt::from(10000000000u64);
        let set = BTreeSet::from_iter(vec![HashableValue::I64(42), HashableValue::I64(0)]);
        Value::Dict(treemap!(
            HashableValue::None => Value::None,
            HashableValue::Bool(false) => Value::Tuple(vec![Value::Bool(false),
                                                            Value::Bool(true)]),
            HashableValue::I64(10) => Value::I64(100000),
            HashableValue::Int(longish.clone()) => Value::Int(longish),
            HashableValue::F64(1.0) => Value::F64(1.0),
            HashableValue::Bytes(b"bytes".to_vec()) => Value::Bytes(b"bytes".to_vec()),
            HashableValue::String("string".into()) => Value::String("string".into()),
            HashableValue::FrozenSet(set.clone()) => Value::FrozenSet(set.clone()),
            HashableValue::Tuple(vec![HashableValue::I64(1), HashableValue::I64(2)]) =>
                Value::Tuple(vec![Value::I64(1), Value::I64(2), Value::I64(3)]),
            HashableValue::Tuple(vec![]) =>
                Value::List(vec![
                    Value::List(vec![Value::I64(1), Value::I64(2), Value::I64(3)]),
                    Value::Set(set),
                    Value::Dict(BTreeMap::new())
                ])))
    }

    fn patient(name: &str) -> Value {
        let state = treemap!(HashableValue::String("name".into()) => Value::String(name.into()));
        Value::Object(Box::new(Instance::with_state(ClassRef::new("clinic.models", "Patient"),
                                                    Value::Dict(state))))
    }

    #[test]
    fn roundtrip_all_protocols() {
        let dict = get_test_object();
        for options in &[SerOptions::new().proto_v2(), SerOptions::new(), SerOptions::new().extended()] {
            let vec = value_to_vec(&dict, *options).unwrap();
            assert_eq!(vec[1], options.protocol());
            let tripped = value_from_slice(&vec, DeOptions::new()).unwrap();
            assert_eq!(dict, tripped);
        }
    }

    #[test]
    fn reader_and_iter() {
        let vec = value_to_vec(&get_test_object(), SerOptions::new()).unwrap();
        assert_eq!(value_from_reader(&vec[..], DeOptions::new()).unwrap(), get_test_object());
        assert_eq!(value_from_iter(vec.iter().cloned(), DeOptions::new()).unwrap(),
                   get_test_object());
    }

    #[test]
    fn protocol_0_text_stream() {
        let stream = b"(lp0\nI1\naI01\naS'abc'\np1\naL12345678901234567890L\na(dp2\nVkey\np3\ng1\ns\
                       a.";
        let expected = Value::List(vec![
            Value::I64(1),
            Value::Bool(true),
            Value::String("abc".into()),
            Value::Int(BigInt::parse_bytes(b"12345678901234567890", 10).unwrap()),
            Value::Dict(treemap!(HashableValue::String("key".into()) =>
                                 Value::String("abc".into()))),
        ]);
        assert_eq!(value_from_slice(stream, DeOptions::new()).unwrap(), expected);
        // Legacy strings can be kept as bytes.
        match value_from_slice(stream, DeOptions::new().encoding(Encoding::Bytes)).unwrap() {
            Value::List(items) => assert_eq!(items[2], Value::Bytes(b"abc".to_vec())),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn py2_builtins_are_fixed() {
        let stream = b"c__builtin__\nset\np0\n((lp1\nI1\naI2\natp2\nRp3\n.";
        let expected = Value::Set(BTreeSet::from_iter(vec![HashableValue::I64(1),
                                                            HashableValue::I64(2)]));
        assert_eq!(value_from_slice(stream, DeOptions::new()).unwrap(), expected);
        let stream = b"c__builtin__\nunicode\n.";
        let registry = Registry::new().with_generic("builtins", "str");
        let mut resolver = ClassResolver::new(registry.clone());
        assert_eq!(value_from_slice_with(stream, DeOptions::new(), &mut resolver).unwrap(),
                   Value::Class(ClassRef::new("builtins", "str")));
        let mut resolver = ClassResolver::new(registry);
        match value_from_slice_with(stream, DeOptions::new().fix_imports(false), &mut resolver) {
            Err(Error::Eval(ErrorCode::UnresolvedClass { module, name, .. }, _)) => {
                assert_eq!(module, "__builtin__");
                assert_eq!(name, "unicode");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn protocol_0_reconstructor() {
        let stream = b"ccopy_reg\n_reconstructor\np0\n(cclinic.models\nPatient\np1\n\
                       c__builtin__\nobject\np2\nNtp3\nRp4\n(dp5\nVname\np6\nVAnn\np7\nsb.";
        let mut resolver = ClassResolver::new(arby::registry());
        let value = value_from_slice_with(stream, DeOptions::new(), &mut resolver).unwrap();
        assert_eq!(value, patient("Ann"));
        // Without the class registered, strict decoding fails.
        assert!(value_from_slice(stream, DeOptions::new()).is_err());
    }

    #[test]
    fn protocol_0_builtin_subclass() {
        // `copyreg._reconstructor(Roster, list, [1, 2])` for a list subclass.
        let stream = b"ccopy_reg\n_reconstructor\np0\n(cclinic.models\nRoster\np1\n\
                       c__builtin__\nlist\np2\n(lp3\nI1\naI2\natp4\nRp5\n.";
        let mut resolver = ClassResolver::new(Registry::new().with_generic("clinic.models", "Roster"));
        let value = value_from_slice_with(stream, DeOptions::new(), &mut resolver).unwrap();
        let mut roster = Instance::new(ClassRef::new("clinic.models", "Roster"));
        roster.args = vec![Value::List(vec![Value::I64(1), Value::I64(2)])];
        assert_eq!(value, Value::Object(Box::new(roster)));
    }

    #[test]
    fn instances_roundtrip() {
        let mut resolver = ClassResolver::new(arby::registry());
        let value = Value::List(vec![patient("Ann"), patient("Bob")]);
        let vec = value_to_vec(&value, SerOptions::new()).unwrap();
        assert_eq!(value_from_slice_with(&vec, DeOptions::new(), &mut resolver).unwrap(), value);
        assert!(resolver.failures().is_empty());
    }

    #[test]
    fn keyword_arguments_need_protocol_4() {
        let mut instance = Instance::new(ClassRef::new("clinic.models", "Ward"));
        instance.args = vec![Value::I64(3)];
        instance.kwargs.insert(HashableValue::String("floor".into()), Value::I64(2));
        let value = Value::Object(Box::new(instance));
        match value_to_vec(&value, SerOptions::new()) {
            Err(Error::Syntax(ErrorCode::Unpicklable(_))) => {}
            other => panic!("unexpected {:?}", other),
        }
        let vec = value_to_vec(&value, SerOptions::new().extended()).unwrap();
        let mut resolver = ClassResolver::new(arby::registry());
        assert_eq!(value_from_slice_with(&vec, DeOptions::new(), &mut resolver).unwrap(), value);
    }

    #[test]
    fn shared_memo_entries() {
        // l = [1]; (l, l)
        let stream = b"\x80\x02]q\x00K\x01ah\x00\x86q\x01.";
        let list = Value::List(vec![Value::I64(1)]);
        assert_eq!(value_from_slice(stream, DeOptions::new()).unwrap(),
                   Value::Tuple(vec![list.clone(), list]));
    }

    #[test]
    fn recursive() {
        // l = []; l.append(l)
        let stream = b"\x80\x02]q\x00h\x00a.";
        match value_from_slice(stream, DeOptions::new()) {
            Err(Error::Syntax(ErrorCode::Recursive)) => {}
            other => panic!("wrong/no error returned for recursive structure: {:?}", other),
        }
    }

    #[test]
    fn bad_streams() {
        match value_from_slice(b"\x80\x02K\x01", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::EOFWhileParsing, _)) => {}
            other => panic!("unexpected {:?}", other),
        }
        match value_from_slice(b"\x80\x02K\x01.K", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::TrailingBytes, _)) => {}
            other => panic!("unexpected {:?}", other),
        }
        match value_from_slice(b"\x80\x02h\x05.", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::MissingMemo(5), _)) => {}
            other => panic!("unexpected {:?}", other),
        }
        match value_from_slice(b"\x80\x09N.", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::InvalidValue(_), _)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn fuzzing() {
        // Tries to ensure that we don't panic when encountering strange streams.
        for _ in 0..1000 {
            let mut stream = [0u8; 1000];
            thread_rng().fill(&mut stream[..]);
            if *stream.last().unwrap() == b'.' { continue; }
            // These must all fail with an error, since we skip the check if the
            // last byte is a STOP opcode.
            assert!(value_from_slice(&stream, DeOptions::new()).is_err());
        }
    }

    #[test]
    fn qc_roundtrip() {
        fn roundtrip(original: Value) {
            for options in &[SerOptions::new().proto_v2(), SerOptions::new(),
                             SerOptions::new().extended()] {
                let vec = value_to_vec(&original, *options).unwrap();
                let mut resolver = ClassResolver::new(arby::registry());
                let tripped = value_from_slice_with(&vec, DeOptions::new(), &mut resolver).unwrap();
                assert_eq!(original, tripped);
            }
        }
        QuickCheck::new().gen(StdGen::new(thread_rng(), 10))
                         .tests(2000)
                         .quickcheck(roundtrip as fn(_));
    }

    #[test]
    fn roundtrip_json() {
        let original: serde_json::Value = serde_json::from_str(r#"[
            {"null": null,
             "false": false,
             "true": true,
             "int": -1238571,
             "float": 1.5e10,
             "list": [false, 5, "true", 3.8]
            }
        ]"#).unwrap();
        let vec: Vec<_> = to_vec(&original, SerOptions::new()).unwrap();
        let tripped: serde_json::Value = from_slice(&vec, DeOptions::new()).unwrap();
        assert_eq!(original, tripped);
    }
}

mod chain_tests {
    use std::collections::BTreeMap;
    use super::ledger_options;
    use crate::{loads, deserialize, value_to_vec, ClassRef, Error, ErrorCode, FnFactory, Generic,
                HashableValue, Instance, LoadOptions, Method, Registry, RemapTarget, SerOptions,
                Strategy, Value};

    fn instance_stream(module: &str, name: &str, args: Vec<Value>) -> Vec<u8> {
        let state = treemap!(HashableValue::String("name".into()) => Value::String("Ann".into()));
        let mut instance = Instance::with_state(ClassRef::new(module, name), Value::Dict(state));
        instance.args = args;
        value_to_vec(&Value::Object(Box::new(instance)), SerOptions::new()).unwrap()
    }

    #[test]
    fn strategy_lists() {
        use crate::Strategy::*;
        assert_eq!(LoadOptions::new().strategies(),
                   vec![Pickle, Tabular, Encoded, RobustRenaming, UltraRobust]);
        assert_eq!(LoadOptions::new().method(Method::Secondary).auto_remap(false).strategies(),
                   vec![Extended, Robust, UltraRobust]);
        assert_eq!(LoadOptions::new().method(Method::Auto).die_on_failure(true).strategies(),
                   vec![Pickle, Tabular, Encoded, Extended]);
        assert_eq!("dill".parse::<Method>().unwrap(), Method::Secondary);
        assert!(matches!("yaml".parse::<Method>(), Err(Error::Config(_))));
        assert_eq!(Strategy::Encoded.to_string(), "Encoded Pickle");
        assert!(UltraRobust.is_permissive() && !Extended.is_permissive());
    }

    #[test]
    fn plain_load() {
        let vec = value_to_vec(&Value::List(vec![Value::I64(1)]), SerOptions::new()).unwrap();
        let (ledger, options) = ledger_options();
        let loaded = loads(&vec, &options).unwrap();
        assert_eq!(loaded.strategy, Strategy::Pickle);
        assert!(!loaded.is_degraded());
        assert!(loaded.errors.is_empty());
        assert!(ledger.is_empty());
        assert_eq!(loaded.into_value(), Value::List(vec![Value::I64(1)]));
    }

    #[test]
    fn degraded_load_records_one_failure() {
        let vec = instance_stream("old.models", "Patient", vec![]);
        let (ledger, options) = ledger_options();
        let loaded = loads(&vec, &options).unwrap();
        assert_eq!(loaded.strategy, Strategy::RobustRenaming);
        assert_eq!(loaded.errors.len(), 3);
        assert!(loaded.is_degraded());
        assert_eq!(ledger.len(), 1);
        assert_eq!(loaded.failures, ledger.records());
        match loaded.value {
            Value::Unresolved(ref u) => {
                assert_eq!(u.class, ClassRef::new("old.models", "Patient"));
                assert_eq!(u.failure, loaded.failures[0].number);
                assert!(!u.universal);
                assert!(u.is_empty());
            }
            ref other => panic!("unexpected {}", other),
        }
        let report = loaded.report(false);
        assert!(report.contains("Failure 1 of 1:\nModule: old.models\nClass: Patient\n"));

        let loaded = loads(&vec, &options.clone().auto_remap(false)).unwrap();
        assert_eq!(loaded.strategy, Strategy::Robust);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn die_on_failure_exhausts() {
        let vec = instance_stream("old.models", "Patient", vec![]);
        let (ledger, options) = ledger_options();
        match loads(&vec, &options.die_on_failure(true)) {
            Err(Error::StrategyExhausted(errors)) => {
                let tried: Vec<_> = errors.iter().map(|e| e.0).collect();
                assert_eq!(tried, vec![Strategy::Pickle, Strategy::Tabular, Strategy::Encoded]);
                assert!(errors[0].1.contains("old.models"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(ledger.is_empty());
    }

    #[test]
    fn ultrarobust_captures_failing_factories() {
        let broken = FnFactory(|_: &ClassRef, _: Vec<Value>| -> crate::Result<Value> {
            Err(Error::Syntax(ErrorCode::Construction("boom".into())))
        });
        let mut registry = Registry::new();
        registry.register("clinic.models", "Broken", broken);
        let vec = instance_stream("clinic.models", "Broken", vec![Value::I64(3)]);
        let (ledger, options) = ledger_options();
        let loaded = loads(&vec, &options.registry(registry)).unwrap();
        assert_eq!(loaded.strategy, Strategy::UltraRobust);
        assert_eq!(ledger.len(), 1);
        match loaded.value {
            Value::Unresolved(ref u) => {
                assert!(u.universal);
                assert!(u.error.contains("boom"));
                assert_eq!(u.args, vec![Value::I64(3)]);
                assert_eq!(u.get("name"), Some(&Value::String("Ann".into())));
            }
            ref other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn caller_remapping() {
        let vec = instance_stream("old.place", "Cat", vec![]);
        let registry = Registry::new().with_generic("new.place", "Cat");
        for target in vec![RemapTarget::from("new.place.Cat"),
                           RemapTarget::from(("new.place", "Cat")),
                           RemapTarget::factory(Generic)] {
            let (ledger, options) = ledger_options();
            let options = options.registry(registry.clone()).remapping("old.place.Cat", target);
            let loaded = loads(&vec, &options).unwrap();
            assert!(loaded.strategy.is_permissive());
            assert!(!loaded.is_degraded());
            assert!(ledger.is_empty());
            match loaded.value {
                Value::Object(ref obj) =>
                    assert_eq!(obj.attr("name"), Some(&Value::String("Ann".into()))),
                ref other => panic!("unexpected {}", other),
            }
        }
        let (_, options) = ledger_options();
        let options = options.remapping("old.place.Cat", RemapTarget::factory(
            FnFactory(|_: &ClassRef, _: Vec<Value>| -> crate::Result<Value> {
                Ok(Value::String("cat".into()))
            })));
        // The factory's value has no state to set.
        assert!(loads(&vec, &options).unwrap().is_degraded());
    }

    #[test]
    fn known_fixes_are_idempotent() {
        let vec = instance_stream("pandas.core.indexes.numeric", "Int64Index", vec![]);
        let registry = Registry::new().with_generic("pandas.core.indexes.api", "Index");
        let (ledger, options) = ledger_options();
        let options = options.registry(registry);
        let first = loads(&vec, &options).unwrap();
        let second = loads(&vec, &options).unwrap();
        for loaded in &[&first, &second] {
            assert_eq!(loaded.strategy, Strategy::RobustRenaming);
            match loaded.value {
                Value::Object(ref obj) =>
                    assert_eq!(obj.class, ClassRef::new("pandas.core.indexes.api", "Index")),
                ref other => panic!("unexpected {}", other),
            }
        }
        assert_eq!(first.value, second.value);
        assert!(ledger.is_empty());
    }

    #[test]
    fn tabular_compat_renames() {
        let vec = instance_stream("pandas.indexes.base", "Index", vec![]);
        let registry = Registry::new().with_generic("pandas.core.indexes.base", "Index");
        let (_, options) = ledger_options();
        let loaded = loads(&vec, &options.registry(registry)).unwrap();
        assert_eq!(loaded.strategy, Strategy::Tabular);
    }

    #[test]
    fn legacy_latin1_strings() {
        let stream = b"\x80\x02U\x04caf\xe9q\x00.";
        let (_, options) = ledger_options();
        let loaded = deserialize(stream, &options).unwrap();
        assert_eq!(loaded.strategy, Strategy::Tabular);
        assert_eq!(loaded.value, Value::String("caf\u{e9}".into()));

        let loaded = deserialize(stream, &options.clone().option("encoding", "latin1")).unwrap();
        assert_eq!(loaded.strategy, Strategy::Pickle);
        let loaded = deserialize(stream, &options.clone().option("encoding", "bytes")).unwrap();
        assert_eq!(loaded.value, Value::Bytes(b"caf\xe9".to_vec()));
        let loaded = deserialize(stream, &options.clone().option("errors", "ignore")).unwrap();
        assert_eq!(loaded.strategy, Strategy::Pickle);
        assert_eq!(loaded.value, Value::String("caf".into()));

        let options = options.method(Method::Secondary).die_on_failure(true);
        assert!(matches!(deserialize(stream, &options), Err(Error::StrategyExhausted(_))));
    }

    #[test]
    fn extras_are_validated_first() {
        let missing = std::path::Path::new("/nonexistent/robust-pickle/data.obj");
        let options = LoadOptions::new().option("encodnig", "latin1");
        match crate::load(missing, &options) {
            Err(Error::Config(msg)) => {
                assert!(msg.contains("encodnig"));
                assert!(msg.contains("fix_imports, encoding, errors, buffers, ignore"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(LoadOptions::new().option("fix_imports", "maybe").validate().is_err());
        assert!(LoadOptions::new().option("errors", "loud").validate().is_err());
        assert!(LoadOptions::new().option("fix_imports", false).option("buffers", "")
                                  .option("ignore", true).validate().is_ok());
        assert!(matches!(crate::load(missing, &LoadOptions::new()), Err(Error::NotFound(_))));
    }

    fn kind(module: &str, value: i64) -> HashableValue {
        let mut instance = Instance::new(ClassRef::new(module, "Kind"));
        instance.args = vec![Value::I64(value)];
        HashableValue::Object(Box::new(instance))
    }

    #[test]
    fn instances_as_dict_keys() {
        let dict = Value::Dict(treemap!(kind("clinic", 1) => Value::String("a".into()),
                                        kind("clinic", 2) => Value::String("b".into())));
        let vec = value_to_vec(&dict, SerOptions::new()).unwrap();

        let (_, options) = ledger_options();
        let loaded = loads(&vec, &options.registry(Registry::new().with_generic("clinic", "Kind")))
            .unwrap();
        assert_eq!(loaded.strategy, Strategy::Pickle);
        assert_eq!(loaded.value, dict);

        // Unregistered: plain placeholder keys, still two distinct entries.
        let (ledger, options) = ledger_options();
        let loaded = loads(&vec, &options).unwrap();
        assert_eq!(loaded.strategy, Strategy::RobustRenaming);
        assert!(!ledger.is_empty());
        assert_eq!(loaded.value.count_unresolved(), 2);
        match loaded.value {
            Value::Dict(ref d) => {
                assert_eq!(d.len(), 2);
                assert!(d.keys().all(|k| matches!(*k, HashableValue::Unresolved(_))));
                assert!(d.values().any(|v| *v == Value::String("a".into())));
                assert!(d.values().any(|v| *v == Value::String("b".into())));
            }
            ref other => panic!("unexpected {}", other),
        }

        // A failing factory: Ultrarobust keeps the keys' arguments.
        let broken = FnFactory(|_: &ClassRef, _: Vec<Value>| -> crate::Result<Value> {
            Err(Error::Syntax(ErrorCode::Construction("boom".into())))
        });
        let mut registry = Registry::new();
        registry.register("clinic", "Kind", broken);
        let (_, options) = ledger_options();
        let loaded = loads(&vec, &options.registry(registry)).unwrap();
        assert_eq!(loaded.strategy, Strategy::UltraRobust);
        match loaded.value {
            Value::Dict(ref d) => {
                let args: Vec<_> = d.keys().map(|k| match *k {
                    HashableValue::Unresolved(ref u) => {
                        assert!(u.universal);
                        u.args.clone()
                    }
                    ref other => panic!("unexpected {}", other),
                }).collect();
                assert_eq!(args, vec![vec![Value::I64(1)], vec![Value::I64(2)]]);
            }
            ref other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn placeholders_as_set_items() {
        let set = Value::Set(vec![kind("old.models", 1)].into_iter().collect());
        let vec = value_to_vec(&set, SerOptions::new().extended()).unwrap();
        let (_, options) = ledger_options();
        let loaded = loads(&vec, &options.method(Method::Secondary)).unwrap();
        assert_eq!(loaded.strategy, Strategy::RobustRenaming);
        match loaded.value {
            Value::Set(ref items) => match items.iter().next() {
                Some(&HashableValue::Unresolved(ref u)) =>
                    assert_eq!(u.class, ClassRef::new("old.models", "Kind")),
                other => panic!("unexpected {:?}", other),
            },
            ref other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn unresolved_serde_view() {
        let vec = instance_stream("old.models", "Patient", vec![]);
        let (_, options) = ledger_options();
        let options = options.method(Method::Secondary);
        // Plain placeholders are empty maps.
        let loaded = loads(&vec, &options).unwrap();
        let map: BTreeMap<String, String> = loaded.deserialize().unwrap();
        assert!(map.is_empty());
    }
}

mod save_tests {
    use std::fs;
    use std::collections::BTreeMap;
    use rand::thread_rng;
    use quickcheck::{QuickCheck, StdGen};
    use super::{arby, ledger_options};
    use crate::{dumps, load, loads, save, save_serialize, serialize, zsave};
    use crate::{ClassRef, Container, DiePolicy, Error, ErrorCode, FailureLedger, HashableValue,
                LoadOptions, Method, SaveMethod, SaveOptions, Strategy, Unresolved, Value};
    use serde_derive::{Serialize, Deserialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u32,
        tags: Vec<String>,
    }

    fn sample() -> Value {
        Value::Dict(treemap!(
            HashableValue::String("rows".into()) =>
                Value::List((0..50).map(Value::I64).collect()),
            HashableValue::String("label".into()) => Value::String("ward 3".into())))
    }

    fn sentinel(ledger: &FailureLedger) -> Value {
        let class = ClassRef::new("clinic.models", "Patient");
        let record = ledger.record(&class, &"no class registered as 'clinic.models.Patient'");
        let mut sentinel = Unresolved::new(class, &record, true, ledger.clone());
        sentinel.set("name", Value::String("Ann".into()));
        Value::List(vec![Value::Unresolved(Box::new(sentinel)), Value::I64(7)])
    }

    #[test]
    fn roundtrip_every_container() {
        let dir = tempfile::tempdir().unwrap();
        for &compression in &[Container::Gzip, Container::Zstd, Container::None] {
            let path = dir.path().join(format!("sample.{}", compression));
            let options = SaveOptions::new().compression(compression);
            let saved = save(Some(path.as_path()), &sample(), &options).unwrap();
            assert_eq!(saved.path(), Some(path.as_path()));
            let (_, load_options) = ledger_options();
            let loaded = load(&path, &load_options).unwrap();
            assert_eq!(loaded.strategy, Strategy::Pickle);
            assert_eq!(loaded.value, sample());
        }
    }

    #[test]
    fn qc_roundtrip_every_container() {
        fn roundtrip(original: Value) {
            let options = LoadOptions::new().method(Method::Auto).die_on_failure(true)
                                            .registry(arby::registry())
                                            .ledger(FailureLedger::new());
            for &compression in &[Container::Gzip, Container::Zstd, Container::None] {
                let save_options = SaveOptions::new().compression(compression).allow_empty(true);
                let bytes = dumps(&original, &save_options).unwrap();
                assert_eq!(loads(&bytes, &options).unwrap().value, original);
            }
        }
        QuickCheck::new().gen(StdGen::new(thread_rng(), 10))
                         .tests(300)
                         .quickcheck(roundtrip as fn(_));
    }

    #[test]
    fn failed_save_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.obj");
        save(Some(path.as_path()), &Value::I64(42), &SaveOptions::new()).unwrap();
        let before = fs::read(&path).unwrap();

        let ledger = FailureLedger::new();
        let strict = SaveOptions::new().die(DiePolicy::Strict);
        match save(Some(path.as_path()), &sentinel(&ledger), &strict) {
            Err(Error::Syntax(ErrorCode::Unpicklable(_))) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs::read(&path).unwrap(), before);

        let fresh = dir.path().join("fresh.obj");
        assert!(save(Some(fresh.as_path()), &sentinel(&ledger), &strict).is_err());
        assert!(!fresh.exists());
    }

    #[test]
    fn detection_ignores_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.pkl.gz");
        zsave(Some(path.as_path()), &sample(), &SaveOptions::new()).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"\x28\xb5\x2f\xfd");
        let (_, options) = ledger_options();
        assert_eq!(load(&path, &options).unwrap().value, sample());
    }

    #[test]
    fn in_memory_saves() {
        let saved = save(None, &sample(), &SaveOptions::new()).unwrap();
        assert!(saved.path().is_none());
        let bytes = saved.into_bytes().unwrap();
        assert_eq!(&bytes[..2], b"\x1f\x8b");
        let (_, options) = ledger_options();
        assert_eq!(loads(&bytes, &options).unwrap().value, sample());

        let bytes = dumps(&sample(), &SaveOptions::new().compression(Container::None)).unwrap();
        assert_eq!(&bytes[..2], b"\x80\x03");
        assert_eq!(loads(&bytes, &options).unwrap().value, sample());
    }

    #[test]
    fn compression_levels() {
        let gzip = SaveOptions::new().compression_level(12);
        assert!(matches!(dumps(&sample(), &gzip), Err(Error::Config(_))));
        let zstd = gzip.compression(Container::Zstd);
        assert!(dumps(&sample(), &zstd).is_ok());
        let zstd = zstd.compression_level(-8);
        assert!(matches!(dumps(&sample(), &zstd), Err(Error::Config(_))));
        assert!(dumps(&sample(), &SaveOptions::new().compression_level(0)).is_ok());
    }

    #[test]
    fn empty_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.obj");
        assert!(matches!(save(Some(path.as_path()), &Value::None, &SaveOptions::new()),
                         Err(Error::EmptyObject)));
        assert!(!path.exists());
        assert!(matches!(dumps(&Value::None, &SaveOptions::new()), Err(Error::EmptyObject)));
        assert!(save(Some(path.as_path()), &Value::None, &SaveOptions::new().allow_empty(true)).is_ok());
        assert!(dumps(&Value::None, &SaveOptions::new().die(DiePolicy::Never)).is_ok());
        let (_, options) = ledger_options();
        assert_eq!(load(&path, &options).unwrap().value, Value::None);
    }

    #[test]
    fn primary_falls_back_to_extended() {
        let ledger = FailureLedger::new();
        let value = sentinel(&ledger);
        let mut sink = Vec::new();
        let used = serialize(&value, SaveMethod::Primary, DiePolicy::Fallback, &mut sink).unwrap();
        assert_eq!(used, SaveMethod::Secondary);
        assert_eq!(&sink[..2], b"\x80\x04");

        let mut sink = Vec::new();
        match serialize(&value, SaveMethod::Primary, DiePolicy::Strict, &mut sink) {
            Err(Error::Syntax(ErrorCode::Unpicklable(_))) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(sink.is_empty());

        let mut sink = Vec::new();
        let used = serialize(&sample(), SaveMethod::Primary, DiePolicy::Strict, &mut sink).unwrap();
        assert_eq!(used, SaveMethod::Primary);
        assert_eq!(&sink[..2], b"\x80\x03");
    }

    #[test]
    fn placeholders_survive_and_heal() {
        let ledger = FailureLedger::new();
        let bytes = dumps(&sentinel(&ledger), &SaveOptions::new()).unwrap();

        // Still unknown: a universal placeholder with its state.
        let (reload_ledger, options) = ledger_options();
        let loaded = loads(&bytes, &options.clone().method(Method::Secondary)).unwrap();
        assert_eq!(loaded.strategy, Strategy::Extended);
        assert_eq!(reload_ledger.len(), 1);
        match loaded.value {
            Value::List(ref items) => match items[0] {
                Value::Unresolved(ref u) => {
                    assert!(u.universal);
                    assert_eq!(u.class, ClassRef::new("clinic.models", "Patient"));
                    assert_eq!(u.get("name"), Some(&Value::String("Ann".into())));
                }
                ref other => panic!("unexpected {}", other),
            },
            ref other => panic!("unexpected {}", other),
        }
        // The primary method reaches it through the permissive strategies.
        let loaded = loads(&bytes, &options).unwrap();
        assert_eq!(loaded.strategy, Strategy::RobustRenaming);
        assert_eq!(loaded.value.count_unresolved(), 1);

        // Registered now: a real instance.
        let options = options.method(Method::Auto).registry(arby::registry());
        let loaded = loads(&bytes, &options).unwrap();
        assert_eq!(loaded.strategy, Strategy::Extended);
        assert!(!loaded.is_degraded());
        match loaded.value {
            Value::List(ref items) => match items[0] {
                Value::Object(ref obj) => {
                    assert_eq!(obj.class.name, "Patient");
                    assert_eq!(obj.attr("name"), Some(&Value::String("Ann".into())));
                }
                ref other => panic!("unexpected {}", other),
            },
            ref other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn serializable_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.obj");
        let record = Record { id: 4, tags: vec!["icu".into()] };
        save_serialize(Some(path.as_path()), &record, &SaveOptions::new()).unwrap();
        let (_, options) = ledger_options();
        assert_eq!(load(&path, &options).unwrap().deserialize::<Record>().unwrap(), record);
    }

    #[test]
    fn option_parsing() {
        assert_eq!("dill".parse::<SaveMethod>().unwrap(), SaveMethod::Secondary);
        assert!(matches!("json".parse::<SaveMethod>(), Err(Error::Config(_))));
        assert_eq!("never".parse::<DiePolicy>().unwrap(), DiePolicy::Never);
        assert_eq!(DiePolicy::from(true), DiePolicy::Strict);
    }
}

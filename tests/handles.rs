// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Repeated saves and loads, failing or not, must not leak file handles.

#![cfg(target_os = "linux")]

use std::fs;
use robust_pickle::{
    dumps, load, save, ClassRef, Container, DiePolicy, Error, FailureLedger, HashableValue,
    Instance, LoadOptions, SaveOptions, Value,
};

fn open_handles() -> usize {
    fs::read_dir("/proc/self/fd").map(|entries| entries.count()).unwrap_or(0)
}

#[test]
fn no_leaked_handles() {
    let dir = tempfile::tempdir().unwrap();
    let value = Value::List(vec![Value::I64(1), Value::String("two".into()), Value::F64(3.0)]);
    let load_options = LoadOptions::new().ledger(FailureLedger::new());

    // Instances with keyword arguments cannot be saved with the primary format.
    let mut instance = Instance::new(ClassRef::new("clinic.models", "Ward"));
    instance.kwargs.insert(HashableValue::String("floor".into()), Value::I64(2));
    let kwargs_only = Value::Object(Box::new(instance));
    let strict = SaveOptions::new().die(DiePolicy::Strict);

    let garbage = dir.path().join("garbage.obj");
    fs::write(&garbage, b"this is not a pickle at all").unwrap();
    let truncated = dir.path().join("truncated.obj");
    let gzipped = dumps(&value, &SaveOptions::new()).unwrap();
    fs::write(&truncated, &gzipped[..gzipped.len() / 2]).unwrap();
    let missing = dir.path().join("missing.obj");

    // Warm up, so lazily opened handles are already counted.
    let path = dir.path().join("warmup.pkl");
    save(Some(path.as_path()), &value, &SaveOptions::new()).unwrap();
    load(path.as_path(), &load_options).unwrap();
    let _ = load(garbage.as_path(), &load_options);

    let before = open_handles();
    for i in 0..20 {
        let container = [Container::Gzip, Container::Zstd, Container::None][i % 3];
        let path = dir.path().join(format!("round{}.pkl", i));
        let options = SaveOptions::new().compression(container);
        save(Some(path.as_path()), &value, &options).unwrap();
        let loaded = load(path.as_path(), &load_options).unwrap();
        assert_eq!(loaded.value, value);

        assert!(matches!(load(garbage.as_path(), &load_options),
                         Err(Error::StrategyExhausted(_))));
        assert!(load(truncated.as_path(), &load_options).is_err());
        assert!(save(Some(path.as_path()), &kwargs_only, &strict.clone().compression(container))
                .is_err());
        assert!(matches!(load(missing.as_path(), &load_options), Err(Error::NotFound(_))));
    }
    assert_eq!(open_handles(), before);
}

#![no_main]
use libfuzzer_sys::fuzz_target;
use robust_pickle::{FailureLedger, LoadOptions, Method};

fuzz_target!(|data: &[u8]| {
    let _ = robust_pickle::value_from_slice(data, Default::default());
    let options = LoadOptions::new().method(Method::Auto).ledger(FailureLedger::new());
    let _ = robust_pickle::loads(data, &options);
});

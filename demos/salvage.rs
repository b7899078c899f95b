// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Salvage what can be read from a pickle file.
//!
//! ```text
//! salvage inspect FILE [METHOD]
//! salvage transcode FILE OUTPUT [gzip|zstd|none]
//! salvage to_json FILE
//! ```
//!
//! Set `RUST_LOG=debug` to see which strategies were tried.

use std::path::Path;
use std::process;
use robust_pickle::{load, save, Container, LoadOptions, Method, SaveMethod, SaveOptions};

fn usage() -> ! {
    eprintln!("usage: salvage inspect FILE [pickle|dill|auto]");
    eprintln!("       salvage transcode FILE OUTPUT [gzip|zstd|none]");
    eprintln!("       salvage to_json FILE");
    process::exit(2);
}

fn run(args: &[String]) -> robust_pickle::Result<()> {
    match args {
        [cmd, file, rest @ ..] if cmd == "inspect" => {
            let method = match rest.first() {
                Some(m) => m.parse::<Method>()?,
                None => Method::Auto,
            };
            let loaded = load(Path::new(file), &LoadOptions::new().method(method))?;
            println!("strategy: {}", loaded.strategy);
            for (strategy, err) in &loaded.errors {
                println!("  {} failed: {}", strategy, err);
            }
            println!("unresolved instances: {}", loaded.value.count_unresolved());
            if loaded.is_degraded() {
                print!("{}", loaded.report(true));
            }
            println!("{}", loaded.value);
        }
        [cmd, file, output, rest @ ..] if cmd == "transcode" => {
            let container = match rest.first() {
                Some(c) => c.parse::<Container>()?,
                None => Container::Gzip,
            };
            let loaded = load(Path::new(file), &LoadOptions::new().method(Method::Auto))?;
            // Placeholders only survive in the extended format.
            let method = if loaded.is_degraded() { SaveMethod::Secondary } else { SaveMethod::Primary };
            let options = SaveOptions::new().method(method).compression(container);
            let saved = save(Some(Path::new(output)), &loaded.value, &options)?;
            if let Some(path) = saved.path() {
                println!("wrote {} ({}, {})", path.display(), method, container);
            }
        }
        [cmd, file] if cmd == "to_json" => {
            let loaded = load(Path::new(file), &LoadOptions::new().method(Method::Auto))?;
            match serde_json::to_string_pretty(&loaded.value) {
                Ok(json) => println!("{}", json),
                Err(err) => eprintln!("cannot render as JSON: {}", err),
            }
        }
        _ => usage(),
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(err) = run(&args) {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}

// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Saving values to files or byte streams.

use std::fmt;
use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::ser::Serialize;
use log::{debug, info};

use crate::error::{Error, Result};
use crate::ser::{value_to_vec, SerOptions};
use crate::source::Container;
use crate::value::{to_value, Value};

const DEFAULT_LEVEL: i32 = 5;

/// Which format to write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveMethod {
    /// Standard pickle (protocol 3), falling back to the extended format.
    Primary,
    /// The extended format (protocol 4), which can also write placeholders.
    Secondary,
}

impl Default for SaveMethod {
    fn default() -> SaveMethod {
        SaveMethod::Primary
    }
}

impl FromStr for SaveMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<SaveMethod> {
        match s {
            "pickle" | "primary" => Ok(SaveMethod::Primary),
            "dill" | "secondary" => Ok(SaveMethod::Secondary),
            _ => Err(Error::Config(format!(
                "invalid save method '{}': must be 'pickle' or 'dill'", s))),
        }
    }
}

impl fmt::Display for SaveMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            SaveMethod::Primary => "pickle",
            SaveMethod::Secondary => "extended",
        })
    }
}

/// What to do when the primary format cannot write a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiePolicy {
    /// Fall back to the extended format.
    Fallback,
    /// Fail.
    Strict,
    /// Fall back, and also allow saving `None`.
    Never,
}

impl Default for DiePolicy {
    fn default() -> DiePolicy {
        DiePolicy::Fallback
    }
}

impl From<bool> for DiePolicy {
    fn from(die: bool) -> DiePolicy {
        if die { DiePolicy::Strict } else { DiePolicy::Fallback }
    }
}

impl FromStr for DiePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<DiePolicy> {
        match s {
            "false" | "fallback" => Ok(DiePolicy::Fallback),
            "true" | "strict" => Ok(DiePolicy::Strict),
            "never" => Ok(DiePolicy::Never),
            _ => Err(Error::Config(format!(
                "invalid die policy '{}': must be 'true', 'false' or 'never'", s))),
        }
    }
}

/// Options for saving.
#[derive(Clone, Debug, Default)]
pub struct SaveOptions {
    method: SaveMethod,
    compression: Container,
    level: Option<i32>,
    die: DiePolicy,
    allow_empty: bool,
}

impl SaveOptions {
    /// Construct with default options: primary format with fallback, gzip
    /// at level 5, `None` rejected.
    pub fn new() -> Self {
        SaveOptions::default()
    }

    pub fn method(mut self, method: SaveMethod) -> Self {
        self.method = method;
        self
    }

    pub fn compression(mut self, compression: Container) -> Self {
        self.compression = compression;
        self
    }

    /// Compression level: 0 to 9 for gzip, -7 to 22 for zstandard.
    pub fn compression_level(mut self, level: i32) -> Self {
        self.level = Some(level);
        self
    }

    pub fn die(mut self, die: DiePolicy) -> Self {
        self.die = die;
        self
    }

    /// Allow saving `None`.
    pub fn allow_empty(mut self, allow_empty: bool) -> Self {
        self.allow_empty = allow_empty;
        self
    }

    fn checked_level(&self) -> Result<i32> {
        let level = self.level.unwrap_or(DEFAULT_LEVEL);
        let range = match self.compression {
            Container::Gzip => 0..=9,
            Container::Zstd => -7..=22,
            Container::None => return Ok(level),
        };
        if range.contains(&level) {
            Ok(level)
        } else {
            Err(Error::Config(format!("invalid {} compression level {}: must be {} to {}",
                                      self.compression, level, range.start(), range.end())))
        }
    }
}

/// Where a save went.
#[derive(Debug)]
pub enum Saved {
    Path(PathBuf),
    /// Everything written, positioned at the start.
    Stream(Cursor<Vec<u8>>),
}

impl Saved {
    pub fn path(&self) -> Option<&Path> {
        match *self {
            Saved::Path(ref path) => Some(path),
            Saved::Stream(_) => None,
        }
    }

    /// The written bytes, for in-memory saves.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Saved::Path(_) => None,
            Saved::Stream(cursor) => Some(cursor.into_inner()),
        }
    }
}

/// Write the pickled value into `sink`.
///
/// The value is encoded in memory first; if the primary format cannot
/// express it, nothing has been written when the extended format is tried
/// (unless `die` is [`DiePolicy::Strict`], which returns the error).  The
/// sink is neither opened nor closed here.  Returns the format used.
pub fn serialize<W: Write + ?Sized>(value: &Value, method: SaveMethod, die: DiePolicy,
                                    sink: &mut W) -> Result<SaveMethod> {
    let extended = SerOptions::new().extended();
    let (bytes, used) = match method {
        SaveMethod::Secondary => (value_to_vec(value, extended)?, SaveMethod::Secondary),
        SaveMethod::Primary => match value_to_vec(value, SerOptions::new()) {
            Ok(bytes) => (bytes, SaveMethod::Primary),
            Err(err) if die == DiePolicy::Strict => return Err(err),
            Err(err) => {
                debug!("saving as pickle failed ({}), using the extended format", err);
                (value_to_vec(value, extended)?, SaveMethod::Secondary)
            }
        },
    };
    sink.write_all(&bytes)?;
    Ok(used)
}

/// Validate the options and the value before anything is opened.
fn check(value: &Value, options: &SaveOptions) -> Result<i32> {
    let level = options.checked_level()?;
    if let Value::None = *value {
        if !options.allow_empty && options.die != DiePolicy::Never {
            return Err(Error::EmptyObject);
        }
    }
    Ok(level)
}

fn write_container<W: Write>(sink: W, value: &Value, options: &SaveOptions,
                             level: i32) -> Result<W> {
    let (method, die) = (options.method, options.die);
    match options.compression {
        Container::Gzip => {
            let mut encoder = GzEncoder::new(sink, Compression::new(level as u32));
            serialize(value, method, die, &mut encoder)?;
            Ok(encoder.finish()?)
        }
        Container::Zstd => {
            let mut encoder = zstd::Encoder::new(sink, level)?;
            serialize(value, method, die, &mut encoder)?;
            Ok(encoder.finish()?)
        }
        Container::None => {
            let mut sink = sink;
            serialize(value, method, die, &mut sink)?;
            Ok(sink)
        }
    }
}

/// Save a value to `path`, or to memory if no path is given.
///
/// Parent directories are created as needed.  The file is only opened once
/// the compressed payload is complete, so a failing save leaves an existing
/// file untouched.  Saving `None` fails with [`Error::EmptyObject`] unless
/// empty objects are allowed or the die policy is [`DiePolicy::Never`].
pub fn save(path: Option<&Path>, value: &Value, options: &SaveOptions) -> Result<Saved> {
    let bytes = dumps(value, options)?;
    match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let mut file = File::create(path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            info!("object saved to {}", path.display());
            Ok(Saved::Path(path.to_path_buf()))
        }
        None => {
            debug!("object saved to a {} byte stream", bytes.len());
            Ok(Saved::Stream(Cursor::new(bytes)))
        }
    }
}

/// Save with zstandard compression.
pub fn zsave(path: Option<&Path>, value: &Value, options: &SaveOptions) -> Result<Saved> {
    save(path, value, &options.clone().compression(Container::Zstd))
}

/// Save a value to an in-memory byte string, readable with `loads`.
pub fn dumps(value: &Value, options: &SaveOptions) -> Result<Vec<u8>> {
    let level = check(value, options)?;
    write_container(Vec::new(), value, options, level)
}

/// Save any serializable Rust value.
pub fn save_serialize<T: Serialize + ?Sized>(path: Option<&Path>, value: &T,
                                             options: &SaveOptions) -> Result<Saved> {
    save(path, &to_value(value)?, options)
}

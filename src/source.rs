// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Turning a path or an in-memory buffer into the raw pickle bytes.
//!
//! The container is detected by trying decoders in a fixed order (gzip,
//! zstandard, raw bytes, text), never by extension or magic bytes.  Each
//! attempt opens and closes its own file handle.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use flate2::read::GzDecoder;
use log::debug;

use crate::error::{Error, Result};

/// Compression container around a pickle stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Container {
    Gzip,
    Zstd,
    None,
}

impl Container {
    pub fn name(self) -> &'static str {
        match self {
            Container::Gzip => "gzip",
            Container::Zstd => "zstd",
            Container::None => "none",
        }
    }
}

impl Default for Container {
    fn default() -> Container {
        Container::Gzip
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Container {
    type Err = Error;

    fn from_str(s: &str) -> Result<Container> {
        match s {
            "gz" | "gzip" => Ok(Container::Gzip),
            "zst" | "zstd" | "zstandard" => Ok(Container::Zstd),
            "none" => Ok(Container::None),
            _ => Err(Error::Config(format!(
                "invalid compression format '{}': must be 'gzip', 'zstd', or 'none'", s))),
        }
    }
}

/// One step of the container detection cascade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Gzip,
    Zstd,
    Raw,
    Text,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Step::Gzip => "gzip",
            Step::Zstd => "zstd",
            Step::Raw => "raw",
            Step::Text => "text",
        })
    }
}

/// Where to read a pickle from.
pub enum Source<'a> {
    Path(PathBuf),
    Bytes(&'a [u8]),
    Reader(&'a mut dyn Read),
}

impl<'a> Source<'a> {
    pub fn reader<R: Read>(rdr: &'a mut R) -> Source<'a> {
        Source::Reader(rdr)
    }

    fn describe(&self) -> String {
        match *self {
            Source::Path(ref path) => path.display().to_string(),
            Source::Bytes(b) => format!("<{} bytes in memory>", b.len()),
            Source::Reader(_) => "<stream>".into(),
        }
    }
}

impl<'a> fmt::Debug for Source<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Source({})", self.describe())
    }
}

impl<'a> From<&'a Path> for Source<'a> {
    fn from(path: &'a Path) -> Source<'a> {
        Source::Path(path.to_path_buf())
    }
}

impl<'a> From<&'a PathBuf> for Source<'a> {
    fn from(path: &'a PathBuf) -> Source<'a> {
        Source::Path(path.clone())
    }
}

impl<'a> From<PathBuf> for Source<'a> {
    fn from(path: PathBuf) -> Source<'a> {
        Source::Path(path)
    }
}

impl<'a> From<&'a str> for Source<'a> {
    fn from(path: &'a str) -> Source<'a> {
        Source::Path(PathBuf::from(path))
    }
}

impl<'a> From<&'a [u8]> for Source<'a> {
    fn from(bytes: &'a [u8]) -> Source<'a> {
        Source::Bytes(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for Source<'a> {
    fn from(bytes: &'a Vec<u8>) -> Source<'a> {
        Source::Bytes(bytes)
    }
}

/// Gzip failures that mean "this is not (valid) gzip", as opposed to
/// failures to access the file at all.
fn is_format_error(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::InvalidInput |
                         io::ErrorKind::InvalidData |
                         io::ErrorKind::UnexpectedEof)
}

fn not_found(path: &Path, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::NotFound(path.to_path_buf())
    } else {
        Error::Io(err)
    }
}

fn gunzip<R: Read>(rdr: R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    GzDecoder::new(rdr).read_to_end(&mut buf)?;
    Ok(buf)
}

fn unzstd<R: Read>(rdr: R) -> io::Result<Vec<u8>> {
    zstd::stream::decode_all(rdr)
}

/// Read the decoded bytes from a source.
///
/// A missing file fails immediately with [`Error::NotFound`].  Otherwise,
/// gzip is tried first; only if the data is not gzip are zstandard, raw
/// bytes and text tried in turn.  If everything fails, the error lists all
/// attempts.
pub fn read_source(source: Source) -> Result<Vec<u8>> {
    match source {
        Source::Path(path) => read_path(&path),
        Source::Bytes(bytes) => read_bytes(bytes, "<bytes>"),
        Source::Reader(rdr) => {
            let mut buf = Vec::new();
            rdr.read_to_end(&mut buf)?;
            read_bytes(&buf, "<stream>")
        }
    }
}

fn read_path(path: &Path) -> Result<Vec<u8>> {
    let mut attempts = Vec::with_capacity(4);

    let gz_err = match File::open(path).map_err(|e| not_found(path, e)).and_then(|f| {
        gunzip(f).map_err(Error::Io)
    }) {
        Ok(buf) => return Ok(buf),
        Err(Error::Io(err)) if is_format_error(&err) => err,
        Err(err) => return Err(err),
    };
    debug!("{}: not gzip ({})", path.display(), gz_err);
    attempts.push((Step::Gzip, gz_err.to_string()));

    match File::open(path).and_then(unzstd) {
        Ok(buf) => return Ok(buf),
        Err(err) => {
            debug!("{}: not zstd ({})", path.display(), err);
            attempts.push((Step::Zstd, err.to_string()));
        }
    }
    match fs::read(path) {
        Ok(buf) => return Ok(buf),
        Err(err) => attempts.push((Step::Raw, err.to_string())),
    }
    match fs::read_to_string(path) {
        Ok(text) => return Ok(text.into_bytes()),
        Err(err) => attempts.push((Step::Text, err.to_string())),
    }
    Err(Error::ContainerDecode { source: path.display().to_string(), attempts })
}

fn read_bytes(bytes: &[u8], name: &str) -> Result<Vec<u8>> {
    let mut attempts = Vec::with_capacity(2);
    match gunzip(bytes) {
        Ok(buf) => return Ok(buf),
        Err(err) if is_format_error(&err) => {
            debug!("{}: not gzip ({})", name, err);
            attempts.push((Step::Gzip, err.to_string()));
        }
        Err(err) => return Err(Error::Io(err)),
    }
    match unzstd(bytes) {
        Ok(buf) => Ok(buf),
        Err(err) => {
            debug!("{}: not zstd ({})", name, err);
            // Raw bytes are always readable from memory.
            Ok(bytes.to_vec())
        }
    }
}

/// Describe a source for error messages and logs.
pub fn describe(source: &Source) -> String {
    source.describe()
}

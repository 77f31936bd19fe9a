use core::fmt;
use std::io;

use runtime::ClassFileError;

/// Failures the writer can report before the walk begins. Capacity and
/// invariant violations discovered mid-emission abort the process instead —
/// the image is a transaction of size one and a partial file is useless.
#[derive(Debug)]
pub enum Error {
    /// Class-file magic mismatch, unknown constant-pool tag, or other
    /// malformed classpath input.
    MalformedClass(ClassFileError),
    /// A field code outside the recognized set.
    UnsupportedLayout(String),
    /// Heap or code buffer would overflow.
    Capacity(String),
    /// A type-map or numbering invariant failed to hold.
    Invariant(String),
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedClass(e) => write!(f, "malformed class: {e}"),
            Error::UnsupportedLayout(s) => write!(f, "unsupported layout: {s}"),
            Error::Capacity(s) => write!(f, "capacity exceeded: {s}"),
            Error::Invariant(s) => write!(f, "invariant violation: {s}"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ClassFileError> for Error {
    fn from(e: ClassFileError) -> Self {
        match e {
            ClassFileError::UnsupportedFieldCode(c) => {
                Error::UnsupportedLayout(format!("field descriptor '{c}'"))
            }
            other => Error::MalformedClass(other),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

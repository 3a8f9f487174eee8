//! Error types shared by the file and segment front ends and both backends.

use std::io;

use thiserror::Error;

use crate::flags::{Protection, Sharing};
use crate::key::SegmentId;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use self::unix::*;

#[cfg(windows)]
mod win;
#[cfg(windows)]
pub(crate) use self::win::*;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A closed handle was used, or an argument is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Mutation attempted through a mapping opened without write access.
    #[error("mapping is not writable")]
    NotWritable,

    /// The region ran out before the buffer was filled. `read` bytes were
    /// still copied into the front of the buffer.
    #[error("end of region after {read} bytes")]
    EndOfRegion { read: usize },

    /// The region boundary was reached; `written` bytes landed.
    #[error("short write: only {written} bytes written")]
    ShortWrite { written: usize },

    #[error("offset {0} is outside the region")]
    InvalidOffset(u64),

    #[error("position {0} is outside the region")]
    InvalidPosition(i128),

    #[error("protection {protection:?} is not supported with {sharing:?} sharing on this platform")]
    UnsupportedProtection { protection: Protection, sharing: Sharing },

    #[error("{call} failed: {source}")]
    MappingFailed { call: &'static str, source: io::Error },

    #[error("{call}: no segment with id {id}")]
    SegmentNotFound { call: &'static str, id: SegmentId },

    #[error("{call}: segment id {id} is already in use")]
    KeyInUse { call: &'static str, id: SegmentId },

    #[error("no free segment id after {attempts} attempts")]
    KeyExhausted { attempts: u32 },

    /// Only produced internally so that a second close can be told apart
    /// from a real failure and swallowed.
    #[error("already closed")]
    AlreadyClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn mapping_failed<E: Into<io::Error>>(call: &'static str, code: E) -> Self {
        Error::MappingFailed { call, source: code.into() }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::Io(err) => return err,
            Error::MappingFailed { call, source } => {
                return io::Error::new(source.kind(), format!("{}: {}", call, source))
            }
            Error::InvalidArgument(_)
            | Error::InvalidOffset(_)
            | Error::InvalidPosition(_)
            | Error::UnsupportedProtection { .. } => io::ErrorKind::InvalidInput,
            Error::NotWritable => io::ErrorKind::PermissionDenied,
            Error::EndOfRegion { .. } => io::ErrorKind::UnexpectedEof,
            Error::ShortWrite { .. } => io::ErrorKind::WriteZero,
            Error::SegmentNotFound { .. } => io::ErrorKind::NotFound,
            Error::KeyInUse { .. } | Error::KeyExhausted { .. } => io::ErrorKind::AlreadyExists,
            Error::AlreadyClosed => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[test]
fn test_into_io_error_kind() {
    let err: io::Error = Error::NotWritable.into();
    assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

    let err: io::Error = Error::ShortWrite { written: 3 }.into();
    assert_eq!(err.kind(), io::ErrorKind::WriteZero);

    let err: io::Error = Error::InvalidPosition(-1).into();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    let inner = io::Error::from(io::ErrorKind::NotFound);
    let err: io::Error = Error::Io(inner).into();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
}

#[test]
fn test_mapping_failed_names_call() {
    let err = Error::mapping_failed("mmap", io::Error::from(io::ErrorKind::PermissionDenied));
    assert!(err.to_string().starts_with("mmap failed"));
    let err: io::Error = err.into();
    assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
}

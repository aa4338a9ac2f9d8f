use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The set or table has been closed; no further acquisitions are served.
    Closed,
    /// Decode failure of a stored record, typically an account leaf.
    Corrupted(String),
    /// A write targeted a segment below the active name that has not been
    /// uncompacted.
    ImmutableSegment,
    /// Invalid data or unexpected internal values.
    InvalidData(String),
    /// A segment file whose header could not be read or parsed.
    InvalidSegmentType(String),
    /// An IO error.
    Io(String),
    /// The requested key, segment, or trie root does not exist.
    NotFound,
    /// A segment file with a well-formed but unrecognized type header.
    SegmentTypeUnknown(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Closed => write!(f, "closed"),
            Error::Corrupted(msg) => write!(f, "corrupted record: {msg}"),
            Error::ImmutableSegment => write!(f, "segment is immutable"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidSegmentType(path) => write!(f, "invalid segment type: {path}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::NotFound => write!(f, "not found"),
            Error::SegmentTypeUnknown(path) => write!(f, "unknown segment type: {path}"),
        }
    }
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corrupted(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}

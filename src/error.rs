use crate::data::ParseError;
use std::{error, fmt, io, path::PathBuf};

/// Errors surfaced by the store.
#[derive(Debug)]
pub enum StatError {
    /// The retention policy could not be parsed.
    Parse(ParseError),

    /// A backing file could not be opened, sized or mapped.
    Storage { path: PathBuf, source: io::Error },

    /// The volume holding the store is below its free space threshold.
    InsufficientSpace { path: PathBuf, available: Option<u64>, required: u64 },

    /// The counter name was empty or contained illegal segments.
    InvalidName(String),
}

impl StatError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> StatError {
        StatError::Storage {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for StatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatError::Parse(e) => write!(f, "{}", e),
            StatError::Storage { path, source } => write!(f, "storage error on {}: {}", path.display(), source),
            StatError::InsufficientSpace {
                path,
                available: Some(available),
                required,
            } => write!(
                f,
                "insufficient space on {}: {} bytes free, need more than {}",
                path.display(),
                available,
                required
            ),
            StatError::InsufficientSpace {
                path,
                available: None,
                ..
            } => write!(f, "insufficient space on {}: free space unknown", path.display()),
            StatError::InvalidName(name) => write!(f, "invalid counter name '{}'", name),
        }
    }
}

impl error::Error for StatError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            StatError::Parse(e) => Some(e),
            StatError::Storage { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ParseError> for StatError {
    fn from(src: ParseError) -> StatError { StatError::Parse(src) }
}

pub(crate) fn io_error(reason: &str) -> io::Error { io::Error::new(io::ErrorKind::Other, reason) }

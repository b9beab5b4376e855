/// A raftkv error. Protocol negatives (rejected votes, failed appends, client
/// fail replies) are wire messages, not errors; Error is reserved for local
/// faults such as IO problems, malformed data, and bad input.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Invalid data, e.g. a malformed or oversized wire message.
    InvalidData(String),
    /// Invalid user input, e.g. a bad endpoint ID on the command line.
    InvalidInput(String),
    /// An IO error, e.g. a transport or channel failure.
    IO(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) | Error::InvalidInput(msg) | Error::IO(msg) => {
                write!(f, "{msg}")
            }
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A raftkv Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Allows macros to construct Err(Error) results directly.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::IO(err.to_string())
    }
}

use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

/// Which side of the known block range an address fell on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Below the first block still present (removed or never existed).
    Underflow,
    /// At or past the high address, i.e. never written.
    Overflow,
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// Checksum or format mismatch in persisted data.
    DataCorruption(String),
    BlockNotFound {
        address: u64,
        bound: Bound,
    },
    /// Recovery found no valid database root in a non-empty log.
    InvalidCipherParameters,
    TransactionAcquireTimeout(String),
    RecordTooLarge {
        length: u64,
        file_length: u64,
    },
    /// The environment refuses work after a failure it cannot reason about.
    Inoperative(String),
    TransactionFinished,
    ReadOnly,
    WrongThread,
    NestedNotFinished,
    StoreNotFound(String),
    InvalidData(String),
    InvalidInput(String),
    InvalidOperation(String),
    InvalidState(String),
    MutexPoisoned,
    Lock(io::Error),
}

impl Error {
    /// True for errors that mean persisted bytes can't be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::DataCorruption(_) | Error::BlockNotFound { .. } | Error::InvalidData(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::DataCorruption(msg) => write!(f, "Data corruption: {}", msg),
            Error::BlockNotFound { address, bound } => match bound {
                Bound::Underflow => write!(f, "Block not found: address {} is below the first block", address),
                Bound::Overflow => write!(f, "Block not found: address {} was never written", address),
            },
            Error::InvalidCipherParameters => write!(
                f,
                "No valid database root found, check cipher parameters"
            ),
            Error::TransactionAcquireTimeout(msg) => {
                write!(f, "Transaction acquire timed out: {}", msg)
            }
            Error::RecordTooLarge {
                length,
                file_length,
            } => write!(
                f,
                "Record of {} bytes does not fit in a file of {} bytes",
                length, file_length
            ),
            Error::Inoperative(reason) => write!(f, "Environment is inoperative: {}", reason),
            Error::TransactionFinished => write!(f, "Transaction is already finished"),
            Error::ReadOnly => write!(f, "Transaction is read-only"),
            Error::WrongThread => write!(
                f,
                "Transaction must be finished in the thread it was created in"
            ),
            Error::NestedNotFinished => write!(
                f,
                "Nested transaction must be finished before its wrapping transaction"
            ),
            Error::StoreNotFound(name) => write!(f, "Store not found: {}", name),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::Lock(err) => write!(f, "Lock error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) | Error::Lock(err) => Some(err),
            _ => None,
        }
    }
}

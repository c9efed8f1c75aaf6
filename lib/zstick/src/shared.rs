use std::io;

pub type LinkResult<T> = Result<T, LinkError>;

/// Errors surfaced inside the engine. `Wait` is the non-error "nothing to
/// do yet" case; everything the I/O loop cannot absorb locally is `Fatal`.
#[derive(Debug, Eq, PartialEq)]
pub enum LinkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    BadFraming,
    Timeout,
    PeerNak,
    PeerCancel,
    TransmitAckFailure,
    RetryExhausted,
    NonceCacheOverflow,
    DecryptionFailure,
    QueueOverflow,
    InternalInvariant,
    Shutdown,
    Io(io::ErrorKind),
}

impl From<io::Error> for LinkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => LinkError::Wait,
            kind => LinkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for LinkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(LinkError::Wait) => false,
            _ => true,
        }
    }
}

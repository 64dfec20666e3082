use std::io;

pub type TransportResult<T> = Result<T, TransportError>;
pub type BindingResult<T> = Result<T, BindingError>;

/// Errors surfaced by the socket layer and passed through to callers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportError {
    Unexpected,
    AlreadyConnected,
    AddressNotAvailable,
    InsufficientPrivileges,
    Disconnected,
    SystemEnvironmentError,
    Resource,
    Uninitialized,
    Busy,
    Size,
    ProtocolError,
    ApiError,
    Truncation,
}

impl From<io::Error> for TransportError {
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::AddrInUse => TransportError::AddressNotAvailable,
            io::ErrorKind::PermissionDenied => TransportError::InsufficientPrivileges,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => TransportError::Disconnected,
            io::ErrorKind::OutOfMemory => TransportError::Resource,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => TransportError::ApiError,
            _ => TransportError::SystemEnvironmentError,
        }
    }
}

/// Errors surfaced by the binding layer above the sockets.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BindingError {
    JsonLoadingFailure,
    JsonParsingFailure,
    ErrorNotOk,
    Transport(TransportError),
}

impl From<TransportError> for BindingError {
    #[inline]
    fn from(err: TransportError) -> Self {
        BindingError::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_folding() {
        let err: TransportError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(err, TransportError::AddressNotAvailable);

        let err: TransportError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, TransportError::Disconnected);

        let err: TransportError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert_eq!(err, TransportError::InsufficientPrivileges);
    }

    #[test]
    fn test_binding_error_passthrough() {
        let err: BindingError = TransportError::Disconnected.into();
        assert_eq!(err, BindingError::Transport(TransportError::Disconnected));
    }
}

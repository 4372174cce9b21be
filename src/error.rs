//! Bluegatt errors

use std::sync::Arc;

use num_enum::TryFromPrimitive;

/// The error type for Bluetooth operations
///
/// Errors are cheap to clone so that they can be carried inside [`Event`][crate::Event]s and delivered to every
/// registered handler.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    message: String,
}

impl Error {
    pub(crate) fn new(
        kind: ErrorKind,
        source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
        message: impl Into<String>,
    ) -> Self {
        Error {
            kind,
            source,
            message: message.into(),
        }
    }

    /// Creates an error with the given kind and a free-form message.
    ///
    /// Intended for [`Transport`][crate::transport::Transport] implementations reporting their own failures.
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::new(kind, None, message)
    }

    /// Creates an error with the given kind wrapping a lower level error.
    pub fn with_source(kind: ErrorKind, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::new(kind, Some(Arc::new(source)), String::new())
    }

    /// Returns the corresponding [ErrorKind] for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message for this error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the ATT error carried by this error, if it is a protocol error.
    pub fn att_error(&self) -> Option<AttError> {
        match self.kind {
            ErrorKind::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.message.is_empty(), &self.source) {
            (true, None) => write!(f, "{}", &self.kind),
            (false, None) => write!(f, "{}: {}", &self.kind, &self.message),
            (true, Some(err)) => write!(f, "{}: {}", &self.kind, err),
            (false, Some(err)) => write!(f, "{}: {} ({})", &self.kind, &self.message, err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|x| {
            let x: &(dyn std::error::Error + 'static) = &**x;
            x
        })
    }
}

/// A list of general categories of Bluetooth error.
#[non_exhaustive]
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// the Bluetooth adapter is not powered on
    AdapterUnavailable,
    /// a connection attempt to this device is already in progress
    AlreadyConnecting,
    /// the connection attempt was cancelled
    Cancelled,
    /// connection failed
    ConnectionFailed,
    /// the Bluetooth device isn't connected
    NotConnected,
    /// the characteristic does not support this operation
    PropertyNotSupported,
    /// the Bluetooth operation is unsupported
    NotSupported,
    /// not found
    NotFound,
    /// invalid parameter
    InvalidParameter,
    /// timed out
    Timeout,
    /// too many requests are queued on this connection
    Busy,
    /// the connection to the device was lost
    TransportLost,
    /// protocol error: {0}
    Protocol(AttError),
    /// an internal error has occured
    Internal,
    /// error
    Other,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            source: None,
            message: String::new(),
        }
    }
}

impl From<AttError> for Error {
    fn from(err: AttError) -> Self {
        ErrorKind::Protocol(err).into()
    }
}

/// Bluetooth Attribute Protocol error codes. See the Bluetooth Core Specification, Vol 3, Part F, §3.4.1.1
#[repr(u8)]
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
pub enum AttErrorCode {
    /// The attribute handle given was not valid on this server.
    InvalidHandle = 0x01,
    /// The attribute cannot be read.
    ReadNotPermitted = 0x02,
    /// The attribute cannot be written.
    WriteNotPermitted = 0x03,
    /// The attribute PDU was invalid.
    InvalidPdu = 0x04,
    /// The attribute requires authentication before it can be read or written.
    InsufficientAuthentication = 0x05,
    /// Attribute server does not support the request received from the client.
    RequestNotSupported = 0x06,
    /// Offset specified was past the end of the attribute.
    InvalidOffset = 0x07,
    /// The attribute requires authorization before it can be read or written.
    InsufficientAuthorization = 0x08,
    /// Too many prepare writes have been queued.
    PrepareQueueFull = 0x09,
    /// No attribute found within the given attribute handle range.
    AttributeNotFound = 0x0a,
    /// The attribute cannot be read or written using the Read Blob Request.
    AttributeNotLong = 0x0b,
    /// The Encryption Key Size used for encrypting this link is insufficient.
    InsufficientEncryptionKeySize = 0x0c,
    /// The attribute value length is invalid for the operation.
    InvalidAttributeValueLength = 0x0d,
    /// The attribute request encountered an unlikely error and could not be completed.
    UnlikelyError = 0x0e,
    /// The attribute requires encryption before it can be read or written.
    InsufficientEncryption = 0x0f,
    /// The attribute type is not a supported grouping attribute.
    UnsupportedGroupType = 0x10,
    /// Insufficient Resources to complete the request.
    InsufficientResources = 0x11,
    /// The server requests the client to rediscover the database.
    DatabaseOutOfSync = 0x12,
    /// The attribute parameter value was not allowed.
    ValueNotAllowed = 0x13,
    /// Write Request Rejected
    WriteRequestRejected = 0xfc,
    /// Client Characteristic Configuration Descriptor Improperly Configured
    CccdImproperlyConfigured = 0xfd,
    /// Procedure Already in Progress
    ProcedureAlreadyInProgress = 0xfe,
    /// Out of Range
    OutOfRange = 0xff,
}

/// Bluetooth Attribute Protocol error. See the Bluetooth Core Specification, Vol 3, Part F, §3.4.1.1
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttError {
    /// {0}
    Known(AttErrorCode),
    /// application specific error: {0}
    Application(u8),
    /// unknown error: {0}
    Reserved(u8),
}

impl AttError {
    /// The raw error code as carried in an Error Response PDU.
    pub fn code(&self) -> u8 {
        match *self {
            AttError::Known(code) => code as u8,
            AttError::Application(code) | AttError::Reserved(code) => code,
        }
    }
}

impl From<u8> for AttError {
    fn from(number: u8) -> Self {
        match AttErrorCode::try_from(number) {
            Ok(code) => AttError::Known(code),
            Err(_) => {
                if (0x80..0xa0).contains(&number) {
                    AttError::Application(number)
                } else {
                    AttError::Reserved(number)
                }
            }
        }
    }
}

impl From<AttErrorCode> for AttError {
    fn from(code: AttErrorCode) -> Self {
        AttError::Known(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn att_error_ranges() {
        assert_eq!(AttError::from(0x0a), AttError::Known(AttErrorCode::AttributeNotFound));
        assert_eq!(AttError::from(0x85), AttError::Application(0x85));
        assert_eq!(AttError::from(0x30), AttError::Reserved(0x30));
        assert_eq!(AttError::from(0xfd).code(), 0xfd);
    }

    #[test]
    fn display_includes_message() {
        let err = Error::with_message(ErrorKind::Timeout, "reading handle 0x0003");
        assert_eq!(err.to_string(), "timed out: reading handle 0x0003");

        let err = Error::from(AttError::from(0x02));
        assert_eq!(err.kind(), ErrorKind::Protocol(AttError::Known(AttErrorCode::ReadNotPermitted)));
        assert_eq!(err.att_error().map(|e| e.code()), Some(0x02));
    }
}

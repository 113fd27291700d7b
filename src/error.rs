use std::{fmt::Display, io};

/// Error returned from `usbirp` operations other than transfers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Error {
    pub(crate) kind: ErrorKind,
    pub(crate) message: &'static str,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    #[track_caller]
    pub(crate) fn log_error(self) -> Self {
        log::error!("{}", self);
        self
    }

    #[track_caller]
    pub(crate) fn log_debug(self) -> Self {
        log::debug!("{}", self);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind {
            ErrorKind::InvalidArgument => io::ErrorKind::InvalidInput,
            ErrorKind::Aborted => io::ErrorKind::Interrupted,
            ErrorKind::Busy => io::ErrorKind::Other,
            ErrorKind::Other => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// General category of error as part of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An argument was out of range, or a packet was in the wrong state for the call.
    InvalidArgument,

    /// The queue is aborting and does not accept new packets until the abort finishes.
    Aborted,

    /// The packet is already queued or being processed, or the call would
    /// wait on the queue from its own worker thread.
    Busy,

    /// Uncategorized error.
    Other,
}

/// Error decoding a descriptor from its wire format.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// The buffer or the `bLength` field is too short, or otherwise inconsistent.
    Malformed(&'static str),

    /// The `bDescriptorType` field is not a descriptor type this crate decodes.
    UnknownDescriptorType(u8),

    /// The `bDevCapabilityType` field of a device capability descriptor is unknown.
    UnknownCapabilityType(u8),
}

impl Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorError::Malformed(msg) => write!(f, "malformed descriptor: {msg}"),
            DescriptorError::UnknownDescriptorType(t) => {
                write!(f, "unknown descriptor type 0x{t:02X}")
            }
            DescriptorError::UnknownCapabilityType(t) => {
                write!(f, "unknown device capability type 0x{t:02X}")
            }
        }
    }
}

impl std::error::Error for DescriptorError {}

impl From<DescriptorError> for io::Error {
    fn from(value: DescriptorError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, value)
    }
}

/// Transfer error, attached to a request packet when it completes unsuccessfully.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Endpoint in a STALL condition.
    ///
    /// For control requests, the device does not support the request.
    Stall,

    /// The transfer did not complete within the transfer timeout.
    Timeout,

    /// Device disconnected.
    Disconnected,

    /// Hardware issue or protocol violation.
    Fault,

    /// The transport does not support this kind of transfer.
    Unsupported,

    /// The device returned fewer bytes than requested and the packet does not
    /// accept short packets.
    ShortPacket {
        /// Bytes requested.
        requested: usize,

        /// Bytes actually transferred.
        actual: usize,
    },

    /// Uncategorized transport failure, with the raw negative status code.
    Transport(i32),
}

// Negative errno values as reported by usbfs-style transports.
const STATUS_ENODEV: i32 = -19;
const STATUS_EPIPE: i32 = -32;
const STATUS_EPROTO: i32 = -71;
const STATUS_EOVERFLOW: i32 = -75;
const STATUS_EILSEQ: i32 = -84;
const STATUS_ESHUTDOWN: i32 = -108;
const STATUS_ETIMEDOUT: i32 = -110;

impl TransferError {
    /// Translate a negative status code returned by a transport.
    ///
    /// Codes are interpreted as negated Linux `errno` values; anything not
    /// recognized is kept as [`TransferError::Transport`].
    pub fn from_status(code: i32) -> TransferError {
        match code {
            STATUS_EPIPE => TransferError::Stall,
            STATUS_ETIMEDOUT => TransferError::Timeout,
            STATUS_ENODEV | STATUS_ESHUTDOWN => TransferError::Disconnected,
            STATUS_EPROTO | STATUS_EILSEQ | STATUS_EOVERFLOW => TransferError::Fault,
            code => TransferError::Transport(code),
        }
    }
}

impl Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Stall => write!(f, "endpoint stalled"),
            TransferError::Timeout => write!(f, "transfer timed out"),
            TransferError::Disconnected => write!(f, "device disconnected"),
            TransferError::Fault => write!(f, "hardware fault or protocol violation"),
            TransferError::Unsupported => write!(f, "transfer type not supported by transport"),
            TransferError::ShortPacket { requested, actual } => write!(
                f,
                "short packet: requested {requested} bytes, transferred {actual}"
            ),
            TransferError::Transport(code) => write!(f, "transport error (status {code})"),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<TransferError> for io::Error {
    fn from(value: TransferError) -> Self {
        let kind = match value {
            TransferError::Stall => io::ErrorKind::ConnectionReset,
            TransferError::Timeout => io::ErrorKind::TimedOut,
            TransferError::Disconnected => io::ErrorKind::ConnectionAborted,
            TransferError::Fault => io::ErrorKind::Other,
            TransferError::Unsupported => io::ErrorKind::Unsupported,
            TransferError::ShortPacket { .. } => io::ErrorKind::UnexpectedEof,
            TransferError::Transport(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

/// Error for descriptor reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GetDescriptorError {
    /// Transfer error when getting the descriptor.
    Transfer(TransferError),

    /// Invalid descriptor data
    InvalidDescriptor(DescriptorError),

    /// The request could not be queued.
    Queue(Error),
}

impl Display for GetDescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GetDescriptorError::Transfer(e) => write!(f, "{}", e),
            GetDescriptorError::InvalidDescriptor(e) => write!(f, "invalid descriptor: {}", e),
            GetDescriptorError::Queue(e) => write!(f, "failed to queue request: {}", e),
        }
    }
}

impl std::error::Error for GetDescriptorError {}

impl From<TransferError> for GetDescriptorError {
    fn from(value: TransferError) -> Self {
        GetDescriptorError::Transfer(value)
    }
}

impl From<DescriptorError> for GetDescriptorError {
    fn from(value: DescriptorError) -> Self {
        GetDescriptorError::InvalidDescriptor(value)
    }
}

impl From<Error> for GetDescriptorError {
    fn from(value: Error) -> Self {
        GetDescriptorError::Queue(value)
    }
}

impl From<GetDescriptorError> for io::Error {
    fn from(value: GetDescriptorError) -> Self {
        match value {
            GetDescriptorError::Transfer(e) => e.into(),
            GetDescriptorError::InvalidDescriptor(e) => e.into(),
            GetDescriptorError::Queue(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TransferError;

    #[test]
    fn status_translation() {
        assert_eq!(TransferError::from_status(-32), TransferError::Stall);
        assert_eq!(TransferError::from_status(-110), TransferError::Timeout);
        assert_eq!(TransferError::from_status(-19), TransferError::Disconnected);
        assert_eq!(TransferError::from_status(-108), TransferError::Disconnected);
        assert_eq!(TransferError::from_status(-71), TransferError::Fault);
        assert_eq!(TransferError::from_status(-1), TransferError::Transport(-1));
    }
}

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream is not positioned at a frame boundary.
    ///
    /// The protocol has no escaping or resync marker, so this is fatal for
    /// the connection that produced it.
    #[error("stream desynchronized (expected {expected:?}, found {found:?})")]
    Desynchronized { expected: char, found: char },

    /// The frame header carries a frame-type value outside the protocol.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u64),

    /// The frame header carries a payload-kind value outside the protocol.
    #[error("unknown payload kind {0}")]
    UnknownPayloadKind(u64),

    /// A numeric header field did not parse as an unsigned decimal.
    #[error("invalid {field} field: not a decimal number")]
    InvalidNumber { field: &'static str },

    /// A string header field is not valid UTF-8.
    #[error("invalid {field} field: not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    /// A string field contains one of the separator bytes `#`, `!`, `|`.
    ///
    /// The wire format performs no escaping; such a frame would
    /// desynchronize every decoder downstream, so it is refused at encode
    /// time.
    #[error("{field} field contains a reserved separator byte")]
    SeparatorInField { field: &'static str },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The 4-byte length header is outside the accepted range.
    #[error("invalid package length {length} (accepted: {min}..={max})")]
    InvalidLength { length: i64, min: usize, max: usize },

    /// A field or size prefix runs past the end of the buffer.
    #[error("truncated input (needed {needed} bytes, {available} available)")]
    Truncated { needed: usize, available: usize },

    /// The field header carries a wire type outside the known set.
    #[error("unknown wire type {0}")]
    UnknownWireType(u8),

    /// The wire type at a tag cannot be read as the expected stamp.
    #[error("type mismatch at tag {tag}: expected {expected}, found {found}")]
    TypeMismatch {
        tag: u8,
        expected: String,
        found: String,
    },

    /// A required field is absent from its scope.
    #[error("required field at tag {0} is missing")]
    MissingField(u8),

    /// A required attribute is absent from the attribute bag.
    #[error("required attribute '{0}' is missing")]
    MissingAttribute(String),

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A collection or byte array declares a negative size.
    #[error("negative size {0}")]
    NegativeSize(i64),

    /// The envelope version is not 1, 2 or 3.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(i64),

    /// Struct, list or map nesting exceeds the decoder's limit.
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    /// Call arguments do not match the method descriptor.
    #[error("argument mismatch: {0}")]
    ArgumentMismatch(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("codec I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, CodecError>;

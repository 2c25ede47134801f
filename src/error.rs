//! Types for errors that can occur while reading or writing xdata containers.

/// An error that can occur while encoding, decoding or accessing xdata values.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error from the underlying reader or writer.
    #[error("I/O error: '{source}' while {context}")]
    Io {
        /// The original error.
        #[source]
        source: std::io::Error,
        /// What the codec was doing when the error occurred.
        context: String,
    },
    /// The stream does not begin with the xdata magic bytes.
    #[error("stream does not begin with the xdata magic bytes")]
    BadMagic,
    /// The root value of the stream is not a record.
    #[error("root value of the stream is not a record")]
    BadRoot,
    /// An unrecognized value tag, either from corruption or data written by a
    /// newer version of the format.
    #[error("unknown value tag 0x{0:02x}")]
    UnknownValueTag(u8),
    /// An unrecognized primitive tag, either from corruption or data written
    /// by a newer version of the format.
    #[error("unknown primitive tag 0x{0:02x}")]
    UnknownPrimitiveTag(u8),
    /// A reference whose offset matches no previously materialized record.
    #[error("reference to offset {0} which matches no finished record")]
    DanglingReference(i64),
    /// The stream ended in the middle of a value.
    #[error("unexpected end of stream while {0}")]
    TruncatedStream(String),
    /// No converter is registered for a type name or domain type.
    #[error("no converter registered for '{0}'")]
    NoConverter(String),
    /// The checksum policy requires a checksum but the stream carries none.
    #[error("stream carries no checksum but the policy requires one")]
    ChecksumMissing,
    /// The stored checksum does not match the stream contents.
    #[error("stored checksum does not match the stream contents")]
    ChecksumMismatch,
    /// A stored value does not have the shape the key describes.
    #[error("value under key '{key}' is a {actual}, expected {expected}")]
    TypeMismatch {
        /// The key that was read.
        key: String,
        /// The shape the key's element type expects.
        expected: &'static str,
        /// The shape actually stored in the record.
        actual: &'static str,
    },
    /// A null was stored or read through a key that forbids nulls.
    #[error("null value under non-nullable key '{0}'")]
    NullNotAllowed(String),
    /// A mandatory accessor found no value under its key.
    #[error("record has no value under mandatory key '{0}'")]
    MissingKey(String),
    /// A value cannot be represented in the wire format.
    #[error("encoding error: {0}")]
    Encode(String),
    /// The stream violates the wire format in a way no specific variant covers.
    #[error("decoding error: {0}")]
    Decode(String),
}

/// An alias for a `Result` with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new I/O [`enum@Error`] with the given `context`.
    pub fn io(source: std::io::Error, context: impl ToString) -> Self {
        Self::Io {
            source,
            context: context.to_string(),
        }
    }

    /// Creates a new encode [`enum@Error`].
    pub fn encode(message: impl ToString) -> Self {
        Self::Encode(message.to_string())
    }

    /// Creates a new decode [`enum@Error`].
    pub fn decode(message: impl ToString) -> Self {
        Self::Decode(message.to_string())
    }
}

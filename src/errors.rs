use std::fmt;

/// Errors that can surface while serving one connection.
///
/// Every variant here is the second or third kind of failure described in
/// the protocol design: a malformed request, a framing mismatch, or a
/// transient item-metadata read gone wrong. All of them are connection-fatal
/// -- there is no partial recovery, only "log it and close the socket."
#[derive(Debug)]
pub enum Error {
    /// The client closed the connection, or we could not read/write the
    /// socket at all.
    SocketError,

    /// A request line did not tokenize: empty token, bad integer, trailing
    /// garbage after the last expected field, or an unknown command verb.
    /// The label names the field that failed to parse.
    Protocol { label: &'static str },

    /// The payload body did not end in the literal CRLF the framer expects.
    MissingTerminator,

    /// An item's in-payload header (flags, etag, validate_ttl_ms) was
    /// shorter than its declared layout.
    ShortItemHeader,

    /// The cache backend reported an error other than miss/would-block.
    /// Per the protocol design this is always fatal to the whole process,
    /// not just the connection; see `cache::CacheError`.
    Fatal(crate::cache::CacheError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SocketError => write!(f, "socket error"),
            Error::Protocol { label } => write!(f, "protocol error: bad {label}"),
            Error::MissingTerminator => write!(f, "missing CRLF terminator"),
            Error::ShortItemHeader => write!(f, "short item header"),
            Error::Fatal(e) => write!(f, "fatal cache error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Error {
        Error::SocketError
    }
}

impl From<crate::cache::CacheError> for Error {
    fn from(e: crate::cache::CacheError) -> Error {
        Error::Fatal(e)
    }
}

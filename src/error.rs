use thiserror::Error;

/// Errors raised while parsing or serving ICAP traffic.
///
/// Malformed wire input and middleware failures travel the same
/// error-chain path; only [`Error::Protocol`] may carry an ICAP status
/// code for direct translation into a response.
#[derive(Error, Debug)]
pub enum Error {
    /// Network or socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unsupported wire input. Parse failures are fatal to
    /// the transaction's framing: byte offsets cannot be trusted after
    /// one, so the connection is torn down.
    #[error("protocol error: {message}")]
    Protocol {
        /// ICAP status code to answer with, when one applies.
        status: Option<u16>,
        message: String,
    },

    /// Invalid header name or value.
    #[error("header error: {0}")]
    Header(String),

    /// Failure raised by application middleware.
    #[error("handler error: {0}")]
    Handler(String),

    /// An optional collaborator (e.g. the MIME sniffer) was invoked but
    /// never configured.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(&'static str),
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            status: None,
            message: message.into(),
        }
    }

    pub fn protocol_status(status: u16, message: impl Into<String>) -> Self {
        Error::Protocol {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn header(message: impl Into<String>) -> Self {
        Error::Header(message.into())
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Error::Handler(message.into())
    }

    /// The ICAP status code this error translates to, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Protocol { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Handler(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Handler(message.to_string())
    }
}

/// Result alias used throughout the crate.
pub type IcapResult<T> = Result<T, Error>;

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a reply could not be framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingFault {
    /// The overall reply deadline elapsed.
    Deadline(Duration),
    /// Bytes stopped arriving before a terminator was seen.
    NoTerminator,
}

impl std::fmt::Display for FramingFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingFault::Deadline(d) => write!(f, "no reply terminator within {:?}", d),
            FramingFault::NoTerminator => write!(f, "reply stalled without a terminator"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket connect, read or write failure. The session is torn down.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// The reply could not be delimited. The session is torn down.
    #[error("framing error: {0}")]
    Framing(FramingFault),

    #[error("malformed {kind} reply: {reason}")]
    Decode { kind: &'static str, reason: String },

    /// A client-side guard refused to send the command.
    #[error("refused by client-side guard: {0}")]
    Precondition(String),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { after: Duration, what: String },

    /// The device answered, but not with a success reply.
    #[error("device rejected `{command}`: {reply}")]
    Rejected { command: String, reply: String },

    #[error("login failed after {0} attempt(s)")]
    LoginFailed(u32),

    #[error("{0} is not equipped on this printer")]
    NotEquipped(&'static str),

    /// A capability-gated command was issued before the product query.
    #[error("product capabilities have not been queried")]
    CapabilitiesUnknown,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad thumbnail data: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    pub(crate) fn decode(kind: &'static str, reason: impl Into<String>) -> Self {
        Error::Decode {
            kind,
            reason: reason.into(),
        }
    }

    /// Faults after which the socket is gone and the next command must reconnect.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Framing(_))
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::Precondition(_))
    }
}

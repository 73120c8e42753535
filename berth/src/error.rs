use berth_wire::WireError;

/// Everything a session call can fail with.
///
/// The enum is clonable so one background failure can be re-raised on every
/// waiter that was parked on the same readiness latch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Local setup is unusable: missing keys, no default location, broken
    /// DNS record, unknown image. Raised synchronously at construction.
    #[error("configuration: {0}")]
    Configuration(String),

    /// The broker answered an operation with an `exception` param.
    #[error("broker exception: {0}")]
    Remote(String),

    /// The caller misused an object: operating on a destroyed handle, a path
    /// escape in `put`, a tag clash.
    #[error("{0}")]
    State(String),

    /// Ran out of a finite resource: no nodes in the offer, no free local
    /// port, readiness polling gave up.
    #[error("{0}")]
    Exhausted(String),

    /// The transport failed underneath the session.
    #[error("transport: {0}")]
    Transport(String),

    /// The session is gone: the broker kicked us or the connection closed.
    #[error("session disconnected")]
    Disconnected,
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Closed => Error::Disconnected,
            other => Error::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

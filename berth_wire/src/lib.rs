//! Wire contract for the berth protocol.
//!
//! Everything a broker-side harness must agree on with the client lives here:
//! the four-part [`Message`] framing, the command-name constants, and the
//! authenticated [`SecureTransport`] that carries the frames. The SDK crate
//! (`berth`) builds its session layer on top of these types.

pub mod commands;
mod message;
mod secure;

pub use message::{Message, NO_MORE_REPLIES};
pub use secure::{HandshakeRole, SecureTransport};

/// Errors raised by wire-level framing, the handshake, or record encryption.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The underlying stream failed.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A frame arrived that does not parse as a four-part message.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    /// A record failed authenticated decryption, or encryption failed.
    #[error("record encryption failure")]
    Crypto,
    /// The peer misbehaved during the handshake.
    #[error("handshake: {0}")]
    Handshake(&'static str),
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
}

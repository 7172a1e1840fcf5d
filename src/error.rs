use std::io;
use thiserror::Error;

/// Errors surfaced by the public API.
///
/// Malformed network input is never surfaced here - bad packets are dropped
/// and logged at the receiving end. Transient socket errors from the
/// timer-driven flush are captured per peer and returned from the *next*
/// send call on that peer.
#[derive(Debug, Error)]
pub enum RudpError {
    /// Bad command range, empty payload, or an operation on a dead or
    ///  uninitialized peer.
    #[error("invalid argument")]
    InvalidArgument,

    /// Send attempted before the connection handshake completed.
    #[error("not connected")]
    NotConnected,

    /// An operation needed a destination address that was never provided
    ///  or could not be resolved.
    #[error("address required")]
    AddressRequired,

    /// Bind/sendto/recvfrom failure, carrying the platform error.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// Timer registration failed.
    #[error("cancelled")]
    Cancelled,
}

//! Socket-layer errors.
use std::io;

use thiserror::Error;

/// An error occuring in the socket layer.
#[derive(Error, Debug)]
pub enum Error {
    /// The listening address could not be bound.
    #[error("failed to bind {0}: {1}")]
    Bind(std::net::SocketAddr, #[source] io::Error),

    /// A connection attempt to a peer failed.
    #[error("failed to dial {0}: {1}")]
    Dial(std::net::SocketAddr, #[source] io::Error),

    /// The peer closed the connection (EOF) while we expected a frame.
    #[error("connection closed by peer")]
    Closed,

    /// Any other I/O error while reading or writing a frame.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

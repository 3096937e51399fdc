pub mod buffer;
pub mod dispatch;
pub mod dns;
pub mod fakedns;
pub mod freedom;
pub mod handler;
pub mod io;
pub mod log;
pub mod net;
pub mod pipe;
pub mod protocol;
pub mod router;
pub mod session;
pub mod sniff;
pub mod transport;

use tokio::io::{AsyncRead, AsyncWrite};

/// A transport-level byte stream. Anything duplex and thread-movable
/// qualifies: a TCP socket, a TLS session, an in-memory duplex for tests.
pub trait AbstractStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> AbstractStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
